//! 进程相关的外部协作者
//!
//! 调度与进程管理不属于本层。这里只声明资源管理层需要调度器提供的能力：
//! 当前执行流的身份、在某个等待通道上睡眠，以及唤醒该通道上的睡眠者。

pub use cpu::Cpu;

mod cpu;

use crate::spinlock::SpinLockGuard;

/// 调度器接口，由 [`SleepLock`](crate::sleeplock::SleepLock) 与
/// [`Bcache`](crate::fs::Bcache) 使用。
///
/// 调度器运行在某个 CPU 上，因此同时提供 [`Cpu`] 的关中断能力，
/// 持有睡眠锁内部的自旋锁和缓存桶锁时都要借助它关中断。
pub trait Scheduler: Cpu {
    /// 当前执行流（进程/内核线程）的标识，用于判断睡眠锁的持有者
    fn my_pid(&self) -> usize;

    /// 在 `channel` 上睡眠。
    ///
    /// 调用时中断已经关闭（`guard` 对应的自旋锁在 `push_off` 之后获取）。
    /// 实现必须在释放 `guard` 之前登记睡眠状态，保证释放 `guard` 之后、
    /// 真正挂起之前发生的 [`wakeup`](Scheduler::wakeup) 不会丢失。
    /// 返回时 `guard` 已经被释放，关中断嵌套深度与调用前相同，
    /// 调用者需要重新加锁并检查条件。
    fn sleep(&self, channel: usize, guard: SpinLockGuard<'_, ()>);

    /// 唤醒所有在 `channel` 上睡眠的执行流
    fn wakeup(&self, channel: usize);
}
