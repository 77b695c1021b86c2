//! 睡眠锁模块
//! 提供基于进程休眠/唤醒机制的同步原语，适用于可能长时间持有的锁。
//!
//! 当锁被占用时，尝试获取锁的进程会进入休眠状态，避免忙等待。

use core::cell::{Cell, UnsafeCell};
use core::ops::{Deref, DerefMut, Drop};

use crate::process::Scheduler;
use crate::spinlock::SpinLock;

/// 睡眠锁结构，提供阻塞式同步机制
///
/// 与自旋锁不同，当锁被占用时，尝试获取的进程会进入休眠状态，
/// 直到锁被释放后被唤醒。这避免了忙等待，适用于可能长时间持有的锁。
///
/// 锁本身不保存调度器，加锁时由调用者传入；守卫会记住同一个调度器，
/// 以便在释放时唤醒等待者。
///
/// # 字段说明
/// - `lock`: 内部自旋锁，保护`locked`与`pid`的访问
/// - `locked`: 表示锁是否已被占用
/// - `pid`: 持有者的标识，用于 `holding` 检查
/// - `name`: 锁的标识名称，用于调试
/// - `data`: 被保护的数据，通过`UnsafeCell`实现内部可变性
pub struct SleepLock<T: ?Sized> {
    lock: SpinLock<()>,
    locked: Cell<bool>,
    pid: Cell<usize>,
    name: &'static str,
    data: UnsafeCell<T>,
}

// 为SleepLock实现Sync，允许跨线程共享（要求T是Send）
// `locked` 与 `pid` 只在持有内部自旋锁时读写
unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    /// 创建一个新的睡眠锁实例
    ///
    /// # 参数
    /// - `data`: 需要被保护的数据
    /// - `name`: 锁的标识名称
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: SpinLock::new((), "sleeplock"),
            locked: Cell::new(false),
            pid: Cell::new(0),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// 获取睡眠锁（可能阻塞进程）
    ///
    /// # 流程解释
    /// 1. 关中断，获取内部自旋锁保护临界区
    /// 2. 检查`locked`状态：
    ///   - 如果已锁定：调用`sleep()`让当前进程休眠，醒来后重新加锁再检查
    ///   - 如果未锁定：设置`locked=true`、记录持有者并返回守卫
    /// 3. 释放内部自旋锁（因已设置locked状态），恢复中断
    ///
    /// 没有超时也没有取消：只有当前持有者释放锁，等待者才会继续。
    pub fn lock<'a>(&'a self, sched: &'a dyn Scheduler) -> SleepLockGuard<'a, T> {
        sched.push_off();
        let mut guard = self.lock.lock();

        while self.locked.get() {
            sched.sleep(self.channel(), guard);
            guard = self.lock.lock();
        }

        self.locked.set(true);
        self.pid.set(sched.my_pid());
        drop(guard);
        sched.pop_off();

        SleepLockGuard {
            lock: self,
            sched,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// 当前执行流是否持有该锁
    pub fn holding(&self, sched: &dyn Scheduler) -> bool {
        sched.push_off();
        let guard = self.lock.lock();
        let r = self.locked.get() && self.pid.get() == sched.my_pid();
        drop(guard);
        sched.pop_off();
        r
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 释放锁（内部方法，由守卫的Drop调用）
    ///
    /// 标记锁为可用，并唤醒在`locked`地址上休眠的进程
    fn unlock(&self, sched: &dyn Scheduler) {
        sched.push_off();
        let guard = self.lock.lock();
        self.locked.set(false);
        self.pid.set(0);
        sched.wakeup(self.channel());
        drop(guard);
        sched.pop_off();
    }

    /// 睡眠/唤醒使用的通道：`locked` 字段的地址
    fn channel(&self) -> usize {
        self.locked.as_ptr() as usize
    }
}

/// 睡眠锁守卫，提供对受保护数据的访问
///
/// 当守卫存在时，表示锁已被持有。
/// 守卫离开作用域时自动释放锁，确保锁的释放。
pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
    sched: &'a dyn Scheduler,
    data: &'a mut T,
}

impl<'a, T: ?Sized> SleepLockGuard<'a, T> {
    /// 当前执行流是否仍是该锁的持有者。
    ///
    /// 守卫被移交给另一个执行流之后，该检查返回 `false`。
    pub fn holding(&self) -> bool {
        self.lock.holding(self.sched)
    }
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;
    /// 解引用获取数据的不可变引用
    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    /// 解引用获取数据的可变引用
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    /// 当守卫离开作用域时自动释放锁
    fn drop(&mut self) {
        self.lock.unlock(self.sched);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{noff, CondvarScheduler};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn holding_tracks_owner() {
        let sched = CondvarScheduler::new();
        let lock = SleepLock::new(0u32, "holding");
        assert!(!lock.holding(&sched));
        let guard = lock.lock(&sched);
        assert!(guard.holding());
        assert!(lock.holding(&sched));
        drop(guard);
        assert!(!lock.holding(&sched));
        assert_eq!(lock.name(), "holding");
    }

    #[test]
    fn interrupts_restored_after_each_call() {
        let sched = CondvarScheduler::new();
        let lock = SleepLock::new((), "noff");
        let guard = lock.lock(&sched);
        assert_eq!(noff(), 0);
        assert!(guard.holding());
        assert_eq!(noff(), 0);
        drop(guard);
        assert_eq!(noff(), 0);
    }

    #[test]
    fn contended_lock_waits_for_release() {
        let sched = Arc::new(CondvarScheduler::new());
        let lock = Arc::new(SleepLock::new(0u32, "contended"));
        let released = Arc::new(AtomicBool::new(false));

        let mut guard = lock.lock(&*sched);
        *guard = 7;

        let waiter = {
            let (sched, lock, released) =
                (Arc::clone(&sched), Arc::clone(&lock), Arc::clone(&released));
            thread::spawn(move || {
                let guard = lock.lock(&*sched);
                assert!(released.load(Ordering::SeqCst));
                assert_eq!(noff(), 0);
                let v = *guard;
                v
            })
        };

        thread::sleep(Duration::from_millis(50));
        released.store(true, Ordering::SeqCst);
        drop(guard);

        assert_eq!(waiter.join().unwrap(), 7);
    }

    #[test]
    fn guard_moved_to_another_thread_is_not_holding() {
        let sched = Arc::new(CondvarScheduler::new());
        let lock = Arc::new(SleepLock::new((), "moved"));
        let guard = lock.lock(&*sched);
        let held_elsewhere = thread::scope(|s| s.spawn(move || guard.holding()).join().unwrap());
        assert!(!held_elsewhere);
    }
}
