//! 处理器身份与中断开关
//!
//! 资源管理层不直接读取 `tp` 寄存器或 `sstatus`，而是通过 [`Cpu`] 向平台询问
//! 当前运行在哪个硬件线程上。

/// 平台提供的处理器接口。
///
/// `push_off` / `pop_off` 与 xv6 中的同名函数语义一致：可嵌套地关闭中断（从而禁止抢占），
/// 只有最外层的 `pop_off` 才会恢复原先的中断状态。
pub trait Cpu: Sync {
    /// 返回当前硬件线程的编号，取值范围为 `0..NCPU`。
    ///
    /// 只有在 `push_off` 与 `pop_off` 之间读取才是稳定的：
    /// 一旦允许抢占，线程随时可能被迁移到别的 CPU 上。
    fn cpu_id(&self) -> usize;

    /// 关闭中断，嵌套计数加一
    fn push_off(&self);

    /// 嵌套计数减一，计数归零时恢复 `push_off` 之前的中断状态
    fn pop_off(&self);
}
