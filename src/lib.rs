//! xv6 内核的资源管理层
//!
//! 包括按 CPU 划分的物理页分配器和分桶的磁盘块缓存，以及二者依赖的锁原语。
//! 硬件与调度相关的部分通过 [`Cpu`]、[`Scheduler`]、[`BlockDevice`] 三个接口注入，
//! 本层不持有任何全局状态。

#![cfg_attr(not(test), no_std)]
#![warn(rust_2018_idioms)]

extern crate alloc;

pub mod consts;
pub mod driver;
pub mod error;
pub mod fs;
pub mod mm;
pub mod process;
pub mod sleeplock;
pub mod spinlock;

#[cfg(test)]
mod testing;

pub use driver::BlockDevice;
pub use error::{KernelError, Result};
pub use fs::{Bcache, Buf, BufData, BufId};
pub use mm::{Addr, Kmem, PhysAddr};
pub use process::{Cpu, Scheduler};
