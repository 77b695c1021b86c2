//! 内存管理模块

pub use addr::{Addr, PhysAddr};
pub use kalloc::Kmem;

mod addr;
mod kalloc;
mod list;
