//! 错误类型
//!
//! 这里只包含调用者可以恢复的错误。违反不变量的情况（非法地址、
//! 未持锁写回等）直接 panic，不会以错误值的形式返回。

use core::{error, fmt};

pub type Result<T, E = KernelError> = core::result::Result<T, E>;

/// 资源管理层可能返回的错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// 所有 CPU 的空闲页链表均为空
    OutOfMemory,
    /// 目标哈希桶中没有引用计数为 0 的槽位
    BucketFull { bucket: usize },
    /// 启动时提供的物理内存区间非法
    BadMemoryRange { start: usize, end: usize },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => f.write_str("out of physical memory"),
            Self::BucketFull { bucket } => {
                write!(f, "no usable buffer in bucket {}", bucket)
            }
            Self::BadMemoryRange { start, end } => {
                write!(f, "bad memory range [{:#x}, {:#x})", start, end)
            }
        }
    }
}

impl error::Error for KernelError {}
