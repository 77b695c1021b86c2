//! 文件系统模块
//!
//! 本层只包含块缓存；inode、目录与日志由上层文件系统实现，通过 [`Bcache`] 访问磁盘块。

mod bio;

pub use bio::{Bcache, Buf, BufData, BufId};
