//! 内核常量
//!
//! 这些值在编译期确定，运行期不可调整。

/// 系统中的 CPU（硬件线程）数量，每个 CPU 拥有一条独立的空闲页链表
pub const NCPU: usize = 8;

/// 页大小（字节）
pub const PGSIZE: usize = 4096;

/// 页内偏移的位数
pub const PGSHIFT: usize = 12;

/// kalloc 分配出的页面填充的垃圾值，用于暴露未初始化读
pub const ALLOC_JUNK: u8 = 5;

/// kfree 回收的页面填充的垃圾值，用于暴露悬垂引用
pub const FREE_JUNK: u8 = 1;

pub mod fs {
    /// 磁盘块大小（字节）
    pub const BSIZE: usize = 1024;

    /// 缓冲区缓存的哈希桶数量
    pub const NBUCKET: usize = 13;

    /// 每个哈希桶中的缓冲区槽位数量
    pub const NBUF_PER_BUCKET: usize = 3;

    /// 缓冲区总数
    pub const NBUF: usize = NBUCKET * NBUF_PER_BUCKET;
}
