//! 以页号相连的单向空闲链表
//!
//! 链接不嵌在空闲页内部，而是保存在与页面一一对应的链接表中：
//! `links[i]` 是第 `i` 页在链表中的后继。链接表对所有 CPU 共享，
//! 但某一页的链接只会被持有它所在链表锁的执行流修改。

use core::sync::atomic::{AtomicUsize, Ordering};

/// 链表结束
pub const NIL: usize = usize::MAX;

/// 该页已被分配，不在任何空闲链表上
pub const ALLOCATED: usize = usize::MAX - 1;

/// 单个 CPU 的空闲链表头
pub struct FreeList {
    head: usize,
    len: usize,
}

impl FreeList {
    pub const fn new() -> Self {
        Self { head: NIL, len: 0 }
    }

    /// 将第 `page` 页插入链表头部
    ///
    /// 调用者必须已经拥有该页（`links[page]` 不再指向任何链表）。
    pub fn push(&mut self, links: &[AtomicUsize], page: usize) {
        links[page].store(self.head, Ordering::Relaxed);
        self.head = page;
        self.len += 1;
    }

    /// 从链表头部弹出一页，并把它标记为已分配
    pub fn pop(&mut self, links: &[AtomicUsize]) -> Option<usize> {
        if self.is_empty() {
            return None;
        }
        let page = self.head;
        self.head = links[page].swap(ALLOCATED, Ordering::Relaxed);
        self.len -= 1;
        Some(page)
    }

    pub fn is_empty(&self) -> bool {
        self.head == NIL
    }

    pub fn len(&self) -> usize {
        self.len
    }
}
