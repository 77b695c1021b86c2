//! 物理页分配器，每个 CPU 一条空闲链表
//!
//! 所有可用物理页在启动时被平均分配到 `NCPU` 条空闲链表上，每条链表有自己的锁。
//! 分配时优先使用当前 CPU 的链表；为空时依次向后面的 CPU 借页，
//! 任意时刻最多持有一把链表锁。释放总是归还到当前 CPU 的链表。

use alloc::boxed::Box;
use alloc::vec::Vec;
use array_macro::array;

use core::cell::UnsafeCell;
use core::ops::Range;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::consts::{ALLOC_JUNK, FREE_JUNK, NCPU, PGSIZE};
use crate::error::{KernelError, Result};
use crate::process::Cpu;
use crate::spinlock::SpinLock;
use super::addr::{Addr, PhysAddr};
use super::list::{FreeList, ALLOCATED, NIL};

/// 一页物理内存
#[repr(C, align(4096))]
struct Frame(UnsafeCell<[u8; PGSIZE]>);

// 页面内容只由拥有该页的执行流访问：要么是分配器（页在空闲链表上或正被回收），
// 要么是 kalloc 的调用者
unsafe impl Sync for Frame {}

impl Frame {
    fn new() -> Self {
        Self(UnsafeCell::new([0; PGSIZE]))
    }
}

/// 物理页分配器。
///
/// 在启动阶段通过 [`Kmem::new`] 构造一次，之后以共享引用交给需要分配页面的子系统。
///
/// # 字段说明
/// - `cpu`: 平台提供的处理器接口，用于确定当前 CPU；
/// - `base` / `end`: 受管理的物理地址区间 `[base, end)`，均按页对齐；
/// - `frames`: 页面本身，第 `i` 项对应地址 `base + i * PGSIZE`；
/// - `links`: 空闲链表的链接表，见 [`super::list`]；
/// - `lists`: 每个 CPU 一条空闲链表，各自由一把自旋锁保护。
pub struct Kmem<C: Cpu> {
    cpu: C,
    base: PhysAddr,
    end: PhysAddr,
    frames: Box<[Frame]>,
    links: Box<[AtomicUsize]>,
    lists: [SpinLock<FreeList>; NCPU],
}

impl<C: Cpu> Kmem<C> {
    /// 接管物理内存区间 `range`，并把其中所有完整的页分配到各 CPU 的空闲链表上。
    ///
    /// # 流程解释
    /// 1. 将起始地址向上取整到页边界，只管理完整落在 `range` 内的页；
    /// 2. 为每一页建立页面与链接项；
    /// 3. 把页面分成 `NCPU` 段连续区间，前 `npages % NCPU` 个 CPU 各多分一页，
    ///    每页在入链前填充垃圾值。
    ///
    /// 构造时持有独占引用，初始化链表不需要加锁。
    ///
    /// # 返回值
    /// - `Ok(Kmem)`：初始化完成；
    /// - `Err(KernelError::BadMemoryRange)`：`range.end < range.start`，
    ///   或起始地址向上取整会越过地址空间顶端。
    pub fn new(cpu: C, range: Range<usize>) -> Result<Self> {
        if range.end < range.start || range.start.checked_add(PGSIZE - 1).is_none() {
            return Err(KernelError::BadMemoryRange { start: range.start, end: range.end });
        }
        let mut base = PhysAddr::from_raw(range.start);
        base.pg_round_up();
        let npages = range.end.saturating_sub(base.as_usize()) / PGSIZE;
        let end = PhysAddr::from_raw(base.as_usize() + npages * PGSIZE);

        let mut kmem = Self {
            cpu,
            base,
            end,
            frames: (0..npages).map(|_| Frame::new()).collect::<Vec<_>>().into_boxed_slice(),
            links: (0..npages).map(|_| AtomicUsize::new(ALLOCATED)).collect::<Vec<_>>().into_boxed_slice(),
            lists: array![_ => SpinLock::new(FreeList::new(), "kmem"); NCPU],
        };
        kmem.freerange();

        log::info!(
            "kmem: {} pages in [{:#x}, {:#x}) across {} cpus",
            npages,
            base.as_usize(),
            end.as_usize(),
            NCPU
        );
        Ok(kmem)
    }

    fn freerange(&mut self) {
        let npages = self.frames.len();
        let (chunk, extra) = (npages / NCPU, npages % NCPU);
        let mut next = 0;
        for (id, list) in self.lists.iter_mut().enumerate() {
            let count = chunk + usize::from(id < extra);
            let list = list.get_mut();
            // 倒序压入，使每条链表按地址升序弹出
            for page in (next..next + count).rev() {
                self.frames[page].0.get_mut().fill(FREE_JUNK);
                list.push(&self.links, page);
            }
            #[cfg(feature = "verbose_init_info")]
            log::debug!(
                "kmem: cpu {} owns {} pages from {:#x}",
                id,
                count,
                self.base.as_usize() + next * PGSIZE
            );
            next += count;
        }
    }

    /// 分配一页物理内存。
    ///
    /// # 流程解释
    /// 1. 关中断读取当前 CPU 编号；
    /// 2. 从当前 CPU 开始，依次尝试每个 CPU 的空闲链表，每次只持有一把锁，
    ///    遇到第一个非空链表即停止；
    /// 3. 成功时将整页填充为 `ALLOC_JUNK` 后返回。
    ///
    /// # 返回值
    /// - `Ok(PhysAddr)`：页对齐的物理地址，调用者获得该页的所有权；
    /// - `Err(KernelError::OutOfMemory)`：所有链表均为空。
    pub fn kalloc(&self) -> Result<PhysAddr> {
        let id = self.cpu_id();
        for i in 0..NCPU {
            let owner = (id + i) % NCPU;
            let page = self.with_list(owner, |list| list.pop(&self.links));
            if let Some(page) = page {
                if owner != id {
                    log::trace!("kalloc: cpu {} took page {} from cpu {}", id, page, owner);
                }
                unsafe { self.frame_mut(page).fill(ALLOC_JUNK) };
                return Ok(self.page_addr(page));
            }
        }

        #[cfg(feature = "kernel_warning")]
        log::warn!("kalloc: out of memory on cpu {}", id);
        Err(KernelError::OutOfMemory)
    }

    /// 回收一页物理内存到当前 CPU 的空闲链表。
    ///
    /// 页面归还给执行 `kfree` 的 CPU，而不是当初分配它的 CPU。
    ///
    /// # Panics
    /// - `pa` 未按页对齐，或不在受管理的区间内；
    /// - `pa` 当前并未被分配（重复释放）。
    pub fn kfree(&self, pa: PhysAddr) {
        let page = match self.page_index(pa) {
            Some(page) => page,
            None => panic!("kfree: {:?} not a managed page", pa),
        };
        if self.links[page]
            .compare_exchange(ALLOCATED, NIL, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            panic!("kfree: {:?} double free", pa);
        }

        // 填充垃圾值以暴露悬垂引用
        unsafe { self.frame_mut(page).fill(FREE_JUNK) };

        let id = self.cpu_id();
        self.with_list(id, |list| list.push(&self.links, page));
    }

    /// 访问一页已分配的物理内存。
    ///
    /// # 安全性
    /// 调用者必须拥有该页（由 `kalloc` 返回且尚未 `kfree`），
    /// 并保证同一时刻只存在一个对它的引用。
    ///
    /// # Panics
    /// `pa` 不是受管理的页地址。
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn page_mut(&self, pa: PhysAddr) -> &mut [u8; PGSIZE] {
        match self.page_index(pa) {
            Some(page) => self.frame_mut(page),
            None => panic!("page_mut: {:?} not a managed page", pa),
        }
    }

    /// 所有 CPU 上的空闲页总数。
    ///
    /// 逐个加锁统计，结果只是某一时刻的近似值。
    pub fn nfree(&self) -> usize {
        (0..NCPU).map(|id| self.nfree_on(id)).sum()
    }

    /// 第 `id` 个 CPU 空闲链表上的页数
    pub fn nfree_on(&self, id: usize) -> usize {
        self.with_list(id, |list| list.len())
    }

    pub fn base(&self) -> PhysAddr {
        self.base
    }

    pub fn end(&self) -> PhysAddr {
        self.end
    }

    /// 受管理的页总数
    pub fn npages(&self) -> usize {
        self.frames.len()
    }

    /// 关中断期间读取 CPU 编号，防止读取过程中被迁移
    fn cpu_id(&self) -> usize {
        self.cpu.push_off();
        let id = self.cpu.cpu_id();
        self.cpu.pop_off();
        if id >= NCPU {
            panic!("kmem: cpu id {} out of range", id);
        }
        id
    }

    /// 在关中断的状态下持有第 `id` 条链表的锁并执行 `f`
    fn with_list<R>(&self, id: usize, f: impl FnOnce(&mut FreeList) -> R) -> R {
        self.cpu.push_off();
        let r = f(&mut self.lists[id].lock());
        self.cpu.pop_off();
        r
    }

    fn page_index(&self, pa: PhysAddr) -> Option<usize> {
        if !pa.is_page_aligned() || pa < self.base || pa >= self.end {
            return None;
        }
        Some((pa.as_usize() - self.base.as_usize()) / PGSIZE)
    }

    fn page_addr(&self, page: usize) -> PhysAddr {
        PhysAddr::from_raw(self.base.as_usize() + page * PGSIZE)
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn frame_mut(&self, page: usize) -> &mut [u8; PGSIZE] {
        &mut *self.frames[page].0.get()
    }
}
