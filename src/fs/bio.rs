//! 缓存层
//!
//! 磁盘块的内存缓存。缓冲区按块号哈希到 `NBUCKET` 个桶中，每个桶固定有
//! `NBUF_PER_BUCKET` 个槽位，由一把桶锁（自旋锁）保护槽位的设备号、块号、
//! 引用计数和时间戳；每个槽位的数据另有一把睡眠锁，保证同一时刻只有一个执行流
//! 读写该块的内容。
//!
//! 使用方式：
//! * 通过 `bread` 获取某个磁盘块的缓冲区；
//! * 修改数据后调用 `bwrite` 写回磁盘；
//! * 用完后调用 `brelse`（或直接丢弃 `Buf`）；
//! * 释放之后不要再使用该缓冲区。
//!
//! 桶锁永远不会在等待睡眠锁时持有：先在桶锁下更新元数据，放开桶锁，再去拿睡眠锁。

use array_macro::array;

use core::fmt;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[cfg(feature = "verbose_init_info")]
use crate::consts::fs::NBUF;
use crate::consts::fs::{BSIZE, NBUCKET, NBUF_PER_BUCKET};
use crate::driver::BlockDevice;
use crate::error::{KernelError, Result};
use crate::process::Scheduler;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::SpinLock;

/// 缓冲区缓存（Buffer Cache）。
///
/// `Bcache` 提供了一个固定大小的缓冲区池，用于缓存磁盘块数据，
/// 以减少重复的磁盘访问，同时也是多个进程访问同一磁盘块时的同步点。
///
/// 池被划分为若干哈希桶，不同桶之间互不争用；桶内用逻辑时钟实现 LRU 替换。
/// 桶满时不会跨桶借用槽位。
///
/// 在内核启动时构造一次，之后以共享引用交给文件系统使用。
pub struct Bcache<D: BlockDevice, S: Scheduler> {
    buckets: [Bucket; NBUCKET],

    /// 逻辑时钟，每次 `bget` 前进一格。从 1 开始，时间戳为 0 的槽位从未被使用过。
    ticks: AtomicU64,

    disk: D,

    sched: S,
}

impl<D: BlockDevice, S: Scheduler> Bcache<D, S> {
    /// 创建缓冲区缓存，初始化每个桶锁与每个槽位的睡眠锁。
    ///
    /// 所有槽位初始均未绑定磁盘块，引用计数为 0，内容无效。
    pub fn new(disk: D, sched: S) -> Self {
        log::info!(
            "bcache: {} buckets x {} bufs of {} bytes",
            NBUCKET,
            NBUF_PER_BUCKET,
            BSIZE
        );
        #[cfg(feature = "verbose_init_info")]
        log::debug!("bcache: {} bufs in total, bucket = blockno % {}", NBUF, NBUCKET);
        Self {
            buckets: array![_ => Bucket::new(); NBUCKET],
            ticks: AtomicU64::new(1),
            disk,
            sched,
        }
    }

    /// 块号到桶的映射。不考虑设备号，不同设备上块号同余的块共享一个桶。
    pub fn hash(blockno: u32) -> usize {
        blockno as usize % NBUCKET
    }

    /// 查找缓存块，若未缓存则回收本桶中最久未使用的空闲槽位。
    /// 两种情况下都返回已持有睡眠锁的缓冲区。
    ///
    /// # 流程解释
    /// 1. 获取目标桶的桶锁；
    /// 2. 命中：引用计数加一并刷新时间戳；
    /// 3. 未命中：在引用计数为 0 的槽位中选时间戳最小者（相同则取下标最小者），
    ///    重新绑定到 `(dev, blockno)`，标记内容无效，引用计数置为 1；
    /// 4. 放开桶锁之后再等待该槽位的睡眠锁。
    ///
    /// # 返回值
    /// - `Ok(Buf)`：持有内容锁的缓冲区；
    /// - `Err(KernelError::BucketFull)`：本桶所有槽位都在使用中。
    pub fn try_bget(&self, dev: u32, blockno: u32) -> Result<Buf<'_, D, S>> {
        let bucket = Self::hash(blockno);
        let slot = self.with_bucket(bucket, |ctrl| {
            let now = self.ticks.fetch_add(1, Ordering::Relaxed);

            if let Some(slot) = ctrl.iter().position(|c| c.holds(dev, blockno)) {
                let c = &mut ctrl[slot];
                c.refcnt += 1;
                c.timestamp = now;
                return Some(slot);
            }

            let slot = lru_victim(&ctrl[..])?;
            ctrl[slot].rebind(dev, blockno, now);
            self.buckets[bucket].bufs[slot].valid.store(false, Ordering::Relaxed);
            Some(slot)
        });

        match slot {
            Some(slot) => Ok(self.lock_buf(BufId { bucket, slot, dev, blockno })),
            None => {
                #[cfg(feature = "kernel_warning")]
                log::warn!("bget: bucket {} full for block ({}, {})", bucket, dev, blockno);
                Err(KernelError::BucketFull { bucket })
            }
        }
    }

    /// 与 [`try_bget`](Self::try_bget) 相同，但桶满时 panic。
    ///
    /// 桶容量是硬上限，文件系统的正常使用不会同时占住同一个桶的全部槽位。
    pub fn bget(&self, dev: u32, blockno: u32) -> Buf<'_, D, S> {
        match self.try_bget(dev, blockno) {
            Ok(buf) => buf,
            Err(e) => panic!("bget: {}", e),
        }
    }

    /// 返回持有内容锁、且内容与磁盘一致的缓冲区
    pub fn bread(&self, dev: u32, blockno: u32) -> Result<Buf<'_, D, S>, D::Error> {
        let mut buf = self.bget(dev, blockno);
        buf.read()?;
        Ok(buf)
    }

    /// 增加引用计数，使该缓冲区在调用者不持有内容锁时也不会被回收。
    ///
    /// 只需要桶锁。典型用法是日志层在事务提交前钉住被修改的块。
    ///
    /// # Panics
    /// 该槽位已不再绑定 `id` 对应的块，或引用计数为 0。
    pub fn bpin(&self, id: BufId) {
        self.with_bucket(id.bucket, |ctrl| {
            let c = &mut ctrl[id.slot];
            if !c.holds(id.dev, id.blockno) || c.refcnt == 0 {
                panic!("bpin: stale {:?}", id);
            }
            c.refcnt += 1;
        })
    }

    /// 撤销一次 [`bpin`](Self::bpin)
    ///
    /// # Panics
    /// 该槽位已不再绑定 `id` 对应的块，或引用计数为 0。
    pub fn bunpin(&self, id: BufId) {
        self.with_bucket(id.bucket, |ctrl| {
            let c = &mut ctrl[id.slot];
            if !c.holds(id.dev, id.blockno) || c.refcnt == 0 {
                panic!("bunpin: stale {:?}", id);
            }
            c.refcnt -= 1;
        })
    }

    pub fn disk(&self) -> &D {
        &self.disk
    }

    fn lock_buf(&self, id: BufId) -> Buf<'_, D, S> {
        let data = self.inner(id).data.lock(&self.sched);
        Buf {
            cache: self,
            id,
            data: ManuallyDrop::new(data),
        }
    }

    /// 内容锁已经放开之后，在桶锁下减少引用计数。
    /// 槽位的位置不变，最近使用情况只记录在时间戳里。
    fn brelse(&self, id: BufId) {
        self.with_bucket(id.bucket, |ctrl| {
            let c = &mut ctrl[id.slot];
            if c.refcnt == 0 {
                panic!("brelse: {:?} not referenced", id);
            }
            c.refcnt -= 1;
        })
    }

    /// 在关中断的状态下持有第 `bucket` 个桶锁并执行 `f`
    fn with_bucket<R>(
        &self,
        bucket: usize,
        f: impl FnOnce(&mut [BufCtrl; NBUF_PER_BUCKET]) -> R,
    ) -> R {
        self.sched.push_off();
        let r = f(&mut self.buckets[bucket].ctrl.lock());
        self.sched.pop_off();
        r
    }

    fn inner(&self, id: BufId) -> &BufInner {
        &self.buckets[id.bucket].bufs[id.slot]
    }
}

/// 在引用计数为 0 的槽位中选择时间戳最小者，相同时取下标最小者
fn lru_victim(ctrl: &[BufCtrl]) -> Option<usize> {
    ctrl.iter()
        .enumerate()
        .filter(|(_, c)| c.refcnt == 0)
        .min_by_key(|&(i, c)| (c.timestamp, i))
        .map(|(i, _)| i)
}

/// 缓冲区在缓存中的位置及其绑定的块，可以在不持有内容锁时用于
/// [`Bcache::bpin`] / [`Bcache::bunpin`]。
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BufId {
    bucket: usize,
    slot: usize,
    dev: u32,
    blockno: u32,
}

impl BufId {
    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn blockno(&self) -> u32 {
        self.blockno
    }
}

impl fmt::Debug for BufId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "buf[{}][{}] ({}, {})",
            self.bucket, self.slot, self.dev, self.blockno
        )
    }
}

/// 持有内容锁的缓冲区。
///
/// 丢弃 `Buf` 即释放：先放开内容锁，再在桶锁下减少引用计数。
/// 释放后槽位内容仍然保留，之后对同一块的访问可以直接命中。
pub struct Buf<'a, D: BlockDevice, S: Scheduler> {
    cache: &'a Bcache<D, S>,

    id: BufId,

    /// 睡眠锁守卫，在 `drop` 中先于引用计数释放
    data: ManuallyDrop<SleepLockGuard<'a, BufData>>,
}

impl<'a, D: BlockDevice, S: Scheduler> Buf<'a, D, S> {
    /// 返回与磁盘一致的块内容。
    ///
    /// 内容无效时同步地从磁盘读入并标记为有效；已经有效时不会访问磁盘。
    /// 磁盘错误原样返回，内容保持无效。
    ///
    /// # Panics
    /// 当前执行流不持有该缓冲区的内容锁。
    pub fn read(&mut self) -> Result<&BufData, D::Error> {
        if !self.data.holding() {
            panic!("bread: {:?} not holding", self.id);
        }
        let cache = self.cache;
        let inner = cache.inner(self.id);
        if !inner.valid.load(Ordering::Relaxed) {
            cache.disk.rw(self.id.dev, self.id.blockno, &mut self.data, false)?;
            inner.valid.store(true, Ordering::Relaxed);
        }
        Ok(self.data())
    }

    /// 把当前内容同步写回磁盘。
    ///
    /// 写成功后内容与磁盘一致，有效位为真。不改变锁状态与引用计数。
    ///
    /// # Panics
    /// 当前执行流不持有该缓冲区的内容锁（例如 `Buf` 被移交给了别的线程）。
    pub fn bwrite(&mut self) -> Result<(), D::Error> {
        if !self.data.holding() {
            panic!("bwrite: {:?} not holding", self.id);
        }
        let cache = self.cache;
        cache.disk.rw(self.id.dev, self.id.blockno, &mut self.data, true)?;
        cache.inner(self.id).valid.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// 释放缓冲区
    ///
    /// # Panics
    /// 当前执行流不持有该缓冲区的内容锁。
    pub fn brelse(self) {
        if !self.data.holding() {
            panic!("brelse: {:?} not holding", self.id);
        }
        drop(self);
    }

    /// 在持有缓冲区期间钉住它，返回之后 `bunpin` 所需的标识
    pub fn pin(&self) -> BufId {
        self.cache.bpin(self.id);
        self.id
    }

    pub fn id(&self) -> BufId {
        self.id
    }

    pub fn dev(&self) -> u32 {
        self.id.dev
    }

    pub fn blockno(&self) -> u32 {
        self.id.blockno
    }

    /// 内容是否与磁盘一致
    pub fn is_valid(&self) -> bool {
        self.cache.inner(self.id).valid.load(Ordering::Relaxed)
    }

    pub fn data(&self) -> &BufData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut BufData {
        &mut self.data
    }
}

impl<'a, D: BlockDevice, S: Scheduler> Drop for Buf<'a, D, S> {
    fn drop(&mut self) {
        unsafe { ManuallyDrop::drop(&mut self.data) };
        self.cache.brelse(self.id);
    }
}

/// 一个哈希桶：桶锁保护的槽位元数据，以及各槽位的数据
struct Bucket {
    ctrl: SpinLock<[BufCtrl; NBUF_PER_BUCKET]>,

    bufs: [BufInner; NBUF_PER_BUCKET],
}

impl Bucket {
    fn new() -> Self {
        Self {
            ctrl: SpinLock::new([BufCtrl::new(); NBUF_PER_BUCKET], "bcache.bucket"),
            bufs: array![_ => BufInner::new(); NBUF_PER_BUCKET],
        }
    }
}

/// 槽位元数据，受桶锁保护
#[derive(Clone, Copy)]
struct BufCtrl {
    /// 绑定的 `(dev, blockno)`，从未使用过的槽位为 `None`
    key: Option<(u32, u32)>,

    refcnt: usize,

    /// 最近一次被 `bget` 取用时的逻辑时钟
    timestamp: u64,
}

impl BufCtrl {
    const fn new() -> Self {
        Self {
            key: None,
            refcnt: 0,
            timestamp: 0,
        }
    }

    fn holds(&self, dev: u32, blockno: u32) -> bool {
        self.key == Some((dev, blockno))
    }

    fn rebind(&mut self, dev: u32, blockno: u32, now: u64) {
        self.key = Some((dev, blockno));
        self.refcnt = 1;
        self.timestamp = now;
    }
}

struct BufInner {
    /// 内容是否与磁盘一致。只在持有内容锁，或持有桶锁且引用计数为 0 时修改
    valid: AtomicBool,

    data: SleepLock<BufData>,
}

impl BufInner {
    fn new() -> Self {
        Self {
            valid: AtomicBool::new(false),
            data: SleepLock::new(BufData::new(), "BufData"),
        }
    }
}

/// 一个磁盘块的数据
#[repr(C, align(8))]
pub struct BufData([u8; BSIZE]);

impl BufData {
    pub const fn new() -> Self {
        Self([0; BSIZE])
    }
}

impl Deref for BufData {
    type Target = [u8; BSIZE];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
