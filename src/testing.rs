//! 宿主机单元测试使用的协作者实现
//!
//! 每个测试线程扮演一个 CPU 上运行的内核线程。

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

use crate::consts::fs::BSIZE;
use crate::driver::BlockDevice;
use crate::fs::BufData;
use crate::process::{Cpu, Scheduler};
use crate::spinlock::SpinLockGuard;

thread_local! {
    static CPU_ID: Cell<usize> = const { Cell::new(0) };
    static NOFF: Cell<usize> = const { Cell::new(0) };
    static PID: Cell<usize> = const { Cell::new(0) };
}

static NEXT_PID: AtomicUsize = AtomicUsize::new(1);

/// 把当前测试线程"调度"到第 `id` 个 CPU 上
pub fn set_cpu(id: usize) {
    CPU_ID.with(|c| c.set(id));
}

/// 当前测试线程的关中断嵌套深度
pub fn noff() -> usize {
    NOFF.with(|n| n.get())
}

/// 以线程局部变量模拟 `tp` 寄存器与中断嵌套计数
pub struct TestCpu;

impl Cpu for TestCpu {
    fn cpu_id(&self) -> usize {
        assert!(noff() > 0, "cpu_id: preemptible");
        CPU_ID.with(|c| c.get())
    }

    fn push_off(&self) {
        NOFF.with(|n| n.set(n.get() + 1));
    }

    fn pop_off(&self) {
        NOFF.with(|n| {
            let noff = n.get().checked_sub(1).expect("pop_off(): count not match");
            n.set(noff);
        });
    }
}

/// 用 `Condvar` 实现的睡眠/唤醒。
///
/// 唤醒不区分通道，所有睡眠者醒来后各自重新检查条件。
pub struct CondvarScheduler {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl CondvarScheduler {
    pub fn new() -> Self {
        Self {
            generation: Mutex::new(0),
            cond: Condvar::new(),
        }
    }
}

impl Cpu for CondvarScheduler {
    fn cpu_id(&self) -> usize {
        TestCpu.cpu_id()
    }

    fn push_off(&self) {
        TestCpu.push_off()
    }

    fn pop_off(&self) {
        TestCpu.pop_off()
    }
}

impl Scheduler for CondvarScheduler {
    fn my_pid(&self) -> usize {
        PID.with(|p| {
            if p.get() == 0 {
                p.set(NEXT_PID.fetch_add(1, Ordering::Relaxed));
            }
            p.get()
        })
    }

    fn sleep(&self, _channel: usize, guard: SpinLockGuard<'_, ()>) {
        assert!(noff() > 0, "sleep: interruptible");
        // 先拿到 generation 锁再放开自旋锁，wakeup 无法插在两者之间
        let mut generation = self.generation.lock().unwrap();
        let seen = *generation;
        drop(guard);
        while *generation == seen {
            generation = self.cond.wait(generation).unwrap();
        }
    }

    fn wakeup(&self, _channel: usize) {
        assert!(noff() > 0, "wakeup: interruptible");
        let mut generation = self.generation.lock().unwrap();
        *generation += 1;
        self.cond.notify_all();
    }
}

/// 内存中的磁盘，记录读写次数
pub struct RamDisk {
    blocks: Mutex<HashMap<(u32, u32), [u8; BSIZE]>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    fail: AtomicBool,
}

#[derive(Debug, PartialEq, Eq)]
pub struct DiskError;

impl RamDisk {
    pub fn new() -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    /// 不经过缓存直接写盘，用于准备测试数据
    pub fn put(&self, dev: u32, blockno: u32, byte: u8) {
        self.blocks.lock().unwrap().insert((dev, blockno), [byte; BSIZE]);
    }

    pub fn get(&self, dev: u32, blockno: u32) -> [u8; BSIZE] {
        self.blocks.lock().unwrap().get(&(dev, blockno)).copied().unwrap_or([0; BSIZE])
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// 之后的所有传输都返回错误
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl BlockDevice for RamDisk {
    type Error = DiskError;

    fn rw(&self, dev: u32, blockno: u32, data: &mut BufData, writing: bool)
        -> Result<(), DiskError>
    {
        if self.fail.load(Ordering::SeqCst) {
            return Err(DiskError);
        }
        let mut blocks = self.blocks.lock().unwrap();
        if writing {
            self.writes.fetch_add(1, Ordering::SeqCst);
            let mut block = [0; BSIZE];
            block.copy_from_slice(&data[..]);
            blocks.insert((dev, blockno), block);
        } else {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let block = blocks.get(&(dev, blockno)).copied().unwrap_or([0; BSIZE]);
            data.copy_from_slice(&block);
        }
        Ok(())
    }
}
