//! 集成测试共用的 mock 块设备、睡眠器与信号量
//!
//! kernel-fs 是 no_std crate，测试在用户态使用 std 模拟设备和调度器。

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex as StdMutex};
use std::time::Duration;

use kernel_fs::{BlockDevice, Semaphore, Sleeper, SECTOR_SZ};

/// Mock 块设备，记录读写次数
pub struct MockBlockDevice {
    sectors: Arc<StdMutex<Vec<Vec<u8>>>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MockBlockDevice {
    pub fn new(num_sectors: usize) -> Arc<Self> {
        Arc::new(Self {
            sectors: Arc::new(StdMutex::new(vec![vec![0u8; SECTOR_SZ]; num_sectors])),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        })
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// 绕过缓存直接查看设备上的扇区内容
    pub fn raw(&self, sector: u32) -> Vec<u8> {
        self.sectors.lock().unwrap()[sector as usize].clone()
    }

    /// 绕过缓存直接改写设备上的扇区
    pub fn set_raw(&self, sector: u32, data: &[u8]) {
        self.sectors.lock().unwrap()[sector as usize].copy_from_slice(data);
    }
}

impl BlockDevice for MockBlockDevice {
    fn read_sector(&self, sector: u32, buf: &mut [u8]) {
        let sectors = self.sectors.lock().unwrap();
        assert!((sector as usize) < sectors.len(), "read past end: {}", sector);
        buf.copy_from_slice(&sectors[sector as usize]);
        self.reads.fetch_add(1, Ordering::SeqCst);
    }

    fn write_sector(&self, sector: u32, buf: &[u8]) {
        let mut sectors = self.sectors.lock().unwrap();
        assert!((sector as usize) < sectors.len(), "write past end: {}", sector);
        sectors[sector as usize].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    fn sector_count(&self) -> u32 {
        self.sectors.lock().unwrap().len() as u32
    }
}

/// 基于 std 线程的睡眠器
pub struct StdSleeper;

impl Sleeper for StdSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// 基于 std 条件变量的计数信号量，记录 `down` 次数与当前等待者数量
pub struct StdSemaphore {
    count: StdMutex<usize>,
    cond: Condvar,
    downs: AtomicUsize,
    waiting: AtomicUsize,
}

impl StdSemaphore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            count: StdMutex::new(0),
            cond: Condvar::new(),
            downs: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
        })
    }

    pub fn downs(&self) -> usize {
        self.downs.load(Ordering::SeqCst)
    }

    /// 当前阻塞在 `down` 中的线程数
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }
}

impl Semaphore for StdSemaphore {
    fn down(&self) {
        self.downs.fetch_add(1, Ordering::SeqCst);
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            self.waiting.fetch_add(1, Ordering::SeqCst);
            count = self.cond.wait(count).unwrap();
            self.waiting.fetch_sub(1, Ordering::SeqCst);
        }
        *count -= 1;
    }

    fn up(&self) {
        *self.count.lock().unwrap() += 1;
        self.cond.notify_one();
    }
}

/// 用字节 `seed` 派生出一个内容可辨认的扇区
pub fn pattern(seed: u8) -> [u8; SECTOR_SZ] {
    let mut buf = [0u8; SECTOR_SZ];
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte = seed.wrapping_add(i as u8);
    }
    buf
}
