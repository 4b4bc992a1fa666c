use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem::{align_of, size_of};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering::SeqCst};
use spin::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::block_dev::{BlockDevice, SECTOR_SZ};
use crate::daemon::Semaphore;

/// 缓冲缓存默认槽位数
pub const CACHE_CAPACITY: usize = 64;

/// 空槽的扇区号哨兵
pub const EMPTY_SECTOR: u32 = u32::MAX;

/// 预读队列的最大长度，队满时新的请求被丢弃
pub const READ_AHEAD_LIMIT: usize = 64;

bitflags::bitflags! {
    /// 缓存槽状态位
    struct SlotFlags: u8 {
        /// 槽内数据对应一个真实扇区
        const VALID = 1 << 0;
        /// 数据被修改且尚未写回
        const DIRTY = 1 << 1;
        /// 时钟算法的访问位
        const USED = 1 << 2;
    }
}

/// 扇区数据缓冲区，按 8 字节对齐以便就地解释为 `#[repr(C)]` 结构
#[repr(C, align(8))]
struct SectorBuf([u8; SECTOR_SZ]);

impl SectorBuf {
    /// 获取缓冲区中指定偏移处的不可变引用
    ///
    /// T 必须是任意位模式都合法的 `#[repr(C)]` 类型。
    fn get_ref<T>(&self, offset: usize) -> &T {
        let type_size = size_of::<T>();
        assert!(offset + type_size <= SECTOR_SZ);
        let addr = self.0.as_ptr().wrapping_add(offset) as *const T;
        assert_eq!(addr as usize % align_of::<T>(), 0);
        unsafe { &*addr }
    }

    /// 获取缓冲区中指定偏移处的可变引用
    fn get_mut<T>(&mut self, offset: usize) -> &mut T {
        let type_size = size_of::<T>();
        assert!(offset + type_size <= SECTOR_SZ);
        let addr = self.0.as_mut_ptr().wrapping_add(offset) as *mut T;
        assert_eq!(addr as usize % align_of::<T>(), 0);
        unsafe { &mut *addr }
    }
}

/// 缓存槽
///
/// 槽的扇区身份只在驱逐者持有该槽写锁时改变。
/// 任何读写者拿到锁后都必须重新核对身份，不一致则从查找重新开始。
struct CacheSlot {
    /// 所缓存的扇区号，空槽为 `EMPTY_SECTOR`
    sector: AtomicU32,
    /// `SlotFlags` 位
    flags: AtomicU8,
    /// 被驱逐的脏扇区在写回完成前记录在此
    pending_writeback: AtomicU32,
    data: RwLock<SectorBuf>,
}

impl CacheSlot {
    fn new() -> Self {
        Self {
            sector: AtomicU32::new(EMPTY_SECTOR),
            flags: AtomicU8::new(0),
            pending_writeback: AtomicU32::new(EMPTY_SECTOR),
            data: RwLock::new(SectorBuf([0u8; SECTOR_SZ])),
        }
    }

    fn flags(&self) -> SlotFlags {
        SlotFlags::from_bits_truncate(self.flags.load(SeqCst))
    }

    fn set(&self, flags: SlotFlags) {
        self.flags.fetch_or(flags.bits(), SeqCst);
    }

    fn clear(&self, flags: SlotFlags) {
        self.flags.fetch_and(!flags.bits(), SeqCst);
    }

    fn holds(&self, sector: u32) -> bool {
        self.flags().contains(SlotFlags::VALID) && self.sector.load(SeqCst) == sector
    }
}

/// 查找结果
enum Located<'a> {
    /// 命中第 i 个槽，尚未加锁
    Hit(usize),
    /// 目标扇区的旧内容正由第 i 个槽写回，需等待后重试
    Busy(usize),
    /// 新占用的槽，持有写锁，尚未装入数据
    Claimed {
        index: usize,
        guard: RwLockWriteGuard<'a, SectorBuf>,
        victim: Option<u32>,
    },
}

/// 预读请求队列
///
/// 每入队一个请求就对守护例程的信号量执行一次 `up`。
#[derive(Default)]
struct ReadAheadQueue {
    pending: VecDeque<u32>,
    signal: Option<Arc<dyn Semaphore>>,
}

impl ReadAheadQueue {
    fn wake(&self) {
        if let Some(signal) = &self.signal {
            signal.up();
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicUsize,
    misses: AtomicUsize,
    evictions: AtomicUsize,
    writebacks: AtomicUsize,
}

/// 缓冲缓存统计信息快照
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub evictions: usize,
    pub writebacks: usize,
}

/// 缓冲缓存
///
/// 固定数量的缓存槽，时钟算法驱逐，每槽一把读写锁。
/// 查找锁只保护「用哪个槽」的决策与时钟指针，从不跨越设备 I/O。
pub struct BufferCache {
    device: Arc<dyn BlockDevice>,
    slots: Box<[CacheSlot]>,
    /// 查找锁，保护时钟指针
    clock: Mutex<usize>,
    read_ahead: Mutex<ReadAheadQueue>,
    shutdown: AtomicBool,
    counters: Counters,
}

impl BufferCache {
    /// 以默认容量创建缓冲缓存
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        Self::with_capacity(device, CACHE_CAPACITY)
    }

    /// 以指定槽位数创建缓冲缓存
    pub fn with_capacity(device: Arc<dyn BlockDevice>, capacity: usize) -> Self {
        assert!(capacity > 0, "buffer cache needs at least one slot");
        let slots: Vec<CacheSlot> = (0..capacity).map(|_| CacheSlot::new()).collect();
        Self {
            device,
            slots: slots.into_boxed_slice(),
            clock: Mutex::new(0),
            read_ahead: Mutex::new(ReadAheadQueue::default()),
            shutdown: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    /// 从扇区 `sector` 的 `offset` 处读取 `dst.len()` 字节
    pub fn read_at(&self, sector: u32, dst: &mut [u8], offset: usize) {
        assert!(offset + dst.len() <= SECTOR_SZ);
        let (_, guard) = self.lock_read(sector);
        dst.copy_from_slice(&guard.0[offset..offset + dst.len()]);
    }

    /// 将 `src` 写入扇区 `sector` 的 `offset` 处，并标记为脏
    pub fn write_at(&self, sector: u32, src: &[u8], offset: usize) {
        assert!(offset + src.len() <= SECTOR_SZ);
        let (index, mut guard) = self.lock_write(sector);
        guard.0[offset..offset + src.len()].copy_from_slice(src);
        self.slots[index].set(SlotFlags::DIRTY);
    }

    /// 读取整个扇区
    pub fn read_sector(&self, sector: u32, dst: &mut [u8; SECTOR_SZ]) {
        self.read_at(sector, dst, 0);
    }

    /// 覆写整个扇区
    pub fn write_sector(&self, sector: u32, src: &[u8; SECTOR_SZ]) {
        self.write_at(sector, src, 0);
    }

    /// 钉住扇区以便就地读取，返回的 `CachePin` 存活期间该槽不会被驱逐
    pub fn access_begin(&self, sector: u32) -> CachePin<'_> {
        let (_, guard) = self.lock_read(sector);
        CachePin { sector, guard }
    }

    /// 结束 `access_begin` 建立的钉住
    pub fn access_end(&self, pin: CachePin<'_>) {
        drop(pin);
    }

    /// 以只读方式访问扇区中 `offset` 处的 `T`
    pub fn read<T, V>(&self, sector: u32, offset: usize, f: impl FnOnce(&T) -> V) -> V {
        let (_, guard) = self.lock_read(sector);
        f(guard.get_ref(offset))
    }

    /// 以可变方式访问扇区中 `offset` 处的 `T`，并标记为脏
    pub fn modify<T, V>(&self, sector: u32, offset: usize, f: impl FnOnce(&mut T) -> V) -> V {
        let (index, mut guard) = self.lock_write(sector);
        self.slots[index].set(SlotFlags::DIRTY);
        f(guard.get_mut(offset))
    }

    /// 将所有有效的脏槽写回设备
    pub fn flush_all(&self) {
        let dirty = SlotFlags::VALID | SlotFlags::DIRTY;
        for slot in self.slots.iter() {
            if !slot.flags().contains(dirty) {
                continue;
            }
            let guard = slot.data.read();
            // 写者都持有写锁，读锁下脏位与身份都稳定
            if slot.flags().contains(dirty) {
                self.device.write_sector(slot.sector.load(SeqCst), &guard.0);
                slot.clear(SlotFlags::DIRTY);
                self.counters.writebacks.fetch_add(1, SeqCst);
            }
        }
    }

    /// 把扇区装入缓存，已缓存时什么也不做
    pub fn prefetch(&self, sector: u32) {
        if self.is_cached(sector) {
            return;
        }
        drop(self.lock_read(sector));
    }

    /// 排队一个预读请求并唤醒预读守护例程
    ///
    /// 越过设备末尾、已在缓存中或已在队列中的扇区被静默忽略，队满时也丢弃。
    pub fn request_read_ahead(&self, sector: u32) {
        if sector >= self.device.sector_count() || self.is_cached(sector) {
            return;
        }
        let mut queue = self.read_ahead.lock();
        if queue.pending.len() >= READ_AHEAD_LIMIT || queue.pending.contains(&sector) {
            return;
        }
        queue.pending.push_back(sector);
        queue.wake();
    }

    /// 按 FIFO 顺序取出下一个预读请求
    pub fn next_read_ahead(&self) -> Option<u32> {
        self.read_ahead.lock().pending.pop_front()
    }

    pub fn pending_read_ahead(&self) -> usize {
        self.read_ahead.lock().pending.len()
    }

    /// 登记预读守护例程阻塞所用的信号量
    ///
    /// 已排队的请求与已发出的关闭通知都会补发相应次数的 `up`。
    pub fn attach_read_ahead(&self, signal: Arc<dyn Semaphore>) {
        let mut queue = self.read_ahead.lock();
        let backlog = queue.pending.len() + usize::from(self.is_shut_down());
        for _ in 0..backlog {
            signal.up();
        }
        queue.signal = Some(signal);
    }

    /// 通知后台守护例程退出
    pub fn shutdown(&self) {
        self.shutdown.store(true, SeqCst);
        self.read_ahead.lock().wake();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(SeqCst)
    }

    /// 扇区当前是否在缓存中，不影响时钟访问位
    pub fn is_cached(&self, sector: u32) -> bool {
        let _hand = self.clock.lock();
        self.slots.iter().any(|slot| slot.holds(sector))
    }

    /// 当前所有有效槽对应的扇区号
    pub fn cached_sectors(&self) -> Vec<u32> {
        let _hand = self.clock.lock();
        self.slots
            .iter()
            .filter(|slot| slot.flags().contains(SlotFlags::VALID))
            .map(|slot| slot.sector.load(SeqCst))
            .collect()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(SeqCst),
            misses: self.counters.misses.load(SeqCst),
            evictions: self.counters.evictions.load(SeqCst),
            writebacks: self.counters.writebacks.load(SeqCst),
        }
    }

    fn lock_read(&self, sector: u32) -> (usize, RwLockReadGuard<'_, SectorBuf>) {
        loop {
            match self.locate(sector) {
                Located::Hit(index) => {
                    let guard = self.slots[index].data.read();
                    if self.slots[index].holds(sector) {
                        return (index, guard);
                    }
                }
                Located::Busy(index) => drop(self.slots[index].data.read()),
                Located::Claimed {
                    index,
                    mut guard,
                    victim,
                } => {
                    self.load(index, &mut guard, sector, victim);
                    return (index, guard.downgrade());
                }
            }
        }
    }

    fn lock_write(&self, sector: u32) -> (usize, RwLockWriteGuard<'_, SectorBuf>) {
        loop {
            match self.locate(sector) {
                Located::Hit(index) => {
                    let guard = self.slots[index].data.write();
                    if self.slots[index].holds(sector) {
                        return (index, guard);
                    }
                }
                Located::Busy(index) => drop(self.slots[index].data.read()),
                Located::Claimed {
                    index,
                    mut guard,
                    victim,
                } => {
                    self.load(index, &mut guard, sector, victim);
                    return (index, guard);
                }
            }
        }
    }

    /// 在查找锁下决定扇区所在的槽，未命中时占用一个槽并改写其身份
    fn locate(&self, sector: u32) -> Located<'_> {
        assert!(
            sector < self.device.sector_count(),
            "sector {} is past the end of the device",
            sector
        );
        let mut hand = self.clock.lock();
        if let Some(index) = self.slots.iter().position(|slot| slot.holds(sector)) {
            self.slots[index].set(SlotFlags::USED);
            self.counters.hits.fetch_add(1, SeqCst);
            return Located::Hit(index);
        }
        if let Some(index) = self
            .slots
            .iter()
            .position(|slot| slot.pending_writeback.load(SeqCst) == sector)
        {
            return Located::Busy(index);
        }

        let (index, guard) = self.claim(&mut *hand);
        let slot = &self.slots[index];
        let old = slot.flags();
        let victim = if old.contains(SlotFlags::VALID | SlotFlags::DIRTY) {
            let victim = slot.sector.load(SeqCst);
            slot.pending_writeback.store(victim, SeqCst);
            Some(victim)
        } else {
            None
        };
        if old.contains(SlotFlags::VALID) {
            self.counters.evictions.fetch_add(1, SeqCst);
            log::trace!(
                "evict sector {} from slot {} for sector {}",
                slot.sector.load(SeqCst),
                index,
                sector
            );
        }
        slot.sector.store(sector, SeqCst);
        slot.flags
            .store((SlotFlags::VALID | SlotFlags::USED).bits(), SeqCst);
        self.counters.misses.fetch_add(1, SeqCst);
        Located::Claimed {
            index,
            guard,
            victim,
        }
    }

    /// 选出一个可用的槽并取得其写锁
    ///
    /// 优先使用空槽；否则推进时钟指针：访问位置位的槽清位跳过，
    /// 被钉住（`try_write` 失败）的槽跳过，第一圈内还跳过脏槽以偏好干净的牺牲者。
    /// 第一圈结束时所有访问位都已清除，第二圈必能找到未被钉住的槽。
    fn claim(&self, hand: &mut usize) -> (usize, RwLockWriteGuard<'_, SectorBuf>) {
        for (index, slot) in self.slots.iter().enumerate() {
            if !slot.flags().contains(SlotFlags::VALID) {
                if let Some(guard) = slot.data.try_write() {
                    return (index, guard);
                }
            }
        }
        let capacity = self.slots.len();
        for step in 0..2 * capacity {
            let index = *hand;
            *hand = (*hand + 1) % capacity;
            let slot = &self.slots[index];
            let flags = slot.flags();
            if flags.contains(SlotFlags::USED) {
                slot.clear(SlotFlags::USED);
                continue;
            }
            if step < capacity && flags.contains(SlotFlags::DIRTY) {
                continue;
            }
            if let Some(guard) = slot.data.try_write() {
                return (index, guard);
            }
        }
        panic!("buffer cache: every slot is pinned, nothing to evict");
    }

    /// 在查找锁之外完成驱逐写回与新扇区读入，调用方持有槽写锁
    fn load(&self, index: usize, buf: &mut SectorBuf, sector: u32, victim: Option<u32>) {
        if let Some(old) = victim {
            self.device.write_sector(old, &buf.0);
            self.counters.writebacks.fetch_add(1, SeqCst);
            self.slots[index].pending_writeback.store(EMPTY_SECTOR, SeqCst);
        }
        self.device.read_sector(sector, &mut buf.0);
    }
}

impl Drop for BufferCache {
    fn drop(&mut self) {
        self.flush_all();
    }
}

/// 被钉住的缓存扇区
///
/// 持有槽读锁，析构即 `access_end`。
pub struct CachePin<'a> {
    sector: u32,
    guard: RwLockReadGuard<'a, SectorBuf>,
}

impl<'a> CachePin<'a> {
    pub fn sector(&self) -> u32 {
        self.sector
    }

    pub fn as_bytes(&self) -> &[u8; SECTOR_SZ] {
        &self.guard.0
    }

    /// 将 `offset` 处的内容解释为 `T`
    pub fn get_ref<T>(&self, offset: usize) -> &T {
        self.guard.get_ref(offset)
    }

    pub fn read<T, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V {
        f(self.get_ref(offset))
    }
}
