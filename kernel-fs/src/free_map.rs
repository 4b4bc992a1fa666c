use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::block_cache::BufferCache;
use crate::block_dev::SECTOR_SZ;

/// 每个位图扇区的 bit 数量 (512 * 8 = 4096)
const SECTOR_BITS: usize = SECTOR_SZ * 8;

/// 位图扇区类型（每扇区 64 个 u64）
type BitmapBlock = [u64; 64];

/// 空闲扇区分配器接口
///
/// 扇区 0 是空指针哨兵，实现者永远不能把它分配出去。
pub trait FreeMap: Send + Sync {
    /// 分配 `count` 个连续扇区，返回首扇区号；空间不足返回 `None`
    fn allocate(&self, count: usize) -> Option<u32>;

    /// 释放从 `sector` 开始的 `count` 个扇区
    fn release(&self, sector: u32, count: usize);
}

/// 经由缓冲缓存持久化的空闲扇区位图
///
/// 每个设备扇区占一位，位图本身存放在从扇区 1 开始的若干扇区中。
/// 格式化时扇区 0 与位图自身所在扇区被标记为已用。
pub struct Bitmap {
    cache: Arc<BufferCache>,
    /// 位图起始扇区
    start_sector: u32,
    /// 位图占用的扇区数
    sectors: u32,
    /// 被管理的扇区总数
    total: u32,
    lock: Mutex<()>,
}

impl Bitmap {
    /// 位图的起始扇区
    pub const START_SECTOR: u32 = 1;

    /// 管理 `total` 个扇区所需的位图扇区数
    pub fn sectors_for(total: u32) -> u32 {
        ((total as usize + SECTOR_BITS - 1) / SECTOR_BITS) as u32
    }

    /// 在设备上建立一张新位图
    pub fn format(cache: Arc<BufferCache>) -> Self {
        let bitmap = Self::open(cache);
        for i in 0..bitmap.sectors {
            bitmap
                .cache
                .modify(bitmap.start_sector + i, 0, |block: &mut BitmapBlock| {
                    block.fill(0);
                });
        }
        bitmap.update(0, bitmap.reserved() as usize, true);
        bitmap
    }

    /// 打开设备上已有的位图
    pub fn open(cache: Arc<BufferCache>) -> Self {
        let total = cache.device().sector_count();
        let sectors = Self::sectors_for(total);
        assert!(
            Self::START_SECTOR + sectors < total,
            "device of {} sectors is too small for a free map",
            total
        );
        Self {
            cache,
            start_sector: Self::START_SECTOR,
            sectors,
            total,
            lock: Mutex::new(()),
        }
    }

    /// 格式化时保留的扇区数，即第一个可分配扇区号
    pub fn reserved(&self) -> u32 {
        self.start_sector + self.sectors
    }

    /// 被管理的扇区总数
    pub fn total(&self) -> u32 {
        self.total
    }

    /// 当前空闲扇区数
    pub fn free_count(&self) -> usize {
        let _guard = self.lock.lock();
        let blocks = self.snapshot();
        (0..self.total as usize)
            .filter(|&bit| !Self::test(&blocks, bit))
            .count()
    }

    fn snapshot(&self) -> Vec<BitmapBlock> {
        (0..self.sectors)
            .map(|i| {
                self.cache
                    .read(self.start_sector + i, 0, |block: &BitmapBlock| *block)
            })
            .collect()
    }

    fn test(blocks: &[BitmapBlock], bit: usize) -> bool {
        let word = blocks[bit / SECTOR_BITS][(bit % SECTOR_BITS) / 64];
        word & (1u64 << (bit % 64)) != 0
    }

    /// 找到第一段长度为 `count` 的空闲位
    fn find_run(&self, blocks: &[BitmapBlock], count: usize) -> Option<usize> {
        let total = self.total as usize;
        let mut run = 0usize;
        let mut bit = 0usize;
        while bit < total {
            let word = blocks[bit / SECTOR_BITS][(bit % SECTOR_BITS) / 64];
            if run == 0 && bit % 64 == 0 && word == u64::MAX {
                bit += 64;
                continue;
            }
            if run == 0 && bit % 64 == 0 {
                // 跳过字首的已用位
                bit += word.trailing_ones() as usize;
                if bit >= total {
                    break;
                }
            }
            if Self::test(blocks, bit) {
                run = 0;
            } else {
                run += 1;
                if run == count {
                    return Some(bit + 1 - count);
                }
            }
            bit += 1;
        }
        None
    }

    /// 将 `[first, first + count)` 置为已用或空闲
    fn update(&self, first: usize, count: usize, used: bool) {
        for bit in first..first + count {
            let sector = self.start_sector + (bit / SECTOR_BITS) as u32;
            let word = (bit % SECTOR_BITS) / 64;
            let mask = 1u64 << (bit % 64);
            self.cache.modify(sector, 0, |block: &mut BitmapBlock| {
                if used {
                    assert_eq!(block[word] & mask, 0, "sector {} is already in use", bit);
                    block[word] |= mask;
                } else {
                    assert_ne!(block[word] & mask, 0, "sector {} is already free", bit);
                    block[word] &= !mask;
                }
            });
        }
    }
}

impl FreeMap for Bitmap {
    fn allocate(&self, count: usize) -> Option<u32> {
        if count == 0 {
            return None;
        }
        let _guard = self.lock.lock();
        let blocks = self.snapshot();
        let first = self.find_run(&blocks, count)?;
        self.update(first, count, true);
        Some(first as u32)
    }

    fn release(&self, sector: u32, count: usize) {
        assert_ne!(sector, 0, "sector 0 is the null pointer and is never allocated");
        assert!(sector as usize + count <= self.total as usize);
        let _guard = self.lock.lock();
        self.update(sector as usize, count, false);
    }
}
