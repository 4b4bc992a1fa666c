use core::mem::size_of;

use crate::block_cache::BufferCache;
use crate::block_dev::SECTOR_SZ;
use crate::error::{FsError, Result};
use crate::free_map::FreeMap;

/// inode 格式标签
pub const INODE_MAGIC: u16 = 0x494e;
/// 直接索引数量
pub const NUM_DIRECT: usize = 124;
/// 每个索引扇区可存储的扇区指针数量 (512 / 4 = 128)
pub const PTRS_PER_SECTOR: usize = SECTOR_SZ / size_of::<u32>();
/// 单个文件最多拥有的数据扇区数
pub const MAX_FILE_SECTORS: usize =
    NUM_DIRECT + PTRS_PER_SECTOR + PTRS_PER_SECTOR * PTRS_PER_SECTOR;
/// 单个文件的最大字节数
pub const MAX_FILE_SIZE: usize = MAX_FILE_SECTORS * SECTOR_SZ;
/// 未分配的扇区指针，空闲位图永远不会分配扇区 0
pub const NULL_SECTOR: u32 = 0;

/// 直接索引边界
const DIRECT_BOUND: usize = NUM_DIRECT;
/// 一级间接索引边界 (124 + 128 = 252)
const INDIRECT_BOUND: usize = DIRECT_BOUND + PTRS_PER_SECTOR;

/// 索引扇区类型，一级与二级间接索引共用
pub type IndirectBlock = [u32; PTRS_PER_SECTOR];

bitflags::bitflags! {
    /// 磁盘 inode 标志位
    pub struct InodeFlags: u16 {
        /// 目录
        const DIR = 1 << 0;
    }
}

/// 索引节点类型
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum DiskInodeType {
    File,
    Directory,
}

/// 磁盘索引节点
///
/// 恰好占满一个扇区。格式标签与目录标志共用最后一个 32 位字。
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DiskInode {
    /// 直接索引
    pub direct: [u32; NUM_DIRECT],
    /// 一级间接索引扇区号
    pub indirect: u32,
    /// 二级间接索引扇区号
    pub double_indirect: u32,
    /// 文件大小（字节）
    pub length: u32,
    magic: u16,
    flags: u16,
}

const _: () = assert!(size_of::<DiskInode>() == SECTOR_SZ);

/// 存放 `bytes` 字节需要的数据扇区数
pub fn bytes_to_sectors(bytes: usize) -> usize {
    (bytes + SECTOR_SZ - 1) / SECTOR_SZ
}

/// 第 `level` 层的一个指针覆盖的数据扇区数
fn span(level: u32) -> usize {
    PTRS_PER_SECTOR.pow(level)
}

impl DiskInode {
    /// 创建一个尚未分配任何扇区的索引节点
    pub fn new(type_: DiskInodeType) -> Self {
        let flags = match type_ {
            DiskInodeType::File => InodeFlags::empty(),
            DiskInodeType::Directory => InodeFlags::DIR,
        };
        Self {
            direct: [NULL_SECTOR; NUM_DIRECT],
            indirect: NULL_SECTOR,
            double_indirect: NULL_SECTOR,
            length: 0,
            magic: INODE_MAGIC,
            flags: flags.bits(),
        }
    }

    /// 格式标签是否正确
    pub fn is_valid(&self) -> bool {
        self.magic == INODE_MAGIC
    }

    pub fn flags(&self) -> InodeFlags {
        InodeFlags::from_bits_truncate(self.flags)
    }

    pub fn is_dir(&self) -> bool {
        self.flags().contains(InodeFlags::DIR)
    }

    /// 当前长度占用的数据扇区数
    pub fn data_sectors(&self) -> usize {
        bytes_to_sectors(self.length as usize)
    }

    /// 长度为 `length` 的文件共占用的扇区数（含索引扇区）
    pub fn total_sectors(length: usize) -> usize {
        let data = bytes_to_sectors(length);
        let mut total = data;
        if data > DIRECT_BOUND {
            total += 1;
        }
        if data > INDIRECT_BOUND {
            total += 1 + (data - INDIRECT_BOUND + PTRS_PER_SECTOR - 1) / PTRS_PER_SECTOR;
        }
        total
    }

    /// 从当前长度扩展到 `new_length` 需要的新扇区数
    pub fn sectors_needed(&self, new_length: usize) -> usize {
        assert!(new_length >= self.length as usize);
        Self::total_sectors(new_length) - Self::total_sectors(self.length as usize)
    }

    /// 文件内第 `index` 个数据扇区对应的设备扇区号
    ///
    /// 每一级只在读出子指针的瞬间持有该索引扇区的读锁，
    /// 下降时不再钉住上一级。调用方保证 `index` 在文件长度之内。
    pub fn resolve(&self, index: usize, cache: &BufferCache) -> u32 {
        assert!(index < MAX_FILE_SECTORS);
        if index < DIRECT_BOUND {
            lookup(0, self.direct[index], index, cache)
        } else if index < INDIRECT_BOUND {
            lookup(1, self.indirect, index - DIRECT_BOUND, cache)
        } else {
            lookup(2, self.double_indirect, index - INDIRECT_BOUND, cache)
        }
    }

    /// 把文件扩展到 `new_length` 字节
    ///
    /// 只有全部扇区分配成功才提交新长度；任一步失败都会释放本次新分配的扇区、
    /// 清空对应指针并保持原长度不变。
    pub fn grow(
        &mut self,
        new_length: usize,
        cache: &BufferCache,
        free_map: &dyn FreeMap,
    ) -> Result<()> {
        if new_length > MAX_FILE_SIZE {
            return Err(FsError::FileTooLarge);
        }
        if new_length <= self.length as usize {
            return Ok(());
        }
        let old_sectors = self.data_sectors();
        let new_sectors = bytes_to_sectors(new_length);
        match self.allocate_span(new_sectors, cache, free_map) {
            Ok(()) => {
                self.length = new_length as u32;
                Ok(())
            }
            Err(err) => {
                log::warn!(
                    "growth to {} bytes failed ({}), rolling back to {} sectors",
                    new_length,
                    err,
                    old_sectors
                );
                self.release_span(old_sectors, new_sectors, false, cache, free_map);
                Err(err)
            }
        }
    }

    /// 释放全部数据扇区与索引扇区，长度归零
    ///
    /// 文件范围内遇到空指针说明簿记已损坏，直接 panic。
    pub fn release(&mut self, cache: &BufferCache, free_map: &dyn FreeMap) {
        let sectors = self.data_sectors();
        self.release_span(0, sectors, true, cache, free_map);
        self.length = 0;
    }

    /// 三级索引：(层级, 起始数据扇区序号, 指针)
    fn tiers_mut(&mut self) -> [(u32, usize, &mut [u32]); 3] {
        [
            (0, 0, &mut self.direct[..]),
            (1, DIRECT_BOUND, core::slice::from_mut(&mut self.indirect)),
            (
                2,
                INDIRECT_BOUND,
                core::slice::from_mut(&mut self.double_indirect),
            ),
        ]
    }

    /// 保证前 `count` 个数据扇区都已分配
    fn allocate_span(
        &mut self,
        count: usize,
        cache: &BufferCache,
        free_map: &dyn FreeMap,
    ) -> Result<()> {
        for (level, base, entries) in self.tiers_mut() {
            let capacity = entries.len() * span(level);
            let n = count.saturating_sub(base).min(capacity);
            allocate_entries(level, entries, n, cache, free_map)?;
        }
        Ok(())
    }

    /// 释放数据扇区 `[keep, count)` 以及不再覆盖保留数据的索引扇区
    fn release_span(
        &mut self,
        keep: usize,
        count: usize,
        strict: bool,
        cache: &BufferCache,
        free_map: &dyn FreeMap,
    ) {
        for (level, base, entries) in self.tiers_mut() {
            let capacity = entries.len() * span(level);
            let k = keep.saturating_sub(base).min(capacity);
            let n = count.saturating_sub(base).min(capacity);
            release_entries(level, entries, k, n, strict, cache, free_map);
        }
    }
}

fn lookup(level: u32, sector: u32, index: usize, cache: &BufferCache) -> u32 {
    assert_ne!(
        sector, NULL_SECTOR,
        "null sector pointer at level {} inside the file",
        level
    );
    if level == 0 {
        return sector;
    }
    let child_span = span(level - 1);
    let child = cache.read(sector, 0, |block: &IndirectBlock| block[index / child_span]);
    lookup(level - 1, child, index % child_span, cache)
}

fn allocate_zeroed(cache: &BufferCache, free_map: &dyn FreeMap) -> Result<u32> {
    let sector = free_map.allocate(1).ok_or(FsError::NoSpace)?;
    assert_ne!(sector, NULL_SECTOR, "free map handed out the null sector");
    cache.write_at(sector, &[0u8; SECTOR_SZ], 0);
    Ok(sector)
}

/// 为 `entries` 覆盖的前 `count` 个数据扇区分配空间，已填充的指针保持不变
fn allocate_entries(
    level: u32,
    entries: &mut [u32],
    count: usize,
    cache: &BufferCache,
    free_map: &dyn FreeMap,
) -> Result<()> {
    let span = span(level);
    for (i, entry) in entries.iter_mut().enumerate() {
        let covered = i * span;
        if covered >= count {
            break;
        }
        allocate_one(level, entry, (count - covered).min(span), cache, free_map)?;
    }
    Ok(())
}

fn allocate_one(
    level: u32,
    sector: &mut u32,
    count: usize,
    cache: &BufferCache,
    free_map: &dyn FreeMap,
) -> Result<()> {
    if count == 0 {
        return Ok(());
    }
    if *sector == NULL_SECTOR {
        *sector = allocate_zeroed(cache, free_map)?;
    }
    if level == 0 {
        return Ok(());
    }
    let mut block = cache.read(*sector, 0, |block: &IndirectBlock| *block);
    let before = block;
    let result = allocate_entries(level - 1, &mut block, count, cache, free_map);
    // 失败时也要记下已填的指针，回滚才能找到它们
    if block != before {
        cache.modify(*sector, 0, |indirect: &mut IndirectBlock| *indirect = block);
    }
    result
}

fn release_entries(
    level: u32,
    entries: &mut [u32],
    keep: usize,
    count: usize,
    strict: bool,
    cache: &BufferCache,
    free_map: &dyn FreeMap,
) {
    let span = span(level);
    for (i, entry) in entries.iter_mut().enumerate().skip(keep / span) {
        let covered = i * span;
        if covered >= count {
            break;
        }
        release_one(
            level,
            entry,
            keep.saturating_sub(covered),
            (count - covered).min(span),
            strict,
            cache,
            free_map,
        );
    }
}

fn release_one(
    level: u32,
    sector: &mut u32,
    keep: usize,
    count: usize,
    strict: bool,
    cache: &BufferCache,
    free_map: &dyn FreeMap,
) {
    if count <= keep {
        return;
    }
    if *sector == NULL_SECTOR {
        assert!(
            !strict,
            "null sector pointer at level {} inside an allocated span",
            level
        );
        return;
    }
    if level > 0 {
        let mut block = cache.read(*sector, 0, |block: &IndirectBlock| *block);
        release_entries(level - 1, &mut block, keep, count, strict, cache, free_map);
        if keep > 0 {
            cache.modify(*sector, 0, |indirect: &mut IndirectBlock| *indirect = block);
        }
    }
    if keep == 0 {
        free_map.release(*sector, 1);
        *sector = NULL_SECTOR;
    }
}
