//! 索引节点层
//!
//! 内存中的 `Inode` 记录打开计数、删除标记与禁写计数，
//! `InodeTable` 保证同一个扇区在内存中至多有一个 `Inode`。

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::cmp::min;
use spin::Mutex;

use crate::block_cache::BufferCache;
use crate::block_dev::SECTOR_SZ;
use crate::error::{FsError, Result};
use crate::free_map::FreeMap;
use crate::layout::{DiskInode, DiskInodeType};

struct InodeState {
    /// 打开者数量
    open_cnt: usize,
    /// 最后一个打开者关闭时是否回收磁盘空间
    removed: bool,
    /// 大于 0 时禁止写入
    deny_write_cnt: usize,
}

/// 索引节点
///
/// 磁盘上的 `DiskInode` 始终经由缓冲缓存访问，内存中只保留运行时状态。
pub struct Inode {
    /// DiskInode 所在的扇区号，同时作为 inode 编号
    sector: u32,
    cache: Arc<BufferCache>,
    free_map: Arc<dyn FreeMap>,
    state: Mutex<InodeState>,
    /// 文件扩展锁，防止两个写者重复分配同一段空间
    extend_lock: Mutex<()>,
}

impl Inode {
    fn new(sector: u32, cache: Arc<BufferCache>, free_map: Arc<dyn FreeMap>) -> Self {
        Self {
            sector,
            cache,
            free_map,
            state: Mutex::new(InodeState {
                open_cnt: 1,
                removed: false,
                deny_write_cnt: 0,
            }),
            extend_lock: Mutex::new(()),
        }
    }

    /// 以只读方式访问 DiskInode
    pub fn read_disk_inode<V>(&self, f: impl FnOnce(&DiskInode) -> V) -> V {
        self.cache.read(self.sector, 0, f)
    }

    /// 以可变方式访问 DiskInode
    fn modify_disk_inode<V>(&self, f: impl FnOnce(&mut DiskInode) -> V) -> V {
        self.cache.modify(self.sector, 0, f)
    }

    /// inode 编号，即其所在扇区号
    pub fn inumber(&self) -> u32 {
        self.sector
    }

    /// 文件长度（字节）
    pub fn length(&self) -> usize {
        self.read_disk_inode(|disk_inode| disk_inode.length as usize)
    }

    pub fn is_dir(&self) -> bool {
        self.read_disk_inode(|disk_inode| disk_inode.is_dir())
    }

    /// 包含字节 `pos` 的设备扇区，`pos` 不小于文件长度时返回 `None`
    pub fn byte_to_sector(&self, pos: usize) -> Option<u32> {
        let disk_inode = self.read_disk_inode(|disk_inode| *disk_inode);
        if pos >= disk_inode.length as usize {
            return None;
        }
        Some(disk_inode.resolve(pos / SECTOR_SZ, &self.cache))
    }

    /// 从 `offset` 处读取数据到 `buf`，返回实际读取的字节数
    ///
    /// 读到文件末尾即停止。读完后把紧随其后的扇区加入预读队列。
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        let end = min(offset.saturating_add(buf.len()), self.length());
        let mut pos = offset;
        let mut read = 0usize;
        while pos < end {
            let sector = match self.byte_to_sector(pos) {
                Some(sector) => sector,
                None => break,
            };
            let sector_ofs = pos % SECTOR_SZ;
            let chunk = min(SECTOR_SZ - sector_ofs, end - pos);
            self.cache
                .read_at(sector, &mut buf[read..read + chunk], sector_ofs);
            pos += chunk;
            read += chunk;
        }
        if read > 0 {
            let next = (pos - 1) / SECTOR_SZ + 1;
            if let Some(sector) = self.byte_to_sector(next * SECTOR_SZ) {
                self.cache.request_read_ahead(sector);
            }
        }
        read
    }

    /// 将 `buf` 写入 `offset` 处，必要时先扩展文件
    ///
    /// 扩展失败时文件长度与已分配空间都保持原样。
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize> {
        if self.state.lock().deny_write_cnt > 0 {
            return Err(FsError::WriteDenied(self.sector));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(buf.len())
            .ok_or(FsError::FileTooLarge)?;
        if end > self.length() {
            self.extend(end)?;
        }
        let mut pos = offset;
        let mut written = 0usize;
        while pos < end {
            let sector = match self.byte_to_sector(pos) {
                Some(sector) => sector,
                None => break,
            };
            let sector_ofs = pos % SECTOR_SZ;
            let chunk = min(SECTOR_SZ - sector_ofs, end - pos);
            self.cache
                .write_at(sector, &buf[written..written + chunk], sector_ofs);
            pos += chunk;
            written += chunk;
        }
        Ok(written)
    }

    /// 把文件扩展到 `new_length` 字节
    fn extend(&self, new_length: usize) -> Result<()> {
        let _guard = self.extend_lock.lock();
        // 持锁后重新检查，其他写者可能已经完成扩展
        let mut disk_inode = self.read_disk_inode(|disk_inode| *disk_inode);
        if new_length <= disk_inode.length as usize {
            return Ok(());
        }
        disk_inode.grow(new_length, &self.cache, self.free_map.as_ref())?;
        self.modify_disk_inode(|on_disk| *on_disk = disk_inode);
        Ok(())
    }

    /// 标记为删除，最后一个打开者关闭时回收
    pub fn mark_removed(&self) {
        self.state.lock().removed = true;
    }

    pub fn is_removed(&self) -> bool {
        self.state.lock().removed
    }

    /// 禁止写入，每个打开者至多调用一次
    pub fn deny_write(&self) {
        let mut state = self.state.lock();
        state.deny_write_cnt += 1;
        assert!(state.deny_write_cnt <= state.open_cnt);
    }

    /// 恢复写入，必须与之前的 `deny_write` 配对
    pub fn allow_write(&self) {
        let mut state = self.state.lock();
        assert!(state.deny_write_cnt > 0);
        assert!(state.deny_write_cnt <= state.open_cnt);
        state.deny_write_cnt -= 1;
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().open_cnt
    }
}

/// 已打开 inode 的登记表
pub struct InodeTable {
    cache: Arc<BufferCache>,
    free_map: Arc<dyn FreeMap>,
    open_inodes: Mutex<BTreeMap<u32, Arc<Inode>>>,
}

impl InodeTable {
    pub fn new(cache: Arc<BufferCache>, free_map: Arc<dyn FreeMap>) -> Self {
        Self {
            cache,
            free_map,
            open_inodes: Mutex::new(BTreeMap::new()),
        }
    }

    /// 在扇区 `sector` 上创建长度为 `length` 的 inode
    ///
    /// `sector` 由调用方事先从空闲位图中分配。数据扇区全部预先分配并清零，
    /// 任一步分配失败都会回滚，此时元数据扇区不会被写入。
    pub fn create(&self, sector: u32, length: usize, type_: DiskInodeType) -> Result<()> {
        let mut disk_inode = DiskInode::new(type_);
        disk_inode.grow(length, &self.cache, self.free_map.as_ref())?;
        self.cache
            .modify(sector, 0, |on_disk: &mut DiskInode| *on_disk = disk_inode);
        log::debug!("create inode {} ({:?}, {} bytes)", sector, type_, length);
        Ok(())
    }

    /// 打开扇区 `sector` 上的 inode，已打开时共享同一个实例
    pub fn open(&self, sector: u32) -> Arc<Inode> {
        let mut open_inodes = self.open_inodes.lock();
        if let Some(inode) = open_inodes.get(&sector) {
            return self.reopen(inode);
        }
        let inode = Arc::new(Inode::new(
            sector,
            Arc::clone(&self.cache),
            Arc::clone(&self.free_map),
        ));
        open_inodes.insert(sector, Arc::clone(&inode));
        log::debug!("open inode {}", sector);
        inode
    }

    /// 增加一个打开者
    pub fn reopen(&self, inode: &Arc<Inode>) -> Arc<Inode> {
        inode.state.lock().open_cnt += 1;
        Arc::clone(inode)
    }

    /// 关闭一个打开者
    ///
    /// 最后一个打开者关闭时注销该 inode；若已标记删除，则释放全部数据扇区、
    /// 索引扇区以及元数据扇区本身。回收期间持有登记表锁，
    /// 同一扇区的并发 `open` 不会看到回收到一半的 inode。
    pub fn close(&self, inode: Arc<Inode>) {
        let mut open_inodes = self.open_inodes.lock();
        let removed = {
            let mut state = inode.state.lock();
            assert!(state.open_cnt > 0, "inode {} closed too many times", inode.sector);
            state.open_cnt -= 1;
            if state.open_cnt > 0 {
                return;
            }
            state.removed
        };
        open_inodes.remove(&inode.sector);
        if removed {
            let mut disk_inode = inode.read_disk_inode(|disk_inode| *disk_inode);
            let sectors = DiskInode::total_sectors(disk_inode.length as usize);
            disk_inode.release(&self.cache, self.free_map.as_ref());
            self.free_map.release(inode.sector, 1);
            log::debug!(
                "close inode {}, reclaimed {} sectors",
                inode.sector,
                sectors + 1
            );
        } else {
            log::debug!("close inode {}", inode.sector);
        }
    }

    /// 当前登记的 inode 数量
    pub fn open_inodes(&self) -> usize {
        self.open_inodes.lock().len()
    }
}
