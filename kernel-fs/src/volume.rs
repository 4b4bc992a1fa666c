use alloc::sync::Arc;

use crate::block_cache::BufferCache;
use crate::block_dev::BlockDevice;
use crate::error::{FsError, Result};
use crate::free_map::{Bitmap, FreeMap};
use crate::inode::InodeTable;
use crate::layout::{DiskInode, DiskInodeType};

/// 已挂载的卷
///
/// 从挂载到卸载只存在一份，持有缓冲缓存、空闲位图与 inode 登记表。
///
/// 磁盘布局：
///
/// ```text
/// | 0: 空指针 | 1..: 空闲位图 | 根目录 inode | 数据与 inode 扇区 ... |
/// ```
pub struct Volume {
    cache: Arc<BufferCache>,
    free_map: Arc<Bitmap>,
    inodes: InodeTable,
}

impl Volume {
    /// 在设备上建立新卷
    ///
    /// # 流程
    ///
    /// 1. 以 `capacity` 个槽位创建缓冲缓存
    /// 2. 格式化空闲位图，保留扇区 0 与位图自身
    /// 3. 在位图之后的第一个扇区创建空的根目录
    /// 4. 将缓存全部写回
    pub fn format(device: Arc<dyn BlockDevice>, capacity: usize) -> Result<Self> {
        let cache = Arc::new(BufferCache::with_capacity(device, capacity));
        let free_map = Arc::new(Bitmap::format(Arc::clone(&cache)));
        let volume = Self::assemble(cache, free_map);

        let root = volume.free_map.allocate(1).ok_or(FsError::NoSpace)?;
        assert_eq!(root, volume.root_sector());
        volume.inodes.create(root, 0, DiskInodeType::Directory)?;
        volume.cache.flush_all();
        log::info!(
            "formatted volume: {} sectors, {} free",
            volume.free_map.total(),
            volume.free_map.free_count()
        );
        Ok(volume)
    }

    /// 挂载设备上已有的卷
    pub fn open(device: Arc<dyn BlockDevice>, capacity: usize) -> Self {
        let cache = Arc::new(BufferCache::with_capacity(device, capacity));
        let free_map = Arc::new(Bitmap::open(Arc::clone(&cache)));
        let volume = Self::assemble(cache, free_map);
        let root_valid = volume
            .cache
            .read(volume.root_sector(), 0, |root: &DiskInode| {
                root.is_valid() && root.is_dir()
            });
        assert!(root_valid, "no root directory at sector {}", volume.root_sector());
        log::info!("mounted volume of {} sectors", volume.free_map.total());
        volume
    }

    fn assemble(cache: Arc<BufferCache>, free_map: Arc<Bitmap>) -> Self {
        let inodes = InodeTable::new(Arc::clone(&cache), free_map.clone());
        Self {
            cache,
            free_map,
            inodes,
        }
    }

    /// 根目录 inode 所在扇区
    pub fn root_sector(&self) -> u32 {
        self.free_map.reserved()
    }

    pub fn cache(&self) -> &Arc<BufferCache> {
        &self.cache
    }

    pub fn free_map(&self) -> &Arc<Bitmap> {
        &self.free_map
    }

    pub fn inodes(&self) -> &InodeTable {
        &self.inodes
    }

    /// 卸载：通知守护线程退出并把缓存写回设备
    pub fn unmount(self) {
        self.cache.shutdown();
        let still_open = self.inodes.open_inodes();
        if still_open > 0 {
            log::warn!("unmounting with {} inodes still open", still_open);
        }
        self.cache.flush_all();
        log::info!("volume unmounted");
    }
}
