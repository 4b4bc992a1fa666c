//! 块存储核心：带时钟驱逐与每槽读写锁的缓冲缓存、周期写回与预读守护例程，
//! 以及支持直接、一级间接、二级间接索引的 inode 层。

#![no_std]

extern crate alloc;

mod block_cache;
mod block_dev;
mod daemon;
mod error;
mod free_map;
mod inode;
mod layout;
mod volume;

pub use block_cache::{
    BufferCache, CachePin, CacheStats, CACHE_CAPACITY, EMPTY_SECTOR, READ_AHEAD_LIMIT,
};
pub use block_dev::{BlockDevice, SECTOR_SZ};
pub use daemon::{read_ahead, write_behind, Semaphore, Sleeper, WRITE_BEHIND_INTERVAL};
pub use error::{FsError, Result};
pub use free_map::{Bitmap, FreeMap};
pub use inode::{Inode, InodeTable};
pub use layout::{
    bytes_to_sectors, DiskInode, DiskInodeType, IndirectBlock, InodeFlags, INODE_MAGIC,
    MAX_FILE_SECTORS, MAX_FILE_SIZE, NULL_SECTOR, NUM_DIRECT, PTRS_PER_SECTOR,
};
pub use volume::Volume;
