use thiserror::Error;

use crate::layout::MAX_FILE_SIZE;

/// 存储核心对调用方可见的错误
///
/// 设备错误与元数据损坏不在此列：它们是不可恢复的，直接 panic。
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// 空闲扇区位图已耗尽
    #[error("no free sectors left on the device")]
    NoSpace,
    /// 文件长度超过三级索引能寻址的上限
    #[error("file would exceed the maximum size of {max} bytes", max = MAX_FILE_SIZE)]
    FileTooLarge,
    /// inode 当前禁止写入
    #[error("writes to inode {0} are denied")]
    WriteDenied(u32),
}

pub type Result<T> = core::result::Result<T, FsError>;
