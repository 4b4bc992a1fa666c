use core::any::Any;

/// 扇区大小常量，固定为 512 字节
pub const SECTOR_SZ: usize = 512;

/// 块设备抽象接口
///
/// 提供以 512 字节扇区为单位的同步读写，供缓冲缓存层调用。
/// 磁盘被假定始终存在：实现者遇到 I/O 错误时应直接 panic，上层不做重试。
pub trait BlockDevice: Send + Sync + Any {
    /// 读取指定扇区的内容到缓冲区
    ///
    /// # 参数
    /// - `sector`: 扇区编号
    /// - `buf`: 目标缓冲区，长度必须为 512 字节
    fn read_sector(&self, sector: u32, buf: &mut [u8]);

    /// 将缓冲区内容写入指定扇区
    ///
    /// # 参数
    /// - `sector`: 扇区编号
    /// - `buf`: 源缓冲区，长度必须为 512 字节
    fn write_sector(&self, sector: u32, buf: &[u8]);

    /// 设备总扇区数
    fn sector_count(&self) -> u32;
}
