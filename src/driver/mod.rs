//! 块设备驱动接口
//!
//! 具体的磁盘驱动（virtio 等）不属于本层。缓冲区缓存只依赖 [`BlockDevice`]：
//! 一次同步的整块传输，调用者在传输期间被挂起，完成方式（中断）由驱动负责。

use crate::fs::BufData;

pub trait BlockDevice: Sync {
    /// 驱动报告的传输错误，原样透传给缓冲区缓存的调用者
    type Error;

    /// 在设备 `dev` 的第 `blockno` 块与 `data` 之间传输一整块数据。
    ///
    /// `writing` 为 `true` 时把 `data` 写入磁盘，否则把磁盘内容读入 `data`。
    fn rw(&self, dev: u32, blockno: u32, data: &mut BufData, writing: bool)
        -> Result<(), Self::Error>;
}
