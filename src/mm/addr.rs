//! 提供物理地址包装

use bit_field::BitField;

use core::fmt;

use crate::consts::{PGSHIFT, PGSIZE};

/// 地址类型的公共操作
pub trait Addr {
    fn data_ref(&self) -> &usize;

    fn data_mut(&mut self) -> &mut usize;

    /// 向上取整到页边界。调用者保证结果不溢出。
    #[inline]
    fn pg_round_up(&mut self) {
        *self.data_mut() = (*self.data_mut() + PGSIZE - 1) & !(PGSIZE - 1)
    }

    #[inline]
    fn as_usize(&self) -> usize {
        *self.data_ref()
    }

    /// 低 `PGSHIFT` 位（页内偏移）是否全为 0
    #[inline]
    fn is_page_aligned(&self) -> bool {
        self.data_ref().get_bits(0..PGSHIFT) == 0
    }
}

/// 物理地址。
///
/// 这里不检查对齐：`kfree` 需要接收任意地址并自行判定是否合法。
#[repr(C)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysAddr(usize);

impl Addr for PhysAddr {
    #[inline]
    fn data_ref(&self) -> &usize {
        &self.0
    }

    #[inline]
    fn data_mut(&mut self) -> &mut usize {
        &mut self.0
    }
}

impl PhysAddr {
    #[inline]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        let mut pa = PhysAddr::from_raw(0x8000_1001);
        pa.pg_round_up();
        assert_eq!(pa.as_usize(), 0x8000_2000);
        pa.pg_round_up();
        assert_eq!(pa.as_usize(), 0x8000_2000);
    }

    #[test]
    fn alignment() {
        assert!(PhysAddr::from_raw(0x3000).is_page_aligned());
        assert!(!PhysAddr::from_raw(0x3008).is_page_aligned());
        assert_eq!(format!("{:?}", PhysAddr::from_raw(0x3000)), "PhysAddr(0x3000)");
    }
}
