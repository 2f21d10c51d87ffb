//! # Physical and Virtual Addresses
//!
//! Thin `u64` wrappers that keep firmware-reported physical addresses apart
//! from the kernel-assigned virtual addresses they are mapped at.

use core::fmt;
use core::ops::{Add, Sub};

/// EFI page shift. Firmware always describes memory in 4 KiB pages,
/// independent of the page size the kernel maps with.
pub const EFI_PAGE_SHIFT: u32 = 12;

/// EFI page size in bytes.
pub const EFI_PAGE_SIZE: u64 = 1 << EFI_PAGE_SHIFT;

/// Page shift of the kernel's own mappings.
pub const NATIVE_PAGE_SHIFT: u32 = 12;

/// Physical memory address as reported by firmware.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Page frame number of the page containing this address, rounded **up**
    /// when the address is not page aligned.
    #[inline]
    #[must_use]
    pub const fn pfn_up(self) -> u64 {
        self.0.div_ceil(EFI_PAGE_SIZE)
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:016X})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for PhysicalAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl Sub for PhysicalAddress {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.0.wrapping_sub(rhs.0)
    }
}

/// Virtual memory address in the kernel's address space.
///
/// A zero address is never handed out by a mapping and is used to mark
/// regions that could not be mapped.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as usize as *const T
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as usize as *mut T
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

/// Converts an EFI page range into the kernel's native page geometry:
/// the start is aligned down to a native page and the count covers the
/// same bytes.
#[must_use]
pub const fn efi_to_native(addr: VirtualAddress, efi_pages: u64) -> (VirtualAddress, u64) {
    let native_size = 1u64 << NATIVE_PAGE_SHIFT;
    let start = addr.as_u64() & !(native_size - 1);
    let end = addr.as_u64() + (efi_pages << EFI_PAGE_SHIFT);
    let pages = (end - start).div_ceil(native_size);
    (VirtualAddress::new(start), pages)
}
