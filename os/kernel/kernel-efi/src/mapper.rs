//! # Address Space Mapper
//!
//! Makes firmware-reported physical ranges reachable from the kernel's
//! address space and adjusts their protection.
//!
//! Ranges inside the direct map are reused as-is: the direct map already
//! covers all RAM the kernel knows about, so a lookup there costs nothing and
//! never creates a duplicate mapping. Everything else (typically MMIO and
//! firmware-reserved memory above the top of RAM) is mapped fresh through the
//! kernel's [`AddressMapper`].
//!
//! ```text
//!        physical                               virtual
//! ┌───────────────────┐  direct map   ┌──────────────────────────┐
//! │ [0, low_end)      │ ────────────► │ base + pa                │
//! ├───────────────────┤               ├──────────────────────────┤
//! │ [4 GiB, high_end) │ ────────────► │ base + pa                │
//! ├───────────────────┤               ├──────────────────────────┤
//! │ anything else     │ map_physical  │ wherever the mapper puts │
//! └───────────────────┘ ────────────► └──────────────────────────┘
//! ```

use crate::addresses::{PhysicalAddress, VirtualAddress, efi_to_native};
use crate::memory_map::MemoryDescriptor;
use core::ptr::read_unaligned;
use core::slice;
use kernel_info::memory::{DIRECT_MAP_HIGH_START, HHDM_BASE};
use uefi::boot::MemoryType;

/// The two windows of the kernel's direct map.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DirectMap {
    base: u64,
    low_end: PhysicalAddress,
    high_end: PhysicalAddress,
}

impl DirectMap {
    /// Direct map at `base + pa` for `[0, low_end)` and `[4 GiB, high_end)`.
    #[must_use]
    pub const fn new(base: u64, low_end: PhysicalAddress, high_end: PhysicalAddress) -> Self {
        Self {
            base,
            low_end,
            high_end,
        }
    }

    /// The kernel's higher-half direct map.
    #[must_use]
    pub const fn hhdm(low_end: PhysicalAddress, high_end: PhysicalAddress) -> Self {
        Self::new(HHDM_BASE, low_end, high_end)
    }

    /// Whether `[start, start + size)` is reachable through one of the windows.
    /// Ranges running past the end of the address space never are.
    #[must_use]
    pub const fn covers(&self, start: PhysicalAddress, size: u64) -> bool {
        let Some(end) = start.as_u64().checked_add(size) else {
            return false;
        };
        let end_pfn = PhysicalAddress::new(end).pfn_up();
        let high_start_pfn = PhysicalAddress::new(DIRECT_MAP_HIGH_START).pfn_up();

        end_pfn <= self.low_end.pfn_up() || (end_pfn > high_start_pfn && end_pfn <= self.high_end.pfn_up())
    }

    #[must_use]
    pub const fn translate(&self, pa: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(self.base.wrapping_add(pa.as_u64()))
    }
}

/// Page mapping services of the kernel.
///
/// # Safety
/// Every address returned by [`AddressMapper::map_physical`] or
/// [`AddressMapper::early_map`] must be readable and writable for the
/// requested size and back exactly the requested physical range until it is
/// unmapped.
pub unsafe trait AddressMapper {
    /// Current extent of the direct map.
    fn direct_map(&self) -> DirectMap;

    /// Creates a permanent mapping suitable for firmware runtime use.
    fn map_physical(&mut self, start: PhysicalAddress, size: u64, ty: MemoryType) -> Option<VirtualAddress>;

    /// Creates a transient mapping for reading firmware tables.
    fn early_map(&mut self, start: PhysicalAddress, size: u64) -> Option<VirtualAddress>;

    /// Releases a mapping returned by [`AddressMapper::early_map`].
    fn early_unmap(&mut self, va: VirtualAddress, size: u64);
}

/// Cache and protection primitives of the kernel's page tables.
///
/// Counts are in native pages.
pub trait PageAttributes {
    /// Whether the CPU enforces no-execute protection.
    fn nx_supported(&self) -> bool;

    fn set_uncached(&mut self, va: VirtualAddress, pages: u64);

    fn set_executable(&mut self, va: VirtualAddress, pages: u64);

    fn set_non_executable(&mut self, va: VirtualAddress, pages: u64);
}

/// Bundles the mapping and protection collaborators used by the
/// virtual-mode transition.
pub struct AddressSpaceMapper<'a, M: ?Sized, A: ?Sized> {
    mapper: &'a mut M,
    attrs: &'a mut A,
}

impl<'a, M, A> AddressSpaceMapper<'a, M, A>
where
    M: AddressMapper + ?Sized,
    A: PageAttributes + ?Sized,
{
    pub const fn new(mapper: &'a mut M, attrs: &'a mut A) -> Self {
        Self { mapper, attrs }
    }

    /// Returns the address `[start, start + size)` is reachable at, creating a
    /// mapping only when the direct map does not cover the range.
    ///
    /// `None` means the range could not be mapped; the caller decides whether
    /// that is fatal.
    pub fn remap_range(&mut self, start: PhysicalAddress, size: u64, ty: MemoryType) -> Option<VirtualAddress> {
        let direct = self.mapper.direct_map();
        if direct.covers(start, size) {
            return Some(direct.translate(start));
        }

        self.mapper.map_physical(start, size, ty).filter(|va| !va.is_null())
    }

    /// Forces uncached access on a mapped region when `want_uncached` is set.
    pub fn apply_cache_attribute(&mut self, va: VirtualAddress, efi_pages: u64, want_uncached: bool) {
        if !want_uncached {
            return;
        }

        let (va, pages) = efi_to_native(va, efi_pages);
        self.attrs.set_uncached(va, pages);
    }

    /// Toggles execute permission on the mapped range of `md`.
    ///
    /// Regions without physical backing are left alone.
    pub fn set_executable(&mut self, md: &MemoryDescriptor, executable: bool) {
        if md.phys_start().is_null() {
            return;
        }

        let (va, pages) = efi_to_native(md.virt_start(), md.page_count());
        if executable {
            self.attrs.set_executable(va, pages);
        } else {
            self.attrs.set_non_executable(va, pages);
        }
    }

    #[must_use]
    pub fn nx_supported(&self) -> bool {
        self.attrs.nx_supported()
    }

    pub fn early_unmap(&mut self, va: VirtualAddress, size: u64) {
        self.mapper.early_unmap(va, size);
    }
}

/// A transient mapping of a firmware table, unmapped on drop.
pub struct EarlyMapping<'m, M: AddressMapper + ?Sized> {
    mapper: &'m mut M,
    va: VirtualAddress,
    size: u64,
}

impl<'m, M: AddressMapper + ?Sized> EarlyMapping<'m, M> {
    /// Maps `[start, start + size)`; `None` if the mapper refuses.
    pub fn new(mapper: &'m mut M, start: PhysicalAddress, size: u64) -> Option<Self> {
        let va = mapper.early_map(start, size).filter(|va| !va.is_null())?;
        Some(Self { mapper, va, size })
    }

    /// The mapped bytes.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the mapper guarantees `size` readable bytes at `va` while mapped.
        unsafe { slice::from_raw_parts(self.va.as_ptr::<u8>(), self.size as usize) }
    }

    /// Reads a `T` at `offset`; `None` if it would leave the mapping.
    #[must_use]
    pub fn read<T: Copy>(&self, offset: usize) -> Option<T> {
        let end = offset.checked_add(size_of::<T>())?;
        let bytes = self.bytes().get(offset..end)?;
        // SAFETY: `bytes` holds exactly size_of::<T>() bytes and T is plain data.
        Some(unsafe { read_unaligned(bytes.as_ptr().cast::<T>()) })
    }
}

impl<M: AddressMapper + ?Sized> Drop for EarlyMapping<'_, M> {
    fn drop(&mut self) {
        self.mapper.early_unmap(self.va, self.size);
    }
}

/// A long-lived early mapping that is released explicitly, such as the
/// window onto the firmware memory map that must survive until the
/// transition completes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MappedWindow {
    pub(crate) pa: PhysicalAddress,
    pub(crate) va: VirtualAddress,
    pub(crate) size: u64,
}

impl MappedWindow {
    #[must_use]
    pub const fn phys(&self) -> PhysicalAddress {
        self.pa
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Mutable view of the mapped bytes.
    ///
    /// # Safety
    /// The window must still be mapped and no other reference to it may exist.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) unsafe fn bytes_mut<'w>(&self) -> &'w mut [u8] {
        // SAFETY: forwarded to the caller.
        unsafe { slice::from_raw_parts_mut(self.va.as_mut_ptr::<u8>(), self.size as usize) }
    }

    /// Mapped bytes.
    ///
    /// # Safety
    /// The window must still be mapped.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) unsafe fn bytes<'w>(&self) -> &'w [u8] {
        // SAFETY: forwarded to the caller.
        unsafe { slice::from_raw_parts(self.va.as_ptr::<u8>(), self.size as usize) }
    }
}
