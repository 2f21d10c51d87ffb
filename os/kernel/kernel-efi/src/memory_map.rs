//! # EFI Memory Descriptor Table
//!
//! The firmware reports physical memory as a packed array of
//! `EFI_MEMORY_DESCRIPTOR` records whose stride (`desc_size`) may be larger
//! than the structure UEFI documents. [`MemoryMap`] copies that
//! array once into kernel-owned storage as an indexed table of
//! [`MemoryDescriptor`]s and validates the stride exactly once, at load.
//!
//! ```text
//!   raw table (firmware format)            MemoryMap (kernel-owned)
//! ┌──────────────┬─────────┐            ┌───┬──────────────────────┐
//! │ descriptor 0 │ padding │  parse()   │ 0 │ MemoryDescriptor     │
//! ├──────────────┼─────────┤ ─────────► ├───┼──────────────────────┤
//! │ descriptor 1 │ padding │            │ 1 │ MemoryDescriptor     │
//! └──────────────┴─────────┘ ◄───────── └───┴──────────────────────┘
//!   ◄─ desc_size ─►            store()
//! ```
//!
//! Merging never removes slots. A descriptor folded into its predecessor is
//! retyped `RESERVED` with empty attributes and flagged as coalesced, so the
//! slot count (and every index) stays stable for later iteration.

pub mod boot_services;
pub mod legacy;

use crate::addresses::{EFI_PAGE_SHIFT, EFI_PAGE_SIZE, PhysicalAddress, VirtualAddress};
use crate::error::MemoryMapError;
use alloc::vec::Vec;
use core::mem::size_of;
use core::ptr::{read_unaligned, write_unaligned};
use log::{debug, warn};
use uefi::boot::{MemoryAttribute, MemoryType};

/// Descriptor layout version this code understands.
pub const DESCRIPTOR_VERSION: u32 = 1;

/// `EFI_MEMORY_DESCRIPTOR` exactly as firmware lays it out.
#[repr(C)]
#[derive(Clone, Copy)]
struct RawMemoryDescriptor {
    ty: u32,
    _pad: u32,
    phys_start: u64,
    virt_start: u64,
    page_count: u64,
    attribute: u64,
}

/// Smallest stride a firmware memory map may use.
pub const MIN_DESCRIPTOR_SIZE: usize = size_of::<RawMemoryDescriptor>();

/// One firmware-reported memory region.
///
/// Type, physical start and attributes are fixed once reported. Only the
/// virtual start (assigned during the virtual-mode transition) and the page
/// count (zeroed for regions that could not be reserved) change afterwards.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryDescriptor {
    ty: MemoryType,
    phys_start: PhysicalAddress,
    virt_start: VirtualAddress,
    page_count: u64,
    attribute: MemoryAttribute,
    coalesced: bool,
}

impl MemoryDescriptor {
    #[must_use]
    pub const fn new(
        ty: MemoryType,
        phys_start: PhysicalAddress,
        page_count: u64,
        attribute: MemoryAttribute,
    ) -> Self {
        Self {
            ty,
            phys_start,
            virt_start: VirtualAddress::zero(),
            page_count,
            attribute,
            coalesced: false,
        }
    }

    fn from_raw(raw: RawMemoryDescriptor) -> Self {
        Self {
            ty: MemoryType(raw.ty),
            phys_start: PhysicalAddress::new(raw.phys_start),
            virt_start: VirtualAddress::new(raw.virt_start),
            page_count: raw.page_count,
            attribute: MemoryAttribute::from_bits_retain(raw.attribute),
            coalesced: false,
        }
    }

    fn to_raw(self) -> RawMemoryDescriptor {
        RawMemoryDescriptor {
            ty: self.ty.0,
            _pad: 0,
            phys_start: self.phys_start.as_u64(),
            virt_start: self.virt_start.as_u64(),
            page_count: self.page_count,
            attribute: self.attribute.bits(),
        }
    }

    #[inline]
    #[must_use]
    pub const fn ty(&self) -> MemoryType {
        self.ty
    }

    #[inline]
    #[must_use]
    pub const fn phys_start(&self) -> PhysicalAddress {
        self.phys_start
    }

    #[inline]
    #[must_use]
    pub const fn virt_start(&self) -> VirtualAddress {
        self.virt_start
    }

    #[inline]
    #[must_use]
    pub const fn page_count(&self) -> u64 {
        self.page_count
    }

    #[inline]
    #[must_use]
    pub const fn attribute(&self) -> MemoryAttribute {
        self.attribute
    }

    /// Size of the region in bytes.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.page_count.saturating_mul(EFI_PAGE_SIZE)
    }

    /// Exclusive physical end of the region, clamped to the top of the
    /// address space.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.phys_start.as_u64().saturating_add(self.size()))
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, addr: PhysicalAddress) -> bool {
        self.phys_start <= addr && addr < self.end()
    }

    /// `false` once the slot was folded into its predecessor by a merge.
    #[inline]
    #[must_use]
    pub const fn is_live(&self) -> bool {
        !self.coalesced
    }

    /// Firmware needs this region after boot.
    #[inline]
    #[must_use]
    pub fn is_runtime(&self) -> bool {
        self.attribute.contains(MemoryAttribute::RUNTIME)
    }

    #[inline]
    #[must_use]
    pub fn is_boot_services(&self) -> bool {
        self.ty == MemoryType::BOOT_SERVICES_CODE || self.ty == MemoryType::BOOT_SERVICES_DATA
    }

    /// Strongly ordered: uncacheable without a write-back alternative.
    #[inline]
    #[must_use]
    pub fn wants_uncached(&self) -> bool {
        self.attribute.contains(MemoryAttribute::UNCACHEABLE)
            && !self.attribute.contains(MemoryAttribute::WRITE_BACK)
    }

    pub(crate) fn set_virt_start(&mut self, va: VirtualAddress) {
        self.virt_start = va;
    }

    pub(crate) fn clear_pages(&mut self) {
        self.page_count = 0;
    }

    fn retire(&mut self) {
        self.ty = MemoryType::RESERVED;
        self.attribute = MemoryAttribute::empty();
        self.coalesced = true;
    }
}

/// Kernel-owned copy of the firmware memory map.
#[derive(Clone, Debug, Default)]
pub struct MemoryMap {
    descriptors: Vec<MemoryDescriptor>,
    desc_size: usize,
    desc_version: u32,
}

impl MemoryMap {
    /// Builds a map from already decoded descriptors, using the minimal stride.
    #[must_use]
    pub const fn new(descriptors: Vec<MemoryDescriptor>) -> Self {
        Self {
            descriptors,
            desc_size: MIN_DESCRIPTOR_SIZE,
            desc_version: DESCRIPTOR_VERSION,
        }
    }

    /// Decodes a firmware-format table.
    ///
    /// # Errors
    /// The stride is smaller than a descriptor, or the buffer does not hold a
    /// whole number of descriptors.
    pub fn parse(raw: &[u8], desc_size: usize, desc_version: u32) -> Result<Self, MemoryMapError> {
        if desc_size < MIN_DESCRIPTOR_SIZE {
            return Err(MemoryMapError::DescriptorTooSmall(desc_size));
        }
        if !raw.len().is_multiple_of(desc_size) {
            return Err(MemoryMapError::TrailingBytes {
                len: raw.len(),
                desc_size,
            });
        }
        if desc_version != DESCRIPTOR_VERSION {
            warn!("Unexpected EFI memory descriptor version {desc_version}, expected {DESCRIPTOR_VERSION}");
        }

        let descriptors = raw
            .chunks_exact(desc_size)
            // SAFETY: every chunk holds at least MIN_DESCRIPTOR_SIZE bytes.
            .map(|chunk| unsafe { read_unaligned(chunk.as_ptr().cast::<RawMemoryDescriptor>()) })
            .map(MemoryDescriptor::from_raw)
            .collect();

        Ok(Self {
            descriptors,
            desc_size,
            desc_version,
        })
    }

    /// Writes the descriptors back into a firmware-format table with the
    /// original stride. Bytes past the documented structure are left untouched.
    ///
    /// # Errors
    /// The buffer is too small for [`MemoryMap::map_size`] bytes.
    pub fn store(&self, raw: &mut [u8]) -> Result<(), MemoryMapError> {
        if raw.len() < self.map_size() {
            return Err(MemoryMapError::BufferTooSmall {
                len: raw.len(),
                needed: self.map_size(),
            });
        }

        for (chunk, md) in raw.chunks_exact_mut(self.desc_size).zip(&self.descriptors) {
            // SAFETY: every chunk holds at least MIN_DESCRIPTOR_SIZE bytes.
            unsafe { write_unaligned(chunk.as_mut_ptr().cast::<RawMemoryDescriptor>(), md.to_raw()) };
        }
        Ok(())
    }

    #[inline]
    #[must_use]
    pub const fn desc_size(&self) -> usize {
        self.desc_size
    }

    #[inline]
    #[must_use]
    pub const fn desc_version(&self) -> u32 {
        self.desc_version
    }

    /// Number of slots, including coalesced ones.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.descriptors.len()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Size of the firmware-format table in bytes.
    #[inline]
    #[must_use]
    pub const fn map_size(&self) -> usize {
        self.descriptors.len() * self.desc_size
    }

    /// All slots in firmware order.
    #[must_use]
    pub fn descriptors(&self) -> &[MemoryDescriptor] {
        &self.descriptors
    }

    pub(crate) fn descriptors_mut(&mut self) -> &mut [MemoryDescriptor] {
        &mut self.descriptors
    }

    pub fn live(&self) -> impl Iterator<Item = &MemoryDescriptor> {
        self.descriptors.iter().filter(|md| md.is_live())
    }

    pub(crate) fn live_mut(&mut self) -> impl Iterator<Item = &mut MemoryDescriptor> {
        self.descriptors.iter_mut().filter(|md| md.is_live())
    }

    /// Coalesces physically contiguous regions of identical type and attributes
    /// in a single left-to-right pass and returns the number of slots retired.
    ///
    /// Only the immediately preceding **live** slot is considered; the firmware
    /// order is preserved.
    pub fn merge_contiguous(&mut self) -> usize {
        let mut prev: Option<usize> = None;
        let mut merged = 0;

        for i in 0..self.descriptors.len() {
            let md = self.descriptors[i];
            if !md.is_live() {
                continue;
            }

            let Some(p) = prev else {
                prev = Some(i);
                continue;
            };

            let prev_md = &mut self.descriptors[p];
            if prev_md.ty != md.ty || prev_md.attribute != md.attribute {
                prev = Some(i);
                continue;
            }

            if md.phys_start == prev_md.end() {
                prev_md.page_count += md.page_count;
                self.descriptors[i].retire();
                merged += 1;
                continue;
            }

            prev = Some(i);
        }

        merged
    }

    /// First live region containing `addr`.
    #[must_use]
    pub fn find(&self, addr: PhysicalAddress) -> Option<&MemoryDescriptor> {
        self.live().find(|md| md.contains(addr))
    }

    /// Memory type of the live region containing `addr`, `None` outside all of them.
    #[must_use]
    pub fn lookup_type(&self, addr: PhysicalAddress) -> Option<MemoryType> {
        self.find(addr).map(MemoryDescriptor::ty)
    }

    /// Attributes of the live region containing `addr`, `None` outside all of them.
    #[must_use]
    pub fn lookup_attributes(&self, addr: PhysicalAddress) -> Option<MemoryAttribute> {
        self.find(addr).map(MemoryDescriptor::attribute)
    }

    /// Sum of the page counts of all live regions.
    #[must_use]
    pub fn live_pages(&self) -> u64 {
        self.live().map(MemoryDescriptor::page_count).sum()
    }

    /// Dumps every slot at debug level.
    pub fn log_descriptors(&self) {
        for (i, md) in self.descriptors.iter().enumerate() {
            debug!(
                "mem{i:02}: type={}, attr={:#x}, range=[{:#018x}-{:#018x}) ({}MB)",
                md.ty.0,
                md.attribute.bits(),
                md.phys_start.as_u64(),
                md.end().as_u64(),
                md.page_count >> (20 - EFI_PAGE_SHIFT)
            );
        }
    }
}
