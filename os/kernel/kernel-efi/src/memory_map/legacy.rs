//! # Legacy Region Table
//!
//! The rest of the kernel consumes a coarse, e820-style region table. The
//! firmware map is translated into it one descriptor at a time; the legacy
//! category is never written back into the firmware map.

use super::{MemoryDescriptor, MemoryMap};
use crate::addresses::PhysicalAddress;
use uefi::boot::{MemoryAttribute, MemoryType};

/// Coarse region categories of the legacy table.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum LegacyCategory {
    Ram = 1,
    Reserved = 2,
    Acpi = 3,
    Nvs = 4,
    Unusable = 5,
}

/// Sink for legacy region insertions, owned by the kernel's memory setup.
pub trait LegacyRegionTable {
    /// Appends `[start, start + size)` with the given category.
    fn add_region(&mut self, start: PhysicalAddress, size: u64, category: LegacyCategory);

    /// Whether `[start, end)` is entirely covered by regions of `category`.
    fn all_mapped(&self, start: PhysicalAddress, end: PhysicalAddress, category: LegacyCategory) -> bool;

    /// Sorts and merges the table. Runs once, after all insertions.
    fn sanitize(&mut self);
}

/// Maps a firmware region onto its legacy category.
///
/// Loader, boot-service and conventional memory is only usable RAM when it
/// can be cached write-back.
#[must_use]
pub fn classify_for_legacy_map(md: &MemoryDescriptor) -> LegacyCategory {
    match md.ty() {
        MemoryType::LOADER_CODE
        | MemoryType::LOADER_DATA
        | MemoryType::BOOT_SERVICES_CODE
        | MemoryType::BOOT_SERVICES_DATA
        | MemoryType::CONVENTIONAL => {
            if md.attribute().contains(MemoryAttribute::WRITE_BACK) {
                LegacyCategory::Ram
            } else {
                LegacyCategory::Reserved
            }
        }
        MemoryType::ACPI_RECLAIM => LegacyCategory::Acpi,
        MemoryType::ACPI_NON_VOLATILE => LegacyCategory::Nvs,
        MemoryType::UNUSABLE => LegacyCategory::Unusable,
        _ => LegacyCategory::Reserved,
    }
}

/// Feeds every live descriptor into `table`, then sanitizes it.
pub fn populate_legacy_table<T: LegacyRegionTable + ?Sized>(map: &MemoryMap, table: &mut T) {
    for md in map.live() {
        table.add_region(md.phys_start(), md.size(), classify_for_legacy_map(md));
    }
    table.sanitize();
}
