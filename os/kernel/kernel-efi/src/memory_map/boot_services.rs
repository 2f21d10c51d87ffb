//! # Boot-Service Memory
//!
//! Firmware boot-service code and data must stay untouched until the
//! address-map call has been made, then it is handed back to the allocator.

use super::MemoryMap;
use super::legacy::{LegacyCategory, LegacyRegionTable};
use crate::addresses::PhysicalAddress;
use core::ops::Range;
use log::{debug, trace};

/// Early physical memory reservation service.
pub trait BootMemory {
    /// Marks `[start, end)` as in use before the general allocator runs.
    fn reserve_early(&mut self, start: PhysicalAddress, end: PhysicalAddress, label: &'static str);

    /// Reserves `[start, start + size)`. With `exclusive`, fails if any part
    /// of the range is already reserved.
    fn reserve(&mut self, start: PhysicalAddress, size: u64, exclusive: bool) -> bool;

    /// Returns `[start, start + size)` to the general allocator.
    fn free_late(&mut self, start: PhysicalAddress, size: u64);
}

/// Reserves every boot-service region so the allocator won't hand it out
/// before the firmware is done with it.
///
/// A region that touches the running kernel image, is not entirely RAM, or
/// cannot be reserved exclusively gets its page count zeroed. Such a region is
/// later neither mapped as boot-service memory nor freed.
pub fn reserve_boot_services<L, B>(map: &mut MemoryMap, kernel: &Range<PhysicalAddress>, legacy: &L, bootmem: &mut B)
where
    L: LegacyRegionTable + ?Sized,
    B: BootMemory + ?Sized,
{
    for md in map.live_mut().filter(|md| md.is_boot_services()) {
        let start = md.phys_start();
        let size = md.size();

        // The kernel image may sit in memory the firmware handed over as
        // boot-service data.
        if start + size >= kernel.start && start <= kernel.end {
            debug!("Skipping EFI boot-service region {start} overlapping the kernel image");
            md.clear_pages();
            continue;
        }

        if !legacy.all_mapped(start, start + size, LegacyCategory::Ram) {
            debug!("Skipping EFI boot-service region {start}: not entirely RAM");
            md.clear_pages();
            continue;
        }

        if !bootmem.reserve(start, size, true) {
            debug!("Could not reserve EFI boot-service region {start}");
            md.clear_pages();
        }
    }
}

/// Frees every boot-service region that is still backed by pages.
pub fn free_boot_services<B: BootMemory + ?Sized>(map: &MemoryMap, bootmem: &mut B) {
    for md in map.live().filter(|md| md.is_boot_services() && md.page_count() != 0) {
        trace!("Freeing EFI boot-service region {} ({} pages)", md.phys_start(), md.page_count());
        bootmem.free_late(md.phys_start(), md.size());
    }
}
