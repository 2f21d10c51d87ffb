//! # Memory Layout

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything mapped at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Physical addresses at or above this boundary belong to the **high** direct-map
/// window; below it, to the **low** one. The two windows are populated separately
/// during early boot, so a range is only reachable through the direct map if it
/// lies entirely within one of them.
pub const DIRECT_MAP_HIGH_START: u64 = 0x1_0000_0000; // 4 GiB

const _: () = {
    assert!(HHDM_BASE % DIRECT_MAP_HIGH_START == 0);
    assert!(DIRECT_MAP_HIGH_START.is_power_of_two());
};
