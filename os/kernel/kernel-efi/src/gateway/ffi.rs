//! Firmware ABI of the runtime-services table.
//!
//! Everything in here is laid out exactly as firmware expects it. Boolean
//! and enumerated fields written by firmware are kept as raw integers so an
//! out-of-range value can never produce an invalid Rust value.

use core::mem::transmute;
use uefi::{Char16, Guid, Status};

/// `"RUNTSERV"` in the runtime-services table header.
pub const RUNTIME_SERVICES_SIGNATURE: u64 = 0x5652_4553_544e_5552;

/// Size of the table header preceding the service pointers.
pub const TABLE_HEADER_SIZE: usize = 24;

/// Number of pointer slots in the runtime-services table.
pub const RUNTIME_SLOTS: usize = 14;

/// Size of a complete (revision 2.00+) runtime-services table.
pub const RUNTIME_TABLE_SIZE: usize = TABLE_HEADER_SIZE + RUNTIME_SLOTS * size_of::<u64>();

/// Calendar time as kept by the platform clock.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Time {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub pad1: u8,
    pub nanosecond: u32,
    /// Offset from UTC in minutes, or [`Time::UNSPECIFIED_TIMEZONE`].
    pub time_zone: i16,
    pub daylight: u8,
    pub pad2: u8,
}

impl Time {
    pub const UNSPECIFIED_TIMEZONE: i16 = 0x07FF;
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TimeCapabilities {
    /// Clock resolution in counts per second.
    pub resolution: u32,
    /// Accuracy in parts per million, times 10^6.
    pub accuracy: u32,
    sets_to_zero: u8,
}

impl TimeCapabilities {
    /// Whether setting the time clears sub-resolution fractions.
    #[must_use]
    pub const fn sets_to_zero(&self) -> bool {
        self.sets_to_zero != 0
    }
}

/// `EFI_RESET_TYPE`.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct ResetType(pub u32);

impl ResetType {
    pub const COLD: Self = Self(0);
    pub const WARM: Self = Self(1);
    pub const SHUTDOWN: Self = Self(2);
    pub const PLATFORM_SPECIFIC: Self = Self(3);
}

/// Header of a firmware update capsule.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CapsuleHeader {
    pub capsule_guid: Guid,
    pub header_size: u32,
    pub flags: u32,
    pub capsule_image_size: u32,
}

pub type GetTimeFn = unsafe extern "efiapi" fn(time: *mut Time, caps: *mut TimeCapabilities) -> Status;
pub type SetTimeFn = unsafe extern "efiapi" fn(time: *const Time) -> Status;
pub type GetWakeupTimeFn = unsafe extern "efiapi" fn(enabled: *mut u8, pending: *mut u8, time: *mut Time) -> Status;
pub type SetWakeupTimeFn = unsafe extern "efiapi" fn(enable: u8, time: *const Time) -> Status;
pub type SetVirtualAddressMapFn =
    unsafe extern "efiapi" fn(map_size: usize, desc_size: usize, desc_version: u32, virtual_map: u64) -> Status;
pub type GetVariableFn = unsafe extern "efiapi" fn(
    name: *const Char16,
    vendor: *const Guid,
    attributes: *mut u32,
    data_size: *mut usize,
    data: *mut u8,
) -> Status;
pub type GetNextVariableNameFn =
    unsafe extern "efiapi" fn(name_size: *mut usize, name: *mut u16, vendor: *mut Guid) -> Status;
pub type SetVariableFn = unsafe extern "efiapi" fn(
    name: *const Char16,
    vendor: *const Guid,
    attributes: u32,
    data_size: usize,
    data: *const u8,
) -> Status;
pub type GetNextHighMonoCountFn = unsafe extern "efiapi" fn(count: *mut u32) -> Status;
pub type ResetSystemFn =
    unsafe extern "efiapi" fn(reset_type: ResetType, status: Status, data_size: usize, data: *const u8);
pub type UpdateCapsuleFn = unsafe extern "efiapi" fn(
    capsules: *const *const CapsuleHeader,
    capsule_count: usize,
    scatter_gather_list: u64,
) -> Status;
pub type QueryCapsuleCapabilitiesFn = unsafe extern "efiapi" fn(
    capsules: *const *const CapsuleHeader,
    capsule_count: usize,
    max_capsule_size: *mut u64,
    reset_type: *mut ResetType,
) -> Status;
pub type QueryVariableInfoFn = unsafe extern "efiapi" fn(
    attributes: u32,
    max_storage_size: *mut u64,
    remaining_storage_size: *mut u64,
    max_variable_size: *mut u64,
) -> Status;

/// A firmware function pointer type that can be rebuilt from a raw table slot.
pub trait EntryPoint: Copy {
    /// # Safety
    /// `addr` must be the non-zero address of a function with this signature,
    /// callable in the current addressing mode.
    unsafe fn from_addr(addr: u64) -> Self;
}

macro_rules! entry_points {
    ($($ty:ty),* $(,)?) => {
        $(
            impl EntryPoint for $ty {
                #[allow(clippy::cast_possible_truncation)]
                unsafe fn from_addr(addr: u64) -> Self {
                    // SAFETY: forwarded to the caller.
                    unsafe { transmute::<usize, Self>(addr as usize) }
                }
            }
        )*
    };
}

entry_points!(
    GetTimeFn,
    SetTimeFn,
    GetWakeupTimeFn,
    SetWakeupTimeFn,
    SetVirtualAddressMapFn,
    GetVariableFn,
    GetNextVariableNameFn,
    SetVariableFn,
    GetNextHighMonoCountFn,
    ResetSystemFn,
    UpdateCapsuleFn,
    QueryCapsuleCapabilitiesFn,
    QueryVariableInfoFn,
);

const _: () = {
    assert!(size_of::<Time>() == 16);
    assert!(size_of::<TimeCapabilities>() == 12);
    assert!(size_of::<CapsuleHeader>() == 28);
    assert!(RUNTIME_TABLE_SIZE == 136);
};
