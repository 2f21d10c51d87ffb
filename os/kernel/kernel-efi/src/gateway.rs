//! # Runtime Service Call Gateway
//!
//! [`RuntimeServices`] presents one fixed set of firmware operations no
//! matter which calling convention is current. The entry-point table behind
//! it is swapped exactly once, from the firmware's physical addresses to the
//! kernel-assigned virtual ones, and callers only ever hold the gateway.
//!
//! ```text
//!                      ┌──────────────────────┐
//!   get_time() ──────► │   RuntimeServices    │
//!                      └──────────┬───────────┘
//!               Binding::Physical │ Binding::Virtual
//!             ┌───────────────────┴──────────────────┐
//!             ▼                                      ▼
//!   ConventionGuard::enter                  direct call through
//!   call firmware (identity addr.)          kernel-assigned address
//!   ConventionGuard drop → exit
//! ```
//!
//! Capsule and variable-info services only exist from revision 2.00 on and
//! report `UNSUPPORTED` on older firmware without calling it.

pub mod convention;
pub mod ffi;

use crate::addresses::PhysicalAddress;
use crate::revision::TableRevision;
use convention::{CallStage, ConventionGuard, PhysCallGate};
use core::ptr;
use ffi::{
    CapsuleHeader, EntryPoint, GetNextHighMonoCountFn, GetNextVariableNameFn, GetTimeFn, GetVariableFn,
    GetWakeupTimeFn, QueryCapsuleCapabilitiesFn, QueryVariableInfoFn, RUNTIME_SLOTS, ResetSystemFn, ResetType,
    SetTimeFn, SetVariableFn, SetVirtualAddressMapFn, SetWakeupTimeFn, TABLE_HEADER_SIZE, Time, TimeCapabilities,
    UpdateCapsuleFn,
};
use log::trace;
use uefi::{CStr16, Guid, Status};

/// Logical firmware runtime operations.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Service {
    GetTime,
    SetTime,
    GetWakeupTime,
    SetWakeupTime,
    SetVirtualAddressMap,
    GetVariable,
    GetNextVariable,
    SetVariable,
    GetNextHighMonoCount,
    ResetSystem,
    UpdateCapsule,
    QueryCapsuleCaps,
    QueryVariableInfo,
}

impl Service {
    /// Index of the pointer slot in the runtime-services table.
    ///
    /// Slot 5 holds `ConvertPointer`, which the kernel never calls.
    #[must_use]
    pub const fn slot(self) -> usize {
        match self {
            Self::GetTime => 0,
            Self::SetTime => 1,
            Self::GetWakeupTime => 2,
            Self::SetWakeupTime => 3,
            Self::SetVirtualAddressMap => 4,
            Self::GetVariable => 6,
            Self::GetNextVariable => 7,
            Self::SetVariable => 8,
            Self::GetNextHighMonoCount => 9,
            Self::ResetSystem => 10,
            Self::UpdateCapsule => 11,
            Self::QueryCapsuleCaps => 12,
            Self::QueryVariableInfo => 13,
        }
    }

    /// Byte offset of the pointer slot in the runtime-services table.
    #[must_use]
    pub const fn table_offset(self) -> usize {
        TABLE_HEADER_SIZE + self.slot() * size_of::<u64>()
    }

    /// Lowest firmware revision that provides this service.
    #[must_use]
    pub const fn min_revision(self) -> TableRevision {
        match self {
            Self::UpdateCapsule | Self::QueryCapsuleCaps | Self::QueryVariableInfo => TableRevision::EFI_2_00,
            _ => TableRevision::EFI_1_00,
        }
    }
}

/// Raw entry-point addresses of the runtime services, valid in exactly one
/// addressing mode.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ServiceEntryPoints {
    slots: [u64; RUNTIME_SLOTS],
}

impl ServiceEntryPoints {
    /// Reads the pointer slots from a runtime-services table.
    ///
    /// A truncated table leaves the missing slots empty.
    #[must_use]
    pub fn from_table(table: &[u8]) -> Self {
        let mut slots = [0u64; RUNTIME_SLOTS];
        for (i, slot) in slots.iter_mut().enumerate() {
            let offset = TABLE_HEADER_SIZE + i * size_of::<u64>();
            if let Some(bytes) = table.get(offset..offset + size_of::<u64>()) {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                *slot = u64::from_le_bytes(raw);
            }
        }
        Self { slots }
    }

    /// Reads the pointer slots from a runtime-services table in mapped memory.
    ///
    /// # Safety
    /// `table` must point to a readable runtime-services table of
    /// [`ffi::RUNTIME_TABLE_SIZE`] bytes.
    #[must_use]
    pub unsafe fn from_ptr(table: *const u8) -> Self {
        // SAFETY: forwarded to the caller.
        let bytes = unsafe { core::slice::from_raw_parts(table, ffi::RUNTIME_TABLE_SIZE) };
        Self::from_table(bytes)
    }

    #[must_use]
    pub const fn get(&self, service: Service) -> u64 {
        self.slots[service.slot()]
    }

    pub const fn set(&mut self, service: Service, addr: u64) {
        self.slots[service.slot()] = addr;
    }
}

/// Which entry-point table and convention the gateway currently uses.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Binding {
    Unbound,
    Physical(CallStage),
    Virtual,
}

impl Binding {
    /// Whether `service` may be called under this binding.
    #[must_use]
    pub const fn permits(self, service: Service) -> bool {
        match (self, service) {
            (Self::Unbound, _) => false,
            (Self::Physical(CallStage::Early), Service::GetTime | Service::SetVirtualAddressMap) => true,
            (Self::Physical(CallStage::Early), _) => false,
            (Self::Physical(CallStage::Full), _) => true,
            (Self::Physical(CallStage::Permanent) | Self::Virtual, Service::SetVirtualAddressMap) => false,
            (Self::Physical(CallStage::Permanent) | Self::Virtual, _) => true,
        }
    }
}

/// The firmware runtime services, callable in whichever mode is bound.
pub struct RuntimeServices<G> {
    gate: G,
    revision: TableRevision,
    physical: ServiceEntryPoints,
    virt: ServiceEntryPoints,
    binding: Binding,
}

impl<G: PhysCallGate> RuntimeServices<G> {
    /// An unbound gateway; every call reports `UNSUPPORTED`.
    pub const fn new(gate: G) -> Self {
        Self {
            gate,
            revision: TableRevision::new(),
            physical: ServiceEntryPoints { slots: [0; RUNTIME_SLOTS] },
            virt: ServiceEntryPoints { slots: [0; RUNTIME_SLOTS] },
            binding: Binding::Unbound,
        }
    }

    #[must_use]
    pub const fn binding(&self) -> Binding {
        self.binding
    }

    #[must_use]
    pub const fn revision(&self) -> TableRevision {
        self.revision
    }

    #[must_use]
    pub const fn gate(&self) -> &G {
        &self.gate
    }

    pub(crate) const fn bind_physical(&mut self, revision: TableRevision, entries: ServiceEntryPoints) {
        self.revision = revision;
        self.physical = entries;
        self.binding = Binding::Physical(CallStage::Early);
    }

    pub(crate) const fn set_stage(&mut self, stage: CallStage) {
        self.binding = Binding::Physical(stage);
    }

    pub(crate) const fn bind_virtual(&mut self, entries: ServiceEntryPoints) {
        self.virt = entries;
        self.binding = Binding::Virtual;
    }

    /// Whether `service` would reach firmware right now.
    #[must_use]
    pub fn is_available(&self, service: Service) -> bool {
        self.revision >= service.min_revision() && self.binding.permits(service) && self.entry(service) != 0
    }

    fn entry(&self, service: Service) -> u64 {
        match self.binding {
            Binding::Unbound => 0,
            Binding::Physical(_) => self.physical.get(service),
            Binding::Virtual => self.virt.get(service),
        }
    }

    /// Resolves `service` and hands its entry point to `call` under the
    /// current convention.
    fn invoke<F: EntryPoint>(&self, service: Service, call: impl FnOnce(F) -> Status) -> Status {
        if !self.is_available(service) {
            trace!("EFI runtime service {service:?} unavailable");
            return Status::UNSUPPORTED;
        }

        // SAFETY: the address was published by firmware for this slot and
        // the binding matches the mode it is valid in.
        let f = unsafe { F::from_addr(self.entry(service)) };
        match self.binding {
            Binding::Physical(stage) => self.call_physical(stage, f, call),
            Binding::Virtual => Self::call_virtual(f, call),
            Binding::Unbound => Status::UNSUPPORTED,
        }
    }

    fn call_physical<F>(&self, stage: CallStage, f: F, call: impl FnOnce(F) -> Status) -> Status {
        let _convention = ConventionGuard::enter(&self.gate, stage);
        call(f)
    }

    fn call_virtual<F>(f: F, call: impl FnOnce(F) -> Status) -> Status {
        call(f)
    }

    pub fn get_time(&self, time: &mut Time, caps: Option<&mut TimeCapabilities>) -> Status {
        let caps = caps.map_or(ptr::null_mut(), ptr::from_mut);
        self.invoke(Service::GetTime, |f: GetTimeFn| {
            // SAFETY: both pointers are valid for the duration of the call.
            unsafe { f(time, caps) }
        })
    }

    pub fn set_time(&self, time: &Time) -> Status {
        self.invoke(Service::SetTime, |f: SetTimeFn| {
            // SAFETY: `time` is valid for the duration of the call.
            unsafe { f(time) }
        })
    }

    pub fn get_wakeup_time(&self, enabled: &mut bool, pending: &mut bool, time: &mut Time) -> Status {
        let (mut en, mut pe) = (0u8, 0u8);
        let status = self.invoke(Service::GetWakeupTime, |f: GetWakeupTimeFn| {
            // SAFETY: all pointers are valid for the duration of the call.
            unsafe { f(&raw mut en, &raw mut pe, time) }
        });
        *enabled = en != 0;
        *pending = pe != 0;
        status
    }

    pub fn set_wakeup_time(&self, enabled: bool, time: Option<&Time>) -> Status {
        let time = time.map_or(ptr::null(), ptr::from_ref);
        self.invoke(Service::SetWakeupTime, |f: SetWakeupTimeFn| {
            // SAFETY: `time` is null or valid for the duration of the call.
            unsafe { f(u8::from(enabled), time) }
        })
    }

    /// Hands firmware the virtual addresses of its runtime regions.
    ///
    /// `map` is the **physical** address of the memory map in firmware format.
    pub fn set_virtual_address_map(
        &self,
        map_size: usize,
        desc_size: usize,
        desc_version: u32,
        map: PhysicalAddress,
    ) -> Status {
        self.invoke(
            Service::SetVirtualAddressMap,
            |f: SetVirtualAddressMapFn| {
                // SAFETY: firmware reads `map_size` bytes at `map` in its own
                // identity address space.
                unsafe { f(map_size, desc_size, desc_version, map.as_u64()) }
            },
        )
    }

    /// Reads a variable into `data`. On return `data_size` holds the size of
    /// the variable, which may exceed `data.len()` with `BUFFER_TOO_SMALL`.
    pub fn get_variable(
        &self,
        name: &CStr16,
        vendor: &Guid,
        attributes: Option<&mut u32>,
        data: &mut [u8],
        data_size: &mut usize,
    ) -> Status {
        let attributes = attributes.map_or(ptr::null_mut(), ptr::from_mut);
        let mut size = data.len();
        let status = self.invoke(Service::GetVariable, |f: GetVariableFn| {
            // SAFETY: `data` holds `size` writable bytes; the rest is valid
            // for the duration of the call.
            unsafe { f(name.as_ptr(), vendor, attributes, &raw mut size, data.as_mut_ptr()) }
        });
        *data_size = size;
        status
    }

    /// Advances `name`/`vendor` to the next variable.
    ///
    /// `name_size` is in bytes and is clamped to the buffer on entry.
    pub fn get_next_variable(&self, name_size: &mut usize, name: &mut [u16], vendor: &mut Guid) -> Status {
        *name_size = (*name_size).min(size_of_val(name));
        self.invoke(Service::GetNextVariable, |f: GetNextVariableNameFn| {
            // SAFETY: `name` holds at least `name_size` writable bytes.
            unsafe { f(name_size, name.as_mut_ptr(), vendor) }
        })
    }

    pub fn set_variable(&self, name: &CStr16, vendor: &Guid, attributes: u32, data: &[u8]) -> Status {
        self.invoke(Service::SetVariable, |f: SetVariableFn| {
            // SAFETY: all pointers are valid for the duration of the call.
            unsafe { f(name.as_ptr(), vendor, attributes, data.len(), data.as_ptr()) }
        })
    }

    pub fn get_next_high_mono_count(&self, count: &mut u32) -> Status {
        self.invoke(Service::GetNextHighMonoCount, |f: GetNextHighMonoCountFn| {
            // SAFETY: `count` is valid for the duration of the call.
            unsafe { f(count) }
        })
    }

    /// Resets the platform. Only returns if the service is unavailable or
    /// firmware ignored the request.
    pub fn reset_system(&self, reset_type: ResetType, status: Status, data: &[u8]) -> Status {
        self.invoke(Service::ResetSystem, |f: ResetSystemFn| {
            // SAFETY: `data` is valid for the duration of the call.
            unsafe { f(reset_type, status, data.len(), data.as_ptr()) };
            Status::DEVICE_ERROR
        })
    }

    pub fn update_capsule(&self, capsules: &[&CapsuleHeader], scatter_gather_list: PhysicalAddress) -> Status {
        self.invoke(Service::UpdateCapsule, |f: UpdateCapsuleFn| {
            // SAFETY: `&CapsuleHeader` has the layout of `*const CapsuleHeader`.
            unsafe {
                f(
                    capsules.as_ptr().cast::<*const CapsuleHeader>(),
                    capsules.len(),
                    scatter_gather_list.as_u64(),
                )
            }
        })
    }

    pub fn query_capsule_caps(
        &self,
        capsules: &[&CapsuleHeader],
        max_capsule_size: &mut u64,
        reset_type: &mut ResetType,
    ) -> Status {
        self.invoke(
            Service::QueryCapsuleCaps,
            |f: QueryCapsuleCapabilitiesFn| {
                // SAFETY: see `update_capsule`; out-pointers are valid.
                unsafe {
                    f(
                        capsules.as_ptr().cast::<*const CapsuleHeader>(),
                        capsules.len(),
                        max_capsule_size,
                        reset_type,
                    )
                }
            },
        )
    }

    pub fn query_variable_info(
        &self,
        attributes: u32,
        max_storage_size: &mut u64,
        remaining_storage_size: &mut u64,
        max_variable_size: &mut u64,
    ) -> Status {
        self.invoke(Service::QueryVariableInfo, |f: QueryVariableInfoFn| {
            // SAFETY: out-pointers are valid for the duration of the call.
            unsafe { f(attributes, max_storage_size, remaining_storage_size, max_variable_size) }
        })
    }
}
