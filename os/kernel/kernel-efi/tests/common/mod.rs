//! Fake firmware and platform collaborators for the integration tests.
//!
//! The fake firmware lives in a heap arena. "Physical" addresses are the
//! arena's host addresses and every mapping is an identity mapping, so the
//! bridge can read and write the tables exactly as it would on hardware.

#![allow(dead_code)]

use kernel_efi::gateway::convention::{CallStage, PhysCallGate};
use kernel_efi::gateway::ffi::{RUNTIME_SERVICES_SIGNATURE, ResetType, Time, TimeCapabilities};
use kernel_efi::memory_map::boot_services::BootMemory;
use kernel_efi::memory_map::legacy::{LegacyCategory, LegacyRegionTable};
use kernel_efi::mapper::{AddressMapper, DirectMap, PageAttributes};
use kernel_efi::discovery::{ACPI_20_TABLE_GUID, SMBIOS3_TABLE_GUID, SYSTEM_TABLE_SIGNATURE};
use kernel_efi::{EfiConfig, Efi, MemoryMap, PhysicalAddress, Service, TableRevision, VirtualAddress};
use kernel_info::boot::{KernelBootInfo, MemoryMapInfo};
use std::cell::{Cell, RefCell};
use uefi::boot::{MemoryAttribute, MemoryType};
use uefi::{Char16, Guid, Status};

pub const OFF_SYSTAB: usize = 0;
pub const OFF_VENDOR: usize = 128;
pub const OFF_RUNTIME: usize = 384;
pub const OFF_CONFIG: usize = 576;
pub const OFF_MEMMAP: usize = 768;
pub const ARENA_SIZE: usize = 4096;

/// Padded descriptor stride, as real firmware commonly reports.
pub const DESC_SIZE: usize = 48;

pub const ACPI20_TABLE: u64 = 0x000E_0000;
pub const SMBIOS3_TABLE: u64 = 0x000F_0000;

pub const CONVENTIONAL_LO: u64 = 0x10_0000;
pub const CONVENTIONAL_HI: u64 = 0x11_0000;
pub const BOOT_CODE: u64 = 0x20_0000;
pub const BOOT_DATA: u64 = 0x30_0000;
pub const RUNTIME_CODE: u64 = 0x40_0000;
pub const ACPI_RECLAIM: u64 = 0x50_0000;
pub const MMIO: u64 = 0xFED0_0000;

/// Data of every variable the fake firmware returns.
pub const VARIABLE_VALUE: &[u8] = b"fake";

/// 2024-03-01 06:30:15
pub const FAKE_NOW: u64 = 1_709_274_615;

thread_local! {
    static CALLS: RefCell<Vec<Service>> = const { RefCell::new(Vec::new()) };
    static SVAM_STATUS: Cell<Status> = const { Cell::new(Status::SUCCESS) };
    static SVAM_CALLS: RefCell<Vec<SvamCall>> = const { RefCell::new(Vec::new()) };
    static SET_TIME: RefCell<Option<Time>> = const { RefCell::new(None) };
    static CLOCK: RefCell<Option<Time>> = const { RefCell::new(None) };
}

/// Arguments the fake `SetVirtualAddressMap()` received, plus the map it read.
#[derive(Clone, Debug)]
pub struct SvamCall {
    pub map_size: usize,
    pub desc_size: usize,
    pub desc_version: u32,
    pub map: u64,
    pub virtual_map: MemoryMap,
}

pub fn calls() -> Vec<Service> {
    CALLS.with_borrow(Clone::clone)
}

pub fn svam_calls() -> Vec<SvamCall> {
    SVAM_CALLS.with_borrow(Clone::clone)
}

pub fn last_set_time() -> Option<Time> {
    SET_TIME.with_borrow(|t| *t)
}

/// Makes the fake `GetTime()` report `time` instead of [`FAKE_NOW`].
pub fn set_clock(time: Time) {
    CLOCK.set(Some(time));
}

pub fn fail_svam_with(status: Status) {
    SVAM_STATUS.set(status);
}

/// Clears everything the fake firmware recorded on this thread.
pub fn reset_recorders() {
    CALLS.with_borrow_mut(Vec::clear);
    SVAM_CALLS.with_borrow_mut(Vec::clear);
    SVAM_STATUS.set(Status::SUCCESS);
    SET_TIME.set(None);
    CLOCK.set(None);
}

fn record(service: Service) {
    CALLS.with_borrow_mut(|c| c.push(service));
}

fn fake_time() -> Time {
    Time {
        year: 2024,
        month: 3,
        day: 1,
        hour: 6,
        minute: 30,
        second: 15,
        time_zone: Time::UNSPECIFIED_TIMEZONE,
        ..Time::default()
    }
}

unsafe extern "efiapi" fn fake_get_time(time: *mut Time, caps: *mut TimeCapabilities) -> Status {
    record(Service::GetTime);
    let now = CLOCK.with_borrow(|t| t.unwrap_or_else(fake_time));
    unsafe { time.write(now) };
    if !caps.is_null() {
        unsafe {
            (*caps).resolution = 1;
            (*caps).accuracy = 50_000_000;
        }
    }
    Status::SUCCESS
}

unsafe extern "efiapi" fn fake_set_time(time: *const Time) -> Status {
    record(Service::SetTime);
    let time = unsafe { *time };
    SET_TIME.set(Some(time));
    Status::SUCCESS
}

unsafe extern "efiapi" fn fake_set_virtual_address_map(
    map_size: usize,
    desc_size: usize,
    desc_version: u32,
    virtual_map: u64,
) -> Status {
    record(Service::SetVirtualAddressMap);
    let raw = unsafe { std::slice::from_raw_parts(virtual_map as usize as *const u8, map_size) };
    let parsed = MemoryMap::parse(raw, desc_size, desc_version).expect("firmware-format map");
    SVAM_CALLS.with_borrow_mut(|c| {
        c.push(SvamCall {
            map_size,
            desc_size,
            desc_version,
            map: virtual_map,
            virtual_map: parsed,
        });
    });
    SVAM_STATUS.get()
}

unsafe extern "efiapi" fn fake_get_variable(
    _name: *const Char16,
    _vendor: *const Guid,
    attributes: *mut u32,
    data_size: *mut usize,
    data: *mut u8,
) -> Status {
    record(Service::GetVariable);
    unsafe {
        if !attributes.is_null() {
            *attributes = 0x7;
        }
        if *data_size < VARIABLE_VALUE.len() {
            *data_size = VARIABLE_VALUE.len();
            return Status::BUFFER_TOO_SMALL;
        }
        std::ptr::copy_nonoverlapping(VARIABLE_VALUE.as_ptr(), data, VARIABLE_VALUE.len());
        *data_size = VARIABLE_VALUE.len();
    }
    Status::SUCCESS
}

unsafe extern "efiapi" fn fake_get_next_high_mono_count(count: *mut u32) -> Status {
    record(Service::GetNextHighMonoCount);
    unsafe { *count = 42 };
    Status::SUCCESS
}

unsafe extern "efiapi" fn fake_reset_system(_: ResetType, _: Status, _: usize, _: *const u8) {
    record(Service::ResetSystem);
}

unsafe extern "efiapi" fn fake_query_variable_info(
    _attributes: u32,
    max_storage_size: *mut u64,
    remaining_storage_size: *mut u64,
    max_variable_size: *mut u64,
) -> Status {
    record(Service::QueryVariableInfo);
    unsafe {
        *max_storage_size = 0x10000;
        *remaining_storage_size = 0x8000;
        *max_variable_size = 0x400;
    }
    Status::SUCCESS
}

/// Knobs for the fake firmware image.
#[derive(Copy, Clone, Debug)]
pub struct FirmwareOptions {
    pub revision: TableRevision,
    /// Whether the region holding the system table carries the runtime attribute.
    pub systab_in_runtime: bool,
    pub with_vendor: bool,
}

impl Default for FirmwareOptions {
    fn default() -> Self {
        Self {
            revision: TableRevision::from_parts(2, 70),
            systab_in_runtime: true,
            with_vendor: true,
        }
    }
}

/// A firmware image in host memory.
pub struct FakeFirmware {
    arena: *mut u64,
    desc_count: usize,
}

impl FakeFirmware {
    pub fn new(options: FirmwareOptions) -> Self {
        reset_recorders();
        let arena = Box::into_raw(vec![0u64; ARENA_SIZE / 8].into_boxed_slice()).cast::<u64>();
        let mut fw = Self { arena, desc_count: 0 };

        // System table
        fw.write(OFF_SYSTAB, SYSTEM_TABLE_SIGNATURE);
        fw.write(OFF_SYSTAB + 8, options.revision.into_bits());
        if options.with_vendor {
            fw.write(OFF_SYSTAB + 24, fw.addr(OFF_VENDOR));
        }
        fw.write(OFF_SYSTAB + 32, 0x0001_0000u32);
        fw.write(OFF_SYSTAB + 88, fw.addr(OFF_RUNTIME));
        fw.write(OFF_SYSTAB + 104, 2u64);
        fw.write(OFF_SYSTAB + 112, fw.addr(OFF_CONFIG));

        for (i, c) in "FakeFW".encode_utf16().chain([0]).enumerate() {
            fw.write(OFF_VENDOR + 2 * i, c);
        }

        // Runtime services table
        fw.write(OFF_RUNTIME, RUNTIME_SERVICES_SIGNATURE);
        fw.write(OFF_RUNTIME + 8, options.revision.into_bits());
        fw.write(OFF_RUNTIME + 12, 136u32);
        let entries: [(Service, usize); 8] = [
            (Service::GetTime, fake_get_time as usize),
            (Service::SetTime, fake_set_time as usize),
            (Service::SetVirtualAddressMap, fake_set_virtual_address_map as usize),
            (Service::GetVariable, fake_get_variable as usize),
            (Service::GetNextHighMonoCount, fake_get_next_high_mono_count as usize),
            (Service::ResetSystem, fake_reset_system as usize),
            (Service::QueryVariableInfo, fake_query_variable_info as usize),
            (Service::UpdateCapsule, 0),
        ];
        for (service, addr) in entries {
            fw.write(OFF_RUNTIME + service.table_offset(), addr as u64);
        }

        // Configuration tables
        fw.write(OFF_CONFIG, ACPI_20_TABLE_GUID.to_bytes());
        fw.write(OFF_CONFIG + 16, ACPI20_TABLE);
        fw.write(OFF_CONFIG + 24, SMBIOS3_TABLE_GUID.to_bytes());
        fw.write(OFF_CONFIG + 40, SMBIOS3_TABLE);

        // Memory map
        let wb = MemoryAttribute::WRITE_BACK;
        let rt = MemoryAttribute::RUNTIME;
        fw.push_descriptor(MemoryType::CONVENTIONAL, CONVENTIONAL_LO, 16, wb);
        fw.push_descriptor(MemoryType::CONVENTIONAL, CONVENTIONAL_HI, 16, wb);
        fw.push_descriptor(MemoryType::BOOT_SERVICES_CODE, BOOT_CODE, 4, wb);
        fw.push_descriptor(MemoryType::BOOT_SERVICES_DATA, BOOT_DATA, 8, wb);
        fw.push_descriptor(MemoryType::RUNTIME_SERVICES_CODE, RUNTIME_CODE, 4, wb | rt);
        fw.push_descriptor(MemoryType::MMIO, MMIO, 1, MemoryAttribute::UNCACHEABLE | rt);
        let (arena_start, arena_pages) = fw.arena_region();
        if options.systab_in_runtime {
            fw.push_descriptor(MemoryType::RUNTIME_SERVICES_DATA, arena_start, arena_pages, wb | rt);
        } else {
            fw.push_descriptor(MemoryType::LOADER_DATA, arena_start, arena_pages, wb);
        }
        fw.push_descriptor(MemoryType::ACPI_RECLAIM, ACPI_RECLAIM, 2, wb);

        fw
    }

    fn write<T>(&mut self, offset: usize, value: T) {
        assert!(offset + size_of::<T>() <= ARENA_SIZE);
        unsafe { self.arena.cast::<u8>().add(offset).cast::<T>().write_unaligned(value) };
    }

    fn push_descriptor(&mut self, ty: MemoryType, start: u64, pages: u64, attr: MemoryAttribute) {
        let offset = OFF_MEMMAP + self.desc_count * DESC_SIZE;
        self.write(offset, ty.0);
        self.write(offset + 8, start);
        self.write(offset + 16, 0u64);
        self.write(offset + 24, pages);
        self.write(offset + 32, attr.bits());
        // Vendor padding past the documented structure.
        self.write(offset + 40, 0xDEAD_BEEF_u64);
        self.desc_count += 1;
    }

    /// Host address of `offset` inside the arena.
    pub fn addr(&self, offset: usize) -> u64 {
        self.arena as usize as u64 + offset as u64
    }

    pub fn systab(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.addr(OFF_SYSTAB))
    }

    pub fn memmap(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.addr(OFF_MEMMAP))
    }

    pub fn memmap_len(&self) -> u64 {
        (self.desc_count * DESC_SIZE) as u64
    }

    /// Page-aligned region covering the whole arena.
    pub fn arena_region(&self) -> (u64, u64) {
        let start = self.addr(0) & !0xFFF;
        let end = (self.addr(ARENA_SIZE) + 0xFFF) & !0xFFF;
        (start, (end - start) >> 12)
    }

    pub fn boot_info(&self) -> KernelBootInfo {
        KernelBootInfo {
            mmap: MemoryMapInfo {
                mmap_ptr: self.memmap().as_u64(),
                mmap_len: self.memmap_len(),
                mmap_desc_size: DESC_SIZE as u64,
                mmap_desc_version: 1,
            },
            efi_systab: self.systab().as_u64(),
        }
    }

    /// Raw bytes of descriptor `index` in the firmware-format table.
    pub fn raw_descriptor(&self, index: usize) -> [u8; DESC_SIZE] {
        let mut out = [0u8; DESC_SIZE];
        let offset = OFF_MEMMAP + index * DESC_SIZE;
        unsafe {
            std::ptr::copy_nonoverlapping(self.arena.cast::<u8>().add(offset), out.as_mut_ptr(), DESC_SIZE);
        }
        out
    }
}

impl Drop for FakeFirmware {
    fn drop(&mut self) {
        let slice = std::ptr::slice_from_raw_parts_mut(self.arena, ARENA_SIZE / 8);
        drop(unsafe { Box::from_raw(slice) });
    }
}

/// Records every enter/exit of the physical-mode convention.
#[derive(Default)]
pub struct MockGate {
    pub events: RefCell<Vec<(&'static str, CallStage)>>,
    pub depth: Cell<i32>,
    pub prepared: Cell<usize>,
}

impl MockGate {
    pub fn enters(&self) -> usize {
        self.events.borrow().iter().filter(|(e, _)| *e == "enter").count()
    }

    pub fn is_balanced(&self) -> bool {
        let events = self.events.borrow();
        self.depth.get() == 0
            && events.chunks(2).all(|pair| {
                pair.len() == 2 && pair[0].0 == "enter" && pair[1].0 == "exit" && pair[0].1 == pair[1].1
            })
    }
}

impl PhysCallGate for MockGate {
    fn enter(&self, stage: CallStage) {
        self.depth.set(self.depth.get() + 1);
        self.events.borrow_mut().push(("enter", stage));
    }

    fn exit(&self, stage: CallStage) {
        self.depth.set(self.depth.get() - 1);
        self.events.borrow_mut().push(("exit", stage));
    }

    fn prepare_physical_mode(&self) {
        self.prepared.set(self.prepared.get() + 1);
    }
}

/// Identity mapper with an empty direct map, so every runtime region goes
/// through `map_physical`.
#[derive(Default)]
pub struct MockMapper {
    pub refuse_early: Vec<u64>,
    pub refuse_map: Vec<u64>,
    pub mapped: Vec<(u64, u64, MemoryType)>,
    pub early_maps: Vec<(u64, u64)>,
    pub early_unmaps: Vec<(u64, u64)>,
}

impl MockMapper {
    pub fn live_early_mappings(&self) -> usize {
        self.early_maps.len() - self.early_unmaps.len()
    }
}

unsafe impl AddressMapper for MockMapper {
    fn direct_map(&self) -> DirectMap {
        DirectMap::new(0, PhysicalAddress::zero(), PhysicalAddress::zero())
    }

    fn map_physical(&mut self, start: PhysicalAddress, size: u64, ty: MemoryType) -> Option<VirtualAddress> {
        if self.refuse_map.contains(&start.as_u64()) {
            return None;
        }
        self.mapped.push((start.as_u64(), size, ty));
        Some(VirtualAddress::new(start.as_u64()))
    }

    fn early_map(&mut self, start: PhysicalAddress, size: u64) -> Option<VirtualAddress> {
        if self.refuse_early.contains(&start.as_u64()) {
            return None;
        }
        self.early_maps.push((start.as_u64(), size));
        Some(VirtualAddress::new(start.as_u64()))
    }

    fn early_unmap(&mut self, va: VirtualAddress, size: u64) {
        self.early_unmaps.push((va.as_u64(), size));
    }
}

#[derive(Default)]
pub struct MockAttrs {
    pub nx: bool,
    pub uncached: Vec<(u64, u64)>,
    pub executable: Vec<(u64, u64)>,
    pub non_executable: Vec<(u64, u64)>,
}

impl PageAttributes for MockAttrs {
    fn nx_supported(&self) -> bool {
        self.nx
    }

    fn set_uncached(&mut self, va: VirtualAddress, pages: u64) {
        self.uncached.push((va.as_u64(), pages));
    }

    fn set_executable(&mut self, va: VirtualAddress, pages: u64) {
        self.executable.push((va.as_u64(), pages));
    }

    fn set_non_executable(&mut self, va: VirtualAddress, pages: u64) {
        self.non_executable.push((va.as_u64(), pages));
    }
}

#[derive(Default)]
pub struct MockBootMemory {
    pub early: Vec<(u64, u64, &'static str)>,
    pub reserved: Vec<(u64, u64)>,
    pub freed: Vec<(u64, u64)>,
}

impl BootMemory for MockBootMemory {
    fn reserve_early(&mut self, start: PhysicalAddress, end: PhysicalAddress, label: &'static str) {
        self.early.push((start.as_u64(), end.as_u64(), label));
    }

    fn reserve(&mut self, start: PhysicalAddress, size: u64, _exclusive: bool) -> bool {
        self.reserved.push((start.as_u64(), size));
        true
    }

    fn free_late(&mut self, start: PhysicalAddress, size: u64) {
        self.freed.push((start.as_u64(), size));
    }
}

/// Legacy table that treats everything as RAM.
#[derive(Default)]
pub struct MockLegacy {
    pub regions: Vec<(u64, u64, LegacyCategory)>,
    pub sanitized: usize,
}

impl LegacyRegionTable for MockLegacy {
    fn add_region(&mut self, start: PhysicalAddress, size: u64, category: LegacyCategory) {
        self.regions.push((start.as_u64(), size, category));
    }

    fn all_mapped(&self, _start: PhysicalAddress, _end: PhysicalAddress, category: LegacyCategory) -> bool {
        category == LegacyCategory::Ram
    }

    fn sanitize(&mut self) {
        self.sanitized += 1;
    }
}

/// All platform collaborators of one boot.
#[derive(Default)]
pub struct Platform {
    pub mapper: MockMapper,
    pub attrs: MockAttrs,
    pub bootmem: MockBootMemory,
    pub legacy: MockLegacy,
}

/// A kernel image far away from every fake firmware region.
pub fn kernel_image() -> std::ops::Range<PhysicalAddress> {
    PhysicalAddress::new(0x100_0000)..PhysicalAddress::new(0x180_0000)
}

/// Firmware, platform and an initialized bridge in `PhysicalFull`.
pub fn booted(options: FirmwareOptions, config: EfiConfig) -> (FakeFirmware, Platform, Efi<MockGate>) {
    let fw = FakeFirmware::new(options);
    let mut platform = Platform::default();
    let mut efi = Efi::new(config, MockGate::default());
    efi.init(&fw.boot_info(), &mut platform.mapper, &mut platform.legacy)
        .expect("init");
    efi.reserve_early(&mut platform.bootmem);
    efi.reserve_boot_services(&kernel_image(), &platform.legacy, &mut platform.bootmem);
    (fw, platform, efi)
}
