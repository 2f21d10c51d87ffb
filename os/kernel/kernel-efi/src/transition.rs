//! # Mode Transition Controller
//!
//! [`Efi`] owns the bridge state for the life of the system: the discovered
//! system table, the kernel's copy of the memory map and the runtime-services
//! gateway. It drives the one-way switch from firmware physical addressing to
//! kernel-assigned virtual addresses.
//!
//! ```text
//!  Uninitialized ──init()──► PhysicalEarly ──(memory map)──► PhysicalFull
//!                                  │                             │
//!                                  │              enter_virtual_mode()
//!                                  │                             ▼
//!                                  │                       VirtualActive
//!                                  │                             │ (fatal)
//!                                  ├── setup_physical_mode() ◄───┤
//!                                  ▼                             ▼
//!                             PhysicalOnly                    Failed
//! ```
//!
//! `init()` stops at `PhysicalEarly` when the memory map cannot be read.
//! Only `PhysicalFull` may enter virtual mode, and it may do so once.

use crate::addresses::{PhysicalAddress, VirtualAddress};
use crate::config::EfiConfig;
use crate::discovery::{self, OFF_RUNTIME, SystemTableSnapshot};
use crate::error::{DiscoveryError, MemoryMapError, TransitionError};
use crate::gateway::convention::{CallStage, PhysCallGate};
use crate::gateway::{RuntimeServices, ServiceEntryPoints};
use crate::mapper::{AddressMapper, AddressSpaceMapper, MappedWindow, PageAttributes};
use crate::memory_map::MemoryMap;
use crate::memory_map::boot_services::{self, BootMemory};
use crate::memory_map::legacy::{self, LegacyRegionTable};
use core::ops::Range;
use core::ptr::read_unaligned;
use kernel_info::boot::{KernelBootInfo, MemoryMapInfo};
use log::{debug, error, info, trace, warn};
use uefi::Status;
use uefi::boot::{MemoryAttribute, MemoryType};

/// Life-cycle state of the bridge.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ModeState {
    Uninitialized,
    /// System table discovered; only the clock and the address-map call work.
    PhysicalEarly,
    /// Entry points and memory map captured; every service works physically.
    ///
    /// Discovery alone captures the entry points, but the bridge only gets
    /// here once the memory map has loaded too, since the virtual-mode
    /// transition cannot run without it.
    PhysicalFull,
    VirtualActive,
    /// The platform never leaves physical mode.
    PhysicalOnly,
    /// A fatal transition error occurred.
    Failed,
}

/// The firmware runtime-services bridge.
pub struct Efi<G> {
    config: EfiConfig,
    state: ModeState,
    systab: Option<SystemTableSnapshot>,
    systab_virt: Option<VirtualAddress>,
    memmap: Option<MemoryMap>,
    window: Option<MappedWindow>,
    runtime: RuntimeServices<G>,
}

impl<G: PhysCallGate> Efi<G> {
    pub const fn new(config: EfiConfig, gate: G) -> Self {
        Self {
            config,
            state: ModeState::Uninitialized,
            systab: None,
            systab_virt: None,
            memmap: None,
            window: None,
            runtime: RuntimeServices::new(gate),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &EfiConfig {
        &self.config
    }

    #[must_use]
    pub const fn state(&self) -> ModeState {
        self.state
    }

    /// The gateway all runtime-service calls go through.
    #[must_use]
    pub const fn runtime(&self) -> &RuntimeServices<G> {
        &self.runtime
    }

    #[must_use]
    pub const fn system_table(&self) -> Option<&SystemTableSnapshot> {
        self.systab.as_ref()
    }

    /// Virtual address of the system table once in virtual mode.
    #[must_use]
    pub const fn system_table_virt(&self) -> Option<VirtualAddress> {
        self.systab_virt
    }

    #[must_use]
    pub const fn memory_map(&self) -> Option<&MemoryMap> {
        self.memmap.as_ref()
    }

    /// Discovers the firmware and loads the memory map.
    ///
    /// A missing or malformed memory map is logged and leaves the bridge in
    /// [`ModeState::PhysicalEarly`].
    ///
    /// # Errors
    /// EFI is disabled, was already initialized, or the system table is
    /// missing or cannot be mapped.
    pub fn init<M, L>(&mut self, boot: &KernelBootInfo, mapper: &mut M, legacy: &mut L) -> Result<(), DiscoveryError>
    where
        M: AddressMapper + ?Sized,
        L: LegacyRegionTable + ?Sized,
    {
        if self.state != ModeState::Uninitialized {
            return Err(DiscoveryError::AlreadyInitialized(self.state));
        }
        if !self.config.enabled {
            return Err(DiscoveryError::Disabled);
        }
        if !boot.has_efi() {
            return Err(DiscoveryError::NoSystemTable);
        }

        let found = discovery::discover(PhysicalAddress::new(boot.efi_systab), mapper)?;
        self.runtime.bind_physical(found.systab.revision, found.entry_points);
        self.systab = Some(found.systab);
        self.state = ModeState::PhysicalEarly;

        let (map, window) = match load_memory_map(&boot.mmap, mapper) {
            Ok(loaded) => loaded,
            Err(e) => {
                error!("EFI memory map unavailable: {e}");
                return Ok(());
            }
        };

        map.log_descriptors();
        if self.config.add_memmap {
            legacy::populate_legacy_table(&map, legacy);
        }

        self.memmap = Some(map);
        self.window = Some(window);
        self.runtime.set_stage(CallStage::Full);
        self.state = ModeState::PhysicalFull;
        Ok(())
    }

    /// Keeps the allocator away from the firmware memory map itself.
    pub fn reserve_early<B: BootMemory + ?Sized>(&self, bootmem: &mut B) {
        if let Some(window) = &self.window {
            bootmem.reserve_early(window.phys(), window.phys() + window.size(), "EFI memmap");
        }
    }

    /// Reserves boot-service regions until the transition frees them.
    ///
    /// `kernel` is the physical extent of the running kernel image.
    pub fn reserve_boot_services<L, B>(&mut self, kernel: &Range<PhysicalAddress>, legacy: &L, bootmem: &mut B)
    where
        L: LegacyRegionTable + ?Sized,
        B: BootMemory + ?Sized,
    {
        if let Some(map) = &mut self.memmap {
            boot_services::reserve_boot_services(map, kernel, legacy, bootmem);
        }
    }

    /// Memory type of the region containing `addr`.
    #[must_use]
    pub fn mem_type(&self, addr: PhysicalAddress) -> Option<MemoryType> {
        self.memmap.as_ref()?.lookup_type(addr)
    }

    /// Attributes of the region containing `addr`.
    #[must_use]
    pub fn mem_attributes(&self, addr: PhysicalAddress) -> Option<MemoryAttribute> {
        self.memmap.as_ref()?.lookup_attributes(addr)
    }

    /// Switches firmware into the kernel's virtual address space.
    ///
    /// Only valid once, from [`ModeState::PhysicalFull`]. Any error other than
    /// [`TransitionError::InvalidState`] leaves the bridge in
    /// [`ModeState::Failed`].
    ///
    /// # Errors
    /// All errors are fatal; the boot sequence must halt.
    pub fn enter_virtual_mode<M, A, B>(
        &mut self,
        mapper: &mut M,
        attrs: &mut A,
        bootmem: &mut B,
    ) -> Result<(), TransitionError>
    where
        M: AddressMapper + ?Sized,
        A: PageAttributes + ?Sized,
        B: BootMemory + ?Sized,
    {
        if self.state != ModeState::PhysicalFull {
            error!("EFI virtual mode requested in state {:?}", self.state);
            return Err(TransitionError::InvalidState(self.state));
        }

        let mut space = AddressSpaceMapper::new(mapper, attrs);
        match self.switch_to_virtual(&mut space, bootmem) {
            Ok(systab_virt) => {
                self.systab_virt = Some(systab_virt);
                self.state = ModeState::VirtualActive;
                info!("EFI runtime services now in virtual mode");
                Ok(())
            }
            Err(e) => {
                error!("EFI virtual mode transition failed: {e}");
                self.state = ModeState::Failed;
                Err(e)
            }
        }
    }

    fn switch_to_virtual<M, A, B>(
        &mut self,
        space: &mut AddressSpaceMapper<'_, M, A>,
        bootmem: &mut B,
    ) -> Result<VirtualAddress, TransitionError>
    where
        M: AddressMapper + ?Sized,
        A: PageAttributes + ?Sized,
        B: BootMemory + ?Sized,
    {
        let (Some(systab), Some(map), Some(window)) = (&self.systab, &mut self.memmap, self.window) else {
            return Err(TransitionError::InvalidState(self.state));
        };

        let merged = map.merge_contiguous();
        debug!("Merged {merged} contiguous EFI memory regions");

        let systab_virt = map_runtime_regions(map, space, systab.phys)
            .ok_or(TransitionError::SystemTableNotMapped(systab.phys))?;

        // SAFETY: the window stays mapped until released below and nothing
        // else references it.
        let raw = unsafe { window.bytes_mut() };
        map.store(raw).map_err(TransitionError::MemoryMapUnavailable)?;

        let status = self.runtime.set_virtual_address_map(
            map.map_size(),
            map.desc_size(),
            map.desc_version(),
            window.phys(),
        );
        if status != Status::SUCCESS {
            return Err(TransitionError::SetVirtualAddressMap(status));
        }

        // Firmware no longer touches boot-service memory.
        boot_services::free_boot_services(map, bootmem);

        // SAFETY: the system table lies in a region mapped above and firmware
        // rewrote its runtime pointer to a virtual address.
        let runtime_virt = unsafe { read_unaligned((systab_virt + OFF_RUNTIME as u64).as_ptr::<u64>()) };
        let entries = if runtime_virt == 0 {
            error!("EFI runtime services table missing after SetVirtualAddressMap()");
            ServiceEntryPoints::default()
        } else {
            // SAFETY: firmware keeps its runtime table in runtime memory, which
            // is mapped at the address it reported.
            unsafe { ServiceEntryPoints::from_ptr(VirtualAddress::new(runtime_virt).as_ptr()) }
        };
        self.runtime.bind_virtual(entries);

        if space.nx_supported() {
            for md in map.live().filter(|md| is_virtualized(md) && !md.virt_start().is_null()) {
                space.set_executable(md, md.ty() == MemoryType::RUNTIME_SERVICES_CODE);
            }
        }

        space.early_unmap(window.va, window.size);
        self.window = None;
        Ok(systab_virt)
    }

    /// Makes physical-mode calls permanent on platforms that never switch to
    /// virtual mode.
    ///
    /// # Errors
    /// The bridge is not in a physical boot stage.
    pub fn setup_physical_mode<M: AddressMapper + ?Sized>(&mut self, mapper: &mut M) -> Result<(), TransitionError> {
        if !matches!(self.state, ModeState::PhysicalEarly | ModeState::PhysicalFull) {
            error!("EFI physical mode requested in state {:?}", self.state);
            return Err(TransitionError::InvalidState(self.state));
        }

        self.runtime.gate().prepare_physical_mode();
        self.runtime.set_stage(CallStage::Permanent);

        if let Some(window) = self.window.take() {
            mapper.early_unmap(window.va, window.size);
        }

        self.state = ModeState::PhysicalOnly;
        info!("EFI runtime services stay in physical mode");
        Ok(())
    }
}

/// Maps the raw firmware memory map and copies it into kernel storage. The
/// mapping stays alive; the address-map call later reads it back.
fn load_memory_map<M: AddressMapper + ?Sized>(
    info: &MemoryMapInfo,
    mapper: &mut M,
) -> Result<(MemoryMap, MappedWindow), MemoryMapError> {
    let pa = PhysicalAddress::new(info.mmap_ptr);
    let desc_size = usize::try_from(info.mmap_desc_size).unwrap_or(0);

    if pa.is_null() || info.mmap_len == 0 {
        return Err(MemoryMapError::Unmapped(pa));
    }

    trace!("Mapping EFI memory map at {pa} ({} entries)", info.entry_count());
    let Some(va) = mapper.early_map(pa, info.mmap_len).filter(|va| !va.is_null()) else {
        return Err(MemoryMapError::Unmapped(pa));
    };
    let window = MappedWindow {
        pa,
        va,
        size: info.mmap_len,
    };

    // SAFETY: just mapped for `mmap_len` bytes.
    let raw = unsafe { window.bytes() };
    match MemoryMap::parse(raw, desc_size, info.mmap_desc_version) {
        Ok(map) => Ok((map, window)),
        Err(e) => {
            mapper.early_unmap(va, info.mmap_len);
            Err(e)
        }
    }
}

/// Regions the kernel maps for firmware: runtime memory, plus boot-service
/// memory still holding pages, since firmware may touch it until the
/// address-map call returns.
fn is_virtualized(md: &crate::memory_map::MemoryDescriptor) -> bool {
    md.page_count() != 0 && (md.is_runtime() || md.is_boot_services())
}

/// Assigns a virtual address to every region firmware needs and returns the
/// system table's new address, if it lies in one of them.
fn map_runtime_regions<M, A>(
    map: &mut MemoryMap,
    space: &mut AddressSpaceMapper<'_, M, A>,
    systab: PhysicalAddress,
) -> Option<VirtualAddress>
where
    M: AddressMapper + ?Sized,
    A: PageAttributes + ?Sized,
{
    let mut systab_virt = None;

    for md in map.live_mut().filter(|md| is_virtualized(md)) {
        let Some(va) = space.remap_range(md.phys_start(), md.size(), md.ty()) else {
            error!("Mapping EFI region {} ({} pages) failed", md.phys_start(), md.page_count());
            md.set_virt_start(VirtualAddress::zero());
            continue;
        };

        md.set_virt_start(va);
        space.apply_cache_attribute(va, md.page_count(), md.wants_uncached());

        if md.contains(systab) {
            systab_virt = Some(va + (systab - md.phys_start()));
        }
    }

    if systab_virt.is_none() {
        warn!("EFI system table {systab} is not inside any mapped runtime region");
    }
    systab_virt
}
