//! # EFI Runtime Services Bridge
//!
//! Everything the kernel needs to keep talking to UEFI firmware after boot
//! services are gone: the firmware memory map, the runtime-services gateway
//! and the one-way switch from firmware physical addressing to
//! kernel-assigned virtual addresses.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │          Mode Transition Controller (Efi)           │
//! │    • init(): discovery, memory map, legacy table    │
//! │    • enter_virtual_mode() / setup_physical_mode()   │
//! └──────┬──────────────────┬────────────────────┬──────┘
//!        │                  │                    │
//! ┌──────▼───────┐  ┌───────▼────────┐  ┌────────▼───────┐
//! │ Memory Map   │  │ Address Space  │  │ Call Gateway   │
//! │ merge/lookup │  │ Mapper         │  │ physical or    │
//! │ legacy, boot │  │ direct map,    │  │ virtual entry  │
//! │ services     │  │ UC, NX         │  │ points         │
//! └──────────────┘  └────────────────┘  └────────────────┘
//!        ▲
//! ┌──────┴───────────────────────────────────────────────┐
//! │      Table Discovery (system table snapshot)         │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Boot Sequence
//!
//! 1. [`Efi::init`] maps the system table, captures a [`SystemTableSnapshot`]
//!    and the physical entry points, then copies the memory map.
//! 2. [`Efi::reserve_early`] and [`Efi::reserve_boot_services`] keep the
//!    allocator away from firmware memory.
//! 3. [`Efi::enter_virtual_mode`] maps the runtime regions, calls
//!    `SetVirtualAddressMap()`, frees boot-service memory and rebinds the
//!    gateway; or [`Efi::setup_physical_mode`] stays physical for good.
//! 4. Later callers use [`Efi::runtime`] for clock, variable, reset and
//!    capsule services.
//!
//! The kernel provides the platform pieces through [`AddressMapper`],
//! [`PageAttributes`], [`BootMemory`], [`LegacyRegionTable`] and
//! [`PhysCallGate`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod addresses;
pub mod clock;
pub mod config;
pub mod discovery;
pub mod error;
pub mod gateway;
pub mod mapper;
pub mod memory_map;
pub mod revision;
pub mod transition;

pub use crate::addresses::{PhysicalAddress, VirtualAddress};
pub use crate::config::EfiConfig;
pub use crate::discovery::{ConfigTables, SystemTableSnapshot};
pub use crate::error::{DiscoveryError, MemoryMapError, TransitionError};
pub use crate::gateway::convention::{CallStage, PhysCallGate};
pub use crate::gateway::{Binding, RuntimeServices, Service};
pub use crate::mapper::{AddressMapper, DirectMap, PageAttributes};
pub use crate::memory_map::boot_services::BootMemory;
pub use crate::memory_map::legacy::{LegacyCategory, LegacyRegionTable, classify_for_legacy_map};
pub use crate::memory_map::{MemoryDescriptor, MemoryMap};
pub use crate::revision::TableRevision;
pub use crate::transition::{Efi, ModeState};
