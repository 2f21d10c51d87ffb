//! # Kernel Boot Handoff and Memory Layout
//!
//! This crate defines the data the boot stub hands to the kernel and the
//! memory layout constants shared by every component that needs to agree
//! on where things live. It is the single source of truth for the
//! firmware handoff consumed by the EFI runtime bridge (`kernel-efi`).
//!
//! ## Boot Information ([`boot`])
//! * **EFI System Table**: physical address of the firmware system table
//! * **Memory Map**: physical location, size, stride and version of the
//!   firmware memory map as it was when boot services were exited
//!
//! ## Memory Layout ([`memory`])
//! * **Direct Map**: the higher-half window through which the kernel
//!   reaches physical memory at a fixed offset
//! * **4 GiB Boundary**: the split between the low and high direct-map
//!   windows
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │         User Space              │
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │   Higher Half Direct Mapping    │
//!                       ├─────────────────────────────────┤
//!                       │       Kernel Text & Data        │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! All structures are `#[repr(C)]` with fixed-size integers so the boot
//! stub and the kernel agree on the layout regardless of how either was
//! compiled.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
