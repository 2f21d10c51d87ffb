//! # Error Types
//!
//! Discovery problems are conformance issues: they are logged and the bridge
//! degrades. Transition errors are different: every [`TransitionError`] is
//! fatal and the boot sequence must halt when it sees one.

use crate::addresses::PhysicalAddress;
use crate::transition::ModeState;
use uefi::Status;

#[derive(Debug, thiserror::Error)]
pub enum MemoryMapError {
    #[error("memory descriptor size {0} is smaller than an EFI memory descriptor")]
    DescriptorTooSmall(usize),
    #[error("memory map of {len} bytes is not a whole number of {desc_size}-byte descriptors")]
    TrailingBytes { len: usize, desc_size: usize },
    #[error("memory map buffer of {len} bytes cannot hold {needed} bytes")]
    BufferTooSmall { len: usize, needed: usize },
    #[error("could not map the EFI memory map at {0}")]
    Unmapped(PhysicalAddress),
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("EFI support is disabled")]
    Disabled,
    #[error("no EFI system table was handed over")]
    NoSystemTable,
    #[error("couldn't map the EFI system table at {0}")]
    SystemTableUnmapped(PhysicalAddress),
    #[error("EFI was already initialized (state {0:?})")]
    AlreadyInitialized(ModeState),
}

/// Failure of the one-way switch into virtual mode.
///
/// All variants are fatal. Once one is returned the controller is parked in
/// [`ModeState::Failed`] (unless the call was rejected up front) and the
/// transition can never be attempted again.
#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("EFI mode transition attempted in state {0:?}")]
    InvalidState(ModeState),
    #[error("EFI memory map is not available for the transition")]
    MemoryMapUnavailable(#[source] MemoryMapError),
    #[error("EFI system table at {0} is not inside any runtime-visible region")]
    SystemTableNotMapped(PhysicalAddress),
    #[error("EFI call to SetVirtualAddressMap() failed (status={0:?})")]
    SetVirtualAddressMap(Status),
}
