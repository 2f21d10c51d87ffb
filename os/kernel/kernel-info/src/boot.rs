//! # Kernel Boot Information

/// Information the kernel needs about the firmware right after `ExitBootServices`.
/// Keep this `#[repr(C)]` and prefer fixed-size integers at the ABI boundary.
#[repr(C)]
#[derive(Clone, Debug)]
pub struct KernelBootInfo {
    /// Memory map information.
    pub mmap: MemoryMapInfo,

    /// Physical address of the EFI system table, or 0 if the firmware did not provide one.
    pub efi_systab: u64,
}

impl KernelBootInfo {
    /// Whether the boot stub handed over an EFI system table at all.
    #[must_use]
    pub const fn has_efi(&self) -> bool {
        self.efi_systab != 0
    }
}

#[repr(C)]
#[derive(Clone, Debug)]
pub struct MemoryMapInfo {
    /// **Physical** address of the raw UEFI memory map buffer (array of `EFI_MEMORY_DESCRIPTOR` bytes).
    pub mmap_ptr: u64,

    /// Length of the memory map buffer in **bytes**.
    pub mmap_len: u64,

    /// Size of a single memory descriptor in bytes. Firmware may pad descriptors
    /// beyond the structure it documents, so this is the stride to step by.
    pub mmap_desc_size: u64,

    /// Descriptor version (from UEFI). Kernel can check it matches expectations.
    pub mmap_desc_version: u32,
}

impl MemoryMapInfo {
    /// Number of descriptors in the buffer; zero for a missing or malformed stride.
    #[must_use]
    pub const fn entry_count(&self) -> u64 {
        if self.mmap_desc_size == 0 {
            0
        } else {
            self.mmap_len / self.mmap_desc_size
        }
    }
}
