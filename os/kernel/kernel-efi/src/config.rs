//! # Boot Configuration

/// Boot flags of the EFI bridge, settable before [`crate::Efi::init`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EfiConfig {
    /// Firmware support as a whole. When cleared the bridge stays
    /// uninitialized and no firmware table is touched.
    pub enabled: bool,
    /// Populate the legacy region table from the firmware memory map.
    pub add_memmap: bool,
}

impl Default for EfiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            add_memmap: false,
        }
    }
}

impl EfiConfig {
    /// Applies an early boot parameter. Returns `false` for parameters
    /// that are not ours.
    pub fn apply_early_param(&mut self, name: &str) -> bool {
        match name {
            "noefi" => self.enabled = false,
            "add_efi_memmap" => self.add_memmap = true,
            _ => return false,
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_efi_without_legacy_map() {
        let config = EfiConfig::default();
        assert!(config.enabled);
        assert!(!config.add_memmap);
    }

    #[test]
    fn early_params() {
        let mut config = EfiConfig::default();
        assert!(config.apply_early_param("add_efi_memmap"));
        assert!(config.add_memmap);
        assert!(config.apply_early_param("noefi"));
        assert!(!config.enabled);
        assert!(!config.apply_early_param("nosmp"));
        assert_eq!(
            config,
            EfiConfig {
                enabled: false,
                add_memmap: true
            }
        );
    }
}
