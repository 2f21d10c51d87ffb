//! # Firmware Table Revision

use bitfield_struct::bitfield;
use core::fmt;

/// The 32-bit revision field of EFI table headers.
///
/// Layout (LSB→MSB):
/// - bits 0..15: minor revision (`2.31` is encoded as `31`)
/// - bits 16..31: major revision
///
/// Comparisons order by major, then minor.
#[bitfield(u32, debug = false)]
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableRevision {
    pub minor: u16,
    pub major: u16,
}

impl TableRevision {
    pub const EFI_1_00: Self = Self::from_parts(1, 0);
    pub const EFI_1_10: Self = Self::from_parts(1, 10);

    /// First revision whose runtime table carries the capsule and
    /// variable-info services.
    pub const EFI_2_00: Self = Self::from_parts(2, 0);

    #[must_use]
    pub const fn from_parts(major: u16, minor: u16) -> Self {
        Self::new().with_major(major).with_minor(minor)
    }
}

impl fmt::Display for TableRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.major(), self.minor())
    }
}

impl fmt::Debug for TableRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableRevision({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_layout_is_major_high_minor_low() {
        let rev = TableRevision::from_bits(0x0002_001F);
        assert_eq!(rev.major(), 2);
        assert_eq!(rev.minor(), 31);
        assert_eq!(TableRevision::EFI_2_00.into_bits(), 0x0002_0000);
    }

    #[test]
    fn ordering_follows_major_then_minor() {
        assert!(TableRevision::EFI_1_10 < TableRevision::EFI_2_00);
        assert!(TableRevision::from_parts(1, 99) < TableRevision::EFI_2_00);
        assert!(TableRevision::from_parts(2, 70) > TableRevision::EFI_2_00);
    }

    #[test]
    fn displays_two_digit_minor() {
        assert_eq!(alloc::format!("{}", TableRevision::from_parts(2, 3)), "2.03");
        assert_eq!(alloc::format!("{}", TableRevision::EFI_1_10), "1.10");
    }
}
