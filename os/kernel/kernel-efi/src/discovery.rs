//! # System Table Discovery
//!
//! Reads the firmware system table once, through short-lived mappings, and
//! keeps an immutable [`SystemTableSnapshot`]. The firmware-owned originals
//! may become unreachable afterwards.
//!
//! Only an unmappable system table stops discovery. Everything else (bad
//! signature, old revision, unreadable vendor string, configuration or
//! runtime table) is a conformance problem that is logged and degraded.
//!
//! ```text
//! EFI_SYSTEM_TABLE (x86_64)
//! ┌──────┬─────────────────────────────┐
//! │ 0x00 │ header: signature, revision │
//! │ 0x18 │ firmware vendor  (*CHAR16)  │
//! │ 0x20 │ firmware revision           │
//! │ 0x58 │ runtime services (*)        │
//! │ 0x68 │ number of config tables     │
//! │ 0x70 │ config tables (*)           │
//! └──────┴─────────────────────────────┘
//! ```

use crate::addresses::PhysicalAddress;
use crate::error::DiscoveryError;
use crate::gateway::ServiceEntryPoints;
use crate::gateway::ffi::{RUNTIME_SERVICES_SIGNATURE, RUNTIME_TABLE_SIZE};
use crate::mapper::{AddressMapper, EarlyMapping};
use crate::revision::TableRevision;
use core::fmt;
use log::{error, info, warn};
use uefi::{Guid, guid};

/// `"IBI SYST"`
pub const SYSTEM_TABLE_SIGNATURE: u64 = 0x5453_5953_2049_4249;

pub(crate) const SYSTEM_TABLE_SIZE: u64 = 120;

const OFF_REVISION: usize = 8;
const OFF_FW_VENDOR: usize = 24;
const OFF_FW_REVISION: usize = 32;
pub(crate) const OFF_RUNTIME: usize = 88;
const OFF_NR_TABLES: usize = 104;
const OFF_TABLES: usize = 112;

/// `EFI_CONFIGURATION_TABLE`: vendor GUID followed by a pointer.
const CONFIG_TABLE_SIZE: usize = 24;

/// Longest vendor string kept, in characters.
pub const VENDOR_MAX_CHARS: usize = 99;

pub const MPS_TABLE_GUID: Guid = guid!("eb9d2d2f-2d88-11d3-9a16-0090273fc14d");
pub const ACPI_TABLE_GUID: Guid = guid!("eb9d2d30-2d88-11d3-9a16-0090273fc14d");
pub const ACPI_20_TABLE_GUID: Guid = guid!("8868e871-e4f1-11d3-bc22-0080c73c8881");
pub const SMBIOS_TABLE_GUID: Guid = guid!("eb9d2d31-2d88-11d3-9a16-0090273fc14d");
pub const SMBIOS3_TABLE_GUID: Guid = guid!("f2fd1544-9794-4a2c-992e-e5bbcf20e394");
pub const HCDP_TABLE_GUID: Guid = guid!("f951938d-620b-42ef-8279-a84b79617898");
pub const UV_SYSTEM_TABLE_GUID: Guid = guid!("3b13a7d4-633e-11dd-93ec-da2556d89593");
pub const UGA_IO_PROTOCOL_GUID: Guid = guid!("61a4d49e-6f68-4f1d-981c-6d0469341191");

/// Firmware vendor name, truncated to [`VENDOR_MAX_CHARS`] characters.
///
/// Characters outside ASCII are replaced by `?`.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Vendor {
    buf: [u8; VENDOR_MAX_CHARS + 1],
    len: usize,
}

impl Vendor {
    fn from_ascii(s: &str) -> Self {
        let mut vendor = Self {
            buf: [0; VENDOR_MAX_CHARS + 1],
            len: 0,
        };
        for b in s.bytes().take(VENDOR_MAX_CHARS) {
            vendor.push(b);
        }
        vendor
    }

    fn unknown() -> Self {
        Self::from_ascii("unknown")
    }

    fn push(&mut self, b: u8) {
        self.buf[self.len] = b;
        self.len += 1;
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or("unknown")
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

/// Physical addresses of the well-known configuration tables.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ConfigTables {
    pub mps: Option<PhysicalAddress>,
    pub acpi: Option<PhysicalAddress>,
    pub acpi20: Option<PhysicalAddress>,
    pub smbios: Option<PhysicalAddress>,
    pub smbios3: Option<PhysicalAddress>,
    pub hcdp: Option<PhysicalAddress>,
    pub uv_systab: Option<PhysicalAddress>,
    pub uga: Option<PhysicalAddress>,
}

impl ConfigTables {
    /// Records `table` if `guid` is one of the well-known identifiers.
    fn record(&mut self, guid: &Guid, table: PhysicalAddress) -> bool {
        let slots = [
            (MPS_TABLE_GUID, &mut self.mps),
            (ACPI_TABLE_GUID, &mut self.acpi),
            (ACPI_20_TABLE_GUID, &mut self.acpi20),
            (SMBIOS_TABLE_GUID, &mut self.smbios),
            (SMBIOS3_TABLE_GUID, &mut self.smbios3),
            (HCDP_TABLE_GUID, &mut self.hcdp),
            (UV_SYSTEM_TABLE_GUID, &mut self.uv_systab),
            (UGA_IO_PROTOCOL_GUID, &mut self.uga),
        ];

        let Some((_, slot)) = slots.into_iter().find(|(known, _)| known == guid) else {
            return false;
        };
        *slot = Some(table);
        true
    }
}

impl fmt::Display for ConfigTables {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tables = [
            ("MPS", self.mps),
            ("ACPI 2.0", self.acpi20),
            ("ACPI", self.acpi),
            ("SMBIOS", self.smbios),
            ("SMBIOS 3.0", self.smbios3),
            ("HCDP", self.hcdp),
            ("UVsystab", self.uv_systab),
            ("UGA", self.uga),
        ];

        let mut first = true;
        for (name, addr) in tables {
            let Some(addr) = addr else { continue };
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{name}={:#x}", addr.as_u64())?;
            first = false;
        }
        Ok(())
    }
}

/// Immutable copy of what the kernel needs from the firmware system table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SystemTableSnapshot {
    pub phys: PhysicalAddress,
    pub revision: TableRevision,
    pub fw_revision: u32,
    pub vendor: Vendor,
    pub runtime: PhysicalAddress,
    pub nr_tables: usize,
    pub tables: ConfigTables,
}

/// Everything discovery hands to the bridge.
#[derive(Copy, Clone, Debug)]
pub struct Discovered {
    pub systab: SystemTableSnapshot,
    pub entry_points: ServiceEntryPoints,
}

/// Reads the system table at `systab` and everything it points to.
///
/// # Errors
/// The system table itself cannot be mapped.
pub fn discover<M: AddressMapper + ?Sized>(systab: PhysicalAddress, mapper: &mut M) -> Result<Discovered, DiscoveryError> {
    let (revision, fw_vendor, fw_revision, runtime, nr_tables, tables_pa) = {
        let table = EarlyMapping::new(mapper, systab, SYSTEM_TABLE_SIZE)
            .ok_or(DiscoveryError::SystemTableUnmapped(systab))?;

        let signature = table.read::<u64>(0).unwrap_or_default();
        if signature != SYSTEM_TABLE_SIGNATURE {
            error!("EFI system table signature incorrect: {signature:#018x}");
        }

        let revision = TableRevision::from_bits(table.read::<u32>(OFF_REVISION).unwrap_or_default());
        if revision.major() < 1 {
            error!("EFI system table major version {} is too old", revision.major());
        }

        (
            revision,
            PhysicalAddress::new(table.read::<u64>(OFF_FW_VENDOR).unwrap_or_default()),
            table.read::<u32>(OFF_FW_REVISION).unwrap_or_default(),
            PhysicalAddress::new(table.read::<u64>(OFF_RUNTIME).unwrap_or_default()),
            table.read::<u64>(OFF_NR_TABLES).unwrap_or_default(),
            PhysicalAddress::new(table.read::<u64>(OFF_TABLES).unwrap_or_default()),
        )
    };

    let vendor = read_vendor(mapper, fw_vendor);
    info!("EFI v{}.{:02} by {vendor}", revision.major(), revision.minor());

    let nr_tables = usize::try_from(nr_tables).unwrap_or(0);
    let tables = read_config_tables(mapper, tables_pa, nr_tables);
    info!("EFI tables: {tables}");

    let entry_points = read_runtime_table(mapper, runtime);

    Ok(Discovered {
        systab: SystemTableSnapshot {
            phys: systab,
            revision,
            fw_revision,
            vendor,
            runtime,
            nr_tables,
            tables,
        },
        entry_points,
    })
}

fn read_vendor<M: AddressMapper + ?Sized>(mapper: &mut M, fw_vendor: PhysicalAddress) -> Vendor {
    if fw_vendor.is_null() {
        warn!("EFI firmware vendor string missing");
        return Vendor::unknown();
    }

    let size = (VENDOR_MAX_CHARS * size_of::<u16>()) as u64;
    let Some(chars) = EarlyMapping::new(mapper, fw_vendor, size) else {
        warn!("Couldn't map the EFI firmware vendor string at {fw_vendor}");
        return Vendor::unknown();
    };

    let mut vendor = Vendor::from_ascii("");
    for i in 0..VENDOR_MAX_CHARS {
        let c = chars.read::<u16>(i * size_of::<u16>()).unwrap_or_default();
        if c == 0 {
            break;
        }
        vendor.push(u8::try_from(c).ok().filter(u8::is_ascii).unwrap_or(b'?'));
    }
    vendor
}

fn read_config_tables<M: AddressMapper + ?Sized>(
    mapper: &mut M,
    tables_pa: PhysicalAddress,
    nr_tables: usize,
) -> ConfigTables {
    let mut tables = ConfigTables::default();
    if nr_tables == 0 {
        return tables;
    }

    let size = nr_tables.saturating_mul(CONFIG_TABLE_SIZE) as u64;
    let Some(raw) = EarlyMapping::new(mapper, tables_pa, size) else {
        error!("Couldn't map the EFI configuration tables at {tables_pa}");
        return tables;
    };

    for i in 0..nr_tables {
        let offset = i * CONFIG_TABLE_SIZE;
        let (Some(guid), Some(table)) = (raw.read::<[u8; 16]>(offset), raw.read::<u64>(offset + 16)) else {
            break;
        };
        tables.record(&Guid::from_bytes(guid), PhysicalAddress::new(table));
    }
    tables
}

fn read_runtime_table<M: AddressMapper + ?Sized>(mapper: &mut M, runtime: PhysicalAddress) -> ServiceEntryPoints {
    if runtime.is_null() {
        error!("EFI runtime services table missing");
        return ServiceEntryPoints::default();
    }

    let Some(table) = EarlyMapping::new(mapper, runtime, RUNTIME_TABLE_SIZE as u64) else {
        error!("Couldn't map the EFI runtime services table at {runtime}");
        return ServiceEntryPoints::default();
    };

    let signature = table.read::<u64>(0).unwrap_or_default();
    if signature != RUNTIME_SERVICES_SIGNATURE {
        warn!("EFI runtime services table signature incorrect: {signature:#018x}");
    }
    ServiceEntryPoints::from_table(table.bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_guids_are_recorded() {
        let mut tables = ConfigTables::default();
        assert!(tables.record(&ACPI_20_TABLE_GUID, PhysicalAddress::new(0x7fe1_4000)));
        assert!(tables.record(&SMBIOS3_TABLE_GUID, PhysicalAddress::new(0x7fe0_0000)));
        assert!(tables.record(&UGA_IO_PROTOCOL_GUID, PhysicalAddress::new(0x7fd0_0000)));
        assert!(!tables.record(
            &guid!("00000000-0000-0000-0000-000000000001"),
            PhysicalAddress::new(0x1000)
        ));

        assert_eq!(tables.acpi20, Some(PhysicalAddress::new(0x7fe1_4000)));
        assert_eq!(tables.smbios3, Some(PhysicalAddress::new(0x7fe0_0000)));
        assert_eq!(tables.uga, Some(PhysicalAddress::new(0x7fd0_0000)));
        assert_eq!(tables.acpi, None);
        assert_eq!(
            alloc::format!("{tables}"),
            "ACPI 2.0=0x7fe14000 SMBIOS 3.0=0x7fe00000 UGA=0x7fd00000"
        );
    }

    #[test]
    fn vendor_is_truncated() {
        let long = "x".repeat(200);
        let vendor = Vendor::from_ascii(&long);
        assert_eq!(vendor.as_str().len(), VENDOR_MAX_CHARS);
        assert_eq!(Vendor::unknown().as_str(), "unknown");
    }
}
