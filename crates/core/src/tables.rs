//! Boot Services table layouts.
//!
//! `EFI_BOOT_SERVICES` starts with a 24-byte `EFI_TABLE_HEADER` followed by
//! pointer-sized function slots, so each offset is `24 + slot * ptr_size`.

use serde::Serialize;

use crate::model::{Architecture, BootService};

/// A service name and the byte offset of its slot in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ServiceOffset {
    pub service: BootService,
    pub offset: u64,
}

/// Offset map for one architecture.
#[derive(Debug, PartialEq, Eq)]
pub struct ServiceTable {
    pub arch: Architecture,
    pub entries: &'static [ServiceOffset],
}

const fn entry(service: BootService, offset: u64) -> ServiceOffset {
    ServiceOffset { service, offset }
}

const BOOT_SERVICES_X64: [ServiceOffset; 13] = [
    entry(BootService::InstallProtocolInterface, 0x80),
    entry(BootService::ReinstallProtocolInterface, 0x88),
    entry(BootService::UninstallProtocolInterface, 0x90),
    entry(BootService::HandleProtocol, 0x98),
    entry(BootService::RegisterProtocolNotify, 0xA8),
    entry(BootService::OpenProtocol, 0x118),
    entry(BootService::CloseProtocol, 0x120),
    entry(BootService::OpenProtocolInformation, 0x128),
    entry(BootService::ProtocolsPerHandle, 0x130),
    entry(BootService::LocateHandleBuffer, 0x138),
    entry(BootService::LocateProtocol, 0x140),
    entry(BootService::InstallMultipleProtocolInterfaces, 0x148),
    entry(BootService::UninstallMultipleProtocolInterfaces, 0x150),
];

const BOOT_SERVICES_X86: [ServiceOffset; 13] = [
    entry(BootService::InstallProtocolInterface, 0x4C),
    entry(BootService::ReinstallProtocolInterface, 0x50),
    entry(BootService::UninstallProtocolInterface, 0x54),
    entry(BootService::HandleProtocol, 0x58),
    entry(BootService::RegisterProtocolNotify, 0x60),
    entry(BootService::OpenProtocol, 0x98),
    entry(BootService::CloseProtocol, 0x9C),
    entry(BootService::OpenProtocolInformation, 0xA0),
    entry(BootService::ProtocolsPerHandle, 0xA4),
    entry(BootService::LocateHandleBuffer, 0xA8),
    entry(BootService::LocateProtocol, 0xAC),
    entry(BootService::InstallMultipleProtocolInterfaces, 0xB0),
    entry(BootService::UninstallMultipleProtocolInterfaces, 0xB4),
];

pub static X64_TABLE: ServiceTable =
    ServiceTable { arch: Architecture::X64, entries: &BOOT_SERVICES_X64 };

pub static X86_TABLE: ServiceTable =
    ServiceTable { arch: Architecture::X86, entries: &BOOT_SERVICES_X86 };

impl ServiceTable {
    /// Select the table for `arch`; `None` for architectures we do not analyze.
    pub fn for_arch(arch: Architecture) -> Option<&'static ServiceTable> {
        match arch {
            Architecture::X64 => Some(&X64_TABLE),
            Architecture::X86 => Some(&X86_TABLE),
            Architecture::Unknown => None,
        }
    }

    pub fn service_at(&self, offset: u64) -> Option<BootService> {
        self.entries.iter().find(|e| e.offset == offset).map(|e| e.service)
    }

    pub fn offset_of(&self, service: BootService) -> Option<u64> {
        self.entries.iter().find(|e| e.service == service).map(|e| e.offset)
    }
}
