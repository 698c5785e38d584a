//! PE header pre-check run before any analysis.
//!
//! Only two fields matter: the machine type (x86 or x64) and the subsystem,
//! which must declare an EFI application or driver.

use std::io::Read;
use std::path::Path;

use serde::Serialize;
use thiserror::Error;

use crate::model::Architecture;

/// Bytes read from the start of a module for the pre-check.
pub const HEADER_PREFIX_LEN: usize = 1024;

const E_LFANEW_OFFSET: usize = 0x3C;
const MACHINE_OFFSET: usize = 4;
const SUBSYSTEM_OFFSET: usize = 0x5C;

pub const IMAGE_FILE_MACHINE_I386: u16 = 0x014C;
pub const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;

pub const SUBSYSTEM_EFI_APPLICATION: u16 = 0x0A;
pub const SUBSYSTEM_EFI_BOOT_SERVICE_DRIVER: u16 = 0x0B;
pub const SUBSYSTEM_EFI_RUNTIME_DRIVER: u16 = 0x0C;

#[derive(Debug, Error)]
pub enum PreconditionError {
    #[error("header truncated before {field}")]
    Truncated { field: &'static str },
    #[error("unsupported machine type 0x{0:04X} (expected x86 or x64)")]
    UnsupportedArchitecture(u16),
    #[error("unsupported subsystem 0x{0:02X} (expected an EFI application or driver)")]
    UnsupportedSubsystem(u16),
    #[error("failed to read module header: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModuleInfo {
    pub arch: Architecture,
    pub subsystem: u16,
}

impl ModuleInfo {
    pub fn subsystem_name(&self) -> &'static str {
        match self.subsystem {
            SUBSYSTEM_EFI_APPLICATION => "EFI application",
            SUBSYSTEM_EFI_BOOT_SERVICE_DRIVER => "EFI boot service driver",
            SUBSYSTEM_EFI_RUNTIME_DRIVER => "EFI runtime driver",
            _ => "other",
        }
    }
}

fn read_u16(bytes: &[u8], offset: usize, field: &'static str) -> Result<u16, PreconditionError> {
    offset
        .checked_add(2)
        .and_then(|end| bytes.get(offset..end))
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or(PreconditionError::Truncated { field })
}

/// Classify a module from its header prefix, rejecting anything that is not
/// an x86/x64 EFI image.
pub fn inspect_header(bytes: &[u8]) -> Result<ModuleInfo, PreconditionError> {
    let e_lfanew = bytes
        .get(E_LFANEW_OFFSET..E_LFANEW_OFFSET + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
        .ok_or(PreconditionError::Truncated { field: "e_lfanew" })?;

    let machine = read_u16(bytes, e_lfanew.saturating_add(MACHINE_OFFSET), "machine")?;
    let arch = match machine {
        IMAGE_FILE_MACHINE_I386 => Architecture::X86,
        IMAGE_FILE_MACHINE_AMD64 => Architecture::X64,
        other => return Err(PreconditionError::UnsupportedArchitecture(other)),
    };

    let subsystem = read_u16(bytes, e_lfanew.saturating_add(SUBSYSTEM_OFFSET), "subsystem")?;
    match subsystem {
        SUBSYSTEM_EFI_APPLICATION | SUBSYSTEM_EFI_BOOT_SERVICE_DRIVER | SUBSYSTEM_EFI_RUNTIME_DRIVER => {
            Ok(ModuleInfo { arch, subsystem })
        }
        other => Err(PreconditionError::UnsupportedSubsystem(other)),
    }
}

/// First [`HEADER_PREFIX_LEN`] bytes of `path` (fewer for short files).
pub fn read_header_prefix(path: &Path) -> Result<Vec<u8>, PreconditionError> {
    let file = std::fs::File::open(path)?;
    let mut buf = Vec::with_capacity(HEADER_PREFIX_LEN);
    file.take(HEADER_PREFIX_LEN as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
pub(crate) fn synthetic_header(machine: u16, subsystem: u16) -> Vec<u8> {
    let mut bytes = vec![0u8; 0x200];
    bytes[0] = b'M';
    bytes[1] = b'Z';
    bytes[E_LFANEW_OFFSET..E_LFANEW_OFFSET + 4].copy_from_slice(&0x80u32.to_le_bytes());
    bytes[0x80 + MACHINE_OFFSET..0x80 + MACHINE_OFFSET + 2].copy_from_slice(&machine.to_le_bytes());
    bytes[0x80 + SUBSYSTEM_OFFSET..0x80 + SUBSYSTEM_OFFSET + 2]
        .copy_from_slice(&subsystem.to_le_bytes());
    bytes
}
