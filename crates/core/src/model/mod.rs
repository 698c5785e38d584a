//! Core data model for a Boot Services / protocol GUID analysis session.
//!
//! - `Architecture` of the module under analysis
//! - `BootService`: the thirteen protocol-handling Boot Services we track
//! - `CallSite`: an indirect call through the Boot Services table
//! - `GuidUsageRecord`: a GUID found feeding a call site, optionally resolved
//! - `WorkingSet`: the per-session, deduplicated collection of both

pub mod guid;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use guid::{distinct_byte_count, looks_like_guid, GuidParseError, GuidValue, GUID_LEN};

/// Name reported for GUIDs that no bundled database knows about.
pub const PROPRIETARY_PROTOCOL: &str = "ProprietaryProtocol";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    X86,
    X64,
    Unknown,
}

impl Architecture {
    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::X86 => "x86",
            Architecture::X64 => "x64",
            Architecture::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Boot Services that take a protocol GUID argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BootService {
    InstallProtocolInterface,
    ReinstallProtocolInterface,
    UninstallProtocolInterface,
    HandleProtocol,
    RegisterProtocolNotify,
    OpenProtocol,
    CloseProtocol,
    OpenProtocolInformation,
    ProtocolsPerHandle,
    LocateHandleBuffer,
    LocateProtocol,
    InstallMultipleProtocolInterfaces,
    UninstallMultipleProtocolInterfaces,
}

impl BootService {
    pub const ALL: [BootService; 13] = [
        BootService::InstallProtocolInterface,
        BootService::ReinstallProtocolInterface,
        BootService::UninstallProtocolInterface,
        BootService::HandleProtocol,
        BootService::RegisterProtocolNotify,
        BootService::OpenProtocol,
        BootService::CloseProtocol,
        BootService::OpenProtocolInformation,
        BootService::ProtocolsPerHandle,
        BootService::LocateHandleBuffer,
        BootService::LocateProtocol,
        BootService::InstallMultipleProtocolInterfaces,
        BootService::UninstallMultipleProtocolInterfaces,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BootService::InstallProtocolInterface => "InstallProtocolInterface",
            BootService::ReinstallProtocolInterface => "ReinstallProtocolInterface",
            BootService::UninstallProtocolInterface => "UninstallProtocolInterface",
            BootService::HandleProtocol => "HandleProtocol",
            BootService::RegisterProtocolNotify => "RegisterProtocolNotify",
            BootService::OpenProtocol => "OpenProtocol",
            BootService::CloseProtocol => "CloseProtocol",
            BootService::OpenProtocolInformation => "OpenProtocolInformation",
            BootService::ProtocolsPerHandle => "ProtocolsPerHandle",
            BootService::LocateHandleBuffer => "LocateHandleBuffer",
            BootService::LocateProtocol => "LocateProtocol",
            BootService::InstallMultipleProtocolInterfaces => "InstallMultipleProtocolInterfaces",
            BootService::UninstallMultipleProtocolInterfaces => {
                "UninstallMultipleProtocolInterfaces"
            }
        }
    }
}

impl fmt::Display for BootService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BootService {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BootService::ALL
            .iter()
            .copied()
            .find(|svc| svc.as_str() == s)
            .ok_or_else(|| format!("unknown boot service '{s}'"))
    }
}

/// Vendor GUID database a protocol name was resolved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuidNamespace {
    Edk2Guids,
    EdkGuids,
    AmiGuids,
    Unknown,
}

impl GuidNamespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuidNamespace::Edk2Guids => "edk2_guids",
            GuidNamespace::EdkGuids => "edk_guids",
            GuidNamespace::AmiGuids => "ami_guids",
            GuidNamespace::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "edk2_guids" => GuidNamespace::Edk2Guids,
            "edk_guids" => GuidNamespace::EdkGuids,
            "ami_guids" => GuidNamespace::AmiGuids,
            _ => GuidNamespace::Unknown,
        }
    }
}

impl fmt::Display for GuidNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Indirect call through the Boot Services table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSite {
    pub address: u64,
    pub service: BootService,
    /// Start address of the function containing the call.
    pub function: u64,
}

/// A GUID recovered for a call site, plus its resolution once known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuidUsageRecord {
    /// Address of the GUID's storage in the module.
    pub address: u64,
    pub service: BootService,
    pub guid: GuidValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<GuidNamespace>,
}

impl GuidUsageRecord {
    pub fn new(address: u64, service: BootService, guid: GuidValue) -> Self {
        Self { address, service, guid, protocol_name: None, namespace: None }
    }

    pub fn is_proprietary(&self) -> bool {
        self.protocol_name.as_deref() == Some(PROPRIETARY_PROTOCOL)
    }
}

/// Per-session collection of call sites and GUID usages.
///
/// Insertion order is preserved. Call sites are unique per address and usage
/// records are unique per `(address, service)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingSet {
    pub call_sites: Vec<CallSite>,
    pub records: Vec<GuidUsageRecord>,
}

impl WorkingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a call site; returns `false` if the address was already known.
    pub fn insert_call_site(&mut self, site: CallSite) -> bool {
        if self.call_sites.iter().any(|c| c.address == site.address) {
            return false;
        }
        self.call_sites.push(site);
        true
    }

    /// Record a GUID usage; returns `false` for a duplicate `(address, service)`.
    pub fn insert_record(&mut self, record: GuidUsageRecord) -> bool {
        if self.records.iter().any(|r| r.address == record.address && r.service == record.service)
        {
            return false;
        }
        self.records.push(record);
        true
    }

    pub fn call_sites_for(&self, service: BootService) -> impl Iterator<Item = &CallSite> {
        self.call_sites.iter().filter(move |c| c.service == service)
    }

    pub fn proprietary_records(&self) -> impl Iterator<Item = &GuidUsageRecord> {
        self.records.iter().filter(|r| r.is_proprietary())
    }
}
