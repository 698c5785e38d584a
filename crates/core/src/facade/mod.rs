//! Disassembly facade: the narrow interface the recovery engine needs from a
//! host disassembler.
//!
//! Queries are `&self`; annotation writes are `&mut self` and may be refused
//! by the host. Adapters live in [`crate::backends`]; [`ModuleImage`] is the
//! in-memory implementation shared by the capstone loader and tests.

pub mod image;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::Architecture;

pub use image::{Instruction, ModuleImage, Operand};

/// Operand classification, modelled on the usual disassembler operand kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperandKind {
    Void,
    /// General register; value is the register number (`rax`/`eax` = 0).
    Register,
    /// Direct memory reference; value is the resolved address.
    Memory,
    /// `[base + index]` without displacement; value is 0.
    Phrase,
    /// `[base + index + disp]`; value is the displacement.
    Displacement,
    Immediate,
    Far,
    /// Direct branch target.
    Near,
}

/// Type applied to an address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TypeDescriptor {
    EfiGuidPtr,
    EfiBootServicesPtr,
    Named(String),
}

impl TypeDescriptor {
    pub fn as_str(&self) -> &str {
        match self {
            TypeDescriptor::EfiGuidPtr => "EFI_GUID *",
            TypeDescriptor::EfiBootServicesPtr => "EFI_BOOT_SERVICES *",
            TypeDescriptor::Named(name) => name,
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "EFI_GUID *" => TypeDescriptor::EfiGuidPtr,
            "EFI_BOOT_SERVICES *" => TypeDescriptor::EfiBootServicesPtr,
            other => TypeDescriptor::Named(other.to_string()),
        }
    }
}

/// A named address range of the module (e.g. `.text`, `.data`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub name: String,
    pub start: u64,
    /// Exclusive.
    pub end: u64,
}

impl Segment {
    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.end
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FacadeError {
    #[error("address 0x{0:X} is not mapped")]
    Unmapped(u64),
    #[error("name '{name}' is already used at 0x{owner:X}")]
    NameConflict { name: String, owner: u64 },
    #[error("host refused the change at 0x{address:X}: {reason}")]
    Refused { address: u64, reason: String },
    #[error("backend error: {0}")]
    Backend(String),
}

/// Host disassembler capability consumed by the analysis core.
pub trait DisassemblyFacade {
    fn architecture(&self) -> Architecture;

    fn image_base(&self) -> u64;

    /// Function start addresses in the host's enumeration order.
    fn enumerate_functions(&self) -> Vec<u64>;

    /// Instruction addresses of a function, ascending.
    fn enumerate_instructions(&self, function_start: u64) -> Vec<u64>;

    /// Lower-case mnemonic, or an empty string where no instruction is decoded.
    fn instruction_mnemonic(&self, address: u64) -> String;

    fn operand_type(&self, address: u64, index: usize) -> OperandKind;

    /// Operand value in the host's convention; 0 when absent.
    fn operand_value(&self, address: u64, index: usize) -> u64;

    fn read_bytes(&self, address: u64, length: usize) -> Result<Vec<u8>, FacadeError>;

    fn data_cross_references_from(&self, address: u64) -> Vec<u64>;

    fn segments(&self) -> Vec<Segment>;

    fn name_at(&self, address: u64) -> Option<String>;

    fn type_at(&self, address: u64) -> Option<TypeDescriptor>;

    fn comment_at(&self, address: u64) -> Option<String>;

    fn set_type(&mut self, address: u64, ty: &TypeDescriptor) -> Result<(), FacadeError>;

    fn set_name(&mut self, address: u64, name: &str) -> Result<(), FacadeError>;

    fn set_comment(&mut self, address: u64, comment: &str) -> Result<(), FacadeError>;
}

/// True for names the host generated itself (or no name at all).
pub fn is_auto_name(name: Option<&str>) -> bool {
    match name {
        None => true,
        Some(n) => n.is_empty() || n.starts_with("unk_"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_descriptor_strings_round_trip() {
        for ty in [
            TypeDescriptor::EfiGuidPtr,
            TypeDescriptor::EfiBootServicesPtr,
            TypeDescriptor::Named("UINT64".into()),
        ] {
            assert_eq!(TypeDescriptor::parse(ty.as_str()), ty);
        }
    }

    #[test]
    fn auto_names_are_recognized() {
        assert!(is_auto_name(None));
        assert!(is_auto_name(Some("unk_401000")));
        assert!(!is_auto_name(Some("EFI_LOADED_IMAGE_PROTOCOL_0x401000")));
    }
}
