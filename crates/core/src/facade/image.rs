use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::facade::{DisassemblyFacade, FacadeError, OperandKind, Segment, TypeDescriptor};
use crate::model::Architecture;

/// A decoded operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operand {
    pub kind: OperandKind,
    pub value: u64,
}

impl Operand {
    pub fn new(kind: OperandKind, value: u64) -> Self {
        Self { kind, value }
    }

    pub fn reg(number: u64) -> Self {
        Self::new(OperandKind::Register, number)
    }

    pub fn imm(value: u64) -> Self {
        Self::new(OperandKind::Immediate, value)
    }

    pub fn mem(address: u64) -> Self {
        Self::new(OperandKind::Memory, address)
    }

    pub fn displ(disp: u64) -> Self {
        Self::new(OperandKind::Displacement, disp)
    }
}

/// A decoded instruction as the facade exposes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub address: u64,
    pub size: u8,
    pub mnemonic: String,
    pub operands: Vec<Operand>,
    pub data_refs: Vec<u64>,
}

impl Instruction {
    pub fn new(address: u64, size: u8, mnemonic: impl Into<String>) -> Self {
        Self { address, size, mnemonic: mnemonic.into(), operands: Vec::new(), data_refs: Vec::new() }
    }

    pub fn with_operand(mut self, operand: Operand) -> Self {
        self.operands.push(operand);
        self
    }

    pub fn with_data_ref(mut self, target: u64) -> Self {
        self.data_refs.push(target);
        self
    }

    pub fn next_address(&self) -> u64 {
        self.address + u64::from(self.size)
    }
}

#[derive(Debug, Clone)]
struct MappedSection {
    name: String,
    start: u64,
    data: Vec<u8>,
    executable: bool,
}

impl MappedSection {
    fn end(&self) -> u64 {
        self.start + self.data.len() as u64
    }
}

/// Names, types and comments written through the facade.
///
/// Serialized as the module's "annotation project" so a later run sees what an
/// earlier one already applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationStore {
    #[serde(default)]
    pub names: BTreeMap<u64, String>,
    #[serde(default)]
    pub types: BTreeMap<u64, TypeDescriptor>,
    #[serde(default)]
    pub comments: BTreeMap<u64, String>,
}

/// In-memory module: mapped sections, decoded functions and an annotation store.
#[derive(Debug, Clone)]
pub struct ModuleImage {
    arch: Architecture,
    base: u64,
    sections: Vec<MappedSection>,
    functions: Vec<u64>,
    function_items: BTreeMap<u64, Vec<u64>>,
    instructions: BTreeMap<u64, Instruction>,
    annotations: AnnotationStore,
    protected: BTreeSet<u64>,
}

impl ModuleImage {
    pub fn new(arch: Architecture, base: u64) -> Self {
        Self {
            arch,
            base,
            sections: Vec::new(),
            functions: Vec::new(),
            function_items: BTreeMap::new(),
            instructions: BTreeMap::new(),
            annotations: AnnotationStore::default(),
            protected: BTreeSet::new(),
        }
    }

    pub fn add_section(
        &mut self,
        name: impl Into<String>,
        start: u64,
        data: Vec<u8>,
        executable: bool,
    ) -> &mut Self {
        self.sections.push(MappedSection { name: name.into(), start, data, executable });
        self
    }

    /// Register a function and its instructions. Re-adding a start replaces it.
    pub fn add_function(&mut self, start: u64, instructions: Vec<Instruction>) -> &mut Self {
        if !self.functions.contains(&start) {
            self.functions.push(start);
        }
        let mut items: Vec<u64> = instructions.iter().map(|i| i.address).collect();
        items.sort_unstable();
        items.dedup();
        for insn in instructions {
            self.instructions.insert(insn.address, insn);
        }
        self.function_items.insert(start, items);
        self
    }

    /// Mark an address as one the host refuses to modify.
    pub fn protect(&mut self, address: u64) -> &mut Self {
        self.protected.insert(address);
        self
    }

    pub fn instruction(&self, address: u64) -> Option<&Instruction> {
        self.instructions.get(&address)
    }

    /// Remaining bytes of the section containing `address`.
    pub fn bytes_from(&self, address: u64) -> Option<&[u8]> {
        let section = self.sections.iter().find(|s| address >= s.start && address < s.end())?;
        section.data.get((address - section.start) as usize..)
    }

    /// An instruction was decoded at exactly `address`.
    pub fn has_instruction(&self, address: u64) -> bool {
        self.instructions.contains_key(&address)
    }

    pub fn is_executable(&self, address: u64) -> bool {
        self.sections.iter().any(|s| s.executable && address >= s.start && address < s.end())
    }

    pub fn is_mapped(&self, address: u64) -> bool {
        self.sections.iter().any(|s| address >= s.start && address < s.end())
    }

    pub fn annotations(&self) -> &AnnotationStore {
        &self.annotations
    }

    /// Seed the annotation store from a previously saved project file.
    pub fn load_annotations(&mut self, path: &Path) -> Result<(), FacadeError> {
        let body = std::fs::read_to_string(path)
            .map_err(|e| FacadeError::Backend(format!("failed to read {}: {e}", path.display())))?;
        self.annotations = serde_json::from_str(&body).map_err(|e| {
            FacadeError::Backend(format!("failed to parse {}: {e}", path.display()))
        })?;
        Ok(())
    }

    pub fn save_annotations(&self, path: &Path) -> Result<(), FacadeError> {
        let json = serde_json::to_string_pretty(&self.annotations)
            .map_err(|e| FacadeError::Backend(format!("failed to serialize annotations: {e}")))?;
        std::fs::write(path, json)
            .map_err(|e| FacadeError::Backend(format!("failed to write {}: {e}", path.display())))
    }

    fn check_writable(&self, address: u64) -> Result<(), FacadeError> {
        if self.protected.contains(&address) {
            return Err(FacadeError::Refused {
                address,
                reason: "address is protected".to_string(),
            });
        }
        if !self.is_mapped(address) {
            return Err(FacadeError::Unmapped(address));
        }
        Ok(())
    }
}

impl DisassemblyFacade for ModuleImage {
    fn architecture(&self) -> Architecture {
        self.arch
    }

    fn image_base(&self) -> u64 {
        self.base
    }

    fn enumerate_functions(&self) -> Vec<u64> {
        self.functions.clone()
    }

    fn enumerate_instructions(&self, function_start: u64) -> Vec<u64> {
        self.function_items.get(&function_start).cloned().unwrap_or_default()
    }

    fn instruction_mnemonic(&self, address: u64) -> String {
        self.instructions.get(&address).map(|i| i.mnemonic.clone()).unwrap_or_default()
    }

    fn operand_type(&self, address: u64, index: usize) -> OperandKind {
        self.instructions
            .get(&address)
            .and_then(|i| i.operands.get(index))
            .map(|op| op.kind)
            .unwrap_or(OperandKind::Void)
    }

    fn operand_value(&self, address: u64, index: usize) -> u64 {
        self.instructions
            .get(&address)
            .and_then(|i| i.operands.get(index))
            .map(|op| op.value)
            .unwrap_or(0)
    }

    fn read_bytes(&self, address: u64, length: usize) -> Result<Vec<u8>, FacadeError> {
        let section = self
            .sections
            .iter()
            .find(|s| address >= s.start && address < s.end())
            .ok_or(FacadeError::Unmapped(address))?;
        let offset = (address - section.start) as usize;
        let end = offset.checked_add(length).ok_or(FacadeError::Unmapped(address))?;
        section
            .data
            .get(offset..end)
            .map(<[u8]>::to_vec)
            .ok_or(FacadeError::Unmapped(address + length as u64))
    }

    fn data_cross_references_from(&self, address: u64) -> Vec<u64> {
        self.instructions.get(&address).map(|i| i.data_refs.clone()).unwrap_or_default()
    }

    fn segments(&self) -> Vec<Segment> {
        self.sections
            .iter()
            .map(|s| Segment { name: s.name.clone(), start: s.start, end: s.end() })
            .collect()
    }

    fn name_at(&self, address: u64) -> Option<String> {
        self.annotations.names.get(&address).cloned()
    }

    fn type_at(&self, address: u64) -> Option<TypeDescriptor> {
        self.annotations.types.get(&address).cloned()
    }

    fn comment_at(&self, address: u64) -> Option<String> {
        self.annotations.comments.get(&address).cloned()
    }

    fn set_type(&mut self, address: u64, ty: &TypeDescriptor) -> Result<(), FacadeError> {
        self.check_writable(address)?;
        self.annotations.types.insert(address, ty.clone());
        Ok(())
    }

    fn set_name(&mut self, address: u64, name: &str) -> Result<(), FacadeError> {
        self.check_writable(address)?;
        if let Some((&owner, _)) =
            self.annotations.names.iter().find(|(addr, n)| **addr != address && n.as_str() == name)
        {
            return Err(FacadeError::NameConflict { name: name.to_string(), owner });
        }
        self.annotations.names.insert(address, name.to_string());
        Ok(())
    }

    fn set_comment(&mut self, address: u64, comment: &str) -> Result<(), FacadeError> {
        self.check_writable(address)?;
        self.annotations.comments.insert(address, comment.to_string());
        Ok(())
    }
}
