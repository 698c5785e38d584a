use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;

use capstone::arch::x86::X86OperandType;
use capstone::arch::ArchOperand;
use capstone::{arch, prelude::*, Capstone, InsnGroupId};
use goblin::pe::{self, PE};
use tracing::{debug, info};

use crate::backends::{register_number, FacadeBackend, LoadedModule};
use crate::facade::{DisassemblyFacade, FacadeError, Instruction, ModuleImage, Operand, OperandKind};
use crate::model::Architecture;

/// Upper bound on instructions decoded for a single function.
const MAX_FUNCTION_INSTRUCTIONS: usize = 0x4000;

/// PE loader plus capstone decoder producing a [`ModuleImage`].
pub struct CapstoneBackend;

impl FacadeBackend for CapstoneBackend {
    fn name(&self) -> &'static str {
        "capstone"
    }

    fn open(&self, module: &Path, previous: Option<&Path>) -> Result<Box<dyn LoadedModule>, FacadeError> {
        let bytes = std::fs::read(module)
            .map_err(|e| FacadeError::Backend(format!("failed to read {}: {e}", module.display())))?;
        let mut image = load_pe(&bytes)?;
        if let Some(path) = previous.filter(|p| p.is_file()) {
            image.load_annotations(path)?;
            debug!("seeded annotations from {}", path.display());
        }
        Ok(Box::new(image))
    }
}

fn make_cs(arch: Architecture) -> Result<Capstone, FacadeError> {
    let mode = match arch {
        Architecture::X64 => arch::x86::ArchMode::Mode64,
        Architecture::X86 => arch::x86::ArchMode::Mode32,
        Architecture::Unknown => {
            return Err(FacadeError::Backend("capstone needs an x86 or x64 module".into()))
        }
    };
    Capstone::new()
        .x86()
        .mode(mode)
        .detail(true)
        .build()
        .map_err(|e| FacadeError::Backend(format!("capstone init failed: {e}")))
}

/// Map every section of a PE image at `image_base + rva` and decode its code.
pub fn load_pe(bytes: &[u8]) -> Result<ModuleImage, FacadeError> {
    let pe = PE::parse(bytes).map_err(|e| FacadeError::Backend(format!("not a PE image: {e}")))?;
    let arch = match pe.header.coff_header.machine {
        pe::header::COFF_MACHINE_X86 => Architecture::X86,
        pe::header::COFF_MACHINE_X86_64 => Architecture::X64,
        other => {
            return Err(FacadeError::Backend(format!("unsupported machine type 0x{other:04X}")))
        }
    };
    let base = pe.image_base as u64;
    let mut image = ModuleImage::new(arch, base);

    for section in &pe.sections {
        let name = section.name().unwrap_or_default().to_string();
        let raw_offset = section.pointer_to_raw_data as usize;
        let raw_len = section.size_of_raw_data as usize;
        let mapped_len =
            if section.virtual_size == 0 { raw_len } else { section.virtual_size as usize };

        let mut data = vec![0u8; mapped_len];
        let available = bytes.len().saturating_sub(raw_offset).min(raw_len).min(mapped_len);
        if available > 0 {
            data[..available].copy_from_slice(&bytes[raw_offset..raw_offset + available]);
        }
        let executable =
            section.characteristics & pe::section_table::IMAGE_SCN_MEM_EXECUTE != 0;
        image.add_section(name, base + u64::from(section.virtual_address), data, executable);
    }

    let mut roots = vec![base + pe.entry as u64];
    roots.extend(pe.exports.iter().filter(|e| e.rva != 0).map(|e| base + e.rva as u64));
    let functions = discover_functions(&mut image, roots)?;
    info!("capstone decoded {functions} function(s) from {arch} image at {base:#x}");
    Ok(image)
}

/// Flat code blob mapped as a single executable `.text` section at `base`.
pub fn load_flat(arch: Architecture, base: u64, code: &[u8]) -> Result<ModuleImage, FacadeError> {
    let mut image = ModuleImage::new(arch, base);
    image.add_section(".text", base, code.to_vec(), true);
    discover_functions(&mut image, [base])?;
    Ok(image)
}

/// Recursive descent from `roots`; every direct call target becomes a new
/// function. Code addresses taken by `lea`, `mov` or `push` (notify callbacks,
/// driver-binding entry points, SMI handlers) are decoded afterwards when they
/// start with a recognizable prologue. Returns the number of functions added.
pub fn discover_functions(
    image: &mut ModuleImage,
    roots: impl IntoIterator<Item = u64>,
) -> Result<usize, FacadeError> {
    let arch = image.architecture();
    let cs = make_cs(arch)?;
    let mut queue: VecDeque<u64> = roots.into_iter().collect();
    let mut taken: VecDeque<u64> = VecDeque::new();
    let mut seen = BTreeSet::new();
    let mut added = 0;

    loop {
        let start = match queue.pop_front() {
            Some(start) => start,
            None => match taken.pop_front() {
                Some(start) if !seen.contains(&start) && looks_like_prologue(&cs, image, start) => {
                    debug!("address-taken function at {start:#x}");
                    start
                }
                Some(_) => continue,
                None => break,
            },
        };
        if !seen.insert(start) || !image.is_executable(start) {
            continue;
        }
        let decoded = decode_function(&cs, image, arch, start);
        if decoded.instructions.is_empty() {
            continue;
        }
        image.add_function(start, decoded.instructions);
        queue.extend(decoded.callees);
        taken.extend(decoded.address_taken);
        added += 1;
    }
    Ok(added)
}

/// First instruction at `address` is a typical function entry: a register
/// push, a stack-frame `sub`, a home-slot spill, or a frame-pointer setup.
fn looks_like_prologue(cs: &Capstone, image: &ModuleImage, address: u64) -> bool {
    if image.has_instruction(address) {
        return false;
    }
    let Some(code) = image.bytes_from(address) else { return false };
    let Ok(insns) = cs.disasm_count(code, address, 1) else { return false };
    let Some(insn) = insns.iter().next() else { return false };
    let mnemonic = insn.mnemonic().unwrap_or("");
    let ops = insn.op_str().unwrap_or("");
    match mnemonic {
        "push" => !ops.is_empty() && !ops.contains('[') && !ops.starts_with("0x"),
        "sub" => ops.starts_with("rsp,") || ops.starts_with("esp,"),
        "mov" => {
            ops.starts_with("qword ptr [rsp +")
                || ops.starts_with("dword ptr [rsp +")
                || matches!(ops, "rax, rsp" | "r11, rsp" | "edi, edi" | "ebp, esp")
        }
        _ => false,
    }
}

fn has_group(detail: &capstone::InsnDetail, group: u8) -> bool {
    detail.groups().iter().any(|g| *g == InsnGroupId(group))
}

struct DecodedFunction {
    instructions: Vec<Instruction>,
    callees: Vec<u64>,
    address_taken: Vec<u64>,
}

fn decode_function(
    cs: &Capstone,
    image: &ModuleImage,
    arch: Architecture,
    start: u64,
) -> DecodedFunction {
    let mut decoded: BTreeMap<u64, Instruction> = BTreeMap::new();
    let mut callees = Vec::new();
    let mut address_taken = Vec::new();
    let mut pending = vec![start];

    while let Some(mut address) = pending.pop() {
        loop {
            if decoded.contains_key(&address) || decoded.len() >= MAX_FUNCTION_INSTRUCTIONS {
                break;
            }
            let Some(code) = image.bytes_from(address) else { break };
            let Ok(insns) = cs.disasm_count(code, address, 1) else { break };
            let Some(insn) = insns.iter().next() else { break };
            let Ok(detail) = cs.insn_detail(insn) else { break };

            let instruction = convert(cs, insn, &detail, image, arch);
            let next = instruction.next_address();
            let target = instruction
                .operands
                .first()
                .filter(|op| op.kind == OperandKind::Near)
                .map(|op| op.value);
            let mnemonic = instruction.mnemonic.clone();
            address_taken.extend(code_pointer_operands(&instruction).filter(|t| image.is_executable(*t)));
            decoded.insert(address, instruction);

            if has_group(&detail, capstone::InsnGroupType::CS_GRP_RET as u8)
                || matches!(mnemonic.as_str(), "hlt" | "ud2" | "int3")
            {
                break;
            }
            if has_group(&detail, capstone::InsnGroupType::CS_GRP_CALL as u8) {
                callees.extend(target.filter(|t| image.is_executable(*t)));
            } else if has_group(&detail, capstone::InsnGroupType::CS_GRP_JUMP as u8) {
                if let Some(t) = target.filter(|t| image.is_executable(*t)) {
                    pending.push(t);
                }
                if mnemonic == "jmp" {
                    break;
                }
            }
            address = next;
        }
    }

    DecodedFunction { instructions: decoded.into_values().collect(), callees, address_taken }
}

/// Operand values of `lea reg, [addr]`, `mov ..., imm` and `push imm`.
fn code_pointer_operands(instruction: &Instruction) -> impl Iterator<Item = u64> + '_ {
    let wanted = match instruction.mnemonic.as_str() {
        "lea" => Some(OperandKind::Memory),
        "mov" | "push" => Some(OperandKind::Immediate),
        _ => None,
    };
    instruction
        .operands
        .iter()
        .filter(move |op| Some(op.kind) == wanted)
        .map(|op| op.value)
}

fn truncate(value: i64, arch: Architecture) -> u64 {
    match arch {
        Architecture::X86 => value as u64 & 0xFFFF_FFFF,
        _ => value as u64,
    }
}

fn convert(
    cs: &Capstone,
    insn: &capstone::Insn,
    detail: &capstone::InsnDetail,
    image: &ModuleImage,
    arch: Architecture,
) -> Instruction {
    let address = insn.address();
    let size = insn.bytes().len() as u8;
    let mnemonic = insn.mnemonic().unwrap_or("").to_lowercase();
    let branch = mnemonic == "call" || mnemonic.starts_with('j');
    let next = address + u64::from(size);
    let mut out = Instruction::new(address, size, mnemonic);

    for op in detail.arch_detail().operands() {
        let ArchOperand::X86Operand(op) = op else { continue };
        let operand = match op.op_type {
            X86OperandType::Reg(reg) => Operand::reg(register_number(cs.reg_name(reg).as_deref())),
            X86OperandType::Imm(imm) if branch => Operand::new(OperandKind::Near, truncate(imm, arch)),
            X86OperandType::Imm(imm) => Operand::imm(truncate(imm, arch)),
            X86OperandType::Mem(mem) => {
                let disp = mem.disp();
                if cs.reg_name(mem.base()).as_deref() == Some("rip") {
                    Operand::mem(next.wrapping_add(disp as u64))
                } else if mem.base().0 == 0 && mem.index().0 == 0 {
                    Operand::mem(truncate(disp, arch))
                } else if disp != 0 {
                    Operand::displ(truncate(disp, arch))
                } else {
                    Operand::new(OperandKind::Phrase, 0)
                }
            }
            _ => Operand::new(OperandKind::Void, 0),
        };
        let is_data = matches!(operand.kind, OperandKind::Memory | OperandKind::Immediate);
        if is_data && image.is_mapped(operand.value) {
            out = out.with_data_ref(operand.value);
        }
        out = out.with_operand(operand);
    }
    out
}
