use std::path::{Path, PathBuf};
use std::process::Command;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info};

use crate::backends::{ensure_parent, register_number, FacadeBackend, LoadedModule};
use crate::db::ProjectLayout;
use crate::facade::{
    DisassemblyFacade, FacadeError, Instruction, ModuleImage, Operand, OperandKind, Segment,
    TypeDescriptor,
};
use crate::model::Architecture;

/// Command channel to a rizin instance.
pub trait RizinPipe {
    fn cmd(&self, command: &str) -> Result<String, FacadeError>;
}

/// One `rizin -2 -q0 -c <command> <module>` process per command.
pub struct RizinCli {
    bin: PathBuf,
    module: PathBuf,
}

impl RizinCli {
    pub fn new(bin: impl Into<PathBuf>, module: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into(), module: module.into() }
    }
}

impl RizinPipe for RizinCli {
    fn cmd(&self, command: &str) -> Result<String, FacadeError> {
        let output = Command::new(&self.bin)
            .args(["-2", "-q0", "-c", command])
            .arg(&self.module)
            .output()
            .map_err(|e| FacadeError::Backend(format!("failed to spawn rizin: {e}")))?;
        if !output.status.success() {
            return Err(FacadeError::Backend(format!("rizin exited with {}", output.status)));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

fn resolve_rizin_path() -> PathBuf {
    std::env::var_os("RIZIN_BIN").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("rizin"))
}

/// Rizin-backed facade. `bin` overrides `$RIZIN_BIN` / `rizin` on `PATH`.
#[derive(Debug, Default)]
pub struct RizinBackend {
    pub bin: Option<PathBuf>,
}

impl FacadeBackend for RizinBackend {
    fn name(&self) -> &'static str {
        "rizin"
    }

    fn open(&self, module: &Path, previous: Option<&Path>) -> Result<Box<dyn LoadedModule>, FacadeError> {
        if !module.is_file() {
            return Err(FacadeError::Backend(format!("{} is not a file", module.display())));
        }
        let bin = self.bin.clone().unwrap_or_else(resolve_rizin_path);
        let pipe = RizinCli::new(bin, module);
        let mut loaded = RizinModule::load(&pipe)?;
        if let Some(path) = previous.filter(|p| p.is_file()) {
            loaded.image.load_annotations(path)?;
            debug!("seeded annotations from {}", path.display());
        }
        Ok(Box::new(loaded))
    }
}

#[derive(Debug, Deserialize)]
struct RizinInfo {
    bin: RizinBinInfo,
}

#[derive(Debug, Deserialize)]
struct RizinBinInfo {
    #[serde(default)]
    arch: String,
    #[serde(default)]
    bits: u32,
    #[serde(default)]
    baddr: u64,
}

#[derive(Debug, Deserialize)]
struct RizinSection {
    #[serde(default)]
    name: String,
    #[serde(default)]
    vaddr: u64,
    #[serde(default)]
    vsize: u64,
    #[serde(default)]
    perm: String,
}

#[derive(Debug, Deserialize)]
struct RizinFunction {
    addr: u64,
    #[serde(default)]
    ops: Vec<RizinOp>,
}

#[derive(Debug, Deserialize)]
struct RizinOp {
    offset: u64,
    #[serde(default)]
    size: u8,
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    opcode: Option<String>,
    #[serde(default)]
    disasm: Option<String>,
    #[serde(default)]
    ptr: Option<u64>,
    #[serde(default)]
    jump: Option<u64>,
    #[serde(default)]
    refs: Vec<RizinRef>,
}

#[derive(Debug, Deserialize)]
struct RizinRef {
    addr: u64,
    #[serde(default, rename = "type")]
    kind: String,
}

fn parse_json<T: DeserializeOwned>(command: &str, body: &str) -> Result<T, FacadeError> {
    serde_json::from_str(body.trim())
        .map_err(|e| FacadeError::Backend(format!("failed to parse rizin `{command}` output: {e}")))
}

/// A module loaded through rizin.
///
/// Sections, functions and decoded operands are pulled once at load time into
/// a [`ModuleImage`]; annotation writes go to that image and are also recorded
/// as rizin commands so they can be replayed into a rizin project.
pub struct RizinModule {
    image: ModuleImage,
    script: Vec<String>,
}

impl RizinModule {
    pub fn load(pipe: &dyn RizinPipe) -> Result<Self, FacadeError> {
        let info: RizinInfo = parse_json("ij", &pipe.cmd("ij")?)?;
        let arch = match (info.bin.arch.as_str(), info.bin.bits) {
            ("x86", 64) => Architecture::X64,
            ("x86", 32) => Architecture::X86,
            _ => Architecture::Unknown,
        };
        let mut image = ModuleImage::new(arch, info.bin.baddr);

        let sections: Vec<RizinSection> = parse_json("iSj", &pipe.cmd("iSj")?)?;
        for section in sections.into_iter().filter(|s| s.vsize > 0 && s.vaddr != 0) {
            let command = format!("pxj {} @ {:#x}", section.vsize, section.vaddr);
            let data: Vec<u8> = parse_json(&command, &pipe.cmd(&command)?)?;
            let executable = section.perm.contains('x');
            image.add_section(section.name, section.vaddr, data, executable);
        }

        let body = pipe.cmd("aaa;pdfj @@F")?;
        let mut functions = 0;
        for function in serde_json::Deserializer::from_str(&body).into_iter::<RizinFunction>() {
            let function = function
                .map_err(|e| FacadeError::Backend(format!("failed to parse rizin pdfj output: {e}")))?;
            let instructions: Vec<Instruction> =
                function.ops.iter().map(|op| convert_op(op, arch, &image)).collect();
            image.add_function(function.addr, instructions);
            functions += 1;
        }
        info!("rizin reported {functions} function(s) for {arch} image at {:#x}", info.bin.baddr);

        Ok(Self { image, script: Vec::new() })
    }

    pub fn image(&self) -> &ModuleImage {
        &self.image
    }

    /// Rizin commands replaying every annotation written so far.
    pub fn script(&self) -> &[String] {
        &self.script
    }
}

fn convert_op(op: &RizinOp, arch: Architecture, image: &ModuleImage) -> Instruction {
    let text = op.opcode.as_deref().or(op.disasm.as_deref()).unwrap_or("").trim().to_lowercase();
    let (mnemonic, rest) = text.split_once(' ').unwrap_or((text.as_str(), ""));
    let branch = mnemonic == "call" || mnemonic.starts_with('j') || op.kind.ends_with("call");
    let next = op.offset + u64::from(op.size);
    let mut out = Instruction::new(op.offset, op.size, mnemonic);

    for operand_text in rest.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let mut operand = classify_operand(operand_text, branch, next, op.ptr, arch);
        if branch && operand.kind == OperandKind::Void {
            if let Some(target) = op.jump {
                operand = Operand::new(OperandKind::Near, target);
            }
        }
        let is_data = matches!(operand.kind, OperandKind::Memory | OperandKind::Immediate);
        if is_data && image.is_mapped(operand.value) && !out.data_refs.contains(&operand.value) {
            out = out.with_data_ref(operand.value);
        }
        out = out.with_operand(operand);
    }

    for reference in &op.refs {
        let data = reference.kind.eq_ignore_ascii_case("data") || reference.kind == "d";
        if data && image.is_mapped(reference.addr) && !out.data_refs.contains(&reference.addr) {
            out = out.with_data_ref(reference.addr);
        }
    }
    out
}

fn parse_number(token: &str) -> Option<i64> {
    let (negative, digits) = match token.strip_prefix('-') {
        Some(rest) => (true, rest.trim()),
        None => (false, token),
    };
    let value = match digits.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok()? as i64,
        None => digits.parse::<i64>().ok()?,
    };
    Some(if negative { value.wrapping_neg() } else { value })
}

fn truncate(value: u64, arch: Architecture) -> u64 {
    match arch {
        Architecture::X86 => value & 0xFFFF_FFFF,
        _ => value,
    }
}

/// Classify one Intel-syntax operand as rizin prints it.
fn classify_operand(
    text: &str,
    branch: bool,
    next: u64,
    ptr: Option<u64>,
    arch: Architecture,
) -> Operand {
    if let (Some(open), Some(close)) = (text.find('['), text.rfind(']')) {
        let inner = &text[open + 1..close];
        let mut registers = Vec::new();
        let mut disp: i64 = 0;
        for term in inner.split('+') {
            for (part_index, part) in term.split('-').enumerate() {
                let part = part.trim();
                if part.is_empty() {
                    continue;
                }
                let negative = part_index > 0;
                match parse_number(part) {
                    Some(n) if negative => disp = disp.wrapping_sub(n),
                    Some(n) => disp = disp.wrapping_add(n),
                    None => registers.push(part.to_string()),
                }
            }
        }
        return if registers.iter().any(|r| r == "rip") {
            Operand::mem(ptr.unwrap_or_else(|| next.wrapping_add(disp as u64)))
        } else if registers.is_empty() {
            Operand::mem(truncate(ptr.unwrap_or(disp as u64), arch))
        } else if disp != 0 {
            Operand::displ(truncate(disp as u64, arch))
        } else {
            Operand::new(OperandKind::Phrase, 0)
        };
    }

    if let Some(value) = parse_number(text) {
        let value = truncate(value as u64, arch);
        return if branch { Operand::new(OperandKind::Near, value) } else { Operand::imm(value) };
    }

    let name = text.rsplit(' ').next().unwrap_or(text);
    if name.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Operand::reg(register_number(Some(name)));
    }
    Operand::new(OperandKind::Void, 0)
}

fn script_text(text: &str) -> String {
    text.replace(['\n', ';'], " ")
}

impl DisassemblyFacade for RizinModule {
    fn architecture(&self) -> Architecture {
        self.image.architecture()
    }

    fn image_base(&self) -> u64 {
        self.image.image_base()
    }

    fn enumerate_functions(&self) -> Vec<u64> {
        self.image.enumerate_functions()
    }

    fn enumerate_instructions(&self, function_start: u64) -> Vec<u64> {
        self.image.enumerate_instructions(function_start)
    }

    fn instruction_mnemonic(&self, address: u64) -> String {
        self.image.instruction_mnemonic(address)
    }

    fn operand_type(&self, address: u64, index: usize) -> OperandKind {
        self.image.operand_type(address, index)
    }

    fn operand_value(&self, address: u64, index: usize) -> u64 {
        self.image.operand_value(address, index)
    }

    fn read_bytes(&self, address: u64, length: usize) -> Result<Vec<u8>, FacadeError> {
        self.image.read_bytes(address, length)
    }

    fn data_cross_references_from(&self, address: u64) -> Vec<u64> {
        self.image.data_cross_references_from(address)
    }

    fn segments(&self) -> Vec<Segment> {
        self.image.segments()
    }

    fn name_at(&self, address: u64) -> Option<String> {
        self.image.name_at(address)
    }

    fn type_at(&self, address: u64) -> Option<TypeDescriptor> {
        self.image.type_at(address)
    }

    fn comment_at(&self, address: u64) -> Option<String> {
        self.image.comment_at(address)
    }

    fn set_type(&mut self, address: u64, ty: &TypeDescriptor) -> Result<(), FacadeError> {
        self.image.set_type(address, ty)?;
        // rizin links struct types; a pointer global is linked by its pointee.
        let linked = ty.as_str().trim_end_matches('*').trim();
        self.script.push(format!("tl {} = {address:#x}", script_text(linked)));
        Ok(())
    }

    fn set_name(&mut self, address: u64, name: &str) -> Result<(), FacadeError> {
        self.image.set_name(address, name)?;
        self.script.push(format!("f {} @ {address:#x}", script_text(name)));
        Ok(())
    }

    fn set_comment(&mut self, address: u64, comment: &str) -> Result<(), FacadeError> {
        self.image.set_comment(address, comment)?;
        self.script.push(format!("CC {} @ {address:#x}", script_text(comment)));
        Ok(())
    }
}

impl LoadedModule for RizinModule {
    fn facade(&self) -> &dyn DisassemblyFacade {
        self
    }

    fn facade_mut(&mut self) -> &mut dyn DisassemblyFacade {
        self
    }

    fn save(&self, layout: &ProjectLayout, module_name: &str) -> Result<Vec<PathBuf>, FacadeError> {
        let project = layout.annotation_project_path(module_name);
        ensure_parent(&project)?;
        self.image.save_annotations(&project)?;

        let script_path = layout.rizin_script_path(module_name);
        let mut body = self.script.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        std::fs::write(&script_path, body).map_err(|e| {
            FacadeError::Backend(format!("failed to write {}: {e}", script_path.display()))
        })?;
        Ok(vec![project, script_path])
    }
}
