// crates/core/tests/end_to_end.rs
mod common;

use std::cell::Cell;

use bootscope_core::analysis::{analyze_module, AnalysisSession, SessionError};
use bootscope_core::annotate::AnnotationPlanner;
use bootscope_core::config::ScanConfig;
use bootscope_core::facade::{
    DisassemblyFacade, FacadeError, Instruction, ModuleImage, Operand, OperandKind, Segment,
    TypeDescriptor,
};
use bootscope_core::guids::GuidDatabase;
use bootscope_core::header::PreconditionError;
use bootscope_core::model::{Architecture, BootService, GuidNamespace};

use common::{pe_header, LOADED_IMAGE_GUID};

const BASE: u64 = 0x1000_0000;
const FUNC: u64 = BASE + 0x1000;
const GUID_ADDR: u64 = BASE + 0x3000;

/// `lea rdx, [rip+..]`, seven fillers, then `call [rax+0x98]` eight
/// instructions after the `lea`.
fn module_with_guid(guid: [u8; 16]) -> (ModuleImage, u64) {
    let mut img = ModuleImage::new(Architecture::X64, BASE);
    img.add_section(".text", FUNC, vec![0x90; 0x100], true);
    let mut data = vec![0u8; 0x40];
    data[..16].copy_from_slice(&guid);
    img.add_section(".data", GUID_ADDR, data, false);

    let mut instructions = vec![Instruction::new(FUNC, 7, "lea")
        .with_operand(Operand::reg(2))
        .with_operand(Operand::mem(GUID_ADDR))
        .with_data_ref(GUID_ADDR)];
    let mut address = FUNC + 7;
    for _ in 0..7 {
        instructions.push(Instruction::new(address, 1, "nop"));
        address += 1;
    }
    let call = address;
    instructions.push(Instruction::new(call, 6, "call").with_operand(Operand::displ(0x98)));
    instructions.push(Instruction::new(call + 6, 1, "ret"));
    img.add_function(FUNC, instructions);
    (img, call)
}

fn x64_driver_header() -> Vec<u8> {
    pe_header(0x8664, 0x0B)
}

#[test]
fn known_guid_is_located_resolved_and_named() {
    let (mut img, call) = module_with_guid(LOADED_IMAGE_GUID);
    let db = GuidDatabase::bundled().expect("bundled databases");
    let config = ScanConfig::default();

    let (info, set, summary) =
        analyze_module(&x64_driver_header(), &mut img, &db, &config).expect("analysis");
    assert_eq!(info.arch, Architecture::X64);

    assert_eq!(set.call_sites.len(), 1);
    assert_eq!(set.call_sites[0].address, call);
    assert_eq!(set.call_sites[0].service, BootService::HandleProtocol);

    assert_eq!(set.records.len(), 1);
    let record = &set.records[0];
    assert_eq!(record.address, GUID_ADDR);
    assert_eq!(record.protocol_name.as_deref(), Some("EFI_LOADED_IMAGE_PROTOCOL"));
    assert_eq!(record.namespace, Some(GuidNamespace::Edk2Guids));
    assert_eq!(summary.proprietary, 0);

    let plan = AnnotationPlanner::new(&img, &config, &db).plan(&set);
    assert_eq!(plan.name_for(GUID_ADDR), Some("EFI_LOADED_IMAGE_PROTOCOL_0x10003000"));
}

#[test]
fn zero_guid_keeps_the_call_but_records_nothing() {
    let (mut img, call) = module_with_guid([0; 16]);
    let db = GuidDatabase::bundled().expect("bundled databases");
    let config = ScanConfig::default();

    let (_, set, summary) =
        analyze_module(&x64_driver_header(), &mut img, &db, &config).expect("analysis");
    assert_eq!(set.call_sites.len(), 1);
    assert_eq!(set.call_sites[0].address, call);
    assert!(set.records.is_empty());
    assert_eq!(summary.records, 0);
}

#[test]
fn unknown_guid_resolves_to_the_proprietary_sentinel() {
    let (mut img, _) = module_with_guid(common::UNKNOWN_GUID);
    let db = GuidDatabase::bundled().expect("bundled databases");
    let config = ScanConfig::default();

    let (_, set, summary) =
        analyze_module(&x64_driver_header(), &mut img, &db, &config).expect("analysis");
    assert_eq!(summary.proprietary, 1);
    assert_eq!(set.records[0].protocol_name.as_deref(), Some("ProprietaryProtocol"));
    assert_eq!(set.records[0].namespace, Some(GuidNamespace::Unknown));
}

/// Facade that counts every query, to prove nothing reached it.
struct Spy {
    inner: ModuleImage,
    queries: Cell<usize>,
}

impl Spy {
    fn touch(&self) {
        self.queries.set(self.queries.get() + 1);
    }
}

impl DisassemblyFacade for Spy {
    fn architecture(&self) -> Architecture {
        self.touch();
        self.inner.architecture()
    }

    fn image_base(&self) -> u64 {
        self.touch();
        self.inner.image_base()
    }

    fn enumerate_functions(&self) -> Vec<u64> {
        self.touch();
        self.inner.enumerate_functions()
    }

    fn enumerate_instructions(&self, function_start: u64) -> Vec<u64> {
        self.touch();
        self.inner.enumerate_instructions(function_start)
    }

    fn instruction_mnemonic(&self, address: u64) -> String {
        self.touch();
        self.inner.instruction_mnemonic(address)
    }

    fn operand_type(&self, address: u64, index: usize) -> OperandKind {
        self.touch();
        self.inner.operand_type(address, index)
    }

    fn operand_value(&self, address: u64, index: usize) -> u64 {
        self.touch();
        self.inner.operand_value(address, index)
    }

    fn read_bytes(&self, address: u64, length: usize) -> Result<Vec<u8>, FacadeError> {
        self.touch();
        self.inner.read_bytes(address, length)
    }

    fn data_cross_references_from(&self, address: u64) -> Vec<u64> {
        self.touch();
        self.inner.data_cross_references_from(address)
    }

    fn segments(&self) -> Vec<Segment> {
        self.touch();
        self.inner.segments()
    }

    fn name_at(&self, address: u64) -> Option<String> {
        self.touch();
        self.inner.name_at(address)
    }

    fn type_at(&self, address: u64) -> Option<TypeDescriptor> {
        self.touch();
        self.inner.type_at(address)
    }

    fn comment_at(&self, address: u64) -> Option<String> {
        self.touch();
        self.inner.comment_at(address)
    }

    fn set_type(&mut self, address: u64, ty: &TypeDescriptor) -> Result<(), FacadeError> {
        self.touch();
        self.inner.set_type(address, ty)
    }

    fn set_name(&mut self, address: u64, name: &str) -> Result<(), FacadeError> {
        self.touch();
        self.inner.set_name(address, name)
    }

    fn set_comment(&mut self, address: u64, comment: &str) -> Result<(), FacadeError> {
        self.touch();
        self.inner.set_comment(address, comment)
    }
}

#[test]
fn rejected_subsystem_never_reaches_the_facade() {
    let (img, _) = module_with_guid(LOADED_IMAGE_GUID);
    let mut spy = Spy { inner: img, queries: Cell::new(0) };
    let db = GuidDatabase::bundled().expect("bundled databases");
    let config = ScanConfig::default();

    let err = analyze_module(&pe_header(0x8664, 2), &mut spy, &db, &config)
        .expect_err("windows GUI subsystem must be rejected");
    assert!(matches!(err, SessionError::Precondition(PreconditionError::UnsupportedSubsystem(2))));
    assert_eq!(spy.queries.get(), 0);
}

#[test]
fn annotating_twice_is_a_no_op_the_second_time() {
    let (mut img, call) = module_with_guid(LOADED_IMAGE_GUID);
    let db = GuidDatabase::bundled().expect("bundled databases");
    let config = ScanConfig::default();

    let mut session = AnalysisSession::new(&mut img, &db, &config).expect("session");
    session.run();
    let first_plan = session.plan_annotations(false);
    let first = session.annotate(false);
    assert!(!first.is_empty());
    assert_eq!(first.applied(), first.results.len());

    let second_plan = session.plan_annotations(false);
    assert_eq!(first_plan, second_plan);
    let second = session.annotate(false);
    assert_eq!(second.applied(), 0);
    assert_eq!(second.already_applied(), second.results.len());
    assert!(!second.has_failures());
    drop(session);

    assert_eq!(img.comment_at(call).as_deref(), Some("EFI_BOOT_SERVICES->HandleProtocol"));
    assert_eq!(img.type_at(GUID_ADDR), Some(TypeDescriptor::EfiGuidPtr));
}

#[test]
fn refused_writes_are_reported_and_the_rest_still_applies() {
    let (mut img, call) = module_with_guid(LOADED_IMAGE_GUID);
    img.protect(GUID_ADDR);
    let db = GuidDatabase::bundled().expect("bundled databases");
    let config = ScanConfig::default();

    let mut session = AnalysisSession::new(&mut img, &db, &config).expect("session");
    session.run();
    let report = session.annotate(false);
    assert_eq!(report.failures().count(), 2);
    assert_eq!(report.applied(), 1);
    drop(session);

    assert!(img.comment_at(call).is_some());
    assert!(img.name_at(GUID_ADDR).is_none());
}
