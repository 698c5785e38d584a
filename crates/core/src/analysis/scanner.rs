//! Protocol GUID recovery.
//!
//! For every located call the scanner walks backwards over the preceding
//! instructions of the same function and looks for the one that materializes
//! the GUID pointer. 32-bit code pushes it onto the stack; 64-bit code loads it
//! into a parameter register with `lea`. The strategy is picked once per
//! session from the module architecture.

use tracing::debug;

use crate::config::ScanConfig;
use crate::facade::{DisassemblyFacade, OperandKind};
use crate::model::{
    looks_like_guid, Architecture, CallSite, GuidUsageRecord, GuidValue, WorkingSet, GUID_LEN,
};

/// Finds the instruction that carries a call's GUID argument.
pub trait GuidOperandStrategy {
    /// How many preceding instructions are inspected.
    fn window(&self) -> usize;

    /// The pointer operand of `address` if it is the GUID-bearing instruction.
    fn guid_operand(&self, facade: &dyn DisassemblyFacade, address: u64, base: u64)
        -> Option<u64>;
}

/// `push <absolute address>` (stdcall argument passing on IA-32).
///
/// Only immediate and direct memory operands qualify; `push [ebp-4]` carries a
/// frame displacement, not an address.
#[derive(Debug, Clone, Copy)]
pub struct StackPushStrategy {
    pub window: usize,
}

impl GuidOperandStrategy for StackPushStrategy {
    fn window(&self) -> usize {
        self.window
    }

    fn guid_operand(
        &self,
        facade: &dyn DisassemblyFacade,
        address: u64,
        base: u64,
    ) -> Option<u64> {
        let direct =
            matches!(facade.operand_type(address, 0), OperandKind::Immediate | OperandKind::Memory);
        if facade.instruction_mnemonic(address) != "push" || !direct {
            return None;
        }
        let value = facade.operand_value(address, 0);
        (value > base).then_some(value)
    }
}

/// `lea <reg>, [address]` (register argument passing on x64). Stack and
/// register-relative sources such as `[rbp-8]` are skipped.
#[derive(Debug, Clone, Copy)]
pub struct LeaStrategy {
    pub window: usize,
}

impl GuidOperandStrategy for LeaStrategy {
    fn window(&self) -> usize {
        self.window
    }

    fn guid_operand(
        &self,
        facade: &dyn DisassemblyFacade,
        address: u64,
        base: u64,
    ) -> Option<u64> {
        if facade.instruction_mnemonic(address) != "lea"
            || facade.operand_type(address, 1) != OperandKind::Memory
        {
            return None;
        }
        let value = facade.operand_value(address, 1);
        (value > base).then_some(value)
    }
}

/// Strategy for `arch`, or `None` for architectures we do not analyze.
pub fn strategy_for(
    arch: Architecture,
    config: &ScanConfig,
) -> Option<Box<dyn GuidOperandStrategy>> {
    match arch {
        Architecture::X86 => Some(Box::new(StackPushStrategy { window: config.x86_window })),
        Architecture::X64 => Some(Box::new(LeaStrategy { window: config.x64_window })),
        Architecture::Unknown => None,
    }
}

/// Instructions preceding `address` inside `function`, nearest first, at most `window`.
pub(crate) fn preceding_instructions(
    facade: &dyn DisassemblyFacade,
    function: u64,
    address: u64,
    window: usize,
) -> Vec<u64> {
    let items = facade.enumerate_instructions(function);
    let end = items.partition_point(|&ea| ea < address);
    items[..end].iter().rev().take(window).copied().collect()
}

pub struct ProtocolScanner<'a> {
    facade: &'a dyn DisassemblyFacade,
    strategy: Box<dyn GuidOperandStrategy>,
    threshold: usize,
}

impl<'a> ProtocolScanner<'a> {
    pub fn new(
        facade: &'a dyn DisassemblyFacade,
        strategy: Box<dyn GuidOperandStrategy>,
        threshold: usize,
    ) -> Self {
        Self { facade, strategy, threshold }
    }

    /// Address of the GUID-bearing instruction for `site`, if the window holds one.
    pub fn find_guid_operand(&self, site: &CallSite) -> Option<(u64, u64)> {
        let base = self.facade.image_base();
        preceding_instructions(self.facade, site.function, site.address, self.strategy.window())
            .into_iter()
            .find_map(|ea| self.strategy.guid_operand(self.facade, ea, base).map(|v| (ea, v)))
    }

    /// Validated GUIDs feeding `site`. Empty when nothing plausible was found.
    pub fn recover(&self, site: &CallSite) -> Vec<GuidUsageRecord> {
        let Some((insn, operand)) = self.find_guid_operand(site) else {
            debug!("no GUID operand before call at {:#x}", site.address);
            return Vec::new();
        };

        let mut candidates = self.facade.data_cross_references_from(insn);
        if candidates.is_empty() {
            candidates.push(operand);
        }

        candidates
            .into_iter()
            // Decoded code at the target means the operand is not a data pointer.
            .filter(|&ea| self.facade.instruction_mnemonic(ea).is_empty())
            .filter_map(|ea| {
                let bytes = self.facade.read_bytes(ea, GUID_LEN).ok()?;
                if !looks_like_guid(&bytes, self.threshold) {
                    debug!("rejected GUID candidate at {ea:#x}");
                    return None;
                }
                let guid = GuidValue::from_slice(&bytes).ok()?;
                Some(GuidUsageRecord::new(ea, site.service, guid))
            })
            .collect()
    }

    /// Recover GUIDs for every call site in `set`; returns the number of new records.
    pub fn scan(&self, set: &mut WorkingSet) -> usize {
        let mut found = Vec::new();
        for site in &set.call_sites {
            found.extend(self.recover(site));
        }
        let mut added = 0;
        for record in found {
            let (address, service, guid) = (record.address, record.service, record.guid);
            if set.insert_record(record) {
                debug!("{service} uses GUID {guid} stored at {address:#x}");
                added += 1;
            }
        }
        added
    }
}
