//! Locating the global that holds the Boot Services table pointer.
//!
//! Compilers load `gBS` into `rax`/`eax` shortly before dispatching through it,
//! so the nearest `mov rax, [global]` preceding a call names the global.

use crate::analysis::scanner::preceding_instructions;
use crate::facade::{DisassemblyFacade, OperandKind};
use crate::model::CallSite;

const RAX: u64 = 0;

/// Address of the Boot Services global loaded before `site`, if any.
pub fn find_boot_services_global(
    facade: &dyn DisassemblyFacade,
    site: &CallSite,
    window: usize,
) -> Option<u64> {
    preceding_instructions(facade, site.function, site.address, window)
        .into_iter()
        .find(|&ea| {
            facade.instruction_mnemonic(ea) == "mov"
                && facade.operand_type(ea, 1) == OperandKind::Memory
                && facade.operand_type(ea, 0) == OperandKind::Register
                && facade.operand_value(ea, 0) == RAX
        })
        .map(|ea| facade.operand_value(ea, 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::{Instruction, ModuleImage, Operand};
    use crate::model::{Architecture, BootService};

    fn module(load: Instruction, gap: usize) -> (ModuleImage, CallSite) {
        let mut img = ModuleImage::new(Architecture::X64, 0x1000);
        let mut insns = vec![load];
        for i in 0..gap as u64 {
            insns.push(Instruction::new(0x1010 + i, 1, "nop"));
        }
        let call = 0x1010 + gap as u64;
        insns.push(Instruction::new(call, 6, "call").with_operand(Operand::displ(0x140)));
        img.add_function(0x1000, insns);
        (img, CallSite { address: call, service: BootService::LocateProtocol, function: 0x1000 })
    }

    fn load_rax(global: u64) -> Instruction {
        Instruction::new(0x1000, 7, "mov").with_operand(Operand::reg(0)).with_operand(Operand::mem(global))
    }

    #[test]
    fn finds_rax_load_from_global() {
        let (img, site) = module(load_rax(0x4000), 3);
        assert_eq!(find_boot_services_global(&img, &site, 10), Some(0x4000));
    }

    #[test]
    fn other_registers_and_distant_loads_are_ignored() {
        let rcx = Instruction::new(0x1000, 7, "mov")
            .with_operand(Operand::reg(1))
            .with_operand(Operand::mem(0x4000));
        let (img, site) = module(rcx, 1);
        assert_eq!(find_boot_services_global(&img, &site, 10), None);

        let (img, site) = module(load_rax(0x4000), 10);
        assert_eq!(find_boot_services_global(&img, &site, 10), None);
    }
}
