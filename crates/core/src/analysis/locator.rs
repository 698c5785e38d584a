use tracing::debug;

use crate::facade::{DisassemblyFacade, OperandKind};
use crate::model::{CallSite, WorkingSet};
use crate::tables::ServiceTable;

/// True when `address` is `call [reg + disp]` with `disp` matching a table slot.
pub fn boot_service_call_at(
    facade: &dyn DisassemblyFacade,
    table: &ServiceTable,
    address: u64,
) -> Option<crate::model::BootService> {
    if facade.instruction_mnemonic(address) != "call" {
        return None;
    }
    if facade.operand_type(address, 0) != OperandKind::Displacement {
        return None;
    }
    table.service_at(facade.operand_value(address, 0))
}

/// Scan every instruction of every function for Boot Services calls.
///
/// Call sites are appended to `set` in function-enumeration order; addresses
/// already present are skipped, so repeated runs are idempotent. Returns the
/// number of newly recorded call sites.
pub fn locate_boot_services(
    facade: &dyn DisassemblyFacade,
    table: &ServiceTable,
    set: &mut WorkingSet,
) -> usize {
    let mut added = 0;
    for function in facade.enumerate_functions() {
        for address in facade.enumerate_instructions(function) {
            let Some(service) = boot_service_call_at(facade, table, address) else { continue };
            if set.insert_call_site(CallSite { address, service, function }) {
                debug!("boot service call {service} at {address:#x}");
                added += 1;
            }
        }
    }
    added
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::{Instruction, ModuleImage, Operand};
    use crate::model::{Architecture, BootService};
    use crate::tables::{X64_TABLE, X86_TABLE};

    fn module_with_call(arch: Architecture, disp: u64) -> ModuleImage {
        let mut img = ModuleImage::new(arch, 0x10000);
        img.add_section(".text", 0x10000, vec![0x90; 0x100], true);
        img.add_function(
            0x10000,
            vec![
                Instruction::new(0x10000, 3, "mov")
                    .with_operand(Operand::reg(0))
                    .with_operand(Operand::displ(0x60)),
                Instruction::new(0x10003, 6, "call").with_operand(Operand::displ(disp)),
                Instruction::new(0x10009, 1, "ret"),
            ],
        );
        img
    }

    #[test]
    fn every_table_entry_yields_exactly_one_call_site() {
        for table in [&X64_TABLE, &X86_TABLE] {
            for entry in table.entries {
                let img = module_with_call(table.arch, entry.offset);
                let mut set = WorkingSet::new();
                assert_eq!(locate_boot_services(&img, table, &mut set), 1);
                assert_eq!(set.call_sites.len(), 1);
                assert_eq!(set.call_sites[0].service, entry.service);
                assert_eq!(set.call_sites[0].address, 0x10003);

                assert_eq!(locate_boot_services(&img, table, &mut set), 0, "rerun adds nothing");
                assert_eq!(set.call_sites.len(), 1);
            }
        }
    }

    #[test]
    fn unrelated_displacement_or_direct_call_is_ignored() {
        let img = module_with_call(Architecture::X64, 0x40);
        let mut set = WorkingSet::new();
        assert_eq!(locate_boot_services(&img, &X64_TABLE, &mut set), 0);
        assert!(set.call_sites.is_empty());

        let mut img = ModuleImage::new(Architecture::X64, 0x10000);
        img.add_function(
            0x10000,
            vec![Instruction::new(0x10000, 5, "call")
                .with_operand(Operand::new(OperandKind::Near, 0x98))],
        );
        assert_eq!(locate_boot_services(&img, &X64_TABLE, &mut set), 0);
    }

    #[test]
    fn discovery_follows_function_order() {
        let mut img = ModuleImage::new(Architecture::X64, 0x10000);
        img.add_function(
            0x10100,
            vec![Instruction::new(0x10100, 6, "call").with_operand(Operand::displ(0x140))],
        );
        img.add_function(
            0x10000,
            vec![Instruction::new(0x10000, 6, "call").with_operand(Operand::displ(0x140))],
        );
        let mut set = WorkingSet::new();
        locate_boot_services(&img, &X64_TABLE, &mut set);
        let order: Vec<u64> =
            set.call_sites_for(BootService::LocateProtocol).map(|c| c.address).collect();
        assert_eq!(order, vec![0x10100, 0x10000]);
    }
}
