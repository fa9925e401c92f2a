use log::info;

use crate::types::{ExpectedEntry, VmTable};

#[derive(Debug, Default)]
pub struct StructureReport {
    pub(crate) failed: bool,
    pub(crate) report: String,
}

impl StructureReport {
    fn violation(&mut self, line: String) {
        self.failed = true;
        self.report.push_str(&line);
        self.report.push('\n');
    }
}

/// Check every expected VM placement against the extracted table.
/// All entries are checked so the report lists every discrepancy.
pub(crate) fn check_structure(vms: &VmTable, expected: &[ExpectedEntry]) -> StructureReport {
    let mut result = StructureReport::default();

    for entry in expected {
        let Some(vm) = vms.get(&entry.vm) else {
            result.violation(format!("VM {} not found in infrastructure", entry.vm));
            continue;
        };

        info!("Found vm: {}, vpc: {}, subnet: {}", vm.name, vm.vpc, vm.subnet);

        if vm.vpc != entry.vpc {
            result.violation(format!(
                "For {} expecting vpc {} got {}",
                vm.name, entry.vpc, vm.vpc
            ));
        }
        if vm.subnet != entry.sub {
            result.violation(format!(
                "For {} expecting subnet {} got {}",
                vm.name, entry.sub, vm.subnet
            ));
        }
    }

    result
}
