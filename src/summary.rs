//! `comfy-table` rendering shared by the end-of-run summary, `--list-modules`, and
//! `--status`.

use comfy_table::{presets::UTF8_FULL, Cell, Table};

use crate::module_registry::ModuleDir;
use crate::orchestrator::ModuleOutcome;
use crate::state_manager::StateManager;

pub fn run_summary_table(outcomes: &[(String, ModuleOutcome)]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(vec!["module", "outcome"]);
    for (name, outcome) in outcomes {
        table.add_row(vec![Cell::new(name), Cell::new(outcome.as_str())]);
    }
    table
}

pub fn list_modules_table(modules: &[&ModuleDir]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["name", "enabled", "schema_version", "description"]);
    for module in modules {
        table.add_row(vec![
            Cell::new(module.manifest.name()),
            Cell::new(module.manifest.metadata.enabled),
            Cell::new(module.manifest.metadata.schema_version.to_string()),
            Cell::new(&module.manifest.metadata.description),
        ]);
    }
    table
}

pub fn status_table(modules: &[&ModuleDir], state_manager: &StateManager) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(vec![
        "name",
        "enabled",
        "schema_version",
        "content_version",
        "has_backup",
    ]);
    for module in modules {
        table.add_row(vec![
            Cell::new(module.manifest.name()),
            Cell::new(module.manifest.metadata.enabled),
            Cell::new(module.manifest.metadata.schema_version.to_string()),
            Cell::new(
                module
                    .manifest
                    .metadata
                    .content_version
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ),
            Cell::new(state_manager.has_backup(module.manifest.name())),
        ]);
    }
    table
}
