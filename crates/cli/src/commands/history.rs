use anyhow::{Context, Result};
use bootscope_core::db::ProjectLayout;

use crate::project_root;
use crate::commands::open_project_db;

/// List recorded analysis runs, or the proprietary GUIDs seen across them.
pub fn history_command(
    root: &str,
    module: Option<&str>,
    proprietary: bool,
    json: bool,
) -> Result<()> {
    let root_path = project_root(root)?;
    let layout = ProjectLayout::new(&root_path);
    let db = open_project_db(&layout)?;

    if proprietary {
        let guids = db.list_proprietary_guids().context("Failed to list proprietary GUIDs")?;
        if json {
            println!("{}", serde_json::to_string_pretty(&guids)?);
            return Ok(());
        }
        println!("Proprietary GUIDs:");
        if guids.is_empty() {
            println!("(none)");
            return Ok(());
        }
        for entry in guids {
            println!(
                "- {} (module: {}, service: {}, address: {:#x})",
                entry.guid, entry.module, entry.service, entry.address
            );
        }
        return Ok(());
    }

    let runs = db.list_runs(module).context("Failed to list analysis runs")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    println!("Analysis runs:");
    if runs.is_empty() {
        println!("(none)");
        return Ok(());
    }
    for run in runs {
        println!(
            "- #{} {} [{}] arch: {}, backend: {}, call sites: {}, protocols: {}, started: {}",
            run.id,
            run.record.module,
            run.record.status.as_str(),
            run.record.arch,
            run.record.backend,
            run.call_sites,
            run.protocols,
            run.record.started_at
        );
    }
    Ok(())
}
