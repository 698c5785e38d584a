use std::path::PathBuf;

use anyhow::{Context, Result};
use bootscope_core::analysis::analyze_module;
use bootscope_core::db::ProjectLayout;
use bootscope_core::header::{inspect_header, read_header_prefix};
use bootscope_core::report::append_proprietary_log;
use tracing::warn;

use crate::commands::{load_guid_database, load_scan_config, open_module, resolve_module_path};
use crate::{module_name, project_root};

/// Exit status after a successful logging pass.
pub const LOG_GUIDS_EXIT_OK: i32 = 1;
/// Exit status for a module that fails the header pre-check or whose decoded
/// architecture disagrees with its header.
pub const LOG_GUIDS_EXIT_INVALID: i32 = -1;
/// Exit status for operational failures (backend, config, database, log file).
pub const LOG_GUIDS_EXIT_ERROR: i32 = 2;

/// Analyze `module` and append its proprietary GUIDs to the log.
///
/// Returns the process exit status: [`LOG_GUIDS_EXIT_OK`] after logging,
/// [`LOG_GUIDS_EXIT_INVALID`] when the module is rejected. Any `Err` maps to
/// [`LOG_GUIDS_EXIT_ERROR`] in `main`.
pub fn log_guids_command(
    module: &str,
    log: Option<&str>,
    backend: &str,
    root: &str,
    config: Option<&str>,
) -> Result<i32> {
    let root_path = project_root(root)?;
    let layout = ProjectLayout::new(&root_path);
    let module_path = resolve_module_path(module)?;
    let name = module_name(&module_path);

    let header = read_header_prefix(&module_path)
        .with_context(|| format!("Failed to read module header: {}", module_path.display()))?;
    if let Err(err) = inspect_header(&header) {
        warn!("{name} rejected: {err}");
        eprintln!("Module {name} rejected: {err}");
        return Ok(LOG_GUIDS_EXIT_INVALID);
    }

    let config = load_scan_config(&layout, config)?;
    let db = load_guid_database(&config)?;
    let mut loaded = open_module(backend, &module_path, None)?;
    let (_, working_set, summary) = match analyze_module(&header, loaded.facade_mut(), &db, &config)
    {
        Ok(result) => result,
        Err(err) if err.is_rejection() => {
            warn!("{name} rejected: {err}");
            eprintln!("Module {name} rejected: {err}");
            return Ok(LOG_GUIDS_EXIT_INVALID);
        }
        Err(err) => {
            return Err(anyhow::Error::new(err).context(format!("Failed to analyze {name}")))
        }
    };

    let log_path = log.map(PathBuf::from).unwrap_or_else(|| layout.pp_guid_log_path.clone());
    let rows = append_proprietary_log(&log_path, &name, &working_set)
        .with_context(|| format!("Failed to update GUID log: {}", log_path.display()))?;

    println!(
        "{name}: {} call site(s), {} protocol usage(s), {rows} proprietary GUID(s) logged to {}",
        summary.call_sites,
        summary.records,
        log_path.display()
    );
    Ok(LOG_GUIDS_EXIT_OK)
}
