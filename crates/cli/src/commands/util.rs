use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use bootscope_core::backends::{BackendRegistry, LoadedModule};
use bootscope_core::config::ScanConfig;
use bootscope_core::db::{ProjectDb, ProjectLayout};
use bootscope_core::guids::GuidDatabase;

/// Create the metadata directory if needed and open the run history.
pub fn open_project_db(layout: &ProjectLayout) -> Result<ProjectDb> {
    fs::create_dir_all(&layout.meta_dir)
        .with_context(|| format!("Failed to create meta dir: {}", layout.meta_dir.display()))?;
    ProjectDb::open(&layout.db_path).with_context(|| {
        format!("Failed to open project database: {}", layout.db_path.display())
    })
}

/// `--config` when given, else the project's `.bootscope/config.yaml`, else defaults.
pub fn load_scan_config(layout: &ProjectLayout, config: Option<&str>) -> Result<ScanConfig> {
    match config {
        Some(path) => ScanConfig::load(Path::new(path))
            .with_context(|| format!("Failed to load scan config: {path}")),
        None => ScanConfig::load_or_default(&layout.config_path).with_context(|| {
            format!("Failed to load scan config: {}", layout.config_path.display())
        }),
    }
}

pub fn load_guid_database(config: &ScanConfig) -> Result<GuidDatabase> {
    GuidDatabase::load(&config.databases).context("Failed to load GUID databases")
}

pub fn resolve_module_path(module: &str) -> Result<PathBuf> {
    let path = PathBuf::from(module);
    if !path.is_file() {
        return Err(anyhow!("Module file does not exist: {}", path.display()));
    }
    Ok(path)
}

/// Open `module` with the named backend, seeding annotations from `previous`.
pub fn open_module(
    backend: &str,
    module: &Path,
    previous: Option<&Path>,
) -> Result<Box<dyn LoadedModule>> {
    let registry = BackendRegistry::with_defaults();
    let Some(selected) = registry.get(backend) else {
        return Err(anyhow!(
            "Unknown backend '{}'. Available: {}",
            backend,
            registry.names().join(", ")
        ));
    };
    selected
        .open(module, previous)
        .with_context(|| format!("{} backend failed to open {}", backend, module.display()))
}
