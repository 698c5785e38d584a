// crates/cli/tests/commands.rs
#[path = "../../core/tests/common/mod.rs"]
mod common;

use std::path::Path;

use bootscope::commands::{analyze_command, history_command, AnalyzeOptions};
use bootscope::{module_digest, module_name};
use bootscope_core::db::{ProjectDb, ProjectLayout, RunStatus};
use tempfile::tempdir;

use common::{build_pe, CALL_ADDR, LOADED_IMAGE_GUID};

#[test]
fn analyze_without_annotation_saves_nothing() {
    let temp = tempdir().expect("tempdir");
    let module = temp.path().join("Driver.efi");
    std::fs::write(&module, build_pe(LOADED_IMAGE_GUID)).expect("write module");

    let options = AnalyzeOptions {
        root: temp.path().to_string_lossy().to_string(),
        annotate: false,
        json: true,
        ..AnalyzeOptions::default()
    };
    let report = analyze_command(&module.to_string_lossy(), &options).expect("analyze");
    assert_eq!(report.working_set.call_sites[0].address, CALL_ADDR);
    assert!(report.annotations.is_none());
    assert!(report.saved.is_empty());

    let layout = ProjectLayout::new(temp.path());
    assert!(!layout.annotation_project_path("Driver.efi").exists());

    let db = ProjectDb::open(&layout.db_path).expect("open db");
    let runs = db.list_runs(Some("Driver.efi")).expect("runs");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].record.status, RunStatus::Succeeded);
    let digest = module_digest(&module).expect("hash");
    assert_eq!(runs[0].record.module_hash.as_deref(), Some(digest.as_str()));
}

#[test]
fn no_history_leaves_the_project_db_alone() {
    let temp = tempdir().expect("tempdir");
    let module = temp.path().join("Driver.efi");
    std::fs::write(&module, build_pe(LOADED_IMAGE_GUID)).expect("write module");

    let options = AnalyzeOptions {
        root: temp.path().to_string_lossy().to_string(),
        history: false,
        ..AnalyzeOptions::default()
    };
    let report = analyze_command(&module.to_string_lossy(), &options).expect("analyze");
    assert_eq!(report.saved.len(), 1);
    assert!(!ProjectLayout::new(temp.path()).db_path.exists());
}

#[test]
fn config_file_overrides_the_scan_window() {
    let temp = tempdir().expect("tempdir");
    let module = temp.path().join("Driver.efi");
    std::fs::write(&module, build_pe(LOADED_IMAGE_GUID)).expect("write module");
    let config = temp.path().join("scan.yaml");
    // The lea sits two instructions before the call.
    std::fs::write(&config, "x64_window: 1\n").expect("write config");

    let options = AnalyzeOptions {
        root: temp.path().to_string_lossy().to_string(),
        config: Some(config.to_string_lossy().to_string()),
        annotate: false,
        history: false,
        ..AnalyzeOptions::default()
    };
    let report = analyze_command(&module.to_string_lossy(), &options).expect("analyze");
    assert_eq!(report.summary.call_sites, 1);
    assert_eq!(report.summary.records, 0);
}

#[test]
fn missing_module_is_an_error() {
    let temp = tempdir().expect("tempdir");
    let options = AnalyzeOptions {
        root: temp.path().to_string_lossy().to_string(),
        ..AnalyzeOptions::default()
    };
    let err = analyze_command("/nonexistent/Driver.efi", &options).unwrap_err();
    assert!(err.to_string().contains("Module file does not exist"), "unexpected error: {err}");
}

#[test]
fn history_on_an_empty_project_succeeds() {
    let temp = tempdir().expect("tempdir");
    history_command(&temp.path().to_string_lossy(), None, false, false).expect("history");
    history_command(&temp.path().to_string_lossy(), None, true, true).expect("proprietary history");
}

#[test]
fn module_name_is_the_file_name() {
    assert_eq!(module_name(Path::new("/fw/Driver.efi")), "Driver.efi");
    assert_eq!(module_name(Path::new("/")), "module");
}
