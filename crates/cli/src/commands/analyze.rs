use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bootscope_core::analysis::{ensure_architecture, AnalysisSession, SessionError, SessionSummary};
use bootscope_core::annotate::AnnotationReport;
use bootscope_core::config::ScanConfig;
use bootscope_core::db::{AnalysisRunRecord, ProjectLayout, RunStatus};
use bootscope_core::guids::GuidDatabase;
use bootscope_core::header::{inspect_header, read_header_prefix, ModuleInfo};
use bootscope_core::model::WorkingSet;
use bootscope_core::report::{render_working_set, SessionReport};
use chrono::Utc;
use tracing::info;

use crate::commands::{
    load_guid_database, load_scan_config, open_module, open_project_db, resolve_module_path,
};
use crate::{module_digest, module_name, project_root};

/// Flags of the `analyze` command.
#[derive(Debug, Clone)]
pub struct AnalyzeOptions {
    pub backend: String,
    pub root: String,
    pub config: Option<String>,
    pub annotate: bool,
    pub sweep: bool,
    pub json: bool,
    pub history: bool,
}

impl Default for AnalyzeOptions {
    fn default() -> Self {
        Self {
            backend: "capstone".to_string(),
            root: ".".to_string(),
            config: None,
            annotate: true,
            sweep: false,
            json: false,
            history: true,
        }
    }
}

/// Pre-check, locate, recover, resolve and (optionally) annotate one module.
///
/// A module that fails the header pre-check is recorded as a rejected run and
/// never reaches the backend. Later failures are recorded as failed runs.
pub fn analyze_command(module: &str, options: &AnalyzeOptions) -> Result<SessionReport> {
    let root_path = project_root(&options.root)?;
    let layout = ProjectLayout::new(&root_path);
    let module_path = resolve_module_path(module)?;
    let name = module_name(&module_path);
    let config = load_scan_config(&layout, options.config.as_deref())?;
    let db = load_guid_database(&config)?;
    let started_at = Utc::now().to_rfc3339();

    let header = read_header_prefix(&module_path)
        .with_context(|| format!("Failed to read module header: {}", module_path.display()))?;
    let info = match inspect_header(&header) {
        Ok(info) => info,
        Err(err) => {
            if options.history {
                let run = unfinished_run(
                    &name,
                    &module_path,
                    options,
                    "unknown",
                    RunStatus::Rejected,
                    &started_at,
                );
                record_run(&layout, &run)?;
            }
            return Err(anyhow::Error::new(err).context(format!("Module {name} rejected")));
        }
    };
    info!("{name}: {} {}", info.arch, info.subsystem_name());

    let (summary, annotations, working_set, saved) =
        match run_session(&layout, &name, &module_path, &info, &db, &config, options) {
            Ok(outcome) => outcome,
            Err(err) => {
                if options.history {
                    let status = match err.downcast_ref::<SessionError>() {
                        Some(session_err) if session_err.is_rejection() => RunStatus::Rejected,
                        _ => RunStatus::Failed,
                    };
                    let arch = info.arch.to_string();
                    let run =
                        unfinished_run(&name, &module_path, options, &arch, status, &started_at);
                    record_run(&layout, &run)?;
                }
                return Err(err.context(format!("Analysis of {name} failed")));
            }
        };

    if options.history {
        let (applied, failed) = annotations
            .as_ref()
            .map(|r| (r.applied() as u32, r.failures().count() as u32))
            .unwrap_or((0, 0));
        let record = AnalysisRunRecord {
            module: name.clone(),
            module_hash: Some(module_digest(&module_path)?),
            arch: info.arch.to_string(),
            backend: options.backend.clone(),
            status: RunStatus::Succeeded,
            started_at,
            finished_at: Utc::now().to_rfc3339(),
            annotations_applied: applied,
            annotations_failed: failed,
        };
        let project_db = open_project_db(&layout)?;
        let run_id = project_db.insert_run(&record).context("Failed to insert analysis run")?;
        project_db
            .insert_working_set(run_id, &working_set)
            .context("Failed to store analysis results")?;
    }

    let report = SessionReport {
        module: name,
        info,
        backend: options.backend.clone(),
        summary,
        working_set,
        annotations,
        saved,
    };

    if options.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(report)
}

type SessionOutcome = (SessionSummary, Option<AnnotationReport>, WorkingSet, Vec<PathBuf>);

/// Open the module with the selected backend, run one pass and save annotations.
fn run_session(
    layout: &ProjectLayout,
    name: &str,
    module_path: &Path,
    info: &ModuleInfo,
    db: &GuidDatabase,
    config: &ScanConfig,
    options: &AnalyzeOptions,
) -> Result<SessionOutcome> {
    let previous = layout.annotation_project_path(name);
    let mut loaded = open_module(&options.backend, module_path, Some(&previous))?;
    ensure_architecture(info, loaded.facade())?;

    let (summary, annotations, working_set) = {
        let mut session = AnalysisSession::new(loaded.facade_mut(), db, config)?;
        let summary = session.run();
        let annotations = options.annotate.then(|| session.annotate(options.sweep));
        (summary, annotations, session.into_working_set())
    };

    let saved = if options.annotate {
        loaded.save(layout, name).context("Failed to save annotations")?
    } else {
        Vec::new()
    };
    Ok((summary, annotations, working_set, saved))
}

fn unfinished_run(
    name: &str,
    module_path: &Path,
    options: &AnalyzeOptions,
    arch: &str,
    status: RunStatus,
    started_at: &str,
) -> AnalysisRunRecord {
    AnalysisRunRecord {
        module: name.to_string(),
        module_hash: module_digest(module_path).ok(),
        arch: arch.to_string(),
        backend: options.backend.clone(),
        status,
        started_at: started_at.to_string(),
        finished_at: Utc::now().to_rfc3339(),
        annotations_applied: 0,
        annotations_failed: 0,
    }
}

fn record_run(layout: &ProjectLayout, record: &AnalysisRunRecord) -> Result<()> {
    let project_db = open_project_db(layout)?;
    project_db.insert_run(record).context("Failed to insert analysis run")?;
    Ok(())
}

fn print_annotations(report: &AnnotationReport) {
    if report.is_empty() {
        println!("Annotations: nothing to apply");
        return;
    }
    println!(
        "Annotations: {} applied, {} already applied, {} failed",
        report.applied(),
        report.already_applied(),
        report.failures().count()
    );
    for failure in report.failures() {
        println!("  - {:#x} {}", failure.annotation.address, failure.annotation.action);
    }
}

fn print_report(report: &SessionReport) {
    println!("Module: {} ({}, {})", report.module, report.info.arch, report.info.subsystem_name());
    println!("Backend: {}", report.backend);
    println!();
    println!("{}", render_working_set(&report.working_set));
    if let Some(annotations) = &report.annotations {
        print_annotations(annotations);
    }
    for path in &report.saved {
        println!("Saved: {}", path.display());
    }
}
