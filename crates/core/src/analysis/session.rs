use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::analysis::locator::locate_boot_services;
use crate::analysis::scanner::{strategy_for, ProtocolScanner};
use crate::annotate::{apply_plan, AnnotationPlan, AnnotationPlanner, AnnotationReport};
use crate::config::{ConfigError, ScanConfig};
use crate::facade::{DisassemblyFacade, FacadeError};
use crate::guids::{GuidDatabase, GuidDbError};
use crate::header::{inspect_header, ModuleInfo, PreconditionError};
use crate::model::{Architecture, WorkingSet};
use crate::tables::ServiceTable;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("module rejected: {0}")]
    Precondition(#[from] PreconditionError),
    #[error("header says {header} but the backend decoded {backend}")]
    ArchitectureMismatch { header: Architecture, backend: Architecture },
    #[error("cannot analyze architecture '{0}'")]
    UnsupportedArchitecture(Architecture),
    #[error(transparent)]
    Backend(#[from] FacadeError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    GuidDb(#[from] GuidDbError),
}

/// Counts from one pass, for logs and the run history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub call_sites: usize,
    pub records: usize,
    pub proprietary: usize,
}

/// One module, one pass: locate, recover, resolve, then optionally annotate.
///
/// The service table and scan strategy are fixed at construction from the
/// facade's architecture.
pub struct AnalysisSession<'a> {
    facade: &'a mut dyn DisassemblyFacade,
    table: &'static ServiceTable,
    db: &'a GuidDatabase,
    config: &'a ScanConfig,
    set: WorkingSet,
}

impl<'a> AnalysisSession<'a> {
    pub fn new(
        facade: &'a mut dyn DisassemblyFacade,
        db: &'a GuidDatabase,
        config: &'a ScanConfig,
    ) -> Result<Self, SessionError> {
        let arch = facade.architecture();
        let table = ServiceTable::for_arch(arch).ok_or(SessionError::UnsupportedArchitecture(arch))?;
        Ok(Self { facade, table, db, config, set: WorkingSet::new() })
    }

    pub fn architecture(&self) -> Architecture {
        self.table.arch
    }

    pub fn locate_boot_services(&mut self) -> usize {
        let added = locate_boot_services(&*self.facade, self.table, &mut self.set);
        info!("{} boot service call(s) located", self.set.call_sites.len());
        added
    }

    pub fn recover_protocols(&mut self) -> usize {
        let Some(strategy) = strategy_for(self.table.arch, self.config) else {
            return 0;
        };
        let scanner =
            ProtocolScanner::new(&*self.facade, strategy, self.config.guid_distinct_byte_threshold);
        let added = scanner.scan(&mut self.set);
        info!("{} protocol GUID usage(s) recovered", self.set.records.len());
        added
    }

    /// Resolve every record; returns the number left proprietary.
    pub fn resolve_protocols(&mut self) -> usize {
        let proprietary = self.db.resolve_all(&mut self.set);
        if proprietary > 0 {
            info!("{proprietary} GUID(s) not found in any database");
        }
        proprietary
    }

    /// Locate, recover and resolve.
    pub fn run(&mut self) -> SessionSummary {
        self.locate_boot_services();
        self.recover_protocols();
        let proprietary = self.resolve_protocols();
        SessionSummary {
            call_sites: self.set.call_sites.len(),
            records: self.set.records.len(),
            proprietary,
        }
    }

    pub fn plan_annotations(&self, sweep: bool) -> AnnotationPlan {
        let planner = AnnotationPlanner::new(&*self.facade, self.config, self.db);
        let mut plan = planner.plan(&self.set);
        if sweep {
            planner.plan_sweep(&mut plan);
        }
        plan
    }

    pub fn annotate(&mut self, sweep: bool) -> AnnotationReport {
        let plan = self.plan_annotations(sweep);
        apply_plan(&mut *self.facade, &plan)
    }

    pub fn working_set(&self) -> &WorkingSet {
        &self.set
    }

    pub fn into_working_set(self) -> WorkingSet {
        self.set
    }
}

/// The backend must have decoded the architecture the header declares.
pub fn ensure_architecture(
    info: &ModuleInfo,
    facade: &dyn DisassemblyFacade,
) -> Result<(), SessionError> {
    let decoded = facade.architecture();
    if decoded != info.arch {
        return Err(SessionError::ArchitectureMismatch { header: info.arch, backend: decoded });
    }
    Ok(())
}

impl SessionError {
    /// The module itself is unsuitable, as opposed to an operational failure.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            SessionError::Precondition(_)
                | SessionError::ArchitectureMismatch { .. }
                | SessionError::UnsupportedArchitecture(_)
        )
    }
}

/// Header pre-check, then a full pass. Nothing touches the facade when the
/// header is rejected.
pub fn analyze_module(
    header: &[u8],
    facade: &mut dyn DisassemblyFacade,
    db: &GuidDatabase,
    config: &ScanConfig,
) -> Result<(ModuleInfo, WorkingSet, SessionSummary), SessionError> {
    let info = inspect_header(header)?;
    ensure_architecture(&info, facade)?;
    let mut session = AnalysisSession::new(facade, db, config)?;
    let summary = session.run();
    Ok((info, session.into_working_set(), summary))
}
