//! Annotation planning and application.
//!
//! Planning is a pure read of the facade: it never mutates anything, so
//! running it twice over the same state yields the same plan. Applying a plan
//! checks each action against the facade first and only writes what is not
//! already in place; every action gets its own outcome in the report.

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;
use tracing::{info, warn};

use crate::analysis::gbs::find_boot_services_global;
use crate::config::ScanConfig;
use crate::facade::{is_auto_name, DisassemblyFacade, TypeDescriptor};
use crate::guids::GuidDatabase;
use crate::model::{BootService, GuidValue, WorkingSet, GUID_LEN};

const GBS_PREFIX: &str = "gBs_";

/// `EFI_BOOT_SERVICES-><Service>`
pub fn call_comment(service: BootService) -> String {
    format!("EFI_BOOT_SERVICES->{service}")
}

/// `<ProtocolName>_0x<addr>`
pub fn guid_name(protocol: &str, address: u64) -> String {
    format!("{protocol}_{address:#x}")
}

/// Name for the Boot Services global given whatever the host calls it today.
pub fn gbs_name(current: Option<&str>, address: u64) -> String {
    match current {
        Some(name) if name.starts_with(GBS_PREFIX) => name.to_string(),
        Some(name) if !name.is_empty() => format!("{GBS_PREFIX}{name}"),
        _ => format!("{GBS_PREFIX}{address:#x}"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AnnotationAction {
    Comment(String),
    SetType(TypeDescriptor),
    SetName(String),
}

impl AnnotationAction {
    fn kind(&self) -> u8 {
        match self {
            AnnotationAction::Comment(_) => 0,
            AnnotationAction::SetType(_) => 1,
            AnnotationAction::SetName(_) => 2,
        }
    }
}

impl fmt::Display for AnnotationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnnotationAction::Comment(text) => write!(f, "comment \"{text}\""),
            AnnotationAction::SetType(ty) => write!(f, "type {}", ty.as_str()),
            AnnotationAction::SetName(name) => write!(f, "name {name}"),
        }
    }
}

/// Why an annotation was planned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationOrigin {
    CallSite(BootService),
    GuidUsage(BootService),
    BootServicesGlobal,
    Sweep,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Annotation {
    pub address: u64,
    pub action: AnnotationAction,
    pub origin: AnnotationOrigin,
}

/// Ordered facade mutations; at most one action of each kind per address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AnnotationPlan {
    entries: Vec<Annotation>,
    #[serde(skip)]
    keys: BTreeSet<(u64, u8)>,
}

impl AnnotationPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry unless the address already has an action of that kind.
    pub fn push(&mut self, address: u64, action: AnnotationAction, origin: AnnotationOrigin) -> bool {
        if !self.keys.insert((address, action.kind())) {
            return false;
        }
        self.entries.push(Annotation { address, action, origin });
        true
    }

    pub fn entries(&self) -> &[Annotation] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if some entry already names `address`.
    pub fn names(&self, address: u64) -> bool {
        self.keys.contains(&(address, 2))
    }

    pub fn name_for(&self, address: u64) -> Option<&str> {
        self.entries.iter().find_map(|a| match &a.action {
            AnnotationAction::SetName(name) if a.address == address => Some(name.as_str()),
            _ => None,
        })
    }
}

pub struct AnnotationPlanner<'a> {
    facade: &'a dyn DisassemblyFacade,
    config: &'a ScanConfig,
    db: &'a GuidDatabase,
}

impl<'a> AnnotationPlanner<'a> {
    pub fn new(facade: &'a dyn DisassemblyFacade, config: &'a ScanConfig, db: &'a GuidDatabase) -> Self {
        Self { facade, config, db }
    }

    /// Comments for call sites, types and names for GUID storage and the
    /// Boot Services global.
    pub fn plan(&self, set: &WorkingSet) -> AnnotationPlan {
        let mut plan = AnnotationPlan::new();

        for site in &set.call_sites {
            plan.push(
                site.address,
                AnnotationAction::Comment(call_comment(site.service)),
                AnnotationOrigin::CallSite(site.service),
            );
        }

        for record in &set.records {
            let protocol = match &record.protocol_name {
                Some(name) => name.clone(),
                None => self.db.resolve(&record.guid).name,
            };
            let origin = AnnotationOrigin::GuidUsage(record.service);
            plan.push(record.address, AnnotationAction::SetType(TypeDescriptor::EfiGuidPtr), origin.clone());
            plan.push(record.address, AnnotationAction::SetName(guid_name(&protocol, record.address)), origin);
        }

        for site in &set.call_sites {
            let Some(global) = find_boot_services_global(self.facade, site, self.config.gbs_window)
            else {
                continue;
            };
            let origin = AnnotationOrigin::BootServicesGlobal;
            plan.push(global, AnnotationAction::SetType(TypeDescriptor::EfiBootServicesPtr), origin.clone());

            let current = self.facade.name_at(global);
            let typed = self.facade.type_at(global) == Some(TypeDescriptor::EfiBootServicesPtr);
            let already_gbs = current.as_deref().is_some_and(|n| n.starts_with(GBS_PREFIX));
            // A global typed by hand under its own name is left as the user named it.
            if !typed || already_gbs {
                plan.push(global, AnnotationAction::SetName(gbs_name(current.as_deref(), global)), origin);
            }
        }

        plan
    }

    /// Add type and name entries for known GUIDs stored in the sweep segments
    /// that no call site referenced.
    pub fn plan_sweep(&self, plan: &mut AnnotationPlan) -> usize {
        let mut added = 0;
        for segment in self.facade.segments() {
            if !self.config.sweep_segments.iter().any(|s| *s == segment.name) {
                continue;
            }
            let len = (segment.end - segment.start) as usize;
            let Ok(bytes) = self.facade.read_bytes(segment.start, len) else {
                warn!("cannot read segment {} for the GUID sweep", segment.name);
                continue;
            };

            let mut offset = 0;
            while offset + GUID_LEN <= bytes.len() {
                let window = &bytes[offset..offset + GUID_LEN];
                let ea = segment.start + offset as u64;
                if window[..4] == [0; 4] || plan.names(ea) {
                    offset += 1;
                    continue;
                }
                let Some(resolution) = GuidValue::from_slice(window).ok().and_then(|g| self.db.lookup(&g))
                else {
                    offset += 1;
                    continue;
                };
                let expected = guid_name(&resolution.name, ea);
                let current = self.facade.name_at(ea);
                if is_auto_name(current.as_deref()) || current.as_deref() == Some(expected.as_str()) {
                    plan.push(ea, AnnotationAction::SetType(TypeDescriptor::EfiGuidPtr), AnnotationOrigin::Sweep);
                    plan.push(ea, AnnotationAction::SetName(expected), AnnotationOrigin::Sweep);
                    added += 1;
                    offset += GUID_LEN;
                } else {
                    offset += 1;
                }
            }
        }
        added
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum AnnotationOutcome {
    Applied,
    AlreadyApplied,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnnotationResult {
    pub annotation: Annotation,
    pub outcome: AnnotationOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AnnotationReport {
    pub results: Vec<AnnotationResult>,
}

impl AnnotationReport {
    /// Nothing was planned, which is distinct from everything failing.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    fn count(&self, pred: impl Fn(&AnnotationOutcome) -> bool) -> usize {
        self.results.iter().filter(|r| pred(&r.outcome)).count()
    }

    pub fn applied(&self) -> usize {
        self.count(|o| *o == AnnotationOutcome::Applied)
    }

    pub fn already_applied(&self) -> usize {
        self.count(|o| *o == AnnotationOutcome::AlreadyApplied)
    }

    pub fn failures(&self) -> impl Iterator<Item = &AnnotationResult> {
        self.results.iter().filter(|r| matches!(r.outcome, AnnotationOutcome::Failed(_)))
    }

    pub fn has_failures(&self) -> bool {
        self.failures().next().is_some()
    }
}

fn is_satisfied(facade: &dyn DisassemblyFacade, annotation: &Annotation) -> bool {
    match &annotation.action {
        AnnotationAction::Comment(text) => facade.comment_at(annotation.address).as_deref() == Some(text),
        AnnotationAction::SetType(ty) => facade.type_at(annotation.address).as_ref() == Some(ty),
        AnnotationAction::SetName(name) => facade.name_at(annotation.address).as_deref() == Some(name),
    }
}

/// Apply every entry of `plan`. Failures are recorded and never stop the run.
pub fn apply_plan(facade: &mut dyn DisassemblyFacade, plan: &AnnotationPlan) -> AnnotationReport {
    let mut report = AnnotationReport::default();
    for annotation in plan.entries() {
        let outcome = if is_satisfied(facade, annotation) {
            AnnotationOutcome::AlreadyApplied
        } else {
            let address = annotation.address;
            let result = match &annotation.action {
                AnnotationAction::Comment(text) => facade.set_comment(address, text),
                AnnotationAction::SetType(ty) => facade.set_type(address, ty),
                AnnotationAction::SetName(name) => facade.set_name(address, name),
            };
            match result {
                Ok(()) => AnnotationOutcome::Applied,
                Err(err) => {
                    warn!("{} at {address:#x} not applied: {err}", annotation.action);
                    AnnotationOutcome::Failed(err.to_string())
                }
            }
        };
        report.results.push(AnnotationResult { annotation: annotation.clone(), outcome });
    }
    info!(
        applied = report.applied(),
        already = report.already_applied(),
        failed = report.failures().count(),
        "annotation pass finished"
    );
    report
}
