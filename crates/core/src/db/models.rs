use serde::{Deserialize, Serialize};

/// Final state of an analysis run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    /// The header pre-check refused the module.
    Rejected,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Rejected => "rejected",
            RunStatus::Failed => "failed",
        }
    }

    /// Unknown strings decode as `Failed`.
    pub fn parse(value: &str) -> Self {
        match value {
            "succeeded" => RunStatus::Succeeded,
            "rejected" => RunStatus::Rejected,
            _ => RunStatus::Failed,
        }
    }
}

/// Bookkeeping for one `analyze` invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalysisRunRecord {
    /// File name of the module.
    pub module: String,
    /// SHA-256 of the module contents.
    pub module_hash: Option<String>,
    pub arch: String,
    pub backend: String,
    pub status: RunStatus,
    pub started_at: String,
    pub finished_at: String,
    #[serde(default)]
    pub annotations_applied: u32,
    #[serde(default)]
    pub annotations_failed: u32,
}

/// A stored run with its row id and result counts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredRun {
    pub id: i64,
    #[serde(flatten)]
    pub record: AnalysisRunRecord,
    pub call_sites: u32,
    pub protocols: u32,
}

/// One row of the proprietary GUID listing across all runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProprietaryGuidEntry {
    pub guid: String,
    pub module: String,
    pub service: String,
    pub address: u64,
}
