//! Project layout and run history.
//!
//! - `ProjectLayout`: computed paths under a project root.
//! - `ProjectDb`: SQLite store of analysis runs with their call sites and
//!   GUID usages, schema-versioned through `PRAGMA user_version`.
//! - Row types (`AnalysisRunRecord`, `StoredRun`, `ProprietaryGuidEntry`).

pub mod layout;
pub mod models;
pub mod project_db;

pub use layout::ProjectLayout;
pub use models::{AnalysisRunRecord, ProprietaryGuidEntry, RunStatus, StoredRun};
pub use project_db::{DbError, DbResult, ProjectDb, CURRENT_SCHEMA_VERSION};
