//! Boot Services call location and protocol GUID recovery.
//!
//! Stages run strictly in order over one module:
//! - `locator`: indirect calls through the Boot Services table
//! - `scanner`: the GUID operand feeding each call
//! - `gbs`: the global holding the Boot Services pointer
//! - `session`: owns the working set and drives the stages

pub mod gbs;
pub mod locator;
pub mod scanner;
pub mod session;

pub use locator::{boot_service_call_at, locate_boot_services};
pub use scanner::{strategy_for, GuidOperandStrategy, LeaStrategy, ProtocolScanner, StackPushStrategy};
pub use session::{
    analyze_module, ensure_architecture, AnalysisSession, SessionError, SessionSummary,
};
