//! Vault Common - shared foundations for the vault workflow engine.
//!
//! This crate provides:
//! - The error taxonomy used by every loop and handler
//! - Configuration types, loading and environment overrides
//! - Logging setup
//! - The append-only audit ledger
//! - Small string utilities

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod audit;
pub mod config;
pub mod error;
pub mod logging;
pub mod util;

pub use audit::{AuditEntry, AuditEvent, AuditLedger, AuditQuery, AuditStatus, AuditSummary};
pub use config::{Config, WorkZone, WorkerRole};
pub use error::{Error, Result, ResultExt};

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use crate::audit::{AuditEvent, AuditLedger, AuditQuery, AuditStatus};
    pub use crate::config::{Config, WorkZone, WorkerRole};
    pub use crate::error::{Error, Result, ResultExt};
    pub use crate::logging::init_logging;
}
