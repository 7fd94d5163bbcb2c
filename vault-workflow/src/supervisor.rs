//! Bounded supervision of scheduler-created records.
//!
//! A supervision re-checks one record on every scheduler tick until it lands
//! in Done or the iteration cap is reached, at which point it is released.
//! The set survives restarts in `.state/supervisor.json`.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vault_common::{AuditEvent, AuditLedger, AuditStatus, Error, Result};

use crate::state::State;
use crate::store::Vault;

const CATEGORY: &str = "scheduler";
pub const DEFAULT_MAX_ITERATIONS: u32 = 5;

/// One supervised record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Supervision {
    pub record: String,
    pub prompt: String,
    pub max_iterations: u32,
    pub current_iteration: u32,
    pub started_at: DateTime<Utc>,
}

/// Result of checking one supervision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Completed,
    Retry { iteration: u32 },
    Released,
}

#[derive(Debug, Clone)]
pub struct Supervisor {
    vault: Vault,
    ledger: Arc<AuditLedger>,
    path: PathBuf,
}

impl Supervisor {
    pub fn new(vault: Vault, ledger: Arc<AuditLedger>) -> Self {
        let path = vault.layout().state_file("supervisor.json");
        Self { vault, ledger, path }
    }

    /// Persisted supervisions. A corrupt state file is logged and treated as empty.
    pub fn load(&self) -> Result<Vec<Supervision>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&text) {
            Ok(list) => Ok(list),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Corrupt supervisor state, starting empty");
                Ok(Vec::new())
            }
        }
    }

    fn save(&self, list: &[Supervision]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(list)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Start supervising `record`, replacing any earlier supervision of it.
    pub fn start(&self, record: &str, prompt: &str, max_iterations: u32) -> Result<()> {
        if max_iterations == 0 {
            return Err(Error::InvalidInput("max_iterations must be greater than 0".into()));
        }
        let mut list = self.load()?;
        list.retain(|s| s.record != record);
        list.push(Supervision {
            record: record.to_string(),
            prompt: prompt.to_string(),
            max_iterations,
            current_iteration: 0,
            started_at: Utc::now(),
        });
        self.save(&list)?;
        tracing::info!(record, max_iterations, "Supervision started");
        Ok(())
    }

    pub fn active(&self) -> Result<Vec<Supervision>> {
        self.load()
    }

    /// Check every supervision once.
    pub fn check(&self) -> Result<Vec<(String, CheckOutcome)>> {
        let list = self.load()?;
        if list.is_empty() {
            return Ok(Vec::new());
        }

        let mut outcomes = Vec::with_capacity(list.len());
        let mut keep = Vec::with_capacity(list.len());

        for mut supervision in list {
            if self.vault.find(&supervision.record, &[State::Done]).is_ok() {
                tracing::info!(record = %supervision.record, "Supervised record completed");
                self.ledger.log(event("supervision_completed", &supervision));
                outcomes.push((supervision.record, CheckOutcome::Completed));
                continue;
            }

            supervision.current_iteration += 1;
            if supervision.current_iteration >= supervision.max_iterations {
                tracing::warn!(
                    record = %supervision.record,
                    iterations = supervision.current_iteration,
                    "Supervision cap reached, releasing"
                );
                self.ledger
                    .log(event("supervision_released", &supervision).status(AuditStatus::Skipped));
                outcomes.push((supervision.record, CheckOutcome::Released));
                continue;
            }

            tracing::debug!(
                record = %supervision.record,
                iteration = supervision.current_iteration,
                "Supervised record not done yet"
            );
            self.ledger.log(
                event("supervision_retry", &supervision).detail("prompt", supervision.prompt.clone()),
            );
            outcomes.push((
                supervision.record.clone(),
                CheckOutcome::Retry {
                    iteration: supervision.current_iteration,
                },
            ));
            keep.push(supervision);
        }

        self.save(&keep)?;
        Ok(outcomes)
    }
}

fn event(action: &str, supervision: &Supervision) -> AuditEvent {
    AuditEvent::new(CATEGORY, action)
        .record(supervision.record.clone())
        .detail("iteration", supervision.current_iteration)
        .detail("max_iterations", supervision.max_iterations)
}
