//! Approval state machine.
//!
//! Every transition validates the edge against [`State::can_transition_to`],
//! moves the file and then stamps the header. The move is the commit point:
//! of two transitions racing on one record only the one whose rename succeeds
//! writes a header. A failed stamp moves the record back.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use vault_common::{AuditEvent, AuditLedger, AuditStatus, Error, Result, WorkZone};

use crate::claim::{claim, Claim};
use crate::executor::ExecutionReport;
use crate::record::{self, Header, Record};
use crate::state::State;
use crate::store::{ListOrder, Vault};

const CATEGORY: &str = "lifecycle";

/// Counts from a [`Lifecycle::reconcile`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub checked: usize,
    pub repaired: usize,
    /// Done records whose header disagrees; reported, never rewritten
    pub done_mismatches: usize,
}

/// Transition engine bound to one vault and one worker zone.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    vault: Vault,
    ledger: Arc<AuditLedger>,
    zone: WorkZone,
    approval_ttl: Option<Duration>,
}

impl Lifecycle {
    pub fn new(vault: Vault, ledger: Arc<AuditLedger>, zone: WorkZone) -> Self {
        Self {
            vault,
            ledger,
            zone,
            approval_ttl: None,
        }
    }

    /// Stamp `expires` this many hours after submission. Zero disables it.
    pub fn with_approval_ttl_hours(mut self, hours: u64) -> Self {
        self.approval_ttl = match i64::try_from(hours) {
            Ok(0) | Err(_) => None,
            Ok(h) => Some(Duration::hours(h)),
        };
        self
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    pub fn ledger(&self) -> &AuditLedger {
        &self.ledger
    }

    pub fn zone(&self) -> WorkZone {
        self.zone
    }

    // ========================================================================
    // Intake
    // ========================================================================

    /// Intake -> Claimed. `None` when another worker got there first.
    pub fn claim(&self, record: &Record) -> Result<Option<Record>> {
        let zone = self.zone.as_str();
        let claimed = self.take_intake(record, State::Claimed, |h| {
            h.set("claimed_by", zone);
            h.set("claimed_at", now_stamp());
        })?;
        if let Some(r) = &claimed {
            self.ledger
                .log(event("claimed", r).detail("zone", zone));
        }
        Ok(claimed)
    }

    /// Intake -> Done for records that need no action.
    pub fn skip(&self, record: &Record, reason: &str) -> Result<Option<Record>> {
        let skipped = self.take_intake(record, State::Done, |h| {
            h.set("outcome", "skipped");
            h.set("skip_reason", reason);
            h.set("completed_at", now_stamp());
        })?;
        if let Some(r) = &skipped {
            self.ledger.log(
                event("skipped", r)
                    .status(AuditStatus::Skipped)
                    .detail("reason", reason),
            );
        }
        Ok(skipped)
    }

    fn take_intake(
        &self,
        record: &Record,
        to: State,
        stamp: impl FnOnce(&mut Header),
    ) -> Result<Option<Record>> {
        let from = self.state_of(record)?;
        ensure_transition(from, to)?;
        if from != State::Intake {
            return Err(invalid(from, to));
        }

        let dest = self.vault.layout().dest_dir(to, &record.kind(), self.zone);
        let Some(path) = claim(&record.path, &dest)?.owned() else {
            return Ok(None);
        };

        // Re-read: the producer may have rewritten it since it was listed.
        let owned = self.vault.read(&path)?;
        let mut header = owned.header.clone();
        header.set("status", to.as_str());
        stamp(&mut header);
        self.vault.rewrite(&path, &header, &owned.body)?;
        self.vault.read(&path).map(Some)
    }

    // ========================================================================
    // Drafting & submission
    // ========================================================================

    /// Claimed -> Drafted. `draft` goes under `## Draft`; `None` leaves the
    /// body as it is.
    pub fn draft(&self, record: &Record, draft: Option<&str>, generated_by: &str) -> Result<Record> {
        let drafted = self.advance(record, State::Drafted, |header, body| {
            if let Some(text) = draft {
                *body = record::replace_section(body, "## Draft", text);
            }
            header.set("drafted_at", now_stamp());
            header.set("generated_by", generated_by);
        })?;
        self.ledger
            .log(event("drafted", &drafted).detail("generated_by", generated_by));
        Ok(drafted)
    }

    /// Audit a generator failure. The record stays claimed for the next pass.
    pub fn draft_failed(&self, record: &Record, error: &Error) {
        tracing::warn!(record = %record.id, error = %error, "Draft generation failed");
        self.ledger.log(event("draft_failed", record).error(error));
    }

    /// Drafted -> PendingApproval.
    pub fn submit(&self, record: &Record) -> Result<Record> {
        let ttl = self.approval_ttl;
        let submitted = self.advance(record, State::PendingApproval, |header, _| {
            let now = Utc::now();
            header.set("submitted_at", record::stamp(now));
            if let Some(ttl) = ttl {
                if !header.contains("expires") {
                    header.set("expires", record::stamp(now + ttl));
                }
            }
        })?;
        self.ledger.log(event("submitted", &submitted));
        Ok(submitted)
    }

    /// Replace the body of a record awaiting review.
    pub fn edit_content(&self, id: &str, content: &str, edited_by: &str) -> Result<Record> {
        let record = self.pending(id)?;
        let mut header = record.header.clone();
        header.set("last_edited", now_stamp());
        header.set("edited_by", edited_by);
        self.vault.rewrite(&record.path, &header, content)?;

        let edited = self.vault.read(&record.path)?;
        self.ledger
            .log(event("content_edited", &edited).detail("edited_by", edited_by));
        Ok(edited)
    }

    // ========================================================================
    // Decisions
    // ========================================================================

    /// PendingApproval -> Approved.
    ///
    /// An approval that arrives after `expires` rejects the record instead and
    /// fails with `ExpiredApproval`.
    pub fn approve(&self, id: &str, actor: &str, note: Option<&str>) -> Result<Record> {
        let record = self.pending(id)?;
        if is_expired(&record, Utc::now()) {
            self.reject_by_expiry(&record)?;
            return Err(Error::ExpiredApproval(id.to_string()));
        }

        let approved = self.advance(&record, State::Approved, |header, _| {
            header.set("approved_by", actor);
            header.set("approved_at", now_stamp());
            if let Some(note) = note.filter(|n| !n.trim().is_empty()) {
                header.set("approval_note", note);
            }
        })?;
        self.ledger.log(event("approved", &approved).detail("actor", actor));
        Ok(approved)
    }

    /// PendingApproval -> Rejected by a reviewer.
    pub fn reject(&self, id: &str, actor: &str, note: Option<&str>) -> Result<Record> {
        let record = self.pending(id)?;
        let rejected = self.reject_record(&record, actor, "rejected_by_reviewer", note)?;
        self.ledger.log(event("rejected", &rejected).detail("actor", actor));
        Ok(rejected)
    }

    fn reject_record(
        &self,
        record: &Record,
        actor: &str,
        reason: &str,
        note: Option<&str>,
    ) -> Result<Record> {
        self.advance(record, State::Rejected, |header, _| {
            header.set("rejected_by", actor);
            header.set("rejected_at", now_stamp());
            header.set("rejection_reason", reason);
            if let Some(note) = note.filter(|n| !n.trim().is_empty()) {
                header.set("rejection_note", note);
            }
        })
    }

    fn reject_by_expiry(&self, record: &Record) -> Result<Record> {
        let rejected = self.reject_record(record, "expiry", "expired", None)?;
        self.ledger.log(
            event("rejected_by_expiry", &rejected)
                .detail("expires", record.get("expires").unwrap_or_default()),
        );
        Ok(rejected)
    }

    /// Reject every pending record whose `expires` lies before `now`.
    pub fn expire(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut expired = 0;
        for record in self.vault.records(State::PendingApproval, ListOrder::Lexical)? {
            let Some(raw) = record.get("expires").filter(|v| !v.trim().is_empty()) else {
                continue;
            };
            let Some(deadline) = record::parse_timestamp(raw) else {
                tracing::warn!(record = %record.id, expires = %raw, "Unparseable expiry, leaving record alone");
                continue;
            };
            if now <= deadline {
                continue;
            }

            match self.reject_by_expiry(&record) {
                Ok(_) => expired += 1,
                Err(e) if e.is_already_claimed() => {
                    tracing::debug!(record = %record.id, "Expired record moved by someone else");
                }
                Err(e) => {
                    tracing::warn!(record = %record.id, error = %e, "Failed to expire record");
                    self.ledger.log(event("rejected_by_expiry", &record).error(&e));
                }
            }
        }
        if expired > 0 {
            tracing::info!(count = expired, "Expired pending approvals");
        }
        Ok(expired)
    }

    // ========================================================================
    // Execution & archival
    // ========================================================================

    /// Approved -> Done after the executor succeeded.
    pub fn complete(&self, record: &Record, report: &ExecutionReport) -> Result<Record> {
        let zone = self.zone.as_str();
        let done = self.advance(record, State::Done, |header, _| {
            header.set("executed_at", now_stamp());
            header.set("executed_by", zone);
            header.set("outcome", if report.dry_run { "dry_run" } else { "executed" });
            header.set("execution_summary", report.summary.as_str());
        })?;
        self.ledger.log(
            event("executed", &done)
                .detail("dry_run", report.dry_run)
                .detail("summary", report.summary.clone()),
        );
        Ok(done)
    }

    /// Audit an execution failure. The record stays approved for the next pass.
    pub fn execution_failed(&self, record: &Record, error: &Error) {
        tracing::warn!(record = %record.id, error = %error, "Execution failed, will retry next pass");
        self.ledger.log(event("execution_failed", record).error(error));
    }

    /// Approved -> Done for a record that can never execute.
    pub fn abandon(&self, record: &Record, error: &Error) -> Result<Record> {
        let reason = error.to_string();
        let done = self.advance(record, State::Done, |header, _| {
            header.set("outcome", "failed");
            header.set("failure_reason", reason.as_str());
            header.set("completed_at", now_stamp());
        })?;
        tracing::warn!(record = %record.id, reason = %reason, "Execution abandoned");
        self.ledger.log(event("execution_abandoned", &done).error(error));
        Ok(done)
    }

    /// Rejected -> Done.
    pub fn archive(&self, record: &Record) -> Result<Record> {
        let done = self.advance(record, State::Done, |header, _| {
            header.set("archived_at", now_stamp());
        })?;
        self.ledger.log(event("archived", &done));
        Ok(done)
    }

    // ========================================================================
    // Repair
    // ========================================================================

    /// Rewrite headers whose `status` disagrees with their directory.
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for state in State::ALL {
            for record in self.vault.records(state, ListOrder::Lexical)? {
                report.checked += 1;
                let declared = record.get("status").unwrap_or_default().to_string();
                if record.header.status() == Some(state) {
                    continue;
                }

                if state.is_terminal() {
                    report.done_mismatches += 1;
                    tracing::warn!(record = %record.id, status = %declared, "Done record has mismatched status");
                    continue;
                }

                let mut header = record.header.clone();
                header.set("status", state.as_str());
                match self.vault.rewrite(&record.path, &header, &record.body) {
                    Ok(()) => {
                        report.repaired += 1;
                        tracing::info!(record = %record.id, from = %declared, to = %state, "Repaired record status");
                        self.ledger.log(
                            event("status_repaired", &record)
                                .detail("from", declared)
                                .detail("to", state.as_str()),
                        );
                    }
                    Err(e) if e.is_already_claimed() => {}
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(report)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn state_of(&self, record: &Record) -> Result<State> {
        self.vault.layout().state_of(&record.path).ok_or_else(|| {
            Error::InvalidInput(format!(
                "{} is not inside a state directory",
                record.path.display()
            ))
        })
    }

    /// A pending record by id, or `Conflict` if it has already moved on.
    fn pending(&self, id: &str) -> Result<Record> {
        match self.vault.find(id, &[State::PendingApproval]) {
            Err(Error::NotFound(_)) => match self.vault.find(id, &State::ALL) {
                Ok(elsewhere) => {
                    let state = self
                        .vault
                        .layout()
                        .state_of(&elsewhere.path)
                        .map_or("unknown", |s| s.as_str());
                    Err(Error::Conflict(format!("record {id} is {state}, not pending_approval")))
                }
                Err(e) => Err(e),
            },
            other => other,
        }
    }

    /// Move into the destination directory, then stamp the moved file.
    ///
    /// The rename decides which of two racing transitions wins; only the
    /// winner writes a header, so `status` always matches the directory.
    fn advance(
        &self,
        record: &Record,
        to: State,
        edit: impl FnOnce(&mut Header, &mut String),
    ) -> Result<Record> {
        let from = self.state_of(record)?;
        ensure_transition(from, to)?;

        let dest = self.vault.layout().dest_dir(to, &record.kind(), self.zone);
        let path = match claim(&record.path, &dest)? {
            Claim::Owned(path) => path,
            Claim::AlreadyClaimed => return Err(Error::AlreadyClaimed(record.path.clone())),
        };

        // Re-read: an edit may have landed between listing and the move.
        let stamped = self.vault.read(&path).and_then(|owned| {
            let mut header = owned.header;
            let mut body = owned.body;
            header.set("status", to.as_str());
            edit(&mut header, &mut body);
            self.vault.rewrite(&path, &header, &body)
        });

        match stamped {
            Ok(()) => {
                tracing::debug!(record = %record.id, from = %from, to = %to, "Transition committed");
                self.vault.read(&path)
            }
            Err(e) => {
                self.roll_back(record, &path);
                Err(e)
            }
        }
    }

    /// Return a moved but unstamped record to where it came from.
    fn roll_back(&self, record: &Record, moved: &Path) {
        let Some(origin) = record.path.parent() else {
            return;
        };
        match claim(moved, origin) {
            Ok(Claim::Owned(_)) => {
                tracing::warn!(record = %record.id, "Transition failed, record moved back");
            }
            Ok(Claim::AlreadyClaimed) => {}
            Err(e) => {
                tracing::error!(record = %record.id, error = %e, "Failed to move record back after failed transition");
            }
        }
    }
}

fn ensure_transition(from: State, to: State) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(invalid(from, to))
    }
}

fn invalid(from: State, to: State) -> Error {
    Error::InvalidTransition {
        from: from.to_string(),
        to: to.to_string(),
    }
}

fn event(action: &str, record: &Record) -> AuditEvent {
    AuditEvent::new(CATEGORY, action)
        .record(record.id.clone())
        .detail("kind", record.kind().as_str())
}

fn now_stamp() -> String {
    record::stamp(Utc::now())
}

fn is_expired(record: &Record, now: DateTime<Utc>) -> bool {
    record
        .get("expires")
        .and_then(record::parse_timestamp)
        .is_some_and(|deadline| now > deadline)
}
