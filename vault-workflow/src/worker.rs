//! Worker passes over the vault.
//!
//! A pass runs the stages its roles allow, in a fixed order: expire, claim and
//! draft, submit, execute, archive. Records within a stage go in file-name
//! order. A failure on one record is audited and the pass moves on.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use vault_common::{AuditEvent, Error, WorkerRole};

use crate::executor::{is_permanent, ExecutorRegistry};
use crate::filter::SenderFilter;
use crate::generator::GeneratorRegistry;
use crate::lifecycle::Lifecycle;
use crate::record::Record;
use crate::resilience::Resilience;
use crate::state::State;
use crate::store::ListOrder;

/// Counts from one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub expired: usize,
    pub claimed: usize,
    pub skipped: usize,
    pub drafted: usize,
    pub draft_failures: usize,
    pub submitted: usize,
    pub executed: usize,
    pub execution_failures: usize,
    pub abandoned: usize,
    pub archived: usize,
    pub errors: usize,
}

impl PassReport {
    /// Nothing moved and nothing failed.
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

/// One zone's worker.
#[derive(Debug)]
pub struct Worker {
    lifecycle: Lifecycle,
    roles: Vec<WorkerRole>,
    filter: SenderFilter,
    generators: GeneratorRegistry,
    executors: ExecutorRegistry,
    resilience: Arc<Resilience>,
    interval: Duration,
}

impl Worker {
    pub fn new(lifecycle: Lifecycle, resilience: Arc<Resilience>) -> Self {
        let roles = WorkerRole::defaults_for(lifecycle.zone());
        Self {
            lifecycle,
            roles,
            filter: SenderFilter::default(),
            generators: GeneratorRegistry::default(),
            executors: ExecutorRegistry::dry_run(),
            resilience,
            interval: Duration::from_secs(30),
        }
    }

    pub fn with_roles(mut self, roles: Vec<WorkerRole>) -> Self {
        self.roles = roles;
        self
    }

    pub fn with_filter(mut self, filter: SenderFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_generators(mut self, generators: GeneratorRegistry) -> Self {
        self.generators = generators;
        self
    }

    pub fn with_executors(mut self, executors: ExecutorRegistry) -> Self {
        self.executors = executors;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn has_role(&self, role: WorkerRole) -> bool {
        self.roles.contains(&role)
    }

    /// Run passes until `shutdown` flips to true. The current pass always
    /// finishes before the loop exits.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            zone = %self.lifecycle.zone(),
            roles = ?self.roles,
            interval_secs = self.interval.as_secs(),
            "Worker started"
        );

        while !*shutdown.borrow() {
            let report = self.run_pass().await;
            if !report.is_idle() {
                tracing::info!(report = ?report, "Worker pass complete");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!(zone = %self.lifecycle.zone(), "Worker stopped");
    }

    /// One pass over every stage this worker's roles allow.
    pub async fn run_pass(&self) -> PassReport {
        let mut report = PassReport::default();

        if self.has_role(WorkerRole::Expire) {
            match self.lifecycle.expire(Utc::now()) {
                Ok(n) => report.expired = n,
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(error = %e, "Expiry sweep failed");
                }
            }
        }
        if self.has_role(WorkerRole::ClaimAndDraft) {
            self.claim_intake(&mut report);
            self.draft_claimed(&mut report).await;
        }
        if self.has_role(WorkerRole::Submit) {
            self.submit_drafts(&mut report);
        }
        if self.has_role(WorkerRole::Execute) {
            self.execute_approved(&mut report).await;
        }
        if self.has_role(WorkerRole::Archive) {
            self.archive_rejected(&mut report);
        }

        report
    }

    fn records(&self, state: State, report: &mut PassReport) -> Vec<Record> {
        match self.lifecycle.vault().records(state, ListOrder::Lexical) {
            Ok(records) => records,
            Err(e) => {
                report.errors += 1;
                tracing::error!(state = %state, error = %e, "Failed to list records");
                Vec::new()
            }
        }
    }

    fn claim_intake(&self, report: &mut PassReport) {
        for record in self.records(State::Intake, report) {
            // Kinds without an executor belong to an agent or a human.
            if !self.executors.has(&record.kind()) {
                continue;
            }

            let outcome = match self.filter.classify(&record) {
                Some(reason) => self.lifecycle.skip(&record, &reason).map(|r| (r, true)),
                None => self.lifecycle.claim(&record).map(|r| (r, false)),
            };
            match outcome {
                Ok((Some(_), true)) => report.skipped += 1,
                Ok((Some(_), false)) => report.claimed += 1,
                Ok((None, _)) => {}
                Err(e) => self.record_error("claim", &record, &e, report),
            }
        }
    }

    async fn draft_claimed(&self, report: &mut PassReport) {
        let zone_dir = self
            .lifecycle
            .vault()
            .layout()
            .state_dir(State::Claimed)
            .join(self.lifecycle.zone().as_str());
        let listing = match self.lifecycle.vault().list(&zone_dir, ListOrder::Lexical) {
            Ok(listing) => listing
                .filter_map(|r| match r {
                    Ok(record) => Some(record),
                    Err(e) => {
                        tracing::warn!(error = %e, "Skipping corrupt claimed record");
                        None
                    }
                })
                .collect::<Vec<_>>(),
            Err(e) => {
                report.errors += 1;
                tracing::error!(error = %e, "Failed to list claimed records");
                return;
            }
        };

        for record in listing {
            let kind = record.kind();
            let result = match self.generators.for_kind(&kind) {
                Some(generator) => {
                    let dependency = format!("generator:{kind}");
                    match self
                        .resilience
                        .call(&dependency, || generator.generate(&record))
                        .await
                    {
                        Ok(text) => self.lifecycle.draft(&record, Some(&text), generator.name()),
                        Err(e) => {
                            report.draft_failures += 1;
                            self.lifecycle.draft_failed(&record, &e);
                            continue;
                        }
                    }
                }
                None => self.lifecycle.draft(&record, None, "passthrough"),
            };

            match result {
                Ok(_) => report.drafted += 1,
                Err(e) => self.record_error("draft", &record, &e, report),
            }
        }
    }

    fn submit_drafts(&self, report: &mut PassReport) {
        for record in self.records(State::Drafted, report) {
            match self.lifecycle.submit(&record) {
                Ok(_) => report.submitted += 1,
                Err(e) => self.record_error("submit", &record, &e, report),
            }
        }
    }

    async fn execute_approved(&self, report: &mut PassReport) {
        for record in self.records(State::Approved, report) {
            let kind = record.kind();
            let Some(executor) = self.executors.for_kind(&kind) else {
                tracing::warn!(record = %record.id, kind = %kind, "No executor for approved record");
                continue;
            };

            let dependency = format!("executor:{kind}");
            let outcome = self
                .resilience
                .call(&dependency, || executor.execute(&record))
                .await;

            let result = match outcome {
                Ok(execution) => self.lifecycle.complete(&record, &execution).map(|_| {
                    report.executed += 1;
                }),
                Err(e) if is_permanent(&e) => self.lifecycle.abandon(&record, &e).map(|_| {
                    report.abandoned += 1;
                }),
                Err(e) => {
                    report.execution_failures += 1;
                    self.lifecycle.execution_failed(&record, &e);
                    Ok(())
                }
            };
            if let Err(e) = result {
                self.record_error("execute", &record, &e, report);
            }
        }
    }

    fn archive_rejected(&self, report: &mut PassReport) {
        for record in self.records(State::Rejected, report) {
            match self.lifecycle.archive(&record) {
                Ok(_) => report.archived += 1,
                Err(e) => self.record_error("archive", &record, &e, report),
            }
        }
    }

    fn record_error(&self, stage: &str, record: &Record, error: &Error, report: &mut PassReport) {
        if error.is_already_claimed() {
            tracing::debug!(stage, record = %record.id, "Record moved by another worker");
            return;
        }
        report.errors += 1;
        tracing::warn!(stage, record = %record.id, error = %error, "Record processing failed");
        self.lifecycle.ledger().log(
            AuditEvent::new("lifecycle", "pass_error")
                .record(record.id.clone())
                .detail("kind", record.kind().as_str())
                .detail("stage", stage)
                .error(error),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutionReport, Executor};
    use crate::record::Header;
    use crate::resilience::RetryPolicy;
    use crate::state::Kind;
    use crate::store::Vault;
    use async_trait::async_trait;
    use tempfile::TempDir;
    use vault_common::{AuditLedger, Result, WorkZone};

    fn worker(zone: WorkZone) -> (TempDir, Worker) {
        let dir = TempDir::new().unwrap();
        let vault = Vault::open(dir.path()).unwrap();
        let ledger = Arc::new(AuditLedger::open(vault.layout().logs_dir()).unwrap());
        let lifecycle = Lifecycle::new(vault, ledger, zone);
        let resilience = Arc::new(Resilience::new(
            RetryPolicy {
                max_retries: 0,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
            5,
            Duration::from_secs(60),
            Duration::from_secs(5),
        ));
        let generators = GeneratorRegistry::from_config(&Default::default(), Duration::from_secs(1));
        (dir, Worker::new(lifecycle, resilience).with_generators(generators))
    }

    fn write(w: &Worker, rel: &str, pairs: &[(&str, &str)], body: &str) {
        let header: Header = pairs.iter().copied().collect();
        w.lifecycle().vault().write(rel, &header, body).unwrap();
    }

    #[tokio::test]
    async fn test_cloud_worker_claims_and_drafts_only() {
        let (_dir, w) = worker(WorkZone::Cloud);
        write(&w, "Needs_Action/EMAIL_1.md", &[("type", "email"), ("status", "intake"), ("from", "Jane <jane@client.com>")], "Hi");
        write(&w, "Needs_Action/BRIEF_1.md", &[("type", "briefing"), ("status", "intake")], "");

        let report = w.run_pass().await;
        assert_eq!(report.claimed, 1);
        assert_eq!(report.drafted, 1);
        assert_eq!(report.submitted, 0);

        let vault = w.lifecycle().vault();
        let drafted = vault.find("EMAIL_1", &[State::Drafted]).unwrap();
        assert!(drafted.section(&["Draft"]).unwrap().starts_with("Dear Jane,"));
        assert_eq!(drafted.get("claimed_by"), Some("cloud"));
        // Briefings wait for an agent.
        assert!(vault.find("BRIEF_1", &[State::Intake]).is_ok());
    }

    #[tokio::test]
    async fn test_corrupt_claimed_record_does_not_block_drafting() {
        let (dir, w) = worker(WorkZone::Cloud);
        write(&w, "In_Progress/cloud/EMAIL_5.md", &[("type", "email"), ("status", "claimed"), ("from", "Jane <jane@client.com>")], "Hi");
        std::fs::write(dir.path().join("In_Progress/cloud/BAD_1.md"), b"\xff\xfe\n").unwrap();

        let report = w.run_pass().await;
        assert_eq!(report.drafted, 1);
        assert!(w.lifecycle().vault().find("EMAIL_5", &[State::Drafted]).is_ok());
        assert!(dir.path().join("In_Progress/cloud/BAD_1.md").exists());
    }

    #[tokio::test]
    async fn test_automated_sender_skipped() {
        let (_dir, w) = worker(WorkZone::Local);
        write(&w, "Needs_Action/EMAIL_2.md", &[("type", "email"), ("from", "noreply@github.com"), ("subject", "CI")], "");

        let report = w.run_pass().await;
        assert_eq!(report.skipped, 1);
        assert_eq!(report.claimed, 0);
        let done = w.lifecycle().vault().find("EMAIL_2", &[State::Done]).unwrap();
        assert_eq!(done.get("outcome"), Some("skipped"));
    }

    #[tokio::test]
    async fn test_local_worker_runs_to_pending_then_executes() {
        let (_dir, w) = worker(WorkZone::Local);
        write(&w, "Needs_Action/POST_1.md", &[("type", "social_post"), ("platform", "linkedin"), ("topic", "launch")], "");

        let report = w.run_pass().await;
        assert_eq!((report.claimed, report.drafted, report.submitted), (1, 1, 1));
        let vault = w.lifecycle().vault();
        assert!(vault.find("POST_1", &[State::PendingApproval]).is_ok());

        w.lifecycle().approve("POST_1", "ceo", None).unwrap();
        let report = w.run_pass().await;
        assert_eq!(report.executed, 1);
        let done = vault.find("POST_1", &[State::Done]).unwrap();
        assert_eq!(done.get("outcome"), Some("dry_run"));
    }

    #[tokio::test]
    async fn test_missing_field_abandons_and_rejected_archives() {
        let (_dir, w) = worker(WorkZone::Local);
        write(&w, "Approved/payment/PAY_1.md", &[("type", "payment"), ("status", "approved"), ("vendor", "Acme")], "");
        write(&w, "Rejected/email/EMAIL_9.md", &[("type", "email"), ("status", "rejected")], "");

        let report = w.run_pass().await;
        assert_eq!(report.abandoned, 1);
        assert_eq!(report.archived, 1);
        let vault = w.lifecycle().vault();
        assert_eq!(vault.find("PAY_1", &[State::Done]).unwrap().get("outcome"), Some("failed"));
        assert!(vault.find("EMAIL_9", &[State::Done]).is_ok());
    }

    struct Flaky;

    #[async_trait]
    impl Executor for Flaky {
        fn kind(&self) -> Kind {
            Kind::Email
        }

        async fn execute(&self, _record: &Record) -> Result<ExecutionReport> {
            Err(Error::retryable("executor:email", "503"))
        }
    }

    #[tokio::test]
    async fn test_retryable_failure_stays_approved() {
        let (_dir, w) = worker(WorkZone::Local);
        let mut executors = ExecutorRegistry::new();
        executors.register(Arc::new(Flaky));
        let w = w.with_executors(executors);
        write(&w, "Approved/email/EMAIL_3.md", &[("type", "email"), ("status", "approved")], "## Draft\nhi");

        let report = w.run_pass().await;
        assert_eq!(report.execution_failures, 1);
        let vault = w.lifecycle().vault();
        assert!(vault.find("EMAIL_3", &[State::Approved]).is_ok());

        let actions: Vec<_> = w
            .lifecycle()
            .ledger()
            .for_record("EMAIL_3")
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(actions, vec!["execution_failed"]);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (_dir, w) = worker(WorkZone::Local);
        let w = w.with_interval(Duration::from_secs(3_600));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { w.run(rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
