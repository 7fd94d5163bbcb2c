//! Integration tests for the record lifecycle.
//!
//! These tests drive real vault directories through the worker:
//! - Intake to Done with a flaky generator and a dry-run executor
//! - Expiry of stale approvals
//! - Header status always matching the containing directory

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use vault_common::{AuditLedger, Error, Result, WorkZone, WorkerRole};
use vault_workflow::record::stamp;
use vault_workflow::{
    DraftGenerator, ExecutorRegistry, GeneratorRegistry, Header, Kind, Lifecycle, ListOrder, Record,
    Resilience, RetryPolicy, State, Vault, Worker,
};

// ─────────────────────────────────────────────────────────────────────────────
// Test Setup Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Generator that fails with a retryable error a fixed number of times.
struct FlakyGenerator {
    failures: usize,
    calls: AtomicUsize,
}

impl FlakyGenerator {
    fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl DraftGenerator for FlakyGenerator {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn generate(&self, record: &Record) -> Result<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(Error::retryable("generator:email", "rate limited"));
        }
        Ok(format!("Hello, thanks for writing about {}.", record.get("subject").unwrap_or("it")))
    }
}

fn setup(zone: WorkZone) -> (TempDir, Lifecycle) {
    let dir = TempDir::new().unwrap();
    let vault = Vault::open(dir.path()).unwrap();
    let ledger = Arc::new(AuditLedger::open(vault.layout().logs_dir()).unwrap());
    let lifecycle = Lifecycle::new(vault, ledger, zone).with_approval_ttl_hours(24);
    (dir, lifecycle)
}

fn resilience() -> Arc<Resilience> {
    Arc::new(Resilience::new(
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        },
        5,
        Duration::from_secs(60),
        Duration::from_secs(30),
    ))
}

fn write(lifecycle: &Lifecycle, rel: &str, pairs: &[(&str, &str)], body: &str) {
    let header: Header = pairs.iter().copied().collect();
    lifecycle.vault().write(rel, &header, body).unwrap();
}

fn actions(lifecycle: &Lifecycle, id: &str) -> Vec<String> {
    lifecycle
        .ledger()
        .for_record(id)
        .unwrap()
        .into_iter()
        .map(|e| e.action)
        .collect()
}

/// Every record's `status` header equals the state of its directory.
fn assert_status_matches_location(vault: &Vault) {
    for state in State::ALL {
        for record in vault.records(state, ListOrder::Lexical).unwrap() {
            assert_eq!(
                record.header.status(),
                Some(state),
                "{} has status {:?}",
                record.path.display(),
                record.get("status")
            );
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// End-to-end
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_email_runs_from_intake_to_done() {
    let (_dir, lifecycle) = setup(WorkZone::Local);
    write(
        &lifecycle,
        "Needs_Action/EMAIL_X.md",
        &[
            ("type", "email"),
            ("status", "intake"),
            ("from", "Client Person <client@example.com>"),
            ("subject", "Invoice question"),
        ],
        "Could you resend last month's invoice?",
    );

    let generator = Arc::new(FlakyGenerator::new(2));
    let mut generators = GeneratorRegistry::new();
    generators.register(Kind::Email, Arc::clone(&generator) as Arc<dyn DraftGenerator>);

    let worker = Worker::new(lifecycle.clone(), resilience())
        .with_roles(WorkerRole::ALL.to_vec())
        .with_generators(generators)
        .with_executors(ExecutorRegistry::dry_run());

    let started = tokio::time::Instant::now();
    let report = worker.run_pass().await;
    let elapsed = started.elapsed();

    assert_eq!(report.claimed, 1);
    assert_eq!(report.drafted, 1);
    assert_eq!(report.submitted, 1);
    assert_eq!(report.draft_failures, 0);
    assert_eq!(generator.calls.load(Ordering::SeqCst), 3);
    // Two delayed retries: 2s and 4s, each with at most 50% jitter.
    assert!(elapsed >= Duration::from_secs(6), "elapsed {elapsed:?}");
    assert!(elapsed <= Duration::from_secs(9), "elapsed {elapsed:?}");

    let pending = lifecycle.vault().find("EMAIL_X", &[State::PendingApproval]).unwrap();
    let draft = pending.section(&["## Draft"]).unwrap();
    assert!(draft.contains("Invoice question"));
    assert!(pending.get("expires").is_some());
    assert_eq!(pending.get("generated_by"), Some("flaky"));

    lifecycle.approve("EMAIL_X", "reviewer", Some("looks good")).unwrap();
    let report = worker.run_pass().await;
    assert_eq!(report.executed, 1);

    let done = lifecycle.vault().find("EMAIL_X", &[State::Done]).unwrap();
    assert!(done.path.ends_with("Done/email/EMAIL_X.md"));
    assert_eq!(done.get("status"), Some("done"));
    assert_eq!(done.get("outcome"), Some("dry_run"));
    assert!(!done.section(&["## Draft"]).unwrap().is_empty());

    let audit = actions(&lifecycle, "EMAIL_X");
    let milestones: Vec<&str> = audit
        .iter()
        .map(String::as_str)
        .filter(|a| matches!(*a, "claimed" | "drafted" | "approved" | "executed"))
        .collect();
    assert_eq!(milestones, vec!["claimed", "drafted", "approved", "executed"]);
    assert!(audit.len() >= 4);

    assert_status_matches_location(lifecycle.vault());
}

#[tokio::test(start_paused = true)]
async fn test_cloud_drafts_and_local_submits() {
    let (_dir, cloud) = setup(WorkZone::Cloud);
    let local = Lifecycle::new(cloud.vault().clone(), Arc::new(AuditLedger::open(cloud.ledger().dir()).unwrap()), WorkZone::Local);
    write(
        &cloud,
        "Needs_Action/SOCIAL_1.md",
        &[("type", "social_media"), ("status", "intake"), ("platform", "linkedin"), ("topic", "launch")],
        "Announce the launch.",
    );

    let generators = GeneratorRegistry::from_config(&Default::default(), Duration::from_secs(5));
    let cloud_worker = Worker::new(cloud.clone(), resilience())
        .with_roles(WorkerRole::defaults_for(WorkZone::Cloud))
        .with_generators(generators.clone());
    let local_worker = Worker::new(local, resilience())
        .with_roles(WorkerRole::defaults_for(WorkZone::Local))
        .with_generators(generators);

    let report = cloud_worker.run_pass().await;
    assert_eq!((report.claimed, report.drafted, report.submitted), (1, 1, 0));
    assert!(cloud.vault().find("SOCIAL_1", &[State::Drafted]).is_ok());

    let report = local_worker.run_pass().await;
    assert_eq!(report.submitted, 1);
    assert!(cloud.vault().find("SOCIAL_1", &[State::PendingApproval]).is_ok());
    assert_status_matches_location(cloud.vault());
}

// ─────────────────────────────────────────────────────────────────────────────
// Expiry
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_stale_approval_expires_without_reviewer() {
    let (_dir, lifecycle) = setup(WorkZone::Local);
    let past = stamp(Utc::now() - ChronoDuration::hours(2));
    let future = stamp(Utc::now() + ChronoDuration::hours(2));
    write(
        &lifecycle,
        "Pending_Approval/email/OLD.md",
        &[("type", "email"), ("status", "pending_approval"), ("expires", &past)],
        "## Draft\nhello\n",
    );
    write(
        &lifecycle,
        "Pending_Approval/email/FRESH.md",
        &[("type", "email"), ("status", "pending_approval"), ("expires", &future)],
        "## Draft\nhello\n",
    );

    let worker = Worker::new(lifecycle.clone(), resilience()).with_roles(vec![WorkerRole::Expire]);
    let report = worker.run_pass().await;
    assert_eq!(report.expired, 1);

    let rejected = lifecycle.vault().find("OLD", &[State::Rejected]).unwrap();
    assert_eq!(rejected.get("status"), Some("rejected"));
    assert_eq!(actions(&lifecycle, "OLD"), vec!["rejected_by_expiry"]);
    assert!(lifecycle.vault().find("FRESH", &[State::PendingApproval]).is_ok());

    // A late decision on the expired record is a conflict, not a resurrection.
    let err = lifecycle.approve("OLD", "reviewer", None).unwrap_err();
    assert_eq!(err.status_code(), 409);
    assert_status_matches_location(lifecycle.vault());
}

#[tokio::test]
async fn test_approving_after_expiry_rejects() {
    let (_dir, lifecycle) = setup(WorkZone::Local);
    let past = stamp(Utc::now() - ChronoDuration::minutes(1));
    write(
        &lifecycle,
        "Pending_Approval/email/LATE.md",
        &[("type", "email"), ("status", "pending_approval"), ("expires", &past)],
        "## Draft\nhello\n",
    );

    let err = lifecycle.approve("LATE", "reviewer", None).unwrap_err();
    assert!(matches!(err, Error::ExpiredApproval(_)));
    assert!(lifecycle.vault().find("LATE", &[State::Rejected]).is_ok());
}

// ─────────────────────────────────────────────────────────────────────────────
// Claim races
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_concurrent_claims_have_one_winner() {
    let (_dir, lifecycle) = setup(WorkZone::Local);
    for i in 0..20 {
        write(
            &lifecycle,
            &format!("Needs_Action/EMAIL_{i:02}.md"),
            &[("type", "email"), ("status", "intake"), ("from", "a@client.com")],
            "",
        );
    }
    let records = lifecycle.vault().records(State::Intake, ListOrder::Lexical).unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let lifecycle = lifecycle.clone();
        let records = records.clone();
        handles.push(std::thread::spawn(move || {
            records
                .iter()
                .filter(|r| matches!(lifecycle.claim(r), Ok(Some(_))))
                .count()
        }));
    }
    let won: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(won, 20);

    for record in &records {
        let claims = actions(&lifecycle, &record.id)
            .into_iter()
            .filter(|a| a == "claimed")
            .count();
        assert_eq!(claims, 1, "{} claimed {claims} times", record.id);
    }
    assert_status_matches_location(lifecycle.vault());
}

#[test]
fn test_racing_decisions_keep_status_in_step() {
    let (_dir, lifecycle) = setup(WorkZone::Local);

    for i in 0..100 {
        let id = format!("RACE_{i:03}");
        write(
            &lifecycle,
            &format!("Pending_Approval/email/{id}.md"),
            &[("type", "email"), ("status", "pending_approval")],
            "## Draft\nhello\n",
        );

        let barrier = Arc::new(std::sync::Barrier::new(2));
        let approve = {
            let (lifecycle, barrier, id) = (lifecycle.clone(), Arc::clone(&barrier), id.clone());
            std::thread::spawn(move || {
                barrier.wait();
                lifecycle.approve(&id, "alice", None).is_ok()
            })
        };
        let reject = {
            let (lifecycle, barrier, id) = (lifecycle.clone(), Arc::clone(&barrier), id.clone());
            std::thread::spawn(move || {
                barrier.wait();
                lifecycle.reject(&id, "bob", None).is_ok()
            })
        };
        let approved = approve.join().unwrap();
        let rejected = reject.join().unwrap();
        assert!(approved ^ rejected, "{id}: approve_ok={approved} reject_ok={rejected}");

        let record = lifecycle
            .vault()
            .find(&id, &[State::Approved, State::Rejected])
            .unwrap();
        if approved {
            assert_eq!(record.get("approved_by"), Some("alice"));
            assert!(record.get("rejected_by").is_none());
        } else {
            assert_eq!(record.get("rejected_by"), Some("bob"));
            assert!(record.get("approved_by").is_none());
        }
    }

    assert_status_matches_location(lifecycle.vault());
}
