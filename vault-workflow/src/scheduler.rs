//! Trigger scheduler.
//!
//! Each trigger drops a record into `Needs_Action/` on a cron or `@every`
//! cadence, evaluated in the scheduler's local time. Firing is idempotent per
//! slot: the file name carries the slot time and is never overwritten.
//! Each tick also scans `Inbox/` for dropped files.

use chrono::{DateTime, Local, Utc};
use cron::Schedule;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use vault_common::config::{check_minute_resolution, normalize_cron, parse_every, TriggerConfig};
use vault_common::{AuditEvent, AuditLedger, AuditStatus, Error, Result};

use crate::inbox::InboxScanner;
use crate::record::{self, Header};
use crate::state::State;
use crate::store::Vault;
use crate::supervisor::{CheckOutcome, Supervisor};

const CATEGORY: &str = "scheduler";

// ============================================================================
// Cadence
// ============================================================================

/// When a trigger fires.
#[derive(Debug, Clone)]
pub enum Cadence {
    Cron(Schedule),
    Every(Duration),
}

impl Cadence {
    /// Parse a 5/6-field cron expression or `@every <n>s|m|h`.
    pub fn parse(expression: &str) -> Result<Self> {
        let expression = expression.trim();
        if let Some(every) = expression.strip_prefix("@every") {
            return parse_every(every)
                .map(Cadence::Every)
                .map_err(|e| Error::InvalidInput(format!("invalid schedule '{expression}': {e}")));
        }
        let normalized = normalize_cron(expression);
        check_minute_resolution(&normalized)
            .map_err(|e| Error::InvalidInput(format!("invalid schedule '{expression}': {e}")))?;
        Schedule::from_str(&normalized)
            .map(Cadence::Cron)
            .map_err(|e| Error::InvalidInput(format!("invalid cron expression '{expression}': {e}")))
    }

    /// First firing strictly after `after`.
    pub fn next_after(&self, after: DateTime<Local>) -> Option<DateTime<Local>> {
        match self {
            Cadence::Cron(schedule) => schedule.after(&after).next(),
            Cadence::Every(interval) => chrono::Duration::from_std(*interval)
                .ok()
                .and_then(|d| after.checked_add_signed(d)),
        }
    }
}

// ============================================================================
// Trigger
// ============================================================================

#[derive(Debug, Clone)]
pub struct Trigger {
    pub config: TriggerConfig,
    cadence: Cadence,
    next_run: Option<DateTime<Local>>,
}

impl Trigger {
    pub fn new(config: TriggerConfig, now: DateTime<Local>) -> Result<Self> {
        let cadence = Cadence::parse(&config.schedule)?;
        let next_run = cadence.next_after(now);
        Ok(Self {
            config,
            cadence,
            next_run,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn next_run(&self) -> Option<DateTime<Local>> {
        self.next_run
    }

    fn is_due(&self, now: DateTime<Local>) -> bool {
        self.next_run.is_some_and(|next| next <= now)
    }
}

/// File name of the record a trigger creates for the slot at `at`.
pub fn trigger_file_name(name: &str, at: DateTime<Local>) -> String {
    format!(
        "{}_{}.md",
        name.to_ascii_uppercase(),
        at.format("%Y-%m-%d_%H%M")
    )
}

/// Result of firing a trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fired {
    Created(PathBuf),
    Exists(PathBuf),
}

/// What one tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub fired: Vec<PathBuf>,
    pub dropped: Vec<PathBuf>,
    pub checks: Vec<(String, CheckOutcome)>,
}

// ============================================================================
// Scheduler
// ============================================================================

pub struct Scheduler {
    vault: Vault,
    ledger: Arc<AuditLedger>,
    triggers: Vec<Trigger>,
    supervisor: Supervisor,
    inbox: InboxScanner,
    tick: Duration,
}

impl Scheduler {
    pub fn new(vault: Vault, ledger: Arc<AuditLedger>, configs: &[TriggerConfig]) -> Result<Self> {
        Self::starting_at(vault, ledger, configs, Local::now())
    }

    /// Build with the first firing of each trigger computed after `now`.
    pub fn starting_at(
        vault: Vault,
        ledger: Arc<AuditLedger>,
        configs: &[TriggerConfig],
        now: DateTime<Local>,
    ) -> Result<Self> {
        let mut triggers = Vec::with_capacity(configs.len());
        for config in configs {
            let trigger = Trigger::new(config.clone(), now)
                .map_err(|e| e.with_context(format!("trigger '{}'", config.name)))?;
            tracing::info!(
                trigger = %trigger.name(),
                schedule = %config.schedule,
                next_run = ?trigger.next_run().map(|t| t.to_rfc3339()),
                "Added trigger"
            );
            triggers.push(trigger);
        }
        let supervisor = Supervisor::new(vault.clone(), Arc::clone(&ledger));
        let inbox = InboxScanner::new(vault.clone(), Arc::clone(&ledger));
        Ok(Self {
            vault,
            ledger,
            triggers,
            supervisor,
            inbox,
            tick: Duration::from_secs(30),
        })
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn triggers(&self) -> &[Trigger] {
        &self.triggers
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Fire a trigger by name for the slot at `at`, regardless of its schedule.
    pub fn fire(&self, name: &str, at: DateTime<Local>) -> Result<Fired> {
        let trigger = self
            .triggers
            .iter()
            .find(|t| t.name() == name)
            .ok_or_else(|| Error::NotFound(format!("trigger {name}")))?;
        self.fire_trigger(&trigger.config, at)
    }

    fn fire_trigger(&self, config: &TriggerConfig, at: DateTime<Local>) -> Result<Fired> {
        let file_name = trigger_file_name(&config.name, at);
        let path = self.vault.layout().state_dir(State::Intake).join(&file_name);
        let id = record::record_id(&path);

        if path.exists() {
            return Ok(Fired::Exists(path));
        }
        if let Ok(existing) = self.vault.find(&id, &State::ALL) {
            tracing::debug!(trigger = %config.name, path = %existing.path.display(), "Trigger slot already handled");
            return Ok(Fired::Exists(existing.path));
        }

        let mut header = Header::new();
        header.set("type", config.kind.as_str());
        header.set("status", State::Intake.as_str());
        header.set("trigger", config.name.as_str());
        header.set("title", config.title.as_str());
        header.set("created", record::stamp(Utc::now()));
        header.set("scheduled_for", at.to_rfc3339());

        let body = if config.body.trim().is_empty() {
            format!("# {}\n", config.title)
        } else {
            format!("# {}\n\n{}\n", config.title, config.body.trim())
        };
        let path = self.vault.write(&path, &header, &body)?;

        tracing::info!(trigger = %config.name, path = %path.display(), "Trigger fired");
        self.ledger.log(
            AuditEvent::new(CATEGORY, "trigger_fired")
                .record(id.clone())
                .detail("trigger", config.name.as_str())
                .detail("kind", config.kind.as_str()),
        );

        if let Some(max_iterations) = config.supervise {
            let prompt = if config.body.trim().is_empty() {
                config.title.clone()
            } else {
                config.body.trim().to_string()
            };
            self.supervisor.start(&id, &prompt, max_iterations)?;
        }

        Ok(Fired::Created(path))
    }

    /// Fire every due trigger, announce inbox drops, then run supervisor checks.
    pub fn tick(&mut self, now: DateTime<Local>) -> TickReport {
        let mut report = TickReport::default();

        for i in 0..self.triggers.len() {
            let trigger = &self.triggers[i];
            if !trigger.is_due(now) {
                continue;
            }
            let slot = trigger.next_run.unwrap_or(now);
            match self.fire_trigger(&trigger.config, slot) {
                Ok(Fired::Created(path)) => report.fired.push(path),
                Ok(Fired::Exists(path)) => {
                    tracing::debug!(trigger = %trigger.name(), path = %path.display(), "Trigger record exists, not overwriting");
                }
                Err(e) => {
                    tracing::error!(trigger = %trigger.name(), error = %e, "Failed to fire trigger");
                    self.ledger.log(
                        AuditEvent::new(CATEGORY, "trigger_failed")
                            .detail("trigger", trigger.name())
                            .status(AuditStatus::Failure)
                            .error(&e),
                    );
                }
            }

            let trigger = &mut self.triggers[i];
            trigger.next_run = trigger.cadence.next_after(now);
            tracing::debug!(
                trigger = %trigger.name(),
                next_run = ?trigger.next_run.map(|t| t.to_rfc3339()),
                "Rescheduled trigger"
            );
        }

        match self.inbox.scan() {
            Ok(dropped) => report.dropped = dropped,
            Err(e) => tracing::error!(error = %e, "Inbox scan failed"),
        }

        match self.supervisor.check() {
            Ok(checks) => report.checks = checks,
            Err(e) => tracing::error!(error = %e, "Supervisor check failed"),
        }
        report
    }

    /// Tick until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(triggers = self.triggers.len(), tick_secs = self.tick.as_secs(), "Scheduler started");
        loop {
            let report = self.tick(Local::now());
            if !report.fired.is_empty() || !report.dropped.is_empty() {
                tracing::info!(fired = report.fired.len(), dropped = report.dropped.len(), "Scheduler tick");
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    tracing::info!("Scheduler shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.tick) => {}
            }
            if *shutdown.borrow() {
                tracing::info!("Scheduler shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn trigger(name: &str, schedule: &str, supervise: Option<u32>) -> TriggerConfig {
        TriggerConfig {
            name: name.into(),
            schedule: schedule.into(),
            kind: "briefing".into(),
            title: "Weekly Briefing".into(),
            body: "Summarise the week.".into(),
            supervise,
        }
    }

    fn scheduler(configs: &[TriggerConfig], now: DateTime<Local>) -> (TempDir, Scheduler) {
        let dir = TempDir::new().unwrap();
        let vault = Vault::open(dir.path()).unwrap();
        let ledger = Arc::new(AuditLedger::open(vault.layout().logs_dir()).unwrap());
        let scheduler = Scheduler::starting_at(vault, ledger, configs, now).unwrap();
        (dir, scheduler)
    }

    #[test]
    fn test_cadence_parsing() {
        // 2024-03-04 is a Monday.
        let cadence = Cadence::parse("0 8 * * Mon").unwrap();
        assert_eq!(cadence.next_after(at(2024, 3, 1, 12, 0)), Some(at(2024, 3, 4, 8, 0)));

        let six = Cadence::parse("0 30 9 * * *").unwrap();
        assert_eq!(six.next_after(at(2024, 3, 1, 9, 0)), Some(at(2024, 3, 1, 9, 30)));

        let every = Cadence::parse("@every 15m").unwrap();
        assert_eq!(every.next_after(at(2024, 3, 1, 9, 0)), Some(at(2024, 3, 1, 9, 15)));

        assert!(Cadence::parse("not a cron").is_err());
        assert!(Cadence::parse("@every 0s").is_err());
        // Slots are named to the minute; sub-minute cadences would collide.
        assert!(Cadence::parse("@every 30s").is_err());
        assert!(Cadence::parse("*/30 * * * * *").is_err());
    }

    #[test]
    fn test_trigger_file_name() {
        assert_eq!(
            trigger_file_name("ceo_briefing", at(2024, 3, 4, 8, 0)),
            "CEO_BRIEFING_2024-03-04_0800.md"
        );
    }

    #[test]
    fn test_tick_fires_due_and_reschedules() {
        let (_dir, mut scheduler) = scheduler(&[trigger("ceo_briefing", "0 8 * * Mon", None)], at(2024, 3, 1, 12, 0));

        assert!(scheduler.tick(at(2024, 3, 4, 7, 59)).fired.is_empty());

        let report = scheduler.tick(at(2024, 3, 4, 8, 0));
        assert_eq!(report.fired.len(), 1);
        let record = scheduler.vault.read(&report.fired[0]).unwrap();
        assert_eq!(record.file_name, "CEO_BRIEFING_2024-03-04_0800.md");
        assert_eq!(record.get("type"), Some("briefing"));
        assert_eq!(record.get("status"), Some("intake"));
        assert_eq!(record.get("trigger"), Some("ceo_briefing"));
        assert!(record.get("created").is_some());
        assert!(record.body.contains("Summarise the week."));

        assert_eq!(scheduler.triggers()[0].next_run(), Some(at(2024, 3, 11, 8, 0)));
        assert!(scheduler.tick(at(2024, 3, 4, 8, 1)).fired.is_empty());
    }

    #[test]
    fn test_tick_announces_inbox_drops() {
        let (dir, mut scheduler) = scheduler(&[], at(2024, 3, 1, 12, 0));
        std::fs::write(dir.path().join("Inbox/contract.pdf"), b"pdf").unwrap();

        let report = scheduler.tick(at(2024, 3, 1, 12, 1));
        assert!(report.fired.is_empty());
        assert_eq!(report.dropped.len(), 1);
        let record = scheduler.vault.read(&report.dropped[0]).unwrap();
        assert_eq!(record.get("type"), Some("file_drop"));

        assert!(scheduler.tick(at(2024, 3, 1, 12, 2)).dropped.is_empty());
    }

    #[test]
    fn test_fire_is_idempotent() {
        let (_dir, scheduler) = scheduler(&[trigger("weekly_audit", "0 17 * * Fri", None)], at(2024, 3, 1, 12, 0));
        let slot = at(2024, 3, 8, 17, 0);

        let first = scheduler.fire("weekly_audit", slot).unwrap();
        let Fired::Created(path) = first else {
            panic!("expected a new record");
        };
        std::fs::write(&path, "---\ntype: briefing\nstatus: intake\n---\nedited by hand\n").unwrap();

        assert_eq!(scheduler.fire("weekly_audit", slot).unwrap(), Fired::Exists(path.clone()));
        assert!(std::fs::read_to_string(&path).unwrap().contains("edited by hand"));

        assert!(matches!(scheduler.fire("missing", slot), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_fire_skips_slot_already_done() {
        let (_dir, scheduler) = scheduler(&[trigger("weekly_audit", "0 17 * * Fri", None)], at(2024, 3, 1, 12, 0));
        let slot = at(2024, 3, 8, 17, 0);
        let Fired::Created(path) = scheduler.fire("weekly_audit", slot).unwrap() else {
            panic!("expected a new record");
        };
        let done = scheduler.vault.layout().state_dir(State::Done).join(path.file_name().unwrap());
        std::fs::rename(&path, &done).unwrap();

        assert_eq!(scheduler.fire("weekly_audit", slot).unwrap(), Fired::Exists(done));
        assert!(!path.exists());
    }

    #[test]
    fn test_supervised_trigger_seeds_supervision() {
        let (_dir, mut scheduler) =
            scheduler(&[trigger("ceo_briefing", "0 8 * * Mon", Some(2))], at(2024, 3, 1, 12, 0));

        let report = scheduler.tick(at(2024, 3, 4, 8, 0));
        assert_eq!(report.fired.len(), 1);
        assert_eq!(
            report.checks,
            vec![(
                "CEO_BRIEFING_2024-03-04_0800".to_string(),
                CheckOutcome::Retry { iteration: 1 }
            )]
        );

        let report = scheduler.tick(at(2024, 3, 4, 8, 1));
        assert_eq!(report.checks[0].1, CheckOutcome::Released);
        assert!(scheduler.supervisor().active().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (_dir, scheduler) = scheduler(&[], Local::now());
        let scheduler = scheduler.with_tick(Duration::from_secs(3600));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }
}
