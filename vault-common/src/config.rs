//! Configuration management for vault services.
//!
//! Every process role (cloud worker, local worker, dashboard, scheduler, sync)
//! reads the same file at `~/.vault/config.json`, or the path in `VAULT_CONFIG`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (VAULT_* prefix)
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `VAULT_PATH` → vault.path
//! - `VAULT_WORK_ZONE` → worker.zone (`cloud` | `local`)
//! - `VAULT_DRY_RUN` → worker.dry_run
//! - `VAULT_JWT_SECRET` → auth.jwt_secret
//! - `VAULT_LOG_LEVEL` → observability.log_level
//! - `VAULT_LOG_FORMAT` → observability.log_format
//! - `VAULT_BIND_ADDRESS` → dashboard.bind
//! - `VAULT_PORT` → dashboard.port

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".vault"),
        |dirs| dirs.home_dir().join(".vault"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    std::env::var("VAULT_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| config_dir().join("config.json"))
}

// ============================================================================
// Vault
// ============================================================================

/// Location of the shared vault.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Vault root; `~` is expanded
    #[serde(default = "default_vault_path")]
    pub path: String,
    /// File whose presence marks this host as the cloud zone
    #[serde(default = "default_cloud_marker")]
    pub cloud_marker: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            path: default_vault_path(),
            cloud_marker: default_cloud_marker(),
        }
    }
}

fn default_vault_path() -> String {
    "~/vault".into()
}

fn default_cloud_marker() -> String {
    "/etc/vault_cloud_marker".into()
}

// ============================================================================
// Worker
// ============================================================================

/// Which side of the split deployment a process runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkZone {
    Cloud,
    Local,
}

impl WorkZone {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cloud => "cloud",
            Self::Local => "local",
        }
    }
}

impl fmt::Display for WorkZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkZone {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cloud" => Ok(Self::Cloud),
            "local" => Ok(Self::Local),
            other => Err(format!("unknown work zone '{other}'")),
        }
    }
}

/// A stage of a worker pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    /// Reject pending approvals past their `expires` stamp
    Expire,
    /// Claim intake records and generate drafts
    ClaimAndDraft,
    /// Move drafted records into human review
    Submit,
    /// Run terminal executors for approved records
    Execute,
    /// Archive rejected records
    Archive,
}

impl WorkerRole {
    pub const ALL: [WorkerRole; 5] = [
        WorkerRole::Expire,
        WorkerRole::ClaimAndDraft,
        WorkerRole::Submit,
        WorkerRole::Execute,
        WorkerRole::Archive,
    ];

    /// Roles a zone takes on when none are configured.
    pub fn defaults_for(zone: WorkZone) -> Vec<WorkerRole> {
        match zone {
            WorkZone::Cloud => vec![WorkerRole::ClaimAndDraft],
            WorkZone::Local => Self::ALL.to_vec(),
        }
    }
}

/// Worker loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Explicit zone; falls back to cloud-marker detection
    #[serde(default)]
    pub zone: Option<WorkZone>,
    /// Explicit roles; falls back to the zone defaults
    #[serde(default)]
    pub roles: Option<Vec<WorkerRole>>,
    /// Seconds between passes
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Executors validate and log instead of calling out
    #[serde(default = "default_true")]
    pub dry_run: bool,
    /// Approval window stamped into `expires` on submission (0 = never)
    #[serde(default = "default_approval_ttl_hours")]
    pub approval_ttl_hours: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            zone: None,
            roles: None,
            poll_interval_secs: default_poll_interval_secs(),
            dry_run: true,
            approval_ttl_hours: default_approval_ttl_hours(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_approval_ttl_hours() -> u64 {
    24
}

// ============================================================================
// Resilience
// ============================================================================

/// Retry and circuit breaker settings applied to every external dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
    /// Upper bound for a single external call
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    2_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_secs() -> u64 {
    60
}

fn default_call_timeout_secs() -> u64 {
    30
}

// ============================================================================
// Change feed
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_feed_poll_ms")]
    pub poll_interval_ms: u64,
    /// Outbound queue depth per subscriber
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_feed_poll_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_feed_poll_ms() -> u64 {
    2_000
}

fn default_queue_capacity() -> usize {
    64
}

// ============================================================================
// Scheduler
// ============================================================================

/// A named trigger that drops a record into intake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub name: String,
    /// Cron expression (5 or 6 fields) or `@every <n>s|m|h`
    pub schedule: String,
    /// Value written to the record's `type` header
    pub kind: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    /// Seed a supervision with this iteration cap
    #[serde(default)]
    pub supervise: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_triggers")]
    pub triggers: Vec<TriggerConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_secs: default_tick_secs(),
            triggers: default_triggers(),
        }
    }
}

fn default_tick_secs() -> u64 {
    30
}

fn default_triggers() -> Vec<TriggerConfig> {
    vec![
        TriggerConfig {
            name: "ceo_briefing".into(),
            schedule: "0 8 * * Mon".into(),
            kind: "briefing".into(),
            title: "Monday Morning CEO Briefing".into(),
            body: "Summarise last week's revenue, completed tasks, bottlenecks and \
                   proactive suggestions. Write the result to Plans/ and move this \
                   file to Done/ when finished."
                .into(),
            supervise: Some(5),
        },
        TriggerConfig {
            name: "weekly_audit".into(),
            schedule: "0 17 * * Fri".into(),
            kind: "audit".into(),
            title: "Weekly Business Audit".into(),
            body: "Review this week's audit ledger, pending approvals and failed \
                   executions. Move this file to Done/ when finished."
                .into(),
            supervise: None,
        },
    ]
}

// ============================================================================
// Sync
// ============================================================================

/// Version-control synchronisation between zones on different hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_remote")]
    pub remote: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_sync_interval_secs")]
    pub interval_secs: u64,
    /// Vault-relative directories staged on each pass
    #[serde(default = "default_sync_paths")]
    pub paths: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            remote: default_remote(),
            branch: default_branch(),
            interval_secs: default_sync_interval_secs(),
            paths: default_sync_paths(),
        }
    }
}

fn default_remote() -> String {
    "origin".into()
}

fn default_branch() -> String {
    "main".into()
}

fn default_sync_interval_secs() -> u64 {
    300
}

fn default_sync_paths() -> Vec<String> {
    [
        "Needs_Action",
        "In_Progress",
        "Updates",
        "Signals",
        "Pending_Approval",
        "Approved",
        "Rejected",
        "Done",
        "Plans",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

// ============================================================================
// Dashboard & Auth
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardConfig {
    #[serde(default = "default_bind_address")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_port(),
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    8000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret; when unset the HTTP API is open and the feed accepts any token
    #[serde(default)]
    pub jwt_secret: Option<String>,
    #[serde(default = "default_token_expiry_secs")]
    pub token_expiry_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            token_expiry_secs: default_token_expiry_secs(),
        }
    }
}

fn default_token_expiry_secs() -> u64 {
    86_400
}

// ============================================================================
// Generators & Executors
// ============================================================================

/// External draft generator. When `command` is unset the skeleton generator is used.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Program and arguments; the prompt is written to stdin
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

/// Live-mode delivery endpoints keyed by record kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorsConfig {
    #[serde(default)]
    pub endpoints: HashMap<String, String>,
}

/// Sender filter for intake email.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default = "default_automated_domains")]
    pub automated_domains: Vec<String>,
    #[serde(default = "default_automated_keywords")]
    pub automated_keywords: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            automated_domains: default_automated_domains(),
            automated_keywords: default_automated_keywords(),
        }
    }
}

fn default_automated_domains() -> Vec<String> {
    [
        "noreply",
        "no-reply",
        "mailer-daemon",
        "notifications",
        "newsletter",
        "marketing",
        "bounce",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_automated_keywords() -> Vec<String> {
    [
        "unsubscribe",
        "newsletter",
        "do not reply",
        "automated",
        "notification",
        "digest",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

// ============================================================================
// Observability
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `pretty` or `json`
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ============================================================================
// Root
// ============================================================================

/// Root configuration shared by every vault process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub resilience: ResilienceConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub executors: ExecutorsConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the default path, falling back to defaults.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration and apply environment overrides.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup (environment in production).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("VAULT_PATH") {
            self.vault.path = path;
        }

        if let Some(zone) = lookup("VAULT_WORK_ZONE") {
            match zone.parse() {
                Ok(z) => self.worker.zone = Some(z),
                Err(e) => tracing::warn!(error = %e, "Ignoring VAULT_WORK_ZONE"),
            }
        }

        if let Some(dry_run) = lookup("VAULT_DRY_RUN") {
            self.worker.dry_run = !matches!(
                dry_run.trim().to_ascii_lowercase().as_str(),
                "false" | "0" | "no" | "off"
            );
        }

        if let Some(secret) = lookup("VAULT_JWT_SECRET") {
            self.auth.jwt_secret = Some(secret);
        }

        if let Some(level) = lookup("VAULT_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Some(format) = lookup("VAULT_LOG_FORMAT") {
            self.observability.log_format = format;
        }

        if let Some(bind) = lookup("VAULT_BIND_ADDRESS") {
            self.dashboard.bind = bind;
        }
        if let Some(port) = lookup("VAULT_PORT") {
            if let Ok(p) = port.parse() {
                self.dashboard.port = p;
            }
        }
    }

    /// Vault root with `~` and environment variables expanded.
    pub fn vault_root(&self) -> PathBuf {
        match shellexpand::full(&self.vault.path) {
            Ok(expanded) => PathBuf::from(expanded.as_ref()),
            Err(_) => PathBuf::from(shellexpand::tilde(&self.vault.path).as_ref()),
        }
    }

    /// Zone of this process: explicit setting, else cloud-marker detection.
    pub fn zone(&self) -> WorkZone {
        if let Some(zone) = self.worker.zone {
            return zone;
        }
        if Path::new(&self.vault.cloud_marker).exists() {
            WorkZone::Cloud
        } else {
            WorkZone::Local
        }
    }

    /// Roles this process runs on each worker pass.
    pub fn roles(&self) -> Vec<WorkerRole> {
        self.worker
            .roles
            .clone()
            .unwrap_or_else(|| WorkerRole::defaults_for(self.zone()))
    }

    /// Report configuration combinations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.vault.path.trim().is_empty() {
            problems.push("vault.path must not be empty".to_string());
        }
        if self.worker.poll_interval_secs == 0 {
            problems.push("worker.poll_interval_secs must be greater than 0".to_string());
        }
        if self.feed.poll_interval_ms == 0 {
            problems.push("feed.poll_interval_ms must be greater than 0".to_string());
        }
        if self.feed.queue_capacity == 0 {
            problems.push("feed.queue_capacity must be greater than 0".to_string());
        }
        if self.resilience.max_delay_ms < self.resilience.base_delay_ms {
            problems.push("resilience.max_delay_ms must be >= base_delay_ms".to_string());
        }
        if self.resilience.failure_threshold == 0 {
            problems.push("resilience.failure_threshold must be greater than 0".to_string());
        }
        if self.resilience.call_timeout_secs == 0 {
            problems.push("resilience.call_timeout_secs must be greater than 0".to_string());
        }

        for trigger in &self.scheduler.triggers {
            if trigger.name.trim().is_empty() {
                problems.push("scheduler trigger with empty name".to_string());
            }
            if let Err(e) = validate_schedule(&trigger.schedule) {
                problems.push(format!("trigger '{}': {}", trigger.name, e));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("Invalid configuration: {}", problems.join("; "))
        }
    }
}

/// Trigger slots are named to the minute, so a schedule may fire at most once
/// a minute: the seconds field of a cron expression must be a single value.
pub fn check_minute_resolution(normalized: &str) -> std::result::Result<(), String> {
    let seconds = normalized.split_whitespace().next().unwrap_or_default();
    if !seconds.is_empty() && seconds.chars().all(|c| c.is_ascii_digit()) {
        Ok(())
    } else {
        Err(format!(
            "seconds field '{seconds}' fires more than once a minute"
        ))
    }
}

/// Normalise a 5-field crontab expression to the 6-field form `cron` expects.
pub fn normalize_cron(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}

fn validate_schedule(schedule: &str) -> std::result::Result<(), String> {
    let schedule = schedule.trim();
    if schedule.is_empty() {
        return Err("schedule must not be empty".into());
    }
    if let Some(every) = schedule.strip_prefix("@every") {
        return parse_every(every.trim()).map(|_| ());
    }
    let normalized = normalize_cron(schedule);
    cron::Schedule::from_str(&normalized)
        .map_err(|e| format!("invalid cron expression '{schedule}': {e}"))?;
    check_minute_resolution(&normalized)
}

/// Parse the interval of an `@every` schedule (`90s`, `15m`, `2h`).
pub fn parse_every(spec: &str) -> std::result::Result<std::time::Duration, String> {
    let spec = spec.trim();
    let split = spec
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(spec.len());
    let (digits, unit) = spec.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid interval '{spec}'"))?;
    let secs = match unit {
        "" | "s" => value,
        "m" => value * 60,
        "h" => value * 3_600,
        other => return Err(format!("unknown interval unit '{other}'")),
    };
    if secs < 60 {
        return Err(format!("interval '{spec}' is under a minute"));
    }
    Ok(std::time::Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.resilience.max_retries, 3);
        assert_eq!(config.resilience.base_delay_ms, 2_000);
        assert_eq!(config.resilience.failure_threshold, 5);
        assert_eq!(config.feed.poll_interval_ms, 2_000);
        assert!(config.worker.dry_run);
        assert_eq!(config.scheduler.triggers.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"vault": {"path": "/srv/vault"}, "worker": {"zone": "cloud"}}"#)
                .unwrap();
        assert_eq!(config.vault_root(), PathBuf::from("/srv/vault"));
        assert_eq!(config.zone(), WorkZone::Cloud);
        assert_eq!(config.roles(), vec![WorkerRole::ClaimAndDraft]);
        assert_eq!(config.dashboard.port, 8000);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        let env: HashMap<&str, &str> = [
            ("VAULT_PATH", "/tmp/v"),
            ("VAULT_WORK_ZONE", "LOCAL"),
            ("VAULT_DRY_RUN", "false"),
            ("VAULT_JWT_SECRET", "s3cret"),
            ("VAULT_PORT", "9100"),
        ]
        .into_iter()
        .collect();

        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.vault.path, "/tmp/v");
        assert_eq!(config.worker.zone, Some(WorkZone::Local));
        assert!(!config.worker.dry_run);
        assert_eq!(config.auth.jwt_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.dashboard.port, 9100);
    }

    #[test]
    fn test_zone_from_marker() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("marker");
        let mut config = Config::default();
        config.vault.cloud_marker = marker.to_string_lossy().to_string();

        assert_eq!(config.zone(), WorkZone::Local);
        fs::write(&marker, "").unwrap();
        assert_eq!(config.zone(), WorkZone::Cloud);
        assert_eq!(config.roles(), vec![WorkerRole::ClaimAndDraft]);
    }

    #[test]
    fn test_validate_rejects_bad_trigger() {
        let mut config = Config::default();
        config.scheduler.triggers.push(TriggerConfig {
            name: "broken".into(),
            schedule: "every tuesday".into(),
            kind: "briefing".into(),
            title: "x".into(),
            body: String::new(),
            supervise: None,
        });
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("broken"));
    }

    #[test_case("0 8 * * Mon", "0 0 8 * * Mon" ; "five fields gain seconds")]
    #[test_case("30 0 8 * * Mon", "30 0 8 * * Mon" ; "six fields unchanged")]
    fn test_normalize_cron(input: &str, expected: &str) {
        assert_eq!(normalize_cron(input), expected);
    }

    #[test_case("90s", 90)]
    #[test_case("15m", 900)]
    #[test_case("2h", 7_200)]
    #[test_case("120", 120)]
    fn test_parse_every(spec: &str, secs: u64) {
        assert_eq!(parse_every(spec).unwrap().as_secs(), secs);
    }

    #[test]
    fn test_parse_every_rejects_garbage() {
        assert!(parse_every("0s").is_err());
        assert!(parse_every("30s").is_err());
        assert!(parse_every("59").is_err());
        assert!(parse_every("5d").is_err());
        assert!(parse_every("soon").is_err());
    }
}
