//! Terminal executors: the real-world side effect of an approved record.
//!
//! Each executor validates its record and builds a JSON payload. Delivery is
//! either a dry run (log and report) or a POST to the kind's configured
//! endpoint. HTTP failures are classified so the resilience layer can decide
//! whether a retry is worth it.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use vault_common::config::ExecutorsConfig;
use vault_common::{Error, Result};

use crate::filter::extract_address;
use crate::record::Record;
use crate::state::Kind;

/// Sections an email draft may live under, in order of preference.
pub const DRAFT_MARKERS: &[&str] = &["## Draft", "## Email Content", "## Body", "## Message", "## Content"];

/// Sections holding the text of a social post.
pub const POST_MARKERS: &[&str] = &["## Post", "## Content", "## Draft"];

pub const SOCIAL_PLATFORMS: &[&str] = &["linkedin", "facebook", "instagram", "twitter"];

/// Outcome of a successful execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionReport {
    pub dry_run: bool,
    pub summary: String,
}

/// Performs the action for one record kind.
#[async_trait]
pub trait Executor: Send + Sync {
    fn kind(&self) -> Kind;

    /// Perform the action. Must be safe to repeat after a retryable failure.
    async fn execute(&self, record: &Record) -> Result<ExecutionReport>;
}

/// Whether `error` means the record itself can never be executed.
pub fn is_permanent(error: &Error) -> bool {
    matches!(error.root(), Error::MissingField { .. } | Error::InvalidInput(_))
}

fn missing(record: &Record, field: &str) -> Error {
    Error::MissingField {
        record: record.id.clone(),
        field: field.to_string(),
    }
}

// ============================================================================
// Delivery
// ============================================================================

/// Where validated payloads go.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// Log the payload and report what would have happened
    DryRun,
    /// POST the payload as JSON
    Http { client: reqwest::Client, endpoint: String },
    /// Live mode without an endpoint
    Unconfigured,
}

impl Delivery {
    pub async fn deliver(&self, kind: &Kind, record: &Record, payload: Value, summary: String) -> Result<ExecutionReport> {
        let dependency = format!("executor:{kind}");
        match self {
            Self::DryRun => {
                tracing::info!(
                    record = %record.id,
                    kind = %kind,
                    payload = %payload,
                    "[DRY RUN] {summary}"
                );
                Ok(ExecutionReport {
                    dry_run: true,
                    summary: format!("[DRY RUN] {summary}"),
                })
            }
            Self::Unconfigured => Err(Error::Config(format!(
                "no delivery endpoint configured for kind '{kind}'"
            ))),
            Self::Http { client, endpoint } => {
                let response = client
                    .post(endpoint)
                    .json(&json!({
                        "kind": kind.as_str(),
                        "record": record.id,
                        "payload": payload,
                    }))
                    .send()
                    .await
                    .map_err(|e| classify_transport(&dependency, e))?;

                let status = response.status();
                if status.is_success() {
                    tracing::info!(record = %record.id, kind = %kind, status = status.as_u16(), "Delivered");
                    return Ok(ExecutionReport {
                        dry_run: false,
                        summary: format!("{summary} (HTTP {})", status.as_u16()),
                    });
                }

                let body = response.text().await.unwrap_or_default();
                let message = format!(
                    "HTTP {}: {}",
                    status.as_u16(),
                    vault_common::util::truncate_with_ellipsis(body.trim(), 200)
                );
                if status.as_u16() == 429 || status.is_server_error() {
                    Err(Error::retryable(dependency, message))
                } else {
                    Err(Error::fatal(dependency, message))
                }
            }
        }
    }
}

fn classify_transport(dependency: &str, error: reqwest::Error) -> Error {
    if error.is_timeout() || error.is_connect() || error.is_request() {
        Error::retryable(dependency, error.to_string())
    } else {
        Error::fatal(dependency, error.to_string())
    }
}

// ============================================================================
// Executors
// ============================================================================

/// Sends the approved reply.
#[derive(Debug, Clone)]
pub struct EmailExecutor {
    delivery: Delivery,
}

impl EmailExecutor {
    pub fn new(delivery: Delivery) -> Self {
        Self { delivery }
    }

    pub fn payload(record: &Record) -> Result<(Value, String)> {
        let to = record
            .get("to")
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .or_else(|| record.header.first_of(&["from", "sender"]).and_then(extract_address))
            .ok_or_else(|| missing(record, "to"))?;

        let body = record
            .section(DRAFT_MARKERS)
            .ok_or_else(|| missing(record, "draft"))?;

        let original = record.get("subject").unwrap_or_default().trim();
        let subject = if original.is_empty() {
            "Re: (no subject)".to_string()
        } else if original.to_ascii_lowercase().starts_with("re:") {
            original.to_string()
        } else {
            format!("Re: {original}")
        };

        let mut payload = json!({ "to": to, "subject": subject, "body": body });
        if let Some(id) = record.header.first_of(&["message_id", "gmail_id"]) {
            payload["in_reply_to"] = json!(id);
        }
        Ok((payload, format!("send email to {to}: {subject}")))
    }
}

#[async_trait]
impl Executor for EmailExecutor {
    fn kind(&self) -> Kind {
        Kind::Email
    }

    async fn execute(&self, record: &Record) -> Result<ExecutionReport> {
        let (payload, summary) = Self::payload(record)?;
        self.delivery.deliver(&self.kind(), record, payload, summary).await
    }
}

/// Publishes the approved post.
#[derive(Debug, Clone)]
pub struct SocialExecutor {
    delivery: Delivery,
}

impl SocialExecutor {
    pub fn new(delivery: Delivery) -> Self {
        Self { delivery }
    }

    pub fn payload(record: &Record) -> Result<(Value, String)> {
        let platform = record
            .get("platform")
            .map(|p| p.trim().to_ascii_lowercase())
            .filter(|p| !p.is_empty())
            .ok_or_else(|| missing(record, "platform"))?;
        if !SOCIAL_PLATFORMS.contains(&platform.as_str()) {
            return Err(Error::InvalidInput(format!(
                "unsupported platform '{platform}' (expected one of {})",
                SOCIAL_PLATFORMS.join(", ")
            )));
        }

        let text = record
            .section(POST_MARKERS)
            .or_else(|| Some(record.body.trim().to_string()).filter(|b| !b.is_empty()))
            .ok_or_else(|| missing(record, "content"))?;

        let summary = format!(
            "post to {platform}: {}",
            vault_common::util::truncate_with_ellipsis(&text, 60)
        );
        Ok((json!({ "platform": platform, "text": text }), summary))
    }
}

#[async_trait]
impl Executor for SocialExecutor {
    fn kind(&self) -> Kind {
        Kind::SocialMedia
    }

    async fn execute(&self, record: &Record) -> Result<ExecutionReport> {
        let (payload, summary) = Self::payload(record)?;
        self.delivery.deliver(&self.kind(), record, payload, summary).await
    }
}

/// Books the approved payment or invoice.
#[derive(Debug, Clone)]
pub struct PaymentExecutor {
    delivery: Delivery,
}

impl PaymentExecutor {
    pub fn new(delivery: Delivery) -> Self {
        Self { delivery }
    }

    pub fn payload(record: &Record) -> Result<(Value, String)> {
        let vendor = record
            .header
            .first_of(&["vendor", "partner"])
            .map(str::trim)
            .ok_or_else(|| missing(record, "vendor"))?;

        let raw = record
            .get("amount")
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| missing(record, "amount"))?;
        let amount: f64 = raw
            .trim_start_matches(['$', '€', '£'])
            .replace(',', "")
            .parse()
            .map_err(|_| Error::InvalidInput(format!("amount '{raw}' is not a number")))?;
        if !amount.is_finite() || amount <= 0.0 {
            return Err(Error::InvalidInput(format!("amount '{raw}' must be positive")));
        }

        let currency = record.get("currency").unwrap_or("USD").trim().to_ascii_uppercase();
        let mut payload = json!({ "vendor": vendor, "amount": amount, "currency": currency });
        if let Some(reference) = record.header.first_of(&["reference", "invoice_number"]) {
            payload["reference"] = json!(reference);
        }
        if let Some(description) = record.get("description") {
            payload["description"] = json!(description);
        }
        Ok((payload, format!("pay {amount:.2} {currency} to {vendor}")))
    }
}

#[async_trait]
impl Executor for PaymentExecutor {
    fn kind(&self) -> Kind {
        Kind::Payment
    }

    async fn execute(&self, record: &Record) -> Result<ExecutionReport> {
        let (payload, summary) = Self::payload(record)?;
        self.delivery.deliver(&self.kind(), record, payload, summary).await
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Executor per kind. A kind is on the approval pipeline iff it has one.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    by_kind: HashMap<String, Arc<dyn Executor>>,
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Email, social media and payment executors, dry-run or live.
    pub fn from_config(config: &ExecutorsConfig, dry_run: bool, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("building HTTP client: {e}")))?;

        let delivery_for = |kind: &Kind| {
            if dry_run {
                return Delivery::DryRun;
            }
            match config.endpoints.get(kind.as_str()) {
                Some(endpoint) => Delivery::Http {
                    client: client.clone(),
                    endpoint: endpoint.clone(),
                },
                None => {
                    tracing::warn!(kind = %kind, "Live mode without delivery endpoint; executions will fail");
                    Delivery::Unconfigured
                }
            }
        };

        let mut registry = Self::new();
        registry.register(Arc::new(EmailExecutor::new(delivery_for(&Kind::Email))));
        registry.register(Arc::new(SocialExecutor::new(delivery_for(&Kind::SocialMedia))));
        registry.register(Arc::new(PaymentExecutor::new(delivery_for(&Kind::Payment))));
        Ok(registry)
    }

    /// Dry-run executors for every supported kind.
    pub fn dry_run() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(EmailExecutor::new(Delivery::DryRun)));
        registry.register(Arc::new(SocialExecutor::new(Delivery::DryRun)));
        registry.register(Arc::new(PaymentExecutor::new(Delivery::DryRun)));
        registry
    }

    pub fn register(&mut self, executor: Arc<dyn Executor>) {
        self.by_kind.insert(executor.kind().as_str().to_string(), executor);
    }

    pub fn for_kind(&self, kind: &Kind) -> Option<Arc<dyn Executor>> {
        self.by_kind.get(kind.as_str()).cloned()
    }

    pub fn has(&self, kind: &Kind) -> bool {
        self.by_kind.contains_key(kind.as_str())
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<_> = self.by_kind.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}
