//! Draft generators, resolved per kind at startup.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use vault_common::config::GeneratorConfig;
use vault_common::{Error, Result};

use crate::filter::display_name;
use crate::record::Record;
use crate::state::Kind;

/// Produces the draft attached to a claimed record.
#[async_trait]
pub trait DraftGenerator: Send + Sync {
    /// Name stamped into `generated_by`.
    fn name(&self) -> &str;

    /// Draft text for `record`. Failures must be classified retryable or fatal.
    async fn generate(&self, record: &Record) -> Result<String>;
}

/// Prompt handed to external generators.
pub fn prompt_for(record: &Record) -> String {
    let mut prompt = format!(
        "Draft a {} for the following task. Reply with the draft text only.\n\n",
        match record.kind() {
            Kind::Email => "reply email".to_string(),
            Kind::SocialMedia => "social media post".to_string(),
            other => format!("{other} response"),
        }
    );
    for (key, value) in record.header.iter() {
        if key == "status" || value.is_empty() {
            continue;
        }
        prompt.push_str(&format!("{key}: {value}\n"));
    }
    prompt.push('\n');
    prompt.push_str(record.body.trim());
    prompt.push('\n');
    prompt
}

// ============================================================================
// Skeleton
// ============================================================================

/// Deterministic draft built from header fields, for a human to finish.
#[derive(Debug, Clone, Default)]
pub struct SkeletonGenerator;

#[async_trait]
impl DraftGenerator for SkeletonGenerator {
    fn name(&self) -> &str {
        "skeleton"
    }

    async fn generate(&self, record: &Record) -> Result<String> {
        let draft = match record.kind() {
            Kind::Email => {
                let from = record.header.first_of(&["from", "sender"]).unwrap_or_default();
                let name = display_name(from).unwrap_or_else(|| "there".to_string());
                let subject = record.get("subject").unwrap_or("your message");
                format!(
                    "Dear {name},\n\n\
                     Thank you for your message regarding \"{subject}\".\n\n\
                     [Response to the points raised]\n\n\
                     [Next steps]\n\n\
                     Best regards"
                )
            }
            Kind::SocialMedia => {
                let topic = record
                    .header
                    .first_of(&["topic", "title", "subject"])
                    .unwrap_or("our latest update");
                format!("[Hook about {topic}]\n\n[Key message]\n\n[Call to action]")
            }
            other => format!("[Draft for {other} task {}]", record.id),
        };
        Ok(draft)
    }
}

// ============================================================================
// External command
// ============================================================================

/// Runs an external program with the prompt on stdin and takes stdout as the draft.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandGenerator {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: Duration::from_secs(120),
        }
    }

    /// Build from `[program, args...]`.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone(), args.to_vec()))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn dependency(&self) -> String {
        format!("command:{}", self.program)
    }

    async fn run(&self, prompt: &str) -> Result<String> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                    Error::fatal(self.dependency(), format!("cannot start: {e}"))
                }
                _ => Error::retryable(self.dependency(), format!("spawn failed: {e}")),
            })?;

        // Feed stdin concurrently with draining stdout, or a filter that
        // writes as it reads blocks on a full pipe.
        let writer = child.stdin.take().map(|mut stdin| {
            let prompt = prompt.as_bytes().to_vec();
            let program = self.program.clone();
            tokio::spawn(async move {
                // A generator that exits without reading stdin is judged by its exit code.
                if let Err(e) = stdin.write_all(&prompt).await {
                    tracing::debug!(program = %program, error = %e, "Generator closed stdin early");
                }
            })
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::retryable(self.dependency(), e.to_string()))?;
        if let Some(writer) = writer {
            let _ = writer.await;
        }

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::retryable(
                self.dependency(),
                format!("exit code {code}: {}", stderr.trim()),
            ));
        }

        let draft = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if draft.is_empty() {
            return Err(Error::retryable(self.dependency(), "empty output"));
        }
        Ok(draft)
    }
}

#[async_trait]
impl DraftGenerator for CommandGenerator {
    fn name(&self) -> &str {
        &self.program
    }

    async fn generate(&self, record: &Record) -> Result<String> {
        let prompt = prompt_for(record);
        match tokio::time::timeout(self.timeout, self.run(&prompt)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                dependency: self.dependency(),
                after: self.timeout,
            }),
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Generator per kind. Kinds without one pass through drafting unchanged.
#[derive(Clone, Default)]
pub struct GeneratorRegistry {
    by_kind: HashMap<String, Arc<dyn DraftGenerator>>,
}

impl std::fmt::Debug for GeneratorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.by_kind.keys().collect();
        kinds.sort();
        f.debug_struct("GeneratorRegistry").field("kinds", &kinds).finish()
    }
}

impl GeneratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Email and social media get the configured command, else the skeleton.
    pub fn from_config(config: &GeneratorConfig, timeout: Duration) -> Self {
        let generator: Arc<dyn DraftGenerator> = match config
            .command
            .as_deref()
            .and_then(CommandGenerator::from_argv)
        {
            Some(cmd) => {
                tracing::info!(program = %cmd.program, "Using external draft generator");
                Arc::new(cmd.with_timeout(timeout))
            }
            None => Arc::new(SkeletonGenerator),
        };

        let mut registry = Self::new();
        registry.register(Kind::Email, Arc::clone(&generator));
        registry.register(Kind::SocialMedia, generator);
        registry
    }

    pub fn register(&mut self, kind: Kind, generator: Arc<dyn DraftGenerator>) {
        self.by_kind.insert(kind.as_str().to_string(), generator);
    }

    pub fn for_kind(&self, kind: &Kind) -> Option<Arc<dyn DraftGenerator>> {
        self.by_kind.get(kind.as_str()).cloned()
    }
}
