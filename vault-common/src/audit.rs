//! Append-only audit ledger.
//!
//! Every state transition and every external call outcome is appended as one
//! JSON line to a daily file `audit-YYYY-MM-DD.jsonl` under the ledger
//! directory. Entries are never rewritten. Readers skip lines that fail to
//! parse, which covers a trailing line cut short by a crash or a concurrent
//! writer in another process.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

// ============================================================================
// Types
// ============================================================================

/// Outcome recorded with an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    Failure,
    Skipped,
}

impl std::fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// A single ledger line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub category: String,
    pub action: String,
    pub status: AuditStatus,
    #[serde(default)]
    pub details: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditEntry {
    /// The record id this entry concerns, if any.
    pub fn record(&self) -> Option<&str> {
        self.details.get("record").and_then(Value::as_str)
    }
}

/// Builder for an entry about to be appended.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    category: String,
    action: String,
    status: AuditStatus,
    details: Map<String, Value>,
    error: Option<String>,
}

impl AuditEvent {
    pub fn new(category: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            action: action.into(),
            status: AuditStatus::Success,
            details: Map::new(),
            error: None,
        }
    }

    pub fn status(mut self, status: AuditStatus) -> Self {
        self.status = status;
        self
    }

    pub fn detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Tag the event with the record it concerns.
    pub fn record(self, id: impl Into<String>) -> Self {
        self.detail("record", id.into())
    }

    /// Mark the event as failed with an error message.
    pub fn error(mut self, error: impl ToString) -> Self {
        self.status = AuditStatus::Failure;
        self.error = Some(error.to_string());
        self
    }
}

/// Filter for [`AuditLedger::query`]. Date bounds are inclusive.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditQuery {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub start: Option<NaiveDate>,
    #[serde(default)]
    pub end: Option<NaiveDate>,
}

impl AuditQuery {
    pub fn category(category: impl Into<String>) -> Self {
        Self {
            category: Some(category.into()),
            ..Default::default()
        }
    }

    pub fn between(mut self, start: NaiveDate, end: NaiveDate) -> Self {
        self.start = Some(start);
        self.end = Some(end);
        self
    }

    fn covers(&self, date: NaiveDate) -> bool {
        self.start.map_or(true, |s| date >= s) && self.end.map_or(true, |e| date <= e)
    }
}

/// Counts over a date range.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditSummary {
    pub total: usize,
    pub by_category: BTreeMap<String, usize>,
    pub by_status: BTreeMap<String, usize>,
    pub by_category_status: BTreeMap<String, BTreeMap<String, usize>>,
}

// ============================================================================
// Ledger
// ============================================================================

/// File-backed audit ledger.
#[derive(Debug)]
pub struct AuditLedger {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl AuditLedger {
    /// Open a ledger rooted at `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create audit directory {}", dir.display()))?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("audit-{}.jsonl", date.format("%Y-%m-%d")))
    }

    /// Append an event and return the stored entry.
    pub fn append(&self, event: AuditEvent) -> Result<AuditEntry> {
        let entry = AuditEntry {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            category: event.category,
            action: event.action,
            status: event.status,
            details: event.details,
            error: event.error,
        };

        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        let path = self.file_for(entry.timestamp.date_naive());

        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| anyhow::anyhow!("audit lock poisoned: {e}"))?;
        // A torn trailing line must not swallow the next entry.
        if !ends_with_newline(&path)? {
            line.insert(0, '\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open audit log: {}", path.display()))?;
        // One write call per line keeps concurrent appenders from interleaving.
        file.write_all(line.as_bytes())?;

        tracing::debug!(
            category = %entry.category,
            action = %entry.action,
            status = %entry.status,
            "Audit event logged"
        );
        Ok(entry)
    }

    /// Append, logging instead of failing. For loops that must keep going.
    pub fn log(&self, event: AuditEvent) {
        let (category, action) = (event.category.clone(), event.action.clone());
        if let Err(e) = self.append(event) {
            tracing::error!(category = %category, action = %action, error = %e, "Failed to write audit event");
        }
    }

    /// Entries matching the query, oldest first.
    pub fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>> {
        let mut entries = Vec::new();

        for (date, path) in self.files()? {
            if !query.covers(date) {
                continue;
            }
            let file = File::open(&path)
                .with_context(|| format!("Failed to open audit log: {}", path.display()))?;
            for (line_no, raw) in BufReader::new(file).split(b'\n').enumerate() {
                let Ok(raw) = raw else { break };
                let line = match String::from_utf8(raw) {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::warn!(
                            file = %path.display(),
                            line = line_no + 1,
                            error = %e,
                            "Skipping non-UTF-8 audit line"
                        );
                        continue;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<AuditEntry>(&line) {
                    Ok(entry) => {
                        if !query.covers(entry.timestamp.date_naive()) {
                            continue;
                        }
                        if let Some(ref cat) = query.category {
                            if &entry.category != cat {
                                continue;
                            }
                        }
                        entries.push(entry);
                    }
                    Err(e) => {
                        tracing::warn!(
                            file = %path.display(),
                            line = line_no + 1,
                            error = %e,
                            "Skipping corrupt audit line"
                        );
                    }
                }
            }
        }

        entries.sort_by_key(|e| e.timestamp);
        Ok(entries)
    }

    /// Entries for one record, oldest first.
    pub fn for_record(&self, record: &str) -> Result<Vec<AuditEntry>> {
        Ok(self
            .query(&AuditQuery::default())?
            .into_iter()
            .filter(|e| e.record() == Some(record))
            .collect())
    }

    /// Counts by category and status over an inclusive date range.
    pub fn summary(&self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Result<AuditSummary> {
        let entries = self.query(&AuditQuery {
            category: None,
            start,
            end,
        })?;

        let mut summary = AuditSummary {
            total: entries.len(),
            ..Default::default()
        };
        for entry in &entries {
            let status = entry.status.to_string();
            *summary.by_category.entry(entry.category.clone()).or_default() += 1;
            *summary.by_status.entry(status.clone()).or_default() += 1;
            *summary
                .by_category_status
                .entry(entry.category.clone())
                .or_default()
                .entry(status)
                .or_default() += 1;
        }
        Ok(summary)
    }

    /// Daily files present in the ledger directory, sorted by date.
    fn files(&self) -> Result<Vec<(NaiveDate, PathBuf)>> {
        let mut files = Vec::new();
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };

        for entry in read_dir.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(date) = name
                .strip_prefix("audit-")
                .and_then(|s| s.strip_suffix(".jsonl"))
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
            else {
                continue;
            };
            files.push((date, entry.path()));
        }

        files.sort_by_key(|(date, _)| *date);
        Ok(files)
    }
}

fn ends_with_newline(path: &Path) -> Result<bool> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e.into()),
    };
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}
