//! Task records: a `key: value` header between `---` delimiters, then a body.
//!
//! Header values are strings and only strings. Typed readings (dates,
//! amounts, addresses) belong to whichever consumer needs them; the store
//! never coerces. Values are trimmed on read and newlines inside a value are
//! folded to spaces on write, so neither surrounding whitespace nor embedded
//! line breaks survive a round trip.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use vault_common::{Error, Result};

use crate::state::{Kind, State};

const DELIMITER: &str = "---";

/// Keys written first, even when absent.
pub const KNOWN_KEYS: &[&str] = &["type", "status"];

// ============================================================================
// Header
// ============================================================================

/// Ordered string-to-string header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    entries: Vec<(String, String)>,
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Value of the first present key, skipping empty values.
    pub fn first_of(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .filter_map(|k| self.get(k))
            .find(|v| !v.trim().is_empty())
    }

    /// Set a value, replacing in place to keep ordering stable.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn kind(&self) -> Kind {
        Kind::parse(self.get("type").unwrap_or_default())
    }

    /// State named by the `status` key, if it parses.
    pub fn status(&self) -> Option<State> {
        self.get("status").and_then(|s| s.parse().ok())
    }
}

impl Serialize for Header {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Header {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut header = Header::new();
        for (k, v) in iter {
            header.set(k, v);
        }
        header
    }
}

// ============================================================================
// Parsing & rendering
// ============================================================================

/// Split a document into header and body.
///
/// Text that does not open with a delimiter line is all body. An opening
/// delimiter without a closing one is corrupt.
pub fn parse(text: &str, path: &Path) -> Result<(Header, String)> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut lines = text.split_inclusive('\n');

    let Some(first) = lines.next() else {
        return Ok((Header::new(), String::new()));
    };
    if first.trim_end() != DELIMITER {
        return Ok((Header::new(), text.to_string()));
    }

    let mut header = Header::new();
    let mut consumed = first.len();
    let mut closed = false;

    for line in lines {
        consumed += line.len();
        let trimmed = line.trim();
        if trimmed == DELIMITER {
            closed = true;
            break;
        }
        let Some((key, value)) = trimmed.split_once(':') else {
            if !trimmed.is_empty() {
                tracing::debug!(path = %path.display(), line = %trimmed, "Ignoring header line without ':'");
            }
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        header.set(key, value.trim());
    }

    if !closed {
        return Err(Error::CorruptRecord {
            path: path.to_path_buf(),
            reason: "header opened with '---' but never closed".into(),
        });
    }

    let body = text[consumed..].trim_start_matches(['\r', '\n']).to_string();
    Ok((header, body))
}

/// Serialise a header and body into the canonical text form.
pub fn render(header: &Header, body: &str) -> String {
    let mut out = String::from(DELIMITER);
    out.push('\n');

    let mut push = |key: &str, value: &str| {
        out.push_str(key);
        out.push_str(": ");
        out.push_str(&fold_value(value));
        out.push('\n');
    };

    for key in KNOWN_KEYS {
        push(*key, header.get(key).unwrap_or_default());
    }
    for (key, value) in header.iter() {
        if KNOWN_KEYS.contains(&key) {
            continue;
        }
        push(fold_key(key).as_str(), value);
    }

    out.push_str(DELIMITER);
    out.push_str("\n\n");
    out.push_str(body);
    if !body.ends_with('\n') {
        out.push('\n');
    }
    out
}

fn fold_value(value: &str) -> String {
    value
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn fold_key(key: &str) -> String {
    key.replace([':', '\n', '\r'], "_").trim().to_string()
}

// ============================================================================
// Record
// ============================================================================

/// A task record as read from disk.
#[derive(Debug, Clone, Serialize)]
pub struct Record {
    pub id: String,
    #[serde(skip)]
    pub path: PathBuf,
    pub file_name: String,
    pub header: Header,
    pub body: String,
    #[serde(serialize_with = "serialize_modified")]
    pub modified: SystemTime,
}

fn serialize_modified<S: serde::Serializer>(t: &SystemTime, s: S) -> std::result::Result<S::Ok, S::Error> {
    let dt: DateTime<Utc> = (*t).into();
    s.serialize_str(&dt.to_rfc3339())
}

impl Record {
    pub fn kind(&self) -> Kind {
        self.header.kind()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.header.get(key)
    }

    /// Text below the first heading matching one of `markers`.
    pub fn section(&self, markers: &[&str]) -> Option<String> {
        section(&self.body, markers)
    }
}

/// Record id for a path: the file stem. Stable across moves between states.
pub fn record_id(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

// ============================================================================
// Body sections
// ============================================================================

/// Extract the section below the first heading whose text matches a marker.
///
/// Markers may be given with or without leading `#`s and are matched
/// case-insensitively against the heading text. The section runs to the next
/// heading of the same or a higher level. Empty sections yield `None`.
pub fn section(body: &str, markers: &[&str]) -> Option<String> {
    let wanted: Vec<String> = markers
        .iter()
        .map(|m| m.trim_start_matches('#').trim().to_ascii_lowercase())
        .collect();

    let lines: Vec<&str> = body.lines().collect();
    for (idx, line) in lines.iter().enumerate() {
        let Some((level, title)) = heading(line) else {
            continue;
        };
        if !wanted.iter().any(|w| *w == title.to_ascii_lowercase()) {
            continue;
        }

        let content: Vec<&str> = lines[idx + 1..]
            .iter()
            .take_while(|l| heading(l).map_or(true, |(lvl, _)| lvl > level))
            .copied()
            .collect();
        let text = content.join("\n").trim().to_string();
        if text.is_empty() {
            continue;
        }
        return Some(text);
    }
    None
}

/// Replace (or append) the section under `marker` with `content`.
pub fn replace_section(body: &str, marker: &str, content: &str) -> String {
    let title = marker.trim_start_matches('#').trim();
    let level = marker.chars().take_while(|c| *c == '#').count().max(2);
    let lines: Vec<&str> = body.lines().collect();

    let start = lines.iter().position(|l| {
        heading(l).is_some_and(|(_, t)| t.eq_ignore_ascii_case(title))
    });

    let heading_line = format!("{} {}", "#".repeat(level), title);
    let Some(start) = start else {
        let mut out = body.trim_end().to_string();
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(&heading_line);
        out.push_str("\n\n");
        out.push_str(content.trim());
        out.push('\n');
        return out;
    };

    let end = lines[start + 1..]
        .iter()
        .position(|l| heading(l).is_some_and(|(lvl, _)| lvl <= level))
        .map(|p| start + 1 + p)
        .unwrap_or(lines.len());

    let mut out: Vec<String> = lines[..start].iter().map(|s| s.to_string()).collect();
    out.push(heading_line);
    out.push(String::new());
    out.push(content.trim().to_string());
    if end < lines.len() {
        out.push(String::new());
        out.extend(lines[end..].iter().map(|s| s.to_string()));
    }
    let mut text = out.join("\n");
    text.push('\n');
    text
}

fn heading(line: &str) -> Option<(usize, &str)> {
    let trimmed = line.trim_start();
    let level = trimmed.chars().take_while(|c| *c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &trimmed[level..];
    if !rest.is_empty() && !rest.starts_with(' ') {
        return None;
    }
    Some((level, rest.trim()))
}

// ============================================================================
// Timestamps
// ============================================================================

/// Timestamp format stamped into headers.
pub fn stamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Parse a header timestamp. Accepts RFC 3339, naive ISO (taken as UTC),
/// `YYYY-MM-DD HH:MM` and a bare date (midnight UTC).
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|n| n.and_utc())
}
