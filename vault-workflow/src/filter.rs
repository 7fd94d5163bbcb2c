//! Sender filter for intake email.
//!
//! Automated and bulk mail is routed straight to Done instead of being
//! drafted a reply.

use regex::Regex;
use std::sync::LazyLock;
use vault_common::config::FilterConfig;

use crate::record::Record;
use crate::state::Kind;

static ADDRESS_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").unwrap());

/// Bare address inside a `From`-style value (`Jane <jane@x.com>` -> `jane@x.com`).
pub fn extract_address(value: &str) -> Option<String> {
    ADDRESS_PATTERN
        .find(value)
        .map(|m| m.as_str().to_ascii_lowercase())
}

/// Display name of a `From`-style value, falling back to the address local part.
pub fn display_name(value: &str) -> Option<String> {
    if let Some((name, _)) = value.split_once('<') {
        let name = name.trim().trim_matches('"').trim();
        if !name.is_empty() {
            return Some(name.to_string());
        }
    }
    extract_address(value).and_then(|a| a.split('@').next().map(str::to_string))
}

/// Classifies senders as automated by domain fragment or keyword.
#[derive(Debug, Clone)]
pub struct SenderFilter {
    domains: Vec<String>,
    keywords: Vec<String>,
}

impl Default for SenderFilter {
    fn default() -> Self {
        Self::from_config(&FilterConfig::default())
    }
}

impl SenderFilter {
    pub fn new(domains: Vec<String>, keywords: Vec<String>) -> Self {
        Self {
            domains: domains.into_iter().map(|d| d.to_ascii_lowercase()).collect(),
            keywords: keywords.into_iter().map(|k| k.to_ascii_lowercase()).collect(),
        }
    }

    pub fn from_config(config: &FilterConfig) -> Self {
        Self::new(
            config.automated_domains.clone(),
            config.automated_keywords.clone(),
        )
    }

    /// Why `from`/`subject` look automated, or `None` if they don't.
    pub fn check(&self, from: &str, subject: &str) -> Option<String> {
        let from_lower = from.to_ascii_lowercase();
        let domain = extract_address(from)
            .and_then(|a| a.split_once('@').map(|(_, d)| d.to_string()))
            .unwrap_or_default();

        // The local part counts too: noreply@company.com is as automated as it gets.
        let local = extract_address(from)
            .and_then(|a| a.split_once('@').map(|(l, _)| l.to_string()))
            .unwrap_or_default();

        if let Some(hit) = self
            .domains
            .iter()
            .find(|d| domain.contains(d.as_str()) || local.contains(d.as_str()))
        {
            return Some(format!("automated sender domain '{hit}'"));
        }

        let subject_lower = subject.to_ascii_lowercase();
        self.keywords
            .iter()
            .find(|k| from_lower.contains(k.as_str()) || subject_lower.contains(k.as_str()))
            .map(|k| format!("automated keyword '{k}'"))
    }

    /// Skip reason for an intake record. Only email is filtered.
    pub fn classify(&self, record: &Record) -> Option<String> {
        if record.kind() != Kind::Email {
            return None;
        }
        let from = record.header.first_of(&["from", "sender"]).unwrap_or_default();
        let subject = record.get("subject").unwrap_or_default();
        self.check(from, subject)
    }
}
