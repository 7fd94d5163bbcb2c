//! Inbox intake.
//!
//! Files dropped into `Inbox/` become `file_drop` records in `Needs_Action/`.
//! Drops already announced are remembered in `.state/inbox.json` by name,
//! size and modification time, so a restart does not announce them twice
//! while a replaced file is announced again.

use chrono::{Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use vault_common::util::sanitize_filename;
use vault_common::{AuditEvent, AuditLedger, AuditStatus, Result};
use walkdir::WalkDir;

use crate::record::{self, Header};
use crate::state::{Kind, State};
use crate::store::Vault;

const CATEGORY: &str = "inbox";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Fingerprint {
    size: u64,
    modified_ms: u128,
}

#[derive(Debug, Clone)]
pub struct InboxScanner {
    vault: Vault,
    ledger: Arc<AuditLedger>,
    state_path: PathBuf,
}

impl InboxScanner {
    pub fn new(vault: Vault, ledger: Arc<AuditLedger>) -> Self {
        let state_path = vault.layout().state_file("inbox.json");
        Self {
            vault,
            ledger,
            state_path,
        }
    }

    fn load(&self) -> Result<BTreeMap<String, Fingerprint>> {
        let text = match fs::read_to_string(&self.state_path) {
            Ok(t) => t,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&text) {
            Ok(seen) => Ok(seen),
            Err(e) => {
                tracing::warn!(path = %self.state_path.display(), error = %e, "Corrupt inbox state, rescanning");
                Ok(BTreeMap::new())
            }
        }
    }

    fn save(&self, seen: &BTreeMap<String, Fingerprint>) -> Result<()> {
        if let Some(parent) = self.state_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.state_path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(seen)?)?;
        fs::rename(&tmp, &self.state_path)?;
        Ok(())
    }

    /// Announce every new or replaced drop. Returns the records created.
    ///
    /// Hidden files are ignored; uploaders write those before renaming.
    pub fn scan(&self) -> Result<Vec<PathBuf>> {
        let inbox = self.vault.layout().inbox_dir();
        if !inbox.is_dir() {
            return Ok(Vec::new());
        }

        let mut seen = self.load()?;
        let mut present = BTreeSet::new();
        let mut created = Vec::new();

        let entries = WalkDir::new(&inbox)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok());

        for entry in entries {
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let fingerprint = Fingerprint {
                size: meta.len(),
                modified_ms: meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map_or(0, |d| d.as_millis()),
            };
            present.insert(name.clone());
            if seen.get(&name) == Some(&fingerprint) {
                continue;
            }

            match self.announce(entry.path(), &name, fingerprint.size) {
                Ok(path) => {
                    seen.insert(name, fingerprint);
                    created.push(path);
                }
                Err(e) => {
                    tracing::error!(file = %name, error = %e, "Failed to announce inbox drop");
                    self.ledger.log(
                        AuditEvent::new(CATEGORY, "file_drop_failed")
                            .detail("filename", name)
                            .status(AuditStatus::Failure)
                            .error(&e),
                    );
                }
            }
        }

        seen.retain(|name, _| present.contains(name));
        self.save(&seen)?;
        Ok(created)
    }

    /// Write the intake record for one drop under a name no record uses yet.
    fn announce(&self, source: &Path, name: &str, size: u64) -> Result<PathBuf> {
        let stem = Path::new(name)
            .file_stem()
            .map(|s| s.to_string_lossy().replace(' ', "_"))
            .unwrap_or_else(|| name.to_string());
        let base = format!(
            "FILE_{}_{}",
            sanitize_filename(&stem),
            Local::now().format("%Y%m%d_%H%M%S")
        );
        let path = self.free_path(&base);
        let id = record::record_id(&path);

        let now = Utc::now();
        let mut header = Header::new();
        header.set("type", Kind::FileDrop.as_str());
        header.set("status", State::Intake.as_str());
        header.set("filename", name);
        header.set("source_path", source.display().to_string());
        header.set("size_bytes", size.to_string());
        header.set("detected", record::stamp(now));
        header.set("priority", "normal");
        header.set("created", record::stamp(now));

        let body = format!(
            "## File Drop Detected\n\n\
             **File:** `{name}`\n\
             **Size:** {size} bytes\n\
             **Dropped:** {}\n\n\
             ## Suggested Actions\n\
             - [ ] Review file contents\n\
             - [ ] Classify and route to appropriate workflow\n\
             - [ ] Archive or delete after processing\n",
            now.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
        );
        let path = self.vault.write(&path, &header, &body)?;

        tracing::info!(file = %name, record = %id, "Inbox drop announced");
        self.ledger.log(
            AuditEvent::new(CATEGORY, "file_detected")
                .record(id)
                .detail("kind", Kind::FileDrop.as_str())
                .detail("filename", name)
                .detail("size_bytes", size),
        );
        Ok(path)
    }

    /// `Needs_Action/<base>.md`, suffixed until no record in any state has the id.
    fn free_path(&self, base: &str) -> PathBuf {
        let intake = self.vault.layout().state_dir(State::Intake);
        let mut n = 1;
        loop {
            let id = if n == 1 {
                base.to_string()
            } else {
                format!("{base}_{n}")
            };
            let path = intake.join(format!("{id}.md"));
            if !path.exists() && self.vault.find(&id, &State::ALL).is_err() {
                return path;
            }
            n += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn scanner() -> (TempDir, InboxScanner) {
        let dir = TempDir::new().unwrap();
        let vault = Vault::open(dir.path()).unwrap();
        let ledger = Arc::new(AuditLedger::open(vault.layout().logs_dir()).unwrap());
        (dir, InboxScanner::new(vault, ledger))
    }

    #[test]
    fn test_drop_becomes_file_drop_record() {
        let (dir, scanner) = scanner();
        fs::write(dir.path().join("Inbox/Q3 report.pdf"), b"%PDF-1.4 data").unwrap();

        let created = scanner.scan().unwrap();
        assert_eq!(created.len(), 1);

        let record = scanner.vault.read(&created[0]).unwrap();
        assert!(record.id.starts_with("FILE_Q3_report_"));
        assert_eq!(record.kind(), Kind::FileDrop);
        assert_eq!(record.header.status(), Some(State::Intake));
        assert_eq!(record.get("filename"), Some("Q3 report.pdf"));
        assert_eq!(record.get("size_bytes"), Some("13"));
        assert_eq!(record.get("priority"), Some("normal"));
        assert!(record.get("source_path").unwrap().ends_with("Inbox/Q3 report.pdf"));
        assert!(record.body.contains("## File Drop Detected"));

        let actions: Vec<_> = scanner
            .ledger
            .for_record(&record.id)
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(actions, vec!["file_detected"]);
    }

    #[test]
    fn test_drop_announced_once_across_restarts() {
        let (dir, scanner) = scanner();
        fs::write(dir.path().join("Inbox/notes.txt"), "hello").unwrap();
        fs::write(dir.path().join("Inbox/.partial"), "x").unwrap();

        assert_eq!(scanner.scan().unwrap().len(), 1);
        assert!(scanner.scan().unwrap().is_empty());

        let restarted = InboxScanner::new(scanner.vault.clone(), Arc::clone(&scanner.ledger));
        assert!(restarted.scan().unwrap().is_empty());

        // Replaced content is a new drop under a fresh id.
        fs::write(dir.path().join("Inbox/notes.txt"), "hello, again").unwrap();
        let again = restarted.scan().unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(scanner.vault.records(State::Intake, crate::store::ListOrder::Lexical).unwrap().len(), 2);
    }

    #[test]
    fn test_free_path_skips_ids_in_use() {
        let (dir, scanner) = scanner();
        let header: Header = [("type", "file_drop"), ("status", "done")].into_iter().collect();
        scanner
            .vault
            .write(dir.path().join("Done/file_drop/FILE_a_1.md"), &header, "")
            .unwrap();

        let path = scanner.free_path("FILE_a_1");
        assert!(path.ends_with("Needs_Action/FILE_a_1_2.md"));
    }
}
