//! Git synchronisation of the vault between hosts.
//!
//! One pass pulls (rebasing, or merging with the remote side winning when the
//! rebase fails), stages the state directories, commits if anything changed
//! and pushes. Every git invocation runs through the `git` breaker.

use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use vault_common::config::SyncConfig;
use vault_common::{AuditEvent, AuditLedger, AuditStatus, Error, Result};
use walkdir::WalkDir;

use crate::record;
use crate::resilience::Resilience;

const CATEGORY: &str = "sync";
const DEPENDENCY: &str = "git";

/// Captured result of one git invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// What one pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub rebased: bool,
    pub merged_theirs: bool,
    pub committed: bool,
    pub pushed: bool,
}

#[derive(Debug, Clone)]
pub struct GitSync {
    root: PathBuf,
    config: SyncConfig,
    resilience: Arc<Resilience>,
    ledger: Arc<AuditLedger>,
}

impl GitSync {
    pub fn new(
        root: impl Into<PathBuf>,
        config: SyncConfig,
        resilience: Arc<Resilience>,
        ledger: Arc<AuditLedger>,
    ) -> Self {
        Self {
            root: root.into(),
            config,
            resilience,
            ledger,
        }
    }

    /// Run git with `args` in the vault root. A non-zero exit is not an error here.
    async fn git(&self, args: &[&str]) -> Result<GitOutput> {
        tracing::debug!(args = ?args, "git");
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::fatal(DEPENDENCY, format!("cannot run git: {e}")))?;

        Ok(GitOutput {
            success: output.status.success(),
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Run git through the resilience layer; a non-zero exit is retried.
    async fn checked(&self, args: &[&str]) -> Result<GitOutput> {
        self.resilience
            .call(DEPENDENCY, || async move {
                let output = self.git(args).await?;
                if output.success {
                    Ok(output)
                } else {
                    Err(Error::retryable(
                        DEPENDENCY,
                        format!("git {} exited {}: {}", args.join(" "), output.code, output.stderr),
                    ))
                }
            })
            .await
    }

    /// Run git through the resilience layer, returning the exit outcome as-is.
    async fn status(&self, args: &[&str]) -> Result<GitOutput> {
        self.resilience
            .call(DEPENDENCY, || self.git(args))
            .await
    }

    /// Configured sync directories that hold files now or held them at the
    /// last commit. The second set carries deletions out of emptied dirs.
    async fn stageable_paths(&self) -> Result<Vec<String>> {
        let mut paths = Vec::new();
        for path in &self.config.paths {
            if has_files(&self.root.join(path.as_str())) || self.is_tracked(path).await? {
                paths.push(path.clone());
            }
        }
        Ok(paths)
    }

    async fn is_tracked(&self, path: &str) -> Result<bool> {
        let output = self.status(&["ls-files", "--", path]).await?;
        Ok(output.success && !output.stdout.is_empty())
    }

    /// One full pass.
    pub async fn run_once(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let remote = self.config.remote.as_str();
        let branch = self.config.branch.as_str();

        let pull = self
            .status(&["pull", "--rebase", "--autostash", remote, branch])
            .await?;
        if pull.success {
            report.rebased = true;
        } else {
            tracing::warn!(stderr = %pull.stderr, "Rebase pull failed, accepting remote changes");
            // Nothing to abort when the rebase never started.
            let _ = self.status(&["rebase", "--abort"]).await?;
            self.checked(&["pull", "--no-rebase", "--autostash", "-X", "theirs", remote, branch])
                .await?;
            report.merged_theirs = true;
        }

        let paths = self.stageable_paths().await?;
        if !paths.is_empty() {
            let mut args = vec!["add", "-A", "--"];
            args.extend(paths.iter().map(String::as_str));
            self.checked(&args).await?;
        }

        let staged = self.status(&["diff", "--cached", "--quiet"]).await?;
        if !staged.success {
            let message = format!("vault sync: {}", record::stamp(Utc::now()));
            self.checked(&["commit", "-m", &message]).await?;
            report.committed = true;
        }

        let head = format!("HEAD:{branch}");
        self.checked(&["push", remote, &head]).await?;
        report.pushed = true;

        Ok(report)
    }

    /// Run a pass and audit the outcome.
    pub async fn pass(&self) -> Result<SyncReport> {
        match self.run_once().await {
            Ok(report) => {
                tracing::info!(
                    committed = report.committed,
                    merged_theirs = report.merged_theirs,
                    "Sync pass complete"
                );
                self.ledger.log(
                    AuditEvent::new(CATEGORY, "sync_completed")
                        .detail("committed", report.committed)
                        .detail("merged_theirs", report.merged_theirs)
                        .detail("pushed", report.pushed),
                );
                Ok(report)
            }
            Err(e) => {
                tracing::error!(error = %e, "Sync pass failed");
                self.ledger.log(
                    AuditEvent::new(CATEGORY, "sync_failed")
                        .status(AuditStatus::Failure)
                        .error(&e),
                );
                Err(e)
            }
        }
    }

    /// Pass on an interval until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.interval_secs.max(1));
        tracing::info!(interval_secs = interval.as_secs(), remote = %self.config.remote, "Sync loop started");
        loop {
            // Failures are audited; the next pass retries.
            let _ = self.pass().await;

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if *shutdown.borrow() {
                break;
            }
        }
        tracing::info!("Sync loop shutting down");
    }
}

fn has_files(dir: &Path) -> bool {
    dir.is_dir()
        && WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .any(|e| e.file_type().is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Header;
    use crate::resilience::RetryPolicy;
    use crate::store::Vault;
    use std::process::Command as StdCommand;
    use tempfile::TempDir;

    fn git_available() -> bool {
        StdCommand::new("git").arg("--version").output().is_ok()
    }

    fn sh_git(dir: &Path, args: &[&str]) {
        let status = StdCommand::new("git").args(args).current_dir(dir).status().unwrap();
        assert!(status.success(), "git {args:?} failed");
    }

    fn identity(dir: &Path) {
        sh_git(dir, &["config", "user.name", "Vault Test"]);
        sh_git(dir, &["config", "user.email", "vault@example.com"]);
        sh_git(dir, &["config", "commit.gpgsign", "false"]);
    }

    fn quick_resilience() -> Arc<Resilience> {
        Arc::new(Resilience::new(
            RetryPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            5,
            Duration::from_secs(60),
            Duration::from_secs(30),
        ))
    }

    fn syncer(root: &Path, remote: &Path) -> GitSync {
        let vault = Vault::open(root).unwrap();
        let ledger = Arc::new(AuditLedger::open(vault.layout().logs_dir()).unwrap());
        let config = SyncConfig {
            enabled: true,
            remote: remote.display().to_string(),
            ..SyncConfig::default()
        };
        GitSync::new(root, config, quick_resilience(), ledger)
    }

    #[tokio::test]
    async fn test_stageable_paths_skip_empty_untracked_dirs() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        sh_git(dir.path(), &["init", "-q"]);
        identity(dir.path());
        let sync = syncer(dir.path(), dir.path());
        assert!(sync.stageable_paths().await.unwrap().is_empty());

        std::fs::write(dir.path().join("Needs_Action/A.md"), "x").unwrap();
        assert_eq!(sync.stageable_paths().await.unwrap(), vec!["Needs_Action".to_string()]);

        // Emptied but tracked: still staged so the deletion is committed.
        sh_git(dir.path(), &["add", "Needs_Action/A.md"]);
        sh_git(dir.path(), &["commit", "-q", "-m", "add"]);
        std::fs::remove_file(dir.path().join("Needs_Action/A.md")).unwrap();
        assert_eq!(sync.stageable_paths().await.unwrap(), vec!["Needs_Action".to_string()]);
    }

    #[tokio::test]
    async fn test_pass_shares_records_between_hosts() {
        if !git_available() {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let remote = tmp.path().join("remote.git");
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        std::fs::create_dir_all(&remote).unwrap();
        std::fs::create_dir_all(&a).unwrap();

        sh_git(&remote, &["init", "--bare", "-q"]);
        sh_git(&a, &["init", "-q"]);
        identity(&a);
        sh_git(&a, &["checkout", "-q", "-b", "main"]);
        std::fs::write(a.join("README.md"), "vault\n").unwrap();
        sh_git(&a, &["add", "README.md"]);
        sh_git(&a, &["commit", "-q", "-m", "init"]);
        sh_git(&a, &["push", "-q", remote.to_str().unwrap(), "main"]);
        sh_git(tmp.path(), &["clone", "-q", "-b", "main", remote.to_str().unwrap(), "b"]);
        identity(&b);

        let sync_a = syncer(&a, &remote);
        let vault_a = Vault::open(&a).unwrap();
        let header: Header = [("type", "email"), ("status", "intake")].into_iter().collect();
        vault_a.write("Needs_Action/EMAIL_1.md", &header, "hello").unwrap();

        let report = sync_a.pass().await.unwrap();
        assert!(report.committed);
        assert!(report.pushed);

        let again = sync_a.pass().await.unwrap();
        assert!(!again.committed);

        let sync_b = syncer(&b, &remote);
        sync_b.pass().await.unwrap();
        assert!(b.join("Needs_Action/EMAIL_1.md").exists());

        // A claims the only intake record; B must see it leave intake.
        std::fs::create_dir_all(a.join("In_Progress/local")).unwrap();
        std::fs::rename(a.join("Needs_Action/EMAIL_1.md"), a.join("In_Progress/local/EMAIL_1.md")).unwrap();
        assert!(sync_a.pass().await.unwrap().committed);
        sync_b.pass().await.unwrap();
        assert!(!b.join("Needs_Action/EMAIL_1.md").exists());
        assert!(b.join("In_Progress/local/EMAIL_1.md").exists());

        let log = StdCommand::new("git")
            .args(["log", "-1", "--format=%s"])
            .current_dir(&a)
            .output()
            .unwrap();
        assert!(String::from_utf8_lossy(&log.stdout).starts_with("vault sync: "));
    }
}
