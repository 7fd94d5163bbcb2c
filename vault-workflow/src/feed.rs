//! Polling change feed and subscriber fan-out.
//!
//! A background loop inventories the watched directories on an interval,
//! diffs against the previous inventory and pushes one event per changed file
//! to every subscriber. Each subscriber has its own bounded queue; a slow one
//! loses events, a gone one is pruned, and neither ever blocks the loop.
//! A file created and modified within one interval shows up as `created`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use walkdir::WalkDir;

/// Watched top-level directories and the event type each one owns.
pub const WATCHED_DIRS: &[(&str, &str)] = &[
    ("Pending_Approval", "approval_added"),
    ("Needs_Action", "task_added"),
    ("Approved", "approval_approved"),
    ("Rejected", "approval_rejected"),
    ("Done", "task_done"),
];

/// What happened to a file between two inventories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Created,
    Modified,
    Removed,
}

/// Message pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedEvent {
    pub event_type: String,
    pub file_name: String,
    pub relative_path: String,
    pub action: ChangeAction,
    pub timestamp: DateTime<Utc>,
}

/// Inventory keyed by vault-relative path.
pub type Snapshot = BTreeMap<PathBuf, SystemTime>;

// ============================================================================
// Change detection
// ============================================================================

/// Snapshot-diffing watcher over a vault root.
#[derive(Debug, Clone)]
pub struct ChangeFeed {
    root: PathBuf,
    interval: Duration,
}

impl ChangeFeed {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            interval: Duration::from_secs(2),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Current inventory of `*.md` files below the watched directories.
    pub fn snapshot(&self) -> Snapshot {
        let mut snapshot = Snapshot::new();
        for (dir, _) in WATCHED_DIRS {
            let base = self.root.join(dir);
            if !base.is_dir() {
                continue;
            }
            for entry in WalkDir::new(&base).into_iter().filter_map(|e| e.ok()) {
                let path = entry.path();
                if !entry.file_type().is_file() || !is_watched_file(path) {
                    continue;
                }
                // Files can vanish between the walk and the stat.
                let Some(modified) = entry.metadata().ok().and_then(|m| m.modified().ok()) else {
                    continue;
                };
                if let Ok(relative) = path.strip_prefix(&self.root) {
                    snapshot.insert(relative.to_path_buf(), modified);
                }
            }
        }
        snapshot
    }

    /// Events turning `previous` into `current`: creations and modifications
    /// in path order, then removals in path order.
    pub fn diff(&self, previous: &Snapshot, current: &Snapshot) -> Vec<FeedEvent> {
        let now = Utc::now();
        let mut events = Vec::new();

        for (path, modified) in current {
            let action = match previous.get(path) {
                None => ChangeAction::Created,
                Some(before) if before != modified => ChangeAction::Modified,
                Some(_) => continue,
            };
            if let Some(event) = make_event(path, action, now) {
                events.push(event);
            }
        }
        for path in previous.keys().filter(|p| !current.contains_key(*p)) {
            if let Some(event) = make_event(path, ChangeAction::Removed, now) {
                events.push(event);
            }
        }

        events
    }

    /// Poll until `shutdown` flips to true. The first inventory is a baseline.
    pub async fn run(self, broadcaster: std::sync::Arc<Broadcaster>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            root = %self.root.display(),
            interval_ms = self.interval.as_millis() as u64,
            "Change feed started"
        );
        let mut previous = self.snapshot();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let current = self.snapshot();
            for event in self.diff(&previous, &current) {
                tracing::debug!(
                    event_type = %event.event_type,
                    path = %event.relative_path,
                    action = ?event.action,
                    "Feed event"
                );
                broadcaster.broadcast(&event);
            }
            previous = current;
        }

        tracing::info!("Change feed stopped");
    }
}

fn is_watched_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .map_or(true, |n| n.starts_with('.'));
    !hidden && path.extension().and_then(|e| e.to_str()) == Some("md")
}

fn make_event(relative: &Path, action: ChangeAction, timestamp: DateTime<Utc>) -> Option<FeedEvent> {
    let top = relative.components().next()?.as_os_str().to_str()?;
    let (_, event_type) = WATCHED_DIRS.iter().find(|(dir, _)| *dir == top)?;
    Some(FeedEvent {
        event_type: (*event_type).to_string(),
        file_name: relative.file_name()?.to_string_lossy().to_string(),
        relative_path: relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
        action,
        timestamp,
    })
}

// ============================================================================
// Broadcaster
// ============================================================================

struct Subscriber {
    id: u64,
    sender: mpsc::Sender<FeedEvent>,
}

/// A registered receiver. Dropping it unsubscribes on the next broadcast.
pub struct Subscription {
    pub id: u64,
    pub receiver: mpsc::Receiver<FeedEvent>,
}

/// Fan-out to subscribers over bounded per-subscriber queues.
pub struct Broadcaster {
    capacity: usize,
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(64)
    }
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.capacity);
        self.lock().push(Subscriber { id, sender });
        tracing::debug!(subscriber = id, "Feed subscriber added");
        Subscription { id, receiver }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.lock().retain(|s| s.id != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Offer `event` to every subscriber without waiting. Returns how many
    /// queues accepted it.
    pub fn broadcast(&self, event: &FeedEvent) -> usize {
        let mut delivered = 0;
        self.lock().retain(|subscriber| {
            match subscriber.sender.try_send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(subscriber = subscriber.id, "Feed subscriber queue full, dropping event");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(subscriber = subscriber.id, "Pruning disconnected feed subscriber");
                    false
                }
            }
        });
        delivered
    }
}
