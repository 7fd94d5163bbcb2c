//! Lifecycle states, record kinds and the vault directory layout.
//!
//! A record's state is encoded twice: in the `status` header and in the first
//! path component below the vault root. The directory is authoritative.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use vault_common::WorkZone;

// ============================================================================
// State
// ============================================================================

/// A named stage of a record's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Intake,
    Claimed,
    Drafted,
    PendingApproval,
    Approved,
    Rejected,
    Done,
}

impl State {
    pub const ALL: [State; 7] = [
        State::Intake,
        State::Claimed,
        State::Drafted,
        State::PendingApproval,
        State::Approved,
        State::Rejected,
        State::Done,
    ];

    /// Value written to the `status` header.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intake => "intake",
            Self::Claimed => "claimed",
            Self::Drafted => "drafted",
            Self::PendingApproval => "pending_approval",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Done => "done",
        }
    }

    /// Top-level vault directory holding records in this state.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Intake => "Needs_Action",
            Self::Claimed => "In_Progress",
            Self::Drafted => "Updates",
            Self::PendingApproval => "Pending_Approval",
            Self::Approved => "Approved",
            Self::Rejected => "Rejected",
            Self::Done => "Done",
        }
    }

    pub fn from_dir_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.dir_name() == name)
    }

    /// Whether the lifecycle graph allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: State) -> bool {
        use State::*;
        matches!(
            (self, next),
            (Intake, Claimed)
                | (Intake, Done)
                | (Claimed, Drafted)
                | (Drafted, PendingApproval)
                | (PendingApproval, Approved)
                | (PendingApproval, Rejected)
                | (Approved, Done)
                | (Rejected, Done)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for State {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "intake" | "pending" | "needs_action" => Ok(Self::Intake),
            "claimed" | "in_progress" => Ok(Self::Claimed),
            "drafted" => Ok(Self::Drafted),
            "pending_approval" => Ok(Self::PendingApproval),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "done" => Ok(Self::Done),
            other => Err(format!("unknown status '{other}'")),
        }
    }
}

// ============================================================================
// Kind
// ============================================================================

/// Record discriminator, read from the `type` header.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Kind {
    Email,
    SocialMedia,
    Payment,
    FileDrop,
    Briefing,
    Audit,
    Other(String),
}

impl Kind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Email => "email",
            Self::SocialMedia => "social_media",
            Self::Payment => "payment",
            Self::FileDrop => "file_drop",
            Self::Briefing => "briefing",
            Self::Audit => "audit",
            Self::Other(name) => name,
        }
    }

    /// Parse a `type` header value, accepting the aliases producers use.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "email" | "email_draft" => Self::Email,
            "social_media" | "social_post" | "social" => Self::SocialMedia,
            "payment" | "payments" | "invoice" => Self::Payment,
            "file_drop" => Self::FileDrop,
            "briefing" | "ceo_briefing" => Self::Briefing,
            "audit" | "weekly_audit" => Self::Audit,
            "" => Self::Other("unknown".into()),
            other => Self::Other(other.to_string()),
        }
    }

    /// Subdirectory used below the per-kind state directories.
    pub fn dir_name(&self) -> String {
        vault_common::util::sanitize_filename(self.as_str())
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Kind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

// ============================================================================
// Layout
// ============================================================================

/// Auxiliary directories created alongside the state directories.
pub const AUX_DIRS: &[&str] = &["Logs", "Plans", "Signals", "Signals/processed", "Inbox", ".state"];

/// Paths of the state directories below a vault root.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Top-level directory of a state.
    pub fn state_dir(&self, state: State) -> PathBuf {
        self.root.join(state.dir_name())
    }

    /// Directory a record of `kind` lands in when entering `state`.
    ///
    /// Claimed records go below their zone, review and terminal states below
    /// their kind, intake and drafted records stay flat.
    pub fn dest_dir(&self, state: State, kind: &Kind, zone: WorkZone) -> PathBuf {
        let base = self.state_dir(state);
        match state {
            State::Intake | State::Drafted => base,
            State::Claimed => base.join(zone.as_str()),
            State::PendingApproval | State::Approved | State::Rejected | State::Done => {
                base.join(kind.dir_name())
            }
        }
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("Logs")
    }

    /// Drop folder scanned for `file_drop` intake.
    pub fn inbox_dir(&self) -> PathBuf {
        self.root.join("Inbox")
    }

    pub fn state_file(&self, name: &str) -> PathBuf {
        self.root.join(".state").join(name)
    }

    /// State implied by a path's location, if it lies inside a state directory.
    pub fn state_of(&self, path: &Path) -> Option<State> {
        let relative = path.strip_prefix(&self.root).ok()?;
        match relative.components().next()? {
            Component::Normal(name) => State::from_dir_name(name.to_str()?),
            _ => None,
        }
    }

    /// Create every state and auxiliary directory.
    pub fn ensure(&self) -> std::io::Result<()> {
        for state in State::ALL {
            std::fs::create_dir_all(self.state_dir(state))?;
        }
        for zone in [WorkZone::Cloud, WorkZone::Local] {
            std::fs::create_dir_all(self.state_dir(State::Claimed).join(zone.as_str()))?;
        }
        for aux in AUX_DIRS {
            std::fs::create_dir_all(self.root.join(aux))?;
        }
        Ok(())
    }
}
