//! Core data model.
//!
//! A work item is one "artifact observed" event recorded by a sensor. The
//! pipeline claims it, resolves the artifact on disk, identifies its content
//! and either forwards it to the analysis engine or retires it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event type written by sensors for an artifact dropped on a monitored host.
/// Items carrying any other event type are invisible to the pipeline.
pub const ARTIFACT_OBSERVED: &str = "file_upload";

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A backlog record describing one observed artifact and its processing state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Backlog-assigned identifier. Monotonic, so ordering by id is FIFO-ish.
    pub id: WorkId,

    pub event_type: String,

    /// Sensor metadata. Only used to help resolve the artifact on disk.
    pub source_ip: String,
    pub filename_hint: Option<String>,
    pub stored_name_hint: Option<String>,
    pub logged_hash: Option<String>,

    /// Current lifecycle state.
    pub status: Status,

    /// Lease expiry. Only meaningful while `status == Claimed`.
    pub lease_until: Option<DateTime<Utc>>,

    /// Worker holding the lease. Only meaningful while `status == Claimed`.
    pub claimed_by: Option<String>,

    /// Number of times this item has been claimed.
    pub attempts: u32,

    /// A pending item is not claimable before this instant (retry backoff).
    pub retry_after: Option<DateTime<Utc>>,

    /// SHA-256 of the resolved artifact. Never changes once set.
    pub content_hash: Option<String>,

    pub task_ref: Option<TaskRef>,
    pub engine_response: Option<String>,

    /// Hash this item duplicated, when it was retired as a duplicate.
    pub duplicate_of: Option<String>,

    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    /// Name the artifact is submitted under.
    pub fn display_name(&self) -> &str {
        self.filename_hint
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("upload.bin")
    }

    /// True while a live lease is held at `now`.
    pub fn is_leased_at(&self, now: DateTime<Utc>) -> bool {
        self.status == Status::Claimed && self.lease_until.is_some_and(|t| t >= now)
    }
}

/// Newtype for work item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkId(pub i64);

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task identifier assigned by the analysis engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskRef(pub i64);

impl std::fmt::Display for TaskRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle state of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Waiting for a worker (new, or returned for retry).
    Pending,
    /// Exclusively owned by one worker until `lease_until`.
    Claimed,
    /// Submitted to the analysis engine. Terminal.
    Forwarded,
    /// Artifact missing, duplicate content, or retries exhausted. Terminal.
    Dead,
}

impl Status {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Pending, Claimed)
                | (Claimed, Claimed)    // stale lease taken over
                | (Claimed, Forwarded)
                | (Claimed, Dead)
                | (Claimed, Pending) // retry
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Forwarded | Status::Dead)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Claimed => "claimed",
            Status::Forwarded => "forwarded",
            Status::Dead => "dead",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Status::Pending),
            "claimed" => Ok(Status::Claimed),
            "forwarded" => Ok(Status::Forwarded),
            "dead" => Ok(Status::Dead),
            _ => Err(crate::error::Error::Other(format!("unknown status: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// What happened to a claimed item. Written back by the outcome recorder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Accepted by the analysis engine.
    Forwarded {
        task_ref: Option<TaskRef>,
        raw_response: String,
        content_hash: Option<String>,
    },
    /// Will never be forwarded.
    Dead {
        reason: String,
        duplicate_of: Option<String>,
    },
    /// Transient failure; the item goes back to pending.
    Retry { reason: String },
}

impl Outcome {
    /// Status the item ends in after this outcome is recorded.
    pub fn target_status(&self) -> Status {
        match self {
            Outcome::Forwarded { .. } => Status::Forwarded,
            Outcome::Dead { .. } => Status::Dead,
            Outcome::Retry { .. } => Status::Pending,
        }
    }

    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Forwarded { .. } => "forwarded",
            Outcome::Dead {
                duplicate_of: Some(_),
                ..
            } => "duplicate",
            Outcome::Dead { .. } => "dead",
            Outcome::Retry { .. } => "retry",
        }
    }
}

// ---------------------------------------------------------------------------
// Results store
// ---------------------------------------------------------------------------

/// A prior analysis recorded by the engine side. Read-only for the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub content_hash: String,
    pub task_ref: Option<TaskRef>,
    pub reported_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for a new artifact-observed event, as a sensor would record it.
#[derive(Debug, Clone)]
pub struct NewWorkItem {
    pub(crate) event_type: String,
    pub(crate) source_ip: String,
    pub(crate) filename_hint: Option<String>,
    pub(crate) stored_name_hint: Option<String>,
    pub(crate) logged_hash: Option<String>,
}

impl NewWorkItem {
    pub fn new(source_ip: impl AsRef<str>) -> Self {
        Self {
            event_type: ARTIFACT_OBSERVED.to_string(),
            source_ip: normalize_ip(source_ip.as_ref()),
            filename_hint: None,
            stored_name_hint: None,
            logged_hash: None,
        }
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = event_type.into();
        self
    }

    pub fn filename(mut self, name: impl Into<String>) -> Self {
        self.filename_hint = Some(name.into());
        self
    }

    pub fn stored_name(mut self, name: impl Into<String>) -> Self {
        self.stored_name_hint = Some(name.into());
        self
    }

    pub fn logged_hash(mut self, hash: impl AsRef<str>) -> Self {
        self.logged_hash = Some(hash.as_ref().trim().to_ascii_lowercase());
        self
    }
}

/// Strip the IPv4-mapped IPv6 prefix sensors tend to log.
pub fn normalize_ip(ip: &str) -> String {
    let ip = ip.trim();
    if ip.is_empty() {
        return "unknown".to_string();
    }
    ip.rsplit("::ffff:").next().unwrap_or(ip).to_string()
}
