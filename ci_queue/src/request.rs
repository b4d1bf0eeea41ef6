//! Build requests — the unit of work accepted by the queue.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a build request. Allocated once, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The schedulable entity a request belongs to.
///
/// Project builds are owned by the project; personal builds are owned by the
/// user who submitted them, so one user's personal builds queue separately
/// from the project's regular builds.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerId {
    Project(i64),
    User(i64),
}

impl OwnerId {
    pub fn is_personal(&self) -> bool {
        matches!(self, OwnerId::User(_))
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnerId::Project(id) => write!(f, "project:{id}"),
            OwnerId::User(id) => write!(f, "user:{id}"),
        }
    }
}

/// Which revision a build should run against.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Revision {
    /// A specific revision chosen by the trigger.
    Fixed(String),
    /// Resolved to the latest revision when the build is activated.
    #[default]
    Floating,
}

impl Revision {
    pub fn is_floating(&self) -> bool {
        matches!(self, Revision::Floating)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Revision::Fixed(rev) => f.write_str(rev),
            Revision::Floating => f.write_str("[floating]"),
        }
    }
}

/// A request to build an owner, raised by some trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub id: RequestId,
    pub owner: OwnerId,
    /// Tag naming the trigger path that raised the request; matched when
    /// deciding whether a newer request supersedes a queued one.
    pub source: String,
    pub revision: Revision,
    /// `None` defers to the owner's configured default at enqueue time.
    pub replaceable: Option<bool>,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl BuildRequest {
    pub fn new(id: RequestId, owner: OwnerId, source: impl Into<String>) -> Self {
        Self {
            id,
            owner,
            source: source.into(),
            revision: Revision::Floating,
            replaceable: None,
            reason: String::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_revision(mut self, revision: Revision) -> Self {
        self.revision = revision;
        self
    }

    pub fn with_replaceable(mut self, replaceable: bool) -> Self {
        self.replaceable = Some(replaceable);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn is_replaceable(&self) -> bool {
        self.replaceable.unwrap_or(false)
    }

    pub fn is_personal(&self) -> bool {
        self.owner.is_personal()
    }

    /// Whether this request, arriving later, may discard `queued`.
    ///
    /// Only the queued request's flag matters: a forced build is never
    /// silently dropped, whatever the newcomer says.
    pub fn supersedes(&self, queued: &BuildRequest) -> bool {
        queued.is_replaceable() && queued.owner == self.owner && queued.source == self.source
    }
}
