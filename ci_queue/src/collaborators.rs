//! Interfaces the queue needs from the rest of the CI platform.
//!
//! Implementations live with the wiring process; the queue only ever sees
//! these traits, so no project manager or build manager is reached through
//! global state.

use serde::{Deserialize, Serialize};

use crate::request::{BuildRequest, OwnerId};

/// Queue-relevant configuration of an owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerConfig {
    /// Maximum concurrently active builds, for policies that honour it.
    pub concurrency_limit: usize,
    /// Replaceable flag applied to requests that do not set one.
    pub replaceable_default: bool,
    /// Disabled owners have new requests rejected.
    pub enabled: bool,
}

impl Default for OwnerConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 1,
            replaceable_default: false,
            enabled: true,
        }
    }
}

/// Resolves owners to their current configuration.
pub trait OwnerDirectory: Send + Sync {
    /// `None` for owners the platform does not know about.
    fn owner_config(&self, owner: &OwnerId) -> Option<OwnerConfig>;
}

/// Handle to the persistent build record created on activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildResultHandle {
    pub build_id: i64,
    /// Per-owner build number.
    pub number: i64,
}

impl BuildResultHandle {
    pub fn new(build_id: i64, number: i64) -> Self {
        Self { build_id, number }
    }
}

/// Materializes build records for activated requests.
///
/// Called without any queue lock held. A result may be created for a request
/// that is then cancelled or superseded before activation commits; such
/// results are handed back through [`ResultSink::discard_build_result`].
pub trait ResultSink: Send + Sync {
    fn create_build_result(&self, request: &BuildRequest) -> anyhow::Result<BuildResultHandle>;

    fn discard_build_result(&self, _result: &BuildResultHandle) {}
}

/// Someone acting on the queue through an outer surface.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub id: Option<i64>,
    pub name: String,
}

impl Actor {
    pub fn new(id: Option<i64>, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    pub fn anonymous() -> Self {
        Self::new(None, "anonymous")
    }
}

/// Permission checks made by callers before they touch the queue.
///
/// The queue never consults this itself.
pub trait AccessControl: Send + Sync {
    fn can_cancel(&self, actor: &Actor, request: &BuildRequest) -> bool;

    fn can_cancel_all(&self, actor: &Actor) -> bool;

    /// Pause and resume.
    fn can_toggle_queue(&self, actor: &Actor) -> bool;

    fn can_view(&self, _actor: &Actor, _request: &BuildRequest) -> bool {
        true
    }
}
