//! Activation policies — may a queued request start now?

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::collaborators::OwnerDirectory;
use crate::entity::ActiveBuild;
use crate::request::{BuildRequest, OwnerId};

/// Pure decision consulted before each activation. Implementations must not
/// mutate anything.
pub trait ActivationPolicy: Send + Sync {
    fn can_activate(&self, owner: &OwnerId, active: &[ActiveBuild], candidate: &BuildRequest)
        -> bool;
}

/// At most one active build per owner.
#[derive(Debug, Clone, Copy, Default)]
pub struct OnePerOwner;

impl ActivationPolicy for OnePerOwner {
    fn can_activate(&self, _owner: &OwnerId, active: &[ActiveBuild], _candidate: &BuildRequest) -> bool {
        active.is_empty()
    }
}

/// Up to the owner's configured concurrency limit.
///
/// Unknown owners, and limits of zero, are treated as a limit of one.
pub struct OwnerConcurrencyLimit {
    owners: Arc<dyn OwnerDirectory>,
}

impl OwnerConcurrencyLimit {
    pub fn new(owners: Arc<dyn OwnerDirectory>) -> Self {
        Self { owners }
    }

    fn limit(&self, owner: &OwnerId) -> usize {
        self.owners
            .owner_config(owner)
            .map(|config| config.concurrency_limit)
            .unwrap_or(1)
            .max(1)
    }
}

impl fmt::Debug for OwnerConcurrencyLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnerConcurrencyLimit").finish_non_exhaustive()
    }
}

impl ActivationPolicy for OwnerConcurrencyLimit {
    fn can_activate(&self, owner: &OwnerId, active: &[ActiveBuild], _candidate: &BuildRequest) -> bool {
        active.len() < self.limit(owner)
    }
}

/// Policy selection made in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    #[default]
    OnePerOwner,
    OwnerLimit,
}

impl PolicyKind {
    pub fn build(self, owners: Arc<dyn OwnerDirectory>) -> Arc<dyn ActivationPolicy> {
        match self {
            PolicyKind::OnePerOwner => Arc::new(OnePerOwner),
            PolicyKind::OwnerLimit => Arc::new(OwnerConcurrencyLimit::new(owners)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PolicyKind::OnePerOwner => "one_per_owner",
            PolicyKind::OwnerLimit => "owner_limit",
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "one_per_owner" | "single" => Ok(PolicyKind::OnePerOwner),
            "owner_limit" | "limit" => Ok(PolicyKind::OwnerLimit),
            other => Err(format!("unknown activation policy '{other}'")),
        }
    }
}
