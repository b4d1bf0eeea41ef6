//! Per-owner build queue.
//!
//! Each owner gets one `EntityBuildQueue` holding its queued requests in
//! arrival order and its currently active builds. All mutation happens under
//! the queue's own lock, so a busy owner never holds up another owner.
//!
//! Activation is strict FIFO: when the head request cannot start, nothing
//! behind it is considered. Reordering builds of one owner would confuse
//! change isolation between consecutive builds.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::collaborators::{BuildResultHandle, ResultSink};
use crate::error::{QueueError, Result};
use crate::policy::ActivationPolicy;
use crate::registry::{RequestRegistry, RequestStatus};
use crate::request::{BuildRequest, OwnerId, RequestId};

/// A request that has been handed over for execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveBuild {
    pub request: Arc<BuildRequest>,
    pub result: BuildResultHandle,
    pub activated_at: DateTime<Utc>,
}

impl ActiveBuild {
    pub fn id(&self) -> RequestId {
        self.request.id
    }
}

/// Result of adding a request to an owner's queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupersedeOutcome {
    pub queued: RequestId,
    /// The previously queued request discarded in favour of the new one.
    pub assimilated: Option<Arc<BuildRequest>>,
}

/// What a single activation attempt did to an owner's queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationAttempt {
    Activated(ActiveBuild),
    /// Nothing queued, or the policy holds the head back.
    Blocked,
    /// The head could not get a build result and was rejected. The next
    /// request is now at the head.
    HeadRejected(RequestId),
    /// The queue changed while the build result was being created.
    Retry,
}

impl ActivationAttempt {
    pub fn activated(self) -> Option<ActiveBuild> {
        match self {
            ActivationAttempt::Activated(build) => Some(build),
            _ => None,
        }
    }
}

/// Result of cancelling a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The request was queued or active and has been removed.
    Removed,
    /// The build had already completed; the request moved from ACTIVATED to
    /// CANCELLED anyway.
    LateCancelled,
    /// Unknown, owned elsewhere, already terminal, or a late cancel ignored
    /// under first-wins.
    Unchanged,
}

impl CancelOutcome {
    /// True when the request's status is now CANCELLED because of this call.
    pub fn is_cancelled(self) -> bool {
        self != CancelOutcome::Unchanged
    }
}

/// Tie-break between a cancel and a completion of the same active build.
///
/// A completion that arrives after a cancel is always a no-op, since the
/// cancel already removed the build. The variants differ for a cancel that
/// arrives after the completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RaceResolution {
    /// The late cancel still moves the request from ACTIVATED to CANCELLED.
    #[default]
    CancelWins,
    /// The late cancel is ignored and the request stays ACTIVATED.
    FirstWins,
}

impl fmt::Display for RaceResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaceResolution::CancelWins => f.write_str("cancel_wins"),
            RaceResolution::FirstWins => f.write_str("first_wins"),
        }
    }
}

impl FromStr for RaceResolution {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cancel_wins" => Ok(RaceResolution::CancelWins),
            "first_wins" => Ok(RaceResolution::FirstWins),
            other => Err(format!("unknown race resolution '{other}'")),
        }
    }
}

#[derive(Debug, Default)]
struct EntityState {
    queued: VecDeque<Arc<BuildRequest>>,
    active: Vec<ActiveBuild>,
}

impl EntityState {
    fn queued_position(&self, id: RequestId) -> Option<usize> {
        self.queued.iter().position(|request| request.id == id)
    }

    fn active_position(&self, id: RequestId) -> Option<usize> {
        self.active.iter().position(|build| build.id() == id)
    }

    fn head_is(&self, id: RequestId) -> bool {
        self.queued.front().is_some_and(|head| head.id == id)
    }
}

#[derive(Debug)]
pub struct EntityBuildQueue {
    owner: OwnerId,
    registry: Arc<RequestRegistry>,
    race: RaceResolution,
    state: Mutex<EntityState>,
}

impl EntityBuildQueue {
    pub fn new(owner: OwnerId, registry: Arc<RequestRegistry>) -> Self {
        Self {
            owner,
            registry,
            race: RaceResolution::default(),
            state: Mutex::new(EntityState::default()),
        }
    }

    pub fn with_race_resolution(mut self, race: RaceResolution) -> Self {
        self.race = race;
        self
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    /// Append a registered request, assimilating any replaceable request from
    /// the same source that is still waiting.
    pub fn add_request(&self, request: Arc<BuildRequest>) -> Result<SupersedeOutcome> {
        if request.owner != self.owner {
            return Err(QueueError::OwnerMismatch {
                id: request.id,
                expected: self.owner.clone(),
                actual: request.owner.clone(),
            });
        }

        let mut state = self.lock();

        let status = self.registry.status(request.id)?;
        if status != RequestStatus::Queued || state.queued_position(request.id).is_some() {
            return Err(QueueError::IllegalTransition {
                id: request.id,
                from: status,
                to: RequestStatus::Queued,
            });
        }

        let assimilated = match state.queued.iter().position(|queued| request.supersedes(queued)) {
            Some(pos) => {
                let old_id = state.queued[pos].id;
                self.registry.mark_assimilated(old_id, request.id)?;
                state.queued.remove(pos)
            }
            None => None,
        };

        state.queued.push_back(Arc::clone(&request));

        match &assimilated {
            Some(old) => tracing::info!(
                request_id = %request.id,
                assimilated = %old.id,
                owner = %self.owner,
                source = %request.source,
                "Build request queued, superseding earlier request"
            ),
            None => tracing::info!(
                request_id = %request.id,
                owner = %self.owner,
                source = %request.source,
                position = state.queued.len(),
                "Build request queued"
            ),
        }

        Ok(SupersedeOutcome {
            queued: request.id,
            assimilated,
        })
    }

    pub fn queued_snapshot(&self) -> Vec<Arc<BuildRequest>> {
        self.lock().queued.iter().cloned().collect()
    }

    pub fn active_snapshot(&self) -> Vec<ActiveBuild> {
        self.lock().active.clone()
    }

    pub fn queued_len(&self) -> usize {
        self.lock().queued.len()
    }

    pub fn active_len(&self) -> usize {
        self.lock().active.len()
    }

    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.queued.is_empty() && state.active.is_empty()
    }

    /// Try to start the request at the head of the queue.
    ///
    /// The build result is created with the lock released. The activation
    /// only commits if the candidate is still at the head afterwards and the
    /// policy still allows it; otherwise the result is discarded and the
    /// request stays where it is.
    pub fn try_activate_next(
        &self,
        policy: &dyn ActivationPolicy,
        results: &dyn ResultSink,
    ) -> Result<ActivationAttempt> {
        let candidate = {
            let state = self.lock();
            let Some(head) = state.queued.front() else {
                return Ok(ActivationAttempt::Blocked);
            };
            if !policy.can_activate(&self.owner, &state.active, head) {
                return Ok(ActivationAttempt::Blocked);
            }
            Arc::clone(head)
        };

        let result = match results.create_build_result(&candidate) {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(
                    request_id = %candidate.id,
                    owner = %self.owner,
                    "Failed to create build result, rejecting request: {err:#}"
                );
                let mut state = self.lock();
                let Some(pos) = state.queued_position(candidate.id) else {
                    // Cancelled or superseded meanwhile.
                    return Ok(ActivationAttempt::Retry);
                };
                self.registry
                    .update_status(candidate.id, RequestStatus::Rejected)?;
                state.queued.remove(pos);
                return Ok(ActivationAttempt::HeadRejected(candidate.id));
            }
        };

        let mut state = self.lock();
        if !state.head_is(candidate.id) || !policy.can_activate(&self.owner, &state.active, &candidate) {
            drop(state);
            tracing::debug!(
                request_id = %candidate.id,
                owner = %self.owner,
                build_id = result.build_id,
                "Queue changed while creating build result, discarding it"
            );
            results.discard_build_result(&result);
            return Ok(ActivationAttempt::Retry);
        }

        self.registry.mark_activated(candidate.id, result)?;
        state.queued.pop_front();

        let build = ActiveBuild {
            request: candidate,
            result,
            activated_at: Utc::now(),
        };
        state.active.push(build.clone());

        tracing::info!(
            request_id = %build.id(),
            owner = %self.owner,
            build_id = result.build_id,
            number = result.number,
            revision = %build.request.revision,
            "Build request activated"
        );
        Ok(ActivationAttempt::Activated(build))
    }

    /// Drop a finished build from the active set.
    ///
    /// Leaves the registry alone; post-activation status belongs to the
    /// execution side. Returns false if the build was not active (already
    /// completed or cancelled).
    pub fn complete_active(&self, id: RequestId) -> bool {
        let mut state = self.lock();
        match state.active_position(id) {
            Some(pos) => {
                let build = state.active.remove(pos);
                tracing::info!(
                    request_id = %id,
                    owner = %self.owner,
                    build_id = build.result.build_id,
                    "Active build completed"
                );
                true
            }
            None => {
                tracing::debug!(request_id = %id, owner = %self.owner, "Completion for build that is not active");
                false
            }
        }
    }

    /// Cancel a queued or active request.
    ///
    /// Stopping a running build is signalled to the agents separately.
    pub fn cancel(&self, id: RequestId) -> Result<CancelOutcome> {
        let mut state = self.lock();

        if let Some(pos) = state.queued_position(id) {
            self.registry.update_status(id, RequestStatus::Cancelled)?;
            state.queued.remove(pos);
            tracing::info!(request_id = %id, owner = %self.owner, "Queued build request cancelled");
            return Ok(CancelOutcome::Removed);
        }

        if let Some(pos) = state.active_position(id) {
            self.registry.update_status(id, RequestStatus::Cancelled)?;
            state.active.remove(pos);
            tracing::info!(request_id = %id, owner = %self.owner, "Active build cancelled");
            return Ok(CancelOutcome::Removed);
        }

        // Not here any more: either unknown, already terminal, or activated
        // and since completed.
        if self.race == RaceResolution::CancelWins
            && self.registry.owner_of(id).as_ref() == Some(&self.owner)
            && self.registry.status(id) == Ok(RequestStatus::Activated)
        {
            self.registry.update_status(id, RequestStatus::Cancelled)?;
            tracing::info!(request_id = %id, owner = %self.owner, "Cancel arrived after completion, marking cancelled");
            return Ok(CancelOutcome::LateCancelled);
        }
        Ok(CancelOutcome::Unchanged)
    }

    /// Cancel everything queued and active for this owner.
    pub fn cancel_all(&self) -> Result<Vec<RequestId>> {
        let mut state = self.lock();
        let mut cancelled = Vec::with_capacity(state.queued.len() + state.active.len());

        while let Some(request) = state.queued.pop_front() {
            self.registry.update_status(request.id, RequestStatus::Cancelled)?;
            cancelled.push(request.id);
        }
        for build in state.active.drain(..) {
            self.registry.update_status(build.id(), RequestStatus::Cancelled)?;
            cancelled.push(build.id());
        }

        if !cancelled.is_empty() {
            tracing::info!(owner = %self.owner, count = cancelled.len(), "Cancelled all builds for owner");
        }
        Ok(cancelled)
    }

    fn lock(&self) -> MutexGuard<'_, EntityState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
