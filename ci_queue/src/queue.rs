//! Top-level build queue.
//!
//! Routes requests to per-owner queues, runs activation passes across all
//! owners under the global concurrency cap, and handles pause/resume and the
//! emergency cancel-all.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::collaborators::{OwnerDirectory, ResultSink};
use crate::entity::{ActivationAttempt, ActiveBuild, CancelOutcome, EntityBuildQueue, RaceResolution};
use crate::error::Result;
use crate::policy::ActivationPolicy;
use crate::registry::{RequestRecord, RequestRegistry, RequestStatus};
use crate::request::{BuildRequest, OwnerId, RequestId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Server-wide cap on active builds. `None` means no cap.
    pub max_active: Option<usize>,
    pub start_paused: bool,
    pub race_resolution: RaceResolution,
}

/// Why a request failed admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    UnknownOwner,
    OwnerDisabled,
    /// No build result could be created at activation time.
    ResultUnavailable,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::UnknownOwner => f.write_str("unknown owner"),
            RejectReason::OwnerDisabled => f.write_str("owner is disabled"),
            RejectReason::ResultUnavailable => f.write_str("build result unavailable"),
        }
    }
}

/// What one activation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
    pub activated: Vec<ActiveBuild>,
    /// Requests rejected because no build result could be created for them.
    pub rejected: Vec<RequestId>,
}

impl ActivationReport {
    pub fn is_empty(&self) -> bool {
        self.activated.is_empty() && self.rejected.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Queued {
        id: RequestId,
        /// The earlier request this one superseded.
        assimilated: Option<RequestId>,
    },
    Rejected {
        id: RequestId,
        reason: RejectReason,
    },
}

impl EnqueueOutcome {
    pub fn id(&self) -> RequestId {
        match self {
            EnqueueOutcome::Queued { id, .. } | EnqueueOutcome::Rejected { id, .. } => *id,
        }
    }

    pub fn status(&self) -> RequestStatus {
        match self {
            EnqueueOutcome::Queued { .. } => RequestStatus::Queued,
            EnqueueOutcome::Rejected { .. } => RequestStatus::Rejected,
        }
    }
}

pub struct BuildQueue {
    config: QueueConfig,
    registry: Arc<RequestRegistry>,
    entities: RwLock<BTreeMap<OwnerId, Arc<EntityBuildQueue>>>,
    running: AtomicBool,
    /// Serializes activation passes so the cap check sees every activation.
    pass: Mutex<()>,
    policy: Arc<dyn ActivationPolicy>,
    directory: Arc<dyn OwnerDirectory>,
    results: Arc<dyn ResultSink>,
}

impl fmt::Debug for BuildQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildQueue")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .field("owners", &self.owners())
            .finish_non_exhaustive()
    }
}

impl BuildQueue {
    pub fn new(
        config: QueueConfig,
        policy: Arc<dyn ActivationPolicy>,
        directory: Arc<dyn OwnerDirectory>,
        results: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            config,
            registry: Arc::new(RequestRegistry::new()),
            entities: RwLock::new(BTreeMap::new()),
            running: AtomicBool::new(!config.start_paused),
            pass: Mutex::new(()),
            policy,
            directory,
            results,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RequestRegistry> {
        &self.registry
    }

    pub fn next_request_id(&self) -> RequestId {
        self.registry.next_id()
    }

    /// Register a request and queue it for its owner.
    ///
    /// Requests for unknown or disabled owners are registered and immediately
    /// REJECTED. A paused queue still accepts requests; they simply wait.
    pub fn enqueue(&self, mut request: BuildRequest) -> Result<EnqueueOutcome> {
        let owner_config = self.directory.owner_config(&request.owner);
        if request.replaceable.is_none() {
            request.replaceable = Some(owner_config.is_some_and(|config| config.replaceable_default));
        }
        let request = Arc::new(request);

        self.registry.register(&request)?;

        let rejection = match owner_config {
            None => Some(RejectReason::UnknownOwner),
            Some(config) if !config.enabled => Some(RejectReason::OwnerDisabled),
            Some(_) => None,
        };
        if let Some(reason) = rejection {
            self.registry.update_status(request.id, RequestStatus::Rejected)?;
            tracing::warn!(
                request_id = %request.id,
                owner = %request.owner,
                source = %request.source,
                %reason,
                "Build request rejected"
            );
            return Ok(EnqueueOutcome::Rejected {
                id: request.id,
                reason,
            });
        }

        let entity = self.entity_or_create(&request.owner);
        let outcome = entity.add_request(request)?;

        Ok(EnqueueOutcome::Queued {
            id: outcome.queued,
            assimilated: outcome.assimilated.map(|old| old.id),
        })
    }

    /// Promote queued requests to active builds where allowed.
    ///
    /// Owners are visited in id order. The global cap is checked before every
    /// attempt, and an owner is revisited until its head is blocked. A head
    /// rejected for lack of a build result does not stop the owner: the next
    /// request is tried in the same pass. Does nothing while the queue is
    /// paused.
    pub fn run_activation_pass(&self) -> Result<ActivationReport> {
        if !self.is_running() {
            return Ok(ActivationReport::default());
        }

        let _pass = self.pass.lock().unwrap_or_else(PoisonError::into_inner);
        let started = Instant::now();

        let entities = self.entity_list();
        let mut active_count: usize = entities.iter().map(|entity| entity.active_len()).sum();
        let mut report = ActivationReport::default();

        'owners: for entity in &entities {
            loop {
                if !self.is_running() {
                    break 'owners;
                }
                if let Some(max) = self.config.max_active {
                    if active_count >= max {
                        tracing::debug!(active = active_count, max, "Global build cap reached");
                        break 'owners;
                    }
                }

                match entity.try_activate_next(self.policy.as_ref(), self.results.as_ref())? {
                    ActivationAttempt::Activated(build) => {
                        active_count += 1;
                        report.activated.push(build);
                    }
                    ActivationAttempt::HeadRejected(id) => report.rejected.push(id),
                    ActivationAttempt::Retry => {}
                    ActivationAttempt::Blocked => break,
                }
            }
        }

        let queued: usize = entities.iter().map(|entity| entity.queued_len()).sum();
        crate::metrics::queue_depth(queued, active_count);
        crate::metrics::activation_pass(started.elapsed().as_millis() as u64, report.activated.len());

        if !report.is_empty() {
            tracing::debug!(
                activated = report.activated.len(),
                rejected = report.rejected.len(),
                queued,
                active = active_count,
                "Activation pass finished"
            );
        }
        Ok(report)
    }

    /// Signal that an active build finished. Idempotent.
    pub fn complete_active(&self, id: RequestId) -> bool {
        match self.entity_for_request(id) {
            Some(entity) => entity.complete_active(id),
            None => false,
        }
    }

    /// Cancel a queued or active request, or under cancel-wins one whose
    /// build already completed.
    pub fn cancel(&self, id: RequestId) -> Result<CancelOutcome> {
        match self.entity_for_request(id) {
            Some(entity) => entity.cancel(id),
            None => Ok(CancelOutcome::Unchanged),
        }
    }

    /// Cancel every queued and active request on the server.
    ///
    /// Callers are expected to have checked the actor's permission first.
    pub fn cancel_all(&self) -> Result<Vec<RequestId>> {
        let mut cancelled = Vec::new();
        for entity in self.entity_list() {
            cancelled.extend(entity.cancel_all()?);
        }
        tracing::warn!(count = cancelled.len(), "Cancelled all builds");
        Ok(cancelled)
    }

    pub fn pause(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            tracing::info!("Build queue paused");
        }
    }

    pub fn resume(&self) {
        if !self.running.swap(true, Ordering::SeqCst) {
            tracing::info!("Build queue resumed");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn status(&self, id: RequestId) -> Result<RequestStatus> {
        self.registry.status(id)
    }

    pub fn record(&self, id: RequestId) -> Result<RequestRecord> {
        self.registry.record(id)
    }

    /// Queued requests of every owner, in arrival order.
    pub fn queued_snapshot(&self) -> Vec<Arc<BuildRequest>> {
        let mut queued: Vec<_> = self
            .entity_list()
            .iter()
            .flat_map(|entity| entity.queued_snapshot())
            .collect();
        queued.sort_by_key(|request| request.id);
        queued
    }

    /// Active builds of every owner, in activation order.
    pub fn active_snapshot(&self) -> Vec<ActiveBuild> {
        let mut active: Vec<_> = self
            .entity_list()
            .iter()
            .flat_map(|entity| entity.active_snapshot())
            .collect();
        active.sort_by_key(|build| (build.activated_at, build.id()));
        active
    }

    pub fn entity(&self, owner: &OwnerId) -> Option<Arc<EntityBuildQueue>> {
        self.read_entities().get(owner).cloned()
    }

    /// Owners with at least one queued or active request.
    pub fn owners(&self) -> Vec<OwnerId> {
        self.entity_list()
            .iter()
            .filter(|entity| !entity.is_idle())
            .map(|entity| entity.owner().clone())
            .collect()
    }

    fn entity_or_create(&self, owner: &OwnerId) -> Arc<EntityBuildQueue> {
        if let Some(entity) = self.entity(owner) {
            return entity;
        }

        let mut entities = self.entities.write().unwrap_or_else(PoisonError::into_inner);
        let entity = entities.entry(owner.clone()).or_insert_with(|| {
            tracing::debug!(owner = %owner, "Creating build queue for owner");
            Arc::new(
                EntityBuildQueue::new(owner.clone(), Arc::clone(&self.registry))
                    .with_race_resolution(self.config.race_resolution),
            )
        });
        Arc::clone(entity)
    }

    fn entity_for_request(&self, id: RequestId) -> Option<Arc<EntityBuildQueue>> {
        let owner = self.registry.owner_of(id)?;
        self.entity(&owner)
    }

    fn entity_list(&self) -> Vec<Arc<EntityBuildQueue>> {
        self.read_entities().values().cloned().collect()
    }

    fn read_entities(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, BTreeMap<OwnerId, Arc<EntityBuildQueue>>> {
        self.entities.read().unwrap_or_else(PoisonError::into_inner)
    }
}
