//! Request registry — the single source of truth for request status.
//!
//! The registry holds no business rules beyond the lifecycle itself:
//!
//! ```text
//! QUEUED ──activate──▶ ACTIVATED ──cancel──▶ CANCELLED
//!   │
//!   ├──supersede──▶ ASSIMILATED
//!   ├──cancel─────▶ CANCELLED
//!   └──admission──▶ REJECTED
//! ```
//!
//! Nothing ever returns to QUEUED, and REJECTED, CANCELLED and ASSIMILATED
//! accept no further transitions.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::collaborators::BuildResultHandle;
use crate::error::{QueueError, Result};
use crate::request::{BuildRequest, OwnerId, RequestId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Queued,
    Activated,
    Rejected,
    Cancelled,
    Assimilated,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Rejected | RequestStatus::Cancelled | RequestStatus::Assimilated
        )
    }

    /// ACTIVATED hands the request over to the execution side, so the only
    /// change the queue may still make is a user cancelling the build.
    pub fn can_transition_to(self, next: RequestStatus) -> bool {
        match (self, next) {
            (_, RequestStatus::Queued) => false,
            (RequestStatus::Queued, _) => true,
            (RequestStatus::Activated, RequestStatus::Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Queued => "queued",
            RequestStatus::Activated => "activated",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Cancelled => "cancelled",
            RequestStatus::Assimilated => "assimilated",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the registry knows about one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestRecord {
    pub id: RequestId,
    pub owner: OwnerId,
    pub status: RequestStatus,
    /// The newer request that superseded this one.
    pub assimilated_into: Option<RequestId>,
    /// The build result created when the request was activated.
    pub result: Option<BuildResultHandle>,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// The request as registered, kept after it leaves its owner's queue.
    #[serde(skip)]
    pub request: Arc<BuildRequest>,
}

/// Per-status totals, for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub queued: usize,
    pub activated: usize,
    pub rejected: usize,
    pub cancelled: usize,
    pub assimilated: usize,
}

#[derive(Debug)]
pub struct RequestRegistry {
    next_id: AtomicU64,
    records: Mutex<HashMap<RequestId, RequestRecord>>,
    handled: Notify,
}

impl Default for RequestRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            records: Mutex::new(HashMap::new()),
            handled: Notify::new(),
        }
    }

    /// Allocate a fresh request id.
    pub fn next_id(&self) -> RequestId {
        RequestId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Record a new request as QUEUED.
    pub fn register(&self, request: &BuildRequest) -> Result<()> {
        {
            let mut records = self.records();
            if records.contains_key(&request.id) {
                return Err(QueueError::AlreadyRegistered(request.id));
            }

            let now = Utc::now();
            records.insert(
                request.id,
                RequestRecord {
                    id: request.id,
                    owner: request.owner.clone(),
                    status: RequestStatus::Queued,
                    assimilated_into: None,
                    result: None,
                    registered_at: now,
                    updated_at: now,
                    request: Arc::new(request.clone()),
                },
            );
        }

        // Ids supplied by the caller must not be handed out again later.
        self.next_id
            .fetch_max(request.id.0.saturating_add(1), Ordering::SeqCst);
        crate::metrics::request_status_changed(RequestStatus::Queued);

        tracing::debug!(
            request_id = %request.id,
            owner = %request.owner,
            source = %request.source,
            "Build request registered"
        );
        Ok(())
    }

    pub fn status(&self, id: RequestId) -> Result<RequestStatus> {
        self.records()
            .get(&id)
            .map(|record| record.status)
            .ok_or(QueueError::NotFound(id))
    }

    pub fn record(&self, id: RequestId) -> Result<RequestRecord> {
        self.records()
            .get(&id)
            .cloned()
            .ok_or(QueueError::NotFound(id))
    }

    /// The registered request, whatever its status.
    pub fn request(&self, id: RequestId) -> Result<Arc<BuildRequest>> {
        self.records()
            .get(&id)
            .map(|record| Arc::clone(&record.request))
            .ok_or(QueueError::NotFound(id))
    }

    pub fn owner_of(&self, id: RequestId) -> Option<OwnerId> {
        self.records().get(&id).map(|record| record.owner.clone())
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.records().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for record in self.records().values() {
            match record.status {
                RequestStatus::Queued => counts.queued += 1,
                RequestStatus::Activated => counts.activated += 1,
                RequestStatus::Rejected => counts.rejected += 1,
                RequestStatus::Cancelled => counts.cancelled += 1,
                RequestStatus::Assimilated => counts.assimilated += 1,
            }
        }
        counts
    }

    pub fn update_status(&self, id: RequestId, status: RequestStatus) -> Result<()> {
        self.transition(id, status, |_| {})
    }

    /// Mark `id` ASSIMILATED, remembering the request that replaced it.
    pub fn mark_assimilated(&self, id: RequestId, into: RequestId) -> Result<()> {
        self.transition(id, RequestStatus::Assimilated, |record| {
            record.assimilated_into = Some(into);
        })
    }

    /// Mark `id` ACTIVATED together with the build result created for it.
    pub fn mark_activated(&self, id: RequestId, result: BuildResultHandle) -> Result<()> {
        self.transition(id, RequestStatus::Activated, |record| {
            record.result = Some(result);
        })
    }

    /// Wait until `id` leaves QUEUED, or until `timeout` elapses.
    ///
    /// Returns the status at that point, which is still QUEUED on timeout.
    pub async fn wait_for_handled(&self, id: RequestId, timeout: Duration) -> Result<RequestStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut notified = std::pin::pin!(self.handled.notified());
            notified.as_mut().enable();

            let status = self.status(id)?;
            if status != RequestStatus::Queued {
                return Ok(status);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.status(id);
            }
        }
    }

    fn transition(
        &self,
        id: RequestId,
        to: RequestStatus,
        update: impl FnOnce(&mut RequestRecord),
    ) -> Result<()> {
        let from = {
            let mut records = self.records();
            let record = records.get_mut(&id).ok_or(QueueError::NotFound(id))?;
            let from = record.status;
            if !from.can_transition_to(to) {
                return Err(QueueError::IllegalTransition { id, from, to });
            }

            record.status = to;
            record.updated_at = Utc::now();
            update(record);
            from
        };

        crate::metrics::request_status_changed(to);
        tracing::debug!(request_id = %id, from = %from, to = %to, "Build request status changed");

        if from == RequestStatus::Queued {
            self.handled.notify_waiters();
        }
        Ok(())
    }

    fn records(&self) -> MutexGuard<'_, HashMap<RequestId, RequestRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    fn request(id: u64) -> BuildRequest {
        BuildRequest::new(RequestId(id), OwnerId::Project(1), "scm")
    }

    #[test]
    fn register_sets_queued() {
        let registry = RequestRegistry::new();
        registry.register(&request(1)).unwrap();

        assert_eq!(registry.status(RequestId(1)), Ok(RequestStatus::Queued));
        assert_eq!(registry.owner_of(RequestId(1)), Some(OwnerId::Project(1)));
    }

    #[test]
    fn double_registration_is_rejected() {
        let registry = RequestRegistry::new();
        registry.register(&request(1)).unwrap();

        assert_eq!(
            registry.register(&request(1)),
            Err(QueueError::AlreadyRegistered(RequestId(1)))
        );
    }

    #[test]
    fn unknown_request_is_not_found() {
        let registry = RequestRegistry::new();
        assert_eq!(
            registry.status(RequestId(42)),
            Err(QueueError::NotFound(RequestId(42)))
        );
        assert_eq!(
            registry.update_status(RequestId(42), RequestStatus::Cancelled),
            Err(QueueError::NotFound(RequestId(42)))
        );
    }

    #[test]
    fn returning_to_queued_is_illegal() {
        let registry = RequestRegistry::new();
        registry.register(&request(1)).unwrap();

        let err = registry
            .update_status(RequestId(1), RequestStatus::Queued)
            .unwrap_err();
        assert_eq!(
            err,
            QueueError::IllegalTransition {
                id: RequestId(1),
                from: RequestStatus::Queued,
                to: RequestStatus::Queued,
            }
        );
    }

    #[test]
    fn terminal_statuses_accept_nothing() {
        for terminal in [
            RequestStatus::Rejected,
            RequestStatus::Cancelled,
            RequestStatus::Assimilated,
        ] {
            let registry = RequestRegistry::new();
            registry.register(&request(1)).unwrap();
            registry.update_status(RequestId(1), terminal).unwrap();

            for next in [
                RequestStatus::Activated,
                RequestStatus::Rejected,
                RequestStatus::Cancelled,
                RequestStatus::Assimilated,
            ] {
                assert!(
                    registry.update_status(RequestId(1), next).is_err(),
                    "{terminal} -> {next} should be illegal"
                );
            }
            assert_eq!(registry.status(RequestId(1)), Ok(terminal));
        }
    }

    #[test]
    fn activated_may_only_be_cancelled() {
        let registry = RequestRegistry::new();
        registry.register(&request(1)).unwrap();
        registry
            .mark_activated(RequestId(1), BuildResultHandle::new(10, 1))
            .unwrap();

        assert!(registry
            .update_status(RequestId(1), RequestStatus::Assimilated)
            .is_err());
        assert!(registry
            .update_status(RequestId(1), RequestStatus::Activated)
            .is_err());
        registry
            .update_status(RequestId(1), RequestStatus::Cancelled)
            .unwrap();

        let record = registry.record(RequestId(1)).unwrap();
        assert_eq!(record.status, RequestStatus::Cancelled);
        assert_eq!(record.result, Some(BuildResultHandle::new(10, 1)));
    }

    #[test]
    fn assimilation_records_replacement() {
        let registry = RequestRegistry::new();
        registry.register(&request(1)).unwrap();
        registry.register(&request(2)).unwrap();
        registry.mark_assimilated(RequestId(1), RequestId(2)).unwrap();

        let record = registry.record(RequestId(1)).unwrap();
        assert_eq!(record.status, RequestStatus::Assimilated);
        assert_eq!(record.assimilated_into, Some(RequestId(2)));
    }

    #[test]
    fn allocator_skips_explicit_ids() {
        let registry = RequestRegistry::new();
        registry.register(&request(5)).unwrap();

        assert_eq!(registry.next_id(), RequestId(6));
        assert_eq!(registry.next_id(), RequestId(7));
    }

    #[test]
    fn counts_by_status() {
        let registry = RequestRegistry::new();
        for id in 1..=4 {
            registry.register(&request(id)).unwrap();
        }
        registry.update_status(RequestId(1), RequestStatus::Rejected).unwrap();
        registry.update_status(RequestId(2), RequestStatus::Cancelled).unwrap();

        let counts = registry.counts();
        assert_eq!(counts.queued, 2);
        assert_eq!(counts.rejected, 1);
        assert_eq!(counts.cancelled, 1);
        assert_eq!(registry.len(), 4);
    }

    #[tokio::test]
    async fn wait_returns_once_handled() {
        let registry = Arc::new(RequestRegistry::new());
        registry.register(&request(1)).unwrap();

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry
                    .wait_for_handled(RequestId(1), Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        registry
            .update_status(RequestId(1), RequestStatus::Cancelled)
            .unwrap();

        let status = waiter.await.unwrap().unwrap();
        assert_eq!(status, RequestStatus::Cancelled);
    }

    #[tokio::test]
    async fn wait_times_out_while_queued() {
        let registry = RequestRegistry::new();
        registry.register(&request(1)).unwrap();

        let status = registry
            .wait_for_handled(RequestId(1), Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(status, RequestStatus::Queued);
    }

    #[tokio::test]
    async fn wait_on_unknown_request_fails() {
        let registry = RequestRegistry::new();
        let result = registry
            .wait_for_handled(RequestId(9), Duration::from_millis(20))
            .await;
        assert_eq!(result, Err(QueueError::NotFound(RequestId(9))));
    }

    #[test]
    fn largest_id_can_be_registered() {
        let registry = RequestRegistry::new();
        registry.register(&request(u64::MAX)).unwrap();

        assert_eq!(registry.status(RequestId(u64::MAX)), Ok(RequestStatus::Queued));
        // The allocator is exhausted; the next id collides instead of wrapping silently.
        let next = registry.next_id();
        assert_eq!(next, RequestId(u64::MAX));
        assert_eq!(
            registry.register(&request(next.0)),
            Err(QueueError::AlreadyRegistered(next))
        );
    }

    #[test]
    fn request_outlives_its_queue_status() {
        let registry = RequestRegistry::new();
        registry.register(&request(4)).unwrap();
        registry
            .mark_activated(RequestId(4), BuildResultHandle::new(1, 1))
            .unwrap();

        let request = registry.request(RequestId(4)).unwrap();
        assert_eq!(request.id, RequestId(4));
        assert_eq!(registry.request(RequestId(5)), Err(QueueError::NotFound(RequestId(5))));
    }
}
