//! Dispatcher — drives the build queue and publishes what happened.
//!
//! Every state change that can free capacity or add work (trigger, cancel,
//! completion, resume) is followed by an activation pass. A background loop
//! runs a pass on a fixed interval as well, so nothing stays queued if a
//! pass is ever missed.

use std::sync::Arc;
use std::time::Duration;

use ci_queue::{
    ActivationReport, BuildQueue, BuildRequest, CancelOutcome, EnqueueOutcome, RejectReason,
    RequestId,
};

use crate::events::{EventBus, QueueEvent};
use crate::models::build::{BuildState, CiBuild};
use crate::services::build_service::BuildStore;

#[derive(Debug)]
pub struct Dispatcher {
    queue: Arc<BuildQueue>,
    builds: Arc<BuildStore>,
    events: EventBus,
}

impl Dispatcher {
    pub fn new(queue: Arc<BuildQueue>, builds: Arc<BuildStore>, events: EventBus) -> Self {
        Self {
            queue,
            builds,
            events,
        }
    }

    pub fn queue(&self) -> &Arc<BuildQueue> {
        &self.queue
    }

    pub fn builds(&self) -> &Arc<BuildStore> {
        &self.builds
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Enqueue a request and try to start it right away.
    pub fn trigger(&self, request: BuildRequest) -> anyhow::Result<EnqueueOutcome> {
        let owner = request.owner.clone();
        let source = request.source.clone();
        crate::metrics::trigger_received(&source);

        let outcome = self.queue.enqueue(request)?;
        match outcome {
            EnqueueOutcome::Queued { id, assimilated } => {
                if let Some(old) = assimilated {
                    self.events.publish(QueueEvent::RequestAssimilated {
                        request_id: old,
                        into: id,
                    });
                }
                self.events.publish(QueueEvent::RequestQueued {
                    request_id: id,
                    owner,
                    source,
                });
                self.activate();
            }
            EnqueueOutcome::Rejected { id, reason } => {
                self.events.publish(QueueEvent::RequestRejected {
                    request_id: id,
                    reason,
                });
            }
        }
        Ok(outcome)
    }

    /// Cancel a queued or active request.
    ///
    /// A cancel that arrives after completion and still wins also marks the
    /// finished build cancelled, so the build record agrees with the request.
    pub fn cancel(&self, id: RequestId) -> anyhow::Result<CancelOutcome> {
        let outcome = self.queue.cancel(id)?;
        match outcome {
            CancelOutcome::Removed => {
                self.builds.finish_build(id, BuildState::Cancelled);
                self.events.publish(QueueEvent::RequestCancelled { request_id: id });
                self.activate();
            }
            CancelOutcome::LateCancelled => {
                self.builds.mark_cancelled(id);
                self.events.publish(QueueEvent::RequestCancelled { request_id: id });
            }
            CancelOutcome::Unchanged => {}
        }
        Ok(outcome)
    }

    /// Record that an active build finished with `state`.
    ///
    /// Returns the finished build, or `None` when the request was not active
    /// (already completed, cancelled, or unknown).
    pub fn complete(&self, id: RequestId, state: BuildState) -> Option<CiBuild> {
        if !state.is_finished() || !self.queue.complete_active(id) {
            return None;
        }
        let build = self.builds.finish_build(id, state);
        self.events.publish(QueueEvent::BuildCompleted {
            request_id: id,
            state,
        });
        self.activate();
        build
    }

    pub fn cancel_all(&self) -> anyhow::Result<Vec<RequestId>> {
        let cancelled = self.queue.cancel_all()?;
        for id in &cancelled {
            self.builds.finish_build(*id, BuildState::Cancelled);
            self.events.publish(QueueEvent::RequestCancelled { request_id: *id });
        }
        Ok(cancelled)
    }

    pub fn pause(&self) {
        if self.queue.is_running() {
            self.queue.pause();
            self.events.publish(QueueEvent::QueuePaused);
        }
    }

    pub fn resume(&self) {
        if !self.queue.is_running() {
            self.queue.resume();
            self.events.publish(QueueEvent::QueueResumed);
            self.activate();
        }
    }

    /// Run one activation pass and publish the builds it started and the
    /// requests it had to reject.
    pub fn activate(&self) -> ActivationReport {
        match self.queue.run_activation_pass() {
            Ok(report) => {
                for id in &report.rejected {
                    self.events.publish(QueueEvent::RequestRejected {
                        request_id: *id,
                        reason: RejectReason::ResultUnavailable,
                    });
                }
                for build in &report.activated {
                    self.events.publish(QueueEvent::BuildActivated {
                        request_id: build.id(),
                        owner: build.request.owner.clone(),
                        build_id: build.result.build_id,
                        number: build.result.number,
                    });
                }
                report
            }
            Err(e) => {
                tracing::error!("Activation pass error: {e}");
                crate::metrics::error_recorded("activation");
                ActivationReport::default()
            }
        }
    }
}

/// Run activation passes forever. Spawned as a background tokio task.
pub async fn run_dispatcher(dispatcher: Arc<Dispatcher>, interval: Duration) {
    tracing::info!(
        interval_secs = interval.as_secs(),
        max_active = ?dispatcher.queue().config().max_active,
        "Build dispatcher started"
    );

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let report = dispatcher.activate();
        if !report.is_empty() {
            tracing::debug!(
                activated = report.activated.len(),
                rejected = report.rejected.len(),
                "Periodic activation pass changed the queue"
            );
        }
    }
}
