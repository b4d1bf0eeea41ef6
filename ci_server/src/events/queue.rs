//! Queue event definitions.

use serde::{Deserialize, Serialize};

use ci_queue::{OwnerId, RejectReason, RequestId};

use crate::models::build::BuildState;

/// Events that can happen to build requests and the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum QueueEvent {
    /// A request entered its owner's queue.
    RequestQueued {
        request_id: RequestId,
        owner: OwnerId,
        source: String,
    },
    /// A queued request was superseded by a newer one.
    RequestAssimilated {
        request_id: RequestId,
        into: RequestId,
    },
    /// A request failed admission.
    RequestRejected {
        request_id: RequestId,
        reason: RejectReason,
    },
    /// A request became an active build.
    BuildActivated {
        request_id: RequestId,
        owner: OwnerId,
        build_id: i64,
        number: i64,
    },
    RequestCancelled { request_id: RequestId },
    /// The execution side reported a final state.
    BuildCompleted {
        request_id: RequestId,
        state: BuildState,
    },
    QueuePaused,
    QueueResumed,
}

impl QueueEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            QueueEvent::RequestQueued { .. } => "request_queued",
            QueueEvent::RequestAssimilated { .. } => "request_assimilated",
            QueueEvent::RequestRejected { .. } => "request_rejected",
            QueueEvent::BuildActivated { .. } => "build_activated",
            QueueEvent::RequestCancelled { .. } => "request_cancelled",
            QueueEvent::BuildCompleted { .. } => "build_completed",
            QueueEvent::QueuePaused => "queue_paused",
            QueueEvent::QueueResumed => "queue_resumed",
        }
    }
}
