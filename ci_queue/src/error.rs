//! Queue errors.
//!
//! Every variant here means the caller misused the queue (a bug, not a
//! runtime condition). Expected outcomes such as rejection, supersede or a
//! cancel racing a completion are reported through return values instead.

use crate::registry::RequestStatus;
use crate::request::{OwnerId, RequestId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The same request id was registered twice.
    #[error("build request {0} is already registered")]
    AlreadyRegistered(RequestId),

    /// The request id was never registered.
    #[error("build request {0} was never registered")]
    NotFound(RequestId),

    /// A status change the lifecycle does not allow.
    #[error("build request {id} cannot move from {from} to {to}")]
    IllegalTransition {
        id: RequestId,
        from: RequestStatus,
        to: RequestStatus,
    },

    /// A request was handed to the queue of a different owner.
    #[error("build request {id} belongs to {actual}, not {expected}")]
    OwnerMismatch {
        id: RequestId,
        expected: OwnerId,
        actual: OwnerId,
    },
}

pub type Result<T, E = QueueError> = std::result::Result<T, E>;
