//! Centrix CI build queue — request registry and activation engine.
//!
//! Build requests arrive from many places (manual triggers, SCM pollers,
//! dependent builds, personal builds). This crate tracks each request's
//! lifecycle, keeps one FIFO queue per owner with supersede rules for
//! replaceable requests, and promotes queued requests to active builds when
//! the activation policy and the global concurrency cap allow it.
//!
//! Persistence, execution and permissions live outside this crate and are
//! reached through the traits in [`collaborators`].

pub mod collaborators;
pub mod entity;
pub mod error;
pub mod metrics;
pub mod policy;
pub mod queue;
pub mod registry;
pub mod request;

pub use collaborators::{
    AccessControl, Actor, BuildResultHandle, OwnerConfig, OwnerDirectory, ResultSink,
};
pub use entity::{
    ActivationAttempt, ActiveBuild, CancelOutcome, EntityBuildQueue, RaceResolution,
    SupersedeOutcome,
};
pub use error::{QueueError, Result};
pub use policy::{ActivationPolicy, OnePerOwner, OwnerConcurrencyLimit, PolicyKind};
pub use queue::{ActivationReport, BuildQueue, EnqueueOutcome, QueueConfig, RejectReason};
pub use registry::{RequestRecord, RequestRegistry, RequestStatus, StatusCounts};
pub use request::{BuildRequest, OwnerId, RequestId, Revision};
