//! REST API for the build queue: activity, triggers and request records.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ci_queue::{
    AccessControl, ActiveBuild, Actor, BuildRequest, BuildResultHandle, OwnerId, RejectReason,
    RequestId, RequestStatus, Revision,
};

use crate::models::build::CiBuild;
use crate::services::dispatcher::Dispatcher;
use crate::services::project_service::ProjectRegistry;

#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    pub owner: OwnerId,
    #[serde(default = "default_source")]
    pub source: String,
    /// Exact revision to build; the latest is built when absent.
    pub revision: Option<String>,
    pub replaceable: Option<bool>,
    #[serde(default)]
    pub reason: String,
    /// Wait up to this long for the request to leave the queue.
    pub wait_secs: Option<u64>,
}

fn default_source() -> String {
    "manual".to_string()
}

#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub request_id: RequestId,
    pub status: RequestStatus,
    pub assimilated: Option<RequestId>,
    pub reject_reason: Option<RejectReason>,
    pub build: Option<BuildResultHandle>,
}

/// Enqueue a build request, optionally waiting up to `max_wait_secs` for it
/// to be handled.
pub async fn trigger_build(
    dispatcher: &Dispatcher,
    req: TriggerRequest,
    max_wait_secs: u64,
) -> anyhow::Result<TriggerResponse> {
    let queue = dispatcher.queue();
    let revision = match req.revision.filter(|rev| !rev.trim().is_empty()) {
        Some(rev) => Revision::Fixed(rev),
        None => Revision::Floating,
    };
    let mut request = BuildRequest::new(queue.next_request_id(), req.owner, req.source)
        .with_revision(revision)
        .with_reason(req.reason);
    if let Some(replaceable) = req.replaceable {
        request = request.with_replaceable(replaceable);
    }

    let outcome = dispatcher.trigger(request)?;
    let id = outcome.id();

    let wait = req.wait_secs.unwrap_or(0).min(max_wait_secs);
    if wait > 0 && outcome.status() == RequestStatus::Queued {
        queue
            .registry()
            .wait_for_handled(id, Duration::from_secs(wait))
            .await?;
    }

    let record = queue.record(id)?;
    let (assimilated, reject_reason) = match outcome {
        ci_queue::EnqueueOutcome::Queued { assimilated, .. } => (assimilated, None),
        ci_queue::EnqueueOutcome::Rejected { reason, .. } => (None, Some(reason)),
    };

    Ok(TriggerResponse {
        request_id: id,
        status: record.status,
        assimilated,
        reject_reason,
        build: record.result,
    })
}

/// Server activity as seen by one actor.
#[derive(Debug, Serialize)]
pub struct ActivityJson {
    pub build_queue_running: bool,
    pub build_queue_toggle_permitted: bool,
    pub cancel_all_permitted: bool,
    pub queued: Vec<QueuedBuildJson>,
    pub active: Vec<ActiveBuildJson>,
}

#[derive(Debug, Serialize)]
pub struct QueuedBuildJson {
    pub id: RequestId,
    pub owner: String,
    pub personal: bool,
    /// Exact revision, or `[floating]`.
    pub revision: String,
    pub reason: String,
    pub queued_at: DateTime<Utc>,
    pub cancel_permitted: bool,
}

#[derive(Debug, Serialize)]
pub struct ActiveBuildJson {
    pub id: RequestId,
    pub owner: String,
    pub personal: bool,
    pub revision: String,
    pub reason: String,
    pub build_id: i64,
    pub number: i64,
    pub activated_at: DateTime<Utc>,
    pub cancel_permitted: bool,
}

/// Build the activity view. Requests the actor may not see are left out.
pub fn activity(
    dispatcher: &Dispatcher,
    projects: &ProjectRegistry,
    access: &dyn AccessControl,
    actor: &Actor,
) -> ActivityJson {
    let queue = dispatcher.queue();

    let queued = queue
        .queued_snapshot()
        .into_iter()
        .filter(|request| access.can_view(actor, request))
        .map(|request| QueuedBuildJson {
            id: request.id,
            owner: projects.owner_name(&request.owner),
            personal: request.is_personal(),
            revision: request.revision.to_string(),
            reason: request.reason.clone(),
            queued_at: request.created_at,
            cancel_permitted: access.can_cancel(actor, &request),
        })
        .collect();

    let active = queue
        .active_snapshot()
        .into_iter()
        .filter(|build| access.can_view(actor, &build.request))
        .map(|build| active_build_json(&build, projects, access, actor))
        .collect();

    ActivityJson {
        build_queue_running: queue.is_running(),
        build_queue_toggle_permitted: access.can_toggle_queue(actor),
        cancel_all_permitted: access.can_cancel_all(actor),
        queued,
        active,
    }
}

fn active_build_json(
    build: &ActiveBuild,
    projects: &ProjectRegistry,
    access: &dyn AccessControl,
    actor: &Actor,
) -> ActiveBuildJson {
    let request = &build.request;
    ActiveBuildJson {
        id: request.id,
        owner: projects.owner_name(&request.owner),
        personal: request.is_personal(),
        revision: request.revision.to_string(),
        reason: request.reason.clone(),
        build_id: build.result.build_id,
        number: build.result.number,
        activated_at: build.activated_at,
        cancel_permitted: access.can_cancel(actor, request),
    }
}

/// JSON response for a request with its build, if one was created.
#[derive(Debug, Serialize)]
pub struct RequestJson {
    pub id: RequestId,
    pub owner: OwnerId,
    pub status: RequestStatus,
    pub assimilated_into: Option<RequestId>,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub build: Option<CiBuild>,
}

/// Get a request by id with its build.
pub fn get_request(dispatcher: &Dispatcher, id: RequestId) -> ci_queue::Result<RequestJson> {
    let record = dispatcher.queue().record(id)?;
    let build = dispatcher.builds().find_by_request(id);

    Ok(RequestJson {
        id: record.id,
        owner: record.owner,
        status: record.status,
        assimilated_into: record.assimilated_into,
        registered_at: record.registered_at,
        updated_at: record.updated_at,
        build,
    })
}

