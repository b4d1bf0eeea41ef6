//! End-to-end behaviour of the build queue through its public API.

mod common;

use ci_queue::{
    ActivationAttempt, BuildResultHandle, CancelOutcome, EnqueueOutcome, OwnerConfig, OwnerId,
    QueueConfig, QueueError, RaceResolution, RejectReason, RequestId, RequestStatus,
};
use common::Harness;

#[test]
fn supersede_keeps_only_latest_replaceable_request() {
    let h = Harness::new();
    let r1 = h.enqueue(1, "scm", true);
    let r2 = h.enqueue(1, "scm", true);

    assert_eq!(h.queued_for(1), vec![r2]);
    assert_eq!(h.status(r1), RequestStatus::Assimilated);
    assert_eq!(h.queue.record(r1).unwrap().assimilated_into, Some(r2));
}

#[test]
fn different_sources_are_not_superseded() {
    let h = Harness::new();
    let r1 = h.enqueue(1, "scm-a", true);
    let r2 = h.enqueue(1, "scm-b", true);

    assert_eq!(h.queued_for(1), vec![r1, r2]);
    assert_eq!(h.status(r1), RequestStatus::Queued);
    assert_eq!(h.status(r2), RequestStatus::Queued);
}

#[test]
fn forced_builds_are_never_discarded() {
    let h = Harness::new();
    let forced = h.enqueue(1, "manual", false);
    let again = h.enqueue(1, "manual", false);

    assert_eq!(h.queued_for(1), vec![forced, again]);
}

#[test]
fn one_active_build_per_owner() {
    let h = Harness::new();
    let r1 = h.enqueue(1, "scm", false);
    let r2 = h.enqueue(1, "manual", false);

    h.queue.run_activation_pass().unwrap();
    let entity = h.queue.entity(&OwnerId::Project(1)).unwrap();
    assert_eq!(entity.active_snapshot().len(), 1);

    let results = h.results.clone();
    assert_eq!(
        entity
            .try_activate_next(&ci_queue::OnePerOwner, results.as_ref())
            .unwrap(),
        ActivationAttempt::Blocked
    );
    assert_eq!(h.active_for(1), vec![r1]);
    assert_eq!(h.queued_for(1), vec![r2]);
}

#[test]
fn blocked_head_blocks_the_owner_but_not_others() {
    let h = Harness::new();
    let p1_first = h.enqueue(1, "scm", false);
    h.queue.run_activation_pass().unwrap();
    let p1_second = h.enqueue(1, "manual", false);
    let p2_first = h.enqueue(2, "scm", false);

    let activated: Vec<RequestId> = h
        .queue
        .run_activation_pass()
        .unwrap()
        .activated
        .iter()
        .map(|build| build.id())
        .collect();

    assert_eq!(activated, vec![p2_first]);
    assert_eq!(h.status(p1_first), RequestStatus::Activated);
    assert_eq!(h.status(p1_second), RequestStatus::Queued);
}

#[test]
fn cancel_twice_then_unknown() {
    let h = Harness::new();
    let r1 = h.enqueue(1, "scm", false);

    assert_eq!(h.queue.cancel(r1).unwrap(), CancelOutcome::Removed);
    assert_eq!(h.queue.cancel(r1).unwrap(), CancelOutcome::Unchanged);
    assert_eq!(h.queue.cancel(RequestId(9_999)).unwrap(), CancelOutcome::Unchanged);
    assert_eq!(h.status(r1), RequestStatus::Cancelled);
}

#[test]
fn returning_to_queued_is_a_programming_error() {
    let h = Harness::new();
    let r1 = h.enqueue(1, "scm", false);

    let err = h
        .queue
        .registry()
        .update_status(r1, RequestStatus::Queued)
        .unwrap_err();
    assert!(matches!(err, QueueError::IllegalTransition { .. }));
}

#[test]
fn end_to_end_activation_cycle() {
    let h = Harness::new();

    let r1 = h.enqueue(1, "scm", true);
    assert_eq!(h.status(r1), RequestStatus::Queued);

    let activated = h.queue.run_activation_pass().unwrap().activated;
    assert_eq!(activated.len(), 1);
    assert_eq!(h.status(r1), RequestStatus::Activated);
    assert_eq!(h.active_for(1), vec![r1]);
    assert_eq!(activated[0].result, BuildResultHandle::new(1, 1));
    assert_eq!(
        h.queue.record(r1).unwrap().result,
        Some(BuildResultHandle::new(1, 1))
    );

    // The active build is not replaceable; the new request just waits.
    let r2 = h.enqueue(1, "scm", true);
    assert!(h.queue.run_activation_pass().unwrap().is_empty());
    assert_eq!(h.status(r2), RequestStatus::Queued);
    assert_eq!(h.status(r1), RequestStatus::Activated);

    assert!(h.queue.complete_active(r1));
    assert!(h.active_for(1).is_empty());

    let activated = h.queue.run_activation_pass().unwrap().activated;
    assert_eq!(activated.len(), 1);
    assert_eq!(activated[0].id(), r2);
    assert_eq!(activated[0].result, BuildResultHandle::new(2, 2));
    assert_eq!(h.status(r2), RequestStatus::Activated);

    h.assert_membership_consistent(&[r1, r2]);
}

#[test]
fn pause_holds_everything_until_resume() {
    let h = Harness::new();
    h.queue.pause();

    let r1 = h.enqueue(1, "scm", false);
    let r2 = h.enqueue(2, "scm", false);
    assert!(h.queue.run_activation_pass().unwrap().is_empty());
    assert_eq!(h.status(r1), RequestStatus::Queued);
    assert_eq!(h.status(r2), RequestStatus::Queued);

    // Bookkeeping carries on while paused.
    assert_eq!(h.queue.cancel(r2).unwrap(), CancelOutcome::Removed);
    assert_eq!(h.status(r2), RequestStatus::Cancelled);

    h.queue.resume();
    let activated = h.queue.run_activation_pass().unwrap().activated;
    assert_eq!(activated.len(), 1);
    assert_eq!(h.status(r1), RequestStatus::Activated);
}

#[test]
fn disabled_owner_requests_are_rejected() {
    let h = Harness::new();
    h.projects.set(
        OwnerId::Project(5),
        OwnerConfig {
            enabled: false,
            ..OwnerConfig::default()
        },
    );

    let request = h.request(5, "scm", false);
    let id = request.id;
    let outcome = h.queue.enqueue(request).unwrap();
    assert_eq!(
        outcome,
        EnqueueOutcome::Rejected {
            id,
            reason: RejectReason::OwnerDisabled
        }
    );
    assert_eq!(h.status(id), RequestStatus::Rejected);
    assert!(h.queued_for(5).is_empty());

    let outcome = h.queue.enqueue(h.request(500, "scm", false)).unwrap();
    assert!(matches!(
        outcome,
        EnqueueOutcome::Rejected {
            reason: RejectReason::UnknownOwner,
            ..
        }
    ));
}

#[test]
fn personal_builds_queue_per_user() {
    let h = Harness::new();
    let personal = ci_queue::BuildRequest::new(h.queue.next_request_id(), OwnerId::User(7), "personal")
        .with_revision(ci_queue::Revision::Fixed("1234".into()));
    let personal_id = personal.id;
    h.queue.enqueue(personal).unwrap();
    let project = h.enqueue(1, "scm", false);

    let activated = h.queue.run_activation_pass().unwrap().activated;
    assert_eq!(activated.len(), 2);
    assert_eq!(h.status(personal_id), RequestStatus::Activated);
    assert_eq!(h.status(project), RequestStatus::Activated);
    assert!(h.queue.entity(&OwnerId::User(7)).is_some());
}

#[test]
fn cancel_then_complete_keeps_cancelled() {
    let h = Harness::new();
    let r1 = h.enqueue(1, "scm", false);
    h.queue.run_activation_pass().unwrap();

    assert_eq!(h.queue.cancel(r1).unwrap(), CancelOutcome::Removed);
    assert!(!h.queue.complete_active(r1));
    assert_eq!(h.status(r1), RequestStatus::Cancelled);
    h.assert_membership_consistent(&[r1]);
}

#[test]
fn complete_then_cancel_follows_race_resolution() {
    for (race, outcome, expected) in [
        (RaceResolution::CancelWins, CancelOutcome::LateCancelled, RequestStatus::Cancelled),
        (RaceResolution::FirstWins, CancelOutcome::Unchanged, RequestStatus::Activated),
    ] {
        let h = Harness::with_config(QueueConfig {
            race_resolution: race,
            ..QueueConfig::default()
        });
        let r1 = h.enqueue(1, "scm", false);
        h.queue.run_activation_pass().unwrap();

        assert!(h.queue.complete_active(r1));
        assert_eq!(h.queue.cancel(r1).unwrap(), outcome, "with {race}");
        assert_eq!(h.status(r1), expected, "with {race}");
    }
}

#[test]
fn global_cap_spans_owners() {
    let h = Harness::with_config(QueueConfig {
        max_active: Some(2),
        ..QueueConfig::default()
    });
    let ids: Vec<RequestId> = (1..=4).map(|project| h.enqueue(project, "scm", false)).collect();

    let activated = h.queue.run_activation_pass().unwrap().activated;
    assert_eq!(activated.len(), 2);
    assert_eq!(h.queue.active_snapshot().len(), 2);

    assert!(h.queue.complete_active(ids[0]));
    let activated = h.queue.run_activation_pass().unwrap().activated;
    assert_eq!(activated.iter().map(|b| b.id()).collect::<Vec<_>>(), vec![ids[2]]);

    h.assert_membership_consistent(&ids);
}

#[tokio::test]
async fn wait_for_handled_sees_activation() {
    let h = std::sync::Arc::new(Harness::new());
    let r1 = h.enqueue(1, "scm", false);

    let waiter = {
        let registry = h.queue.registry().clone();
        tokio::spawn(async move {
            registry
                .wait_for_handled(r1, std::time::Duration::from_secs(5))
                .await
        })
    };

    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    h.queue.run_activation_pass().unwrap();

    assert_eq!(waiter.await.unwrap(), Ok(RequestStatus::Activated));
}

#[test]
fn snapshots_serialize_for_monitoring() {
    let h = Harness::new();
    h.enqueue(1, "scm", false);
    h.queue.run_activation_pass().unwrap();
    h.enqueue(1, "scm", false);

    let active = serde_json::to_value(h.queue.active_snapshot()).unwrap();
    assert_eq!(active[0]["request"]["owner"]["project"], 1);
    assert_eq!(active[0]["result"]["number"], 1);

    let queued = serde_json::to_value(h.queue.queued_snapshot()).unwrap();
    assert_eq!(queued[0]["revision"]["kind"], "floating");

    let record = serde_json::to_value(h.queue.record(RequestId(1)).unwrap()).unwrap();
    assert_eq!(record["status"], "ACTIVATED");
}
