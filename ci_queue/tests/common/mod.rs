//! Shared fixtures for queue integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use ci_queue::{
    ActiveBuild, BuildQueue, BuildRequest, BuildResultHandle, OnePerOwner, OwnerConfig,
    OwnerDirectory, OwnerId, QueueConfig, RequestId, RequestStatus, ResultSink,
};

/// Owner directory where every project below 100 exists with defaults.
#[derive(Default)]
pub struct Projects {
    overrides: RwLock<HashMap<OwnerId, OwnerConfig>>,
}

impl Projects {
    pub fn set(&self, owner: OwnerId, config: OwnerConfig) {
        self.overrides.write().unwrap().insert(owner, config);
    }
}

impl OwnerDirectory for Projects {
    fn owner_config(&self, owner: &OwnerId) -> Option<OwnerConfig> {
        if let Some(config) = self.overrides.read().unwrap().get(owner) {
            return Some(*config);
        }
        match owner {
            OwnerId::Project(id) if *id < 100 => Some(OwnerConfig::default()),
            OwnerId::User(_) => Some(OwnerConfig::default()),
            _ => None,
        }
    }
}

/// Result sink numbering builds per owner and remembering what it made.
#[derive(Default)]
pub struct RecordingResults {
    next_build_id: AtomicI64,
    numbers: Mutex<HashMap<OwnerId, i64>>,
    pub created: Mutex<Vec<(RequestId, BuildResultHandle)>>,
    pub discarded: Mutex<Vec<BuildResultHandle>>,
}

impl ResultSink for RecordingResults {
    fn create_build_result(&self, request: &BuildRequest) -> anyhow::Result<BuildResultHandle> {
        let build_id = self.next_build_id.fetch_add(1, Ordering::SeqCst) + 1;
        let number = {
            let mut numbers = self.numbers.lock().unwrap();
            let number = numbers.entry(request.owner.clone()).or_insert(0);
            *number += 1;
            *number
        };
        let handle = BuildResultHandle::new(build_id, number);
        self.created.lock().unwrap().push((request.id, handle));
        Ok(handle)
    }

    fn discard_build_result(&self, result: &BuildResultHandle) {
        self.discarded.lock().unwrap().push(*result);
    }
}

pub struct Harness {
    pub queue: BuildQueue,
    pub projects: Arc<Projects>,
    pub results: Arc<RecordingResults>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(QueueConfig::default())
    }

    pub fn with_config(config: QueueConfig) -> Self {
        let projects = Arc::new(Projects::default());
        let results = Arc::new(RecordingResults::default());
        let queue = BuildQueue::new(
            config,
            Arc::new(OnePerOwner),
            projects.clone(),
            results.clone(),
        );
        Self {
            queue,
            projects,
            results,
        }
    }

    pub fn request(&self, project: i64, source: &str, replaceable: bool) -> BuildRequest {
        BuildRequest::new(self.queue.next_request_id(), OwnerId::Project(project), source)
            .with_replaceable(replaceable)
            .with_reason("test trigger")
    }

    /// Enqueue and return the request id.
    pub fn enqueue(&self, project: i64, source: &str, replaceable: bool) -> RequestId {
        let request = self.request(project, source, replaceable);
        self.queue.enqueue(request).unwrap().id()
    }

    pub fn status(&self, id: RequestId) -> RequestStatus {
        self.queue.status(id).unwrap()
    }

    pub fn queued_for(&self, project: i64) -> Vec<RequestId> {
        self.queue
            .entity(&OwnerId::Project(project))
            .map(|entity| entity.queued_snapshot().iter().map(|r| r.id).collect())
            .unwrap_or_default()
    }

    pub fn active_for(&self, project: i64) -> Vec<RequestId> {
        self.queue
            .entity(&OwnerId::Project(project))
            .map(|entity| entity.active_snapshot().iter().map(ActiveBuild::id).collect())
            .unwrap_or_default()
    }

    /// Every registered request is in exactly the structure its status says.
    pub fn assert_membership_consistent(&self, ids: &[RequestId]) {
        let queued: Vec<RequestId> = self.queue.queued_snapshot().iter().map(|r| r.id).collect();
        let active: Vec<RequestId> = self.queue.active_snapshot().iter().map(ActiveBuild::id).collect();

        for id in ids {
            let in_queued = queued.contains(id);
            let in_active = active.contains(id);
            assert!(!(in_queued && in_active), "{id} is both queued and active");

            match self.status(*id) {
                RequestStatus::Queued => assert!(in_queued, "{id} is QUEUED but not queued"),
                RequestStatus::Activated => assert!(!in_queued, "{id} is ACTIVATED but queued"),
                status => assert!(
                    !in_queued && !in_active,
                    "{id} is {status} but still held by the queue"
                ),
            }
            if in_active {
                assert_eq!(self.status(*id), RequestStatus::Activated);
            }
        }
    }
}
