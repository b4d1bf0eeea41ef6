//! Build records for activated requests.
//!
//! The store is the queue's [`ResultSink`]: a record is created when a
//! request is activated, finished when the execution side reports back, and
//! dropped again if the activation it was created for never commits.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use chrono::Utc;

use ci_queue::{BuildRequest, BuildResultHandle, OwnerId, RequestId, ResultSink};

use crate::models::build::{BuildState, CiBuild};

#[derive(Debug, Default)]
struct BuildTable {
    last_id: i64,
    builds: BTreeMap<i64, CiBuild>,
    /// Last build number handed out per owner.
    numbers: HashMap<OwnerId, i64>,
    by_request: HashMap<RequestId, i64>,
}

#[derive(Debug, Default)]
pub struct BuildStore {
    table: RwLock<BuildTable>,
}

impl BuildStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a running build for an activated request.
    pub fn create_build(&self, request: &BuildRequest) -> CiBuild {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        table.last_id += 1;
        let id = table.last_id;
        let number = {
            let last = table.numbers.entry(request.owner.clone()).or_insert(0);
            *last += 1;
            *last
        };

        let build = CiBuild {
            id,
            request_id: request.id,
            owner: request.owner.clone(),
            number,
            state: BuildState::Running,
            revision: request.revision.clone(),
            reason: request.reason.clone(),
            create_date: Utc::now(),
            finish_date: None,
        };
        table.builds.insert(id, build.clone());
        table.by_request.insert(request.id, id);

        tracing::info!(
            build_id = id,
            request_id = %request.id,
            owner = %request.owner,
            number,
            "Build created"
        );
        build
    }

    /// Record the final state of the build created for `request_id`.
    ///
    /// Returns `None` when no build exists or it has already finished.
    pub fn finish_build(&self, request_id: RequestId, state: BuildState) -> Option<CiBuild> {
        if !state.is_finished() {
            return None;
        }
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let id = *table.by_request.get(&request_id)?;
        let build = table.builds.get_mut(&id)?;
        if build.state.is_finished() {
            return None;
        }
        build.state = state;
        build.finish_date = Some(Utc::now());

        let duration_ms = build.duration_ms().unwrap_or(0);
        crate::metrics::build_finished(state.as_str());
        crate::metrics::build_duration(duration_ms.max(0) as u64);
        tracing::info!(build_id = id, request_id = %request_id, %state, duration_ms, "Build finished");
        Some(build.clone())
    }

    /// Overwrite a finished build's state with CANCELLED after a cancel
    /// that lost the race to completion. Keeps the original finish date.
    pub fn mark_cancelled(&self, request_id: RequestId) -> Option<CiBuild> {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let id = *table.by_request.get(&request_id)?;
        let build = table.builds.get_mut(&id)?;
        let previous = build.state;
        if !previous.is_finished() {
            return None;
        }
        build.state = BuildState::Cancelled;
        tracing::info!(build_id = id, request_id = %request_id, %previous, "Finished build marked cancelled");
        Some(build.clone())
    }

    pub fn get_build(&self, build_id: i64) -> Option<CiBuild> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .builds
            .get(&build_id)
            .cloned()
    }

    pub fn find_by_request(&self, request_id: RequestId) -> Option<CiBuild> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        let id = table.by_request.get(&request_id)?;
        table.builds.get(id).cloned()
    }

    /// Most recent builds first.
    pub fn list_builds(&self, limit: usize) -> Vec<CiBuild> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .builds
            .values()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Drop a build whose activation did not commit.
    ///
    /// The owner's build number is handed back when no later build took one.
    pub fn discard_build(&self, build_id: i64) -> Option<CiBuild> {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let build = table.builds.remove(&build_id)?;
        table.by_request.remove(&build.request_id);
        if let Some(last) = table.numbers.get_mut(&build.owner) {
            if *last == build.number {
                *last -= 1;
            }
        }
        tracing::debug!(build_id, request_id = %build.request_id, "Build discarded");
        Some(build)
    }
}

impl ResultSink for BuildStore {
    fn create_build_result(&self, request: &BuildRequest) -> anyhow::Result<BuildResultHandle> {
        Ok(self.create_build(request).handle())
    }

    fn discard_build_result(&self, result: &BuildResultHandle) {
        self.discard_build(result.build_id);
    }
}
