//! ci.build — The build record created when a request is activated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ci_queue::{BuildResultHandle, OwnerId, RequestId, Revision};

#[derive(Debug, Clone, Serialize)]
pub struct CiBuild {
    pub id: i64,
    pub request_id: RequestId,
    pub owner: OwnerId,
    /// Sequential per owner, starting at 1.
    pub number: i64,
    pub state: BuildState,
    pub revision: Revision,
    pub reason: String,
    pub create_date: DateTime<Utc>,
    pub finish_date: Option<DateTime<Utc>>,
}

impl CiBuild {
    pub fn handle(&self) -> BuildResultHandle {
        BuildResultHandle::new(self.id, self.number)
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.finish_date
            .map(|finished| (finished - self.create_date).num_milliseconds())
    }
}

/// Build state: running -> success | failure | error | cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Running,
    Success,
    Failure,
    Error,
    Cancelled,
}

impl BuildState {
    pub fn is_finished(self) -> bool {
        !matches!(self, BuildState::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BuildState::Running => "running",
            BuildState::Success => "success",
            BuildState::Failure => "failure",
            BuildState::Error => "error",
            BuildState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for BuildState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
