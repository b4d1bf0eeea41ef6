//! ci.project — A registered project that build requests are queued for.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ci_queue::OwnerConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CiProject {
    pub id: i64,
    pub name: String,
    /// Active builds allowed at once under the `owner_limit` policy.
    pub concurrency_limit: usize,
    /// Whether requests that do not say otherwise may be superseded.
    pub replaceable_default: bool,
    pub active: bool,
    pub create_date: DateTime<Utc>,
}

impl CiProject {
    pub fn owner_config(&self) -> OwnerConfig {
        OwnerConfig {
            concurrency_limit: self.concurrency_limit,
            replaceable_default: self.replaceable_default,
            enabled: self.active,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewCiProject {
    /// Taken from the registry's sequence when absent.
    #[serde(default)]
    pub id: Option<i64>,
    pub name: String,
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    #[serde(default)]
    pub replaceable_default: bool,
}

fn default_concurrency_limit() -> usize {
    1
}

impl NewCiProject {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            concurrency_limit: default_concurrency_limit(),
            replaceable_default: false,
        }
    }
}
