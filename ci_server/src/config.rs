//! CI server configuration — loaded from environment variables.

use ci_queue::{PolicyKind, QueueConfig, RaceResolution};

/// A project registered at startup, from `CI_PROJECTS`.
///
/// Entries are `id:name[:limit[:replaceable]]`, separated by commas.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProjectSeed {
    pub id: i64,
    pub name: String,
    pub concurrency_limit: usize,
    pub replaceable_default: bool,
}

#[derive(Clone, Debug)]
pub struct CiConfig {
    /// Maximum number of concurrently active builds across all owners (0 = no cap).
    pub max_concurrent_builds: usize,
    /// Seconds between periodic activation passes.
    pub activation_interval_secs: u64,
    /// Which activation policy governs per-owner concurrency.
    pub activation_policy: PolicyKind,
    /// Outcome when a cancel arrives after the build has already completed.
    pub race_resolution: RaceResolution,
    /// Start with activation paused.
    pub start_paused: bool,
    /// Actor names allowed to pause, resume and cancel everything.
    pub admins: Vec<String>,
    /// Projects registered at startup.
    pub projects: Vec<ProjectSeed>,
    /// Capacity of the queue event channel.
    pub event_capacity: usize,
    /// Longest a trigger call may wait for its request to be handled.
    pub max_trigger_wait_secs: u64,
}

impl CiConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let max_concurrent_builds = lookup("CI_MAX_CONCURRENT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let activation_interval_secs = lookup("CI_ACTIVATION_INTERVAL")
            .and_then(|s| s.parse().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(10);
        let activation_policy = lookup("CI_ACTIVATION_POLICY")
            .map(|s| {
                s.parse().unwrap_or_else(|e| {
                    tracing::warn!("Invalid CI_ACTIVATION_POLICY: {e} -- using one_per_owner");
                    PolicyKind::default()
                })
            })
            .unwrap_or_default();
        let race_resolution = lookup("CI_RACE_RESOLUTION")
            .map(|s| {
                s.parse().unwrap_or_else(|e| {
                    tracing::warn!("Invalid CI_RACE_RESOLUTION: {e} -- using cancel_wins");
                    RaceResolution::default()
                })
            })
            .unwrap_or_default();
        let start_paused = lookup("CI_START_PAUSED")
            .map(|s| matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        let admins: Vec<String> = lookup("CI_ADMINS")
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        let projects = lookup("CI_PROJECTS")
            .map(|s| parse_projects(&s))
            .unwrap_or_default();
        let event_capacity = lookup("CI_EVENT_CAPACITY")
            .and_then(|s| s.parse().ok())
            .filter(|capacity| *capacity > 0)
            .unwrap_or(256);
        let max_trigger_wait_secs = lookup("CI_MAX_TRIGGER_WAIT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(300);

        if admins.is_empty() {
            tracing::warn!("CI_ADMINS not set -- pause, resume and cancel-all are disabled");
        }
        if projects.is_empty() {
            tracing::warn!("CI_PROJECTS not set -- only personal builds can be queued until projects are created");
        }

        Self {
            max_concurrent_builds,
            activation_interval_secs,
            activation_policy,
            race_resolution,
            start_paused,
            admins,
            projects,
            event_capacity,
            max_trigger_wait_secs,
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_active: (self.max_concurrent_builds > 0).then_some(self.max_concurrent_builds),
            start_paused: self.start_paused,
            race_resolution: self.race_resolution,
        }
    }
}

fn parse_projects(raw: &str) -> Vec<ProjectSeed> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let seed = parse_project(entry);
            if seed.is_none() {
                tracing::warn!(entry, "Ignoring malformed CI_PROJECTS entry");
            }
            seed
        })
        .collect()
}

fn parse_project(entry: &str) -> Option<ProjectSeed> {
    let mut parts = entry.split(':').map(str::trim);
    let id = parts.next()?.parse().ok()?;
    let name = parts.next().filter(|name| !name.is_empty())?.to_string();
    let concurrency_limit = match parts.next() {
        Some(limit) => limit.parse().ok()?,
        None => 1,
    };
    let replaceable_default = match parts.next() {
        Some(flag) => flag.parse().ok()?,
        None => false,
    };
    if parts.next().is_some() {
        return None;
    }
    Some(ProjectSeed {
        id,
        name,
        concurrency_limit,
        replaceable_default,
    })
}
