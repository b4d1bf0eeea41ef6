//! Project registry and owner directory.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use chrono::Utc;

use ci_queue::{OwnerConfig, OwnerDirectory, OwnerId};

use crate::config::ProjectSeed;
use crate::models::project::{CiProject, NewCiProject};

#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error("project {0} already exists")]
    DuplicateId(i64),
    #[error("project name '{0}' is already taken")]
    DuplicateName(String),
    #[error("project name must not be empty")]
    EmptyName,
    #[error("project {0} not found")]
    NotFound(i64),
}

/// In-memory project table.
///
/// Projects are the build owners the platform knows about. Personal build
/// owners are users and are always admitted with the default configuration.
#[derive(Debug, Default)]
pub struct ProjectRegistry {
    projects: RwLock<BTreeMap<i64, CiProject>>,
}

impl ProjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seeds<'a>(seeds: impl IntoIterator<Item = &'a ProjectSeed>) -> Self {
        let registry = Self::new();
        for seed in seeds {
            let new_project = NewCiProject {
                id: Some(seed.id),
                concurrency_limit: seed.concurrency_limit,
                replaceable_default: seed.replaceable_default,
                ..NewCiProject::new(seed.name.clone())
            };
            if let Err(e) = registry.create_project(new_project) {
                tracing::warn!(project_id = seed.id, "Skipping seeded project: {e}");
            }
        }
        registry
    }

    /// List all projects, active or not, ordered by id.
    pub fn list_projects(&self) -> Vec<CiProject> {
        self.projects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn get_project(&self, id: i64) -> Option<CiProject> {
        self.projects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Create a new project.
    pub fn create_project(&self, new_project: NewCiProject) -> Result<CiProject, ProjectError> {
        let name = new_project.name.trim();
        if name.is_empty() {
            return Err(ProjectError::EmptyName);
        }

        let mut projects = self.projects.write().unwrap_or_else(PoisonError::into_inner);
        if projects.values().any(|project| project.name == name) {
            return Err(ProjectError::DuplicateName(name.to_string()));
        }
        let id = match new_project.id {
            Some(id) if projects.contains_key(&id) => return Err(ProjectError::DuplicateId(id)),
            Some(id) => id,
            None => projects.keys().next_back().map_or(1, |last| last + 1),
        };

        let project = CiProject {
            id,
            name: name.to_string(),
            concurrency_limit: new_project.concurrency_limit.max(1),
            replaceable_default: new_project.replaceable_default,
            active: true,
            create_date: Utc::now(),
        };
        projects.insert(id, project.clone());

        tracing::info!(project_id = id, name = %project.name, "Project created");
        Ok(project)
    }

    /// Enable or disable a project. Requests for disabled projects are rejected.
    pub fn set_active(&self, id: i64, active: bool) -> Result<CiProject, ProjectError> {
        let mut projects = self.projects.write().unwrap_or_else(PoisonError::into_inner);
        let project = projects.get_mut(&id).ok_or(ProjectError::NotFound(id))?;
        project.active = active;
        tracing::info!(project_id = id, active, "Project activity changed");
        Ok(project.clone())
    }

    /// Human-readable owner name for activity listings.
    pub fn owner_name(&self, owner: &OwnerId) -> String {
        match owner {
            OwnerId::Project(id) => self
                .get_project(*id)
                .map(|project| project.name)
                .unwrap_or_else(|| owner.to_string()),
            OwnerId::User(_) => owner.to_string(),
        }
    }
}

impl OwnerDirectory for ProjectRegistry {
    fn owner_config(&self, owner: &OwnerId) -> Option<OwnerConfig> {
        match owner {
            OwnerId::Project(id) => self.get_project(*id).map(|project| project.owner_config()),
            OwnerId::User(_) => Some(OwnerConfig::default()),
        }
    }
}
