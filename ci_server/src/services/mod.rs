//! CI server services — the collaborators the build queue runs against.

pub mod access_service;
pub mod build_service;
pub mod dispatcher;
pub mod project_service;
