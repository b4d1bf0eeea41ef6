//! CI server data models.

pub mod build;
pub mod project;
