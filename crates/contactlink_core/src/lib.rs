//! Core identity resolution logic for ContactLink.
//! This crate is the single source of truth for contact cluster invariants.

pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;

pub use config::{ConfigError, ResolverConfig};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::contact::{Contact, ContactId, ContactValidationError, LinkPrecedence, NewContact};
pub use repo::contact_repo::{ContactRepository, RepoError, RepoResult, SqliteContactRepository};
pub use service::cluster_lock::{ClusterKey, ClusterLockGuard, ClusterLocks, LockError};
pub use service::identity_service::{
    ConsolidatedView, IdentifyRequest, IdentityService, ResolveError, ResolveOutcome,
};

/// Minimal health-check API for early integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
