//! Repository layer abstractions and persistence implementations.
//!
//! # Responsibility
//! - Define the point-lookup contract the identity resolver depends on.
//! - Isolate SQLite query details from resolver orchestration.
//!
//! # Invariants
//! - Repository writes enforce contact validation before persistence.
//! - Soft-deleted rows never leave the repository through resolver lookups.

pub mod contact_repo;
