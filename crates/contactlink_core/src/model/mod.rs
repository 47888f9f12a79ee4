//! Domain model for contact identity clusters.
//!
//! # Responsibility
//! - Define the canonical contact record used by resolver logic.
//! - Keep link precedence a closed Rust enum instead of free-form text.
//!
//! # Invariants
//! - Every contact carries at least one identifier.
//! - Deletion is represented by a soft-delete marker, not hard delete.

pub mod contact;
