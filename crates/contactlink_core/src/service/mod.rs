//! Core use-case services.
//!
//! # Responsibility
//! - Orchestrate repository calls into the identity resolution use case.
//! - Keep CLI/transport layers decoupled from storage details.

pub mod cluster_lock;
pub mod identity_service;
