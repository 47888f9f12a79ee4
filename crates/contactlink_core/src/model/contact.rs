//! Contact domain model.
//!
//! # Responsibility
//! - Define the stored contact row and the insert shape for new contacts.
//! - Validate identifier and linkage invariants before persistence.
//!
//! # Invariants
//! - At least one of `email` / `phone_number` is set.
//! - `linked_id` is set iff `link_precedence == Secondary`.
//! - A secondary never links to itself.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Store-assigned contact identifier. Monotonic in creation order.
pub type ContactId = i64;

/// Role of a contact inside its cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkPrecedence {
    /// Canonical, oldest contact of a cluster.
    Primary,
    /// Linked contact that references its cluster primary.
    Secondary,
}

/// Persisted contact row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: ContactId,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub link_precedence: LinkPrecedence,
    /// Meaningful only for secondaries; always the cluster primary id.
    pub linked_id: Option<ContactId>,
    /// Unix epoch milliseconds.
    pub created_at: i64,
    /// Unix epoch milliseconds, bumped on linkage rewrites.
    pub updated_at: i64,
    /// Soft delete marker. Deleted rows are invisible to resolution.
    pub deleted_at: Option<i64>,
}

/// Insert shape for a contact before the store assigns id and timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewContact {
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub link_precedence: LinkPrecedence,
    pub linked_id: Option<ContactId>,
}

/// Contact invariant violations detected before persistence or after load.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContactValidationError {
    #[error("contact must carry an email or a phone number")]
    MissingIdentifier,
    #[error("primary contact must not link to another contact (linked_id={0})")]
    PrimaryWithLink(ContactId),
    #[error("secondary contact must link to its primary")]
    SecondaryWithoutLink,
    #[error("contact {0} cannot link to itself")]
    SelfLink(ContactId),
}

impl Contact {
    /// Returns whether this contact is the canonical record of its cluster.
    pub fn is_primary(&self) -> bool {
        self.link_precedence == LinkPrecedence::Primary
    }

    /// Returns the id of the primary this contact belongs to.
    ///
    /// A primary resolves to itself; a secondary to its `linked_id`.
    pub fn primary_id(&self) -> ContactId {
        match (self.link_precedence, self.linked_id) {
            (LinkPrecedence::Secondary, Some(linked_id)) => linked_id,
            _ => self.id,
        }
    }

    /// Returns whether this contact should be visible to resolution.
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Validates identifier presence and linkage shape.
    pub fn validate(&self) -> Result<(), ContactValidationError> {
        validate_identifiers(self.email.as_deref(), self.phone_number.as_deref())?;
        validate_linkage(Some(self.id), self.link_precedence, self.linked_id)
    }
}

impl NewContact {
    /// Insert shape for a brand-new cluster.
    pub fn primary(email: Option<String>, phone_number: Option<String>) -> Self {
        Self {
            email,
            phone_number,
            link_precedence: LinkPrecedence::Primary,
            linked_id: None,
        }
    }

    /// Insert shape for new information attached to an existing cluster.
    pub fn secondary(
        email: Option<String>,
        phone_number: Option<String>,
        primary_id: ContactId,
    ) -> Self {
        Self {
            email,
            phone_number,
            link_precedence: LinkPrecedence::Secondary,
            linked_id: Some(primary_id),
        }
    }

    pub fn validate(&self) -> Result<(), ContactValidationError> {
        validate_identifiers(self.email.as_deref(), self.phone_number.as_deref())?;
        validate_linkage(None, self.link_precedence, self.linked_id)
    }
}

/// Validates a precedence / linked-id pair for a row with optional known id.
pub fn validate_linkage(
    id: Option<ContactId>,
    link_precedence: LinkPrecedence,
    linked_id: Option<ContactId>,
) -> Result<(), ContactValidationError> {
    match (link_precedence, linked_id) {
        (LinkPrecedence::Primary, Some(linked_id)) => {
            Err(ContactValidationError::PrimaryWithLink(linked_id))
        }
        (LinkPrecedence::Secondary, None) => Err(ContactValidationError::SecondaryWithoutLink),
        (LinkPrecedence::Secondary, Some(linked_id)) if Some(linked_id) == id => {
            Err(ContactValidationError::SelfLink(linked_id))
        }
        _ => Ok(()),
    }
}

fn validate_identifiers(
    email: Option<&str>,
    phone_number: Option<&str>,
) -> Result<(), ContactValidationError> {
    if email.is_none() && phone_number.is_none() {
        return Err(ContactValidationError::MissingIdentifier);
    }
    Ok(())
}
