//! Identity resolution use-case service.
//!
//! # Responsibility
//! - Resolve a partial `(email, phone)` observation into one contact cluster.
//! - Merge clusters that the observation proves to be the same identity.
//! - Record new information as a secondary contact of the surviving primary.
//!
//! # Invariants
//! - After a successful call every implicated contact links directly to the
//!   oldest implicated primary (no chains, one primary per cluster).
//! - All reads and writes of one attempt share one transaction; a failed
//!   attempt leaves the previous cluster state intact.
//! - Calls touching overlapping clusters are serialized through `ClusterLocks`;
//!   disjoint clusters proceed in parallel.
//! - Identifier values never reach logs; only ids and counts do.

use crate::config::ResolverConfig;
use crate::model::contact::{Contact, ContactId, LinkPrecedence, NewContact};
use crate::repo::contact_repo::{ContactRepository, RepoError};
use crate::service::cluster_lock::{ClusterKey, ClusterLocks};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Caller observation. Empty strings count as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
}

impl IdentifyRequest {
    pub fn new(email: Option<&str>, phone_number: Option<&str>) -> Self {
        Self {
            email: email.map(str::to_string),
            phone_number: phone_number.map(str::to_string),
        }
    }
}

/// De-duplicated, ordered summary of one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidatedView {
    pub primary_contact_id: ContactId,
    /// Primary email first, then first-seen order across the cluster.
    pub emails: Vec<String>,
    /// Primary phone first, then first-seen order across the cluster.
    pub phone_numbers: Vec<String>,
    /// Every non-primary member, oldest first.
    pub secondary_contact_ids: Vec<ContactId>,
}

/// What one resolve call changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveOutcome {
    pub created_primary: bool,
    pub demoted_primaries: usize,
    pub repointed_secondaries: usize,
    pub created_secondary: bool,
    /// Attempts used, including the successful one.
    pub attempts: u32,
}

impl ResolveOutcome {
    /// Number of rows inserted or updated.
    pub fn write_count(&self) -> usize {
        usize::from(self.created_primary)
            + self.demoted_primaries
            + self.repointed_secondaries
            + usize::from(self.created_secondary)
    }
}

/// Errors from identity resolution.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("either email or phoneNumber must be provided")]
    InvalidInput,
    #[error("contact store unavailable: {0}")]
    StoreUnavailable(#[from] RepoError),
    #[error("contact cluster kept changing; gave up after {attempts} attempt(s)")]
    ConcurrentClusterConflict { attempts: u32 },
    #[error("contact not found: {0}")]
    ContactNotFound(ContactId),
    #[error("inconsistent contact cluster: {0}")]
    InconsistentCluster(String),
}

/// Non-empty identifiers; at least one is present.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Observation {
    email: Option<String>,
    phone_number: Option<String>,
}

enum Attempt<T> {
    Done(T),
    /// The cluster changed between lookup and lock, or the lock timed out.
    Stale,
}

/// Identity resolver facade over a contact repository.
pub struct IdentityService<R: ContactRepository> {
    repo: R,
    locks: Arc<ClusterLocks>,
    config: ResolverConfig,
}

impl<R: ContactRepository> IdentityService<R> {
    /// Creates a service with a private lock table and default config.
    ///
    /// Use [`IdentityService::with_locks`] when several services write to the
    /// same database concurrently.
    pub fn new(repo: R) -> Self {
        Self::with_locks(repo, Arc::new(ClusterLocks::new()), ResolverConfig::default())
    }

    pub fn with_locks(repo: R, locks: Arc<ClusterLocks>, config: ResolverConfig) -> Self {
        Self {
            repo,
            locks,
            config,
        }
    }

    /// Resolves an observation into its consolidated cluster view.
    pub fn resolve(&self, request: &IdentifyRequest) -> Result<ConsolidatedView, ResolveError> {
        self.resolve_with_outcome(request).map(|(view, _)| view)
    }

    /// Resolves an observation and reports the writes it performed.
    ///
    /// # Errors
    /// - `InvalidInput` when neither identifier is present and non-empty.
    /// - `StoreUnavailable` for any repository failure; not retried.
    /// - `ConcurrentClusterConflict` when every attempt either failed
    ///   re-validation or timed out waiting for the cluster lock.
    /// - `InconsistentCluster` when persisted linkage is broken.
    pub fn resolve_with_outcome(
        &self,
        request: &IdentifyRequest,
    ) -> Result<(ConsolidatedView, ResolveOutcome), ResolveError> {
        let observation = normalize_request(request)?;
        let started_at = Instant::now();

        for attempt in 1..=self.config.max_attempts {
            let result = self.attempt_resolve(&observation, attempt);
            match result {
                Ok(Attempt::Done((view, mut outcome))) => {
                    outcome.attempts = attempt;
                    info!(
                        "event=contact_resolve module=service status=ok primary_id={} cluster_size={} attempts={} created_primary={} demoted_primaries={} repointed_secondaries={} created_secondary={} duration_ms={}",
                        view.primary_contact_id,
                        view.secondary_contact_ids.len() + 1,
                        attempt,
                        outcome.created_primary,
                        outcome.demoted_primaries,
                        outcome.repointed_secondaries,
                        outcome.created_secondary,
                        started_at.elapsed().as_millis()
                    );
                    return Ok((view, outcome));
                }
                Ok(Attempt::Stale) => {
                    debug!(
                        "event=contact_resolve module=service status=retry attempt={}",
                        attempt
                    );
                }
                Err(err) => {
                    warn!(
                        "event=contact_resolve module=service status=error attempt={} duration_ms={} error={}",
                        attempt,
                        started_at.elapsed().as_millis(),
                        err
                    );
                    return Err(err);
                }
            }
        }

        warn!(
            "event=contact_resolve module=service status=error error_code=cluster_conflict attempts={} duration_ms={}",
            self.config.max_attempts,
            started_at.elapsed().as_millis()
        );
        Err(ResolveError::ConcurrentClusterConflict {
            attempts: self.config.max_attempts,
        })
    }

    /// Returns the view of the cluster containing `contact_id` without writing.
    pub fn consolidated_view(
        &self,
        contact_id: ContactId,
    ) -> Result<ConsolidatedView, ResolveError> {
        let primary_id = load_active(&self.repo, contact_id)?.primary_id();
        let cluster = self
            .repo
            .find_by_ids_or_linked_to(&BTreeSet::from([primary_id]))?;
        build_view(primary_id, &cluster)
    }

    /// Soft-deletes one contact without orphaning the rest of its cluster.
    ///
    /// Removing a primary promotes its oldest live secondary and re-points the
    /// other members at it in the same transaction. Returns the promoted id.
    ///
    /// # Errors
    /// - `ContactNotFound` for an unknown or already deleted id.
    /// - `ConcurrentClusterConflict` when the cluster kept changing.
    pub fn remove_contact(
        &self,
        contact_id: ContactId,
    ) -> Result<Option<ContactId>, ResolveError> {
        for attempt in 1..=self.config.max_attempts {
            match self.attempt_remove(contact_id, attempt)? {
                Attempt::Done(promoted) => {
                    info!(
                        "event=contact_remove module=service status=ok contact_id={} promoted_id={:?} attempts={}",
                        contact_id, promoted, attempt
                    );
                    return Ok(promoted);
                }
                Attempt::Stale => {
                    debug!(
                        "event=contact_remove module=service status=retry attempt={}",
                        attempt
                    );
                }
            }
        }

        warn!(
            "event=contact_remove module=service status=error error_code=cluster_conflict attempts={}",
            self.config.max_attempts
        );
        Err(ResolveError::ConcurrentClusterConflict {
            attempts: self.config.max_attempts,
        })
    }

    fn attempt_remove(
        &self,
        contact_id: ContactId,
        attempt: u32,
    ) -> Result<Attempt<Option<ContactId>>, ResolveError> {
        let primary_id = load_active(&self.repo, contact_id)?.primary_id();

        let _guard = match self.locks.acquire(
            BTreeSet::from([ClusterKey::Primary(primary_id)]),
            self.config.lock_timeout,
        ) {
            Ok(guard) => guard,
            Err(err) => {
                debug!(
                    "event=cluster_lock module=service status=timeout attempt={} error={}",
                    attempt, err
                );
                return Ok(Attempt::Stale);
            }
        };

        self.repo
            .run_atomic(|repo| -> Result<Attempt<Option<ContactId>>, ResolveError> {
                let contact = load_active(repo, contact_id)?;
                if contact.primary_id() != primary_id {
                    return Ok(Attempt::Stale);
                }

                let promoted = if contact.is_primary() {
                    promote_successor(repo, contact.id)?
                } else {
                    None
                };
                repo.soft_delete_contact(contact.id)?;
                Ok(Attempt::Done(promoted))
            })
    }

    fn attempt_resolve(
        &self,
        observation: &Observation,
        attempt: u32,
    ) -> Result<Attempt<(ConsolidatedView, ResolveOutcome)>, ResolveError> {
        let matched = self.repo.find_by_email_or_phone(
            observation.email.as_deref(),
            observation.phone_number.as_deref(),
        )?;
        let primary_ids = implicated_primary_ids(&matched);

        let _guard = match self
            .locks
            .acquire(lock_keys(observation, &primary_ids), self.config.lock_timeout)
        {
            Ok(guard) => guard,
            Err(err) => {
                debug!(
                    "event=cluster_lock module=service status=timeout attempt={} error={}",
                    attempt, err
                );
                return Ok(Attempt::Stale);
            }
        };

        self.repo.run_atomic(
            |repo| -> Result<Attempt<(ConsolidatedView, ResolveOutcome)>, ResolveError> {
                let matched = repo.find_by_email_or_phone(
                    observation.email.as_deref(),
                    observation.phone_number.as_deref(),
                )?;
                if implicated_primary_ids(&matched) != primary_ids {
                    return Ok(Attempt::Stale);
                }

                if matched.is_empty() {
                    let created = repo.create_contact(&NewContact::primary(
                        observation.email.clone(),
                        observation.phone_number.clone(),
                    ))?;
                    let view = build_view(created.id, std::slice::from_ref(&created))?;
                    let outcome = ResolveOutcome {
                        created_primary: true,
                        ..ResolveOutcome::default()
                    };
                    return Ok(Attempt::Done((view, outcome)));
                }

                let (view, outcome) = merge_and_extend(repo, observation, &primary_ids)?;
                Ok(Attempt::Done((view, outcome)))
            },
        )
    }
}

/// Merges every implicated cluster into the oldest primary, records new
/// information, and builds the final view. Runs inside the attempt transaction.
fn merge_and_extend<R: ContactRepository>(
    repo: &R,
    observation: &Observation,
    primary_ids: &BTreeSet<ContactId>,
) -> Result<(ConsolidatedView, ResolveOutcome), ResolveError> {
    let mut outcome = ResolveOutcome::default();
    let loaded = repo.find_by_ids_or_linked_to(primary_ids)?;

    let survivor_id = loaded
        .iter()
        .find(|contact| contact.is_primary())
        .map(|contact| contact.id)
        .ok_or_else(|| {
            ResolveError::InconsistentCluster(format!(
                "no primary among implicated ids {primary_ids:?}"
            ))
        })?;

    for contact in &loaded {
        if contact.id == survivor_id {
            continue;
        }
        if contact.is_primary() {
            repo.update_linkage(contact.id, LinkPrecedence::Secondary, Some(survivor_id))?;
            outcome.demoted_primaries += 1;
        } else if contact.linked_id != Some(survivor_id) {
            repo.update_linkage(contact.id, LinkPrecedence::Secondary, Some(survivor_id))?;
            outcome.repointed_secondaries += 1;
        }
    }

    let survivor_set = BTreeSet::from([survivor_id]);
    let mut cluster = repo.find_by_ids_or_linked_to(&survivor_set)?;

    if carries_new_information(observation, &cluster) {
        repo.create_contact(&NewContact::secondary(
            observation.email.clone(),
            observation.phone_number.clone(),
            survivor_id,
        ))?;
        outcome.created_secondary = true;
        cluster = repo.find_by_ids_or_linked_to(&survivor_set)?;
    }

    let view = build_view(survivor_id, &cluster)?;
    Ok((view, outcome))
}

/// Makes the oldest live secondary of `primary_id` the new primary and links
/// every other live member to it.
fn promote_successor<R: ContactRepository>(
    repo: &R,
    primary_id: ContactId,
) -> Result<Option<ContactId>, ResolveError> {
    let members = repo.find_by_ids_or_linked_to(&BTreeSet::from([primary_id]))?;
    let mut rest = members.iter().filter(|member| member.id != primary_id);
    let Some(successor) = rest.next() else {
        return Ok(None);
    };

    repo.update_linkage(successor.id, LinkPrecedence::Primary, None)?;
    for member in rest {
        repo.update_linkage(member.id, LinkPrecedence::Secondary, Some(successor.id))?;
    }
    Ok(Some(successor.id))
}

fn load_active<R: ContactRepository>(
    repo: &R,
    contact_id: ContactId,
) -> Result<Contact, ResolveError> {
    repo.get_contact(contact_id, true)?
        .filter(Contact::is_active)
        .ok_or(ResolveError::ContactNotFound(contact_id))
}

fn normalize_request(request: &IdentifyRequest) -> Result<Observation, ResolveError> {
    let observation = Observation {
        email: normalize_identifier(request.email.as_deref()),
        phone_number: normalize_identifier(request.phone_number.as_deref()),
    };
    if observation.email.is_none() && observation.phone_number.is_none() {
        return Err(ResolveError::InvalidInput);
    }
    Ok(observation)
}

fn normalize_identifier(value: Option<&str>) -> Option<String> {
    value.filter(|raw| !raw.is_empty()).map(str::to_string)
}

fn implicated_primary_ids(matched: &[Contact]) -> BTreeSet<ContactId> {
    matched.iter().map(Contact::primary_id).collect()
}

fn lock_keys(
    observation: &Observation,
    primary_ids: &BTreeSet<ContactId>,
) -> BTreeSet<ClusterKey> {
    let mut keys = primary_ids
        .iter()
        .map(|id| ClusterKey::Primary(*id))
        .collect::<BTreeSet<_>>();
    if let Some(email) = &observation.email {
        keys.insert(ClusterKey::Email(email.clone()));
    }
    if let Some(phone_number) = &observation.phone_number {
        keys.insert(ClusterKey::Phone(phone_number.clone()));
    }
    keys
}

fn carries_new_information(observation: &Observation, cluster: &[Contact]) -> bool {
    let email_is_new = observation.email.as_deref().is_some_and(|email| {
        !cluster
            .iter()
            .any(|contact| contact.email.as_deref() == Some(email))
    });
    let phone_is_new = observation.phone_number.as_deref().is_some_and(|phone| {
        !cluster
            .iter()
            .any(|contact| contact.phone_number.as_deref() == Some(phone))
    });
    email_is_new || phone_is_new
}

/// Builds the consolidated view from an oldest-first cluster snapshot.
fn build_view(
    primary_id: ContactId,
    cluster: &[Contact],
) -> Result<ConsolidatedView, ResolveError> {
    let primary = cluster
        .iter()
        .find(|contact| contact.id == primary_id && contact.is_primary())
        .ok_or_else(|| {
            ResolveError::InconsistentCluster(format!("primary {primary_id} missing from cluster"))
        })?;

    let mut view = ConsolidatedView {
        primary_contact_id: primary.id,
        emails: Vec::new(),
        phone_numbers: Vec::new(),
        secondary_contact_ids: Vec::new(),
    };
    let mut seen_emails = HashSet::new();
    let mut seen_phones = HashSet::new();

    push_unseen(&mut view.emails, &mut seen_emails, primary.email.as_deref());
    push_unseen(
        &mut view.phone_numbers,
        &mut seen_phones,
        primary.phone_number.as_deref(),
    );

    for contact in cluster.iter().filter(|contact| contact.id != primary.id) {
        view.secondary_contact_ids.push(contact.id);
        push_unseen(&mut view.emails, &mut seen_emails, contact.email.as_deref());
        push_unseen(
            &mut view.phone_numbers,
            &mut seen_phones,
            contact.phone_number.as_deref(),
        );
    }

    Ok(view)
}

fn push_unseen<'a>(
    target: &mut Vec<String>,
    seen: &mut HashSet<&'a str>,
    value: Option<&'a str>,
) {
    if let Some(value) = value {
        if seen.insert(value) {
            target.push(value.to_string());
        }
    }
}
