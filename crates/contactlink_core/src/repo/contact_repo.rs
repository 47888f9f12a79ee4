//! Contact repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Provide the four resolver lookups/writes over canonical `contacts` storage.
//! - Scope a multi-statement sequence to one SQLite transaction.
//!
//! # Invariants
//! - Cluster loads are ordered `created_at ASC, id ASC`.
//! - Only rows with `deleted_at IS NULL` are returned by resolver lookups.
//! - Read paths reject invalid persisted state instead of masking it.

use crate::db::migrations::latest_version;
use crate::db::DbError;
use crate::model::contact::{
    validate_linkage, Contact, ContactId, ContactValidationError, LinkPrecedence, NewContact,
};
use log::warn;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row, Transaction, TransactionBehavior};
use std::collections::BTreeSet;
use thiserror::Error;

const CONTACT_SELECT_SQL: &str = "SELECT
    id,
    email,
    phone_number,
    link_precedence,
    linked_id,
    created_at,
    updated_at,
    deleted_at
FROM contacts";

const REQUIRED_COLUMNS: &[&str] = &[
    "id",
    "email",
    "phone_number",
    "link_precedence",
    "linked_id",
    "created_at",
    "updated_at",
    "deleted_at",
];

pub type RepoResult<T> = Result<T, RepoError>;

/// Repository error for contact persistence and query operations.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error(transparent)]
    Validation(#[from] ContactValidationError),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("contact not found: {0}")]
    NotFound(ContactId),
    #[error("contact {0} still has active secondaries")]
    HasActiveSecondaries(ContactId),
    #[error("invalid persisted contact data: {0}")]
    InvalidData(String),
    #[error("contact repository requires schema version {expected_version}, got {actual_version}")]
    UninitializedConnection {
        expected_version: u32,
        actual_version: u32,
    },
    #[error("contact repository requires column `{0}` in table `contacts`")]
    MissingRequiredColumn(&'static str),
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Store contract consumed by the identity resolver.
pub trait ContactRepository {
    /// Active contacts whose email equals `email` OR whose phone equals `phone`.
    ///
    /// An absent identifier contributes no rows.
    fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> RepoResult<Vec<Contact>>;

    /// Active contacts whose id is in `ids` or whose `linked_id` is in `ids`,
    /// ordered oldest first.
    fn find_by_ids_or_linked_to(&self, ids: &BTreeSet<ContactId>) -> RepoResult<Vec<Contact>>;

    fn create_contact(&self, contact: &NewContact) -> RepoResult<Contact>;

    fn update_linkage(
        &self,
        id: ContactId,
        link_precedence: LinkPrecedence,
        linked_id: Option<ContactId>,
    ) -> RepoResult<()>;

    fn get_contact(&self, id: ContactId, include_deleted: bool) -> RepoResult<Option<Contact>>;

    /// Marks one contact deleted. Refuses a contact that active rows still
    /// link to; re-link those first.
    fn soft_delete_contact(&self, id: ContactId) -> RepoResult<()>;

    /// Runs `op` as one atomic unit: committed on `Ok`, rolled back on `Err`.
    fn run_atomic<T, E, F>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce(&Self) -> Result<T, E>,
        E: From<RepoError>;
}

/// SQLite-backed contact repository.
pub struct SqliteContactRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteContactRepository<'conn> {
    /// Creates repository from a migrated connection.
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        ensure_contact_connection_ready(conn)?;
        Ok(Self { conn })
    }
}

impl ContactRepository for SqliteContactRepository<'_> {
    fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> RepoResult<Vec<Contact>> {
        let mut clauses = Vec::new();
        let mut bind_values: Vec<Value> = Vec::new();

        if let Some(email) = email {
            clauses.push("email = ?");
            bind_values.push(Value::Text(email.to_string()));
        }
        if let Some(phone_number) = phone_number {
            clauses.push("phone_number = ?");
            bind_values.push(Value::Text(phone_number.to_string()));
        }
        if clauses.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "{CONTACT_SELECT_SQL}
             WHERE deleted_at IS NULL
               AND ({})
             ORDER BY created_at ASC, id ASC;",
            clauses.join(" OR ")
        );
        query_contacts(self.conn, &sql, bind_values)
    }

    fn find_by_ids_or_linked_to(&self, ids: &BTreeSet<ContactId>) -> RepoResult<Vec<Contact>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        // Numbered placeholders are reused by both IN lists.
        let placeholders = (1..=ids.len())
            .map(|index| format!("?{index}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "{CONTACT_SELECT_SQL}
             WHERE deleted_at IS NULL
               AND (id IN ({placeholders}) OR linked_id IN ({placeholders}))
             ORDER BY created_at ASC, id ASC;"
        );
        let bind_values = ids.iter().map(|id| Value::Integer(*id)).collect();
        query_contacts(self.conn, &sql, bind_values)
    }

    fn create_contact(&self, contact: &NewContact) -> RepoResult<Contact> {
        contact.validate()?;

        self.conn.execute(
            "INSERT INTO contacts (
                email,
                phone_number,
                link_precedence,
                linked_id
            ) VALUES (?1, ?2, ?3, ?4);",
            params![
                contact.email.as_deref(),
                contact.phone_number.as_deref(),
                link_precedence_to_db(contact.link_precedence),
                contact.linked_id,
            ],
        )?;

        let id = self.conn.last_insert_rowid();
        self.get_contact(id, false)?.ok_or(RepoError::NotFound(id))
    }

    fn update_linkage(
        &self,
        id: ContactId,
        link_precedence: LinkPrecedence,
        linked_id: Option<ContactId>,
    ) -> RepoResult<()> {
        validate_linkage(Some(id), link_precedence, linked_id)?;

        let changed = self.conn.execute(
            "UPDATE contacts
             SET
                link_precedence = ?2,
                linked_id = ?3,
                updated_at = CAST((julianday('now') - 2440587.5) * 86400000 AS INTEGER)
             WHERE id = ?1
               AND deleted_at IS NULL;",
            params![id, link_precedence_to_db(link_precedence), linked_id],
        )?;

        if changed == 0 {
            return Err(RepoError::NotFound(id));
        }

        Ok(())
    }

    fn get_contact(&self, id: ContactId, include_deleted: bool) -> RepoResult<Option<Contact>> {
        let mut stmt = self.conn.prepare(&format!(
            "{CONTACT_SELECT_SQL}
             WHERE id = ?1
               AND (?2 = 1 OR deleted_at IS NULL);"
        ))?;

        let mut rows = stmt.query(params![id, i64::from(include_deleted)])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_contact_row(row)?));
        }

        Ok(None)
    }

    fn soft_delete_contact(&self, id: ContactId) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE contacts
             SET
                deleted_at = CAST((julianday('now') - 2440587.5) * 86400000 AS INTEGER),
                updated_at = CAST((julianday('now') - 2440587.5) * 86400000 AS INTEGER)
             WHERE id = ?1
               AND deleted_at IS NULL
               AND NOT EXISTS (
                   SELECT 1 FROM contacts AS member
                   WHERE member.linked_id = ?1
                     AND member.deleted_at IS NULL
               );",
            [id],
        )?;

        if changed == 0 {
            return match self.get_contact(id, false)? {
                Some(_) => Err(RepoError::HasActiveSecondaries(id)),
                None => Err(RepoError::NotFound(id)),
            };
        }

        Ok(())
    }

    fn run_atomic<T, E, F>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce(&Self) -> Result<T, E>,
        E: From<RepoError>,
    {
        // IMMEDIATE takes the write lock up front, so a read-then-write sequence
        // never fails on lock upgrade.
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)
            .map_err(RepoError::from)?;

        match op(self) {
            Ok(value) => {
                tx.commit().map_err(RepoError::from)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback() {
                    warn!(
                        "event=tx_rollback module=repo status=error error={}",
                        rollback_err
                    );
                }
                Err(err)
            }
        }
    }
}

fn query_contacts(
    conn: &Connection,
    sql: &str,
    bind_values: Vec<Value>,
) -> RepoResult<Vec<Contact>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params_from_iter(bind_values))?;
    let mut contacts = Vec::new();

    while let Some(row) = rows.next()? {
        contacts.push(parse_contact_row(row)?);
    }

    Ok(contacts)
}

fn parse_contact_row(row: &Row<'_>) -> RepoResult<Contact> {
    let precedence_text: String = row.get("link_precedence")?;
    let link_precedence = parse_link_precedence(&precedence_text).ok_or_else(|| {
        RepoError::InvalidData(format!(
            "invalid link precedence `{precedence_text}` in contacts.link_precedence"
        ))
    })?;

    let contact = Contact {
        id: row.get("id")?,
        email: row.get("email")?,
        phone_number: row.get("phone_number")?,
        link_precedence,
        linked_id: row.get("linked_id")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        deleted_at: row.get("deleted_at")?,
    };
    contact
        .validate()
        .map_err(|err| RepoError::InvalidData(format!("contact {}: {err}", contact.id)))?;
    Ok(contact)
}

fn link_precedence_to_db(value: LinkPrecedence) -> &'static str {
    match value {
        LinkPrecedence::Primary => "primary",
        LinkPrecedence::Secondary => "secondary",
    }
}

fn parse_link_precedence(value: &str) -> Option<LinkPrecedence> {
    match value {
        "primary" => Some(LinkPrecedence::Primary),
        "secondary" => Some(LinkPrecedence::Secondary),
        _ => None,
    }
}

fn ensure_contact_connection_ready(conn: &Connection) -> RepoResult<()> {
    let expected_version = latest_version();
    let actual_version: u32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    if actual_version != expected_version {
        return Err(RepoError::UninitializedConnection {
            expected_version,
            actual_version,
        });
    }

    let mut stmt = conn.prepare("PRAGMA table_info(contacts);")?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    for column in REQUIRED_COLUMNS {
        if !columns.iter().any(|existing| existing == column) {
            return Err(RepoError::MissingRequiredColumn(column));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{parse_link_precedence, ContactRepository, SqliteContactRepository};
    use crate::db::open_db_in_memory;
    use crate::model::contact::{LinkPrecedence, NewContact};
    use rusqlite::Connection;

    #[test]
    fn link_precedence_text_is_closed() {
        assert_eq!(parse_link_precedence("primary"), Some(LinkPrecedence::Primary));
        assert_eq!(parse_link_precedence("Primary"), None);
    }

    #[test]
    fn try_new_rejects_unmigrated_connection() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(SqliteContactRepository::try_new(&conn).is_err());
    }

    #[test]
    fn absent_identifiers_match_nothing() {
        let conn = open_db_in_memory().unwrap();
        let repo = SqliteContactRepository::try_new(&conn).unwrap();
        repo.create_contact(&NewContact::primary(Some("a@x.io".into()), None))
            .unwrap();

        assert!(repo.find_by_email_or_phone(None, None).unwrap().is_empty());
    }
}
