use contactlink_core::db::open_db_in_memory;
use contactlink_core::{
    ContactRepository, ContactValidationError, LinkPrecedence, NewContact, RepoError,
    SqliteContactRepository,
};
use rusqlite::Connection;
use std::collections::BTreeSet;

fn primary(repo: &SqliteContactRepository<'_>, email: Option<&str>, phone: Option<&str>) -> i64 {
    repo.create_contact(&NewContact::primary(
        email.map(str::to_string),
        phone.map(str::to_string),
    ))
    .unwrap()
    .id
}

fn secondary(
    repo: &SqliteContactRepository<'_>,
    email: Option<&str>,
    phone: Option<&str>,
    primary_id: i64,
) -> i64 {
    repo.create_contact(&NewContact::secondary(
        email.map(str::to_string),
        phone.map(str::to_string),
        primary_id,
    ))
    .unwrap()
    .id
}

fn set_created_at(conn: &Connection, id: i64, created_at: i64) {
    conn.execute(
        "UPDATE contacts SET created_at = ?2 WHERE id = ?1;",
        [id, created_at],
    )
    .unwrap();
}

#[test]
fn create_assigns_monotonic_ids_and_timestamps() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteContactRepository::try_new(&conn).unwrap();

    let first = repo
        .create_contact(&NewContact::primary(Some("a@x.io".into()), None))
        .unwrap();
    let second = repo
        .create_contact(&NewContact::primary(None, Some("555".into())))
        .unwrap();

    assert!(second.id > first.id);
    assert!(first.created_at > 0);
    assert_eq!(first.link_precedence, LinkPrecedence::Primary);
    assert_eq!(first.linked_id, None);
    assert_eq!(first.deleted_at, None);
}

#[test]
fn create_rejects_invalid_shapes_before_sql() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteContactRepository::try_new(&conn).unwrap();

    let err = repo
        .create_contact(&NewContact::primary(None, None))
        .unwrap_err();
    assert!(matches!(
        err,
        RepoError::Validation(ContactValidationError::MissingIdentifier)
    ));

    let mut orphan = NewContact::secondary(Some("a@x.io".into()), None, 1);
    orphan.linked_id = None;
    assert!(matches!(
        repo.create_contact(&orphan).unwrap_err(),
        RepoError::Validation(ContactValidationError::SecondaryWithoutLink)
    ));
}

#[test]
fn find_by_email_or_phone_matches_either_field() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteContactRepository::try_new(&conn).unwrap();
    let by_email = primary(&repo, Some("a@x.io"), Some("111"));
    let by_phone = primary(&repo, Some("b@x.io"), Some("222"));
    primary(&repo, Some("c@x.io"), Some("333"));

    let found = repo
        .find_by_email_or_phone(Some("a@x.io"), Some("222"))
        .unwrap();
    let ids = found.iter().map(|contact| contact.id).collect::<Vec<_>>();
    assert_eq!(ids, vec![by_email, by_phone]);

    let phone_only = repo.find_by_email_or_phone(None, Some("111")).unwrap();
    assert_eq!(phone_only.len(), 1);
    assert_eq!(phone_only[0].id, by_email);
}

#[test]
fn find_by_ids_or_linked_to_orders_oldest_first_with_id_tiebreak() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteContactRepository::try_new(&conn).unwrap();
    let root = primary(&repo, Some("a@x.io"), None);
    let late = secondary(&repo, Some("b@x.io"), None, root);
    let tie_low = secondary(&repo, Some("c@x.io"), None, root);
    let tie_high = secondary(&repo, Some("d@x.io"), None, root);
    let unrelated = primary(&repo, Some("z@x.io"), None);

    set_created_at(&conn, root, 1_000);
    set_created_at(&conn, late, 5_000);
    set_created_at(&conn, tie_low, 2_000);
    set_created_at(&conn, tie_high, 2_000);

    let cluster = repo
        .find_by_ids_or_linked_to(&BTreeSet::from([root]))
        .unwrap();
    let ids = cluster.iter().map(|contact| contact.id).collect::<Vec<_>>();
    assert_eq!(ids, vec![root, tie_low, tie_high, late]);
    assert!(!ids.contains(&unrelated));

    assert!(repo
        .find_by_ids_or_linked_to(&BTreeSet::new())
        .unwrap()
        .is_empty());
}

#[test]
fn soft_deleted_contacts_are_invisible_to_lookups() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteContactRepository::try_new(&conn).unwrap();
    let root = primary(&repo, Some("a@x.io"), Some("111"));
    let gone = secondary(&repo, Some("b@x.io"), None, root);

    repo.soft_delete_contact(gone).unwrap();

    assert!(repo
        .find_by_email_or_phone(Some("b@x.io"), None)
        .unwrap()
        .is_empty());
    let cluster = repo
        .find_by_ids_or_linked_to(&BTreeSet::from([root]))
        .unwrap();
    assert_eq!(cluster.len(), 1);
    assert!(repo.get_contact(gone, false).unwrap().is_none());

    let tombstone = repo.get_contact(gone, true).unwrap().unwrap();
    assert!(tombstone.deleted_at.is_some());
    assert!(!tombstone.is_active());

    assert!(matches!(
        repo.soft_delete_contact(gone).unwrap_err(),
        RepoError::NotFound(id) if id == gone
    ));
}

#[test]
fn soft_delete_refuses_primary_with_active_secondaries() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteContactRepository::try_new(&conn).unwrap();
    let root = primary(&repo, Some("a@x.io"), Some("111"));
    let member = secondary(&repo, Some("b@x.io"), Some("111"), root);

    assert!(matches!(
        repo.soft_delete_contact(root).unwrap_err(),
        RepoError::HasActiveSecondaries(id) if id == root
    ));
    assert!(repo.get_contact(root, false).unwrap().is_some());

    // Once nothing live links to it, the primary can go.
    repo.soft_delete_contact(member).unwrap();
    repo.soft_delete_contact(root).unwrap();
    assert!(repo.get_contact(root, false).unwrap().is_none());
}

#[test]
fn update_linkage_rewrites_precedence_and_link() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteContactRepository::try_new(&conn).unwrap();
    let older = primary(&repo, Some("a@x.io"), None);
    let younger = primary(&repo, None, Some("111"));

    repo.update_linkage(younger, LinkPrecedence::Secondary, Some(older))
        .unwrap();

    let loaded = repo.get_contact(younger, false).unwrap().unwrap();
    assert_eq!(loaded.link_precedence, LinkPrecedence::Secondary);
    assert_eq!(loaded.linked_id, Some(older));
    assert_eq!(loaded.primary_id(), older);
}

#[test]
fn update_linkage_validates_and_reports_missing_rows() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteContactRepository::try_new(&conn).unwrap();
    let id = primary(&repo, Some("a@x.io"), None);

    assert!(matches!(
        repo.update_linkage(id, LinkPrecedence::Secondary, Some(id))
            .unwrap_err(),
        RepoError::Validation(ContactValidationError::SelfLink(_))
    ));
    assert!(matches!(
        repo.update_linkage(999, LinkPrecedence::Secondary, Some(id))
            .unwrap_err(),
        RepoError::NotFound(999)
    ));
}

#[test]
fn run_atomic_rolls_back_on_error() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteContactRepository::try_new(&conn).unwrap();

    let result: Result<(), RepoError> = repo.run_atomic(|repo| {
        repo.create_contact(&NewContact::primary(Some("a@x.io".into()), None))?;
        Err(RepoError::NotFound(42))
    });
    assert!(result.is_err());

    assert!(repo
        .find_by_email_or_phone(Some("a@x.io"), None)
        .unwrap()
        .is_empty());
}

#[test]
fn run_atomic_commits_on_success() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteContactRepository::try_new(&conn).unwrap();

    let created = repo
        .run_atomic(|repo| repo.create_contact(&NewContact::primary(None, Some("111".into()))))
        .unwrap();

    assert_eq!(
        repo.get_contact(created.id, false).unwrap(),
        Some(created)
    );
}

#[test]
fn corrupted_precedence_is_reported_not_masked() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteContactRepository::try_new(&conn).unwrap();
    let id = primary(&repo, Some("a@x.io"), None);

    conn.execute_batch("PRAGMA ignore_check_constraints = ON;")
        .unwrap();
    conn.execute(
        "UPDATE contacts SET link_precedence = 'tertiary' WHERE id = ?1;",
        [id],
    )
    .unwrap();

    assert!(matches!(
        repo.get_contact(id, false).unwrap_err(),
        RepoError::InvalidData(_)
    ));
}
