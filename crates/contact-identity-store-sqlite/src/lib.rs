#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;

use anyhow::{Context, Result};
use contact_identity_core::{
    build_view, check_integrity, format_rfc3339, now_utc, parse_rfc3339_utc, ContactId,
    ContactPatch, ContactRecord, ContactStore, IdentifyRequest, IdentityError, IdentityResolver,
    IdentityView, IntegrityReport, LinkPrecedence, NewContact,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

pub const CONTACTS_MIGRATION_VERSION: i64 = 1;

const SCHEMA_CONTACTS_V1: &str = r"
CREATE TABLE IF NOT EXISTS contacts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  email TEXT,
  phone_number TEXT,
  linked_id INTEGER REFERENCES contacts(id),
  link_precedence TEXT NOT NULL DEFAULT 'primary' CHECK (
    link_precedence IN ('primary', 'secondary')
  ),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  deleted_at TEXT,
  CHECK (
    (link_precedence = 'primary' AND linked_id IS NULL)
    OR (link_precedence = 'secondary' AND linked_id IS NOT NULL)
  )
);

CREATE INDEX IF NOT EXISTS idx_contacts_email ON contacts(email);
CREATE INDEX IF NOT EXISTS idx_contacts_phone_number ON contacts(phone_number);
CREATE INDEX IF NOT EXISTS idx_contacts_linked_id ON contacts(linked_id);
";

const CONTACT_COLUMNS: &str =
    "id, email, phone_number, linked_id, link_precedence, created_at, updated_at, deleted_at";

pub struct SqliteContactStore {
    conn: Connection,
}

impl SqliteContactStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_CONTACTS_V1)
            .context("failed to apply contacts schema")?;

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![CONTACTS_MIGRATION_VERSION, now],
            )
            .context("failed to register contacts schema migration")?;

        Ok(())
    }

    /// Highest applied migration, or `None` for a database that was never migrated.
    pub fn schema_version(&self) -> Result<Option<i64>> {
        if !table_exists(&self.conn, "schema_migrations")? {
            return Ok(None);
        }

        let version = self
            .conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .context("failed to read schema version")?;

        Ok(version)
    }

    /// Resolves one observation inside a single immediate transaction.
    ///
    /// The write lock is taken before the match query, so concurrent callers
    /// with the same pair are serialized and cannot both see "no match".
    /// Any error drops the transaction uncommitted.
    pub fn identify(&mut self, request: &IdentifyRequest) -> Result<IdentityView, IdentityError> {
        self.identify_guarded(request, || true)
    }

    /// Like [`Self::identify`], but asks `may_commit` once the resolve has
    /// succeeded. When it answers `false` the transaction is rolled back and a
    /// [`IdentityError::Storage`] is returned, so a caller that has already
    /// given up on the request never leaves a write behind.
    pub fn identify_guarded<F>(
        &mut self,
        request: &IdentifyRequest,
        may_commit: F,
    ) -> Result<IdentityView, IdentityError>
    where
        F: FnOnce() -> bool,
    {
        request.validate()?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(storage_error)?;

        let view = {
            let mut scoped = ConnectionContactStore { conn: &tx };
            IdentityResolver::new(&mut scoped).resolve(request)?
        };

        if !may_commit() {
            tx.rollback().map_err(storage_error)?;
            tracing::warn!(
                primary = %view.primary_contact_id,
                "identify abandoned by caller; rolled back"
            );
            return Err(IdentityError::Storage(
                "identify abandoned before commit".to_string(),
            ));
        }

        tx.commit().map_err(storage_error)?;
        tracing::debug!(
            primary = %view.primary_contact_id,
            secondaries = view.secondary_contact_ids.len(),
            "identify committed"
        );
        Ok(view)
    }

    pub fn get_contact(&self, id: ContactId) -> Result<Option<ContactRecord>> {
        let record = ConnectionContactStore { conn: &self.conn }.get(id)?;
        Ok(record)
    }

    pub fn list_contacts(&self) -> Result<Vec<ContactRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map([], parse_contact_row)?;
        collect_rows(rows)
    }

    /// View of the group containing `id`, without mutating anything.
    pub fn group_of(&self, id: ContactId) -> Result<IdentityView, IdentityError> {
        let store = ConnectionContactStore { conn: &self.conn };
        let record = store.get(id)?.ok_or(IdentityError::NotFound(id))?;
        build_view(&store, record.group_primary_id()?)
    }

    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let records = self.list_contacts()?;
        Ok(check_integrity(&records))
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// [`ContactStore`] over a borrowed connection or open transaction.
struct ConnectionContactStore<'c> {
    conn: &'c Connection,
}

impl ContactStore for ConnectionContactStore<'_> {
    fn find_match(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Option<ContactRecord>, IdentityError> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {CONTACT_COLUMNS}
                     FROM contacts
                     WHERE (?1 IS NOT NULL AND email = ?1)
                        OR (?2 IS NOT NULL AND phone_number = ?2)
                     ORDER BY id ASC
                     LIMIT 1"
                ),
                params![email, phone_number],
                parse_contact_row,
            )
            .optional()
            .map_err(storage_error)
    }

    fn get(&self, id: ContactId) -> Result<Option<ContactRecord>, IdentityError> {
        self.conn
            .query_row(
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"),
                params![id.0],
                parse_contact_row,
            )
            .optional()
            .map_err(storage_error)
    }

    fn create(&mut self, contact: &NewContact) -> Result<ContactRecord, IdentityError> {
        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT INTO contacts(
                    email, phone_number, linked_id, link_precedence, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![
                    contact.email,
                    contact.phone_number,
                    contact.linked_id.map(|linked| linked.0),
                    contact.link_precedence.as_str(),
                    now,
                ],
            )
            .map_err(storage_error)?;

        let id = ContactId(self.conn.last_insert_rowid());
        self.get(id)?.ok_or_else(|| {
            IdentityError::Consistency(format!("contact {id} missing right after insert"))
        })
    }

    fn update(
        &mut self,
        id: ContactId,
        patch: &ContactPatch,
    ) -> Result<ContactRecord, IdentityError> {
        let mut record = self.get(id)?.ok_or(IdentityError::NotFound(id))?;
        if patch.is_empty() {
            return Ok(record);
        }

        patch.apply_to(&mut record);
        record.updated_at = now_utc();

        let changed = self
            .conn
            .execute(
                "UPDATE contacts
                 SET email = ?1,
                     phone_number = ?2,
                     linked_id = ?3,
                     link_precedence = ?4,
                     updated_at = ?5
                 WHERE id = ?6",
                params![
                    record.email,
                    record.phone_number,
                    record.linked_id.map(|linked| linked.0),
                    record.link_precedence.as_str(),
                    format_rfc3339(record.updated_at)?,
                    id.0,
                ],
            )
            .map_err(storage_error)?;

        if changed == 0 {
            return Err(IdentityError::NotFound(id));
        }
        Ok(record)
    }

    fn list_secondaries_of(
        &self,
        primary_id: ContactId,
    ) -> Result<Vec<ContactRecord>, IdentityError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {CONTACT_COLUMNS}
                 FROM contacts
                 WHERE link_precedence = 'secondary' AND linked_id = ?1
                 ORDER BY id ASC"
            ))
            .map_err(storage_error)?;

        let rows = stmt
            .query_map(params![primary_id.0], parse_contact_row)
            .map_err(storage_error)?;

        let mut values = Vec::new();
        for row in rows {
            values.push(row.map_err(storage_error)?);
        }
        Ok(values)
    }
}

fn parse_contact_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContactRecord> {
    let precedence_raw: String = row.get(4)?;
    let link_precedence = LinkPrecedence::parse(&precedence_raw).ok_or_else(|| {
        invalid_column(4, format!("invalid link_precedence: {precedence_raw}"))
    })?;

    let deleted_at = match row.get::<_, Option<String>>(7)? {
        Some(raw) => Some(parse_rfc3339_utc(&raw).map_err(to_sql_error)?),
        None => None,
    };

    Ok(ContactRecord {
        id: ContactId(row.get(0)?),
        email: row.get(1)?,
        phone_number: row.get(2)?,
        linked_id: row.get::<_, Option<i64>>(3)?.map(ContactId),
        link_precedence,
        created_at: parse_rfc3339_utc(&row.get::<_, String>(5)?).map_err(to_sql_error)?,
        updated_at: parse_rfc3339_utc(&row.get::<_, String>(6)?).map_err(to_sql_error)?,
        deleted_at,
    })
}

fn invalid_column(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn to_sql_error(err: IdentityError) -> rusqlite::Error {
    invalid_column(0, err.to_string())
}

fn storage_error(err: rusqlite::Error) -> IdentityError {
    IdentityError::Storage(err.to_string())
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use proptest::prelude::*;
    use std::sync::{Arc, Barrier};
    use ulid::Ulid;

    fn must<T, E: std::fmt::Display>(result: std::result::Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_store() -> SqliteContactStore {
        let store = must(SqliteContactStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn temp_db_path(label: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("contacts-{label}-{}.sqlite3", Ulid::new()))
    }

    fn identify(store: &mut SqliteContactStore, email: &str, phone: &str) -> IdentityView {
        must(store.identify(&IdentifyRequest::new(Some(email), Some(phone))))
    }

    fn contact(store: &SqliteContactStore, id: i64) -> ContactRecord {
        match must(store.get_contact(ContactId(id))) {
            Some(value) => value,
            None => panic!("missing contact {id}"),
        }
    }

    fn count_contacts(store: &SqliteContactStore) -> i64 {
        must(
            store
                .connection()
                .query_row("SELECT COUNT(*) FROM contacts", [], |row| row.get(0)),
        )
    }

    fn ids(values: &[i64]) -> Vec<ContactId> {
        values.iter().copied().map(ContactId).collect()
    }

    #[test]
    fn repeat_submission_scenario_matches_expected_views() {
        let mut store = fixture_store();

        let first = identify(&mut store, "a@x.com", "111");
        assert_eq!(first.primary_contact_id, ContactId(1));
        assert_eq!(first.emails, vec!["a@x.com".to_string()]);
        assert_eq!(first.phone_numbers, vec!["111".to_string()]);
        assert!(first.secondary_contact_ids.is_empty());

        let second = identify(&mut store, "a@x.com", "111");
        assert_eq!(second.primary_contact_id, ContactId(1));
        assert_eq!(second.emails, vec!["a@x.com".to_string()]);
        assert_eq!(second.secondary_contact_ids, ids(&[2]));

        let duplicate = contact(&store, 2);
        assert_eq!(duplicate.link_precedence, LinkPrecedence::Secondary);
        assert_eq!(duplicate.linked_id, Some(ContactId(1)));
    }

    #[test]
    fn three_way_chain_relinks_group_under_newest_primary() {
        let mut store = fixture_store();
        let _ = identify(&mut store, "a@x.com", "111");
        let _ = identify(&mut store, "a@x.com", "222");
        let view = identify(&mut store, "c@x.com", "222");

        assert_eq!(view.primary_contact_id, ContactId(3));
        assert_eq!(
            view.emails,
            vec!["c@x.com".to_string(), "a@x.com".to_string()]
        );
        assert_eq!(view.phone_numbers, vec!["222".to_string(), "111".to_string()]);
        assert_eq!(view.secondary_contact_ids, ids(&[1, 2]));

        let former = contact(&store, 2);
        assert_eq!(former.link_precedence, LinkPrecedence::Secondary);
        assert_eq!(former.linked_id, Some(ContactId(3)));
        assert!(must(store.integrity_check()).healthy);
    }

    #[test]
    fn validation_failure_writes_nothing() {
        let mut store = fixture_store();
        let result = store.identify(&IdentifyRequest::new(Some(""), None));
        assert!(matches!(result, Err(IdentityError::Validation(_))));
        assert_eq!(count_contacts(&store), 0);
    }

    #[test]
    fn failed_resolve_rolls_back_every_write() {
        let mut store = fixture_store();
        let _ = identify(&mut store, "a@x.com", "111");

        // Promotion inserts the new primary before demoting the old one.
        must(store.connection().execute_batch(
            "CREATE TRIGGER trg_block_demote
             BEFORE UPDATE OF link_precedence ON contacts
             BEGIN
               SELECT RAISE(FAIL, 'demotion blocked');
             END;",
        ));

        let result = store.identify(&IdentifyRequest::new(Some("a@x.com"), Some("222")));
        match result {
            Err(IdentityError::Storage(message)) => assert!(message.contains("demotion blocked")),
            other => panic!("expected storage error, got {other:?}"),
        }

        assert_eq!(count_contacts(&store), 1);
        let original = contact(&store, 1);
        assert_eq!(original.link_precedence, LinkPrecedence::Primary);
        assert_eq!(original.linked_id, None);
    }

    #[test]
    fn refused_commit_rolls_back_a_successful_resolve() {
        let mut store = fixture_store();
        let _ = identify(&mut store, "a@x.com", "111");

        let mut asked = false;
        let result = store.identify_guarded(
            &IdentifyRequest::new(Some("a@x.com"), Some("222")),
            || {
                asked = true;
                false
            },
        );
        assert!(asked, "commit gate must be consulted after resolve");
        match result {
            Err(IdentityError::Storage(message)) => assert!(message.contains("abandoned")),
            other => panic!("expected storage error, got {other:?}"),
        }

        assert_eq!(count_contacts(&store), 1);
        let original = contact(&store, 1);
        assert_eq!(original.link_precedence, LinkPrecedence::Primary);
        assert_eq!(original.linked_id, None);
    }

    #[test]
    fn validation_failure_never_consults_commit_gate() {
        let mut store = fixture_store();
        let result = store.identify_guarded(&IdentifyRequest::default(), || {
            panic!("commit gate consulted for an invalid request")
        });
        assert!(matches!(result, Err(IdentityError::Validation(_))));
    }

    #[test]
    fn schema_rejects_secondary_without_link() {
        let store = fixture_store();
        let result = store.connection().execute(
            "INSERT INTO contacts(email, linked_id, link_precedence, created_at, updated_at)
             VALUES ('a@x.com', NULL, 'secondary', '2026-02-07T12:00:00Z', '2026-02-07T12:00:00Z')",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn group_of_resolves_from_any_member_and_reports_missing_ids() {
        let mut store = fixture_store();
        let _ = identify(&mut store, "a@x.com", "111");
        let promoted = identify(&mut store, "a@x.com", "222");

        let from_secondary = must(store.group_of(ContactId(1)));
        assert_eq!(from_secondary, promoted);

        assert_eq!(
            store.group_of(ContactId(99)),
            Err(IdentityError::NotFound(ContactId(99)))
        );
    }

    #[test]
    fn find_match_never_matches_null_columns() {
        let mut store = fixture_store();
        let _ = must(store.identify(&IdentifyRequest::new(Some("a@x.com"), None)));
        let view = must(store.identify(&IdentifyRequest::new(Some("b@x.com"), None)));

        assert_eq!(view.primary_contact_id, ContactId(2));
        assert!(view.phone_numbers.is_empty());
        assert!(view.secondary_contact_ids.is_empty());
    }

    #[test]
    fn timestamps_round_trip_and_update_refreshes_updated_at() {
        let mut store = fixture_store();
        let _ = identify(&mut store, "a@x.com", "111");
        let before = contact(&store, 1);
        assert_eq!(before.created_at, before.updated_at);
        assert_eq!(before.deleted_at, None);

        let _ = identify(&mut store, "a@x.com", "222");
        let after = contact(&store, 1);
        assert_eq!(after.created_at, before.created_at);
        assert!(after.updated_at >= before.updated_at);
    }

    #[test]
    fn migration_is_idempotent_and_preserves_existing_data() {
        let mut store = fixture_store();
        let _ = identify(&mut store, "a@x.com", "111");

        must(store.migrate());
        assert_eq!(must(store.schema_version()), Some(CONTACTS_MIGRATION_VERSION));
        assert_eq!(count_contacts(&store), 1);
        assert_eq!(contact(&store, 1).email.as_deref(), Some("a@x.com"));
    }

    #[test]
    fn unmigrated_database_reports_no_schema_version() {
        let store = must(SqliteContactStore::open(Path::new(":memory:")));
        assert_eq!(must(store.schema_version()), None);
    }

    #[test]
    fn concurrent_identical_submissions_yield_one_primary() {
        let db_path = temp_db_path("race");
        let setup = must(SqliteContactStore::open(&db_path));
        must(setup.migrate());
        drop(setup);

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let path = db_path.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let mut store = match SqliteContactStore::open(&path) {
                        Ok(value) => value,
                        Err(err) => panic!("failed to open store: {err}"),
                    };
                    barrier.wait();
                    store.identify(&IdentifyRequest::new(Some("a@x.com"), Some("111")))
                })
            })
            .collect();

        for handle in handles {
            let result = match handle.join() {
                Ok(result) => result,
                Err(err) => panic!("identify thread join failed: {err:?}"),
            };
            assert!(result.is_ok(), "identify failed: {:?}", result.err());
        }

        let store = must(SqliteContactStore::open(&db_path));
        let report = must(store.integrity_check());
        assert!(report.healthy);
        assert_eq!(report.total_records, 2);
        assert_eq!(report.primary_records, 1);

        drop(store);
        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn busy_timeout_allows_identify_after_lock_release() {
        let db_path = temp_db_path("lock");
        let setup = must(SqliteContactStore::open(&db_path));
        must(setup.migrate());
        drop(setup);

        let lock_conn = must(Connection::open(&db_path));
        must(lock_conn.execute_batch("BEGIN IMMEDIATE;"));

        let identify_path = db_path.clone();
        let handle = std::thread::spawn(move || {
            let mut store = match SqliteContactStore::open(&identify_path) {
                Ok(value) => value,
                Err(err) => panic!("failed to open identify store: {err}"),
            };
            store.identify(&IdentifyRequest::new(Some("a@x.com"), Some("111")))
        });

        std::thread::sleep(std::time::Duration::from_millis(150));
        must(lock_conn.execute_batch("COMMIT;"));

        let result = match handle.join() {
            Ok(result) => result,
            Err(err) => panic!("identify thread join failed: {err:?}"),
        };
        assert!(
            result.is_ok(),
            "identify should succeed after lock release: {:?}",
            result.err()
        );

        drop(lock_conn);
        let _ = std::fs::remove_file(&db_path);
    }

    fn pick(pool: &[&str], index: u8) -> Option<String> {
        pool.get(usize::from(index)).map(|value| (*value).to_string())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_links_stay_valid_after_any_observation_stream(
            stream in prop::collection::vec((0u8..4, 0u8..4), 1..40)
        ) {
            let emails = ["a@x.com", "b@x.com", "c@x.com"];
            let phones = ["111", "222", "333"];
            let mut store = fixture_store();

            for (email_index, phone_index) in stream {
                let request = IdentifyRequest {
                    email: pick(&emails, email_index),
                    phone_number: pick(&phones, phone_index),
                };
                let result = store.identify(&request);
                if request.email.is_none() && request.phone_number.is_none() {
                    prop_assert!(matches!(result, Err(IdentityError::Validation(_))));
                    continue;
                }

                let view = must(result);
                let primary = contact(&store, view.primary_contact_id.0);
                prop_assert!(primary.is_primary());
                if let Some(email) = &primary.email {
                    prop_assert_eq!(view.emails.first(), Some(email));
                }
                if let Some(phone) = &primary.phone_number {
                    prop_assert_eq!(view.phone_numbers.first(), Some(phone));
                }

                let mut seen = view.emails.clone();
                seen.sort();
                seen.dedup();
                prop_assert_eq!(seen.len(), view.emails.len());

                let mut seen = view.phone_numbers.clone();
                seen.sort();
                seen.dedup();
                prop_assert_eq!(seen.len(), view.phone_numbers.len());

                let mut previous = 0_i64;
                for id in &view.secondary_contact_ids {
                    prop_assert!(id.0 > previous);
                    previous = id.0;
                }

                let report = must(store.integrity_check());
                prop_assert!(report.healthy, "issues: {:?}", report.issues);
            }
        }
    }
}
