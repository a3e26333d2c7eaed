#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use student_roster_core::{
    decode_records, format_rfc3339, now_utc, IdScheme, JsonRecordAdapter, KeyValueStore,
    RecordStore, RosterError,
};
use tracing::debug;

const KV_MIGRATION_VERSION: i64 = 1;

const SCHEMA_KV_V1: &str = r"
CREATE TABLE IF NOT EXISTS kv_entries (
  key TEXT PRIMARY KEY CHECK (length(key) > 0),
  value TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
";

/// Record store backed by a `SQLite` file.
pub type SqliteRecordStore = RecordStore<JsonRecordAdapter<SqliteKeyValueStore>>;

/// Durable key-value table in a single-file `SQLite` database.
pub struct SqliteKeyValueStore {
    conn: Connection,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct StorageStatus {
    pub contract_version: String,
    pub namespace: String,
    pub schema_version: Option<i64>,
    pub key_present: bool,
    pub payload_bytes: usize,
    pub decodes: bool,
    pub record_count: usize,
    pub updated_at: Option<String>,
}

impl SqliteKeyValueStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Opens `path` and applies pending migrations.
    pub fn open_migrated(path: &Path) -> Result<Self> {
        let store = Self::open(path)?;
        store.migrate()?;
        Ok(store)
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
            .execute_batch(SCHEMA_KV_V1)
            .context("failed to apply key-value schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![KV_MIGRATION_VERSION, now],
            )
            .context("failed to register key-value schema migration")?;

        Ok(())
    }

    pub fn schema_version(&self) -> Result<Option<i64>> {
        if !table_exists(&self.conn, "schema_migrations")? {
            return Ok(None);
        }

        self.conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .context("failed to read schema version")
    }

    pub fn get_value(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM kv_entries WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .with_context(|| format!("failed to read key {key}"))
    }

    pub fn set_value(&self, key: &str, value: &str) -> Result<()> {
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO kv_entries(key, value, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                   value = excluded.value,
                   updated_at = excluded.updated_at",
                params![key, value, now],
            )
            .with_context(|| format!("failed to write key {key}"))?;

        debug!(key, bytes = value.len(), "stored value");
        Ok(())
    }

    pub fn updated_at(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT updated_at FROM kv_entries WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .with_context(|| format!("failed to read updated_at for key {key}"))
    }

    /// Describes what is stored under `namespace` without modifying it.
    pub fn status(&self, namespace: &str) -> Result<StorageStatus> {
        let payload = self.get_value(namespace)?;
        let (decodes, record_count) = match payload.as_deref().map(decode_records) {
            Some(Ok(records)) => (true, records.len()),
            Some(Err(_)) => (false, 0),
            None => (true, 0),
        };

        Ok(StorageStatus {
            contract_version: "storage_status.v1".to_string(),
            namespace: namespace.to_string(),
            schema_version: self.schema_version()?,
            key_present: payload.is_some(),
            payload_bytes: payload.as_ref().map_or(0, String::len),
            decodes,
            record_count,
            updated_at: self.updated_at(namespace)?,
        })
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl KeyValueStore for SqliteKeyValueStore {
    fn get(&self, key: &str) -> std::result::Result<Option<String>, RosterError> {
        self.get_value(key).map_err(to_roster_error)
    }

    fn set(&mut self, key: &str, value: &str) -> std::result::Result<(), RosterError> {
        self.set_value(key, value).map_err(to_roster_error)
    }
}

/// Opens the database at `path`, migrates it, and loads the record store
/// kept under `namespace`.
pub fn open_record_store(
    path: &Path,
    namespace: &str,
    scheme: IdScheme,
) -> Result<SqliteRecordStore> {
    scheme
        .validate()
        .map_err(|err| anyhow!("invalid identifier scheme: {err}"))?;
    let kv = SqliteKeyValueStore::open_migrated(path)?;
    Ok(RecordStore::open(JsonRecordAdapter::new(kv, namespace), scheme))
}

#[allow(clippy::needless_pass_by_value)]
fn to_roster_error(err: anyhow::Error) -> RosterError {
    RosterError::Persistence(format!("{err:#}"))
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
fn ensure_table_has_columns(conn: &Connection, table_name: &str, columns: &[&str]) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut available = Vec::new();
    while let Some(row) = rows.next()? {
        available.push(row.get::<_, String>(1)?);
    }

    for required in columns {
        if !available.iter().any(|candidate| candidate == required) {
            return Err(anyhow!("missing column {table_name}.{required}"));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp, clippy::manual_let_else)]

    use super::*;
    use proptest::prelude::*;
    use student_roster_core::{
        Record, RecordDraft, RecordId, RecordPersistence, SubmitOutcome, DEFAULT_NAMESPACE,
    };
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn must_roster<T>(result: std::result::Result<T, RosterError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_store() -> SqliteKeyValueStore {
        must(SqliteKeyValueStore::open_migrated(Path::new(":memory:")))
    }

    fn temp_db_path(label: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("roster-{label}-{}.sqlite3", Ulid::new()))
    }

    fn fixture_draft(name: &str, salary: &str) -> RecordDraft {
        RecordDraft {
            name: name.to_string(),
            contact: "01711111111".to_string(),
            section: "A".to_string(),
            salary: salary.to_string(),
            join_date: "2024-01-15".to_string(),
        }
    }

    #[test]
    fn set_get_and_overwrite() {
        let store = fixture_store();
        assert_eq!(must(store.get_value("k")), None);

        must(store.set_value("k", "first"));
        must(store.set_value("k", "second"));
        assert_eq!(must(store.get_value("k")).as_deref(), Some("second"));
        assert!(must(store.updated_at("k")).is_some());    }

    #[test]
    fn schema_contract_contains_expected_tables_and_columns() {
        let store = fixture_store();
        assert!(must(table_exists(store.connection(), "kv_entries")));
        assert!(must(table_exists(store.connection(), "schema_migrations")));
        must(ensure_table_has_columns(
            store.connection(),
            "kv_entries",
            &["key", "value", "updated_at"],
        ));
        assert_eq!(must(store.schema_version()), Some(KV_MIGRATION_VERSION));
    }

    #[test]
    fn unmigrated_database_reports_no_schema_version() {
        let store = must(SqliteKeyValueStore::open(Path::new(":memory:")));
        assert_eq!(must(store.schema_version()), None);
        assert!(store.get_value("anything").is_err());
    }

    #[test]
    fn migration_is_idempotent_and_preserves_existing_data() {
        let store = fixture_store();
        must(store.set_value(DEFAULT_NAMESPACE, "[]"));
        must(store.migrate());
        must(store.migrate());
        assert_eq!(must(store.get_value(DEFAULT_NAMESPACE)).as_deref(), Some("[]"));

        let migrations = match store.connection().query_row(
            "SELECT COUNT(*) FROM schema_migrations",
            [],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("failed to count migrations: {err}"),
        };
        assert_eq!(migrations, 1);
    }

    #[test]
    fn records_survive_reopen() {
        let db_path = temp_db_path("reopen");

        {
            let mut store = must(open_record_store(
                &db_path,
                DEFAULT_NAMESPACE,
                IdScheme::default(),
            ));
            must_roster(store.submit(&fixture_draft("Alif", "100")));
            must_roster(store.submit(&fixture_draft("Bina", "0")));
            must_roster(store.remove("ST-001"));
        }

        let mut reopened = must(open_record_store(
            &db_path,
            DEFAULT_NAMESPACE,
            IdScheme::default(),
        ));
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.records()[0].name, "Bina");

        let outcome = must_roster(reopened.submit(&fixture_draft("Chandra", "5")));
        assert!(matches!(
            outcome,
            SubmitOutcome::Created { ref record } if record.id == RecordId::from("ST-003")
        ));

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn namespaces_are_isolated() {
        let db_path = temp_db_path("namespaces");

        {
            let mut first = must(open_record_store(&db_path, "students", IdScheme::default()));
            must_roster(first.submit(&fixture_draft("Alif", "1")));
        }

        let other = must(open_record_store(&db_path, "students_v1_alif", IdScheme::default()));
        assert!(other.is_empty());

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn corrupt_payload_loads_empty_and_is_reported_by_status() {
        let store = fixture_store();
        must(store.set_value(DEFAULT_NAMESPACE, "{not json"));

        let status = must(store.status(DEFAULT_NAMESPACE));
        assert!(status.key_present);
        assert!(!status.decodes);
        assert_eq!(status.record_count, 0);
        assert_eq!(status.payload_bytes, "{not json".len());

        let adapter = JsonRecordAdapter::new(store, DEFAULT_NAMESPACE);
        assert!(adapter.load().is_empty());
    }

    #[test]
    fn status_of_absent_key_is_empty_and_decodable() {
        let store = fixture_store();
        let status = must(store.status(DEFAULT_NAMESPACE));
        assert!(!status.key_present);
        assert!(status.decodes);
        assert_eq!(status.record_count, 0);
        assert_eq!(status.updated_at, None);
        assert_eq!(status.schema_version, Some(KV_MIGRATION_VERSION));
    }

    #[test]
    fn rejects_invalid_identifier_scheme() {
        let scheme = IdScheme {
            prefix: "ST9".to_string(),
            width: 3,
        };
        assert!(open_record_store(Path::new(":memory:"), DEFAULT_NAMESPACE, scheme).is_err());
    }

    #[test]
    fn sqlite_busy_timeout_allows_write_after_lock_release() {
        let db_path = temp_db_path("lock");
        drop(must(SqliteKeyValueStore::open_migrated(&db_path)));

        let lock_conn = match Connection::open(&db_path) {
            Ok(value) => value,
            Err(err) => panic!("failed to open lock connection: {err}"),
        };
        if let Err(err) = lock_conn.execute_batch("BEGIN IMMEDIATE;") {
            panic!("failed to acquire write lock: {err}");
        }

        let write_path = db_path.clone();
        let write_handle = std::thread::spawn(move || {
            let store = match SqliteKeyValueStore::open(&write_path) {
                Ok(value) => value,
                Err(err) => panic!("failed to open write store: {err}"),
            };
            store.set_value(DEFAULT_NAMESPACE, "[]")
        });

        std::thread::sleep(std::time::Duration::from_millis(150));
        if let Err(err) = lock_conn.execute_batch("COMMIT;") {
            panic!("failed to release write lock: {err}");
        }

        let write_result = match write_handle.join() {
            Ok(result) => result,
            Err(err) => panic!("write thread join failed: {err:?}"),
        };
        assert!(
            write_result.is_ok(),
            "write should succeed after lock release: {:?}",
            write_result.err()
        );

        let _ = std::fs::remove_file(&db_path);
    }

    fn arbitrary_record() -> impl Strategy<Value = Record> {
        (
            1u64..2_000,
            "[A-Za-z ]{2,12}",
            "[0-9]{11}",
            "[A-D]",
            0u32..500_000,
        )
            .prop_map(|(counter, name, contact, section, salary)| Record {
                id: IdScheme::default().format(counter),
                name,
                contact,
                section,
                salary: Some(f64::from(salary) / 4.0),
                join_date: "2024-06-01".to_string(),
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_sqlite_round_trip(records in prop::collection::vec(arbitrary_record(), 0..16)) {
            let mut adapter = JsonRecordAdapter::new(fixture_store(), DEFAULT_NAMESPACE);
            must_roster(adapter.save(&records));
            prop_assert_eq!(adapter.load(), records);
        }
    }
}
