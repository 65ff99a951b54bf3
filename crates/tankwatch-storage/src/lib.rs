use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tankwatch_core::MonitorRecord;
use thiserror::Error;

pub const STATE_SCHEMA_VERSION: i64 = 1;
pub const MONITOR_STATE_KEY: &str = "monitor_state";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable single-record store. Writes replace the whole record.
pub trait StateStore: Send {
    fn load(&self) -> Result<Option<MonitorRecord>, StorageError>;
    fn save(&self, record: &MonitorRecord) -> Result<(), StorageError>;
}

pub struct SqliteStateStore {
    conn: Connection,
}

impl SqliteStateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > STATE_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: STATE_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_monitor_state.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    pub fn load_raw(&self) -> Result<Option<String>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "SELECT value_json FROM kv_state WHERE key = ?1",
                params![MONITOR_STATE_KEY],
                |row| row.get(0),
            )
            .optional()?)
    }
}

impl StateStore for SqliteStateStore {
    fn load(&self) -> Result<Option<MonitorRecord>, StorageError> {
        self.load_raw()?
            .map(|raw| decode_record(&raw))
            .transpose()
    }

    fn save(&self, record: &MonitorRecord) -> Result<(), StorageError> {
        let value_json = encode_record(record)?;
        self.conn.execute(
            "
            INSERT INTO kv_state (key, value_json, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value_json=excluded.value_json,
                updated_at=excluded.updated_at
            ",
            params![MONITOR_STATE_KEY, value_json, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

/// Process-local store, used when durability is not wanted. Clones share the
/// same slot.
#[derive(Clone, Default)]
pub struct MemoryStateStore {
    slot: Arc<Mutex<Option<String>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: &MonitorRecord) -> Result<Self, StorageError> {
        let store = Self::new();
        store.save(record)?;
        Ok(store)
    }

    pub fn raw(&self) -> Option<String> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<Option<MonitorRecord>, StorageError> {
        self.raw().map(|raw| decode_record(&raw)).transpose()
    }

    fn save(&self, record: &MonitorRecord) -> Result<(), StorageError> {
        let encoded = encode_record(record)?;
        *self
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(encoded);
        Ok(())
    }
}

fn encode_record(record: &MonitorRecord) -> Result<String, StorageError> {
    serde_json::to_string(record).map_err(|err| StorageError::Serialization(err.to_string()))
}

fn decode_record(raw: &str) -> Result<MonitorRecord, StorageError> {
    serde_json::from_str(raw).map_err(|err| StorageError::Serialization(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone};
    use tankwatch_core::{ActivityState, Roster, RosterEntry};
    use tempfile::TempDir;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 23, 14, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn sample_record() -> MonitorRecord {
        MonitorRecord {
            activity: ActivityState::active(ts(), None),
            level: Some(37.0),
            roster: Roster::new(vec![
                RosterEntry::new("Sunita Williams", "NASA"),
                RosterEntry::new("Alexey Ovchinin", "Roscosmos"),
            ]),
        }
    }

    #[test]
    fn migration_sets_schema_version() {
        let store = SqliteStateStore::open_in_memory().expect("open db");
        assert_eq!(store.schema_version().expect("version"), STATE_SCHEMA_VERSION);
        store.migrate().expect("migrate twice");
    }

    #[test]
    fn empty_store_loads_nothing() {
        let store = SqliteStateStore::open_in_memory().expect("open db");
        assert!(store.load().expect("load").is_none());
    }

    #[test]
    fn save_overwrites_single_record() {
        let store = SqliteStateStore::open_in_memory().expect("open db");
        store.save(&sample_record()).expect("save");

        let mut updated = sample_record();
        updated.activity.end(ts());
        store.save(&updated).expect("save again");

        let count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM kv_state", [], |row| row.get(0))
            .expect("count");
        assert_eq!(count, 1);

        let loaded = store.load().expect("load").expect("record");
        assert!(!loaded.activity.is_active());
        assert_eq!(loaded.activity.last_ended_at(), Some(ts()));
        assert_eq!(loaded.level, Some(37.0));
    }

    #[test]
    fn record_survives_reopen() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("nested").join("state.db");
        {
            let store = SqliteStateStore::open(&path).expect("open db");
            store.save(&sample_record()).expect("save");
        }
        let store = SqliteStateStore::open(&path).expect("reopen db");
        let loaded = store.load().expect("load").expect("record");
        assert_eq!(loaded.activity.current_started_at(), Some(ts()));
        assert!(loaded.roster.same_members(&sample_record().roster));
    }

    #[test]
    fn newer_schema_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("state.db");
        {
            let conn = Connection::open(&path).expect("open raw");
            conn.execute("PRAGMA user_version = 9", []).expect("bump");
        }
        let err = SqliteStateStore::open(&path).err().expect("should fail");
        assert!(matches!(
            err,
            StorageError::UnsupportedSchemaVersion { found: 9, .. }
        ));
    }

    #[test]
    fn corrupt_payload_is_a_serialization_error() {
        let store = SqliteStateStore::open_in_memory().expect("open db");
        store
            .conn
            .execute(
                "INSERT INTO kv_state (key, value_json, updated_at) VALUES (?1, '{not json', '')",
                params![MONITOR_STATE_KEY],
            )
            .expect("insert");
        assert!(matches!(store.load(), Err(StorageError::Serialization(_))));
    }

    #[test]
    fn memory_store_clones_share_state() {
        let store = MemoryStateStore::new();
        let view = store.clone();
        store.save(&sample_record()).expect("save");
        assert!(view.raw().is_some());
        let loaded = view.load().expect("load").expect("record");
        assert!(loaded.activity.is_active());
    }
}
