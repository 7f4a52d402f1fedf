use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::Path;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::session::WorkoutSession;

/// Storage key of the single in-progress session snapshot.
pub const SESSION_KEY: &str = "spotter.active_session";

/// Synchronous, device-local key-value storage. A `set` replaces the whole value
/// for its key or fails without touching it.
pub trait KeyValueStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

impl<T: KeyValueStorage + ?Sized> KeyValueStorage for Rc<T> {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        (**self).remove(key)
    }
}

/// In-process storage, lost on exit.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RefCell<BTreeMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.borrow().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.borrow_mut().remove(key);
        Ok(())
    }
}

/// Durable storage backed by a single-table SQLite database.
#[derive(Debug)]
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StorageError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
            [],
        )?;
        Ok(Self { conn })
    }
}

impl KeyValueStorage for SqliteStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let value = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        // Single statement, so the replace is atomic for the key.
        self.conn.execute(
            "INSERT OR REPLACE INTO kv (key, value, updated_at) VALUES (?1, ?2, CURRENT_TIMESTAMP)",
            params![key, value],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
        Ok(())
    }
}

/// Single-slot persistence of the current workout session.
#[derive(Debug)]
pub struct SessionStore<S> {
    storage: S,
}

impl<S: KeyValueStorage> SessionStore<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub fn save(&self, session: &WorkoutSession) -> Result<(), StorageError> {
        let data = serde_json::to_string(session)?;
        self.storage.set(SESSION_KEY, &data)?;
        debug!(session_id = %session.id, status = %session.status, "Session snapshot saved");
        Ok(())
    }

    /// The last saved session. Missing, unreadable, and corrupt snapshots all read as `None`.
    pub fn load(&self) -> Option<WorkoutSession> {
        let raw = match self.storage.get(SESSION_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                warn!(error = %err, "Failed to read session snapshot");
                return None;
            }
        };
        match serde_json::from_str::<WorkoutSession>(&raw) {
            Ok(session) => Some(session),
            Err(err) => {
                warn!(error = %err, "Discarding corrupt session snapshot");
                None
            }
        }
    }

    pub fn clear(&self) -> Result<(), StorageError> {
        self.storage.remove(SESSION_KEY)
    }
}

/// Seconds spent active between `started_at` and the end of the session, with every
/// pause interval removed. In-progress sessions are measured up to `now`, including
/// an open pause.
pub fn calculate_session_duration(session: &WorkoutSession, now: DateTime<Utc>) -> i64 {
    let Some(started_at) = session.started_at else {
        return 0;
    };
    let end = session.completed_at.unwrap_or(now);

    let closed: i64 = session.pauses.iter().map(|p| p.seconds()).sum();
    let open = session
        .paused_at
        .map(|paused_at| (end - paused_at).num_seconds().max(0))
        .unwrap_or(0);

    ((end - started_at).num_seconds() - closed - open).max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{PauseInterval, SessionExercise, SessionStatus, SetRecord};
    use chrono::{Duration, TimeZone};
    use tempfile::tempdir;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 18, 0, 0).unwrap()
    }

    fn sample_session() -> WorkoutSession {
        let mut session = WorkoutSession::started(
            "athlete-1",
            vec![SessionExercise::new("squat", "Back Squat").with_planned_sets(5)],
            t0(),
        );
        session.exercises[0]
            .set_records
            .push(SetRecord::new(102.5, 5, t0() + Duration::seconds(90)));
        session.exercises[0].sets_completed = 1;
        session
    }

    #[test]
    fn memory_roundtrip() {
        let store = SessionStore::new(MemoryStorage::new());
        assert!(store.load().is_none());
        let session = sample_session();
        store.save(&session).unwrap();
        assert_eq!(store.load(), Some(session));
        store.clear().unwrap();
        assert!(store.load().is_none());
    }

    #[test]
    fn sqlite_roundtrip_on_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("spotter.db");
        let session = sample_session();
        {
            let store = SessionStore::new(SqliteStorage::open(&path).unwrap());
            store.save(&session).unwrap();
        }
        // Survives reopening, as after a process restart.
        let store = SessionStore::new(SqliteStorage::open(&path).unwrap());
        assert_eq!(store.load(), Some(session));
    }

    #[test]
    fn save_replaces_prior_snapshot() {
        let store = SessionStore::new(SqliteStorage::open_in_memory().unwrap());
        let first = sample_session();
        let second = WorkoutSession::started("athlete-2", vec![], t0());
        store.save(&first).unwrap();
        store.save(&second).unwrap();
        assert_eq!(store.load(), Some(second));
    }

    #[test]
    fn corrupt_snapshot_reads_as_none() {
        let storage = Rc::new(MemoryStorage::new());
        storage.set(SESSION_KEY, "{\"id\": \"half-writ").unwrap();
        let store = SessionStore::new(storage.clone());
        assert!(store.load().is_none());

        storage.set(SESSION_KEY, "{\"id\": 3}").unwrap();
        assert!(store.load().is_none());
    }

    #[test]
    fn save_of_load_is_a_fixed_point() {
        let storage = Rc::new(MemoryStorage::new());
        let store = SessionStore::new(storage.clone());
        let mut session = sample_session();
        session.pauses.push(PauseInterval {
            paused_at: t0() + Duration::minutes(5),
            resumed_at: t0() + Duration::minutes(7),
        });
        store.save(&session).unwrap();
        let before = storage.get(SESSION_KEY).unwrap().unwrap();

        let loaded = store.load().unwrap();
        store.save(&loaded).unwrap();
        let after = storage.get(SESSION_KEY).unwrap().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn duration_subtracts_every_pause() {
        let mut session = sample_session();
        session.pauses = vec![
            PauseInterval {
                paused_at: t0() + Duration::minutes(10),
                resumed_at: t0() + Duration::minutes(15),
            },
            PauseInterval {
                paused_at: t0() + Duration::minutes(30),
                resumed_at: t0() + Duration::minutes(32),
            },
        ];
        session.status = SessionStatus::Completed;
        session.completed_at = Some(t0() + Duration::minutes(60));
        assert_eq!(calculate_session_duration(&session, t0()), 53 * 60);
    }

    #[test]
    fn duration_of_in_progress_session_uses_now() {
        let mut session = sample_session();
        let now = t0() + Duration::minutes(40);
        assert_eq!(calculate_session_duration(&session, now), 40 * 60);

        session.status = SessionStatus::Paused;
        session.paused_at = Some(t0() + Duration::minutes(25));
        assert_eq!(calculate_session_duration(&session, now), 25 * 60);
    }

    #[test]
    fn duration_of_unstarted_session_is_zero() {
        let session = WorkoutSession::new("athlete-1", vec![]);
        assert_eq!(calculate_session_duration(&session, t0()), 0);
    }
}
