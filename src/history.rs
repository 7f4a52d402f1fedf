use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use tracing::debug;

use crate::error::HistoryError;
use crate::records::{HistoricalSet, HistoryProvider};
use crate::session::WorkoutSession;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS set_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        athlete_id TEXT NOT NULL,
        exercise_id TEXT NOT NULL,
        session_id TEXT NOT NULL,
        set_index INTEGER NOT NULL,
        weight REAL NOT NULL,
        reps INTEGER NOT NULL,
        performed_at TEXT NOT NULL,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
        UNIQUE (session_id, exercise_id, set_index)
    );
    CREATE INDEX IF NOT EXISTS idx_set_history_lookup
        ON set_history(athlete_id, exercise_id, performed_at);
"#;

/// Local record of completed sets, consulted by PR checks.
#[derive(Debug)]
pub struct HistoryDb {
    conn: Connection,
}

impl HistoryDb {
    pub fn open(path: &Path) -> Result<Self, HistoryError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| HistoryError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, HistoryError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, HistoryError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Append every completed set of a synced session. Re-recording the same
    /// session inserts nothing new.
    pub fn record_session(&mut self, session: &WorkoutSession) -> Result<usize, HistoryError> {
        let tx = self.conn.transaction()?;
        let mut inserted = 0;

        for exercise in &session.exercises {
            for (set_index, record) in exercise.set_records.iter().enumerate() {
                if !record.completed {
                    continue;
                }
                inserted += tx.execute(
                    r#"
                    INSERT OR IGNORE INTO set_history
                    (athlete_id, exercise_id, session_id, set_index, weight, reps, performed_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    "#,
                    params![
                        session.athlete_id,
                        exercise.exercise_id,
                        session.id,
                        set_index as i64,
                        record.weight,
                        record.reps,
                        record.recorded_at.to_rfc3339(),
                    ],
                )?;
            }
        }

        tx.commit()?;
        debug!(session_id = %session.id, inserted, "Recorded session history");
        Ok(inserted)
    }

    /// Exercises this athlete has any history for, alphabetically.
    pub fn exercises(&self, athlete_id: &str) -> Result<Vec<String>, HistoryError> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT exercise_id FROM set_history WHERE athlete_id = ?1 ORDER BY exercise_id",
        )?;
        let rows = stmt.query_map([athlete_id], |row| row.get::<_, String>(0))?;
        let mut exercises = Vec::new();
        for row in rows {
            exercises.push(row?);
        }
        Ok(exercises)
    }
}

impl HistoryProvider for HistoryDb {
    fn recent_sets(
        &self,
        athlete_id: &str,
        exercise_id: &str,
        limit: usize,
    ) -> Result<Vec<HistoricalSet>, HistoryError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT weight, reps, performed_at
            FROM set_history
            WHERE athlete_id = ?1 AND exercise_id = ?2
            ORDER BY performed_at DESC, id DESC
            LIMIT ?3
            "#,
        )?;

        let rows = stmt.query_map(params![athlete_id, exercise_id, limit as i64], |row| {
            Ok((
                row.get::<_, f64>(0)?,
                row.get::<_, u32>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut sets = Vec::new();
        for row in rows {
            let (weight, reps, performed_at) = row?;
            let performed_at = DateTime::parse_from_rfc3339(&performed_at)
                .map_err(|_| HistoryError::BadTimestamp(performed_at.clone()))?
                .with_timezone(&Utc);
            sets.push(HistoricalSet {
                weight,
                reps,
                performed_at,
            });
        }
        Ok(sets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionExercise, SetRecord};
    use chrono::{Duration, TimeZone};
    use tempfile::tempdir;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 7, 30, 0).unwrap()
    }

    fn finished_session(athlete: &str, sets: &[(f64, u32)], start: DateTime<Utc>) -> WorkoutSession {
        let mut session = WorkoutSession::started(
            athlete,
            vec![SessionExercise::new("squat", "Back Squat")],
            start,
        );
        for (i, (weight, reps)) in sets.iter().enumerate() {
            session.exercises[0].set_records.push(SetRecord::new(
                *weight,
                *reps,
                start + Duration::minutes(i as i64 * 3),
            ));
            session.exercises[0].sets_completed += 1;
        }
        session
    }

    #[test]
    fn recent_sets_most_recent_first() {
        let mut db = HistoryDb::open_in_memory().unwrap();
        db.record_session(&finished_session("a", &[(100.0, 5), (105.0, 5)], t0()))
            .unwrap();
        db.record_session(&finished_session(
            "a",
            &[(110.0, 3)],
            t0() + Duration::days(3),
        ))
        .unwrap();

        let sets = db.recent_sets("a", "squat", 10).unwrap();
        let weights: Vec<f64> = sets.iter().map(|s| s.weight).collect();
        assert_eq!(weights, vec![110.0, 105.0, 100.0]);

        let bounded = db.recent_sets("a", "squat", 2).unwrap();
        assert_eq!(bounded.len(), 2);
    }

    #[test]
    fn recording_twice_is_idempotent() {
        let mut db = HistoryDb::open_in_memory().unwrap();
        let session = finished_session("a", &[(60.0, 8), (60.0, 8)], t0());
        assert_eq!(db.record_session(&session).unwrap(), 2);
        assert_eq!(db.record_session(&session).unwrap(), 0);
        assert_eq!(db.recent_sets("a", "squat", 10).unwrap().len(), 2);
    }

    #[test]
    fn history_is_scoped_to_athlete() {
        let mut db = HistoryDb::open_in_memory().unwrap();
        db.record_session(&finished_session("a", &[(100.0, 5)], t0()))
            .unwrap();
        assert!(db.recent_sets("b", "squat", 10).unwrap().is_empty());
        assert_eq!(db.exercises("a").unwrap(), vec!["squat".to_string()]);
    }

    #[test]
    fn empty_history_for_new_exercise() {
        let db = HistoryDb::open_in_memory().unwrap();
        assert!(db.recent_sets("a", "deadlift", 10).unwrap().is_empty());
    }

    #[test]
    fn persists_on_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("spotter.db");
        {
            let mut db = HistoryDb::open(&path).unwrap();
            db.record_session(&finished_session("a", &[(80.0, 10)], t0()))
                .unwrap();
        }
        let db = HistoryDb::open(&path).unwrap();
        assert_eq!(db.recent_sets("a", "squat", 5).unwrap()[0].reps, 10);
    }
}
