//! Crash recovery for the session editor.
//!
//! The supervisor wraps an editing step. When the step fails or panics it writes
//! the draft the editor was holding to a recovery slot, separate from the normal
//! session snapshot, and stays errored until the user picks one of three choices.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::EditorFault;
use crate::runtime::Clock;
use crate::session::WorkoutSession;
use crate::store::KeyValueStorage;

/// Storage key of the crash-captured draft.
pub const RECOVERY_KEY: &str = "spotter.recovery_draft";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryRecord {
    pub draft: WorkoutSession,
    pub error_message: String,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BoundaryState {
    Clean,
    Errored { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum RecoveryChoice {
    /// Reopen the editor on the captured draft.
    Recover,
    /// Reopen the editor on clean state, keeping the draft for later.
    Retry,
    /// Drop the draft for good.
    Discard,
}

#[derive(Debug)]
pub struct RecoverySupervisor<S, C> {
    storage: S,
    clock: C,
    state: BoundaryState,
    captured: Option<RecoveryRecord>,
}

impl<S: KeyValueStorage, C: Clock> RecoverySupervisor<S, C> {
    pub fn new(storage: S, clock: C) -> Self {
        Self {
            storage,
            clock,
            state: BoundaryState::Clean,
            captured: None,
        }
    }

    pub fn state(&self) -> &BoundaryState {
        &self.state
    }

    /// Options to present while errored; none when clean.
    pub fn choices(&self) -> &'static [RecoveryChoice] {
        match self.state {
            BoundaryState::Clean => &[],
            BoundaryState::Errored { .. } => &[
                RecoveryChoice::Recover,
                RecoveryChoice::Retry,
                RecoveryChoice::Discard,
            ],
        }
    }

    /// Run one editing step over `draft`. Errors and panics are captured along with
    /// the draft as it stood when the fault happened.
    pub fn guard<T, E, F>(&mut self, draft: &mut WorkoutSession, editor: F) -> Result<T, EditorFault>
    where
        E: std::fmt::Display,
        F: FnOnce(&mut WorkoutSession) -> Result<T, E>,
    {
        if self.state != BoundaryState::Clean {
            return Err(EditorFault::Unresolved);
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| editor(&mut *draft)));
        let fault = match outcome {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => EditorFault::Failed(err.to_string()),
            Err(payload) => EditorFault::Panicked(panic_payload_to_string(payload.as_ref())),
        };

        self.capture(draft, &fault);
        Err(fault)
    }

    /// Record a fault raised outside of [`guard`](Self::guard).
    pub fn capture(&mut self, draft: &WorkoutSession, fault: &EditorFault) {
        let message = fault.to_string();
        error!(session_id = %draft.id, error = %message, "Session editor fault; capturing draft");

        let record = RecoveryRecord {
            draft: draft.clone(),
            error_message: message.clone(),
            captured_at: self.clock.now(),
        };
        // Best effort: a failed capture must not replace the original fault.
        match serde_json::to_string(&record) {
            Ok(data) => {
                if let Err(err) = self.storage.set(RECOVERY_KEY, &data) {
                    warn!(error = %err, "Failed to write recovery slot");
                }
            }
            Err(err) => warn!(error = %err, "Failed to serialize recovery draft"),
        }

        self.captured = Some(record);
        self.state = BoundaryState::Errored { message };
    }

    /// Whether a draft is waiting to be recovered, with when and why it was captured.
    pub fn pending(&self) -> Option<RecoveryRecord> {
        if let Some(record) = &self.captured {
            return Some(record.clone());
        }
        read_slot(&self.storage)
    }

    /// Hand back the captured draft and return to clean. The slot is consumed.
    pub fn recover(&mut self) -> Option<WorkoutSession> {
        let record = self.captured.take().or_else(|| read_slot(&self.storage));
        self.remove_slot();
        self.state = BoundaryState::Clean;
        let draft = record.map(|r| r.draft);
        if let Some(draft) = &draft {
            debug!(session_id = %draft.id, "Recovered draft");
        }
        draft
    }

    /// Return to clean without touching the saved draft.
    pub fn retry(&mut self) {
        self.captured = None;
        self.state = BoundaryState::Clean;
    }

    /// Remove the saved draft so the prompt does not come back.
    pub fn discard(&mut self) {
        self.captured = None;
        self.remove_slot();
        self.state = BoundaryState::Clean;
        debug!("Discarded recovery draft");
    }

    fn remove_slot(&self) {
        if let Err(err) = self.storage.remove(RECOVERY_KEY) {
            warn!(error = %err, "Failed to remove recovery slot");
        }
    }
}

fn read_slot<S: KeyValueStorage>(storage: &S) -> Option<RecoveryRecord> {
    let raw = match storage.get(RECOVERY_KEY) {
        Ok(raw) => raw?,
        Err(err) => {
            warn!(error = %err, "Failed to read recovery slot");
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(record) => Some(record),
        Err(err) => {
            warn!(error = %err, "Ignoring corrupt recovery slot");
            None
        }
    }
}

fn panic_payload_to_string(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::runtime::ManualClock;
    use crate::session::{SessionExercise, SetRecord};
    use crate::store::{MemoryStorage, SessionStore, SESSION_KEY};
    use assert_matches::assert_matches;
    use chrono::TimeZone;
    use std::rc::Rc;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 10, 19, 15, 0).unwrap()
    }

    fn draft_with_one_completed_exercise() -> WorkoutSession {
        let mut draft = WorkoutSession::started(
            "athlete-1",
            vec![
                SessionExercise::new("squat", "Back Squat"),
                SessionExercise::new("bench", "Bench Press"),
            ],
            t0(),
        );
        draft.exercises[0]
            .set_records
            .push(SetRecord::new(120.0, 3, t0()));
        draft.exercises[0].sets_completed = 1;
        draft.exercises[0].completed = true;
        draft
    }

    fn supervisor() -> (RecoverySupervisor<Rc<MemoryStorage>, ManualClock>, Rc<MemoryStorage>) {
        let storage = Rc::new(MemoryStorage::new());
        (
            RecoverySupervisor::new(storage.clone(), ManualClock::new(t0())),
            storage,
        )
    }

    #[test]
    fn clean_run_passes_value_through() {
        let (mut supervisor, storage) = supervisor();
        let mut draft = draft_with_one_completed_exercise();
        let value = supervisor
            .guard(&mut draft, |d| Ok::<_, String>(d.exercises.len()))
            .unwrap();
        assert_eq!(value, 2);
        assert_eq!(supervisor.state(), &BoundaryState::Clean);
        assert!(storage.get(RECOVERY_KEY).unwrap().is_none());
    }

    #[test]
    fn thrown_error_captures_exact_draft_and_recovers_it() {
        let (mut supervisor, storage) = supervisor();
        let mut draft = draft_with_one_completed_exercise();
        let expected = draft.clone();

        let result: Result<(), _> = supervisor.guard(&mut draft, |_| {
            Err::<(), _>("set table failed to render")
        });
        assert_matches!(result, Err(EditorFault::Failed(msg)) if msg == "set table failed to render");

        let raw = storage.get(RECOVERY_KEY).unwrap().unwrap();
        let slot: RecoveryRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(slot.draft, expected);
        assert!(!slot.error_message.is_empty());
        assert_eq!(slot.captured_at, t0());
        // The normal session slot is untouched.
        assert!(storage.get(SESSION_KEY).unwrap().is_none());

        assert_eq!(supervisor.choices().len(), 3);
        assert_eq!(supervisor.recover(), Some(expected));
        assert_eq!(supervisor.state(), &BoundaryState::Clean);
        assert!(supervisor.pending().is_none());
    }

    #[test]
    fn panic_is_captured_with_partially_edited_draft() {
        let (mut supervisor, _storage) = supervisor();
        let mut draft = draft_with_one_completed_exercise();

        let result: Result<(), EditorFault> = supervisor.guard(&mut draft, |d| {
            d.current_exercise_index = 1;
            let missing = d.exercises.len() + 3;
            let _ = &d.exercises[missing];
            Ok::<(), String>(())
        });
        assert_matches!(result, Err(EditorFault::Panicked(_)));

        let pending = supervisor.pending().unwrap();
        assert_eq!(pending.draft.current_exercise_index, 1);
        assert!(pending.error_message.contains("panicked"));
    }

    #[test]
    fn errored_boundary_refuses_further_edits() {
        let (mut supervisor, _storage) = supervisor();
        let mut draft = draft_with_one_completed_exercise();
        let _ = supervisor.guard(&mut draft, |_| Err::<(), _>("boom"));
        let again = supervisor.guard(&mut draft, |_| Ok::<_, String>(()));
        assert_eq!(again, Err(EditorFault::Unresolved));
    }

    #[test]
    fn retry_keeps_slot_and_discard_removes_it() {
        let (mut supervisor, storage) = supervisor();
        let mut draft = draft_with_one_completed_exercise();
        let _ = supervisor.guard(&mut draft, |_| Err::<(), _>("boom"));

        supervisor.retry();
        assert_eq!(supervisor.state(), &BoundaryState::Clean);
        assert!(supervisor.choices().is_empty());
        assert!(storage.get(RECOVERY_KEY).unwrap().is_some());
        assert_eq!(supervisor.pending().unwrap().error_message, "boom");

        supervisor.discard();
        assert!(storage.get(RECOVERY_KEY).unwrap().is_none());
        assert!(supervisor.pending().is_none());
    }

    #[test]
    fn slot_survives_for_a_later_supervisor() {
        let (mut supervisor, storage) = supervisor();
        let mut draft = draft_with_one_completed_exercise();
        let _ = supervisor.guard(&mut draft, |_| Err::<(), _>("boom"));

        let mut later = RecoverySupervisor::new(storage.clone(), ManualClock::new(t0()));
        assert_eq!(later.state(), &BoundaryState::Clean);
        assert_eq!(later.pending().map(|r| r.draft), Some(draft.clone()));
        assert_eq!(later.recover(), Some(draft));
        assert!(storage.get(RECOVERY_KEY).unwrap().is_none());
    }

    struct ReadOnlyStorage;

    impl KeyValueStorage for ReadOnlyStorage {
        fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
            Ok(None)
        }

        fn set(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
            Err(StorageError::Serialize(
                serde_json::from_str::<u8>("x").unwrap_err(),
            ))
        }

        fn remove(&self, _key: &str) -> Result<(), StorageError> {
            Ok(())
        }
    }

    #[test]
    fn failed_capture_does_not_mask_original_error() {
        let mut supervisor = RecoverySupervisor::new(ReadOnlyStorage, ManualClock::new(t0()));
        let mut draft = draft_with_one_completed_exercise();
        let result: Result<(), _> = supervisor.guard(&mut draft, |_| Err::<(), _>("original"));
        assert_eq!(result, Err(EditorFault::Failed("original".into())));
        // The in-memory copy still allows recovery.
        assert_eq!(supervisor.recover(), Some(draft));
    }

    #[test]
    fn corrupt_slot_reads_as_nothing_to_recover() {
        let storage = Rc::new(MemoryStorage::new());
        storage.set(RECOVERY_KEY, "not json").unwrap();
        let supervisor = RecoverySupervisor::new(storage.clone(), ManualClock::new(t0()));
        assert!(supervisor.pending().is_none());
        // Unrelated to the session store.
        assert!(SessionStore::new(storage).load().is_none());
    }
}
