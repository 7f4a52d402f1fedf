use tracing::{debug, info, warn};

use crate::records::{PrEngine, PrResult};
use crate::runtime::Clock;
use crate::session::{reduce, SessionAction, SetRecord, Transition, WorkoutSession};
use crate::store::{KeyValueStorage, SessionStore};
use crate::sync::SyncEvent;

/// Owns the current workout session. All changes go through [`dispatch`]; the
/// snapshot is only ever lent out immutably.
///
/// Every committed transition is written to the store before `dispatch` returns.
/// Write failures are logged and do not block the next action, so a crash right
/// after a failed write loses that one transition.
///
/// [`dispatch`]: SessionController::dispatch
#[derive(Debug)]
pub struct SessionController<S, C> {
    current: Option<WorkoutSession>,
    store: SessionStore<S>,
    clock: C,
    pr_engine: Option<PrEngine>,
}

impl<S: KeyValueStorage, C: Clock> SessionController<S, C> {
    pub fn new(store: SessionStore<S>, clock: C) -> Self {
        Self {
            current: None,
            store,
            clock,
            pr_engine: None,
        }
    }

    pub fn with_pr_engine(mut self, engine: PrEngine) -> Self {
        self.pr_engine = Some(engine);
        self
    }

    /// Load the persisted session, if any. Meant to run once at start-up.
    pub fn restore(&mut self) -> Option<&WorkoutSession> {
        self.current = self.store.load();
        if let Some(session) = &self.current {
            info!(session_id = %session.id, status = %session.status, "Resumed persisted session");
        }
        self.current.as_ref()
    }

    pub fn session(&self) -> Option<&WorkoutSession> {
        self.current.as_ref()
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// Apply one action. Returns whether the session changed.
    pub fn dispatch(&mut self, action: SessionAction) -> bool {
        match reduce(self.current.as_ref(), action) {
            Transition::Replace(next) => {
                if let Err(err) = self.store.save(&next) {
                    warn!(session_id = %next.id, error = %err, "Failed to persist session snapshot");
                }
                self.current = Some(next);
                true
            }
            Transition::Clear => {
                if let Err(err) = self.store.clear() {
                    warn!(error = %err, "Failed to clear session snapshot");
                }
                if let Some(old) = self.current.take() {
                    debug!(session_id = %old.id, "Session cleared");
                }
                true
            }
            Transition::Unchanged => false,
        }
    }

    pub fn start_session(&mut self, session: WorkoutSession) -> bool {
        if let Some(previous) = &self.current {
            if previous.id != session.id && !previous.is_completed() {
                info!(previous = %previous.id, next = %session.id, "Replacing unfinished session");
            }
        }
        self.dispatch(SessionAction::Start(session))
    }

    pub fn begin_session(&mut self) -> bool {
        let at = self.clock.now();
        self.dispatch(SessionAction::Begin { at })
    }

    pub fn pause_session(&mut self) -> bool {
        let at = self.clock.now();
        self.dispatch(SessionAction::Pause { at })
    }

    pub fn resume_session(&mut self) -> bool {
        let at = self.clock.now();
        self.dispatch(SessionAction::Resume { at })
    }

    pub fn update_exercise_index(&mut self, index: usize) -> bool {
        self.dispatch(SessionAction::UpdateExerciseIndex { index })
    }

    pub fn add_set_record(&mut self, exercise_index: usize, record: SetRecord) -> bool {
        self.dispatch(SessionAction::AddSetRecord {
            exercise_index,
            record,
        })
    }

    /// Log a completed set, classifying it against history first. Returns the PR
    /// result when the set was accepted.
    pub fn log_set(&mut self, exercise_index: usize, weight: f64, reps: u32) -> Option<PrResult> {
        let session = self.current.as_ref()?;
        let exercise = session.exercises.get(exercise_index)?;

        let pr = match &self.pr_engine {
            Some(engine) => engine.check_with_session_sets(
                &session.athlete_id,
                &exercise.exercise_id,
                weight,
                reps,
                &exercise.set_records,
            ),
            None => PrResult::none(),
        };

        let record = SetRecord::new(weight, reps, self.clock.now()).with_pr(pr);
        if self.add_set_record(exercise_index, record) {
            if pr.is_pr {
                info!(exercise_index, weight, reps, kind = ?pr.kind, "Personal record");
            }
            Some(pr)
        } else {
            None
        }
    }

    pub fn complete_exercise(&mut self, exercise_index: usize) -> bool {
        self.dispatch(SessionAction::CompleteExercise { exercise_index })
    }

    pub fn complete_session(&mut self) -> bool {
        let at = self.clock.now();
        self.dispatch(SessionAction::Complete { at })
    }

    pub fn clear_session(&mut self) -> bool {
        self.dispatch(SessionAction::Clear)
    }

    /// React to completion sync. Only the session that was synced is ever cleared.
    pub fn apply_sync_event(&mut self, event: &SyncEvent) {
        match event {
            SyncEvent::Synced { session_id } => {
                debug!(session_id = %session_id, "Completion acknowledged; clear scheduled");
            }
            SyncEvent::Failed { session_id, .. } => {
                debug!(session_id = %session_id, "Completion not acknowledged; session kept");
            }
            SyncEvent::ClearDue { session_id } => {
                let matches = self
                    .current
                    .as_ref()
                    .map(|s| &s.id == session_id)
                    .unwrap_or(false);
                if matches {
                    self.clear_session();
                } else {
                    debug!(session_id = %session_id, "Synced session is no longer current; nothing to clear");
                }
            }
        }
    }
}
