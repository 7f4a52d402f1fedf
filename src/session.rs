use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::records::PrResult;
use crate::store::calculate_session_duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionStatus {
    NotStarted,
    Active,
    Paused,
    Completed,
}

/// One performed set. Never edited once appended; corrections are new records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetRecord {
    pub weight: f64,
    pub reps: u32,
    pub completed: bool,
    pub recorded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr: Option<PrResult>,
}

impl SetRecord {
    pub fn new(weight: f64, reps: u32, recorded_at: DateTime<Utc>) -> Self {
        Self {
            weight,
            reps,
            completed: true,
            recorded_at,
            pr: None,
        }
    }

    /// Attach the PR classification before the record is appended.
    pub fn with_pr(mut self, pr: PrResult) -> Self {
        self.pr = Some(pr);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionExercise {
    pub exercise_id: String,
    pub name: String,
    #[serde(default)]
    pub planned_sets: Option<u32>,
    pub set_records: Vec<SetRecord>,
    pub sets_completed: u32,
    pub completed: bool,
}

impl SessionExercise {
    pub fn new(exercise_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            exercise_id: exercise_id.into(),
            name: name.into(),
            planned_sets: None,
            set_records: Vec::new(),
            sets_completed: 0,
            completed: false,
        }
    }

    pub fn with_planned_sets(mut self, sets: u32) -> Self {
        self.planned_sets = Some(sets);
        self
    }
}

/// A closed pause, from `pause_session` to the matching `resume_session`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PauseInterval {
    pub paused_at: DateTime<Utc>,
    pub resumed_at: DateTime<Utc>,
}

impl PauseInterval {
    pub fn seconds(&self) -> i64 {
        (self.resumed_at - self.paused_at).num_seconds().max(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkoutSession {
    pub id: String,
    pub athlete_id: String,
    pub status: SessionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pauses: Vec<PauseInterval>,
    pub total_duration_seconds: Option<i64>,
    pub current_exercise_index: usize,
    pub exercises: Vec<SessionExercise>,
}

impl WorkoutSession {
    /// A session that has been assigned but not begun.
    pub fn new(athlete_id: impl Into<String>, exercises: Vec<SessionExercise>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            athlete_id: athlete_id.into(),
            status: SessionStatus::NotStarted,
            started_at: None,
            paused_at: None,
            completed_at: None,
            pauses: Vec::new(),
            total_duration_seconds: None,
            current_exercise_index: 0,
            exercises,
        }
    }

    /// A session that is already running from `started_at`.
    pub fn started(
        athlete_id: impl Into<String>,
        exercises: Vec<SessionExercise>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let mut session = Self::new(athlete_id, exercises);
        session.status = SessionStatus::Active;
        session.started_at = Some(started_at);
        session
    }

    pub fn is_completed(&self) -> bool {
        self.status == SessionStatus::Completed
    }

    pub fn total_sets(&self) -> usize {
        self.exercises.iter().map(|e| e.set_records.len()).sum()
    }

    /// Whether this is a well-formed session for `start_session`.
    fn is_startable(&self) -> bool {
        let status_ok = match self.status {
            SessionStatus::NotStarted => true,
            SessionStatus::Active => self.started_at.is_some(),
            _ => false,
        };
        status_ok
            && self
                .exercises
                .iter()
                .all(|e| e.set_records.is_empty() && e.sets_completed == 0 && !e.completed)
    }

    /// Whether sets can still be logged against this session.
    fn is_in_progress(&self) -> bool {
        matches!(self.status, SessionStatus::Active | SessionStatus::Paused)
    }
}

/// The closed set of operations the session reducer understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionAction {
    Start(WorkoutSession),
    /// Replace state with a previously captured snapshot (crash recovery).
    Restore(WorkoutSession),
    Begin {
        at: DateTime<Utc>,
    },
    Pause {
        at: DateTime<Utc>,
    },
    Resume {
        at: DateTime<Utc>,
    },
    UpdateExerciseIndex {
        index: usize,
    },
    AddSetRecord {
        exercise_index: usize,
        record: SetRecord,
    },
    CompleteExercise {
        exercise_index: usize,
    },
    Complete {
        at: DateTime<Utc>,
    },
    Clear,
    #[serde(other)]
    Unknown,
}

/// Result of applying one action.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Replace(WorkoutSession),
    Clear,
    Unchanged,
}

/// Pure reducer over the current session. Never performs I/O.
pub fn reduce(current: Option<&WorkoutSession>, action: SessionAction) -> Transition {
    match action {
        SessionAction::Start(session) => {
            if session.is_startable() {
                Transition::Replace(session)
            } else {
                warn!(session_id = %session.id, status = %session.status, "Rejected malformed session start");
                Transition::Unchanged
            }
        }
        SessionAction::Restore(session) => Transition::Replace(session),
        SessionAction::Clear => match current {
            Some(_) => Transition::Clear,
            None => Transition::Unchanged,
        },
        SessionAction::Unknown => {
            debug!("Ignoring unknown session action");
            Transition::Unchanged
        }
        action => match current {
            Some(session) => apply(session, action),
            None => Transition::Unchanged,
        },
    }
}

fn apply(session: &WorkoutSession, action: SessionAction) -> Transition {
    if session.is_completed() {
        return Transition::Unchanged;
    }

    match action {
        SessionAction::Begin { at } if session.status == SessionStatus::NotStarted => {
            let mut next = session.clone();
            next.status = SessionStatus::Active;
            next.started_at = Some(at);
            Transition::Replace(next)
        }
        SessionAction::Pause { at } if session.status == SessionStatus::Active => {
            let mut next = session.clone();
            next.status = SessionStatus::Paused;
            next.paused_at = Some(at);
            Transition::Replace(next)
        }
        SessionAction::Resume { at } if session.status == SessionStatus::Paused => {
            let mut next = session.clone();
            next.status = SessionStatus::Active;
            if let Some(paused_at) = next.paused_at.take() {
                if at > paused_at {
                    next.pauses.push(PauseInterval {
                        paused_at,
                        resumed_at: at,
                    });
                }
            }
            Transition::Replace(next)
        }
        SessionAction::UpdateExerciseIndex { index } => {
            // Bounds are the caller's concern; a stale index is harmless here.
            let mut next = session.clone();
            next.current_exercise_index = index;
            Transition::Replace(next)
        }
        SessionAction::AddSetRecord {
            exercise_index,
            record,
        } if session.is_in_progress() => {
            // NaN and infinities serialize as `null` and would make the snapshot unreadable.
            if !(record.weight.is_finite() && record.weight >= 0.0) {
                warn!(exercise_index, weight = record.weight, "Set ignored for invalid weight");
                return Transition::Unchanged;
            }
            match session.exercises.get(exercise_index) {
                Some(exercise) if !exercise.completed => {}
                Some(_) => {
                    debug!(exercise_index, "Set ignored for completed exercise");
                    return Transition::Unchanged;
                }
                None => {
                    warn!(exercise_index, "Set ignored for unknown exercise");
                    return Transition::Unchanged;
                }
            }
            let mut next = session.clone();
            let exercise = &mut next.exercises[exercise_index];
            exercise.set_records.push(record);
            exercise.sets_completed += 1;
            Transition::Replace(next)
        }
        SessionAction::CompleteExercise { exercise_index } if session.is_in_progress() => {
            match session.exercises.get(exercise_index) {
                Some(exercise) if !exercise.completed => {
                    let mut next = session.clone();
                    next.exercises[exercise_index].completed = true;
                    Transition::Replace(next)
                }
                _ => Transition::Unchanged,
            }
        }
        SessionAction::Complete { at } if session.is_in_progress() => {
            let mut next = session.clone();
            if let Some(paused_at) = next.paused_at.take() {
                if at > paused_at {
                    next.pauses.push(PauseInterval {
                        paused_at,
                        resumed_at: at,
                    });
                }
            }
            next.status = SessionStatus::Completed;
            next.completed_at = Some(at);
            next.total_duration_seconds = Some(calculate_session_duration(&next, at));
            Transition::Replace(next)
        }
        _ => Transition::Unchanged,
    }
}
