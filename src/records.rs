//! Personal record detection.
//!
//! A set is compared against the athlete's prior sets for the same exercise. The
//! checks run in a fixed order and the first match wins, so a set is never
//! reported as two kinds of record at once.

use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::HistoryError;
use crate::session::SetRecord;

/// Rep records only count at or above this share of the best weight.
pub const REP_PR_WEIGHT_FLOOR: f64 = 0.9;

pub const DEFAULT_HISTORY_LIMIT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
pub enum PrKind {
    #[serde(rename = "1rm")]
    #[strum(serialize = "1rm")]
    OneRepMax,
    #[serde(rename = "weight")]
    #[strum(serialize = "weight")]
    Weight,
    #[serde(rename = "reps")]
    #[strum(serialize = "reps")]
    Reps,
    #[serde(rename = "volume")]
    #[strum(serialize = "volume")]
    Volume,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PrResult {
    pub is_pr: bool,
    #[serde(rename = "type")]
    pub kind: Option<PrKind>,
    /// Percentage increase over the previous best of the triggering metric.
    pub improvement: f64,
    pub previous_best: Option<f64>,
}

impl PrResult {
    pub fn none() -> Self {
        Self {
            is_pr: false,
            kind: None,
            improvement: 0.0,
            previous_best: None,
        }
    }

    fn record(kind: PrKind, current: f64, previous: f64) -> Self {
        Self {
            is_pr: true,
            kind: Some(kind),
            improvement: improvement(current, previous),
            previous_best: Some(previous),
        }
    }
}

/// One prior set as returned by the history query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoricalSet {
    pub weight: f64,
    pub reps: u32,
    pub performed_at: DateTime<Utc>,
}

impl From<&SetRecord> for HistoricalSet {
    fn from(record: &SetRecord) -> Self {
        Self {
            weight: record.weight,
            reps: record.reps,
            performed_at: record.recorded_at,
        }
    }
}

/// Epley estimate. Singles are returned as-is so the most important rep range
/// never picks up rounding.
pub fn estimated_one_rep_max(weight: f64, reps: u32) -> f64 {
    if reps == 1 {
        weight
    } else {
        (weight * (1.0 + reps as f64 / 30.0)).round()
    }
}

pub fn volume(weight: f64, reps: u32) -> f64 {
    weight * reps as f64
}

fn improvement(current: f64, previous: f64) -> f64 {
    if previous <= 0.0 {
        return 100.0;
    }
    (current - previous) / previous * 100.0
}

#[derive(Debug, Clone, Copy)]
struct Bests {
    one_rep_max: f64,
    weight: f64,
    reps: u32,
    volume: f64,
}

impl Bests {
    fn of(history: &[HistoricalSet]) -> Option<Self> {
        history.iter().fold(None, |acc: Option<Bests>, set| {
            let e1rm = estimated_one_rep_max(set.weight, set.reps);
            let vol = volume(set.weight, set.reps);
            Some(match acc {
                None => Bests {
                    one_rep_max: e1rm,
                    weight: set.weight,
                    reps: set.reps,
                    volume: vol,
                },
                Some(b) => Bests {
                    one_rep_max: b.one_rep_max.max(e1rm),
                    weight: b.weight.max(set.weight),
                    reps: b.reps.max(set.reps),
                    volume: b.volume.max(vol),
                },
            })
        })
    }
}

/// Classify `(weight, reps)` against prior sets.
pub fn check_for_pr(weight: f64, reps: u32, history: &[HistoricalSet]) -> PrResult {
    let Some(best) = Bests::of(history) else {
        return PrResult {
            is_pr: true,
            kind: Some(PrKind::OneRepMax),
            improvement: 100.0,
            previous_best: None,
        };
    };

    let e1rm = estimated_one_rep_max(weight, reps);
    if e1rm > best.one_rep_max {
        return PrResult::record(PrKind::OneRepMax, e1rm, best.one_rep_max);
    }
    if weight > best.weight {
        return PrResult::record(PrKind::Weight, weight, best.weight);
    }
    if reps > best.reps && weight >= best.weight * REP_PR_WEIGHT_FLOOR {
        return PrResult::record(PrKind::Reps, reps as f64, best.reps as f64);
    }
    let vol = volume(weight, reps);
    if vol > best.volume {
        return PrResult::record(PrKind::Volume, vol, best.volume);
    }
    PrResult::none()
}

/// Prior sets for an athlete and exercise, most recent first, at most `limit`.
pub trait HistoryProvider {
    fn recent_sets(
        &self,
        athlete_id: &str,
        exercise_id: &str,
        limit: usize,
    ) -> Result<Vec<HistoricalSet>, HistoryError>;
}

/// PR checks backed by a history query. Lookup failures never escape: they are
/// logged and the set is treated as not a record.
pub struct PrEngine {
    history: Box<dyn HistoryProvider>,
    limit: usize,
}

impl std::fmt::Debug for PrEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrEngine").field("limit", &self.limit).finish()
    }
}

impl PrEngine {
    pub fn new(history: Box<dyn HistoryProvider>) -> Self {
        Self {
            history,
            limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn check(&self, athlete_id: &str, exercise_id: &str, weight: f64, reps: u32) -> PrResult {
        self.check_with_session_sets(athlete_id, exercise_id, weight, reps, &[])
    }

    /// Like [`check`](Self::check), but sets already logged in the running session
    /// count as history too.
    pub fn check_with_session_sets(
        &self,
        athlete_id: &str,
        exercise_id: &str,
        weight: f64,
        reps: u32,
        session_sets: &[SetRecord],
    ) -> PrResult {
        let stored = match self.history.recent_sets(athlete_id, exercise_id, self.limit) {
            Ok(stored) => stored,
            Err(err) => {
                warn!(athlete_id, exercise_id, error = %err, "History lookup failed; skipping PR check");
                return PrResult::none();
            }
        };

        let history: Vec<HistoricalSet> = session_sets
            .iter()
            .filter(|r| r.completed)
            .map(HistoricalSet::from)
            .sorted_by(|a, b| b.performed_at.cmp(&a.performed_at))
            .chain(stored)
            .collect();

        let result = check_for_pr(weight, reps, &history);
        debug!(
            athlete_id,
            exercise_id,
            weight,
            reps,
            prior_sets = history.len(),
            is_pr = result.is_pr,
            "PR check"
        );
        result
    }
}
