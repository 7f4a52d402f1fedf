use rand::seq::SliceRandom;

use crate::records::{PrKind, PrResult};
use crate::session::WorkoutSession;

const PR_WORDS: [&str; 6] = [
    "NEW PR!",
    "BEAST MODE!",
    "STRONGER!",
    "RECORD!",
    "UNSTOPPABLE!",
    "LIGHT WEIGHT!",
];

const FINISH_WORDS: [&str; 4] = ["WORKOUT DONE!", "GREAT SESSION!", "NAILED IT!", "FINISHED!"];

/// Banner printed after a record or a finished workout.
#[derive(Debug, Clone, PartialEq)]
pub struct Celebration {
    pub headline: &'static str,
    pub detail: String,
}

impl Celebration {
    /// Banner for a set, if it was a record.
    pub fn for_pr(pr: &PrResult, weight: f64, reps: u32) -> Option<Self> {
        if !pr.is_pr {
            return None;
        }
        let mut rng = rand::thread_rng();
        let headline = PR_WORDS.choose(&mut rng).copied().unwrap_or("NEW PR!");
        Some(Self {
            headline,
            detail: describe_pr(pr, weight, reps),
        })
    }

    /// Banner for a completed session.
    pub fn for_completion(session: &WorkoutSession) -> Self {
        let mut rng = rand::thread_rng();
        let headline = FINISH_WORDS
            .choose(&mut rng)
            .copied()
            .unwrap_or("WORKOUT DONE!");
        let records = session
            .exercises
            .iter()
            .flat_map(|e| e.set_records.iter())
            .filter(|r| r.pr.map(|p| p.is_pr).unwrap_or(false))
            .count();
        let minutes = session.total_duration_seconds.unwrap_or(0) / 60;
        let mut detail = format!("{} sets in {} min", session.total_sets(), minutes);
        if records > 0 {
            detail.push_str(&format!(", {records} PR{}", if records == 1 { "" } else { "s" }));
        }
        Self { headline, detail }
    }
}

/// One-line description of a record, e.g. `1RM 123 kg (+5.1%)`.
pub fn describe_pr(pr: &PrResult, weight: f64, reps: u32) -> String {
    let first_time = pr.previous_best.is_none();
    match pr.kind {
        Some(_) if first_time => format!("first logged set: {weight} kg x {reps}"),
        Some(PrKind::OneRepMax) => format!(
            "estimated 1RM {} kg (+{:.1}%)",
            crate::records::estimated_one_rep_max(weight, reps),
            pr.improvement
        ),
        Some(PrKind::Weight) => format!("heaviest set {weight} kg (+{:.1}%)", pr.improvement),
        Some(PrKind::Reps) => format!("most reps {reps} at {weight} kg (+{:.1}%)", pr.improvement),
        Some(PrKind::Volume) => format!(
            "best volume {} kg (+{:.1}%)",
            crate::records::volume(weight, reps),
            pr.improvement
        ),
        None => String::new(),
    }
}
