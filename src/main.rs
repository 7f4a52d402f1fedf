use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use spotter::app_dirs::AppDirs;
use spotter::celebration::Celebration;
use spotter::config::{Config, ConfigStore, FileConfigStore};
use spotter::controller::SessionController;
use spotter::error::SpotterError;
use spotter::history::HistoryDb;
use spotter::records::{estimated_one_rep_max, HistoryProvider, PrEngine};
use spotter::recovery::RecoverySupervisor;
use spotter::runtime::{FixedTicker, Runner, SystemClock};
use spotter::session::{SessionAction, SessionExercise, SessionStatus, WorkoutSession};
use spotter::store::{calculate_session_duration, SessionStore, SqliteStorage};
use spotter::sync::{CompletionSync, HttpCompletionEndpoint, SyncEvent};
use spotter::TICK_RATE_MS;

type Controller = SessionController<Rc<SqliteStorage>, SystemClock>;
type Supervisor = RecoverySupervisor<Rc<SqliteStorage>, SystemClock>;

/// run a strength workout set by set, with crash recovery and personal records
#[derive(Parser, Debug)]
#[clap(
    version,
    about,
    long_about = "Tracks the workout in progress on this device: logs sets, flags personal records, survives crashes, and reports the finished session to your coach's server."
)]
pub struct Cli {
    /// directory holding the session database (default: ~/.local/state/spotter)
    #[clap(long, global = true, env = "SPOTTER_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// path to config.json
    #[clap(long, global = true, env = "SPOTTER_CONFIG")]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// start a new session, replacing any session on this device
    Start {
        /// exercise as ID or ID:Display Name, in order
        #[clap(short = 'e', long = "exercise", required = true)]
        exercises: Vec<String>,

        /// athlete performing the session (default: from config)
        #[clap(short = 'a', long)]
        athlete: Option<String>,

        /// planned number of sets per exercise
        #[clap(long)]
        planned_sets: Option<u32>,

        /// set up the session now and `begin` it later
        #[clap(long)]
        later: bool,
    },
    /// begin a session that was started with --later
    Begin,
    /// pause the running session
    Pause,
    /// resume a paused session
    Resume,
    /// move to the exercise at INDEX
    Goto { index: usize },
    /// log a completed set
    Set {
        exercise: usize,
        weight: f64,
        reps: u32,
    },
    /// mark the exercise at INDEX as done
    Done { exercise: usize },
    /// complete the session and report it to the server
    Finish,
    /// retry reporting a completed session
    Sync,
    /// show the session in progress
    Status {
        #[clap(long)]
        json: bool,
    },
    /// throw away the session on this device
    Discard,
    /// inspect, restore, or drop a crash-captured draft
    Recover {
        #[clap(long, conflicts_with = "discard")]
        restore: bool,
        #[clap(long)]
        discard: bool,
    },
    /// recent sets for an exercise, or the exercises with history
    History {
        exercise: Option<String>,
        #[clap(short = 'n', long, default_value_t = 10)]
        limit: usize,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("SPOTTER_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("spotter: {err}");
            ExitCode::FAILURE
        }
    }
}

struct App {
    config: Config,
    controller: Controller,
    supervisor: Supervisor,
    history: HistoryDb,
}

impl App {
    fn open(cli: &Cli) -> Result<Self, SpotterError> {
        let config = match &cli.config {
            Some(path) => FileConfigStore::with_path(path).load(),
            None => FileConfigStore::new().load(),
        };
        let db_path = AppDirs::db_path(cli.data_dir.as_deref()).ok_or(SpotterError::NoDataDir)?;
        debug!(path = %db_path.display(), "Opening session database");

        let storage = Rc::new(SqliteStorage::open(&db_path)?);
        let lookup = HistoryDb::open(&db_path)?;
        let history = HistoryDb::open(&db_path)?;

        let mut controller = SessionController::new(SessionStore::new(storage.clone()), SystemClock)
            .with_pr_engine(PrEngine::new(Box::new(lookup)).with_limit(config.history_limit));
        controller.restore();

        Ok(Self {
            config,
            controller,
            supervisor: RecoverySupervisor::new(storage, SystemClock),
            history,
        })
    }

    fn current(&self) -> Result<&WorkoutSession, SpotterError> {
        self.controller.session().ok_or(SpotterError::NoActiveSession)
    }
}

fn run(cli: Cli) -> Result<(), SpotterError> {
    let mut app = App::open(&cli)?;

    if !matches!(cli.command, Command::Recover { .. }) {
        if let Some(pending) = app.supervisor.pending() {
            eprintln!(
                "note: a draft captured at {} after \"{}\" can be restored with `spotter recover --restore`",
                pending.captured_at.format("%Y-%m-%d %H:%M"),
                pending.error_message
            );
        }
    }

    match cli.command {
        Command::Start {
            exercises,
            athlete,
            planned_sets,
            later,
        } => start(&mut app, exercises, athlete, planned_sets, later),
        Command::Finish => finish(&mut app),
        Command::Sync => sync(&mut app),
        Command::Status { json } => status(&app, json),
        Command::Discard => {
            app.current()?;
            app.controller.clear_session();
            println!("session discarded");
            Ok(())
        }
        Command::Recover { restore, discard } => recover(&mut app, restore, discard),
        Command::History { exercise, limit } => history(&app, exercise.as_deref(), limit),
        edit => supervised_edit(&mut app, edit),
    }
}

fn parse_exercise(arg: &str, planned_sets: Option<u32>) -> SessionExercise {
    let (id, name) = match arg.split_once(':') {
        Some((id, name)) => (id.trim(), name.trim()),
        None => (arg.trim(), arg.trim()),
    };
    let exercise = SessionExercise::new(id, name);
    match planned_sets {
        Some(sets) => exercise.with_planned_sets(sets),
        None => exercise,
    }
}

fn start(
    app: &mut App,
    exercises: Vec<String>,
    athlete: Option<String>,
    planned_sets: Option<u32>,
    later: bool,
) -> Result<(), SpotterError> {
    if let Some(previous) = app.controller.session() {
        if !previous.is_completed() {
            eprintln!("note: replacing unfinished session {}", previous.id);
        }
    }
    let athlete = athlete.unwrap_or_else(|| app.config.athlete_id.clone());
    let exercises = exercises
        .iter()
        .map(|arg| parse_exercise(arg, planned_sets))
        .collect();
    let session = if later {
        WorkoutSession::new(athlete, exercises)
    } else {
        WorkoutSession::started(athlete, exercises, app.controller.now())
    };
    let id = session.id.clone();
    if !app.controller.start_session(session) {
        return Err(SpotterError::Rejected("could not start session".into()));
    }
    println!("started session {id}");
    Ok(())
}

/// Commands that edit the running session go through the recovery supervisor,
/// so a fault leaves the draft behind for `spotter recover`.
fn supervised_edit(app: &mut App, command: Command) -> Result<(), SpotterError> {
    let mut draft = app.current()?.clone();
    let App {
        controller,
        supervisor,
        ..
    } = app;
    supervisor.guard(&mut draft, |_| apply_edit(controller, command))??;
    Ok(())
}

fn apply_edit(controller: &mut Controller, command: Command) -> Result<Result<(), SpotterError>, String> {
    let outcome = match command {
        Command::Begin => expect_change(controller.begin_session(), "session has already begun"),
        Command::Pause => expect_change(controller.pause_session(), "session is not active"),
        Command::Resume => expect_change(controller.resume_session(), "session is not paused"),
        Command::Goto { index } => {
            let len = controller.session().map(|s| s.exercises.len()).unwrap_or(0);
            if index >= len {
                Err(SpotterError::Rejected(format!("no exercise at index {index}")))
            } else {
                expect_change(controller.update_exercise_index(index), "session is finished")
            }
        }
        Command::Set {
            exercise,
            weight,
            reps,
        } => {
            if !(weight.is_finite() && weight >= 0.0) {
                return Ok(Err(SpotterError::Rejected(format!("invalid weight {weight}"))));
            }
            match controller.log_set(exercise, weight, reps) {
                Some(pr) => {
                    println!("logged {weight} kg x {reps}");
                    if let Some(banner) = Celebration::for_pr(&pr, weight, reps) {
                        println!("{} {}", banner.headline, banner.detail);
                    }
                    Ok(())
                }
                None => Err(SpotterError::Rejected(format!(
                    "cannot log a set for exercise {exercise}"
                ))),
            }
        }
        Command::Done { exercise } => expect_change(
            controller.complete_exercise(exercise),
            "exercise is unknown or already done",
        ),
        other => return Err(format!("{other:?} is not an editing command")),
    };
    Ok(outcome)
}

fn expect_change(changed: bool, reason: &str) -> Result<(), SpotterError> {
    if changed {
        Ok(())
    } else {
        Err(SpotterError::Rejected(reason.to_string()))
    }
}

fn finish(app: &mut App) -> Result<(), SpotterError> {
    let session = app.current()?;
    if session.status == SessionStatus::NotStarted {
        return Err(SpotterError::Rejected("session has not begun".into()));
    }
    if !session.is_completed() && !app.controller.complete_session() {
        return Err(SpotterError::Rejected("could not complete session".into()));
    }
    sync(app)
}

fn sync(app: &mut App) -> Result<(), SpotterError> {
    let session = app.current()?.clone();
    if !session.is_completed() {
        return Err(SpotterError::Rejected("session is not completed yet".into()));
    }

    let banner = Celebration::for_completion(&session);
    println!("{} {}", banner.headline, banner.detail);

    let Some(base_url) = app.config.api_base_url.clone() else {
        // No server of record: local history is the only record.
        app.history.record_session(&session)?;
        app.controller
            .apply_sync_event(&SyncEvent::ClearDue { session_id: session.id });
        return Ok(());
    };

    let endpoint = Arc::new(HttpCompletionEndpoint::new(base_url));
    let mut completion = CompletionSync::new(endpoint).with_clear_delay(app.config.clear_delay());
    completion.submit(&session)?;

    let runner = Runner::new(FixedTicker::new(Duration::from_millis(TICK_RATE_MS)));
    let App {
        controller,
        history,
        ..
    } = app;
    let mut failure = None;
    runner.run_until_settled(controller, &mut completion, |event| match event {
        SyncEvent::Synced { .. } => {
            if let Err(err) = history.record_session(&session) {
                eprintln!("warning: could not update local history: {err}");
            }
            println!("synced session {}", session.id);
        }
        SyncEvent::Failed { error, .. } => {
            failure = Some(error.to_string());
        }
        SyncEvent::ClearDue { .. } => debug!("Local session cleared after sync"),
    });

    match failure {
        Some(reason) => Err(SpotterError::Rejected(format!(
            "{reason}; the finished session is kept, run `spotter sync` to try again"
        ))),
        None => Ok(()),
    }
}

fn status(app: &App, json: bool) -> Result<(), SpotterError> {
    let session = app.current()?;
    if json {
        let data = serde_json::to_string_pretty(session)
            .map_err(|err| SpotterError::Rejected(err.to_string()))?;
        println!("{data}");
        return Ok(());
    }

    let active = calculate_session_duration(session, app.controller.now());
    println!(
        "session {} ({}) athlete {} - {} min active",
        session.id,
        session.status,
        session.athlete_id,
        active / 60
    );
    for (index, exercise) in session.exercises.iter().enumerate() {
        let marker = if index == session.current_exercise_index { '>' } else { ' ' };
        let planned = exercise
            .planned_sets
            .map(|p| format!("/{p}"))
            .unwrap_or_default();
        let done = if exercise.completed { "  done" } else { "" };
        println!(
            "{marker} {index} {} {}{planned} sets{done}",
            exercise.name, exercise.sets_completed
        );
        for record in &exercise.set_records {
            let pr = match record.pr {
                Some(pr) if pr.is_pr => pr.kind.map(|k| format!("  PR {k}")).unwrap_or_default(),
                _ => String::new(),
            };
            println!("      {} kg x {}{pr}", record.weight, record.reps);
        }
    }
    Ok(())
}

fn recover(app: &mut App, restore: bool, discard: bool) -> Result<(), SpotterError> {
    let Some(pending) = app.supervisor.pending() else {
        println!("nothing to recover");
        return Ok(());
    };

    if discard {
        app.supervisor.discard();
        println!("recovery draft discarded");
    } else if restore {
        if let Some(draft) = app.supervisor.recover() {
            let id = draft.id.clone();
            app.controller.dispatch(SessionAction::Restore(draft));
            println!("restored session {id}");
        }
    } else {
        println!(
            "draft of session {} captured at {}",
            pending.draft.id,
            pending.captured_at.to_rfc3339()
        );
        println!("error: {}", pending.error_message);
        println!("{} sets logged; use --restore or --discard", pending.draft.total_sets());
    }
    Ok(())
}

fn history(app: &App, exercise: Option<&str>, limit: usize) -> Result<(), SpotterError> {
    let Some(exercise) = exercise else {
        let exercises = app.history.exercises(&app.config.athlete_id)?;
        if exercises.is_empty() {
            println!("no history yet");
        }
        for exercise in exercises {
            println!("{exercise}");
        }
        return Ok(());
    };

    let sets = app
        .history
        .recent_sets(&app.config.athlete_id, exercise, limit)?;
    if sets.is_empty() {
        println!("no history for {exercise}");
        return Ok(());
    }
    for set in sets {
        println!(
            "{}  {} kg x {}  e1RM {}",
            set.performed_at.format("%Y-%m-%d"),
            set.weight,
            set.reps,
            estimated_one_rep_max(set.weight, set.reps)
        );
    }
    Ok(())
}
