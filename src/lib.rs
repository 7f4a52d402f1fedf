// Library surface for the CLI and integration tests.
pub mod app_dirs;
pub mod celebration;
pub mod config;
pub mod controller;
pub mod error;
pub mod history;
pub mod records;
pub mod recovery;
pub mod runtime;
pub mod session;
pub mod store;
pub mod sync;

/// Interval at which the runner polls background work.
pub const TICK_RATE_MS: u64 = 100;
