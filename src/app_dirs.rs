use directories::ProjectDirs;
use std::path::{Path, PathBuf};

const DB_FILE: &str = "spotter.db";

/// Centralized application directory resolution
pub struct AppDirs;

impl AppDirs {
    /// Database holding the session slot, the recovery slot, and set history.
    pub fn db_path(data_dir: Option<&Path>) -> Option<PathBuf> {
        if let Some(dir) = data_dir {
            return Some(dir.join(DB_FILE));
        }
        if let Ok(home) = std::env::var("HOME") {
            let state_dir = PathBuf::from(home)
                .join(".local")
                .join("state")
                .join("spotter");
            Some(state_dir.join(DB_FILE))
        } else {
            ProjectDirs::from("", "", "spotter")
                .map(|proj_dirs| proj_dirs.data_local_dir().join(DB_FILE))
        }
    }
}
