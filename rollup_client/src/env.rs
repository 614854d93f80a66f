use std::path::PathBuf;

use tracing::{debug, warn};

/// Loads the nearest `.env` into the process environment, so its
/// `ROLLUP_*` variables can stand in for flags. Variables already set win.
///
/// Returns the file that was read. One that cannot be read counts as
/// missing. One that cannot be parsed is skipped.
pub fn load_dotenvy_vars_if_present() -> Option<PathBuf> {
    match dotenvy::dotenv() {
        Ok(path) => {
            debug!(path = %path.display(), "loaded .env");
            Some(path)
        }
        Err(dotenvy::Error::Io(_)) => None,
        Err(error) => {
            warn!(%error, "skipping a malformed .env");
            None
        }
    }
}
