//! Purpose: Resolve the descriptor database location shared by CLI and API.
//! Exports: `default_db_path`.
//! Role: Keep the process-wide database location defined in one place.
//! Invariants: Default database remains `~/.libdesc/library_keywords.json`.
//! Invariants: `LIBDESC_DB` overrides the default when set and non-empty.

use std::path::PathBuf;

pub(crate) const DB_ENV_VAR: &str = "LIBDESC_DB";
const DB_DIR: &str = ".libdesc";
const DB_FILE_NAME: &str = "library_keywords.json";

pub(crate) fn default_db_path() -> PathBuf {
    match std::env::var_os(DB_ENV_VAR) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => home_db_path(std::env::var_os("HOME").unwrap_or_default().into()),
    }
}

fn home_db_path(home: PathBuf) -> PathBuf {
    home.join(DB_DIR).join(DB_FILE_NAME)
}
