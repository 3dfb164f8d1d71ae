//! CLI error types.

use std::path::PathBuf;
use thiserror::Error;

/// CLI errors.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The configuration file does not exist.
    #[error("config not found at {path}. Create it or pass --config")]
    ConfigNotFound { path: PathBuf },

    /// `--args` was not a JSON object.
    #[error("invalid --args: {0}")]
    InvalidArgs(String),

    /// The tool ran but reported failure.
    #[error("tool '{tool}' on {server} reported an error")]
    ToolFailed { server: String, tool: String },

    /// One or more servers failed their ping during `status`.
    #[error("{failed} of {total} servers unreachable")]
    Unreachable { failed: usize, total: usize },

    /// An error occurred in the pool.
    #[error(transparent)]
    Pool(#[from] pool::Error),

    /// Output could not be serialized.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
