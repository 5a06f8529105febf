//! Error taxonomy shared by every overlay component.
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, OverlayError>;

#[derive(Error, Debug)]
pub enum OverlayError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("no such file or directory: {}", .0.display())]
    NotFound(PathBuf),

    /// A member of the overlay directory set disappeared between the state
    /// check and the operation.
    #[error("inconsistent overlay state: {role} dir missing: {}", path.display())]
    InconsistentState { role: &'static str, path: PathBuf },

    #[error("mount failed: `{command}` exited with {}: {}", fmt_code(*code), stderr.trim())]
    Mount {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("`{command}` did not finish within {}s", timeout.as_secs())]
    Timeout { command: String, timeout: Duration },

    #[error("diff failed: `{command}` exited with {}: {}", fmt_code(*code), stderr.trim())]
    Diff {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("job queue: {0}")]
    Job(String),
}

fn fmt_code(code: Option<i32>) -> String {
    code.map_or_else(|| "signal".to_owned(), |c| format!("status {c}"))
}

impl OverlayError {
    /// Wraps an [`std::io::Error`] with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Attaches a path to bare I/O results.
pub trait IoContext<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| OverlayError::io(path, e))
    }
}
