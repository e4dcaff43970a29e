use thiserror::Error;

/// Errors surfaced by the download and installation core.
///
/// Transfer and storage failures never cross the engine boundary as `Err`;
/// they are rendered with `Display` into `download-error` events instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LauncherError {
    /// Rejected before any work starts: missing URL, malformed tool id, unknown job.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A download for this tool is already downloading or paused.
    #[error("tool {tool_id} already has an active download ({download_id})")]
    Conflict { tool_id: String, download_id: String },

    /// Network, timeout or protocol failure during a transfer.
    #[error("{0}")]
    Transfer(String),

    /// Local disk failure (disk full, permission denied, ...).
    #[error("storage error: {0}")]
    Storage(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    /// The supervisor was retired, e.g. after the download directory changed.
    #[error("download supervisor is closed")]
    Closed,
}

impl From<std::io::Error> for LauncherError {
    fn from(err: std::io::Error) -> Self {
        LauncherError::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for LauncherError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LauncherError::Transfer(format!("request timed out: {}", err))
        } else {
            LauncherError::Transfer(err.to_string())
        }
    }
}

impl From<serde_json::Error> for LauncherError {
    fn from(err: serde_json::Error) -> Self {
        LauncherError::Storage(format!("malformed JSON: {}", err))
    }
}

pub type Result<T, E = LauncherError> = std::result::Result<T, E>;
