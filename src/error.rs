use thiserror::Error;

/// Engine-level result type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised by the engine itself.
///
/// Failures of individual requests never show up here: they are captured as
/// [`crate::Outcome`]s and counted in the statistics.
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration or the task set is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// One of the engine's own background tasks panicked or was cancelled.
    #[error("engine task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
