use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("CONFIG_INVALID: {0}")]
    ConfigInvalid(String),
    #[error("LAUNCH_FAILURE: {0}")]
    Launch(String),
    #[error("PATCH_WRITE_FAILURE: {0}")]
    PatchWrite(String),
    #[error("LOCK_CONFLICT: {0}")]
    Lock(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    /// Attempt-level failures are retried by the runner instead of ending the run.
    pub fn is_attempt_fatal(&self) -> bool {
        matches!(self, Self::Launch(_) | Self::PatchWrite(_))
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::ConfigInvalid(value.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
