use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("CLIENT_INPUT: {0}")]
    ClientInput(String),
    #[error("NO_CHANGES: no changes provided")]
    NoChanges,
    #[error("VALIDATION_FAILED: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("PERSISTENCE_FAILURE: {0}")]
    Persistence(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    /// Errors the caller caused and can fix by changing the request.
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            Self::ClientInput(_) | Self::NoChanges | Self::Validation(_) | Self::NotFound(_)
        )
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Persistence(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::ClientInput(value.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
