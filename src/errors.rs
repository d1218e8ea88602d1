use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("UPSTREAM_FAILURE: {0}")]
    Upstream(String),
    #[error("MODEL_OUTPUT_INVALID: {0}")]
    Parse(#[from] ParseError),
    #[error("INVALID_REQUEST: {0}")]
    InvalidRequest(String),
    #[error("CONFIG_INVALID: {0}")]
    Config(String),
    #[error("DB_FAILURE: {0}")]
    Database(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    /// The message without its code prefix, for client-facing bodies.
    pub fn detail(&self) -> String {
        match self {
            Self::Upstream(message)
            | Self::InvalidRequest(message)
            | Self::Config(message)
            | Self::Database(message)
            | Self::Io(message)
            | Self::Internal(message) => message.clone(),
            Self::Parse(error) => error.to_string(),
        }
    }
}

/// Raised when no JSON object can be recovered from a model's text output.
#[derive(Debug, Clone, Error)]
#[error("no JSON object recovered after {attempts} candidate spans")]
pub struct ParseError {
    pub text: String,
    pub attempts: usize,
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Database(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(value: reqwest::Error) -> Self {
        Self::Upstream(value.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::{AppError, ParseError};
    use crate::harness::structured_output::extract_object;

    #[test]
    fn recovery_failures_propagate_as_model_output_errors() {
        let error: AppError = extract_object("no object here")
            .map_err(AppError::from)
            .expect_err("no braces");
        assert!(matches!(error, AppError::Parse(ParseError { attempts: 1, .. })));
        assert!(error.to_string().starts_with("MODEL_OUTPUT_INVALID:"));
        assert_eq!(error.detail(), "no JSON object recovered after 1 candidate spans");
    }
}
