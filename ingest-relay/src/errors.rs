use crate::config::ValidationError;
use thiserror::Error;

/// Errors that stop the relay process from starting or serving
#[derive(Error, Debug)]
pub enum IngestRelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ValidationError),

    #[error("HTTP client error: {0}")]
    HttpClientError(#[from] reqwest::Error),
}
