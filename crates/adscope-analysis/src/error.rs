//! Analysis client error types.

use thiserror::Error;

/// Result type for analysis client operations.
pub type AnalysisResult<T> = Result<T, AnalysisError>;

/// Errors raised while configuring or building the analysis client.
///
/// Failures of the remote call itself are not errors at this level: they
/// are reported as failed feature results inside the outcome so that the
/// consumption gate can make the billing decision.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Failed to configure analysis client: {0}")]
    ConfigError(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl AnalysisError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }
}
