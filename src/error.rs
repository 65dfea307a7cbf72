//! Application-level error type
//!
//! Each module keeps its own `thiserror` enum; [`AppError`] gathers them for
//! callers (the binary, integration code) that drive several modules at once.

use crate::config::ConfigError;
use crate::store::StoreError;
use crate::transport::mqtt::{ClientError, SubscribeError};
use thiserror::Error;

/// Main error type for subscriber operations
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("MQTT client error: {0}")]
    Client(#[from] ClientError),

    #[error("Subscription error: {0}")]
    Subscribe(#[from] SubscribeError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result alias used across the application
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Wrap an I/O error with a short description of what was being done
    pub fn io<S: Into<String>>(context: S, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Process exit code for this error
    ///
    /// Configuration problems exit with 2, connection failures with 3,
    /// everything else with 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Config(_) | AppError::Client(ClientError::Config(_)) => 2,
            AppError::Client(ClientError::ConnectionFailed { .. }) => 3,
            _ => 1,
        }
    }
}
