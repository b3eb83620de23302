//! Error types for the ejection core

use thiserror::Error;

/// Result type alias for the ejection core
pub type Result<T> = std::result::Result<T, EjectorError>;

/// Errors that can occur while tracking, deciding and dispatching ejections
#[derive(Error, Debug)]
pub enum EjectorError {
    #[error("Command channel unavailable")]
    ChannelUnavailable,

    #[error("Command send failed: {0}")]
    SendFailed(String),

    #[error("Invalid track {track_id}: {reason}")]
    InvalidTrack { track_id: u32, reason: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl EjectorError {
    pub fn send_failed<S: Into<String>>(msg: S) -> Self {
        Self::SendFailed(msg.into())
    }

    pub fn invalid_track<S: Into<String>>(track_id: u32, reason: S) -> Self {
        Self::InvalidTrack {
            track_id,
            reason: reason.into(),
        }
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::ConfigError(msg.into())
    }
}
