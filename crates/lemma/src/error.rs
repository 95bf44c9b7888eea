//! Lemma error types

use std::io;

/// Lemma result type
pub type Result<T> = std::result::Result<T, Error>;

/// Lemma errors
///
/// None of these are fatal to a running guest. The engine logs them and
/// either drops the offending frame or cycles back to discovery.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Frame too large: {0} bytes (max 999999)")]
    FrameTooLarge(usize),

    #[error("Incomplete frame: declared {declared} bytes, {available} available")]
    FrameIncomplete { declared: usize, available: usize },

    #[error("Malformed frame length header: {0:?}")]
    MalformedLength(String),

    #[error("Unknown message header: {0}")]
    UnknownHeader(String),

    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Not connected")]
    NotConnected,
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::MalformedPayload(e.to_string())
    }
}
