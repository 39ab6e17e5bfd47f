//! Error types for the listener

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio subsystem errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Invalid ring capacity: {0} samples")]
    InvalidCapacity(usize),

    #[error("Render task already attached to an output")]
    AlreadyAttached,

    #[error("cpal error: {0}")]
    CpalError(String),
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Timeout")]
    Timeout,
}

/// Session lifecycle errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session is not initialized")]
    NotInitialized,

    #[error("Session already stopped")]
    AlreadyStopped,

    #[error("Session already started")]
    AlreadyStarted,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed before the buffer was primed: {0}")]
    ConnectionClosedBeforeReady(String),

    #[error("Timed out after {0}s waiting for the buffer to prime")]
    ReadyTimeout(u64),

    #[error("Invalid session configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
