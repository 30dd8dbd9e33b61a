//! Error types for DroidMirror
//!
//! This module defines all error types used throughout the client.
//! Handshake failures are returned synchronously from `start`; steady-state
//! failures are recorded on the session and surfaced through the
//! `Disconnect` event.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Main error type for DroidMirror
#[derive(Error, Debug)]
pub enum MirrorError {
    /// The device server never became reachable within the retry window
    #[error("Timed out connecting to the device server after {0:?}")]
    ConnectionTimeout(Duration),

    /// The initial byte exchange was invalid
    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// I/O failure on the video or control connection while streaming
    #[error("Socket error: {0}")]
    Socket(String),

    /// Unrecoverable decoder fault
    #[error("Decode error: {0}")]
    Decode(String),

    /// Write failure on the control connection
    #[error("Control send error: {0}")]
    ControlSend(String),

    /// Debugging transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The requested device serial is not attached
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Operation not allowed in the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// `stop` was called while the session was still connecting
    #[error("Start cancelled by stop")]
    Cancelled,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Handshake validation errors
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Expected dummy byte 0x00, received {0:#04x}")]
    UnexpectedDummyByte(u8),

    #[error("Stream closed while reading {0}")]
    StreamClosed(&'static str),

    #[error("Device name is empty")]
    EmptyDeviceName,

    #[error("Device name is not valid UTF-8")]
    InvalidDeviceName,
}

/// Debugging transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// The named channel is not listening yet; worth retrying
    #[error("Not yet available: {0}")]
    NotAvailable(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Returns true if the failure is transient and the request can be retried
    pub fn is_not_available(&self) -> bool {
        matches!(self, TransportError::NotAvailable(_))
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("Failed to save configuration: {0}")]
    SaveFailed(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Configuration directory not found: {0}")]
    DirectoryNotFound(String),

    #[error("Failed to create configuration directory: {0}")]
    DirectoryCreationFailed(String),
}

/// Video pipeline errors
#[derive(Error, Debug)]
pub enum VideoError {
    /// Decoder could not be created; ends the session
    #[error("Decoder initialization failed: {0}")]
    DecoderInit(String),

    /// A single access unit failed to decode; the unit is dropped
    #[error("Failed to decode access unit: {0}")]
    DecodeFailed(String),

    #[error("Decode worker panicked")]
    WorkerPanicked,

    #[error("Failed to spawn decode worker: {0}")]
    WorkerSpawn(#[from] io::Error),
}

impl VideoError {
    /// Returns true if the error must end the session
    pub fn is_fatal(&self) -> bool {
        !matches!(self, VideoError::DecodeFailed(_))
    }
}

/// Control channel errors
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Control connection is not attached")]
    NotConnected,

    #[error("Screen size is unknown")]
    UnknownResolution,

    #[error("Text too long: {len} bytes (max {max})")]
    TextTooLong { len: usize, max: usize },

    #[error("Write failed: {0}")]
    WriteFailed(#[from] io::Error),
}

/// Type alias for Results using MirrorError
pub type Result<T> = std::result::Result<T, MirrorError>;

/// Type alias for Config Results
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Type alias for Transport Results
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Type alias for Video Results
pub type VideoResult<T> = std::result::Result<T, VideoError>;

/// Type alias for Control Results
pub type ControlResult<T> = std::result::Result<T, ControlError>;

impl From<VideoError> for MirrorError {
    fn from(err: VideoError) -> Self {
        MirrorError::Decode(err.to_string())
    }
}

impl From<ControlError> for MirrorError {
    fn from(err: ControlError) -> Self {
        MirrorError::ControlSend(err.to_string())
    }
}

impl From<toml::de::Error> for MirrorError {
    fn from(err: toml::de::Error) -> Self {
        MirrorError::Config(ConfigError::LoadFailed(err.to_string()))
    }
}

impl From<toml::ser::Error> for MirrorError {
    fn from(err: toml::ser::Error) -> Self {
        MirrorError::Config(ConfigError::SaveFailed(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = HandshakeError::UnexpectedDummyByte(1);
        assert_eq!(
            error.to_string(),
            "Expected dummy byte 0x00, received 0x01"
        );

        let error = MirrorError::ConnectionTimeout(Duration::from_millis(300));
        assert_eq!(
            error.to_string(),
            "Timed out connecting to the device server after 300ms"
        );
    }

    #[test]
    fn test_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let mirror_error: MirrorError = io_error.into();
        assert!(matches!(mirror_error, MirrorError::Io(_)));

        let handshake: MirrorError = HandshakeError::EmptyDeviceName.into();
        assert!(matches!(handshake, MirrorError::Handshake(_)));

        let video: MirrorError = VideoError::DecoderInit("no codec".to_string()).into();
        assert!(matches!(video, MirrorError::Decode(_)));
    }

    #[test]
    fn test_transport_retryable() {
        assert!(TransportError::NotAvailable("scrcpy".into()).is_not_available());
        assert!(!TransportError::Rejected("closed".into()).is_not_available());
    }

    #[test]
    fn test_video_error_fatality() {
        assert!(VideoError::DecoderInit("x".into()).is_fatal());
        assert!(!VideoError::DecodeFailed("x".into()).is_fatal());
    }
}
