//! Device transport abstraction
//!
//! The session only talks to the device through `Transport`. The shipped
//! implementation is `AdbTransport`; tests use in-memory pipes.

pub mod adb;

use std::path::Path;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::TransportResult;

pub use adb::AdbTransport;

/// A bidirectional byte stream to the device
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Type-erased connection
pub type BoxedConnection = Box<dyn Connection>;

/// Operations the session needs from the debugging bridge
#[async_trait]
pub trait Transport: Send + Sync {
    /// Checks that a device with this serial is reachable
    ///
    /// # Errors
    ///
    /// Returns `TransportError::DeviceNotFound` if it is not
    async fn resolve_device(&self, serial: &str) -> TransportResult<()>;

    /// Opens a connection to a named local socket on the device
    ///
    /// # Errors
    ///
    /// Returns `TransportError::NotAvailable` while nothing listens on
    /// `name`, so callers can retry
    async fn open_named_connection(&self, serial: &str, name: &str)
        -> TransportResult<BoxedConnection>;

    /// Copies a local file onto the device
    async fn push_file(&self, serial: &str, local: &Path, remote: &str) -> TransportResult<()>;

    /// Runs a command on the device; the returned stream carries its output
    async fn execute(&self, serial: &str, argv: &[String]) -> TransportResult<BoxedConnection>;
}
