//! DroidMirror - Android screen mirroring and control client
//!
//! This library provides the core functionality for DroidMirror, including:
//! - Deploying the device server and the connection handshake
//! - H.264 decoding of the video stream on a dedicated thread
//! - Input injection over the control connection
//! - Session lifecycle and event subscriptions
//! - Configuration management and logging
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use droid_mirror::{
//!     config::ConfigManager,
//!     events::{ClientEvent, EventKind},
//!     logging::{self, LogLevel},
//!     session::MirrorClient,
//!     transport::AdbTransport,
//! };
//!
//! # async fn run() -> droid_mirror::Result<()> {
//! logging::init_logging(LogLevel::Info);
//!
//! let config = ConfigManager::new()?.load_or_create_default()?;
//! let transport = Arc::new(AdbTransport::from_config(&config.connection));
//! let client = MirrorClient::new("emulator-5554", config, transport);
//!
//! client.events().subscribe(EventKind::Frame, |event| {
//!     if let ClientEvent::Frame(frame) = event {
//!         println!("frame {} at {}", frame.sequence, frame.resolution());
//!     }
//! });
//! client.start().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod control;
pub mod error;
pub mod events;
pub mod logging;
pub mod session;
pub mod transport;
pub mod video;

// Re-export commonly used types at crate root
pub use error::{MirrorError, Result};
