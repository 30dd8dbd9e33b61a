//! Device control
//!
//! Input injection and device commands sent over the control connection.

pub mod channel;
pub mod types;

pub use channel::{ControlChannel, ControlStats, ErrorReporter};
pub use types::{keycode, Action, ControlMessage, PowerMode, MAX_CLIPBOARD_LENGTH, MAX_TEXT_LENGTH};
