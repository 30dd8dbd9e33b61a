//! Mirroring session
//!
//! This module drives a session against the device server:
//! - Server deployment and the connection handshake
//! - The client lifecycle state machine
//! - `MirrorClient`, which ties transport, video, control and events together

pub mod client;
pub mod handshake;
pub mod state;

pub use client::MirrorClient;
pub use handshake::{DeviceIdentity, Handshake};
pub use state::{ClientState, ClientStateMachine, StateTransition};
