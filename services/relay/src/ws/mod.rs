//! WebSocket Session Relay
//!
//! This module contains the core logic for bridging downstream connections
//! to the upstream voice-agent service. It is structured into submodules:
//!
//! - `protocol`: relay-synthesized error frames, close-code sanitization,
//!   and frame conversion between the two socket types.
//! - `adapter`: translation between telephony media framing and the agent
//!   protocol's audio framing.
//! - `upstream`: the outbound connection to the voice-agent service.
//! - `session`: the per-session relay state machine and upgrade handlers.

pub mod adapter;
pub mod protocol;
pub mod session;
pub mod upstream;

pub use session::{browser_ws_handler, telephony_ws_handler};
