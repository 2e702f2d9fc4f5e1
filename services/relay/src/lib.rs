//! Voicebridge Relay Library Crate
//!
//! This library contains all the core logic for the relay service: the
//! nonce/token authority, the session registry, the HTTP handlers, and the
//! WebSocket session relay. The `relay` binary is a thin wrapper around it.

pub mod auth;
pub mod config;
pub mod handlers;
pub mod registry;
pub mod router;
pub mod state;
pub mod ws;
