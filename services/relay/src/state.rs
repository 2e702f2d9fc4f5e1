//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds all shared,
//! clonable resources: the loaded configuration, the nonce/token authority,
//! and the live-session registry.

use crate::{auth::TokenAuthority, config::Config, registry::SessionRegistry};
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub auth: Arc<TokenAuthority>,
    pub registry: Arc<SessionRegistry>,
}
