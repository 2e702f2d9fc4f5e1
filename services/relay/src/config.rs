use std::net::SocketAddr;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Whether session-token issuance is gated behind a single-use nonce.
///
/// Enforcement is tied to the presence of an externally supplied signing
/// secret: with `TOKEN_SECRET` set the deployment is treated as real and
/// nonces are required; without it the server generates a throwaway secret
/// at startup and issues tokens to anyone (local development).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthMode {
    Open,
    NonceRequired,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub agent_url: String,
    pub api_key: String,
    pub token_secret: Vec<u8>,
    pub auth_mode: AuthMode,
    pub public_url: String,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let agent_url = std::env::var("AGENT_URL")
            .unwrap_or_else(|_| "wss://agent.deepgram.com/v1/agent/converse".to_string());

        let api_key = std::env::var("DEEPGRAM_API_KEY")
            .map_err(|_| ConfigError::MissingVar("DEEPGRAM_API_KEY".to_string()))?;

        let (token_secret, auth_mode) = match std::env::var("TOKEN_SECRET") {
            Ok(secret) if !secret.is_empty() => (secret.into_bytes(), AuthMode::NonceRequired),
            _ => (rand::random::<[u8; 32]>().to_vec(), AuthMode::Open),
        };

        let public_url = std::env::var("PUBLIC_URL")
            .unwrap_or_else(|_| format!("http://localhost:{}", bind_address.port()));

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            agent_url,
            api_key,
            token_secret,
            auth_mode,
            public_url,
            log_level,
        })
    }

    /// The WebSocket URL the telephony gateway should stream media to,
    /// derived from the externally visible base URL.
    pub fn stream_url(&self) -> String {
        let base = self.public_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{base}/ws/twilio")
    }
}
