//! Nonce and session-token authority.
//!
//! Nonces are single-use, short-lived values a page must present to mint a
//! session token. Tokens are stateless HMAC-SHA256 signed strings carrying
//! only an issued-at claim; validity is signature plus expiry, nothing else.

use anyhow::Result;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// How long an unused nonce stays valid.
pub const NONCE_TTL: Duration = Duration::from_secs(300);
/// How long an issued session token stays valid.
pub const TOKEN_TTL_SECS: u64 = 3600;
/// How often expired-but-unused nonces are swept out of the store.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Serialize, Deserialize)]
struct TokenClaims {
    iat: u64,
}

/// Issues and validates nonces and session tokens for one process.
pub struct TokenAuthority {
    secret: Vec<u8>,
    nonces: Mutex<HashMap<String, Instant>>,
}

impl TokenAuthority {
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            nonces: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a fresh nonce and records its expiry in the store.
    pub async fn issue_nonce(&self) -> String {
        let nonce = hex::encode(rand::random::<[u8; 16]>());
        let mut nonces = self.nonces.lock().await;
        nonces.insert(nonce.clone(), Instant::now() + NONCE_TTL);
        nonce
    }

    /// Returns true iff the nonce exists and has not expired.
    ///
    /// The entry is removed whether or not it expired, so a stale nonce can
    /// never be replayed later.
    pub async fn consume_nonce(&self, value: &str) -> bool {
        let mut nonces = self.nonces.lock().await;
        nonces
            .remove(value)
            .is_some_and(|expiry| expiry > Instant::now())
    }

    /// Spawns the background task that drops expired-but-unused nonces,
    /// bounding store growth from pages that never request a token.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let authority = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;
                let mut nonces = authority.nonces.lock().await;
                let before = nonces.len();
                let now = Instant::now();
                nonces.retain(|_, expiry| *expiry > now);
                let swept = before - nonces.len();
                if swept > 0 {
                    debug!(swept, "Swept expired nonces");
                }
            }
        })
    }

    /// Signs a new session token with the process secret.
    pub fn issue_token(&self) -> Result<String> {
        self.sign(unix_now())
    }

    fn sign(&self, iat: u64) -> Result<String> {
        let payload = serde_json::to_vec(&TokenClaims { iat })?;
        let mut mac = HmacSha256::new_from_slice(&self.secret)?;
        mac.update(&payload);
        let sig = mac.finalize().into_bytes();
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(sig)
        ))
    }

    /// Verifies signature and expiry. No other claims are checked.
    pub fn validate_token(&self, value: &str) -> bool {
        self.check(value, unix_now())
    }

    fn check(&self, value: &str, now: u64) -> bool {
        let Some((payload_b64, sig_b64)) = value.split_once('.') else {
            return false;
        };
        let Ok(payload) = URL_SAFE_NO_PAD.decode(payload_b64) else {
            return false;
        };
        let Ok(sig) = URL_SAFE_NO_PAD.decode(sig_b64) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.secret) else {
            return false;
        };
        mac.update(&payload);
        if mac.verify_slice(&sig).is_err() {
            return false;
        }
        let Ok(claims) = serde_json::from_slice::<TokenClaims>(&payload) else {
            return false;
        };
        now <= claims.iat.saturating_add(TOKEN_TTL_SECS)
    }

    #[cfg(test)]
    async fn nonce_count(&self) -> usize {
        self.nonces.lock().await.len()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
