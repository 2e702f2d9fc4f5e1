//! Wire-level helpers shared by both relay variants: the structured error
//! frames the relay itself synthesizes, close-code sanitization, and the
//! frame conversions between the downstream and upstream socket types.

use axum::extract::ws::Message as DownstreamMessage;
use serde::Serialize;
use tokio_tungstenite::tungstenite::protocol::Message as UpstreamMessage;

/// Machine code for an upstream (voice agent) fault.
pub const PROVIDER_ERROR: &str = "PROVIDER_ERROR";
/// Machine code for a failure while wiring a new session.
pub const CONNECTION_FAILED: &str = "CONNECTION_FAILED";
/// Close code sessions receive when the server is shutting down.
pub const SHUTDOWN_CLOSE_CODE: u16 = 1001;

/// Frames the relay itself sends downstream, as opposed to frames it
/// forwards. The client relies on receiving one of these before any
/// server-initiated close tied to a fault.
#[derive(Serialize, Debug)]
#[serde(tag = "type")]
pub enum RelayMessage {
    Error {
        description: String,
        code: &'static str,
    },
}

/// Maps an upstream close code to one we can legally set on the downstream
/// close. Reserved codes (1004, 1005, 1006, 1015) and anything outside the
/// application range collapse to 1000.
pub fn sanitize_close_code(code: Option<u16>) -> u16 {
    match code {
        Some(c @ 1000..=4999) if !matches!(c, 1004 | 1005 | 1006 | 1015) => c,
        _ => 1000,
    }
}

/// Converts a downstream data frame for upstream delivery, preserving
/// framing type and bytes. Close frames are handled by the session loop and
/// ping/pong stays transport-local, so both map to `None`.
pub fn downstream_to_upstream(msg: DownstreamMessage) -> Option<UpstreamMessage> {
    match msg {
        DownstreamMessage::Text(text) => Some(UpstreamMessage::Text(text.to_string().into())),
        DownstreamMessage::Binary(data) => Some(UpstreamMessage::Binary(data)),
        _ => None,
    }
}

/// The mirror of [`downstream_to_upstream`].
pub fn upstream_to_downstream(msg: UpstreamMessage) -> Option<DownstreamMessage> {
    match msg {
        UpstreamMessage::Text(text) => Some(DownstreamMessage::Text(text.to_string().into())),
        UpstreamMessage::Binary(data) => Some(DownstreamMessage::Binary(data)),
        _ => None,
    }
}
