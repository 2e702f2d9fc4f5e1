//! The session relay: one downstream connection bridged to one upstream
//! voice-agent connection, with symmetric teardown.
//!
//! Each session runs a single control loop over three event sources: the
//! downstream socket, the upstream socket, and the process-wide shutdown
//! flag. All forwarding, translation, and close/error handling happens in
//! that loop, driven by an explicit state machine.

use super::{
    adapter,
    protocol::{self, RelayMessage},
    upstream::{self, UpstreamSocket},
};
use crate::{config::AuthMode, state::AppState};
use anyhow::Result;
use axum::{
    extract::{
        State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio_tungstenite::tungstenite::{self, protocol::Message as WsMessage};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Subprotocol entry carrying a signed session token.
const ACCESS_TOKEN_PREFIX: &str = "access_token.";
/// Subprotocol entry carrying a caller-supplied upstream credential, used
/// verbatim instead of the server's key (pre-authenticated deployments).
const CALLER_KEY_PREFIX: &str = "token.";

/// Which wire contract the downstream side speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayVariant {
    /// Browser client: frames pass through byte-for-byte, type-for-type.
    Passthrough,
    /// Telephony gateway: text frames go through the protocol adapter.
    Telephony,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionState {
    Opening,
    Bridged,
    Closing,
    Closed,
}

/// Credentials extracted from the `Sec-WebSocket-Protocol` offer.
#[derive(Debug, Default, PartialEq, Eq)]
struct SubprotocolOffer {
    access_token: Option<String>,
    caller_key: Option<String>,
    /// The exact entry to echo back on a successful upgrade.
    echo: Option<String>,
}

fn parse_subprotocols(headers: &HeaderMap) -> SubprotocolOffer {
    let raw = headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let mut offer = SubprotocolOffer::default();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        if let Some(token) = entry.strip_prefix(ACCESS_TOKEN_PREFIX) {
            if offer.access_token.is_none() {
                offer.access_token = Some(token.to_string());
            }
        } else if let Some(key) = entry.strip_prefix(CALLER_KEY_PREFIX) {
            if offer.caller_key.is_none() {
                offer.caller_key = Some(key.to_string());
            }
        }
    }
    // The transport negotiation requires echoing the credential entry the
    // client authenticated with; the token entry wins if both are offered.
    offer.echo = match (&offer.access_token, &offer.caller_key) {
        (Some(t), _) => Some(format!("{ACCESS_TOKEN_PREFIX}{t}")),
        (None, Some(k)) => Some(format!("{CALLER_KEY_PREFIX}{k}")),
        (None, None) => None,
    };
    offer
}

/// Axum handler for the browser-facing upgrade at `/ws`.
pub async fn browser_ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    if state.registry.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let offer = parse_subprotocols(&headers);
    if state.config.auth_mode == AuthMode::NonceRequired {
        let valid = offer
            .access_token
            .as_deref()
            .is_some_and(|t| state.auth.validate_token(t));
        if !valid {
            warn!("Rejected upgrade: missing or invalid session token");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let ws = match offer.echo.clone() {
        Some(proto) => ws.protocols([proto]),
        None => ws,
    };
    let caller_key = offer.caller_key;
    ws.on_upgrade(move |socket| {
        handle_socket(socket, state, RelayVariant::Passthrough, caller_key)
    })
}

/// Axum handler for the telephony-gateway upgrade at `/ws/twilio`. The
/// gateway is admitted by the webhook handshake, so there is no token gate.
pub async fn telephony_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    if state.registry.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state, RelayVariant::Telephony, None))
}

/// Entry point for one accepted connection: registers the session, runs it
/// to completion, and guarantees deregistration on every exit path.
#[instrument(name = "relay_session", skip_all, fields(session_id, variant = ?variant))]
async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    variant: RelayVariant,
    caller_key: Option<String>,
) {
    let session_id = Uuid::new_v4();
    tracing::Span::current().record("session_id", session_id.to_string());
    state.registry.register(session_id).await;

    let mut session = RelaySession::new(socket, variant);
    session.run(&state, caller_key.as_deref()).await;

    state.registry.deregister(session_id).await;
    info!("Relay session finished");
}

struct RelaySession {
    state: SessionState,
    downstream: WebSocket,
    variant: RelayVariant,
}

impl RelaySession {
    fn new(downstream: WebSocket, variant: RelayVariant) -> Self {
        Self {
            state: SessionState::Opening,
            downstream,
            variant,
        }
    }

    /// Drives the session from `Opening` to `Closed`. Faults while wiring
    /// surface downstream as a structured error, never a silent drop.
    async fn run(&mut self, state: &Arc<AppState>, caller_key: Option<&str>) {
        if let Err(e) = self.bridge(state, caller_key).await {
            error!(error = ?e, "Session wiring failed");
            self.fail_downstream(protocol::CONNECTION_FAILED, "Failed to set up the session.")
                .await;
        }
        self.state = SessionState::Closed;
    }

    async fn bridge(&mut self, state: &Arc<AppState>, caller_key: Option<&str>) -> Result<()> {
        debug!(state = ?self.state, "Opening upstream connection");
        let key = caller_key.unwrap_or(&state.config.api_key);
        let request = upstream::build_request(&state.config.agent_url, key)?;
        let mut upstream = match upstream::connect(request).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!(error = ?e, "Upstream connection failed");
                self.fail_downstream(
                    protocol::PROVIDER_ERROR,
                    "The voice agent service is unavailable.",
                )
                .await;
                return Ok(());
            }
        };

        self.state = SessionState::Bridged;
        info!("Session bridged");
        let mut shutdown = state.registry.subscribe();

        while self.state == SessionState::Bridged {
            tokio::select! {
                msg = self.downstream.recv() => {
                    self.on_downstream(msg, &mut upstream).await;
                }
                msg = upstream.next() => {
                    self.on_upstream(msg).await;
                }
                // Drop the watch guard inside the branch so the select's
                // stored output stays `Send`.
                _ = async { let _ = shutdown.wait_for(|requested| *requested).await; } => {
                    info!("Shutdown requested. Closing session.");
                    self.state = SessionState::Closing;
                    self.close_downstream(protocol::SHUTDOWN_CLOSE_CODE, "server shutting down")
                        .await;
                }
            }
        }

        // Idempotent: paths that already closed upstream land here too.
        let _ = upstream.close(None).await;
        Ok(())
    }

    /// One event from the downstream side. Any close or error closes
    /// upstream unconditionally, without waiting for its close handshake.
    async fn on_downstream(
        &mut self,
        msg: Option<Result<Message, axum::Error>>,
        upstream: &mut UpstreamSocket,
    ) {
        match msg {
            Some(Ok(Message::Close(frame))) => {
                debug!(?frame, "Downstream sent close frame");
                self.state = SessionState::Closing;
                let _ = upstream.close(None).await;
            }
            Some(Ok(msg)) => {
                let forward = match self.variant {
                    RelayVariant::Passthrough => protocol::downstream_to_upstream(msg),
                    RelayVariant::Telephony => match msg {
                        Message::Text(text) => adapter::telephony_to_agent(text.as_str())
                            .map(|json| WsMessage::Text(json.into())),
                        _ => None,
                    },
                };
                if let Some(frame) = forward {
                    if let Err(e) = upstream.send(frame).await {
                        warn!(error = ?e, "Failed to forward frame upstream");
                        self.fail_downstream(
                            protocol::PROVIDER_ERROR,
                            "The voice agent connection failed.",
                        )
                        .await;
                    }
                }
            }
            Some(Err(e)) => {
                warn!(error = ?e, "Downstream socket error");
                self.state = SessionState::Closing;
                let _ = upstream.close(None).await;
            }
            None => {
                debug!("Downstream disconnected");
                self.state = SessionState::Closing;
                let _ = upstream.close(None).await;
            }
        }
    }

    /// One event from the upstream side. Provider faults always produce a
    /// typed error frame before the downstream close.
    async fn on_upstream(&mut self, msg: Option<Result<WsMessage, tungstenite::Error>>) {
        match msg {
            Some(Ok(WsMessage::Close(frame))) => {
                let code =
                    protocol::sanitize_close_code(frame.as_ref().map(|f| u16::from(f.code)));
                let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                info!(code, "Upstream closed. Propagating close downstream.");
                self.state = SessionState::Closing;
                self.close_downstream(code, &reason).await;
            }
            Some(Ok(msg)) => {
                let forward = match self.variant {
                    RelayVariant::Passthrough => protocol::upstream_to_downstream(msg),
                    RelayVariant::Telephony => match msg {
                        WsMessage::Text(text) => adapter::agent_to_telephony(text.as_str())
                            .map(|json| Message::Text(json.into())),
                        _ => None,
                    },
                };
                if let Some(frame) = forward {
                    if self.downstream.send(frame).await.is_err() {
                        debug!("Downstream went away mid-forward");
                        self.state = SessionState::Closing;
                    }
                }
            }
            Some(Err(e)) => {
                warn!(error = ?e, "Upstream protocol error");
                self.fail_downstream(
                    protocol::PROVIDER_ERROR,
                    "The voice agent connection failed.",
                )
                .await;
            }
            None => {
                info!("Upstream stream ended without a close frame");
                self.state = SessionState::Closing;
                self.close_downstream(1000, "").await;
            }
        }
    }

    /// Sends one typed error frame, then a clean close. The client can show
    /// a reason instead of a bare disconnect.
    async fn fail_downstream(&mut self, code: &'static str, description: &str) {
        self.state = SessionState::Closing;
        let frame = RelayMessage::Error {
            description: description.to_string(),
            code,
        };
        if let Ok(json) = serde_json::to_string(&frame) {
            let _ = self.downstream.send(Message::Text(json.into())).await;
        }
        self.close_downstream(1000, "").await;
    }

    /// Idempotent: sending a close on an already-closed socket just fails
    /// quietly.
    async fn close_downstream(&mut self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code,
            reason: reason.to_owned().into(),
        };
        let _ = self.downstream.send(Message::Close(Some(frame))).await;
    }
}
