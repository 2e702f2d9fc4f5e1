//! Axum Handlers for the HTTP surface
//!
//! Everything except the WebSocket upgrades lives here: nonce and token
//! issuance, the telephony webhook, and the health probe.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use std::sync::Arc;
use tracing::error;

use crate::{config::AuthMode, state::AppState};

#[derive(Serialize)]
pub struct NonceResponse {
    pub nonce: String,
}

#[derive(Serialize)]
pub struct TokenResponse {
    pub token: String,
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub code: &'static str,
    pub message: String,
}

pub enum ApiError {
    InvalidNonce,
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::InvalidNonce => (
                StatusCode::FORBIDDEN,
                Json(ErrorBody {
                    error: ErrorDetail {
                        kind: "AuthenticationError",
                        code: "INVALID_NONCE",
                        message: "The x-session-nonce header is missing, invalid, or already used."
                            .to_string(),
                    },
                }),
            )
                .into_response(),
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorBody {
                        error: ErrorDetail {
                            kind: "ServerError",
                            code: "INTERNAL_ERROR",
                            message: "An internal server error occurred.".to_string(),
                        },
                    }),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

/// Issue a fresh single-use nonce for the page to embed.
pub async fn issue_nonce(State(state): State<Arc<AppState>>) -> Json<NonceResponse> {
    Json(NonceResponse {
        nonce: state.auth.issue_nonce().await,
    })
}

/// Issue a signed session token. When nonce enforcement is active the
/// request must carry a valid `x-session-nonce` header.
pub async fn issue_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<TokenResponse>, ApiError> {
    if state.config.auth_mode == AuthMode::NonceRequired {
        let nonce = headers
            .get("x-session-nonce")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !state.auth.consume_nonce(nonce).await {
            return Err(ApiError::InvalidNonce);
        }
    }
    let token = state.auth.issue_token()?;
    Ok(Json(TokenResponse { token }))
}

/// Answer the telephony gateway's webhook with TwiML that opens a media
/// stream back to our telephony upgrade endpoint.
pub async fn telephony_webhook(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stream_url = state.config.stream_url();
    let body = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <Response>\n\
         \x20 <Connect>\n\
         \x20   <Stream url=\"{stream_url}\" />\n\
         \x20 </Connect>\n\
         </Response>\n"
    );
    ([(header::CONTENT_TYPE, "text/xml")], body)
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}
