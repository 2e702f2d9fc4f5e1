//! Outbound connection to the voice-agent service.

use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{client::IntoClientRequest, handshake::client::Request},
};

pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Builds the upgrade request for the voice-agent service, presenting the
/// given credential via the `Token` authorization scheme. Failures here are
/// wiring faults (bad URL, unusable key), not provider faults.
pub fn build_request(url: &str, api_key: &str) -> Result<Request> {
    let mut request = url
        .into_client_request()
        .context("Invalid voice agent URL")?;
    request.headers_mut().insert(
        "Authorization",
        format!("Token {api_key}")
            .parse()
            .context("API key is not a valid header value")?,
    );
    Ok(request)
}

/// Opens the WebSocket to the voice-agent service.
pub async fn connect(request: Request) -> Result<UpstreamSocket> {
    let (stream, _) = connect_async(request)
        .await
        .context("Failed to connect to the voice agent service")?;
    Ok(stream)
}
