//! End-to-end relay tests: the axum router on a loopback listener, a real
//! downstream WebSocket client, and a fake voice-agent server on the other
//! side.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, accept_async, connect_async,
    tungstenite::{
        Error as WsError,
        client::IntoClientRequest,
        http::StatusCode,
        protocol::{CloseFrame, Message as WsMessage, frame::coding::CloseCode},
    },
};
use tracing::Level;
use voicebridge_relay::{
    auth::TokenAuthority,
    config::{AuthMode, Config},
    registry::SessionRegistry,
    router::create_router,
    state::AppState,
};

type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Binds the relay on an ephemeral loopback port and returns its ws:// base
/// URL plus the shared state for registry/auth assertions.
async fn spawn_relay(agent_url: String, auth_mode: AuthMode) -> (String, Arc<AppState>) {
    let config = Config {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        agent_url,
        api_key: "server-key".to_string(),
        token_secret: b"integration-secret".to_vec(),
        auth_mode,
        public_url: "http://localhost:3000".to_string(),
        log_level: Level::INFO,
    };
    let state = Arc::new(AppState {
        auth: Arc::new(TokenAuthority::new(config.token_secret.clone())),
        registry: Arc::new(SessionRegistry::new()),
        config: Arc::new(config),
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = create_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });
    (format!("ws://{addr}"), state)
}

/// An address with nothing listening on it.
async fn dead_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{addr}")
}

async fn next_frame(client: &mut ClientSocket) -> WsMessage {
    tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("connection ended unexpectedly")
        .expect("socket error")
}

async fn wait_for_live(state: &AppState, expected: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if state.registry.live_count().await == expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("registry never reached the expected live count");
}

#[tokio::test]
async fn upstream_connect_failure_yields_provider_error_then_close() {
    let (base, state) = spawn_relay(dead_addr().await, AuthMode::Open).await;
    let (mut client, _) = connect_async(format!("{base}/ws")).await.unwrap();

    let msg = next_frame(&mut client).await;
    let WsMessage::Text(text) = msg else {
        panic!("expected a text error frame, got {msg:?}");
    };
    let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
    assert_eq!(value["type"], "Error");
    assert_eq!(value["code"], "PROVIDER_ERROR");
    assert!(value["description"].is_string());

    match next_frame(&mut client).await {
        WsMessage::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1000),
        other => panic!("expected a close frame, got {other:?}"),
    }

    assert!(state.registry.wait_idle(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn bad_agent_url_yields_connection_failed_then_close() {
    let (base, state) = spawn_relay("not a url at all".to_string(), AuthMode::Open).await;
    let (mut client, _) = connect_async(format!("{base}/ws")).await.unwrap();

    let msg = next_frame(&mut client).await;
    let WsMessage::Text(text) = msg else {
        panic!("expected a text error frame, got {msg:?}");
    };
    let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
    assert_eq!(value["type"], "Error");
    assert_eq!(value["code"], "CONNECTION_FAILED");

    match next_frame(&mut client).await {
        WsMessage::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1000),
        other => panic!("expected a close frame, got {other:?}"),
    }

    assert!(state.registry.wait_idle(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn upstream_close_code_is_propagated_downstream() {
    let agent_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let agent_addr = agent_listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = agent_listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        ws.close(Some(CloseFrame {
            code: CloseCode::from(4242),
            reason: "agent done".into(),
        }))
        .await
        .unwrap();
        while ws.next().await.is_some() {}
    });

    let (base, state) = spawn_relay(format!("ws://{agent_addr}"), AuthMode::Open).await;
    let (mut client, _) = connect_async(format!("{base}/ws")).await.unwrap();

    match next_frame(&mut client).await {
        WsMessage::Close(Some(frame)) => {
            assert_eq!(u16::from(frame.code), 4242);
            assert_eq!(frame.reason.as_str(), "agent done");
        }
        other => panic!("expected a close frame, got {other:?}"),
    }

    assert!(state.registry.wait_idle(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn valid_token_upgrade_echoes_subprotocol_and_forwards_in_order() {
    let (frames_tx, mut frames_rx) = mpsc::channel(8);
    let agent_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let agent_addr = agent_listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = agent_listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_text() || msg.is_binary() {
                let _ = frames_tx.send(msg).await;
            }
        }
    });

    let (base, state) = spawn_relay(format!("ws://{agent_addr}"), AuthMode::NonceRequired).await;
    let token = state.auth.issue_token().unwrap();
    let subprotocol = format!("access_token.{token}");

    let mut request = format!("{base}/ws").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", subprotocol.parse().unwrap());
    let (mut client, response) = connect_async(request).await.unwrap();

    // The transport negotiation requires the exact offered value back.
    assert_eq!(
        response
            .headers()
            .get("Sec-WebSocket-Protocol")
            .unwrap()
            .to_str()
            .unwrap(),
        subprotocol
    );

    client
        .send(WsMessage::Text("{\"type\":\"Settings\"}".into()))
        .await
        .unwrap();
    client
        .send(WsMessage::Binary(Bytes::from_static(&[0x01, 0x02, 0xff])))
        .await
        .unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), frames_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, WsMessage::Text("{\"type\":\"Settings\"}".into()));

    let second = tokio::time::timeout(Duration::from_secs(5), frames_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        second,
        WsMessage::Binary(Bytes::from_static(&[0x01, 0x02, 0xff]))
    );
}

#[tokio::test]
async fn upgrade_without_token_is_rejected_when_enforcement_active() {
    let (base, state) = spawn_relay(dead_addr().await, AuthMode::NonceRequired).await;

    let err = connect_async(format!("{base}/ws")).await.unwrap_err();
    match err {
        WsError::Http(response) => {
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            assert!(response.body().as_ref().is_none_or(|b| b.is_empty()));
        }
        other => panic!("expected an HTTP rejection, got {other:?}"),
    }

    // No session was ever created.
    assert_eq!(state.registry.live_count().await, 0);
}

#[tokio::test]
async fn shutdown_closes_bridged_session_with_1001() {
    let agent_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let agent_addr = agent_listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = agent_listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        while ws.next().await.is_some() {}
    });

    let (base, state) = spawn_relay(format!("ws://{agent_addr}"), AuthMode::Open).await;
    let (mut client, _) = connect_async(format!("{base}/ws")).await.unwrap();
    wait_for_live(&state, 1).await;

    state.registry.begin_shutdown();

    match next_frame(&mut client).await {
        WsMessage::Close(Some(frame)) => {
            assert_eq!(u16::from(frame.code), 1001);
            assert_eq!(frame.reason.as_str(), "server shutting down");
        }
        other => panic!("expected a close frame, got {other:?}"),
    }

    assert!(state.registry.wait_idle(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn telephony_media_frames_are_adapted_both_ways() {
    let (frames_tx, mut frames_rx) = mpsc::channel(8);
    let agent_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let agent_addr = agent_listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = agent_listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        while let Some(Ok(msg)) = ws.next().await {
            if let WsMessage::Text(text) = msg {
                let _ = frames_tx.send(text.to_string()).await;
                // Answer the first audio frame with agent audio.
                ws.send(WsMessage::Text(
                    "{\"type\":\"output_audio\",\"audio\":\"WFlA\"}".into(),
                ))
                .await
                .unwrap();
            }
        }
    });

    let (base, _state) = spawn_relay(format!("ws://{agent_addr}"), AuthMode::Open).await;
    let (mut client, _) = connect_async(format!("{base}/ws/twilio")).await.unwrap();

    // A non-media event must be dropped, not forwarded and not fatal.
    client
        .send(WsMessage::Text(
            "{\"event\":\"start\",\"start\":{\"streamSid\":\"x\"}}".into(),
        ))
        .await
        .unwrap();
    client
        .send(WsMessage::Text(
            "{\"event\":\"media\",\"media\":{\"payload\":\"QUJD\"}}".into(),
        ))
        .await
        .unwrap();

    let upstream_saw = tokio::time::timeout(Duration::from_secs(5), frames_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(upstream_saw, "{\"type\":\"input_audio\",\"audio\":\"QUJD\"}");

    let msg = next_frame(&mut client).await;
    let WsMessage::Text(text) = msg else {
        panic!("expected a media frame, got {msg:?}");
    };
    assert_eq!(
        text.as_str(),
        "{\"event\":\"media\",\"media\":{\"payload\":\"WFlA\"}}"
    );
}
