//! Main Entrypoint for the Voicebridge Relay
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing logging and shared state (token authority, registry).
//! 3. Constructing the Axum router and applying middleware.
//! 4. Starting the web server with graceful shutdown: on SIGINT/SIGTERM
//!    (or a panic anywhere in the process) every live session is closed,
//!    and if sessions do not drain within the grace period the process
//!    force-exits non-zero.

use anyhow::Context;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use voicebridge_relay::{
    auth::TokenAuthority,
    config::Config,
    registry::{SHUTDOWN_GRACE, SessionRegistry},
    router::create_router,
    state::AppState,
};

/// Resolves when a termination signal arrives or shutdown has been
/// requested from elsewhere (e.g. the panic hook), then flips the
/// process-wide shutdown flag so every session closes.
async fn shutdown_trigger(registry: Arc<SessionRegistry>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let mut requested = registry.subscribe();
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = requested.wait_for(|v| *v) => {},
    }
    info!("Shutdown requested. Draining sessions...");
    registry.begin_shutdown();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Initialize Shared State ---
    let auth = Arc::new(TokenAuthority::new(config.token_secret.clone()));
    auth.spawn_sweeper();
    let registry = Arc::new(SessionRegistry::new());

    // Route uncaught faults through the same graceful-shutdown path instead
    // of abandoning live sessions mid-stream.
    let default_hook = std::panic::take_hook();
    let hook_registry = Arc::clone(&registry);
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        hook_registry.begin_shutdown();
    }));

    let app_state = Arc::new(AppState {
        config: Arc::new(config.clone()),
        auth,
        registry: Arc::clone(&registry),
    });

    // --- 4. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let app = create_router(app_state).layer(cors);

    // Once shutdown starts, give sessions the grace period and no more.
    let watchdog_registry = Arc::clone(&registry);
    tokio::spawn(async move {
        let mut requested = watchdog_registry.subscribe();
        let _ = requested.wait_for(|v| *v).await;
        if !watchdog_registry.wait_idle(SHUTDOWN_GRACE).await {
            error!("Sessions did not drain within the grace period. Forcing exit.");
            std::process::exit(1);
        }
    });

    // --- 5. Start Server ---
    info!(
        auth_mode = ?config.auth_mode,
        agent_url = %config.agent_url,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_trigger(registry))
        .await?;

    info!("Server has shut down.");
    Ok(())
}
