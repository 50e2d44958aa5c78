//! # Live Voice Relay - Main Application Entry Point
//!
//! Starts the relay server: an Actix-web HTTP server exposing the relay
//! WebSocket endpoint plus health, metrics and configuration APIs.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: every client session is an actor on the async runtime
//! - **Result<T, E>**: startup failures propagate out of `main` with `?`
//! - **tokio::select!**: races the server against shutdown signals
//!
//! ## Application Architecture:
//! The modules live in the library crate (`live_voice_relay`) so the
//! integration tests and the `voice-client` binary can use them too.

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use live_voice_relay::{handlers, middleware, AppConfig, AppState};
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from defaults, config.toml, .env and environment variables
/// 2. **Sets up logging** with `tracing`
/// 3. **Creates shared application state** (config + counters only)
/// 4. **Configures the HTTP server** with middleware and routes
/// 5. **Handles graceful shutdown** on SIGINT/SIGTERM
#[actix_web::main]
async fn main() -> Result<()> {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting live-voice-relay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        ws_path = %config.server.ws_path,
        model = %config.upstream.model,
        max_sessions = config.performance.max_concurrent_sessions,
        "Configuration loaded"
    );
    if !config.upstream.api_key_configured() {
        warn!("No upstream API key configured; set API_KEY or APP_UPSTREAM__API_KEY");
    }

    let app_state = web::Data::new(AppState::new(config.clone()));
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let ws_path = config.server.ws_path.clone();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        let ws_path = ws_path.clone();
        App::new()
            .app_data(app_state.clone())
            // Middleware executes in reverse order for responses
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .configure(move |cfg| handlers::configure(cfg, &ws_path))
    })
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: what gets logged (e.g. "live_voice_relay=trace")
/// - If not set, defaults to "live_voice_relay=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "live_voice_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolve when SIGINT (Ctrl+C) or, on Unix, SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received SIGINT");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
