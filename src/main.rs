//! # Voice Orchestrator - Main Application Entry Point
//!
//! Runs real-time voice conversations: participants stream audio in, the orchestrator
//! detects when they speak, transcribes each utterance, asks a dialogue engine for a reply
//! and speaks it back, letting the participant interrupt at any time.
//!
//! ## Application Architecture:
//! - **config**: Application configuration (TOML files + environment variables)
//! - **audio**: Frames, utterance buffering and speech segmentation
//! - **adapters**: Pluggable backends (voice activity, transcription, dialogue, synthesis)
//! - **session**: The per-session state machine, runtime and the supervisor that owns them
//! - **state**: Shared application state and metrics
//! - **health**: Health and metrics endpoints
//! - **middleware**: Request logging and metrics
//! - **handlers**: REST control surface (sessions, config)
//! - **websocket**: The media bridge carrying audio and session events
//! - **error**: Domain errors and HTTP error responses

mod adapters;
mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod session;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once a termination signal arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// How often closed sessions are checked for expiry
const REAP_INTERVAL: Duration = Duration::from_secs(30);

/// ## Startup:
/// 1. Load `.env`, set up tracing, load and validate configuration
/// 2. Build the backends and the session supervisor
/// 3. Start the HTTP server and the closed-session reaper
/// 4. On SIGTERM/SIGINT close every session (replies in flight may drain), then stop
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-orchestrator v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    info!(
        vad = ?config.backends.vad,
        dialogue = ?config.backends.dialogue,
        max_concurrent_sessions = config.performance.max_concurrent_sessions,
        "Session backends configured"
    );

    let app_state = AppState::new(config.clone())
        .map_err(|e| anyhow::anyhow!("failed to initialize backends: {}", e))?;
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();
    spawn_reaper(app_state.clone());

    info!("Starting HTTP server on {}", bind_addr);

    let server_state = app_state.clone();
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(server_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/sessions", web::post().to(handlers::create_session))
                    .route("/sessions", web::get().to(handlers::list_sessions))
                    .route("/sessions/{id}", web::get().to(handlers::get_session))
                    .route("/sessions/{id}", web::delete().to(handlers::end_session)),
            )
            .route("/ws/sessions/{id}", web::get().to(websocket::media_websocket))
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, closing sessions...");
            app_state.supervisor.shutdown_all().await;
            info!("Stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` controls what gets logged; defaults to
/// `voice_orchestrator=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_orchestrator=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Listen for SIGTERM and SIGINT and raise the shutdown flag when either arrives.
fn setup_signal_handlers() {
    tokio::spawn(async {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Periodically drop closed sessions older than `performance.closed_session_ttl_secs`.
///
/// The TTL is re-read every tick so config updates take effect.
fn spawn_reaper(state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(REAP_INTERVAL);
        loop {
            interval.tick().await;
            if SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
                break;
            }
            let ttl = Duration::from_secs(state.get_config().performance.closed_session_ttl_secs);
            let reaped = state.supervisor.reap_closed(ttl);
            if reaped > 0 {
                info!(reaped, active = state.active_sessions(), "Reaped closed sessions");
            }
        }
        debug!("Session reaper stopped");
    });
}
