//! # Gesture Stream Backend - Main Application Entry Point
//!
//! Real-time hand-gesture recognition service. Clients stream 126-value hand-pose frames
//! (or pre-batched 10-frame windows) over HTTP and poll for recognized gestures.
//!
//! ## Application Architecture:
//! - **config**: configuration from defaults, `config.toml` and environment variables
//! - **error**: error taxonomy and its HTTP mapping
//! - **state**: shared application state and request metrics
//! - **health**: health and metrics endpoints
//! - **middleware**: per-route request metrics
//! - **handlers**: HTTP endpoints for the gesture stream and runtime config
//! - **pipeline**: queues, window aggregator, classifier and recognition policy
//!
//! ## Threads:
//! - actix workers serve HTTP; blocking pipeline calls go through `web::block`
//! - one dedicated OS thread runs the window aggregator until shutdown

mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod pipeline;
mod state;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use candle_core::Device;
use crate::config::AppConfig;
use pipeline::{Classifier, ClassifierLoader, LinearWindowClassifier, PipelineContext, WindowAggregator};
use state::AppState;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once a termination signal arrives. The HTTP server and the aggregator thread both watch it.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting gesture-stream-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let pipeline = Arc::new(PipelineContext::new(&config, classifier_loader(&config)));
    prepare_classifier(&config, &pipeline);

    let aggregator = WindowAggregator::spawn(pipeline.clone(), &SHUTDOWN_SIGNAL)?;

    let app_state = AppState::new(config.clone(), pipeline);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .app_data(handlers::json_config())
            .wrap(cors)
            .wrap(middleware::RequestMetrics)
            .wrap(TracingLogger::default())
            .route("/features", web::post().to(handlers::receive_features))
            .route("/translation", web::get().to(handlers::get_translation))
            .route(
                "/toggle_auto_recognition",
                web::post().to(handlers::toggle_auto_recognition),
            )
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/gestures", web::get().to(handlers::list_gestures)),
            )
            .route("/", web::get().to(health::health_check))
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
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    // The aggregator notices the flag within one poll timeout
    SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    if aggregator.join().is_err() {
        error!("Window aggregator thread panicked");
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Default filter: `gesture_stream_backend=debug,actix_web=info`, overridable with `RUST_LOG`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gesture_stream_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Loads the safetensors head on the CPU. Runs at most once per successful load.
fn classifier_loader(config: &AppConfig) -> ClassifierLoader {
    let model_path = PathBuf::from(&config.classifier.model_path);
    Box::new(move || {
        let classifier = LinearWindowClassifier::load(&model_path, Device::Cpu)?;
        Ok(Arc::new(classifier) as Arc<dyn Classifier>)
    })
}

/// Load the classifier before serving traffic if configured to. A failed load keeps the
/// server up with auto recognition switched off; the toggle endpoint can retry later.
fn prepare_classifier(config: &AppConfig, pipeline: &PipelineContext) {
    if !config.classifier.load_on_startup {
        info!("Classifier will be loaded on first use");
        return;
    }

    if pipeline.classifier().get_or_load().is_err() {
        if pipeline.is_enabled() {
            warn!("Auto recognition disabled until the classifier can be loaded");
        }
        pipeline.force_disabled();
    }
}

fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
