use std::sync::Arc;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use habit_coach::api::{ApiState, build_router};
use habit_coach::config::CoachConfig;
use habit_coach::llm::{TextGenerator, UnconfiguredGenerator, create_generator};
use habit_coach::personalization::{HttpInstructionSource, InstructionSource, UnavailableSource};
use habit_coach::session::{InMemorySessionStore, SessionStore};
use habit_coach::workflow::CoachEngine;

/// Console logging, plus a daily rolling file when `COACH_LOG_DIR` is set.
///
/// The returned guard flushes the file writer on drop.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match std::env::var("COACH_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "habit-coach.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    guard
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let _log_guard = init_tracing();

    let config = CoachConfig::from_env().context("invalid configuration")?;

    let store: Arc<dyn SessionStore> = InMemorySessionStore::new();

    let source: Arc<dyn InstructionSource> = match &config.instruction_service {
        Some(service) => Arc::new(
            HttpInstructionSource::new(service.base_url.clone(), service.timeout)
                .context("failed to build instruction client")?,
        ),
        None => Arc::new(UnavailableSource),
    };

    let generator: Arc<dyn TextGenerator> = match &config.llm {
        Some(llm) => create_generator(llm).context("failed to create LLM client")?,
        None => {
            tracing::warn!("No LLM API key set, questions will get a fallback reply");
            Arc::new(UnconfiguredGenerator)
        }
    };

    let port = config.http_port;
    eprintln!("🏋️ Habit Coach v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", generator.model_name());
    eprintln!(
        "   Instructions: {}",
        config
            .instruction_service
            .as_ref()
            .map(|s| s.base_url.as_str())
            .unwrap_or("cache/default only")
    );
    eprintln!("   API: http://0.0.0.0:{}/", port);

    let (engine, ticks) = CoachEngine::new(config, store, source, generator);
    let engine = engine.start(ticks);

    let app = build_router(ApiState {
        engine: Arc::clone(&engine),
    });
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind port {port}"))?;
    tracing::info!(port, "HTTP server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    engine.scheduler().shutdown();
    Ok(())
}
