mod config;
mod error;
mod routes;
mod shutdown;
mod synth;
#[cfg(test)]
mod testing;

use std::{
    fs::OpenOptions,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tower_http::trace::{
    DefaultMakeSpan, DefaultOnFailure, DefaultOnRequest, DefaultOnResponse, TraceLayer,
};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};
use tts_engine::{load_pool, load_speech_model, JsonStyleLoader, StyleCache};

use crate::{
    config::AppConfig,
    routes::{build_router, AppState},
    shutdown::{DrainOutcome, ShutdownCoordinator},
    synth::Synthesizer,
};

#[derive(Debug, Parser)]
#[command(author, version, about = "Pooled Supertonic text-to-speech HTTP server")]
struct Cli {
    /// Path to configuration file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Logging level (error|warn|info|debug|trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.clone())?;
    init_tracing(&cli.log_level, config.log_file.as_deref())?;

    let pool = load_pool(config.pool.size, |_| load_speech_model(&config.engine))?;
    let styles = StyleCache::preload(&config.voices.style_dir, &JsonStyleLoader)
        .context("failed to preload voice styles")?;
    if styles.is_empty() {
        warn!(
            target = "supertonic::backend",
            dir = %config.voices.style_dir.display(),
            "no voice styles found; every /tts request will be rejected"
        );
    }
    let synthesizer = Arc::new(Synthesizer::new(pool, styles, config.synthesis.clone()));
    info!(
        target = "supertonic::backend",
        pool_size = synthesizer.pool().capacity(),
        speakers = ?synthesizer.speakers(),
        "TTS pool ready"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    let outcome = runtime.block_on(serve(&config, synthesizer));
    // Blocking synthesis calls left over from a forced drain must not keep the
    // process alive.
    runtime.shutdown_background();

    outcome?;
    info!(target = "supertonic::backend", "shutdown complete");
    Ok(())
}

async fn serve(config: &AppConfig, synthesizer: Arc<Synthesizer>) -> Result<DrainOutcome> {
    let state = AppState {
        synthesizer,
        languages: config.languages.iter().cloned().collect(),
    };

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO))
        .on_failure(DefaultOnFailure::new().level(Level::WARN));

    let app = build_router(state, config.request_timeout()).layer(trace_layer);

    let addr: SocketAddr = config
        .bind_addr
        .parse()
        .context("bind_addr must be in host:port format")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;

    info!(
        target = "supertonic::backend",
        %addr,
        languages = ?config.languages,
        style_dir = %config.voices.style_dir.display(),
        "backend ready"
    );

    let coordinator = ShutdownCoordinator::new(config.shutdown_grace());
    coordinator.listen_for_signals();
    let outcome = coordinator.serve(listener, app).await?;
    info!(
        target = "supertonic::backend",
        state = ?coordinator.state(),
        ?outcome,
        "server stopped"
    );
    Ok(outcome)
}

fn init_tracing(level: &str, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_new(level)
        .or_else(|_| EnvFilter::try_new(format!("supertonic={level}")))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = fmt().with_env_filter(filter).with_target(false).compact();
    let result = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        None => builder.try_init(),
    };
    result.map_err(|err| anyhow!("failed to initialise tracing subscriber: {err}"))?;
    Ok(())
}
