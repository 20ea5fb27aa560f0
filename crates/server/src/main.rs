//! ASR server entry point

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use asr_config::Settings;
use asr_pipeline::vad::silero::SileroVad;
use asr_pipeline::RecognizerPool;
use asr_server::{create_router, AppState};

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    // Configuration first: tracing setup needs the observability settings.
    let mut settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return 2;
        }
    };

    init_tracing(&settings);

    if let Err(e) = settings.validate() {
        tracing::error!(error = %e, "configuration error");
        return 2;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(settings.server.threads)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "failed to build runtime");
            return 1;
        }
    };

    match runtime.block_on(serve(settings)) {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "fatal error");
            1
        }
    }
}

async fn serve(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("ASR server v{}", env!("CARGO_PKG_VERSION"));
    let settings = Arc::new(settings);

    let metrics_handle = asr_server::metrics::init_metrics()?;

    tracing::info!(model_dir = %settings.model.model_dir, "loading recognizer model");
    let recognizer = {
        let settings = settings.clone();
        tokio::task::spawn_blocking(move || RecognizerPool::from_settings(&settings)).await??
    };
    tracing::info!(
        provider = %settings.model.provider,
        threads = settings.model.num_threads,
        pool_size = recognizer.size(),
        "model loaded"
    );

    let vad_backend = SileroVad::load(&settings.model.vad_model)?;

    let state = AppState::new(settings.clone(), Arc::new(recognizer), vad_backend, metrics_handle);
    let app = create_router(state);

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, threads = settings.server.threads, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM; in-flight requests complete before exit.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM, initiating graceful shutdown");
        }
    }
}

fn init_tracing(settings: &Settings) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &settings.observability.log_level;
        format!("{level},tower_http=info").into()
    });

    let fmt_layer = if settings.observability.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry().with(env_filter).with(fmt_layer).init();
}
