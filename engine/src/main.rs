use axum::http::{header, HeaderName, Method};
use decoy_engine::api::{self, ApiState, API_KEY_HEADER};
use decoy_engine::policy::run_checkpoint_loop;
use decoy_engine::{DecoyEngine, EngineConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "decoy_engine=info,decoy=info,tower_http=info";

/// Load `.env` from the working directory or the nearest ancestor holding
/// one. Runs before the subscriber exists, so the outcome is returned for
/// logging afterwards.
fn load_env_file() -> Option<Result<PathBuf, (PathBuf, dotenvy::Error)>> {
    let cwd = std::env::current_dir().ok()?;
    let candidate = cwd
        .ancestors()
        .map(|dir| dir.join(".env"))
        .find(|candidate| candidate.exists())?;
    Some(match dotenvy::from_path(&candidate) {
        Ok(()) => Ok(candidate),
        Err(e) => Err((candidate, e)),
    })
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let json = std::env::var("DECOY_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG and DECOY_LOG_FORMAT may come from .env.
    let env_file = load_env_file();
    init_tracing();
    match env_file {
        Some(Ok(path)) => tracing::info!(path = %path.display(), "Loaded environment from .env"),
        Some(Err((path, e))) => tracing::warn!(
            path = %path.display(),
            error = %e,
            "Failed to load .env file"
        ),
        None => {}
    }

    let config = EngineConfig::from_env()?;
    tracing::info!(
        port = config.port,
        data_dir = %config.data_dir.display(),
        backend = ?config.session_backend,
        policy_mode = ?config.policy_mode,
        "Starting decoy engine"
    );

    let engine = Arc::new(DecoyEngine::bootstrap(&config).await?);
    let checkpoints = tokio::spawn(run_checkpoint_loop(
        engine.policy().clone(),
        config.checkpoint_interval,
    ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            HeaderName::from_static(API_KEY_HEADER),
        ])
        .max_age(std::time::Duration::from_secs(3600));

    let app = api::router()
        .with_state(ApiState::new(engine.clone(), config.api_key.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    tracing::info!(port = config.port, "HTTP server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    checkpoints.abort();
    engine.shutdown().await;
    tracing::info!("Decoy engine stopped");
    Ok(())
}
