use coderun_kv::KvConfig;
use coderun_orchestrator::config::OrchestratorConfig;
use coderun_orchestrator::context::AppContext;
use coderun_orchestrator::telemetry;
use coderun_store::StoreConfig;

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{Router, get};
use clap::{Parser, crate_authors, crate_description, crate_version};
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

async fn health() -> impl IntoResponse {
    Json("healthy")
}

async fn ready(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    let stats = ctx.pool.stats().await;
    (StatusCode::OK, Json(serde_json::json!({ "pools": stats })))
}

#[derive(Parser, Debug)]
#[command(
    name = "coderun",
    about = crate_description!(),
    version = crate_version!(),
    author = crate_authors!("\n"),
)]
struct Args {
    /// Listen on given port
    #[arg(short, long, default_value_t = 8080, env)]
    port: u16,

    /// Logging filter directive for `tracing_subscriber::filter::EnvFilter`.
    /// Example: "info,kube=warn,coderun=debug"
    #[arg(long, default_value = "info", env)]
    log_filter: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = telemetry::LogFormat::Text, env)]
    log_format: telemetry::LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = Args::parse();

    telemetry::init(&args.log_filter, args.log_format)?;

    let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder().build();
    opentelemetry::global::set_meter_provider(provider.clone());
    let meter = opentelemetry::global::meter("coderun");

    let config = OrchestratorConfig::from_env()?;
    let kv_config = KvConfig::from_env()?;
    let store_config = StoreConfig::from_env()?;

    let ctx = Arc::new(AppContext::initialize(config, &kv_config, &store_config, &meter).await?);

    let shutdown = CancellationToken::new();
    let background = ctx.start_background(shutdown.clone()).await?;

    let app = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .with_state(ctx.clone());

    let listener = TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;
    tracing::info!(msg = "orchestrator listening", port = args.port);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    futures::future::join_all(background).await;
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM signal handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigterm.recv() => {},
    }
}
