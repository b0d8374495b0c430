use anyhow::{Context, Result};
use clap::Parser;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use punchcard_server::{
    Api, Ed25519Verifier, MemoryStore, SqliteStore, Tracker, TrackerConfig, WalletStore,
};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_tracing() -> Result<()> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .ok()
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            (!trimmed.is_empty()).then_some(trimmed)
        });

    if let Some(endpoint) = endpoint {
        let service_name =
            std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "punchcard-server".to_string());
        let rate = std::env::var("OTEL_SAMPLING_RATE")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .map(|value| value.clamp(0.0, 1.0))
            .unwrap_or(1.0);
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .build()
            .context("failed to build OTLP exporter")?;
        let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
            .with_sampler(opentelemetry_sdk::trace::Sampler::TraceIdRatioBased(rate))
            .with_resource(
                opentelemetry_sdk::Resource::builder_empty()
                    .with_attributes([opentelemetry::KeyValue::new("service.name", service_name)])
                    .build(),
            )
            .with_batch_exporter(exporter)
            .build();
        let tracer = tracer_provider.tracer("punchcard-server");
        opentelemetry::global::set_tracer_provider(tracer_provider);

        tracing_subscriber::registry()
            .with(env_filter())
            .with(tracing_subscriber::fmt::layer())
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter()).init();
    }

    Ok(())
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host interface to bind (default: localhost).
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    #[arg(short, long, default_value_t = 5000)]
    port: u16,

    /// SQLite database path. Records are kept in memory when omitted.
    #[arg(long)]
    database: Option<PathBuf>,

    /// Hex Ed25519 public key that signs credential tokens (or TOKEN_VERIFYING_KEY).
    #[arg(long)]
    verifying_key: Option<String>,

    /// Referral queue capacity (0 = default).
    #[arg(long)]
    referral_buffer: Option<usize>,

    /// What to do when the referral queue is full: block or drop.
    #[arg(long)]
    referral_backpressure: Option<String>,

    /// Attempts per referral bonus before giving up (0 = default).
    #[arg(long)]
    referral_max_attempts: Option<u32>,

    /// Initial delay between referral retries in milliseconds.
    #[arg(long)]
    referral_retry_backoff_ms: Option<u64>,

    /// Let later reports replace a wallet's referrer.
    #[arg(long, default_value_t = false)]
    allow_rereferral: bool,

    /// Largest leaderboard page a caller may request.
    #[arg(long)]
    leaderboard_max: Option<usize>,

    /// Write requests per minute per IP (0 = unlimited).
    #[arg(long)]
    submit_rate_limit_per_minute: Option<u64>,

    /// Burst allowance for write requests (0 = unlimited).
    #[arg(long)]
    submit_rate_limit_burst: Option<u32>,

    /// Request body limit in bytes (0 = axum default).
    #[arg(long)]
    http_body_limit_bytes: Option<usize>,
}

/// Maps an optional arg value to Option: 0 => None, Some(v) => Some(v), None => default
fn map_optional_limit<T: Copy + PartialEq + From<u8>>(
    arg: Option<T>,
    default: Option<T>,
) -> Option<T> {
    match arg {
        Some(v) if v == T::from(0) => None,
        Some(v) => Some(v),
        None => default,
    }
}

/// Maps an optional arg value keeping default on 0: 0 => default, Some(v) => Some(v), None => default
fn map_optional_default_on_zero<T: Copy + PartialEq + From<u8>>(
    arg: Option<T>,
    default: Option<T>,
) -> Option<T> {
    match arg {
        Some(v) if v == T::from(0) => default,
        Some(v) => Some(v),
        None => default,
    }
}

fn build_config(args: &Args) -> Result<TrackerConfig> {
    let defaults = TrackerConfig::default();
    let referral_backpressure = match args.referral_backpressure.as_deref() {
        Some(value) => Some(
            value
                .parse()
                .map_err(|err| anyhow::anyhow!("invalid referral backpressure policy: {err}"))?,
        ),
        None => defaults.referral_backpressure,
    };

    Ok(TrackerConfig {
        referral_buffer: map_optional_default_on_zero(args.referral_buffer, defaults.referral_buffer),
        referral_backpressure,
        referral_max_attempts: map_optional_default_on_zero(
            args.referral_max_attempts,
            defaults.referral_max_attempts,
        ),
        referral_retry_backoff_ms: args
            .referral_retry_backoff_ms
            .or(defaults.referral_retry_backoff_ms),
        allow_rereferral: args.allow_rereferral,
        leaderboard_max: map_optional_default_on_zero(args.leaderboard_max, defaults.leaderboard_max),
        submit_rate_limit_per_minute: map_optional_limit(
            args.submit_rate_limit_per_minute,
            defaults.submit_rate_limit_per_minute,
        ),
        submit_rate_limit_burst: map_optional_limit(
            args.submit_rate_limit_burst,
            defaults.submit_rate_limit_burst,
        ),
        http_body_limit_bytes: map_optional_limit(
            args.http_body_limit_bytes,
            defaults.http_body_limit_bytes,
        ),
    })
}

fn verifying_key(args: &Args) -> Result<String> {
    args.verifying_key
        .clone()
        .or_else(|| std::env::var("TOKEN_VERIFYING_KEY").ok())
        .filter(|value| !value.trim().is_empty())
        .context("missing verifying key: pass --verifying-key or set TOKEN_VERIFYING_KEY")
}

fn open_store(path: Option<&PathBuf>) -> Result<Arc<dyn WalletStore>> {
    match path {
        Some(path) => {
            let store = SqliteStore::open(path)
                .with_context(|| format!("failed to open database {}", path.display()))?;
            info!(path = %path.display(), "wallet store opened");
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("no --database given; wallet records will not survive a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(?err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing()?;

    let config = build_config(&args)?;
    let verifier = Ed25519Verifier::from_hex(&verifying_key(&args)?)
        .context("invalid token verifying key")?;
    let store = open_store(args.database.as_ref())?;

    let tracker = Arc::new(Tracker::new(store, Arc::new(verifier), config));
    let app = Api::new(tracker.clone()).router();

    let addr = SocketAddr::new(args.host, args.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Listening on {}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("axum server error")?;

    tracker.shutdown().await;
    info!("referral queue drained");
    Ok(())
}
