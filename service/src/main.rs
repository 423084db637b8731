use anyhow::{Context, Result};
use clap::Parser;
use endless_service::{
    Api, LedgerStore, PostgresLedger, Service, ServiceConfig, SqliteLedger,
};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() -> Result<()> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .ok()
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            (!trimmed.is_empty()).then_some(trimmed)
        });

    if let Some(endpoint) = endpoint {
        let service_name =
            std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "endless-service".to_string());
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
        let tracer = tracer_provider.tracer("endless-service");
        opentelemetry::global::set_tracer_provider(tracer_provider);

        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_filter(LevelFilter::INFO))
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    Ok(())
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host interface to bind (default: localhost).
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Path to the SQLite ledger (in-memory when omitted).
    #[arg(long)]
    database_path: Option<PathBuf>,

    /// Postgres connection string for the ledger (overrides the SQLite path when set).
    #[arg(long)]
    database_url: Option<String>,

    /// Delay between a join and its resolution in milliseconds (must be > 0).
    #[arg(long)]
    resolution_delay_ms: Option<u64>,

    /// Minimum gap between two joins of one player in milliseconds (must be > 0).
    #[arg(long)]
    join_cooldown_ms: Option<u64>,

    /// How often overdue resolutions are swept, in milliseconds (0 uses default).
    #[arg(long)]
    sweep_interval_ms: Option<u64>,

    /// How long past due a resolution must be before the sweeper takes it.
    #[arg(long)]
    sweep_grace_ms: Option<u64>,

    /// Attempts before a failing resolution is left for an operator (0 uses default).
    #[arg(long)]
    max_resolution_attempts: Option<u32>,

    /// Seed for reproducible draws (optional).
    #[arg(long)]
    deterministic_seed: Option<u64>,

    /// HTTP rate limit per IP in requests per second (0 disables rate limiting).
    #[arg(long)]
    http_rate_limit_per_second: Option<u64>,

    /// HTTP rate limit burst size (0 disables rate limiting).
    #[arg(long)]
    http_rate_limit_burst: Option<u32>,

    /// Max request body size in bytes (0 disables limit).
    #[arg(long)]
    http_body_limit_bytes: Option<usize>,
}

fn is_production() -> bool {
    matches!(
        std::env::var("NODE_ENV").as_deref(),
        Ok("production") | Ok("prod")
    )
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

/// 0 or absent => default.
fn default_on_zero<T: Copy + PartialEq + From<u8>>(arg: Option<T>, default: T) -> T {
    match arg {
        Some(v) if v != T::from(0) => v,
        _ => default,
    }
}

fn build_config(args: &Args) -> Result<ServiceConfig> {
    let defaults = ServiceConfig::default();
    if let Some(0) = args.resolution_delay_ms {
        anyhow::bail!("resolution_delay_ms must be > 0");
    }
    if let Some(0) = args.join_cooldown_ms {
        anyhow::bail!("join_cooldown_ms must be > 0");
    }

    Ok(ServiceConfig {
        database_path: args.database_path.clone(),
        database_url: args.database_url.clone(),
        resolution_delay_ms: args.resolution_delay_ms.unwrap_or(defaults.resolution_delay_ms),
        join_cooldown_ms: args.join_cooldown_ms.unwrap_or(defaults.join_cooldown_ms),
        sweep_interval_ms: default_on_zero(args.sweep_interval_ms, defaults.sweep_interval_ms),
        sweep_grace_ms: args.sweep_grace_ms.unwrap_or(defaults.sweep_grace_ms),
        max_resolution_attempts: default_on_zero(
            args.max_resolution_attempts,
            defaults.max_resolution_attempts,
        ),
        deterministic_seed: args.deterministic_seed.or(defaults.deterministic_seed),
        http_rate_limit_per_second: map_optional_limit(args.http_rate_limit_per_second, defaults.http_rate_limit_per_second),
        http_rate_limit_burst: map_optional_limit(args.http_rate_limit_burst, defaults.http_rate_limit_burst),
        http_body_limit_bytes: map_optional_limit(args.http_body_limit_bytes, defaults.http_body_limit_bytes),
        ..defaults
    })
}

fn require_env(var: &str) -> Result<String> {
    let value = std::env::var(var).unwrap_or_default();
    if value.trim().is_empty() {
        anyhow::bail!("Missing required env: {var}");
    }
    Ok(value)
}

fn ensure_production_env() -> Result<()> {
    if !is_production() {
        return Ok(());
    }

    require_env("ALLOWED_HTTP_ORIGINS")?;
    require_env("METRICS_AUTH_TOKEN")?;

    Ok(())
}

/// Opens the configured ledger off the async workers; the Postgres client
/// runs its own runtime.
async fn open_ledger(config: &ServiceConfig) -> Result<Arc<dyn LedgerStore>> {
    let url = config.database_url.clone();
    let path = config.database_path.clone();
    tokio::task::spawn_blocking(move || -> Result<Arc<dyn LedgerStore>> {
        if let Some(url) = url {
            let ledger = PostgresLedger::connect(&url).context("open postgres ledger")?;
            return Ok(Arc::new(ledger));
        }
        let ledger = match path {
            Some(path) => SqliteLedger::open(&path)
                .with_context(|| format!("open sqlite ledger at {}", path.display()))?,
            None => {
                tracing::warn!("no --database-path or --database-url; ledger is in-memory");
                SqliteLedger::open_in_memory().context("open in-memory ledger")?
            }
        };
        Ok(Arc::new(ledger))
    })
    .await
    .context("ledger open task failed")?
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing()?;
    ensure_production_env()?;

    let config = build_config(&args)?;
    let store = open_ledger(&config).await?;
    let service = Arc::new(Service::new(config, store));

    let recovered = service
        .recover()
        .await
        .context("recover pending resolutions")?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = service.start_sweeper(shutdown_rx);

    let api = Api::new(service.clone());
    let app = api.router();

    let addr = SocketAddr::new(args.host, args.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(
        ?addr,
        recovered,
        resolution_delay_ms = service.config.resolution_delay_ms,
        join_cooldown_ms = service.config.join_cooldown_ms,
        "challenge service listening"
    );
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("http server failed")?;

    let _ = shutdown_tx.send(true);
    if let Err(err) = sweeper.await {
        tracing::warn!(error = %err, "sweeper task ended abnormally");
    }
    info!("challenge service stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_timing_and_storage_fields() {
        let args = Args::parse_from([
            "endless-service",
            "--database-path",
            "/tmp/ledger.db",
            "--resolution-delay-ms",
            "500",
            "--join-cooldown-ms",
            "1000",
            "--deterministic-seed",
            "7",
            "--http-rate-limit-per-second",
            "0",
        ]);
        let config = build_config(&args).expect("config should parse");
        assert_eq!(config.database_path, Some(PathBuf::from("/tmp/ledger.db")));
        assert_eq!(config.resolution_delay_ms, 500);
        assert_eq!(config.join_cooldown_ms, 1_000);
        assert_eq!(config.deterministic_seed, Some(7));
        assert_eq!(config.http_rate_limit_per_second, None);
        assert!(config.http_rate_limit_burst.is_some());
    }

    #[test]
    fn defaults_match_challenge_rules() {
        let args = Args::parse_from(["endless-service"]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.resolution_delay_ms, 30_000);
        assert_eq!(config.join_cooldown_ms, 60_000);
        assert_eq!(config.max_resolution_attempts, 5);
    }

    #[test]
    fn rejects_zero_delay_and_cooldown() {
        let args = Args::parse_from(["endless-service", "--resolution-delay-ms", "0"]);
        let err = build_config(&args).unwrap_err();
        assert!(
            err.to_string().contains("resolution_delay_ms"),
            "unexpected error: {err}"
        );

        let args = Args::parse_from(["endless-service", "--join-cooldown-ms", "0"]);
        let err = build_config(&args).unwrap_err();
        assert!(err.to_string().contains("join_cooldown_ms"));
    }
}
