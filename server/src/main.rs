use anyhow::{Context, Result};
use clap::Parser;
use gauntlet_server::collaborators::{Collaborators, InMemoryDirectory, LogNotifier};
use gauntlet_server::counters::{CounterBackend, InProcessCounters, RedisCounters};
use gauntlet_server::fixtures::Fixtures;
use gauntlet_server::scheduler::{run_lifecycle, run_maintenance};
use gauntlet_server::store::Stores;
use gauntlet_server::{now_ms, Api, Arena, ArenaConfig};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
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
            std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "gauntlet-server".to_string());
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
        let tracer = tracer_provider.tracer("gauntlet-server");
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

    /// Path to the SQLite database (in-memory state when omitted).
    #[arg(long)]
    database_path: Option<PathBuf>,

    /// JSON file with users, teams, referral codes, standings and tournaments.
    #[arg(long)]
    fixtures: Option<PathBuf>,

    /// Seconds between lifecycle sweeps (must be > 0 when set).
    #[arg(long)]
    sweep_interval_secs: Option<u64>,

    /// Seconds between first-round matches.
    #[arg(long)]
    match_spacing_secs: Option<u64>,

    /// Delay between completion and prize payout in seconds.
    #[arg(long)]
    prize_delay_secs: Option<u64>,

    /// Lifetime of idempotency records in seconds (must be > 0 when set).
    #[arg(long)]
    idempotency_ttl_secs: Option<u64>,

    /// Max stored response body per idempotency record (0 uses default).
    #[arg(long)]
    idempotency_body_limit_bytes: Option<usize>,

    /// Registration attempt window in seconds (0 disables the limit).
    #[arg(long)]
    registration_window_secs: Option<u64>,

    /// Registration attempts per user and tournament per window (0 disables the limit).
    #[arg(long)]
    registration_max_attempts: Option<u32>,

    /// Referral window in seconds (0 disables referral throttling).
    #[arg(long)]
    referral_window_secs: Option<u64>,

    /// Referral attempts per caller per window (0 disables the limit).
    #[arg(long)]
    referral_max_per_caller: Option<u32>,

    /// Referral attempts per IP per window (0 disables the limit).
    #[arg(long)]
    referral_max_per_ip: Option<u32>,

    /// Referral attempts per device fingerprint per window (0 disables the limit).
    #[arg(long)]
    referral_max_per_device: Option<u32>,

    /// Uses of one referral code per window (0 disables the limit).
    #[arg(long)]
    referral_max_per_code: Option<u32>,

    /// HTTP rate limit per IP in requests per second (0 disables rate limiting).
    #[arg(long)]
    http_rate_limit_per_second: Option<u64>,

    /// HTTP rate limit burst size (0 disables rate limiting).
    #[arg(long)]
    http_rate_limit_burst: Option<u32>,

    /// Max request body size in bytes (0 disables limit).
    #[arg(long)]
    http_body_limit_bytes: Option<usize>,

    /// Comma separated browser origins (overridden by ALLOWED_HTTP_ORIGINS).
    #[arg(long, value_delimiter = ',')]
    allowed_origins: Vec<String>,

    /// Redis URL for guard counters shared across instances.
    #[arg(long)]
    counters_redis_url: Option<String>,

    /// Redis key prefix for guard counters.
    #[arg(long)]
    counters_redis_prefix: Option<String>,
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

fn secs_to_ms(secs: Option<u64>, default_ms: u64) -> u64 {
    secs.map(|secs| secs.saturating_mul(1_000))
        .unwrap_or(default_ms)
}

fn build_config(args: &Args) -> Result<ArenaConfig> {
    let defaults = ArenaConfig::default();
    if let Some(0) = args.sweep_interval_secs {
        anyhow::bail!("sweep_interval_secs must be > 0 when set");
    }
    if let Some(0) = args.idempotency_ttl_secs {
        anyhow::bail!("idempotency_ttl_secs must be > 0 when set");
    }

    Ok(ArenaConfig {
        database_path: args.database_path.clone(),
        sweep_interval_ms: secs_to_ms(args.sweep_interval_secs, defaults.sweep_interval_ms),
        maintenance_interval_ms: defaults.maintenance_interval_ms,
        match_spacing_ms: secs_to_ms(args.match_spacing_secs, defaults.match_spacing_ms),
        prize_distribution_delay_ms: secs_to_ms(
            args.prize_delay_secs,
            defaults.prize_distribution_delay_ms,
        ),
        idempotency_ttl_ms: secs_to_ms(args.idempotency_ttl_secs, defaults.idempotency_ttl_ms),
        idempotency_body_limit_bytes: match args.idempotency_body_limit_bytes {
            Some(0) | None => defaults.idempotency_body_limit_bytes,
            Some(limit) => limit,
        },
        registration_window_ms: secs_to_ms(
            args.registration_window_secs,
            defaults.registration_window_ms,
        ),
        registration_max_attempts: args
            .registration_max_attempts
            .unwrap_or(defaults.registration_max_attempts),
        referral_window_ms: secs_to_ms(args.referral_window_secs, defaults.referral_window_ms),
        referral_max_per_caller: args
            .referral_max_per_caller
            .unwrap_or(defaults.referral_max_per_caller),
        referral_max_per_ip: args.referral_max_per_ip.unwrap_or(defaults.referral_max_per_ip),
        referral_max_per_device: args
            .referral_max_per_device
            .unwrap_or(defaults.referral_max_per_device),
        referral_max_per_code: args
            .referral_max_per_code
            .unwrap_or(defaults.referral_max_per_code),
        http_rate_limit_per_second: map_optional_limit(args.http_rate_limit_per_second, defaults.http_rate_limit_per_second),
        http_rate_limit_burst: map_optional_limit(args.http_rate_limit_burst, defaults.http_rate_limit_burst),
        http_body_limit_bytes: map_optional_limit(args.http_body_limit_bytes, defaults.http_body_limit_bytes),
        allowed_origins: args.allowed_origins.clone(),
        allow_no_origin: defaults.allow_no_origin,
        counters_redis_url: args.counters_redis_url.clone(),
        counters_redis_prefix: args
            .counters_redis_prefix
            .clone()
            .or_else(|| defaults.counters_redis_prefix.clone()),
    })
}

fn require_env(var: &str) -> Result<String> {
    let value = std::env::var(var).unwrap_or_default();
    if value.trim().is_empty() {
        anyhow::bail!("Missing required env: {var}");
    }
    Ok(value)
}

fn require_positive_u64(var: &str) -> Result<()> {
    let value = require_env(var)?;
    let parsed: u64 = value
        .parse()
        .with_context(|| format!("Invalid {var}: {value}"))?;
    if parsed == 0 {
        anyhow::bail!("Invalid {var}: {value}");
    }
    Ok(())
}

fn ensure_production_env() -> Result<()> {
    if !is_production() {
        return Ok(());
    }

    require_env("ALLOWED_HTTP_ORIGINS")?;
    require_env("METRICS_AUTH_TOKEN")?;
    require_positive_u64("RATE_LIMIT_HTTP_PER_SEC")?;
    require_positive_u64("RATE_LIMIT_HTTP_BURST")?;

    Ok(())
}

fn build_counters(config: &ArenaConfig) -> Result<Arc<dyn CounterBackend>> {
    match &config.counters_redis_url {
        Some(url) => {
            let counters = RedisCounters::new(url, config.counters_redis_prefix())
                .context("invalid counters redis url")?;
            info!(prefix = %config.counters_redis_prefix(), "guard counters in redis");
            Ok(Arc::new(counters))
        }
        None => Ok(Arc::new(InProcessCounters::new())),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing()?;
    ensure_production_env()?;

    let config = build_config(&args)?;
    let stores = match &config.database_path {
        Some(path) => {
            let stores = Stores::sqlite(path)
                .with_context(|| format!("open database {}", path.display()))?;
            info!(path = %path.display(), "sqlite store enabled");
            stores
        }
        None => {
            warn!("no --database-path; tournaments, jobs and idempotency records live in memory");
            Stores::memory()
        }
    };

    let directory = Arc::new(InMemoryDirectory::new());
    if let Some(path) = &args.fixtures {
        Fixtures::load(path)?
            .seed(&directory, &stores, now_ms())
            .await
            .context("seed fixtures")?;
    }
    let collaborators =
        Collaborators::from_directory(directory).with_notifier(Arc::new(LogNotifier));
    let counters = build_counters(&config)?;

    let arena = Arc::new(Arena::new(config, stores, collaborators, counters));
    tokio::spawn(run_lifecycle(arena.clone()));
    tokio::spawn(run_maintenance(arena.clone()));

    let app = Api::new(arena).router();
    let addr = SocketAddr::new(args.host, args.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Listening on {}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("axum server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_disables_http_limits() {
        let args = Args::parse_from([
            "gauntlet-server",
            "--http-rate-limit-per-second",
            "0",
            "--http-body-limit-bytes",
            "4096",
            "--sweep-interval-secs",
            "30",
        ]);
        let config = build_config(&args).expect("config should parse");
        assert_eq!(config.http_rate_limit_per_second, None);
        assert_eq!(config.http_body_limit_bytes, Some(4096));
        assert_eq!(config.sweep_interval_ms, 30_000);
        assert_eq!(
            config.http_rate_limit_burst,
            ArenaConfig::default().http_rate_limit_burst
        );
    }

    #[test]
    fn rejects_zero_sweep_interval() {
        let args = Args::parse_from(["gauntlet-server", "--sweep-interval-secs", "0"]);
        let err = build_config(&args).unwrap_err();
        assert!(
            err.to_string().contains("sweep_interval_secs"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn parses_origins_and_storage() {
        let args = Args::parse_from([
            "gauntlet-server",
            "--allowed-origins",
            "https://a.example,https://b.example",
            "--database-path",
            "/tmp/gauntlet.db",
        ]);
        let config = build_config(&args).unwrap();
        assert_eq!(
            config.allowed_origins,
            vec!["https://a.example", "https://b.example"]
        );
        assert_eq!(config.database_path, Some(PathBuf::from("/tmp/gauntlet.db")));
    }
}
