//! StrataCache Daemon
//!
//! Runs the tiered cache engine with its background maintenance tasks
//! and exposes the operational read path over HTTP:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       StrataCache Daemon                        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │ CacheEngine  │───▶│  Monitoring  │───▶│   Failover   │       │
//! │  │  (4 tiers)   │    │  (windows,   │    │  (breakers,  │       │
//! │  │              │    │   alerts)    │    │  emergency)  │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! │      /snapshot            /metrics           /healthz           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use once_cell::sync::Lazy;
use prometheus::{Gauge, IntGaugeVec};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stratacache::cache::partition::{EvictionMode, PartitionConfig};
use stratacache::cache::CacheEngine;
use stratacache::config::EngineConfig;
use stratacache::error::Result;
use stratacache::failover::{BreakerState, SystemClock};
use stratacache::tier::{
    ClusterConfig, ClusterTier, EdgeConfig, EdgeTier, PersistentConfig, PersistentTier, TierStore,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// StrataCache - multi-tier partitioned cache engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Engine configuration file (YAML)
    #[arg(long, env = "STRATACACHE_CONFIG", default_value = "stratacache.yaml")]
    config: PathBuf,

    /// Directory for the L2 persistent tier
    #[arg(long, env = "L2_DIR", default_value = "/var/cache/stratacache/l2")]
    l2_dir: PathBuf,

    /// Simulated cluster node count for the L3 tier
    #[arg(long, env = "CLUSTER_NODES", default_value = "3")]
    cluster_nodes: usize,

    /// Reporting server bind address (/metrics, /snapshot)
    #[arg(long, env = "REPORT_ADDR", default_value = "0.0.0.0:8080")]
    report_addr: String,

    /// Health server bind address (/healthz, /readyz)
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting StrataCache");
    info!("  Config file: {}", args.config.display());
    info!("  L2 directory: {}", args.l2_dir.display());
    info!("  Cluster nodes: {}", args.cluster_nodes);

    let config = load_config(&args);
    info!(
        "  Partitions: {}",
        config
            .partitions
            .iter()
            .map(|p| p.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let clock = Arc::new(SystemClock::new());

    let l2: Arc<dyn TierStore> = Arc::new(
        PersistentTier::open(
            PersistentConfig {
                root_dir: args.l2_dir.clone(),
            },
            clock.clone(),
        )
        .with_context(|| format!("opening L2 store at {}", args.l2_dir.display()))?,
    );
    let l3: Arc<dyn TierStore> = Arc::new(ClusterTier::new(ClusterConfig {
        nodes: args.cluster_nodes,
        simulated_latency: Duration::from_millis(2),
    }));
    let l4: Arc<dyn TierStore> = Arc::new(EdgeTier::new(
        EdgeConfig {
            simulated_latency: Duration::from_millis(10),
        },
        clock.clone(),
    ));

    let engine = CacheEngine::new(&config, l2, l3, l4, clock).context("building cache engine")?;
    let maintenance = engine.spawn_maintenance(config.sweep_interval());
    info!("Engine started, all circuits closed");

    // Reporting server (/metrics, /snapshot)
    let report_addr = args.report_addr.clone();
    let report_engine = engine.clone();
    tokio::spawn(async move {
        if let Err(e) = run_report_server(&report_addr, report_engine).await {
            error!("Reporting server error: {}", e);
        }
    });

    // Health server (/healthz, /readyz)
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await.context("signal handler failed")?;

    info!("Shutting down");
    maintenance.cancel();
    Ok(())
}

// =============================================================================
// Configuration
// =============================================================================

fn load_config(args: &Args) -> EngineConfig {
    match EngineConfig::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            warn!("Config file unusable ({}), using built-in defaults", e);
            default_config()
        }
    }
}

fn default_config() -> EngineConfig {
    EngineConfig {
        partitions: vec![
            PartitionConfig {
                name: "feed_posts".to_string(),
                capacity_bytes: 50 * 1024 * 1024,
                default_ttl_secs: 1_800,
                eviction_policy: EvictionMode::Lru,
            },
            PartitionConfig {
                name: "user_profiles".to_string(),
                capacity_bytes: 16 * 1024 * 1024,
                default_ttl_secs: 3_600,
                eviction_policy: EvictionMode::Lru,
            },
            PartitionConfig {
                name: "media_meta".to_string(),
                capacity_bytes: 8 * 1024 * 1024,
                default_ttl_secs: 600,
                eviction_policy: EvictionMode::TtlOnly,
            },
        ],
        compression: Default::default(),
        breaker: Default::default(),
        monitoring: Default::default(),
        sweep_interval_secs: 30,
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("tower=warn".parse().unwrap());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Prometheus Gauges
// =============================================================================

static TIER_HITS: Lazy<IntGaugeVec> = Lazy::new(|| {
    prometheus::register_int_gauge_vec!(
        "stratacache_tier_hits_total",
        "Cumulative hits per tier",
        &["tier"]
    )
    .unwrap()
});

static TIER_ERRORS: Lazy<IntGaugeVec> = Lazy::new(|| {
    prometheus::register_int_gauge_vec!(
        "stratacache_tier_errors_total",
        "Cumulative errors per tier",
        &["tier"]
    )
    .unwrap()
});

static BREAKER_STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    prometheus::register_int_gauge_vec!(
        "stratacache_breaker_state",
        "Breaker state per tier (0=closed, 1=half-open, 2=open)",
        &["tier"]
    )
    .unwrap()
});

static PARTITION_OCCUPANCY: Lazy<IntGaugeVec> = Lazy::new(|| {
    prometheus::register_int_gauge_vec!(
        "stratacache_partition_occupancy_bytes",
        "L1 bytes occupied per partition",
        &["partition"]
    )
    .unwrap()
});

static HIT_RATIO: Lazy<Gauge> = Lazy::new(|| {
    prometheus::register_gauge!("stratacache_hit_ratio", "Rolling overall hit ratio").unwrap()
});

fn update_gauges(engine: &CacheEngine) {
    let snapshot = engine.snapshot();

    for stats in &snapshot.tier_stats {
        TIER_HITS
            .with_label_values(&[stats.tier.label()])
            .set(stats.hits as i64);
        TIER_ERRORS
            .with_label_values(&[stats.tier.label()])
            .set(stats.errors as i64);
    }
    for health in &snapshot.tier_health {
        let state = match health.state {
            BreakerState::Closed => 0,
            BreakerState::HalfOpen => 1,
            BreakerState::Open => 2,
        };
        BREAKER_STATE
            .with_label_values(&[health.tier.label()])
            .set(state);
    }
    for occupancy in &snapshot.occupancy {
        PARTITION_OCCUPANCY
            .with_label_values(&[occupancy.partition.as_str()])
            .set(occupancy.bytes as i64);
    }
    if let Some(ratio) = snapshot.hit_ratio {
        HIT_RATIO.set(ratio);
    }
}

// =============================================================================
// Reporting Server
// =============================================================================

async fn run_report_server(addr: &str, engine: Arc<CacheEngine>) -> Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use prometheus::{Encoder, TextEncoder};
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn report_handler(
        req: Request<hyper::body::Incoming>,
        engine: Arc<CacheEngine>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/metrics" => {
                update_gauges(&engine);
                let encoder = TextEncoder::new();
                let metric_families = prometheus::gather();
                let mut buffer = Vec::new();
                encoder.encode(&metric_families, &mut buffer).unwrap();

                Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", encoder.format_type())
                    .body(Full::new(Bytes::from(buffer)))
                    .unwrap()
            }
            "/snapshot" => {
                let snapshot = engine.snapshot();
                let body = serde_json::to_vec_pretty(&snapshot).unwrap_or_default();

                Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "application/json")
                    .body(Full::new(Bytes::from(body)))
                    .unwrap()
            }
            _ => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from("not found")))
                .unwrap(),
        };
        Ok(response)
    }

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| stratacache::Error::Internal(format!("Invalid reporting address: {e}")))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| stratacache::Error::Internal(format!("Failed to bind reporting server: {e}")))?;

    info!("Reporting server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| stratacache::Error::Internal(format!("Reporting accept error: {e}")))?;

        let io = TokioIo::new(stream);
        let engine = engine.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| report_handler(req, engine.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Reporting connection error: {}", e);
            }
        });
    }
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str) -> Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn health_handler(
        req: Request<hyper::body::Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/healthz" | "/livez" => Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::from("ok")))
                .unwrap(),
            "/readyz" => Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::from("ok")))
                .unwrap(),
            _ => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from("not found")))
                .unwrap(),
        };
        Ok(response)
    }

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| stratacache::Error::Internal(format!("Invalid health address: {e}")))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| stratacache::Error::Internal(format!("Failed to bind health server: {e}")))?;

    info!("Health server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| stratacache::Error::Internal(format!("Health accept error: {e}")))?;

        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(health_handler))
                .await
            {
                tracing::error!("Health connection error: {}", e);
            }
        });
    }
}
