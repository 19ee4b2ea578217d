use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Parser, ValueEnum};
use tokio::sync::watch;
use tracing::{error, info, warn};

use condwatch_core::ResourceCoordinate;
use condwatch_emit::EmitStrategy;
use condwatch_pipeline::{Pipeline, PipelineConfig, PipelineError};

#[derive(Parser, Debug)]
#[command(
    name = "condwatch",
    version,
    about = "Emit cluster events from the status conditions of a watched resource type"
)]
struct Cli {
    /// API group of the watched resource
    #[arg(long, env = "CONDWATCH_GROUP", default_value = "cluster.x-k8s.io")]
    group: String,

    /// API version of the watched resource
    #[arg(long = "api-version", env = "CONDWATCH_VERSION", default_value = "v1beta1")]
    api_version: String,

    /// Plural resource name of the watched resource
    #[arg(long, env = "CONDWATCH_RESOURCE", default_value = "clusters")]
    resource: String,

    /// Resync interval in seconds (synthetic re-delivery of the mirror)
    #[arg(long, env = "CONDWATCH_RESYNC_SECONDS", default_value_t = 60)]
    resync_seconds: u64,

    /// Minimum seconds between events for one (object, condition type) pair; 0 disables
    #[arg(long, env = "CONDWATCH_THROTTLE_SECONDS", default_value_t = 0)]
    throttle_seconds: u64,

    /// How long to wait for the initial cache sync, in seconds
    #[arg(long, env = "CONDWATCH_SYNC_TIMEOUT_SECONDS", default_value_t = 30)]
    sync_timeout_seconds: u64,

    /// Event emission strategy
    #[arg(long, value_enum, env = "CONDWATCH_EMITTER", default_value_t = Emitter::Apply)]
    emitter: Emitter,

    /// Dump verbose output
    #[arg(long, env = "CONDWATCH_DEBUG", action = ArgAction::SetTrue)]
    debug: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Emitter {
    /// Create named event records via server-side apply
    Apply,
    /// Delegate to the cluster event recorder
    Recorder,
}

impl From<Emitter> for EmitStrategy {
    fn from(e: Emitter) -> Self {
        match e {
            Emitter::Apply => EmitStrategy::Apply,
            Emitter::Recorder => EmitStrategy::Recorder,
        }
    }
}

fn init_tracing(debug: bool) {
    let env = if debug {
        "debug".to_string()
    } else {
        std::env::var("CONDWATCH_LOG").unwrap_or_else(|_| "info".to_string())
    };
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CONDWATCH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid CONDWATCH_METRICS_ADDR; expected host:port");
        }
    }
}

async fn shutdown_signal(stop: watch::Sender<bool>) {
    let term = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "installing SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Ctrl-C received; shutting down"),
        _ = term => info!("SIGTERM received; shutting down"),
    }
    let _ = stop.send(true);
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    init_metrics();

    let coordinate = ResourceCoordinate::new(cli.group, cli.api_version, cli.resource);
    info!(
        coordinate = %coordinate,
        resync_seconds = cli.resync_seconds,
        throttle_seconds = cli.throttle_seconds,
        emitter = ?cli.emitter,
        debug = cli.debug,
        "starting condwatch"
    );

    let client = condwatch_hub::get_kube_client().await?;

    let mut cfg = PipelineConfig::new(coordinate);
    cfg.resync = Duration::from_secs(cli.resync_seconds.max(1));
    cfg.throttle = Duration::from_secs(cli.throttle_seconds);
    cfg.sync_timeout = Duration::from_secs(cli.sync_timeout_seconds.max(1));
    cfg.strategy = cli.emitter.into();
    if let Some(cap) = std::env::var("CONDWATCH_QUEUE_CAP").ok().and_then(|s| s.parse().ok()) {
        cfg.queue_cap = cap;
    }

    let pipeline = Pipeline::new(client, cfg).await?;

    let mut ready = pipeline.subscribe_ready();
    tokio::spawn(async move {
        if ready.changed().await.is_ok() && *ready.borrow() {
            info!("pipeline ready");
        }
    });

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(shutdown_signal(stop_tx));

    match pipeline.run(stop_rx).await {
        Ok(()) => {
            info!("condwatch done");
            Ok(())
        }
        Err(e @ PipelineError::SyncTimeout) => {
            error!(error = %e, "pipeline never became ready");
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}
