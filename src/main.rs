//! CSI Attacher
//!
//! Sidecar that attaches volumes to nodes for a CSI driver.
//!
//! # Startup
//!
//! ```text
//!   flags ──► AttacherConfig ──► connect driver ──► probe ──► select strategy
//!                                                                  │
//!        SIGINT/SIGTERM ──► cancel ◄── run controller ◄── (leader election)
//! ```

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use csi_attacher::config::DEFAULT_CSI_ADDRESS;
use csi_attacher::{
    bootstrap, parse_duration, AttacherConfig, Error, LeaderElectionConfig, LeaderElectionSettings,
    LockKind, Metrics, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// CSI external attacher
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Absolute path to the kubeconfig file. Required only when running out of cluster.
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Resync interval of the controller
    #[arg(long, default_value = "10m", value_parser = duration)]
    resync: std::time::Duration,

    /// This option is deprecated
    #[arg(long, default_value = "0", value_parser = duration)]
    connection_timeout: std::time::Duration,

    /// Address of the CSI driver socket
    #[arg(long, env = "CSI_ADDRESS", default_value = DEFAULT_CSI_ADDRESS)]
    csi_address: String,

    /// Run in dummy mode, i.e. not connecting to CSI driver and marking everything as attached
    #[arg(long)]
    dummy: bool,

    /// Timeout for waiting for attaching or detaching the volume
    #[arg(long, default_value = "15s", value_parser = duration)]
    timeout: std::time::Duration,

    /// Initial retry interval of failed create volume or deletion
    #[arg(long, default_value = "1s", value_parser = duration)]
    retry_interval_start: std::time::Duration,

    /// Maximum retry interval of failed create volume or deletion
    #[arg(long, default_value = "5m", value_parser = duration)]
    retry_interval_max: std::time::Duration,

    /// Enable leader election
    #[arg(long)]
    leader_election: bool,

    /// The type of leader election, options are 'configmaps' (default) or 'leases' (recommended)
    #[arg(long, default_value = "configmaps", value_parser = lock_kind)]
    leader_election_type: LockKind,

    /// Namespace where the leader election resource lives. Defaults to the pod namespace if not set.
    #[arg(long, env = "LEADER_ELECTION_NAMESPACE")]
    leader_election_namespace: Option<String>,

    /// This option is deprecated
    #[arg(long)]
    leader_election_identity: Option<String>,

    /// Duration non-leader candidates wait before forcing to acquire leadership
    #[arg(long, default_value = "15s", value_parser = duration)]
    leader_election_lease_duration: std::time::Duration,

    /// Duration the acting leader retries refreshing leadership before giving up
    #[arg(long, default_value = "10s", value_parser = duration)]
    leader_election_renew_deadline: std::time::Duration,

    /// Duration candidates wait between acquisition attempts
    #[arg(long, default_value = "5s", value_parser = duration)]
    leader_election_retry_period: std::time::Duration,

    /// Address to serve /healthz and /metrics on, e.g. ":8080". Disabled if empty.
    #[arg(long, env = "HTTP_ENDPOINT")]
    http_endpoint: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

fn duration(value: &str) -> std::result::Result<std::time::Duration, String> {
    parse_duration(value).map_err(|e| e.to_string())
}

fn lock_kind(value: &str) -> std::result::Result<LockKind, String> {
    value.parse().map_err(|e: Error| e.to_string())
}

impl Args {
    fn into_config(self) -> AttacherConfig {
        AttacherConfig {
            kubeconfig: self.kubeconfig,
            resync: self.resync,
            csi_address: self.csi_address,
            dummy: self.dummy,
            timeout: self.timeout,
            retry_interval_start: self.retry_interval_start,
            retry_interval_max: self.retry_interval_max,
            leader_election: LeaderElectionSettings {
                enabled: self.leader_election,
                kind: self.leader_election_type,
                namespace: self.leader_election_namespace.filter(|ns| !ns.is_empty()),
                timing: LeaderElectionConfig {
                    lease_duration: self.leader_election_lease_duration,
                    renew_deadline: self.leader_election_renew_deadline,
                    retry_period: self.leader_election_retry_period,
                    ..Default::default()
                },
            },
            http_endpoint: self.http_endpoint.filter(|addr| !addr.is_empty()),
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    if let Err(e) = run(args).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    info!("Starting CSI attacher");
    info!("  Version: {}", csi_attacher::VERSION);

    if !args.connection_timeout.is_zero() {
        warn!("--connection-timeout is deprecated and will have no effect");
    }
    if args.leader_election_identity.is_some() {
        warn!("--leader-election-identity is deprecated and will have no effect");
    }

    let config = args.into_config();
    info!("  CSI address: {}", config.csi_address);
    info!("  Timeout: {:?}", config.timeout);
    info!("  Leader election: {}", config.leader_election.enabled);
    info!("  Resync: {:?}", config.resync);
    info!(
        "  Retry interval: {:?} .. {:?}",
        config.retry_interval_start, config.retry_interval_max
    );

    let metrics = Metrics::new()?;

    // Start health and metrics server
    if let Some(endpoint) = config.http_endpoint.clone() {
        let addr = listen_addr(&endpoint)?;
        let metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = run_http_server(addr, metrics).await {
                error!("HTTP server error: {}", e);
            }
        });
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    bootstrap::run(config, metrics, shutdown).await?;

    info!("CSI attacher shutdown complete");
    Ok(())
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

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "h2=warn", "kube=info", "tower=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

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
// Signals
// =============================================================================

async fn watch_signals(shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
        _ = terminate.recv() => info!("Received SIGTERM, shutting down"),
    }
    shutdown.cancel();
}

// =============================================================================
// Health and Metrics Server
// =============================================================================

/// Accepts `host:port` and the `:port` shorthand
fn listen_addr(endpoint: &str) -> Result<SocketAddr> {
    let endpoint = if endpoint.starts_with(':') {
        format!("0.0.0.0{}", endpoint)
    } else {
        endpoint.to_string()
    };
    endpoint
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid --http-endpoint {:?}: {}", endpoint, e)))
}

async fn run_http_server(addr: SocketAddr, metrics: Metrics) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let mut response = match req.uri().path() {
                        "/healthz" => Response::new(Body::from("ok")),
                        "/metrics" => match metrics.encode() {
                            Ok((content_type, buffer)) => {
                                let mut response = Response::new(Body::from(buffer));
                                if let Ok(value) = content_type.parse() {
                                    response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
                                }
                                response
                            }
                            Err(e) => {
                                let mut response = Response::new(Body::from(e.to_string()));
                                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                                response
                            }
                        },
                        _ => {
                            let mut response = Response::new(Body::from("not found"));
                            *response.status_mut() = StatusCode::NOT_FOUND;
                            response
                        }
                    };
                    response
                        .headers_mut()
                        .entry(hyper::header::CACHE_CONTROL)
                        .or_insert(hyper::header::HeaderValue::from_static("no-cache"));
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!("HTTP server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("HTTP server bind error: {}", e)))?
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("HTTP server error: {}", e)))?;

    Ok(())
}
