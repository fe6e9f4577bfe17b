//! Quota Reconciler
//!
//! Runs the reconciliation engine for every configured cluster: periodic
//! capacity and project scrapes, the REST API for operator edits, the audit
//! trail, and health and metrics endpoints.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use quota_reconciler::audit::{AuditPipeline, Observer, WebhookSink};
use quota_reconciler::{
    wait_for_schema, ApiServer, ApiServerConfig, Configuration, DriverFactory, Engine,
    EngineMetrics, HierarchyStore, Scheduler, TrustedHeaderAuthorizer,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Quota Reconciler - hierarchical quota and capacity engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(long, env = "QUOTA_RECONCILER_CONFIG", default_value = "/etc/quota-reconciler/config.yaml")]
    config: String,

    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Cluster used when a request does not name one
    #[arg(long, env = "DEFAULT_CLUSTER")]
    default_cluster: Option<String>,

    /// Name reported as the observer of audit events
    #[arg(long, env = "AUDIT_OBSERVER", default_value = "quota-reconciler")]
    audit_observer: String,

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

    // Initialize logging
    init_logging(&args)?;

    info!("Starting Quota Reconciler");
    info!("  Version: {}", quota_reconciler::VERSION);
    info!("  Config: {}", args.config);
    info!("  REST API: {}", args.api_addr);

    let config = Configuration::load(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config))?;
    info!("Loaded configuration for {} clusters", config.clusters.len());

    // Start health server
    let ready = Arc::new(AtomicBool::new(false));
    let health_addr = args.health_addr.clone();
    let health_ready = ready.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_ready).await {
            error!("Health server error: {}", e);
        }
    });

    // The in-memory store is migrated in place before the usual wait
    let store = HierarchyStore::new();
    store.set_schema_version(config.database.expected_schema_version);
    wait_for_schema(store.as_ref(), config.database.expected_schema_version)
        .await
        .context("waiting for store schema")?;

    let metrics = Arc::new(EngineMetrics::new().context("registering engine metrics")?);

    // Audit trail per cluster
    let mut audit = AuditPipeline::new(Observer::new(args.audit_observer.clone()), metrics.clone());
    for (cluster_id, cluster) in &config.clusters {
        match (&cluster.audit.sink, cluster.audit.enabled) {
            (Some(sink), true) => {
                let sink = WebhookSink::new(sink)
                    .with_context(|| format!("creating audit sink for cluster {}", cluster_id))?;
                audit.enable_cluster(cluster_id, Arc::new(sink), cluster.audit.silent);
            }
            _ => audit.disable_cluster(cluster_id, cluster.audit.silent),
        }
    }

    let engine = Engine::new(
        &config,
        store,
        metrics.clone(),
        Arc::new(audit),
        &DriverFactory::with_builtins(),
        args.default_cluster.as_deref(),
    )
    .context("building engine")?;
    engine.init().await.context("initializing clusters")?;
    let discovered = engine.discover_all().await;
    info!("Initial discovery registered {} new domains", discovered);
    let engine = Arc::new(engine);

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics).await {
            error!("Metrics server error: {}", e);
        }
    });

    let mut scheduler = Scheduler::new(engine.clone());
    scheduler.start();
    ready.store(true, Ordering::Release);

    // Create and run API server
    let api_config = ApiServerConfig {
        rest_addr: args
            .api_addr
            .parse()
            .with_context(|| format!("invalid REST API address {}", args.api_addr))?,
    };
    let authorizer = Arc::new(TrustedHeaderAuthorizer::new(&config.policy));
    let api_server = Arc::new(ApiServer::new(api_config, engine, authorizer));

    let signal_server = api_server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            signal_server.shutdown();
        }
    });

    api_server.run().await?;

    ready.store(false, Ordering::Release);
    scheduler.shutdown().await;
    info!("Quota Reconciler shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
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
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=warn".parse()?)
        .add_directive("tower_http=info".parse()?)
        .add_directive("axum=info".parse()?);

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
    Ok(())
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str, ready: Arc<AtomicBool>) -> anyhow::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let ready = ready.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ready = ready.load(Ordering::Acquire);
                async move {
                    let (status, body) = match req.uri().path() {
                        "/healthz" | "/livez" => (StatusCode::OK, "ok"),
                        "/readyz" if ready => (StatusCode::OK, "ok"),
                        "/readyz" => (StatusCode::SERVICE_UNAVAILABLE, "starting"),
                        _ => (StatusCode::NOT_FOUND, "not found"),
                    };
                    let mut response = Response::new(Body::from(body));
                    *response.status_mut() = status;
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid health server address {}", addr))?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr).serve(make_svc).await?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, metrics: Arc<EngineMetrics>) -> anyhow::Result<()> {
    use hyper::header::CONTENT_TYPE;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let mut response = match req.uri().path() {
                        "/metrics" => match metrics.encode_text() {
                            Ok(text) => {
                                let mut response = Response::new(Body::from(text));
                                response.headers_mut().insert(
                                    CONTENT_TYPE,
                                    hyper::header::HeaderValue::from_static(
                                        "text/plain; version=0.0.4",
                                    ),
                                );
                                response
                            }
                            Err(e) => {
                                error!("Failed to encode metrics: {}", e);
                                let mut response = Response::new(Body::from("encoding failed"));
                                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                                response
                            }
                        },
                        _ => Response::new(Body::from("not found")),
                    };
                    if req.uri().path() != "/metrics" {
                        *response.status_mut() = StatusCode::NOT_FOUND;
                    }
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid metrics server address {}", addr))?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr).serve(make_svc).await?;

    Ok(())
}
