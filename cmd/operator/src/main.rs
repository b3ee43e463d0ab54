use vertiop_k8s_util::client::new_client_with_metrics;
use vertiop_operator::controller::{
    check_api_queryable, create_subscriber, ControllerId, State as VertiopState,
    SUBSCRIBE_BUFFER_SIZE,
};
use vertiop_operator::telemetry;
use vertiop_operator::vdb::crd::VerticaDB;

use vertiop_autoscaler::crd::VerticaAutoscaler;
use vertiop_eventtrigger::crd::EventTrigger;
use vertiop_replicator::crd::VerticaReplicator;
use vertiop_restorepoints::crd::VerticaRestorePointsQuery;
use vertiop_scrutinize::crd::VerticaScrutinize;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, Router};
use clap::{crate_authors, crate_description, crate_version, Parser};
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::api::Api;
use kube::{Client, Config, Resource};
use prometheus_client::registry::Registry;
use serde::de::DeserializeOwned;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};

async fn metrics(State(state): State<VertiopState>) -> impl IntoResponse {
    match state.metrics() {
        Ok(metrics) => (
            StatusCode::OK,
            [(
                "content-type",
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            metrics,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Failed to get metrics: {:?}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn health() -> impl IntoResponse {
    Json("healthy")
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq)]
enum MetricsExposeMode {
    Disable,
    EnableWithoutAuth,
    EnableWithAuth,
    EnableWithTls,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq)]
enum ControllersScope {
    Cluster,
    Namespace,
}

#[derive(Parser, Debug)]
#[command(
    name="vertiop",
    about = crate_description!(),
    version = crate_version!(),
    author = crate_authors!("\n"),
)]
struct Args {
    /// Address for the metrics and health endpoints
    #[arg(long, default_value = "0.0.0.0:8080", env)]
    metrics_address: SocketAddr,

    /// How the metrics endpoint is exposed
    #[arg(long, value_enum, default_value_t = MetricsExposeMode::EnableWithoutAuth, env)]
    metrics_expose_mode: MetricsExposeMode,

    /// Bearer token required when the expose mode enables auth
    #[arg(long, env)]
    metrics_auth_token: Option<String>,

    /// TLS certificate for the metrics endpoint when exposed with TLS
    #[arg(long, env)]
    metrics_tls_cert: Option<PathBuf>,

    /// TLS private key for the metrics endpoint when exposed with TLS
    #[arg(long, env)]
    metrics_tls_key: Option<PathBuf>,

    /// Set logging filter directive for `tracing_subscriber::filter::EnvFilter`. Example: "info,kube=debug,vertiop=debug"
    #[arg(long, default_value = "info", env)]
    log_filter: String,

    /// Set log format
    #[arg(long, value_enum, default_value_t = telemetry::LogFormat::Text, env)]
    log_format: telemetry::LogFormat,

    /// URL for the OpenTelemetry tracing endpoint.
    ///
    /// This optional argument specifies the URL to which traces will be sent using
    /// OpenTelemetry. If not provided, tracing will be disabled.
    #[arg(short, long, env = "OPENTELEMETRY_ENDPOINT_URL")]
    tracing_url: Option<String>,

    /// Sampling ratio for tracing: `1.0` samples all traces, lower values
    /// sample fewer. Defaults to 10%.
    #[arg(short, long, default_value_t = 0.1, env)]
    sample_ratio: f64,

    /// Run the reconcilers; turn off to serve only metrics and health
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true, env)]
    enable_controllers: bool,

    /// Whether the controllers watch the whole cluster or one namespace
    #[arg(long, value_enum, default_value_t = ControllersScope::Cluster, env)]
    controllers_scope: ControllersScope,

    /// The namespace watched when the scope is namespace
    #[arg(long, env)]
    watch_namespace: Option<String>,

    /// Concurrent reconciles for VerticaDB resources
    #[arg(long, default_value_t = 5, env)]
    vdb_concurrency: u16,

    /// Concurrent reconciles for each sibling resource kind
    #[arg(long, default_value_t = 2, env)]
    sibling_concurrency: u16,

    /// Burst size of the event broadcaster
    #[arg(long, default_value_t = 100, env)]
    event_burst: usize,

    /// Cap in seconds on the error backoff for VerticaDB resources
    #[arg(long, default_value_t = 1000, env)]
    vdb_max_backoff_seconds: u64,

    /// Cap in seconds on the error backoff for sandbox config maps
    #[arg(long, default_value_t = 300, env)]
    sandbox_max_backoff_seconds: u64,
}

fn scoped_api<K>(client: &Client, args: &Args) -> Api<K>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
    <K as Resource>::DynamicType: Default,
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
{
    match (&args.controllers_scope, &args.watch_namespace) {
        (ControllersScope::Namespace, Some(namespace)) => {
            Api::namespaced(client.clone(), namespace)
        }
        _ => Api::all(client.clone()),
    }
}

async fn require_bearer(
    State(token): State<String>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {token}"))
        .unwrap_or(false);
    if authorized {
        next.run(request).await
    } else {
        StatusCode::UNAUTHORIZED.into_response()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = Args::parse();

    telemetry::init(
        &args.log_filter,
        args.log_format,
        args.tracing_url.as_deref(),
        args.sample_ratio,
    )
    .await
    .map_err(|e| anyhow::anyhow!("failed to init telemetry: {e}"))?;

    let mut registry = Registry::default();
    let config = Config::infer().await?;
    let client = new_client_with_metrics(config, &mut registry).await?;

    let controllers: [ControllerId; 7] = [
        vertiop_operator::vdb::controller::CONTROLLER_ID,
        vertiop_sandbox::controller::CONTROLLER_ID,
        vertiop_autoscaler::controller::CONTROLLER_ID,
        vertiop_replicator::controller::CONTROLLER_ID,
        vertiop_restorepoints::controller::CONTROLLER_ID,
        vertiop_scrutinize::controller::CONTROLLER_ID,
        vertiop_eventtrigger::controller::CONTROLLER_ID,
    ];

    let vdb: Api<VerticaDB> = scoped_api(&client, &args);
    check_api_queryable::<VerticaDB>(client.clone()).await;
    let vdb_r = create_subscriber::<VerticaDB>(SUBSCRIBE_BUFFER_SIZE);
    let pod: Api<Pod> = scoped_api(&client, &args);
    let pod_r = create_subscriber::<Pod>(SUBSCRIBE_BUFFER_SIZE);

    let backoff_caps = HashMap::from([
        (
            vertiop_operator::vdb::controller::CONTROLLER_ID,
            Duration::from_secs(args.vdb_max_backoff_seconds),
        ),
        (
            vertiop_sandbox::controller::CONTROLLER_ID,
            Duration::from_secs(args.sandbox_max_backoff_seconds),
        ),
    ]);
    let controller_metrics =
        vertiop_operator::metrics::Metrics::new(registry, &controllers);
    let state = VertiopState::new(
        controller_metrics,
        vdb_r.store.clone(),
        pod_r.store.clone(),
        args.event_burst,
        backoff_caps,
    );

    let app = Router::new().route("/health", get(health));
    let app = match args.metrics_expose_mode {
        MetricsExposeMode::Disable => app,
        MetricsExposeMode::EnableWithAuth => {
            let token = args
                .metrics_auth_token
                .clone()
                .ok_or_else(|| anyhow::anyhow!("metrics auth requires --metrics-auth-token"))?;
            app.route(
                "/metrics",
                get(metrics).layer(middleware::from_fn_with_state(token, require_bearer)),
            )
        }
        _ => app.route("/metrics", get(metrics)),
    };
    let app = app.with_state(state.clone());

    let server = run_server(&args, app);

    if !args.enable_controllers {
        tracing::info!("controllers disabled, serving endpoints only");
        server.await?;
        return Ok(());
    }

    let vdb_c = vertiop_operator::vdb::controller::run(
        state.clone(),
        client.clone(),
        vdb,
        vdb_r,
        pod,
        pod_r,
        args.vdb_concurrency,
    );
    let sandbox_c = vertiop_sandbox::controller::run(
        state.clone(),
        client.clone(),
        scoped_api::<ConfigMap>(&client, &args),
    );
    let autoscaler_c = vertiop_autoscaler::controller::run(
        state.clone(),
        client.clone(),
        scoped_api::<VerticaAutoscaler>(&client, &args),
        args.sibling_concurrency,
    );
    let replicator_c = vertiop_replicator::controller::run(
        state.clone(),
        client.clone(),
        scoped_api::<VerticaReplicator>(&client, &args),
        args.sibling_concurrency,
    );
    let restorepoints_c = vertiop_restorepoints::controller::run(
        state.clone(),
        client.clone(),
        scoped_api::<VerticaRestorePointsQuery>(&client, &args),
        args.sibling_concurrency,
    );
    let scrutinize_c = vertiop_scrutinize::controller::run(
        state.clone(),
        client.clone(),
        scoped_api::<VerticaScrutinize>(&client, &args),
        args.sibling_concurrency,
    );
    let eventtrigger_c = vertiop_eventtrigger::controller::run(
        state.clone(),
        client.clone(),
        scoped_api::<EventTrigger>(&client, &args),
        args.sibling_concurrency,
    );

    tokio::join!(
        vdb_c,
        sandbox_c,
        autoscaler_c,
        replicator_c,
        restorepoints_c,
        scrutinize_c,
        eventtrigger_c,
        server
    )
    .7?;
    Ok(())
}

async fn run_server(args: &Args, app: Router) -> anyhow::Result<()> {
    if args.metrics_expose_mode == MetricsExposeMode::EnableWithTls {
        let (cert, key) = match (&args.metrics_tls_cert, &args.metrics_tls_key) {
            (Some(cert), Some(key)) => (cert.clone(), key.clone()),
            _ => anyhow::bail!("metrics TLS requires --metrics-tls-cert and --metrics-tls-key"),
        };
        let tls_config =
            axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key).await?;
        axum_server::bind_rustls(args.metrics_address, tls_config)
            .serve(app.into_make_service())
            .await?;
        return Ok(());
    }
    let listener = TcpListener::bind(args.metrics_address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
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
