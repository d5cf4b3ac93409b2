//! Fleet Controller binary: wires configuration, tracing, the Controller
//! actor, and the HTTP surface (`fetch`, `/healthz`, `/metrics`) together.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router as AxumRouter;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fleet_controller::config::{Config, LogFormat};
use fleet_controller::controller::{Controller, FetchOutcome};
use fleet_controller::instance_manager::HttpContainerRuntime;
use fleet_controller::{ControllerHandle, Registry};

#[derive(Clone)]
struct AppState {
    controller: ControllerHandle,
    monitoring_endpoint: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("FLEET_CONFIG_FILE").ok();
    let config = Config::load(config_path.as_deref())?;

    init_tracing(&config);

    info!(
        max_instances = config.max_instances,
        min_instances = config.min_instances,
        "starting fleet-controller"
    );

    fleet_controller::metrics::describe_metrics();
    tokio::spawn({
        let metrics_addr = config.metrics_addr.clone();
        async move { fleet_controller::metrics::start_metrics_server(&metrics_addr).await }
    });

    let registry = Arc::new(Registry::open(&config.sqlite_path)?);
    let runtime = Arc::new(HttpContainerRuntime::new(
        config.provisioning_webhook_url.clone(),
        config.monitoring_endpoint.clone(),
    ));

    let (controller, join) = Controller::spawn(registry, runtime, config.clone()).await?;

    let state = AppState {
        controller: controller.clone(),
        monitoring_endpoint: config.monitoring_endpoint.clone(),
    };

    // The Controller's own liveness probe lives at a path distinct from
    // `monitoringEndpoint` (default `/healthz`), since that path is
    // reserved for the per-container health/keep-alive contract and, on
    // this listener, for the registry snapshot intercepted in `fetch`.
    let app = AxumRouter::new()
        .route("/__controller/healthz", get(healthz))
        .fallback(fetch_handler)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "fleet-controller listening");

    let shutdown_controller = controller.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received, draining controller");
            shutdown_controller.shutdown().await;
        })
        .await?;

    join.await.ok();
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.logging.filter).unwrap_or_else(|_| EnvFilter::new("fleet_controller=info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    match config.logging.format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn fetch_handler(State(state): State<AppState>, method: Method, uri: Uri) -> Response {
    let is_monitoring_get = method == Method::GET && uri.path() == state.monitoring_endpoint;

    match state.controller.fetch(uri.path(), is_monitoring_get).await {
        Ok(FetchOutcome::Forwarded { status, body }) => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
            (status, body).into_response()
        }
        Ok(FetchOutcome::ServiceUnavailable { retry_after_secs }) => {
            let mut resp = StatusCode::SERVICE_UNAVAILABLE.into_response();
            if let Some(secs) = retry_after_secs {
                resp.headers_mut()
                    .insert("Retry-After", HeaderValue::from_str(&secs.to_string()).unwrap());
            }
            resp
        }
        Ok(FetchOutcome::InternalError) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        Err(e) => {
            error!(error = %e, "fatal internal error handling request");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
