//! # HTTP Control API
//!
//! Thin HTTP front for the control channel. Every control endpoint only
//! queues a command and acknowledges the queueing; the control loop of the
//! node executes it.
//!
//! | route                 | effect                                             |
//! |-----------------------|----------------------------------------------------|
//! | `GET /status`         | cached status, else queue `get_status` and wait    |
//! | `GET /status?flush=1` | drop the cache first                               |
//! | `GET /reload`         | queue `reload`                                     |
//! | `GET /restart`        | queue `restart`                                    |
//! | `GET /upload`         | queue `upload`                                     |
//! | `GET /health`         | node id and live workers of this process           |
//! | `GET /nodes`          | latest published status of every node              |
//! | `GET /nodes/{node}`   | latest published status of one node                |

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use lib_common::control::ControlPlane;
use lib_common::queue::{Broker, BrokerConnector, Command, ControlChannel, QueueError, connect_with_retry};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Body returned by `/status` when no snapshot arrives in time.
pub const NO_DATA: &str = "no data";

const STATUS_POLL: Duration = Duration::from_millis(100);

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    pub control: Arc<ControlPlane>,
    pub broker: Arc<dyn Broker>,
    pub status_wait: Duration,
}

/// # API Error
#[derive(Debug)]
pub enum ApiError {
    /// The broker behind the control channel failed.
    Broker(QueueError),
    /// No status is known for the requested node.
    UnknownNode(String),
}

impl From<QueueError> for ApiError {
    fn from(error: QueueError) -> Self {
        ApiError::Broker(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Broker(e) => {
                error!(error = %e, "control channel unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    json!({ "error_type": "BrokerUnavailable", "message": e.to_string() }),
                )
            }
            ApiError::UnknownNode(node) => (
                StatusCode::NOT_FOUND,
                json!({ "error_type": "UnknownNode", "message": format!("no status published by '{}'", node) }),
            ),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StatusQuery {
    flush: Option<String>,
}

impl StatusQuery {
    fn flush(&self) -> bool {
        matches!(self.flush.as_deref(), Some("1") | Some("true"))
    }
}

/// Snapshots are stored as JSON text; anything else is returned verbatim.
fn as_json(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/reload", get(reload))
        .route("/restart", get(restart))
        .route("/upload", get(upload))
        .route("/health", get(health))
        .route("/nodes", get(nodes))
        .route("/nodes/{node}", get(node_status))
        .with_state(state)
}

async fn status(State(state): State<ApiState>, Query(query): Query<StatusQuery>) -> Result<Json<Value>, ApiError> {
    if query.flush() {
        state.broker.clear_local_status().await?;
    } else if let Some(cached) = state.broker.load_local_status().await? {
        return Ok(Json(as_json(cached)));
    }

    state.broker.push_command(Command::GetStatus).await?;
    let deadline = tokio::time::Instant::now() + state.status_wait;
    while tokio::time::Instant::now() < deadline {
        tokio::time::sleep(STATUS_POLL).await;
        if let Some(fresh) = state.broker.load_local_status().await? {
            return Ok(Json(as_json(fresh)));
        }
    }
    Ok(Json(json!({ "status": NO_DATA })))
}

async fn queue(state: &ApiState, command: Command) -> Result<Json<Value>, ApiError> {
    let name = command.as_str();
    state.broker.push_command(command).await?;
    info!(command = name, "command queued");
    Ok(Json(json!({ "status": "queued", "command": name })))
}

async fn reload(State(state): State<ApiState>) -> Result<Json<Value>, ApiError> {
    queue(&state, Command::Reload).await
}

async fn restart(State(state): State<ApiState>) -> Result<Json<Value>, ApiError> {
    queue(&state, Command::Restart).await
}

async fn upload(State(state): State<ApiState>) -> Result<Json<Value>, ApiError> {
    queue(&state, Command::Upload).await
}

async fn health(State(state): State<ApiState>) -> Json<Value> {
    let snapshot = state.control.snapshot();
    Json(json!({
        "status": "ok",
        "node": snapshot.node_id,
        "live_workers": snapshot.live_worker_names,
    }))
}

async fn nodes(State(state): State<ApiState>) -> Result<Json<BTreeMap<String, Value>>, ApiError> {
    let statuses = state.broker.node_statuses().await?;
    Ok(Json(statuses.into_iter().map(|(node, raw)| (node, as_json(raw))).collect()))
}

async fn node_status(State(state): State<ApiState>, Path(node): Path<String>) -> Result<Json<Value>, ApiError> {
    let mut statuses = state.broker.node_statuses().await?;
    statuses
        .remove(&node)
        .map(|raw| Json(as_json(raw)))
        .ok_or(ApiError::UnknownNode(node))
}

/// Serves the API on an already bound listener until `cancel` fires.
pub async fn serve(listener: TcpListener, state: ApiState, cancel: CancellationToken) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

/// # Run
///
/// Connects to the broker, binds `[http].bind` and serves until `cancel`.
pub async fn run(control: Arc<ControlPlane>, connector: Arc<dyn BrokerConnector>, cancel: CancellationToken) -> Result<()> {
    let config = control.config();
    let backoff = Duration::from_secs(config.redis.retry_backoff_secs);
    let Some(broker) = connect_with_retry(connector.as_ref(), backoff, &cancel, "http").await else {
        return Ok(());
    };
    let listener = TcpListener::bind(&config.http.bind)
        .await
        .with_context(|| format!("failed to bind HTTP API on {}", config.http.bind))?;
    info!("HTTP API listening on http://{}", config.http.bind);
    let state = ApiState {
        control,
        broker,
        status_wait: Duration::from_secs(config.http.status_wait_secs),
    };
    serve(listener, state, cancel).await.context("HTTP API failed")?;
    info!("HTTP API stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_common::configs::AgentConfig;
    use lib_common::control::run_command_loop;
    use lib_common::queue::MemoryBroker;

    struct Running {
        base: String,
        broker: MemoryBroker,
        control: Arc<ControlPlane>,
        cancel: CancellationToken,
    }

    async fn start(status_wait: Duration) -> Running {
        let mut config = AgentConfig {
            node: "edge-1".to_string(),
            ..AgentConfig::default()
        };
        config.control.command_interval_ms = 10;
        let control = ControlPlane::with_config(config);
        let broker = MemoryBroker::default();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let cancel = CancellationToken::new();
        let state = ApiState {
            control: control.clone(),
            broker: Arc::new(broker.clone()),
            status_wait,
        };
        tokio::spawn(serve(listener, state, cancel.clone()));
        Running {
            base,
            broker,
            control,
            cancel,
        }
    }

    async fn get(url: String) -> (u16, Value) {
        let response = reqwest::get(url).await.unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    #[tokio::test]
    async fn status_times_out_with_sentinel() {
        let api = start(Duration::from_millis(300)).await;
        let (code, body) = get(format!("{}/status", api.base)).await;
        assert_eq!(code, 200);
        assert_eq!(body, json!({ "status": NO_DATA }));
        assert_eq!(api.broker.command_backlog(), 1);
        api.cancel.cancel();
    }

    #[tokio::test]
    async fn status_is_answered_by_the_control_loop() {
        let api = start(Duration::from_secs(3)).await;
        tokio::spawn(run_command_loop(
            api.control.clone(),
            Arc::new(api.broker.clone()),
            None,
            api.cancel.clone(),
        ));
        let (code, body) = get(format!("{}/status?flush=1", api.base)).await;
        assert_eq!(code, 200);
        assert_eq!(body["node_id"], json!("edge-1"));

        // Served from the cache this time.
        let (_, cached) = get(format!("{}/status", api.base)).await;
        assert_eq!(cached["node_id"], json!("edge-1"));
        api.cancel.cancel();
    }

    #[tokio::test]
    async fn control_endpoints_only_queue() {
        let api = start(Duration::from_millis(100)).await;
        for route in ["reload", "restart", "upload"] {
            let (code, body) = get(format!("{}/{}", api.base, route)).await;
            assert_eq!(code, 200);
            assert_eq!(body["command"], json!(route));
        }
        assert_eq!(api.broker.command_backlog(), 3);
        assert!(!api.control.reload_pending());
        api.cancel.cancel();
    }

    #[tokio::test]
    async fn node_statuses_are_aggregated() {
        let api = start(Duration::from_millis(100)).await;
        api.broker.publish_node_status("edge-2", "{\"node_id\":\"edge-2\"}").await.unwrap();

        let (_, all) = get(format!("{}/nodes", api.base)).await;
        assert_eq!(all["edge-2"]["node_id"], json!("edge-2"));
        let (code, _) = get(format!("{}/nodes/edge-3", api.base)).await;
        assert_eq!(code, 404);
        let (code, health) = get(format!("{}/health", api.base)).await;
        assert_eq!(code, 200);
        assert_eq!(health["node"], json!("edge-1"));
        api.cancel.cancel();
    }
}
