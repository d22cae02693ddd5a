//! Fabric HTTP API
//!
//! Distribute and read endpoints, topology and metrics views, operator
//! status changes and a WebSocket push stream per (edge, kind).

use crate::adapters::outbound::ChannelSink;
use crate::application::{DistributeOptions, FabricService};
use crate::domain::entities::{RoutingEntry, StreamRecord};
use crate::domain::error::FabricError;
use crate::domain::value_objects::{CodecId, Coordinate, DataKind, EdgeStatus};
use crate::infrastructure::ShutdownController;
use axum::{
    extract::ws::{Message, WebSocket},
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Body of `POST /api/v1/distribute`.
#[derive(Debug, Clone, Deserialize)]
pub struct DistributeRequest {
    pub kind: String,
    #[serde(default)]
    pub key: Option<String>,
    pub value: Value,
    #[serde(default)]
    pub options: DistributeOptions,
}

/// Query of `GET /api/v1/data/:kind/:key`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReadQuery {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

impl ReadQuery {
    /// Both halves are needed; a lone latitude or longitude counts as absent.
    pub fn coordinate(&self) -> Option<Coordinate> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => Some(Coordinate::new(lat, lon)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusRequest {
    pub status: EdgeStatus,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub id: String,
    pub previous: EdgeStatus,
    pub status: EdgeStatus,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub edges: usize,
    pub open_channels: usize,
}

#[derive(Debug, Serialize)]
pub struct RoutesResponse {
    pub edge_id: String,
    pub routes: Vec<RoutingEntry>,
}

/// JSON frame sent on the push stream.
#[derive(Debug, Serialize)]
pub struct StreamFrame {
    pub edge_id: String,
    pub kind: DataKind,
    pub key: String,
    pub codec: CodecId,
    pub write_time_ms: u64,
    pub value: Value,
}

/// Error response body: `{error, kind, retriable}`.
pub struct ApiError(pub FabricError);

impl From<FabricError> for ApiError {
    fn from(err: FabricError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            FabricError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            FabricError::NotFound { .. } => StatusCode::NOT_FOUND,
            FabricError::EdgeUnavailable { .. }
            | FabricError::CapacityExhausted { .. }
            | FabricError::DistributionFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
            FabricError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            FabricError::DecodingFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            FabricError::Fatal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let mut body = serde_json::json!({
            "error": self.0.to_string(),
            "kind": self.0.kind(),
            "retriable": self.0.is_retriable(),
        });
        if let FabricError::DistributionFailed { errors, .. } = &self.0 {
            body["edges"] = serde_json::json!(errors);
        }

        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<FabricService>,
    pub shutdown: ShutdownController,
}

impl ApiState {
    pub fn new(service: Arc<FabricService>, shutdown: ShutdownController) -> Self {
        Self { service, shutdown }
    }
}

/// Build the router with tracing and CORS layers.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/v1/distribute", post(distribute_handler))
        .route("/api/v1/data/:kind/:key", get(read_handler))
        .route("/api/v1/topology", get(topology_handler))
        .route("/api/v1/metrics", get(metrics_handler))
        .route("/api/v1/edges/:id/routes", get(routes_handler))
        .route("/api/v1/edges/:id/status", put(edge_status_handler))
        .route("/api/v1/regions/:id/status", put(region_status_handler))
        .route("/api/v1/stream/:edge_id/:kind", get(stream_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub struct ApiServer {
    listen_addr: String,
    state: ApiState,
}

impl ApiServer {
    pub fn new(listen_addr: String, state: ApiState) -> Self {
        Self { listen_addr, state }
    }

    /// Serve until the shutdown controller fires.
    pub async fn run(&self) -> anyhow::Result<()> {
        let app = router(self.state.clone());
        let listener = TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("fabric API listening on {}", self.listen_addr);

        let shutdown = self.state.shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await?;
        Ok(())
    }
}

// Handler functions

async fn health_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        edges: state.service.edges().len(),
        open_channels: state.service.open_channels(),
    })
}

async fn distribute_handler(
    State(state): State<ApiState>,
    Json(req): Json<DistributeRequest>,
) -> ApiResult<impl IntoResponse> {
    let result = state
        .service
        .distribute(&req.kind, req.key.as_deref(), &req.value, req.options)
        .await?;
    Ok((StatusCode::CREATED, Json(result)))
}

async fn read_handler(
    State(state): State<ApiState>,
    Path((kind, key)): Path<(String, String)>,
    Query(query): Query<ReadQuery>,
) -> ApiResult<impl IntoResponse> {
    let result = state.service.get(&kind, &key, query.coordinate()).await?;
    Ok(Json(result))
}

async fn topology_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.service.topology_view())
}

async fn metrics_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let snapshot = state.service.metrics();
    Json(snapshot.as_ref().clone())
}

async fn routes_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let routes = state
        .service
        .topology()
        .routing_table(&id)
        .ok_or_else(|| FabricError::InvalidInput(format!("unknown edge {}", id)))?;
    Ok(Json(RoutesResponse {
        edge_id: id,
        routes: routes.to_vec(),
    }))
}

async fn edge_status_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<StatusRequest>,
) -> ApiResult<impl IntoResponse> {
    let previous = state.service.set_edge_status(&id, req.status)?;
    Ok(Json(StatusResponse {
        id,
        previous,
        status: req.status,
    }))
}

async fn region_status_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<StatusRequest>,
) -> ApiResult<impl IntoResponse> {
    let previous = state.service.set_region_status(&id, req.status)?;
    Ok(Json(StatusResponse {
        id,
        previous,
        status: req.status,
    }))
}

/// `GET /api/v1/stream/:edge_id/:kind`
///
/// The channel is opened before the upgrade so a bad edge or kind is
/// reported as a plain HTTP error.
async fn stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
    Path((edge_id, kind)): Path<(String, String)>,
) -> ApiResult<Response> {
    let (sink, rx) = ChannelSink::bounded(state.service.settings().stream_buffer_capacity);
    let channel_id = state.service.subscribe(&edge_id, &kind, Arc::new(sink))?;

    Ok(ws
        .on_upgrade(move |socket| async move {
            let _session = state.shutdown.session_guard();
            handle_stream(socket, &state, rx).await;
            state.service.unsubscribe(channel_id);
            tracing::debug!(edge = %edge_id, channel = %channel_id, "stream closed");
        })
        .into_response())
}

async fn handle_stream(
    mut socket: WebSocket,
    state: &ApiState,
    mut rx: tokio::sync::mpsc::Receiver<StreamRecord>,
) {
    loop {
        tokio::select! {
            record = rx.recv() => {
                // Sender dropped: the channel was removed from its edge
                let Some(record) = record else { return };
                let Some(json) = encode_frame(state, record) else { continue };
                if socket.send(Message::Text(json)).await.is_err() {
                    tracing::debug!("stream client disconnected (send failed)");
                    return;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::debug!("stream socket error: {}", e);
                        return;
                    }
                    _ => {}
                }
            }
            _ = state.shutdown.wait() => {
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
        }
    }
}

fn encode_frame(state: &ApiState, record: StreamRecord) -> Option<String> {
    let value = match state.service.codecs().decode(record.codec, &record.payload) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(edge = %record.edge_id, key = %record.key, "undecodable push: {}", e);
            return None;
        }
    };
    let frame = StreamFrame {
        edge_id: record.edge_id,
        kind: record.kind,
        key: record.key,
        codec: record.codec,
        write_time_ms: record.write_time_ms,
        value,
    };
    match serde_json::to_string(&frame) {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::warn!("failed to serialize stream frame: {}", e);
            None
        }
    }
}
