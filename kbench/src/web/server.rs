use std::sync::Arc;

use anyhow::Context as _;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt as _;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

use kbench_core::engine::{
    ConsumeConfig, EngineError, JobEngine, JobStats, LoadtestConsumerConfig,
    LoadtestProducerConfig, MissingReport, ProduceConfig, SendConfig,
};
use kbench_core::{
    EventBroadcaster, EventSink, JobFilter, JobRecord, JobStatus, JobSummary, JobType,
    MemoryJobStore, TopicMetadata,
};
use kbench_testbroker::MemoryBroker;

use crate::cli::ServeArgs;

type Engine = JobEngine<MemoryBroker, MemoryJobStore>;

struct AppState {
    engine: Engine,
    broadcaster: EventBroadcaster,
}

pub async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let broker = if args.topics.is_empty() {
        MemoryBroker::with_topics(["benchmark"])
    } else {
        MemoryBroker::with_topics(args.topics.clone())
    };

    let broadcaster = EventBroadcaster::default();
    let events: Arc<dyn EventSink> = Arc::new(broadcaster.clone());
    let engine = JobEngine::new(
        Arc::new(broker),
        Arc::new(MemoryJobStore::new()),
        events,
        args.client_id,
    );

    let state = Arc::new(AppState {
        engine,
        broadcaster,
    });
    let app = router(state);

    let listener = TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    let addr = listener.local_addr().context("failed to resolve address")?;
    info!(%addr, "kbench listening");

    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
    });
    serve.await.context("server error")?;

    Ok(())
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/topics", get(list_topics))
        .route("/api/topics/{name}", get(describe_topic))
        .route("/api/produce/start", post(start_produce))
        .route("/api/produce/send", post(send_records))
        .route("/api/produce/stop/{id}", post(stop_job))
        .route("/api/consume/start", post(start_consume))
        .route("/api/consume/stop/{id}", post(stop_job))
        .route("/api/consume/{id}/missing-sequences", get(missing_sequences))
        .route("/api/loadtest/producer/start", post(start_loadtest_producer))
        .route("/api/loadtest/consumer/start", post(start_loadtest_consumer))
        .route("/api/loadtest/stop/{id}", post(stop_job))
        .route("/api/jobs/running", get(running_jobs))
        .route("/api/jobs/stats/summary", get(history_summary))
        .route("/api/jobs", get(history))
        .route("/api/jobs/{id}", get(history_record).delete(delete_history))
        .route("/api/jobs/{id}/stats", get(job_stats))
        .route("/api/jobs/{id}/logs", get(job_logs).delete(clear_logs))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::MissingTopic
            | EngineError::MissingGroupId
            | EngineError::InvalidCount => StatusCode::BAD_REQUEST,
            EngineError::Broker(_) => StatusCode::BAD_GATEWAY,
            EngineError::Store(_) | EngineError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

async fn list_topics(State(state): State<Arc<AppState>>) -> Result<Json<Vec<String>>, ApiError> {
    Ok(Json(state.engine.list_topics().await?))
}

async fn describe_topic(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<TopicMetadata>, ApiError> {
    Ok(Json(state.engine.describe_topic(&name).await?))
}

async fn start_produce(
    State(state): State<Arc<AppState>>,
    Json(config): Json<ProduceConfig>,
) -> Result<Json<JobRecord>, ApiError> {
    Ok(Json(state.engine.start_produce(config).await?))
}

async fn send_records(
    State(state): State<Arc<AppState>>,
    Json(config): Json<SendConfig>,
) -> Result<Json<JobRecord>, ApiError> {
    Ok(Json(state.engine.send_records(config).await?))
}

async fn start_consume(
    State(state): State<Arc<AppState>>,
    Json(config): Json<ConsumeConfig>,
) -> Result<Json<JobRecord>, ApiError> {
    Ok(Json(state.engine.start_consume(config).await?))
}

async fn start_loadtest_producer(
    State(state): State<Arc<AppState>>,
    Json(config): Json<LoadtestProducerConfig>,
) -> Result<Json<JobRecord>, ApiError> {
    Ok(Json(state.engine.start_loadtest_producer(config).await?))
}

async fn start_loadtest_consumer(
    State(state): State<Arc<AppState>>,
    Json(config): Json<LoadtestConsumerConfig>,
) -> Result<Json<JobRecord>, ApiError> {
    Ok(Json(state.engine.start_loadtest_consumer(config).await?))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StopResponse {
    stats: JobStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    persist_error: Option<String>,
}

async fn stop_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<StopResponse>, ApiError> {
    if let Some(outcome) = state.engine.stop(&id).await {
        return Ok(Json(StopResponse {
            stats: outcome.stats,
            persist_error: outcome.persist_error,
        }));
    }
    // Stop races with natural completion; an already-finished job answers
    // with its stored final stats instead of an error.
    match state.engine.history_record(&id).await? {
        Some(record) => Ok(Json(StopResponse {
            stats: record.stats,
            persist_error: None,
        })),
        None => Err(ApiError::not_found(format!("no job {id}"))),
    }
}

#[derive(Debug, Deserialize)]
struct MissingQuery {
    low: Option<u64>,
    high: Option<u64>,
}

async fn missing_sequences(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<MissingQuery>,
) -> Result<Json<MissingReport>, ApiError> {
    let bounds = match (query.low, query.high) {
        (Some(low), Some(high)) => Some((low, high)),
        _ => None,
    };
    match state.engine.missing_sequences(&id, bounds) {
        Some(report) => Ok(Json(report)),
        None => Err(ApiError::not_found(format!("no running job {id}"))),
    }
}

async fn running_jobs(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.engine.list_running())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryQuery {
    #[serde(rename = "type")]
    job_type: Option<JobType>,
    status: Option<JobStatus>,
    created_after: Option<u64>,
    created_before: Option<u64>,
    limit: Option<usize>,
}

async fn history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<JobRecord>>, ApiError> {
    let filter = JobFilter {
        job_type: query.job_type,
        status: query.status,
        created_after: query.created_after,
        created_before: query.created_before,
        limit: query.limit,
    };
    Ok(Json(state.engine.history(&filter).await?))
}

async fn history_summary(
    State(state): State<Arc<AppState>>,
) -> Result<Json<JobSummary>, ApiError> {
    Ok(Json(state.engine.history_summary().await?))
}

async fn history_record(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobRecord>, ApiError> {
    match state.engine.history_record(&id).await? {
        Some(record) => Ok(Json(record)),
        None => Err(ApiError::not_found(format!("no job {id}"))),
    }
}

async fn delete_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.engine.delete_history(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("no job {id}")))
    }
}

async fn job_stats(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobStats>, ApiError> {
    match state.engine.job_stats(&id).await? {
        Some(stats) => Ok(Json(stats)),
        None => Err(ApiError::not_found(format!("no job {id}"))),
    }
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    #[serde(default)]
    offset: usize,
    #[serde(default = "default_log_limit")]
    limit: usize,
}

fn default_log_limit() -> usize {
    100
}

async fn job_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Response, ApiError> {
    match state.engine.job_logs(&id, query.offset, query.limit) {
        Some(page) => Ok(Json(page).into_response()),
        None => Err(ApiError::not_found(format!("no running job {id}"))),
    }
}

async fn clear_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.engine.clear_logs(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("no running job {id}")))
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(mut socket: WebSocket, state: Arc<AppState>) {
    // New sessions start from the current set of running jobs; everything
    // after that arrives through the broadcast feed.
    let snapshot = serde_json::json!({
        "type": "running",
        "data": state.engine.list_running(),
    })
    .to_string();

    if socket.send(Message::Text(snapshot.into())).await.is_err() {
        return;
    }

    let mut rx = state.broadcaster.subscribe();

    loop {
        tokio::select! {
            recv = rx.recv() => {
                let Ok(text) = recv else {
                    break;
                };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.next() => {
                let Some(Ok(msg)) = incoming else {
                    break;
                };
                match msg {
                    Message::Close(_) => break,
                    Message::Ping(payload) => {
                        let _ = socket.send(Message::Pong(payload)).await;
                    }
                    _ => {}
                }
            }
        }
    }
}
