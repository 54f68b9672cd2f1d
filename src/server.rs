//! Push-mode HTTP server.
//!
//! Models the two serverless invocations as HTTP endpoints so a notification
//! source or queue trigger can push work instead of a worker polling for it.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/notifications` | Run the ingest notifier on an S3 event notification |
//! | `POST` | `/deliveries` | Run the processor on an SQS-style batch |
//! | `GET`  | `/records/{id}` | Fetch one stored index record |
//! | `GET`  | `/stats` | In-process pipeline counters |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "malformed payload: ..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `unavailable` (503),
//! `internal` (500).
//!
//! # Partial batch responses
//!
//! `POST /deliveries` always answers 200 with
//! `{"batchItemFailures":[{"itemIdentifier":"<messageId>"}]}` listing only
//! the deliveries that should be retried. Succeeded and dead-lettered
//! messages are omitted so the queue deletes them; listed ones become
//! visible again once the queue's visibility timeout lapses.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use docrelay_core::error::PipelineError;
use docrelay_core::models::{Delivery, IndexRecord};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::get::get_record;
use crate::notifier::{IngestNotifier, NotifySummary};
use crate::pipeline::Pipeline;
use crate::processor::QueueProcessor;
use crate::stats::StatsSnapshot;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pipeline: Pipeline,
    notifier: Arc<IngestNotifier>,
    processor: Arc<QueueProcessor>,
}

impl AppState {
    pub fn new(pipeline: Pipeline, notifier: IngestNotifier, processor: QueueProcessor) -> Self {
        Self {
            pipeline,
            notifier: Arc::new(notifier),
            processor: Arc::new(processor),
        }
    }

    pub fn from_config(config: &Config, pipeline: Pipeline) -> anyhow::Result<Self> {
        let notifier = pipeline.notifier(config)?;
        let processor = pipeline.processor(config);
        Ok(Self::new(pipeline, notifier, processor))
    }
}

/// Build the router with CORS and request tracing applied.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/notifications", post(handle_notifications))
        .route("/deliveries", post(handle_deliveries))
        .route("/records/{id}", get(handle_get_record))
        .route("/stats", get(handle_stats))
        .route("/health", get(handle_health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Starts the server on `[server].bind` and runs until ctrl-c.
pub async fn run_server(config: &Config, pipeline: Pipeline) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let app = router(AppState::from_config(config, pipeline)?);

    println!("docrelay listening on http://{}", bind_addr);
    info!(bind = %bind_addr, "server started");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn unavailable(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::SERVICE_UNAVAILABLE,
        code: "unavailable",
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: message.into(),
    }
}

/// Malformed input is the caller's fault; anything retryable asks the
/// sender to try again later.
impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        if matches!(err, PipelineError::MalformedPayload(_)) {
            bad_request(err.to_string())
        } else if err.is_retryable() {
            unavailable(err.to_string())
        } else {
            internal(err.to_string())
        }
    }
}

// ============ POST /notifications ============

async fn handle_notifications(
    State(state): State<AppState>,
    body: String,
) -> Result<Json<NotifySummary>, AppError> {
    let summary = state.notifier.handle_notification(&body).await?;
    Ok(Json(summary))
}

// ============ POST /deliveries ============

/// SQS event batch as delivered to a queue-triggered function.
#[derive(Debug, Deserialize)]
struct SqsBatch {
    #[serde(rename = "Records")]
    records: Vec<SqsRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SqsRecord {
    message_id: String,
    #[serde(default)]
    receipt_handle: String,
    body: String,
    #[serde(default)]
    attributes: SqsAttributes,
}

#[derive(Debug, Default, Deserialize)]
struct SqsAttributes {
    #[serde(rename = "ApproximateReceiveCount")]
    approximate_receive_count: Option<String>,
}

impl SqsRecord {
    /// `None` when the attribute is missing or not a positive integer.
    fn receive_count(&self) -> Option<u32> {
        self.attributes
            .approximate_receive_count
            .as_deref()
            .and_then(|n| n.parse::<u32>().ok())
            .filter(|n| *n >= 1)
    }

    /// Without a receive count every delivery looks like the first, so the
    /// retry limit can never be reached for this record.
    fn into_delivery(self) -> Delivery {
        let receive_count = match self.receive_count() {
            Some(n) => n,
            None => {
                warn!(
                    message_id = %self.message_id,
                    attribute = ?self.attributes.approximate_receive_count,
                    "delivery has no usable ApproximateReceiveCount; treating it as attempt 1, \
                     so retries will not be capped"
                );
                1
            }
        };
        Delivery {
            message_id: self.message_id,
            receipt: self.receipt_handle,
            body: self.body,
            receive_count,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchResponse {
    batch_item_failures: Vec<BatchItemFailure>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchItemFailure {
    item_identifier: String,
}

async fn handle_deliveries(
    State(state): State<AppState>,
    body: String,
) -> Result<Json<BatchResponse>, AppError> {
    let batch: SqsBatch = serde_json::from_str(&body)
        .map_err(|e| bad_request(format!("invalid delivery batch: {}", e)))?;
    let deliveries: Vec<Delivery> = batch
        .records
        .into_iter()
        .map(SqsRecord::into_delivery)
        .collect();

    let report = state.processor.handle_batch(&deliveries).await;
    let failures = report
        .retry_ids()
        .into_iter()
        .map(|id| BatchItemFailure {
            item_identifier: id.to_string(),
        })
        .collect();

    Ok(Json(BatchResponse {
        batch_item_failures: failures,
    }))
}

// ============ GET /records/{id} ============

async fn handle_get_record(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<IndexRecord>, AppError> {
    match get_record(state.pipeline.index.as_ref(), &id).await {
        Ok(Some(record)) => Ok(Json(record)),
        Ok(None) => Err(not_found(format!("record not found: {}", id))),
        Err(e) => Err(unavailable(e.to_string())),
    }
}

// ============ GET /stats, GET /health ============

async fn handle_stats(State(state): State<AppState>) -> Json<StatsSnapshot> {
    Json(state.pipeline.stats.snapshot())
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
