//! HTTP server.
//!
//! Serves the ask pipeline as a server-sent event stream, plus read access
//! to the configured resources and stored threads.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/resources` | Configured resources |
//! | `GET`  | `/threads` | Thread summaries, newest first |
//! | `GET`  | `/threads/{id}` | One thread with its questions |
//! | `DELETE` | `/threads/{id}` | Delete a thread |
//! | `POST` | `/question/stream` | Ask a question; `text/event-stream` response |
//!
//! # Error Contract
//!
//! Errors raised before the stream starts are JSON:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "resource not configured: react" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `agent_error` (502),
//! `internal` (500). Once the stream has started, failures arrive as an
//! `error` event instead.
//!
//! Closing the connection mid-stream cancels the question: the agent session
//! is aborted and the question is recorded as canceled.

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::ask::{AskRequest, Asker};
use crate::collection::CollectionAssembler;
use crate::config::Config;
use crate::error::AskError;
use crate::models::{Thread, ThreadSummary};
use crate::opencode::OpenCodeBackend;
use crate::sse::{encode_frame, WireEvent};
use crate::threads::ThreadStore;
use crate::{db, migrate};

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    asker: Arc<Asker>,
}

/// Starts the server on `[server].bind` with the `opencode` agent backend.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    migrate::migrate(&pool).await?;

    let backend = OpenCodeBackend::new(config.agent.clone())?;
    let asker = Asker::new(
        config.agent.clone(),
        Arc::new(CollectionAssembler::from_config(config)),
        Arc::new(backend),
        ThreadStore::new(pool),
    );

    let app = router(Arc::new(config.clone()), Arc::new(asker));
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "server listening");
    eprintln!("Listening on http://{}", config.server.bind);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Builds the application router around an existing pipeline.
pub fn router(config: Arc<Config>, asker: Arc<Asker>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/resources", get(handle_resources))
        .route("/threads", get(handle_list_threads))
        .route(
            "/threads/{id}",
            get(handle_get_thread).delete(handle_delete_thread),
        )
        .route("/question/stream", post(handle_question_stream))
        .layer(cors)
        .with_state(AppState { config, asker })
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

fn agent_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_GATEWAY,
        code: "agent_error",
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

impl From<AskError> for AppError {
    fn from(err: AskError) -> Self {
        let message = err.to_string();
        if err.is_caller_error() {
            return bad_request(message);
        }
        match err {
            AskError::ThreadNotFound(_) => not_found(message),
            AskError::Agent(_) => agent_error(message),
            _ => internal(message),
        }
    }
}

// ============ GET /health ============

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

// ============ GET /resources ============

#[derive(Serialize)]
struct ResourceInfo {
    name: String,
    #[serde(rename = "type")]
    kind: &'static str,
    origin: String,
    notes: String,
}

async fn handle_resources(State(state): State<AppState>) -> Json<Vec<ResourceInfo>> {
    Json(
        state
            .config
            .resources
            .iter()
            .map(|r| ResourceInfo {
                name: r.name().to_string(),
                kind: r.kind(),
                origin: r.origin(),
                notes: r.notes().to_string(),
            })
            .collect(),
    )
}

// ============ /threads ============

async fn handle_list_threads(
    State(state): State<AppState>,
) -> Result<Json<Vec<ThreadSummary>>, AppError> {
    let threads = state
        .asker
        .store()
        .list_threads()
        .await
        .map_err(|e| internal(format!("{:#}", e)))?;
    Ok(Json(threads))
}

async fn handle_get_thread(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Thread>, AppError> {
    state
        .asker
        .store()
        .get_thread(&id)
        .await
        .map_err(|e| internal(format!("{:#}", e)))?
        .map(Json)
        .ok_or_else(|| not_found(format!("thread not found: {}", id)))
}

async fn handle_delete_thread(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let deleted = state
        .asker
        .store()
        .delete_thread(&id)
        .await
        .map_err(|e| internal(format!("{:#}", e)))?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(format!("thread not found: {}", id)))
    }
}

// ============ POST /question/stream ============

/// Runs the pipeline in its own task and relays its events as SSE frames.
///
/// The response is only committed once the pipeline has emitted `meta`;
/// anything that fails earlier is answered with a JSON error instead.
async fn handle_question_stream(
    State(state): State<AppState>,
    body: Result<Json<AskRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(request) = body.map_err(|e| bad_request(e.body_text()))?;

    let (tx, mut rx) = mpsc::unbounded_channel::<WireEvent>();
    let cancel = CancellationToken::new();
    let asker = state.asker.clone();
    let task = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            asker
                .ask(request, cancel, move |event| {
                    // a closed receiver means the client is gone and cancel has fired
                    let _ = tx.send(event);
                })
                .await
        }
    });

    // dropping the guard, with this handler or with the response body,
    // cancels the question
    let guard = cancel.drop_guard();

    let Some(first) = rx.recv().await else {
        return match task.await {
            Ok(Err(err)) => Err(err.into()),
            Ok(Ok(_)) => Err(internal("pipeline finished without events")),
            Err(err) => Err(internal(err.to_string())),
        };
    };

    tokio::spawn(async move {
        match task.await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => tracing::warn!(error = %err, "question ended with an error"),
            Err(err) => tracing::error!(error = %err, "question task panicked"),
        }
    });

    let stream = async_stream::stream! {
        let _guard = guard;
        let mut next = Some(first);
        while let Some(event) = next.take() {
            match encode_frame(&event) {
                Ok(frame) => {
                    yield Ok::<_, Infallible>(frame);
                }
                Err(err) => tracing::warn!(error = %err, "failed to encode event"),
            }
            next = rx.recv().await;
        }
    };

    Ok((
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}
