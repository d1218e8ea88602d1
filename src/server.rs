use crate::errors::{AppError, AppResult};
use crate::models::{QueryRequest, QueryResponse, StreamEvent};
use crate::runner::RunnerCore;
use crate::settings::Settings;
use crate::{streaming, voice};
use axum::extract::State;
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

const STREAM_CHANNEL_CAPACITY: usize = 64;
const AGENT_FAILURE_DETAIL: &str = "Agent processing failed";

#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<RunnerCore>,
    pub settings: Arc<Settings>,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(runner: Arc<RunnerCore>, settings: Arc<Settings>) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|error| AppError::Config(format!("failed to build HTTP client: {}", error)))?;
        Ok(Self {
            runner,
            settings,
            http,
        })
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "detail": self.detail() }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.settings.cors_allow_origins);
    Router::new()
        .route("/health", get(health))
        .route("/api/query", post(query))
        .route("/api/query/stream", post(query_stream))
        .route("/api/voice/tts", post(voice::tts))
        .route("/api/voice/stt", get(voice::stt))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|origin| origin == "*") {
        return layer.allow_origin(Any);
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn query(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    state
        .runner
        .process_query(request)
        .await
        .map(Json)
        .map_err(|error| match error {
            AppError::Upstream(_) => AppError::Upstream(AGENT_FAILURE_DETAIL.to_string()),
            other => other,
        })
}

async fn query_stream(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> impl IntoResponse {
    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
    tokio::spawn(streaming::drive(Arc::clone(&state.runner), request, tx));

    let events = ReceiverStream::new(rx).map(|event| Ok::<_, Infallible>(to_sse(&event)));
    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(events).keep_alive(KeepAlive::default()),
    )
}

fn to_sse(event: &StreamEvent) -> Event {
    Event::default()
        .event(event.name())
        .data(event.payload().to_string())
}
