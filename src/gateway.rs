//! Public REST API.
//!
//! Reads are proxied synchronously to the movies service. Writes are turned
//! into envelopes and published; the client gets `202 Accepted` as soon as
//! the broker confirms, before the write has been applied.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::broker::{EventPublisher, PublishError};
use crate::event::MovieCommand;
use crate::movies::{ListMovies, Movie, MovieReader, ServiceError};

pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Gateway counters.
pub struct Metrics {
    creates_accepted: AtomicU64,
    deletes_accepted: AtomicU64,
    publish_failures: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            creates_accepted: AtomicU64::new(0),
            deletes_accepted: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct AppState {
    publisher: Arc<dyn EventPublisher>,
    movies: Arc<dyn MovieReader>,
    metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(publisher: Arc<dyn EventPublisher>, movies: Arc<dyn MovieReader>) -> Self {
        Self {
            publisher,
            movies,
            metrics: Arc::new(Metrics::new()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("failed to enqueue request: {0}")]
    Publish(#[from] PublishError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Service(ServiceError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Service(ServiceError::InvalidId(_) | ServiceError::InvalidArgument(_)) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Service(_) | ApiError::Publish(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = match &self {
            ApiError::Publish(e) => {
                error!(error = %e, "Publish failed");
                "failed to enqueue request".to_string()
            }
            ApiError::Service(e) if status.is_server_error() => {
                error!(error = %e, "Movies service call failed");
                e.to_string()
            }
            other => other.to_string(),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Body of `POST /movies`.
#[derive(Debug, Deserialize)]
pub struct CreateMovieBody {
    pub title: Option<String>,
    pub year: Option<i32>,
}

/// Query string of `GET /movies`.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub title: Option<String>,
    pub year: Option<i32>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl From<ListQuery> for ListMovies {
    fn from(query: ListQuery) -> Self {
        ListMovies {
            title: query.title.filter(|t| !t.trim().is_empty()),
            year: query.year,
            limit: query.limit.unwrap_or(0),
            offset: query.offset.unwrap_or(0),
        }
    }
}

/// Response for an accepted write.
#[derive(Debug, Serialize, Deserialize)]
pub struct AcceptedResponse {
    pub status: String,
    #[serde(rename = "correlationId")]
    pub correlation_id: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .route("/movies", get(list_movies).post(create_movie))
        .route("/movies/:id", get(get_movie).delete(delete_movie))
        .with_state(state)
}

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

/// Ready only while the broker connection is up.
async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    if state.publisher.is_connected() {
        (
            StatusCode::OK,
            Json(json!({ "status": "ok", "broker": "connected" })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable", "broker": "disconnected" })),
        )
    }
}

async fn get_metrics(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.metrics.uptime_seconds();

    let uptime_str = if uptime < 60 {
        format!("{}s", uptime)
    } else if uptime < 3600 {
        format!("{}m {}s", uptime / 60, uptime % 60)
    } else {
        format!("{}h {}m {}s", uptime / 3600, (uptime % 3600) / 60, uptime % 60)
    };

    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": uptime,
        "uptime": uptime_str,
        "writes": {
            "creates_accepted": state.metrics.creates_accepted.load(Ordering::Relaxed),
            "deletes_accepted": state.metrics.deletes_accepted.load(Ordering::Relaxed),
            "publish_failures": state.metrics.publish_failures.load(Ordering::Relaxed),
        },
        "status": "running"
    }))
}

async fn list_movies(
    State(state): State<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Vec<Movie>>, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::Validation(e.body_text()))?;
    let query = ListMovies::from(query);
    Ok(Json(state.movies.list_movies(&query).await?))
}

async fn get_movie(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Movie>, ApiError> {
    Ok(Json(state.movies.get_movie(&id).await?))
}

async fn create_movie(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<CreateMovieBody>, JsonRejection>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let Json(body) = body.map_err(|e| ApiError::Validation(e.body_text()))?;

    let title = body
        .title
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::Validation("title is required".to_string()))?;
    let year = body
        .year
        .ok_or_else(|| ApiError::Validation("year is required".to_string()))?;

    let correlation_id = correlation_id(&headers);
    let command = MovieCommand::create(title, year);
    debug!(correlation_id = %correlation_id, command = ?command, "Publishing create");

    if let Err(e) = state
        .publisher
        .publish_command(&command, Some(&correlation_id))
        .await
    {
        state.metrics.publish_failures.fetch_add(1, Ordering::Relaxed);
        return Err(e.into());
    }
    state.metrics.creates_accepted.fetch_add(1, Ordering::Relaxed);

    info!(
        correlation_id = %correlation_id,
        title = %title,
        year = year,
        "Create accepted"
    );
    Ok(accepted(correlation_id))
}

async fn delete_movie(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let correlation_id = correlation_id(&headers);

    if let Err(e) = state
        .publisher
        .publish_command(&MovieCommand::delete(id.as_str()), Some(&correlation_id))
        .await
    {
        state.metrics.publish_failures.fetch_add(1, Ordering::Relaxed);
        return Err(e.into());
    }
    state.metrics.deletes_accepted.fetch_add(1, Ordering::Relaxed);

    info!(correlation_id = %correlation_id, id = %id, "Delete accepted");
    Ok(accepted(correlation_id))
}

fn accepted(correlation_id: String) -> (StatusCode, Json<AcceptedResponse>) {
    (
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            status: "accepted".to_string(),
            correlation_id,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_id_from_header() {
        let mut headers = HeaderMap::new();
        headers.insert(CORRELATION_HEADER, "req-123".parse().unwrap());
        assert_eq!(correlation_id(&headers), "req-123");
    }

    #[test]
    fn test_correlation_id_generated() {
        let mut headers = HeaderMap::new();
        headers.insert(CORRELATION_HEADER, "  ".parse().unwrap());
        let id = correlation_id(&headers);
        assert!(uuid::Uuid::parse_str(&id).is_ok());
    }

    #[test]
    fn test_list_query_conversion() {
        let query = ListMovies::from(ListQuery {
            title: Some(" ".to_string()),
            year: Some(1979),
            limit: None,
            offset: Some(20),
        });
        assert_eq!(query.title, None);
        assert_eq!(query.year, Some(1979));
        assert_eq!(query.effective_limit(), 20);
        assert_eq!(query.offset, 20);
    }
}
