//! Movies service RPC endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::sync::watch;
use tracing::warn;

use super::{
    CreateMovieRequest, DeleteMovieRequest, Empty, GetMovieRequest, MovieList, RpcErrorBody,
    CREATE_MOVIE, DELETE_MOVIE, GET_MOVIE, LIST_MOVIES,
};
use crate::broker::ConsumerState;
use crate::movies::{ListMovies, Movie, MovieReader, MovieService, MovieWriter, ServiceError};

#[derive(Clone)]
struct RpcState {
    service: MovieService,
    consumer: watch::Receiver<ConsumerState>,
}

struct RpcError(ServiceError);

impl From<ServiceError> for RpcError {
    fn from(error: ServiceError) -> Self {
        Self(error)
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let (status, body) = RpcErrorBody::from_error(&self.0);
        if status.is_server_error() {
            warn!(error = %self.0, "RPC call failed");
        }
        (status, Json(body)).into_response()
    }
}

/// Router for the RPC surface plus `/health`.
///
/// Health reports the queue consumer: anything but `consuming` is a 503.
pub fn rpc_router(service: MovieService, consumer: watch::Receiver<ConsumerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(GET_MOVIE, post(get_movie))
        .route(LIST_MOVIES, post(list_movies))
        .route(CREATE_MOVIE, post(create_movie))
        .route(DELETE_MOVIE, post(delete_movie))
        .with_state(RpcState { service, consumer })
}

async fn health(State(state): State<RpcState>) -> impl IntoResponse {
    let consumer = *state.consumer.borrow();
    let status = if consumer == ConsumerState::Consuming {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if status == StatusCode::OK { "ok" } else { "unavailable" },
            "consumer": consumer,
        })),
    )
}

async fn get_movie(
    State(state): State<RpcState>,
    Json(req): Json<GetMovieRequest>,
) -> Result<Json<Movie>, RpcError> {
    Ok(Json(state.service.get_movie(&req.id).await?))
}

async fn list_movies(
    State(state): State<RpcState>,
    Json(query): Json<ListMovies>,
) -> Result<Json<MovieList>, RpcError> {
    let movies = state.service.list_movies(&query).await?;
    Ok(Json(MovieList { movies }))
}

async fn create_movie(
    State(state): State<RpcState>,
    Json(req): Json<CreateMovieRequest>,
) -> Result<Json<Movie>, RpcError> {
    Ok(Json(state.service.create_movie(&req.title, req.year).await?))
}

async fn delete_movie(
    State(state): State<RpcState>,
    Json(req): Json<DeleteMovieRequest>,
) -> Result<Json<Empty>, RpcError> {
    state.service.delete_movie(&req.id).await?;
    Ok(Json(Empty {}))
}
