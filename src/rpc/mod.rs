//! Request/response contract between the gateway and the movies service.
//!
//! JSON over HTTP. Every call is a `POST` to `/rpc/<method>` with a JSON
//! body; failures come back as a non-2xx status with an [`RpcErrorBody`].
//!
//! | Method          | Request               | Response      |
//! |-----------------|-----------------------|---------------|
//! | `movies.get`    | [`GetMovieRequest`]   | `Movie`       |
//! | `movies.list`   | `ListMovies`          | [`MovieList`] |
//! | `movies.create` | [`CreateMovieRequest`]| `Movie`       |
//! | `movies.delete` | [`DeleteMovieRequest`]| [`Empty`]     |

pub mod client;
pub mod server;

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::movies::{Movie, ServiceError};

pub use client::MovieServiceClient;
pub use server::rpc_router;

pub const GET_MOVIE: &str = "/rpc/movies.get";
pub const LIST_MOVIES: &str = "/rpc/movies.list";
pub const CREATE_MOVIE: &str = "/rpc/movies.create";
pub const DELETE_MOVIE: &str = "/rpc/movies.delete";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetMovieRequest {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMovieRequest {
    pub title: String,
    pub year: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteMovieRequest {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MovieList {
    pub movies: Vec<Movie>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Empty {}

/// Status codes carried in error bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcCode {
    NotFound,
    InvalidArgument,
    Unavailable,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub code: RpcCode,
    pub message: String,
}

impl RpcErrorBody {
    pub fn from_error(error: &ServiceError) -> (StatusCode, Self) {
        let (status, code) = match error {
            ServiceError::NotFound(_) => (StatusCode::NOT_FOUND, RpcCode::NotFound),
            ServiceError::InvalidId(_) | ServiceError::InvalidArgument(_) => {
                (StatusCode::BAD_REQUEST, RpcCode::InvalidArgument)
            }
            ServiceError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, RpcCode::Unavailable),
            ServiceError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, RpcCode::Internal),
        };
        (
            status,
            Self {
                code,
                message: error.to_string(),
            },
        )
    }

    pub fn into_service_error(self) -> ServiceError {
        match self.code {
            RpcCode::NotFound => ServiceError::NotFound(self.message),
            RpcCode::InvalidArgument => ServiceError::InvalidArgument(self.message),
            RpcCode::Unavailable => ServiceError::Unavailable(self.message),
            RpcCode::Internal => ServiceError::Storage(self.message),
        }
    }
}
