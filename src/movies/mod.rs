//! Movie catalog domain: entity, service and the read/write ports.
//!
//! The worker only sees the [`MovieWriter`] port, the gateway only sees
//! [`MovieReader`]. [`MovieService`] implements both on top of a
//! [`MovieRepository`].

pub mod repository;
pub mod seed;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

pub use repository::{InMemoryMovieRepository, MovieRepository};

/// Page size used when the caller does not ask for one.
pub const DEFAULT_LIST_LIMIT: u32 = 20;

/// A catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Movie {
    pub id: String,
    pub title: String,
    pub year: i32,
}

/// A movie that has not been stored yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMovie {
    pub title: String,
    pub year: i32,
}

/// Filters and paging for catalog listings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListMovies {
    /// Case-insensitive substring match on the title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Exact release year
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,

    /// Page size; zero means [`DEFAULT_LIST_LIMIT`]
    #[serde(default)]
    pub limit: u32,

    #[serde(default)]
    pub offset: u32,
}

impl ListMovies {
    pub fn effective_limit(&self) -> usize {
        if self.limit == 0 {
            DEFAULT_LIST_LIMIT as usize
        } else {
            self.limit as usize
        }
    }

    pub fn matches(&self, movie: &Movie) -> bool {
        if let Some(year) = self.year {
            if movie.year != year {
                return false;
            }
        }
        match self.title.as_deref().map(str::trim) {
            Some(needle) if !needle.is_empty() => movie
                .title
                .to_lowercase()
                .contains(&needle.to_lowercase()),
            _ => true,
        }
    }
}

/// Errors surfaced by the catalog.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("movie not found: {0}")]
    NotFound(String),

    #[error("invalid movie id: {0}")]
    InvalidId(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("storage error: {0}")]
    Storage(String),

    /// The backend could not be reached (RPC transport failure)
    #[error("movie service unavailable: {0}")]
    Unavailable(String),
}

impl ServiceError {
    /// Whether retrying the same request can never succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ServiceError::NotFound(_) | ServiceError::InvalidId(_) | ServiceError::InvalidArgument(_)
        )
    }
}

/// Mutations applied by the queue worker.
#[async_trait]
pub trait MovieWriter: Send + Sync {
    async fn create_movie(&self, title: &str, year: i32) -> Result<Movie, ServiceError>;

    /// Fails with [`ServiceError::NotFound`] when the id does not exist.
    async fn delete_movie(&self, id: &str) -> Result<(), ServiceError>;
}

/// Synchronous reads used by the gateway.
#[async_trait]
pub trait MovieReader: Send + Sync {
    async fn get_movie(&self, id: &str) -> Result<Movie, ServiceError>;
    async fn list_movies(&self, query: &ListMovies) -> Result<Vec<Movie>, ServiceError>;
}

/// Catalog service backed by a repository.
#[derive(Clone)]
pub struct MovieService {
    repo: Arc<dyn MovieRepository>,
}

impl MovieService {
    pub fn new(repo: Arc<dyn MovieRepository>) -> Self {
        Self { repo }
    }

    pub fn repository(&self) -> &Arc<dyn MovieRepository> {
        &self.repo
    }
}

#[async_trait]
impl MovieWriter for MovieService {
    async fn create_movie(&self, title: &str, year: i32) -> Result<Movie, ServiceError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ServiceError::InvalidArgument(
                "title must not be empty".to_string(),
            ));
        }

        let movie = self
            .repo
            .insert(NewMovie {
                title: title.to_string(),
                year,
            })
            .await?;

        info!(id = %movie.id, title = %movie.title, year = movie.year, "Movie created");
        Ok(movie)
    }

    async fn delete_movie(&self, id: &str) -> Result<(), ServiceError> {
        if id.is_empty() {
            return Err(ServiceError::InvalidArgument(
                "movie id must not be empty".to_string(),
            ));
        }

        self.repo.delete(id).await?;
        info!(id = %id, "Movie deleted");
        Ok(())
    }
}

#[async_trait]
impl MovieReader for MovieService {
    async fn get_movie(&self, id: &str) -> Result<Movie, ServiceError> {
        if id.is_empty() {
            return Err(ServiceError::InvalidArgument(
                "movie id must not be empty".to_string(),
            ));
        }
        self.repo.get(id).await
    }

    async fn list_movies(&self, query: &ListMovies) -> Result<Vec<Movie>, ServiceError> {
        let movies = self.repo.list(query).await?;
        debug!(count = movies.len(), query = ?query, "Listed movies");
        Ok(movies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> MovieService {
        MovieService::new(Arc::new(InMemoryMovieRepository::new()))
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let service = service();
        let created = service.create_movie("  Interestelar ", 2014).await.unwrap();

        assert_eq!(created.title, "Interestelar");
        let fetched = service.get_movie(&created.id).await.unwrap();
        assert_eq!(fetched, created);
    }

    #[tokio::test]
    async fn test_create_rejects_empty_title() {
        let err = service().create_movie(" ", 2000).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArgument(_)));
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn test_delete_missing_movie() {
        let service = service();
        let err = service
            .delete_movie("65a1f0c2e4b0a1b2c3d4e5f6")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_then_get() {
        let service = service();
        let created = service.create_movie("Alien", 1979).await.unwrap();

        service.delete_movie(&created.id).await.unwrap();
        assert!(matches!(
            service.get_movie(&created.id).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_filters() {
        let service = service();
        service.create_movie("Alien", 1979).await.unwrap();
        service.create_movie("Aliens", 1986).await.unwrap();
        service.create_movie("Heat", 1995).await.unwrap();

        let by_title = service
            .list_movies(&ListMovies {
                title: Some("ALIEN".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_title.len(), 2);

        let by_year = service
            .list_movies(&ListMovies {
                year: Some(1995),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_year.len(), 1);
        assert_eq!(by_year[0].title, "Heat");
    }

    #[test]
    fn test_effective_limit() {
        assert_eq!(ListMovies::default().effective_limit(), 20);
        let query = ListMovies {
            limit: 5,
            ..Default::default()
        };
        assert_eq!(query.effective_limit(), 5);
    }

    #[test]
    fn test_transient_errors() {
        assert!(!ServiceError::Storage("disk".to_string()).is_permanent());
        assert!(!ServiceError::Unavailable("refused".to_string()).is_permanent());
    }
}
