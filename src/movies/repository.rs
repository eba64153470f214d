//! Catalog persistence.
//!
//! IDs are 24 lowercase hex characters: an 8-digit creation second followed
//! by 16 random digits. Anything else is rejected with
//! [`ServiceError::InvalidId`] before the store is consulted.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ListMovies, Movie, NewMovie, ServiceError};

const ID_LEN: usize = 24;

#[async_trait]
pub trait MovieRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<Movie, ServiceError>;
    async fn list(&self, query: &ListMovies) -> Result<Vec<Movie>, ServiceError>;
    async fn insert(&self, movie: NewMovie) -> Result<Movie, ServiceError>;
    async fn insert_many(&self, movies: Vec<NewMovie>) -> Result<usize, ServiceError>;
    async fn delete(&self, id: &str) -> Result<(), ServiceError>;
    async fn count(&self) -> Result<u64, ServiceError>;
}

/// Normalize and validate a movie id.
pub fn parse_id(id: &str) -> Result<String, ServiceError> {
    if id.len() != ID_LEN || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ServiceError::InvalidId(id.to_string()));
    }
    Ok(id.to_ascii_lowercase())
}

fn new_id() -> String {
    let seconds = Utc::now().timestamp() as u32;
    let random = Uuid::new_v4().simple().to_string();
    format!("{:08x}{}", seconds, &random[..ID_LEN - 8])
}

#[derive(Default)]
struct Store {
    /// Insertion sequence -> movie, so listings keep a stable order
    rows: BTreeMap<u64, Movie>,
    index: HashMap<String, u64>,
    next_seq: u64,
}

impl Store {
    fn insert(&mut self, movie: NewMovie) -> Movie {
        let mut id = new_id();
        while self.index.contains_key(&id) {
            id = new_id();
        }

        let movie = Movie {
            id: id.clone(),
            title: movie.title,
            year: movie.year,
        };
        let seq = self.next_seq;
        self.next_seq += 1;
        self.rows.insert(seq, movie.clone());
        self.index.insert(id, seq);
        movie
    }
}

/// Process-local repository.
#[derive(Default)]
pub struct InMemoryMovieRepository {
    store: RwLock<Store>,
}

impl InMemoryMovieRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MovieRepository for InMemoryMovieRepository {
    async fn get(&self, id: &str) -> Result<Movie, ServiceError> {
        let id = parse_id(id)?;
        let store = self.store.read().await;
        store
            .index
            .get(&id)
            .and_then(|seq| store.rows.get(seq))
            .cloned()
            .ok_or(ServiceError::NotFound(id))
    }

    async fn list(&self, query: &ListMovies) -> Result<Vec<Movie>, ServiceError> {
        let store = self.store.read().await;
        Ok(store
            .rows
            .values()
            .filter(|movie| query.matches(movie))
            .skip(query.offset as usize)
            .take(query.effective_limit())
            .cloned()
            .collect())
    }

    async fn insert(&self, movie: NewMovie) -> Result<Movie, ServiceError> {
        Ok(self.store.write().await.insert(movie))
    }

    async fn insert_many(&self, movies: Vec<NewMovie>) -> Result<usize, ServiceError> {
        let mut store = self.store.write().await;
        let count = movies.len();
        for movie in movies {
            store.insert(movie);
        }
        Ok(count)
    }

    async fn delete(&self, id: &str) -> Result<(), ServiceError> {
        let id = parse_id(id)?;
        let mut store = self.store.write().await;
        match store.index.remove(&id) {
            Some(seq) => {
                store.rows.remove(&seq);
                Ok(())
            }
            None => Err(ServiceError::NotFound(id)),
        }
    }

    async fn count(&self) -> Result<u64, ServiceError> {
        Ok(self.store.read().await.rows.len() as u64)
    }
}
