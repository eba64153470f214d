//! Gateway side of the movies service RPC.
//!
//! The gateway only reads through this client. Writes reach the movies
//! service through the queue.

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use super::{GetMovieRequest, MovieList, RpcErrorBody, GET_MOVIE, LIST_MOVIES};
use crate::movies::{ListMovies, Movie, MovieReader, ServiceError};

#[derive(Clone)]
pub struct MovieServiceClient {
    http: Client,
    base_url: String,
}

impl MovieServiceClient {
    /// Every call is bounded by `timeout`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn call<Req, Resp>(&self, method: &str, request: &Req) -> Result<Resp, ServiceError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, method);
        debug!(url = %url, "RPC call");

        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| ServiceError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<Resp>()
                .await
                .map_err(|e| ServiceError::Storage(format!("malformed RPC response: {e}")));
        }

        match response.json::<RpcErrorBody>().await {
            Ok(body) => Err(body.into_service_error()),
            Err(_) => Err(ServiceError::Unavailable(format!(
                "movies service returned {status}"
            ))),
        }
    }
}

#[async_trait]
impl MovieReader for MovieServiceClient {
    async fn get_movie(&self, id: &str) -> Result<Movie, ServiceError> {
        self.call(GET_MOVIE, &GetMovieRequest { id: id.to_string() })
            .await
    }

    async fn list_movies(&self, query: &ListMovies) -> Result<Vec<Movie>, ServiceError> {
        let list: MovieList = self.call(LIST_MOVIES, query).await?;
        Ok(list.movies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ConsumerState;
    use crate::rpc::{CreateMovieRequest, DeleteMovieRequest, Empty, CREATE_MOVIE, DELETE_MOVIE};
    use crate::movies::{InMemoryMovieRepository, MovieService};
    use crate::rpc::rpc_router;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::sync::watch;

    async fn create(client: &MovieServiceClient, title: &str, year: i32) -> Result<Movie, ServiceError> {
        let request = CreateMovieRequest {
            title: title.to_string(),
            year,
        };
        client.call(CREATE_MOVIE, &request).await
    }

    async fn delete(client: &MovieServiceClient, id: &str) -> Result<Empty, ServiceError> {
        client
            .call(DELETE_MOVIE, &DeleteMovieRequest { id: id.to_string() })
            .await
    }

    async fn serve() -> (MovieServiceClient, watch::Sender<ConsumerState>) {
        let service = MovieService::new(Arc::new(InMemoryMovieRepository::new()));
        let (state_tx, state_rx) = ConsumerState::channel();
        let app = rpc_router(service, state_rx);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client =
            MovieServiceClient::new(&format!("http://{addr}/"), Duration::from_secs(5)).unwrap();
        (client, state_tx)
    }

    #[tokio::test]
    async fn test_round_trip_over_http() {
        let (client, _state) = serve().await;

        let created = create(&client, "Heat", 1995).await.unwrap();
        assert_eq!(client.get_movie(&created.id).await.unwrap(), created);

        let listed = client
            .list_movies(&ListMovies {
                year: Some(1995),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(listed, vec![created.clone()]);

        delete(&client, &created.id).await.unwrap();
        assert!(matches!(
            client.get_movie(&created.id).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_errors_keep_their_kind() {
        let (client, _state) = serve().await;

        assert!(matches!(
            client.get_movie("not-an-id").await,
            Err(ServiceError::InvalidArgument(_))
        ));
        assert!(matches!(
            delete(&client, "65a1f0c2e4b0a1b2c3d4e5f6").await,
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            create(&client, "  ", 2000).await,
            Err(ServiceError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_health_follows_consumer_state() {
        let (client, state) = serve().await;
        let url = format!("{}/health", client.base_url());

        let response = reqwest::get(&url).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);

        state.send_replace(ConsumerState::Consuming);
        let response = reqwest::get(&url).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["consumer"], "consuming");
    }

    #[tokio::test]
    async fn test_unreachable_backend() {
        let client =
            MovieServiceClient::new("http://127.0.0.1:1", Duration::from_secs(1)).unwrap();
        assert!(matches!(
            client.get_movie("65a1f0c2e4b0a1b2c3d4e5f6").await,
            Err(ServiceError::Unavailable(_))
        ));
    }
}
