use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    http::{Method, Request, StatusCode},
};
use marquee::broker::consumer::{run_loop, ConsumerState, RedeliveryPolicy};
use marquee::broker::{InMemoryBroker, RoutingKeys};
use marquee::event::Envelope;
use marquee::gateway::{router, AppState};
use marquee::movies::{InMemoryMovieRepository, MovieRepository, MovieService};
use marquee::shutdown::ShutdownSignal;
use serde_json::{json, Value};
use tower::ServiceExt;

struct Harness {
    app: axum::Router,
    broker: InMemoryBroker,
    service: MovieService,
}

fn harness() -> Harness {
    let broker = InMemoryBroker::new(RoutingKeys::default());
    let service = MovieService::new(Arc::new(InMemoryMovieRepository::new()));
    let app = router(AppState::new(
        Arc::new(broker.clone()),
        Arc::new(service.clone()),
    ));
    Harness {
        app,
        broker,
        service,
    }
}

async fn send(
    app: &axum::Router,
    method: Method,
    uri: &str,
    payload: Option<Value>,
    headers: &[(&str, &str)],
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let body = match payload {
        Some(payload) => {
            builder = builder.header("content-type", "application/json");
            Body::from(payload.to_string())
        }
        None => Body::empty(),
    };
    let request = builder.body(body).expect("request should build");

    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("response expected");
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body should be readable");

    if body.is_empty() {
        return (status, Value::Null);
    }

    let json = serde_json::from_slice::<Value>(&body).expect("body should be valid JSON");
    (status, json)
}

/// Run a consumer against the harness broker until the queue is empty.
async fn drain(harness: &Harness) {
    let shutdown = ShutdownSignal::new();
    let (state, _) = ConsumerState::channel();
    let sink = harness.broker.clone();
    let writer = harness.service.clone();
    let deliveries = harness.broker.deliveries();
    let loop_shutdown = shutdown.clone();

    let worker = tokio::spawn(async move {
        run_loop(
            deliveries,
            &sink,
            &writer,
            &RedeliveryPolicy::default(),
            &loop_shutdown,
            &state,
        )
        .await
    });

    tokio::time::timeout(Duration::from_secs(5), harness.broker.wait_until_idle())
        .await
        .expect("queue should drain");
    shutdown.trigger();
    worker
        .await
        .expect("worker task should not panic")
        .expect("worker should stop cleanly");
}

#[tokio::test]
async fn create_is_accepted_then_applied() {
    let harness = harness();

    let (status, body) = send(
        &harness.app,
        Method::POST,
        "/movies",
        Some(json!({"title": "Interestelar", "year": 2014})),
        &[("X-Correlation-ID", "req-1")],
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "accepted");
    assert_eq!(body["correlationId"], "req-1");

    // Not visible until the worker has run
    let (_, listed) = send(&harness.app, Method::GET, "/movies", None, &[]).await;
    assert_eq!(listed, json!([]));

    let published = harness.broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].routing_key, "movie.created");
    assert_eq!(published[0].correlation_id.as_deref(), Some("req-1"));
    let envelope = Envelope::decode(&published[0].body).unwrap();
    assert_eq!(envelope.action, "create");
    assert_eq!(envelope.data, json!({"title": "Interestelar", "year": 2014}));

    drain(&harness).await;

    let (status, listed) = send(&harness.app, Method::GET, "/movies", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    let movies = listed.as_array().unwrap();
    assert_eq!(movies.len(), 1);
    assert_eq!(movies[0]["title"], "Interestelar");
    assert_eq!(movies[0]["year"], 2014);

    let id = movies[0]["id"].as_str().unwrap();
    let (status, movie) = send(&harness.app, Method::GET, &format!("/movies/{id}"), None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(movie["title"], "Interestelar");
}

#[tokio::test]
async fn delete_is_accepted_then_applied() {
    let harness = harness();
    let movie = harness.service.repository().insert(marquee::movies::NewMovie {
        title: "Alien".to_string(),
        year: 1979,
    })
    .await
    .unwrap();

    let (status, body) = send(
        &harness.app,
        Method::DELETE,
        &format!("/movies/{}", movie.id),
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(body["correlationId"].as_str().is_some_and(|id| !id.is_empty()));
    assert_eq!(harness.broker.published()[0].routing_key, "movie.deleted");

    drain(&harness).await;

    let (status, body) = send(
        &harness.app,
        Method::GET,
        &format!("/movies/{}", movie.id),
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn create_validation_errors() {
    let harness = harness();

    let (status, body) = send(
        &harness.app,
        Method::POST,
        "/movies",
        Some(json!({"title": "   ", "year": 2000})),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "title is required");

    let (status, _) = send(
        &harness.app,
        Method::POST,
        "/movies",
        Some(json!({"title": "Heat"})),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &harness.app,
        Method::POST,
        "/movies",
        Some(json!({"title": "Heat", "year": "nineteen"})),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    assert!(harness.broker.published().is_empty());
}

#[tokio::test]
async fn publish_failure_is_a_server_error() {
    let harness = harness();
    harness.broker.fail_publishes(true);

    let (status, body) = send(
        &harness.app,
        Method::POST,
        "/movies",
        Some(json!({"title": "Heat", "year": 1995})),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "failed to enqueue request");

    let (_, metrics) = send(&harness.app, Method::GET, "/metrics", None, &[]).await;
    assert_eq!(metrics["writes"]["publish_failures"], 1);
    assert_eq!(metrics["writes"]["creates_accepted"], 0);
}

#[tokio::test]
async fn reads_map_backend_errors() {
    let harness = harness();

    let (status, _) = send(&harness.app, Method::GET, "/movies/not-hex", None, &[]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &harness.app,
        Method::GET,
        "/movies/65a1f0c2e4b0a1b2c3d4e5f6",
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn list_filters_and_paging() {
    let harness = harness();
    for (title, year) in [("Alien", 1979), ("Aliens", 1986), ("Heat", 1995)] {
        harness
            .service
            .repository()
            .insert(marquee::movies::NewMovie {
                title: title.to_string(),
                year,
            })
            .await
            .unwrap();
    }

    let (_, body) = send(&harness.app, Method::GET, "/movies?title=alien", None, &[]).await;
    assert_eq!(body.as_array().unwrap().len(), 2);

    let (_, body) = send(&harness.app, Method::GET, "/movies?year=1995", None, &[]).await;
    assert_eq!(body[0]["title"], "Heat");

    let (_, body) = send(&harness.app, Method::GET, "/movies?limit=1&offset=1", None, &[]).await;
    let page = body.as_array().unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0]["title"], "Aliens");
}

#[tokio::test]
async fn bad_list_query_is_a_json_error() {
    let harness = harness();

    for uri in ["/movies?limit=-1", "/movies?year=abc"] {
        let (status, body) = send(&harness.app, Method::GET, uri, None, &[]).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        assert!(body["error"].is_string(), "{uri}");
    }
}

#[tokio::test]
async fn health_fails_when_broker_connection_is_gone() {
    let harness = harness();
    harness.broker.set_connected(false);

    let (status, body) = send(&harness.app, Method::GET, "/health", None, &[]).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unavailable");
    assert_eq!(body["broker"], "disconnected");

    harness.broker.set_connected(true);
    let (status, _) = send(&harness.app, Method::GET, "/health", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn health_and_metrics() {
    let harness = harness();

    let (status, body) = send(&harness.app, Method::GET, "/health", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["broker"], "connected");

    send(
        &harness.app,
        Method::DELETE,
        "/movies/65a1f0c2e4b0a1b2c3d4e5f6",
        None,
        &[],
    )
    .await;
    let (_, metrics) = send(&harness.app, Method::GET, "/metrics", None, &[]).await;
    assert_eq!(metrics["writes"]["deletes_accepted"], 1);
    assert_eq!(metrics["status"], "running");
}
