//! # Marquee
//!
//! Movie catalog with an asynchronous write path.
//!
//! ## Architecture
//!
//! ```text
//!              reads (RPC)
//! Client -> Gateway ------------------------------> Movies service
//!              |                                         ^
//!              | writes: envelope -> RabbitMQ exchange   | MovieWriter
//!              v                                         |
//!           [movies] --> [movies.worker.q] --> Consumer -+
//! ```
//!
//! Creates and deletes are acknowledged with `202 Accepted` once the broker
//! confirms the envelope. The consumer inside the movies service applies
//! them later, at least once, in no guaranteed order.
//!
//! ## Modules
//!
//! - [`event`]: envelope wire format and typed commands
//! - [`broker`]: RabbitMQ topology, publisher and consumer
//! - [`movies`]: catalog entity, service and repository
//! - [`rpc`]: gateway to movies service contract
//! - [`gateway`]: public REST API

pub mod broker;
pub mod config;
pub mod dlq;
pub mod event;
pub mod gateway;
pub mod movies;
pub mod retry;
pub mod rpc;
pub mod shutdown;

pub use broker::{EventPublisher, Publisher};
pub use config::AppConfig;
pub use event::{Action, Envelope, MovieCommand};
pub use movies::{Movie, MovieService};
pub use shutdown::ShutdownSignal;
