//! # Kafkalink Client Library
//!
//! Broker connection manager for Kafka-protocol clusters.
//!
//! ## Features
//!
//! - **Connection Pooling**: one pipelined connection per broker, keyed by `host:port`
//! - **Topology Cache**: topic/partition leaders learned from metadata responses
//! - **Request Correlation**: out-of-order responses matched by correlation id
//! - **Automatic Reconnect**: bounded exponential backoff, never two live channels per broker
//! - **TLS**: rustls-based secure transport with a configurable secure port offset
//! - **Observability**: per-client metrics and tracing support
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use kafkalink_client::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = ClientConfig::builder()
//!         .brokers(vec!["localhost:9092"])
//!         .client_id("my-service")
//!         .build();
//!     let client = KafkalinkClient::connect(config).await?;
//!
//!     let missing = client.topic_exists(&["orders"]).await?;
//!     println!("missing topics: {:?}", missing);
//!     println!("leader of orders/0: {:?}", client.leader_for("orders", 0));
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! Higher-level producers and consumers encode their own requests and hand them
//! to [`KafkalinkClient::dispatch`] together with a [`ResponseDecoder`].

pub mod client;
pub mod config;
pub mod connection;
pub mod correlation;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod pool;
pub mod profile;
pub mod protocol;
pub mod tls;
pub mod topology;

pub use client::*;
pub use config::*;
pub use connection::{ChannelEvent, ChannelState, SocketChannel};
pub use error::*;
pub use identity::ClientIdentity;
pub use metrics::MetricsSnapshot;
pub use pool::BrokerPool;
pub use profile::{BrokerKey, ConnectionProfile, ProfileRegistry};
pub use protocol::{
    EncodedRequest, MetadataDecoder, MetadataRequest, MetadataResponse, RawResponse,
    ResponseDecoder,
};
pub use topology::{TopologyCache, TopologyEntry};

/// Client library result type
pub type Result<T> = std::result::Result<T, KafkalinkClientError>;

/// Client library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
