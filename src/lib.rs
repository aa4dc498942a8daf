//! Munin - self-healing connection layer for message brokers
//!
//! This crate wraps a broker client's connections and channels so that
//! transient failures — network drops, broker restarts, I/O errors — are
//! absorbed behind a stable façade. Application code sees connections and
//! channels that stay alive across underlying disconnects; munin
//! transparently reconnects the transport, redeclares the topology
//! (exchanges, queues, bindings), and replays consumers.
//!
//! The broker client itself is supplied by the application as an adapter
//! implementing the [`client`] traits; munin never speaks the wire
//! protocol.
//!
//! # Example
//!
//! ```rust,ignore
//! use munin::{Config, ConsumerSpec, ExchangeKind, ExchangeSpec, QueueSpec,
//!             RecoveringConnection, RetryPolicy};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> munin::Result<()> {
//!     // `adapter` implements munin::client::Connector over your broker client.
//!     let connection = RecoveringConnection::connect(
//!         adapter,
//!         Config::new().retry_policy(
//!             RetryPolicy::new()
//!                 .max_attempts(5)
//!                 .interval(Duration::from_millis(200))
//!                 .backoff_factor(2.0),
//!         ),
//!     )
//!     .await?;
//!
//!     let channel = connection.open_channel().await?;
//!     channel.declare_exchange(ExchangeSpec::new("logs", ExchangeKind::Topic)).await?;
//!     let queue = channel.declare_queue(QueueSpec::server_named()).await?;
//!     channel.bind_queue(&queue.queue, "logs", "app.#", Default::default()).await?;
//!     channel.consume(ConsumerSpec::new(&queue.queue)).await?;
//!
//!     // From here on, a broker restart is invisible: the supervisor
//!     // reconnects, redeclares "logs" and the queue, rebinds, and replays
//!     // the consumer. Publishes issued meanwhile wait for the circuit.
//!     channel.publish("logs", "app.start", b"hello").await?;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod circuit;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod policy;
pub mod resource;
pub mod stats;
pub mod telemetry;
pub mod topology;
pub mod waiter;

// Re-export main types at crate root
pub use channel::RecoveringChannel;
pub use circuit::{Circuit, GateWait};
pub use client::{
    Arguments, Channel, Connection, Connector, QueueDeclareOk, ShutdownListener,
};
pub use config::Config;
pub use connection::RecoveringConnection;
pub use error::{MuninError, Result, ShutdownSignal};
pub use policy::RetryPolicy;
pub use resource::{RecoverySupport, RetryableResource};
pub use stats::RetryStats;
pub use topology::{Binding, ConsumerSpec, ExchangeKind, ExchangeSpec, QueueSpec, Topology};
pub use waiter::Waiter;
