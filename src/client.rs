//! Contract with the underlying broker client.
//!
//! Munin does not speak the broker wire protocol itself. The application
//! supplies an adapter over its client library as implementations of these
//! traits; the façades wrap them with retry and recovery. The traits are
//! object-safe so mocks can stand in for a broker in tests.
//!
//! Transport loss is observed through [`Connection::shutdown_signals`] /
//! [`Channel::shutdown_signals`]: the adapter broadcasts a
//! [`ShutdownSignal`] whenever the underlying transport closes, and the
//! supervisors subscribe to drive recovery.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::{Result, ShutdownSignal};
use crate::topology::{ConsumerSpec, ExchangeSpec, QueueSpec};

/// Broker field-table arguments attached to declarations and bindings.
pub type Arguments = BTreeMap<String, Value>;

/// Reply to a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclareOk {
    /// Effective queue name. For a server-named declaration this is the
    /// broker-generated name.
    pub queue: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Factory for fresh transports. Called once at bootstrap and again on
/// every recovery pass.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Connection>>;
}

/// A live broker connection.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open a new channel on this connection.
    async fn open_channel(&self) -> Result<Arc<dyn Channel>>;

    async fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Subscribe to closure notifications for this connection.
    fn shutdown_signals(&self) -> broadcast::Receiver<ShutdownSignal>;
}

/// A live broker channel. Topology is declared and messages published
/// through a channel.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()>;

    async fn delete_exchange(&self, name: &str) -> Result<()>;

    /// Declare a queue. The reply carries the server-assigned name when the
    /// spec is server-named.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<QueueDeclareOk>;

    async fn delete_queue(&self, name: &str) -> Result<()>;

    /// Bind `destination` exchange to `source` exchange.
    async fn bind_exchange(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: &Arguments,
    ) -> Result<()>;

    /// Bind `queue` to `exchange`.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &Arguments,
    ) -> Result<()>;

    /// Start a consumer; returns the effective consumer tag.
    async fn consume(&self, spec: &ConsumerSpec) -> Result<String>;

    /// Cancel a consumer by tag.
    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Subscribe to closure notifications for this channel.
    fn shutdown_signals(&self) -> broadcast::Receiver<ShutdownSignal>;
}

/// Application callback invoked when a wrapped resource observes a
/// transport shutdown.
///
/// Registration lives on the façade, not the underlying transport, so
/// listeners survive reconnection without being re-registered.
pub trait ShutdownListener: Send + Sync {
    fn on_shutdown(&self, signal: &ShutdownSignal);
}
