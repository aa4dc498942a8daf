//! The recovering channel façade.
//!
//! A [`RecoveringChannel`] wraps an underlying broker channel and keeps it
//! usable across transport loss. Every outbound operation runs through the
//! retry engine; successful declarations are recorded in the channel's
//! topology so recovery can replay them. Channel-level (soft) shutdowns are
//! handled by a per-channel supervisor; connection-level (hard) shutdowns
//! are left to the connection supervisor, which rebuilds every channel.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Notify, broadcast};
use tracing::{debug, info};

use crate::client::{Arguments, Channel, Connection, QueueDeclareOk, ShutdownListener};
use crate::config::Config;
use crate::connection::ConnectionState;
use crate::error::{Result, ShutdownSignal};
use crate::resource::{RecoverySupport, RetryableResource, drive_recovery};
use crate::telemetry;
use crate::topology::{Binding, ConsumerSpec, ExchangeSpec, QueueSpec, Topology};

pub(crate) struct ChannelState {
    pub(crate) config: Config,
    pub(crate) connection: Arc<ConnectionState>,
    pub(crate) current: RwLock<Arc<dyn Channel>>,
    pub(crate) resource: RetryableResource,
    /// Queue-scope topology: queues, queue bindings, consumers.
    pub(crate) topology: Topology,
    /// Shutdown receiver for a freshly swapped-in delegate, handed to the
    /// supervisor after recovery.
    pub(crate) pending_signals: Mutex<Option<broadcast::Receiver<ShutdownSignal>>>,
    resubscribed: Notify,
}

impl ChannelState {
    pub(crate) fn new(
        config: Config,
        connection: Arc<ConnectionState>,
        delegate: Arc<dyn Channel>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            connection,
            current: RwLock::new(delegate),
            resource: RetryableResource::new(),
            topology: Topology::new(),
            pending_signals: Mutex::new(None),
            resubscribed: Notify::new(),
        })
    }

    pub(crate) fn current_channel(&self) -> Arc<dyn Channel> {
        self.current.read().clone()
    }

    /// Rebuild this channel against `connection`: fresh delegate, then
    /// queues (with rename propagation), queue bindings, consumers.
    ///
    /// Called by the connection supervisor during a hard recovery pass and
    /// by this channel's own supervisor on a soft shutdown.
    pub(crate) async fn recover(&self, connection: &Arc<dyn Connection>) -> Result<()> {
        if self.resource.is_closed() {
            return Ok(());
        }
        let fresh = connection.open_channel().await?;
        *self.pending_signals.lock() = Some(fresh.shutdown_signals());
        *self.current.write() = fresh;
        self.resubscribed.notify_one();

        for queue in self.topology.queues() {
            let old = queue.name();
            let effective = self.resource.recover_queue(self, &queue).await?;
            if effective != old {
                self.topology.rename_queue(&old, &effective);
            }
        }
        self.resource
            .recover_queue_bindings(self, &self.topology.queue_bindings())
            .await?;
        self.recover_consumers().await
    }

    /// Replay registered consumers on the recovered delegate, under the same
    /// per-item failure policy as the engine's topology recovery.
    async fn recover_consumers(&self) -> Result<()> {
        let consumers = self.topology.consumers();
        if consumers.is_empty() {
            return Ok(());
        }
        let channel = self.current_channel();
        for consumer in consumers {
            if let Err(error) = channel.consume(&consumer).await {
                metrics::counter!(telemetry::RECOVERY_FAILURES_TOTAL).increment(1);
                tracing::error!(queue = %consumer.queue, error = %error, "failed to recover consumer");
                if self.throw_on_recovery_failure() || error.is_connection_shutdown() {
                    return Err(error);
                }
            }
        }
        Ok(())
    }

    /// Wait until recovery swaps in a fresh delegate and stashes its
    /// shutdown receiver. `None` once the resource closes.
    async fn wait_resubscribe(&self) -> Option<broadcast::Receiver<ShutdownSignal>> {
        loop {
            if self.resource.is_closed() {
                return None;
            }
            if let Some(receiver) = self.pending_signals.lock().take() {
                return Some(receiver);
            }
            self.resubscribed.notified().await;
        }
    }

    fn abandon(&self) {
        metrics::counter!(telemetry::ABANDONED_TOTAL, "scope" => "channel").increment(1);
        self.resource.mark_closed(self);
    }

    /// Supervisor for channel-level (soft) shutdowns.
    pub(crate) fn spawn_supervisor(state: Arc<Self>) {
        let mut signals = state.current_channel().shutdown_signals();
        tokio::spawn(async move {
            loop {
                let event = signals.recv().await;
                if state.resource.is_closed() {
                    return;
                }
                let signal = match event {
                    Ok(signal) => signal,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        // Delegate replaced or torn down without a signal.
                        match state.wait_resubscribe().await {
                            Some(receiver) => {
                                signals = receiver;
                                continue;
                            }
                            None => return,
                        }
                    }
                };
                if signal.hard {
                    // The connection supervisor rebuilds this channel; wait
                    // for the replacement delegate's signal stream.
                    match state.wait_resubscribe().await {
                        Some(receiver) => signals = receiver,
                        None => return,
                    }
                    continue;
                }

                info!(%signal, "channel lost, starting recovery");
                metrics::counter!(telemetry::RECOVERIES_TOTAL, "scope" => "channel").increment(1);
                state.resource.notify_listeners(&signal);
                state.resource.circuit().close();

                let recovered = drive_recovery(
                    &state.resource,
                    &state.config.recovery_policy,
                    "channel.recovery",
                    || {
                        let state = Arc::clone(&state);
                        async move {
                            let connection = state.connection.current_connection();
                            state.recover(&connection).await
                        }
                    },
                )
                .await;

                if recovered {
                    state.resource.circuit().open();
                    if let Some(receiver) = state.pending_signals.lock().take() {
                        signals = receiver;
                    }
                    debug!("channel recovered");
                } else {
                    state.abandon();
                    return;
                }
            }
        });
    }
}

#[async_trait]
impl RecoverySupport for ChannelState {
    async fn recovery_channel(&self) -> Result<Arc<dyn Channel>> {
        // The delegate swapped in at the start of the recovery pass.
        Ok(self.current_channel())
    }

    fn throw_on_recovery_failure(&self) -> bool {
        true
    }

    fn after_closure(&self) {
        // Unpark a supervisor waiting for a delegate that will never come.
        self.resubscribed.notify_one();
    }
}

/// A broker channel that stays alive across transport loss.
///
/// Obtained from [`RecoveringConnection::open_channel`]. All methods retry
/// transient failures under the configured [`Config::retry_policy`]; an
/// operation issued while the transport is being rebuilt parks on the
/// recovery circuit and resumes against the replacement transport.
///
/// [`RecoveringConnection::open_channel`]: crate::RecoveringConnection::open_channel
pub struct RecoveringChannel {
    state: Arc<ChannelState>,
}

impl RecoveringChannel {
    pub(crate) fn new(state: Arc<ChannelState>) -> Self {
        Self { state }
    }

    /// Declare an exchange and record it for recovery.
    ///
    /// Exchanges (and exchange bindings) are recorded connection-wide: they
    /// outlive any one channel, so the connection supervisor redeclares them
    /// before rebuilding channels.
    pub async fn declare_exchange(&self, spec: ExchangeSpec) -> Result<()> {
        let state = &self.state;
        let spec = Arc::new(spec);
        state
            .resource
            .call_with_retries(
                "exchange.declare",
                || {
                    let channel = state.current_channel();
                    let spec = Arc::clone(&spec);
                    async move { channel.declare_exchange(&spec).await }
                },
                &state.config.retry_policy,
                None,
                state.config.recovery_enabled,
                true,
            )
            .await?;
        state.connection.topology.record_exchange(spec);
        Ok(())
    }

    /// Delete an exchange and forget it (and its bindings) for recovery.
    pub async fn delete_exchange(&self, name: &str) -> Result<()> {
        let state = &self.state;
        state
            .resource
            .call_with_retries(
                "exchange.delete",
                || {
                    let channel = state.current_channel();
                    let name = name.to_owned();
                    async move { channel.delete_exchange(&name).await }
                },
                &state.config.retry_policy,
                None,
                state.config.recovery_enabled,
                true,
            )
            .await?;
        state.connection.topology.remove_exchange(name);
        state.topology.remove_exchange(name);
        Ok(())
    }

    /// Declare a queue and record it for recovery.
    ///
    /// For a server-named spec the broker-assigned name is written back into
    /// the spec, so bindings and consumers declared through it target the
    /// real queue.
    pub async fn declare_queue(&self, spec: QueueSpec) -> Result<QueueDeclareOk> {
        let state = &self.state;
        let spec = Arc::new(spec);
        let reply = state
            .resource
            .call_with_retries(
                "queue.declare",
                || {
                    let channel = state.current_channel();
                    let spec = Arc::clone(&spec);
                    async move { channel.declare_queue(&spec).await }
                },
                &state.config.retry_policy,
                None,
                state.config.recovery_enabled,
                true,
            )
            .await?;
        if spec.name() != reply.queue {
            spec.set_name(reply.queue.clone());
        }
        state.topology.record_queue(Arc::clone(&spec));
        Ok(reply)
    }

    /// Delete a queue and forget it (and its bindings and consumers).
    pub async fn delete_queue(&self, name: &str) -> Result<()> {
        let state = &self.state;
        state
            .resource
            .call_with_retries(
                "queue.delete",
                || {
                    let channel = state.current_channel();
                    let name = name.to_owned();
                    async move { channel.delete_queue(&name).await }
                },
                &state.config.retry_policy,
                None,
                state.config.recovery_enabled,
                true,
            )
            .await?;
        state.topology.remove_queue(name);
        Ok(())
    }

    /// Bind one exchange to another and record the binding for recovery.
    pub async fn bind_exchange(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: Arguments,
    ) -> Result<()> {
        let state = &self.state;
        state
            .resource
            .call_with_retries(
                "exchange.bind",
                || {
                    let channel = state.current_channel();
                    let (destination, source, routing_key) =
                        (destination.to_owned(), source.to_owned(), routing_key.to_owned());
                    let arguments = arguments.clone();
                    async move {
                        channel
                            .bind_exchange(&destination, &source, &routing_key, &arguments)
                            .await
                    }
                },
                &state.config.retry_policy,
                None,
                state.config.recovery_enabled,
                true,
            )
            .await?;
        state.connection.topology.record_exchange_binding(Binding {
            source: source.to_owned(),
            destination: destination.to_owned(),
            routing_key: routing_key.to_owned(),
            arguments,
        });
        Ok(())
    }

    /// Bind a queue to an exchange and record the binding for recovery.
    pub async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: Arguments,
    ) -> Result<()> {
        let state = &self.state;
        state
            .resource
            .call_with_retries(
                "queue.bind",
                || {
                    let channel = state.current_channel();
                    let (queue, exchange, routing_key) =
                        (queue.to_owned(), exchange.to_owned(), routing_key.to_owned());
                    let arguments = arguments.clone();
                    async move {
                        channel
                            .bind_queue(&queue, &exchange, &routing_key, &arguments)
                            .await
                    }
                },
                &state.config.retry_policy,
                None,
                state.config.recovery_enabled,
                true,
            )
            .await?;
        state.topology.record_queue_binding(Binding {
            source: exchange.to_owned(),
            destination: queue.to_owned(),
            routing_key: routing_key.to_owned(),
            arguments,
        });
        Ok(())
    }

    /// Start a consumer, record it for replay, and return the effective tag.
    pub async fn consume(&self, spec: ConsumerSpec) -> Result<String> {
        let state = &self.state;
        let tag = state
            .resource
            .call_with_retries(
                "basic.consume",
                || {
                    let channel = state.current_channel();
                    let spec = spec.clone();
                    async move { channel.consume(&spec).await }
                },
                &state.config.retry_policy,
                None,
                state.config.recovery_enabled,
                true,
            )
            .await?;
        let mut recorded = spec;
        recorded.consumer_tag = tag.clone();
        state.topology.record_consumer(recorded);
        Ok(tag)
    }

    /// Cancel a consumer and forget it.
    pub async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let state = &self.state;
        state
            .resource
            .call_with_retries(
                "basic.cancel",
                || {
                    let channel = state.current_channel();
                    let tag = consumer_tag.to_owned();
                    async move { channel.cancel(&tag).await }
                },
                &state.config.retry_policy,
                None,
                state.config.recovery_enabled,
                true,
            )
            .await?;
        state.topology.remove_consumer(consumer_tag);
        Ok(())
    }

    /// Publish a message, retrying across transport loss.
    pub async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        let state = &self.state;
        state
            .resource
            .call_with_retries(
                "publish",
                || {
                    let channel = state.current_channel();
                    let (exchange, routing_key) = (exchange.to_owned(), routing_key.to_owned());
                    let payload = payload.to_vec();
                    async move { channel.publish(&exchange, &routing_key, &payload).await }
                },
                &state.config.retry_policy,
                None,
                state.config.recovery_enabled,
                true,
            )
            .await
    }

    /// Close the channel. Idempotent; wakes every blocked caller.
    pub async fn close(&self) -> Result<()> {
        if self.state.resource.is_closed() {
            return Ok(());
        }
        let result = self.state.current_channel().close().await;
        self.state.resource.mark_closed(&*self.state);
        result
    }

    /// Close the channel, discarding any delegate error.
    pub async fn abort(&self) {
        let _ = self.state.current_channel().close().await;
        self.state.resource.mark_closed(&*self.state);
    }

    /// Register a shutdown listener. Registration lives on the façade and
    /// survives reconnection; it is never forwarded to the delegate.
    pub fn add_shutdown_listener(&self, listener: Arc<dyn ShutdownListener>) {
        self.state.resource.add_shutdown_listener(listener);
    }

    /// Remove a previously registered listener.
    pub fn remove_shutdown_listener(&self, listener: &Arc<dyn ShutdownListener>) {
        self.state.resource.remove_shutdown_listener(listener);
    }

    pub fn is_open(&self) -> bool {
        !self.state.resource.is_closed() && self.state.current_channel().is_open()
    }

    /// Whether close/abort has latched.
    pub fn is_closed(&self) -> bool {
        self.state.resource.is_closed()
    }
}

impl std::fmt::Debug for RecoveringChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveringChannel")
            .field("closed", &self.state.resource.is_closed())
            .finish()
    }
}
