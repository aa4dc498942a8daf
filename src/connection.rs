//! The recovering connection façade and its supervisor.
//!
//! A [`RecoveringConnection`] wraps a broker connection obtained from a
//! [`Connector`] and keeps it alive: a supervisor task watches for
//! connection-level shutdown signals, closes the recovery circuits, rebuilds
//! the transport under the recovery budget, redeclares exchange-scope
//! topology, recovers every live channel, and reopens the circuits so
//! parked callers resume against the replacement transport.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::channel::{ChannelState, RecoveringChannel};
use crate::client::{Channel, Connection, Connector, ShutdownListener};
use crate::config::Config;
use crate::error::{Result, ShutdownSignal};
use crate::resource::{RecoverySupport, RetryableResource, drive_recovery};
use crate::telemetry;
use crate::topology::Topology;

pub(crate) struct ConnectionState {
    pub(crate) config: Config,
    connector: Arc<dyn Connector>,
    current: RwLock<Arc<dyn Connection>>,
    pub(crate) resource: RetryableResource,
    /// Exchange-scope topology: exchanges and exchange→exchange bindings.
    /// These outlive individual channels, so they are redeclared once per
    /// recovery pass before any channel is rebuilt.
    pub(crate) topology: Topology,
    channels: Mutex<Vec<Weak<ChannelState>>>,
    /// Channel used to redeclare exchange-scope topology, opened lazily on
    /// the replacement transport once per recovery pass.
    recovery_channel: Mutex<Option<Arc<dyn Channel>>>,
    /// Shutdown receiver for a freshly connected transport, handed to the
    /// supervisor.
    pending_signals: Mutex<Option<broadcast::Receiver<ShutdownSignal>>>,
}

impl ConnectionState {
    pub(crate) fn current_connection(&self) -> Arc<dyn Connection> {
        self.current.read().clone()
    }

    fn live_channels(&self) -> Vec<Arc<ChannelState>> {
        let mut channels = self.channels.lock();
        channels.retain(|weak| weak.strong_count() > 0);
        channels.iter().filter_map(Weak::upgrade).collect()
    }

    /// One whole recovery pass: reconnect, redeclare exchange topology on a
    /// dedicated channel, rebuild every live channel.
    async fn rebuild(&self) -> Result<()> {
        *self.recovery_channel.lock() = None;
        let connection = self.connector.connect().await?;
        *self.pending_signals.lock() = Some(connection.shutdown_signals());
        *self.current.write() = connection.clone();

        for spec in self.topology.exchanges() {
            self.resource.recover_exchange(self, &spec).await?;
        }
        self.resource
            .recover_exchange_bindings(self, &self.topology.exchange_bindings())
            .await?;

        for channel in self.live_channels() {
            channel.recover(&connection).await?;
        }
        Ok(())
    }

    /// Latch this connection and every channel closed, waking all waiters.
    fn shutdown(&self) {
        for channel in self.live_channels() {
            channel.resource.mark_closed(&*channel);
        }
        self.resource.mark_closed(self);
    }

    fn abandon(&self) {
        metrics::counter!(telemetry::ABANDONED_TOTAL, "scope" => "connection").increment(1);
        warn!("recovery abandoned, closing connection");
        self.shutdown();
    }

    fn spawn_supervisor(state: Arc<Self>) {
        let mut signals = match state.pending_signals.lock().take() {
            Some(receiver) => receiver,
            None => state.current_connection().shutdown_signals(),
        };
        tokio::spawn(async move {
            loop {
                let signal = match signals.recv().await {
                    Ok(signal) => signal,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        if state.resource.is_closed() {
                            return;
                        }
                        // Transport dropped its signal stream without a
                        // closure notification; treat as a forced closure.
                        ShutdownSignal::connection(320, "transport dropped")
                    }
                };
                if state.resource.is_closed() {
                    return;
                }
                if !signal.hard {
                    // Channel-level closures are each channel's business.
                    continue;
                }

                info!(%signal, "transport lost, starting recovery");
                metrics::counter!(telemetry::RECOVERIES_TOTAL, "scope" => "connection")
                    .increment(1);
                state.resource.notify_listeners(&signal);
                state.resource.circuit().close();
                let channels = state.live_channels();
                for channel in &channels {
                    channel.resource.circuit().close();
                    channel.resource.notify_listeners(&signal);
                }

                let recovered = drive_recovery(
                    &state.resource,
                    &state.config.recovery_policy,
                    "recovery",
                    || {
                        let state = Arc::clone(&state);
                        async move { state.rebuild().await }
                    },
                )
                .await;

                if recovered {
                    for channel in state.live_channels() {
                        channel.resource.circuit().open();
                    }
                    state.resource.circuit().open();
                    if let Some(receiver) = state.pending_signals.lock().take() {
                        signals = receiver;
                    }
                    info!("transport recovered");
                } else {
                    state.abandon();
                    return;
                }
            }
        });
    }
}

#[async_trait]
impl RecoverySupport for ConnectionState {
    async fn recovery_channel(&self) -> Result<Arc<dyn Channel>> {
        if let Some(cached) = self.recovery_channel.lock().clone() {
            if cached.is_open() {
                return Ok(cached);
            }
        }
        let channel = self.current_connection().open_channel().await?;
        *self.recovery_channel.lock() = Some(channel.clone());
        Ok(channel)
    }

    fn throw_on_recovery_failure(&self) -> bool {
        false
    }
}

/// A broker connection that stays alive across transport loss.
///
/// Created with [`RecoveringConnection::connect`]. Channels opened through
/// it are themselves recovering: their declared topology and consumers are
/// replayed against every replacement transport.
pub struct RecoveringConnection {
    state: Arc<ConnectionState>,
}

impl RecoveringConnection {
    /// Establish the initial connection, retrying under
    /// [`Config::connect_policy`], and start the supervisor.
    pub async fn connect(connector: Arc<dyn Connector>, config: Config) -> Result<Self> {
        let resource = RetryableResource::new();
        let connection = resource
            .call_with_retries(
                "connect",
                || {
                    let connector = Arc::clone(&connector);
                    async move { connector.connect().await }
                },
                &config.connect_policy,
                None,
                false,
                true,
            )
            .await?;
        let signals = connection.shutdown_signals();
        let state = Arc::new(ConnectionState {
            config,
            connector,
            current: RwLock::new(connection),
            resource,
            topology: Topology::new(),
            channels: Mutex::new(Vec::new()),
            recovery_channel: Mutex::new(None),
            pending_signals: Mutex::new(Some(signals)),
        });
        if state.config.recovery_enabled {
            ConnectionState::spawn_supervisor(Arc::clone(&state));
        }
        Ok(Self { state })
    }

    /// Open a recovering channel on this connection.
    ///
    /// Goes through the retry engine, so a channel can be requested while a
    /// recovery pass is in flight; the call parks on the circuit and opens
    /// the channel on the replacement transport.
    pub async fn open_channel(&self) -> Result<RecoveringChannel> {
        let state = &self.state;
        let delegate = state
            .resource
            .call_with_retries(
                "channel.open",
                || {
                    let connection = state.current_connection();
                    async move { connection.open_channel().await }
                },
                &state.config.retry_policy,
                None,
                state.config.recovery_enabled,
                true,
            )
            .await?;
        let channel = ChannelState::new(state.config.clone(), Arc::clone(state), delegate);
        state.channels.lock().push(Arc::downgrade(&channel));
        if state.config.recovery_enabled {
            ChannelState::spawn_supervisor(Arc::clone(&channel));
        }
        Ok(RecoveringChannel::new(channel))
    }

    /// Close the connection and every channel. Idempotent; wakes every
    /// blocked caller.
    pub async fn close(&self) -> Result<()> {
        if self.state.resource.is_closed() {
            return Ok(());
        }
        let result = self.state.current_connection().close().await;
        self.state.shutdown();
        result
    }

    /// Close the connection, discarding any delegate error.
    pub async fn abort(&self) {
        let _ = self.state.current_connection().close().await;
        self.state.shutdown();
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
        !self.state.resource.is_closed() && self.state.current_connection().is_open()
    }

    /// Whether close/abort has latched.
    pub fn is_closed(&self) -> bool {
        self.state.resource.is_closed()
    }
}

impl std::fmt::Debug for RecoveringConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveringConnection")
            .field("closed", &self.state.resource.is_closed())
            .finish()
    }
}
