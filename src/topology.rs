//! Declared topology, captured for replay after reconnection.
//!
//! Every successful declare/bind/consume on a façade records a spec here.
//! During recovery the engine replays the recorded specs against a fresh
//! channel in insertion order: exchanges before exchange bindings, queues
//! before queue bindings, consumers last. Deleting an entity removes its
//! spec (and anything that referenced it), so a recovery pass never
//! resurrects topology the application tore down.
//!
//! The registry hands out cloned snapshots under its own lock rather than
//! exposing the lock itself, so a recovery pass can iterate while the
//! application keeps declaring.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::client::Arguments;

/// Exchange routing discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
    Headers,
}

/// A declared exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
    pub arguments: Arguments,
}

impl ExchangeSpec {
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: false,
            auto_delete: false,
            arguments: Arguments::new(),
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn arguments(mut self, arguments: Arguments) -> Self {
        self.arguments = arguments;
        self
    }
}

/// A declared queue.
///
/// The name is interiorly mutable: when the broker assigns a name to a
/// server-named queue (or renames one across a recovery), the new name is
/// written back so later bindings and consumers target the right queue.
#[derive(Debug)]
pub struct QueueSpec {
    name: RwLock<String>,
    server_named: bool,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: Arguments,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            server_named: name.is_empty(),
            name: RwLock::new(name),
            durable: false,
            exclusive: false,
            auto_delete: false,
            arguments: Arguments::new(),
        }
    }

    /// A queue whose name the broker will assign.
    pub fn server_named() -> Self {
        Self::new("")
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn arguments(mut self, arguments: Arguments) -> Self {
        self.arguments = arguments;
        self
    }

    /// Current effective name.
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    /// Whether the broker assigns the name.
    ///
    /// Stays true after a name has been captured: a redeclaration during
    /// recovery must ask the broker for a fresh name rather than reuse the
    /// old server-assigned one.
    pub fn is_server_named(&self) -> bool {
        self.server_named
    }

    pub(crate) fn set_name(&self, name: String) {
        *self.name.write() = name;
    }
}

/// A registered consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerSpec {
    /// Queue the consumer reads from.
    pub queue: String,
    /// Consumer tag; empty lets the broker assign one.
    pub consumer_tag: String,
    pub exclusive: bool,
    pub arguments: Arguments,
}

impl ConsumerSpec {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            consumer_tag: String::new(),
            exclusive: false,
            arguments: Arguments::new(),
        }
    }

    pub fn consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = tag.into();
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }
}

/// An exchange→exchange or exchange→queue binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    /// Exchange messages flow from.
    pub source: String,
    /// Exchange or queue messages flow to.
    pub destination: String,
    pub routing_key: String,
    pub arguments: Arguments,
}

#[derive(Debug, Default)]
struct TopologyInner {
    exchanges: Vec<Arc<ExchangeSpec>>,
    exchange_bindings: Vec<Binding>,
    queues: Vec<Arc<QueueSpec>>,
    queue_bindings: Vec<Binding>,
    consumers: Vec<ConsumerSpec>,
}

/// Insertion-ordered registry of everything declared through a façade.
#[derive(Debug, Default)]
pub struct Topology {
    inner: Mutex<TopologyInner>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a declared exchange, replacing any earlier spec of the same
    /// name so a redeclare-with-new-arguments wins.
    pub fn record_exchange(&self, spec: Arc<ExchangeSpec>) {
        let mut inner = self.inner.lock();
        inner.exchanges.retain(|e| e.name != spec.name);
        inner.exchanges.push(spec);
    }

    /// Record a declared queue, replacing any earlier spec of the same name.
    pub fn record_queue(&self, spec: Arc<QueueSpec>) {
        let name = spec.name();
        let mut inner = self.inner.lock();
        inner.queues.retain(|q| q.name() != name);
        inner.queues.push(spec);
    }

    pub fn record_exchange_binding(&self, binding: Binding) {
        let mut inner = self.inner.lock();
        if !inner.exchange_bindings.contains(&binding) {
            inner.exchange_bindings.push(binding);
        }
    }

    pub fn record_queue_binding(&self, binding: Binding) {
        let mut inner = self.inner.lock();
        if !inner.queue_bindings.contains(&binding) {
            inner.queue_bindings.push(binding);
        }
    }

    pub fn record_consumer(&self, spec: ConsumerSpec) {
        self.inner.lock().consumers.push(spec);
    }

    /// Drop an exchange and every binding that references it.
    pub fn remove_exchange(&self, name: &str) {
        let mut inner = self.inner.lock();
        inner.exchanges.retain(|e| e.name != name);
        inner
            .exchange_bindings
            .retain(|b| b.source != name && b.destination != name);
        inner.queue_bindings.retain(|b| b.source != name);
    }

    /// Drop a queue and every binding and consumer that references it.
    pub fn remove_queue(&self, name: &str) {
        let mut inner = self.inner.lock();
        inner.queues.retain(|q| q.name() != name);
        inner.queue_bindings.retain(|b| b.destination != name);
        inner.consumers.retain(|c| c.queue != name);
    }

    /// Drop a consumer by tag.
    pub fn remove_consumer(&self, consumer_tag: &str) {
        self.inner
            .lock()
            .consumers
            .retain(|c| c.consumer_tag != consumer_tag);
    }

    /// Retarget bindings and consumers after the broker renamed a queue
    /// during recovery.
    pub fn rename_queue(&self, old: &str, new: &str) {
        let mut inner = self.inner.lock();
        for binding in &mut inner.queue_bindings {
            if binding.destination == old {
                binding.destination = new.to_owned();
            }
        }
        for consumer in &mut inner.consumers {
            if consumer.queue == old {
                consumer.queue = new.to_owned();
            }
        }
    }

    // Snapshots, in insertion order.

    pub fn exchanges(&self) -> Vec<Arc<ExchangeSpec>> {
        self.inner.lock().exchanges.clone()
    }

    pub fn exchange_bindings(&self) -> Vec<Binding> {
        self.inner.lock().exchange_bindings.clone()
    }

    pub fn queues(&self) -> Vec<Arc<QueueSpec>> {
        self.inner.lock().queues.clone()
    }

    pub fn queue_bindings(&self) -> Vec<Binding> {
        self.inner.lock().queue_bindings.clone()
    }

    pub fn consumers(&self) -> Vec<ConsumerSpec> {
        self.inner.lock().consumers.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redeclare_replaces_by_name() {
        let topology = Topology::new();
        topology.record_exchange(Arc::new(ExchangeSpec::new("logs", ExchangeKind::Fanout)));
        topology.record_exchange(Arc::new(
            ExchangeSpec::new("logs", ExchangeKind::Fanout).durable(true),
        ));
        let exchanges = topology.exchanges();
        assert_eq!(exchanges.len(), 1);
        assert!(exchanges[0].durable);
    }

    #[test]
    fn duplicate_bindings_collapse() {
        let topology = Topology::new();
        let binding = Binding {
            source: "logs".into(),
            destination: "audit".into(),
            routing_key: "#".into(),
            arguments: Arguments::new(),
        };
        topology.record_queue_binding(binding.clone());
        topology.record_queue_binding(binding);
        assert_eq!(topology.queue_bindings().len(), 1);
    }

    #[test]
    fn rename_retargets_bindings_and_consumers() {
        let topology = Topology::new();
        topology.record_queue_binding(Binding {
            source: "logs".into(),
            destination: "amq.gen-old".into(),
            routing_key: "".into(),
            arguments: Arguments::new(),
        });
        topology.record_consumer(ConsumerSpec::new("amq.gen-old"));

        topology.rename_queue("amq.gen-old", "amq.gen-new");

        assert_eq!(topology.queue_bindings()[0].destination, "amq.gen-new");
        assert_eq!(topology.consumers()[0].queue, "amq.gen-new");
    }

    #[test]
    fn remove_queue_drops_dependents() {
        let topology = Topology::new();
        topology.record_queue(Arc::new(QueueSpec::new("work")));
        topology.record_queue_binding(Binding {
            source: "jobs".into(),
            destination: "work".into(),
            routing_key: "".into(),
            arguments: Arguments::new(),
        });
        topology.record_consumer(ConsumerSpec::new("work").consumer_tag("tag-1"));

        topology.remove_queue("work");

        assert!(topology.queues().is_empty());
        assert!(topology.queue_bindings().is_empty());
        assert!(topology.consumers().is_empty());
    }
}
