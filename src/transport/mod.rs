//! Transport contract + registry (spec.md §4.6).
//!
//! Grounded on `benjaminabbitt-angzarr/src/bus/mod.rs`'s `EventBus` trait
//! and `init_event_bus` factory-by-config pattern for the registry/factory
//! shape, and on `visual-queue-manager/src/engine/dispatcher.rs` for the
//! circuit-breaker wrapping discipline at the publish boundary.

pub mod broker;
pub mod memory;
pub mod routing;
pub mod stdout_file;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::circuit::{CircuitExecError, CircuitOpenMarker, CircuitRegistry};
use crate::config::CircuitConfig;
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::message::Message;

/// Identifies a handler registered against a transport or the dispatcher
/// (spec.md §9, handler identifier resolution).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandlerId {
    /// A qualified class-method name, resolved at invocation time.
    Named(String),
    /// An opaque callable reference, resolved through a registry.
    Callback(u64),
}

impl std::fmt::Display for HandlerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerId::Named(name) => write!(f, "{name}"),
            HandlerId::Callback(id) => write!(f, "callback#{id}"),
        }
    }
}

/// Opaque handle returned from `subscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionId(pub String);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of a `publish` call (spec.md §4.6).
#[derive(Debug, Clone)]
pub enum PublishOutcome {
    Published,
    CircuitOpen(CircuitOpenMarker),
}

/// A fully-constructed message handed to the dispatcher by a transport's
/// receive pipeline.
pub type RouteFn =
    Arc<dyn Fn(Arc<dyn Message>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Contract every concrete transport implements (spec.md §4.6).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short registry name (`memory`, `stdout`, `file`, `redis_queue`, ...).
    fn name(&self) -> &str;

    /// Circuits shared by this transport instance (`transport_publish`,
    /// `transport_subscribe`).
    fn circuits(&self) -> &CircuitRegistry;

    /// Install the callback the receive pipeline hands decoded messages to.
    /// Called once by the dispatcher when the transport is registered.
    fn set_router(&self, router: RouteFn);

    /// Implementation-supplied publish. Never called directly by users —
    /// always through [`Transport::publish`]'s circuit wrapper.
    async fn do_publish(&self, message_class: &str, bytes: Vec<u8>) -> Result<()>;

    /// Circuit-breaker-wrapped publish (spec.md §4.6).
    async fn publish(&self, message_class: &str, bytes: Vec<u8>) -> Result<PublishOutcome> {
        let circuit = self
            .circuits()
            .get_or_create("transport_publish", CircuitConfig::default());
        match circuit.execute(self.do_publish(message_class, bytes)).await {
            Ok(()) => Ok(PublishOutcome::Published),
            Err(CircuitExecError::Open(marker)) => Ok(PublishOutcome::CircuitOpen(marker)),
            Err(CircuitExecError::Inner(e)) => Err(e),
        }
    }

    async fn subscribe(
        &self,
        message_class: &str,
        handler_id: HandlerId,
        filter: Filter,
    ) -> Result<SubscriptionId>;

    async fn unsubscribe(&self, message_class: &str, handler_id: &HandlerId) -> Result<()>;

    async fn unsubscribe_all(&self, message_class: &str) -> Result<()>;

    fn connected(&self) -> bool;

    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    fn transport_circuit_stats(&self) -> Vec<crate::circuit::CircuitStats> {
        self.circuits().stats_all()
    }

    fn reset_transport_circuits(&self, names: &[String]) {
        self.circuits().reset(names);
    }
}

/// Factory signature registered under a transport name.
pub type TransportFactory = Arc<dyn Fn(serde_json::Value) -> Result<Arc<dyn Transport>> + Send + Sync>;

/// Process-wide named registry mapping short symbols to transport
/// factories (spec.md §4.6 "Registry").
#[derive(Default)]
pub struct TransportRegistry {
    factories: DashMap<String, TransportFactory>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, factory: TransportFactory) {
        self.factories.insert(name.to_lowercase(), factory);
    }

    pub fn registered(&self, name: &str) -> bool {
        self.factories.contains_key(&name.to_lowercase())
    }

    pub fn create(&self, name: &str, opts: serde_json::Value) -> Result<Arc<dyn Transport>> {
        let factory = self
            .factories
            .get(&name.to_lowercase())
            .ok_or_else(|| Error::UnknownTransport(name.to_string()))?;
        factory(opts)
    }

    pub fn list(&self) -> Vec<String> {
        self.factories.iter().map(|e| e.key().clone()).collect()
    }
}
