//! Queue-backed broker transport: topic-style routing over named
//! in-process queues (spec.md §4.6 "Queue-backed broker transport").
//!
//! This is the generic in-process broker the core ships; a network client
//! for a real broker (AMQP/Kafka/Redis) is explicitly out of scope (spec.md
//! §1 Non-goals) and would be added as a separate crate implementing the
//! same [`Transport`] contract.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::Duration;

use crate::circuit::CircuitRegistry;
use crate::config::BrokerConfig;
use crate::error::Result;
use crate::filter::Filter;
use crate::header::Header;
use crate::message::{self};

use super::routing::{build_routing_key, matches, sanitize_segment};
use super::{HandlerId, RouteFn, SubscriptionId, Transport};

struct Envelope {
    header: Header,
    payload: Vec<u8>,
}

struct Binding {
    subscription_id: SubscriptionId,
    handler_id: HandlerId,
    pattern: String,
    filter: Filter,
    queue_tx: mpsc::Sender<Envelope>,
}

/// Publishes to named queues keyed by `exchange.message_class.from.to`;
/// subscribers bind patterns (`*`/`#`) to their own queue, each drained by
/// a per-queue worker task.
pub struct BrokerTransport {
    config: BrokerConfig,
    circuits: CircuitRegistry,
    router: RwLock<Option<RouteFn>>,
    bindings: Mutex<HashMap<String, Vec<Binding>>>,
    connected: AtomicBool,
    shutdown: Arc<AtomicBool>,
    /// Weak handle to itself, so `subscribe` can spawn a consumer task
    /// holding a strong `Arc` without the construction chicken-and-egg
    /// problem `Arc::new` has (built via `Arc::new_cyclic`).
    self_handle: std::sync::Weak<BrokerTransport>,
}

impl BrokerTransport {
    pub fn new(config: BrokerConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            circuits: CircuitRegistry::new(),
            router: RwLock::new(None),
            bindings: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
            shutdown: Arc::new(AtomicBool::new(false)),
            self_handle: weak.clone(),
        })
    }

    /// Drain every worker queue and stop accepting deliveries.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    fn spawn_consumer(
        self: &Arc<Self>,
        message_class: String,
        mut rx: mpsc::Receiver<Envelope>,
        filter: Filter,
    ) {
        let shutdown = self.shutdown.clone();
        let transport = self.clone();
        let timeout = Duration::from_secs(self.config.consumer_timeout_secs.max(1));
        tokio::spawn(async move {
            loop {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                match tokio::time::timeout(timeout, rx.recv()).await {
                    Ok(Some(envelope)) => {
                        if !filter.matches(&envelope.header) {
                            continue;
                        }
                        let Some(router) = transport.router.read().clone() else {
                            continue;
                        };
                        let payload: serde_json::Value =
                            match serde_json::from_slice(&envelope.payload) {
                                Ok(v) => v,
                                Err(e) => {
                                    tracing::warn!(error = %e, "broker: failed to decode envelope, discarding");
                                    continue;
                                }
                            };
                        match message::construct(envelope.header.clone(), payload) {
                            Ok(instance) => router(instance).await,
                            Err(e) => tracing::warn!(
                                error = %e,
                                class = %envelope.header.message_class,
                                "broker: failed to construct message"
                            ),
                        }
                    }
                    Ok(None) => break,
                    Err(_) => continue, // timeout: check shutdown flag, loop
                }
            }
            tracing::debug!(class = %message_class, "broker consumer task exited");
        });
    }
}

#[async_trait]
impl Transport for BrokerTransport {
    fn name(&self) -> &str {
        "broker"
    }

    fn circuits(&self) -> &CircuitRegistry {
        &self.circuits
    }

    fn set_router(&self, router: RouteFn) {
        *self.router.write() = Some(router);
    }

    async fn do_publish(&self, message_class: &str, bytes: Vec<u8>) -> Result<()> {
        let header = Header::new(message_class, "unknown", 1);
        self.publish_envelope(header, bytes).await
    }

    /// `message_class` is a routing-key pattern (`message_class.from.to`,
    /// `*`/`#` wildcards allowed) rather than a bare class name — the
    /// exchange segment is prepended automatically in `publish_envelope`.
    async fn subscribe(
        &self,
        message_class: &str,
        handler_id: HandlerId,
        filter: Filter,
    ) -> Result<SubscriptionId> {
        let pattern = message_class.to_string();
        let (tx, rx) = mpsc::channel::<Envelope>(self.config.max_queue_size);
        let subscription_id = SubscriptionId::new();
        {
            let this = self;
            this.bindings
                .lock()
                .entry(pattern.clone())
                .or_default()
                .push(Binding {
                    subscription_id: subscription_id.clone(),
                    handler_id,
                    pattern: pattern.clone(),
                    filter: filter.clone(),
                    queue_tx: tx,
                });
        }
        if let Some(arc_self) = self.self_handle.upgrade() {
            arc_self.spawn_consumer(pattern, rx, filter);
        }
        Ok(subscription_id)
    }

    async fn unsubscribe(&self, message_class: &str, handler_id: &HandlerId) -> Result<()> {
        if let Some(bindings) = self.bindings.lock().get_mut(message_class) {
            bindings.retain(|b| &b.handler_id != handler_id);
        }
        Ok(())
    }

    async fn unsubscribe_all(&self, message_class: &str) -> Result<()> {
        self.bindings.lock().remove(message_class);
        Ok(())
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);
        Ok(())
    }
}

impl BrokerTransport {
    /// Publish a fully-formed envelope, matching it against every bound
    /// pattern's routing key (spec.md §4.6 routing key matching).
    pub async fn publish_envelope(&self, header: Header, payload: Vec<u8>) -> Result<()> {
        let routing_key = build_routing_key(
            &self.config.exchange_name,
            &header.message_class,
            &header.from,
            header.to.as_deref().unwrap_or(""),
        );
        let bindings = self.bindings.lock();
        let exchange_segment = sanitize_segment(&self.config.exchange_name);
        for (pattern, bound) in bindings.iter() {
            let full_pattern = format!("{exchange_segment}.{pattern}");
            if !matches(&routing_key, &full_pattern) {
                continue;
            }
            for binding in bound {
                let envelope = Envelope {
                    header: header.clone(),
                    payload: payload.clone(),
                };
                if binding.queue_tx.try_send(envelope).is_err() {
                    tracing::warn!(
                        queue = %binding.pattern,
                        subscription = %binding.subscription_id.0,
                        "broker queue full, dropping message"
                    );
                }
            }
        }
        Ok(())
    }
}
