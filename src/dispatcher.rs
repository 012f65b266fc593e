//! Dispatcher: subscription catalog, filter evaluation, per-handler DDQ,
//! worker-pool dispatch with circuit-breaker protection, DLQ forwarding on
//! failure (spec.md §4.7).
//!
//! Grounded on `visual-queue-manager/src/engine/dispatcher.rs`'s handler
//! iteration + circuit-breaker gate + DLQ decision, adapted from "iterate
//! handlers until one succeeds" to "submit a task per matching
//! subscription, no cross-handler short-circuiting" (spec.md §4.7).

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use crate::circuit::{CircuitExecError, CircuitRegistry};
use crate::config::CircuitConfig;
use crate::ddq::{Ddq, DdqConfig};
use crate::dlq::{DeadLetterQueue, DlqEnqueue};
use crate::error::Result;
use crate::filter::Filter;
use crate::header::Header;
use crate::message::{self, Message};
use crate::stats::Statistics;
use crate::transport::{HandlerId, RouteFn};

/// A callable registered under a generated [`HandlerId::Callback`] id.
pub type HandlerFn =
    Arc<dyn Fn(Arc<dyn Message>) -> futures::future::BoxFuture<'static, std::result::Result<(), String>>
        + Send
        + Sync>;

struct Subscription {
    handler_id: HandlerId,
    filter: Filter,
    ddq: Option<Arc<dyn Ddq>>,
}

/// Subscription catalog + worker pool + per-message-class statistics
/// (spec.md §4.7 "State").
pub struct Dispatcher {
    subscriptions: DashMap<String, Vec<Subscription>>,
    callbacks: DashMap<u64, HandlerFn>,
    named_handlers: DashMap<String, HandlerFn>,
    next_callback_id: std::sync::atomic::AtomicU64,
    circuits: CircuitRegistry,
    stats: Statistics,
    dlq: Option<Arc<DeadLetterQueue>>,
    ddq_config: DdqConfig,
    dedup_enabled_classes: dashmap::DashSet<String>,
}

impl Dispatcher {
    pub fn new(dlq: Option<Arc<DeadLetterQueue>>, ddq_config: DdqConfig) -> Arc<Self> {
        Arc::new(Self {
            subscriptions: DashMap::new(),
            callbacks: DashMap::new(),
            named_handlers: DashMap::new(),
            next_callback_id: std::sync::atomic::AtomicU64::new(1),
            circuits: CircuitRegistry::new(),
            stats: Statistics::new(),
            dlq,
            ddq_config,
            dedup_enabled_classes: dashmap::DashSet::new(),
        })
    }

    pub fn stats(&self) -> &Statistics {
        &self.stats
    }

    /// A [`RouteFn`] closure bound to this dispatcher, to install into a
    /// transport via `Transport::set_router`.
    pub fn as_route_fn(self: &Arc<Self>) -> RouteFn {
        let dispatcher = self.clone();
        Arc::new(move |message| {
            let dispatcher = dispatcher.clone();
            Box::pin(async move {
                dispatcher.route(message).await;
            })
        })
    }

    /// Register a named handler resolved at invocation time by
    /// `HandlerId::Named`.
    pub fn register_named(&self, name: impl Into<String>, handler: HandlerFn) {
        self.named_handlers.insert(name.into(), handler);
    }

    /// Register a callback and return the `HandlerId` to subscribe with.
    pub fn register_callback(&self, handler: HandlerFn) -> HandlerId {
        let id = self
            .next_callback_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.callbacks.insert(id, handler);
        HandlerId::Callback(id)
    }

    /// Enable per-handler deduplication for every subscription added to
    /// `message_class` from this point on.
    pub fn enable_dedup_for(&self, message_class: &str) {
        self.dedup_enabled_classes.insert(message_class.to_string());
    }

    /// Add a subscription, allocating a DDQ handle if dedup is enabled for
    /// the class (spec.md §4.7 `add`).
    pub fn add(&self, message_class: &str, handler_id: HandlerId, filter: Filter) {
        let ddq = if self.dedup_enabled_classes.contains(message_class) {
            Some(self.ddq_config.build())
        } else {
            None
        };
        self.subscriptions
            .entry(message_class.to_string())
            .or_default()
            .push(Subscription {
                handler_id,
                filter,
                ddq,
            });
    }

    /// Remove a single handler's subscription from `message_class`.
    pub fn drop_handler(&self, message_class: &str, handler_id: &HandlerId) {
        if let Some(mut subs) = self.subscriptions.get_mut(message_class) {
            subs.retain(|s| &s.handler_id != handler_id);
        }
    }

    /// Remove every subscription for `message_class`.
    pub fn drop_all(&self, message_class: &str) {
        self.subscriptions.remove(message_class);
    }

    fn resolve_handler(&self, handler_id: &HandlerId) -> Option<HandlerFn> {
        match handler_id {
            HandlerId::Named(name) => self.named_handlers.get(name).map(|e| e.clone()),
            HandlerId::Callback(id) => self.callbacks.get(id).map(|e| e.clone()),
        }
    }

    /// Route a decoded message to every matching subscription (spec.md
    /// §4.7 `route`).
    pub async fn route(self: &Arc<Self>, message: Arc<dyn Message>) {
        let class = message.class_name().to_string();
        let Some(subs) = self.subscriptions.get(&class) else {
            self.stats.incr(&[class.as_str(), "no_subscribers"]);
            tracing::warn!(message_class = %class, "no subscribers for message class");
            return;
        };

        // Snapshot the subscription list up front rather than re-indexing
        // the live DashMap entry per iteration: a concurrent add/drop
        // shifting the backing Vec must not skip or duplicate a handler
        // that was already a valid subscriber when route() started.
        let snapshot: Vec<(HandlerId, Filter, Option<Arc<dyn Ddq>>)> = subs
            .iter()
            .map(|sub| (sub.handler_id.clone(), sub.filter.clone(), sub.ddq.clone()))
            .collect();
        drop(subs);

        if let Err(e) = message.validate() {
            self.stats.incr(&[class.as_str(), "validation_failed"]);
            tracing::warn!(message_class = %class, error = %e, "rejecting message: validation failed");
            self.forward_failure(&message, &e.to_string(), "validation").await;
            return;
        }

        for (handler_id, filter, ddq) in snapshot {
            if !filter.matches(message.header()) {
                self.stats.incr(&[class.as_str(), "filtered"]);
                continue;
            }

            if let Some(ddq) = &ddq {
                if ddq.contains(&message.header().uuid).await {
                    self.stats.incr(&[class.as_str(), "deduplicated"]);
                    continue;
                }
            }

            let dispatcher = self.clone();
            let message = message.clone();
            let handler_id_for_task = handler_id.clone();
            let ddq_for_task = ddq.clone();
            tokio::spawn(async move {
                dispatcher
                    .invoke(message, handler_id_for_task, ddq_for_task)
                    .await;
            });
        }
    }

    async fn invoke(self: Arc<Self>, message: Arc<dyn Message>, handler_id: HandlerId, ddq: Option<Arc<dyn Ddq>>) {
        let class = message.class_name().to_string();
        let circuit = self
            .circuits
            .get_or_create("message_processor", CircuitConfig::default());

        let Some(handler) = self.resolve_handler(&handler_id) else {
            tracing::error!(handler = %handler_id, "unresolved handler identifier");
            self.forward_failure(&message, "unresolved handler identifier", &handler_id)
                .await;
            return;
        };

        let outcome = circuit
            .execute({
                let message = message.clone();
                handler(message)
            })
            .await;

        match outcome {
            Ok(()) => {
                if let Some(ddq) = &ddq {
                    ddq.add(&message.header().uuid).await;
                }
                self.stats.incr(&[class.as_str(), "routed"]);
            }
            Err(CircuitExecError::Open(marker)) => {
                self.stats.incr(&[class.as_str(), "failed"]);
                self.forward_failure(
                    &message,
                    &format!("circuit '{}' open", marker.circuit),
                    &handler_id,
                )
                .await;
            }
            Err(CircuitExecError::Inner(handler_error)) => {
                self.stats.incr(&[class.as_str(), "failed"]);
                self.forward_failure(&message, &handler_error, &handler_id)
                    .await;
            }
        }
    }

    async fn forward_failure(
        &self,
        message: &Arc<dyn Message>,
        error: &str,
        handler_id: impl std::fmt::Display,
    ) {
        let Some(dlq) = &self.dlq else {
            tracing::error!(error, handler = %handler_id, "handler failed and no DLQ configured");
            return;
        };
        let payload = serde_json::to_string(&message.payload()).unwrap_or_default();
        if let Err(e) = dlq.enqueue(DlqEnqueue {
            header: message.header().clone(),
            payload,
            error,
            retry_count: 0,
            transport: "dispatcher",
            stack_trace: None,
        }) {
            tracing::error!(error = %e, "failed to enqueue handler failure to DLQ");
        }
    }
}

/// Decode raw bytes and construct a typed message, for transports that
/// only have bytes + header at the receive boundary.
pub fn decode_and_construct(header: Header, payload: Value) -> Result<Arc<dyn Message>> {
    message::construct(header, payload)
}
