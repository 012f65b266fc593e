//! In-process transport: a bounded ring of published envelopes, optionally
//! auto-routed to the dispatcher on publish (spec.md §4.6 "Memory").

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::circuit::CircuitRegistry;
use crate::config::MemoryTransportConfig;
use crate::error::Result;
use crate::filter::Filter;
use crate::header::Header;
use crate::message::{self, Message};
use crate::serializer::{Serializer, SerializerRegistry};

use super::{HandlerId, RouteFn, SubscriptionId, Transport};

/// One stored envelope (spec.md §3, transport-agnostic encoded form).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub header: Header,
    pub payload: Vec<u8>,
}

struct Subscription {
    handler_id: HandlerId,
    filter: Filter,
}

/// Memory transport: stores published messages in a bounded in-process
/// list; with `auto_process` on, synchronously routes to the dispatcher.
pub struct MemoryTransport {
    config: MemoryTransportConfig,
    messages: Mutex<Vec<StoredMessage>>,
    subscriptions: Mutex<std::collections::HashMap<String, Vec<Subscription>>>,
    router: RwLock<Option<RouteFn>>,
    circuits: CircuitRegistry,
    connected: std::sync::atomic::AtomicBool,
    serializers: SerializerRegistry,
}

impl MemoryTransport {
    pub fn new(config: MemoryTransportConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            messages: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(std::collections::HashMap::new()),
            router: RwLock::new(None),
            circuits: CircuitRegistry::new(),
            connected: std::sync::atomic::AtomicBool::new(true),
            serializers: SerializerRegistry::new(),
        })
    }

    pub fn all_messages(&self) -> Vec<StoredMessage> {
        self.messages.lock().clone()
    }

    pub fn message_count(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn clear(&self) {
        self.messages.lock().clear();
    }

    /// Route every stored message through the dispatcher, applying each
    /// matching subscription's filter (used when `auto_process` is off).
    pub async fn process_all(&self) -> Result<()> {
        let messages = self.messages.lock().clone();
        for stored in messages {
            self.route_one(&stored).await?;
        }
        Ok(())
    }

    async fn route_one(&self, stored: &StoredMessage) -> Result<()> {
        let router = self.router.read().clone();
        let Some(router) = router else {
            return Ok(());
        };
        let matched = {
            let subs = self.subscriptions.lock();
            subs.get(&stored.header.message_class)
                .map(|class_subs| {
                    class_subs
                        .iter()
                        .any(|s| s.filter.matches(&stored.header))
                })
                .unwrap_or(false)
        };
        if !matched {
            return Ok(());
        }
        let serializer = self.serializers.resolve(&stored.header.serializer)?;
        let payload: serde_json::Value = serializer.decode(&stored.payload)?;
        let instance = message::construct(stored.header.clone(), payload)?;
        router(instance).await;
        Ok(())
    }

    /// Store (and, if `auto_process`, route) a fully-formed envelope. This
    /// is the entry point publishers should use — it carries the real
    /// header so filters can evaluate `from`/`to`/`broadcast` without a
    /// decode round trip. `Transport::do_publish` (bytes only, per the
    /// trait contract) stamps a minimal synthetic header when called
    /// directly.
    pub async fn publish_envelope(&self, header: Header, payload: Vec<u8>) -> Result<()> {
        let stored = StoredMessage {
            header: header.clone(),
            payload,
        };
        {
            let mut messages = self.messages.lock();
            if messages.len() >= self.config.max_messages {
                messages.remove(0);
            }
            messages.push(stored.clone());
        }
        if self.config.auto_process {
            self.route_one(&stored).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
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

    async fn subscribe(
        &self,
        message_class: &str,
        handler_id: HandlerId,
        filter: Filter,
    ) -> Result<SubscriptionId> {
        let id = SubscriptionId::new();
        self.subscriptions
            .lock()
            .entry(message_class.to_string())
            .or_default()
            .push(Subscription { handler_id, filter });
        Ok(id)
    }

    async fn unsubscribe(&self, message_class: &str, handler_id: &HandlerId) -> Result<()> {
        if let Some(subs) = self.subscriptions.lock().get_mut(message_class) {
            subs.retain(|s| &s.handler_id != handler_id);
        }
        Ok(())
    }

    async fn unsubscribe_all(&self, message_class: &str) -> Result<()> {
        self.subscriptions.lock().remove(message_class);
        Ok(())
    }

    fn connected(&self) -> bool {
        self.connected.load(std::sync::atomic::Ordering::Relaxed)
    }

    async fn connect(&self) -> Result<()> {
        self.connected
            .store(true, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected
            .store(false, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo {
        header: Header,
        value: i64,
    }

    impl Message for Echo {
        fn class_name(&self) -> &'static str {
            "Echo"
        }
        fn header(&self) -> &Header {
            &self.header
        }
        fn header_mut(&mut self) -> &mut Header {
            &mut self.header
        }
        fn payload(&self) -> serde_json::Value {
            json!({ "value": self.value })
        }
    }

    fn register_echo() {
        message::register(
            crate::message::MessageDescriptor::builder("Echo")
                .version(1)
                .constructor(|header, payload| {
                    let value = payload.get("value").and_then(|v| v.as_i64()).unwrap_or(0);
                    Ok(Arc::new(Echo { header, value }))
                })
                .build(),
        );
    }

    #[tokio::test]
    async fn publish_without_subscription_is_noop() {
        register_echo();
        let transport = MemoryTransport::new(MemoryTransportConfig::default());
        let header = Header::new("Echo", "svc-a", 1);
        transport
            .publish_envelope(header, serde_json::to_vec(&json!({"value": 1})).unwrap())
            .await
            .unwrap();
        assert_eq!(transport.message_count(), 1);
    }

    #[tokio::test]
    async fn auto_process_routes_to_subscriber() {
        register_echo();
        let transport = MemoryTransport::new(MemoryTransportConfig::default());
        let routed = Arc::new(Mutex::new(Vec::<i64>::new()));
        let routed2 = routed.clone();
        transport.set_router(Arc::new(move |msg| {
            let routed = routed2.clone();
            Box::pin(async move {
                let v = msg
                    .payload()
                    .get("value")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(-1);
                routed.lock().push(v);
            })
        }));
        transport
            .subscribe("Echo", HandlerId::Named("h1".into()), Filter::new())
            .await
            .unwrap();
        transport
            .publish_envelope(
                Header::new("Echo", "svc-a", 1),
                serde_json::to_vec(&json!({"value": 42})).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(*routed.lock(), vec![42]);
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        register_echo();
        let transport = MemoryTransport::new(MemoryTransportConfig {
            max_messages: 2,
            auto_process: false,
        });
        for i in 0..3 {
            transport
                .publish_envelope(
                    Header::new("Echo", "svc-a", 1),
                    serde_json::to_vec(&json!({"value": i})).unwrap(),
                )
                .await
                .unwrap();
        }
        assert_eq!(transport.message_count(), 2);
    }

    #[tokio::test]
    async fn unsubscribe_stops_routing() {
        register_echo();
        let transport = MemoryTransport::new(MemoryTransportConfig::default());
        let routed = Arc::new(Mutex::new(0));
        let routed2 = routed.clone();
        transport.set_router(Arc::new(move |_msg| {
            let routed = routed2.clone();
            Box::pin(async move {
                *routed.lock() += 1;
            })
        }));
        let handler = HandlerId::Named("h1".into());
        transport
            .subscribe("Echo", handler.clone(), Filter::new())
            .await
            .unwrap();
        transport.unsubscribe("Echo", &handler).await.unwrap();
        transport
            .publish_envelope(
                Header::new("Echo", "svc-a", 1),
                serde_json::to_vec(&json!({"value": 1})).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(*routed.lock(), 0);
    }
}
