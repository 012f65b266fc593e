//! Strongly-typed message bus: pluggable transports, per-handler dispatch
//! with deduplication and circuit-breaker protection, and a dead-letter
//! queue with replay.
//!
//! See each module's doc comment for the corresponding piece of the design
//! (header/serializer/filter for the wire contract, ddq/circuit/dlq for the
//! reliability primitives, transport/dispatcher for the routing pipeline).

pub mod circuit;
pub mod config;
pub mod ddq;
pub mod dispatcher;
pub mod dlq;
pub mod error;
pub mod filter;
pub mod header;
pub mod message;
pub mod serializer;
pub mod stats;
pub mod transport;

pub use config::{global, load, reset_global, set_global, GlobalConfig};
pub use ddq::{Ddq, DdqBackend, DdqConfig, DdqStats};
pub use dispatcher::Dispatcher;
pub use dlq::{DeadLetterQueue, DlqRecord, DlqStatistics};
pub use error::{Error, Result};
pub use filter::{Acceptor, Broadcast, Filter};
pub use header::Header;
pub use message::{Message, MessageDescriptor, PropertyConstraint, Validator};
pub use serializer::{JsonSerializer, Serializer, SerializerRegistry};
pub use stats::Statistics;
pub use transport::{HandlerId, PublishOutcome, SubscriptionId, Transport, TransportRegistry};
