//! Message bus abstraction over a topic-based broker.
//!
//! Provides topic publish, per-group subscriptions with typed handlers, and a
//! correlation-ID request/response helper for synchronous-style queries over
//! an asynchronous transport.
//!
//! Two transports implement [`Broker`]: [`NatsBroker`] (JetStream, durable,
//! shared between processes) and [`InMemoryBroker`] (tests and single-process
//! runs).
//!
//! The bus has an explicit lifecycle: `initialize` must succeed before any
//! publish or subscribe, and `disconnect` tears everything down again.

pub mod broker;
pub mod bus;
pub mod error;
pub mod handler;
pub mod memory;
pub mod nats;
pub mod request;

pub use broker::{Acknowledger, Broker, Delivery, Record, RecordSink, TopicConfig};
pub use bus::{MessageBus, MessageBusConfig};
pub use error::{MessageBusError, Result};
pub use handler::{HandlerError, HandlerResult, InboundMessage, MessageHandler, handler_fn};
pub use memory::InMemoryBroker;
pub use nats::{NatsBroker, NatsConfig};
pub use request::{CORRELATION_ID_FIELD, ResponseRequest};
