//! Messaging layer for saga orchestration.
//!
//! Provides the wire envelope ([`Message`] and [`Headers`]), the type registry
//! used to (de)serialize payloads, the [`Publisher`] that stamps causal
//! metadata on outbound messages, the [`Subscriber`] that routes inbound
//! messages to receivers, the command/event dispatchers, and the
//! transactional [`Outbox`] middleware.

pub mod dispatcher;
pub mod error;
pub mod headers;
pub mod marshaller;
pub mod memory;
pub mod message;
pub mod outbox;
pub mod payload;
pub mod publisher;
pub mod receiver;
pub mod subscriber;
pub mod transport;

pub use common::RequestContext;
pub use dispatcher::{
    CommandDispatcher, CommandHandler, CommandMessage, EntityEventDispatcher, EntityEventHandler,
    EntityEventMessage, EventDispatcher, EventHandler, EventMessage,
};
pub use error::{BoxError, MsgError, Result};
pub use headers::Headers;
pub use marshaller::{JsonMarshaller, Marshaller, TypeRegistry, TypeRegistryBuilder};
pub use memory::{BrokerConfig, InMemoryBroker};
pub use message::Message;
pub use outbox::{Outbox, Transactor};
pub use payload::{
    Command, DomainCommand, DomainEvent, Entity, Event, Failure, Named, Payload, Reply,
    ReplyMessage, Success,
};
pub use publisher::Publisher;
pub use receiver::{MessageReceiver, Middleware, TransactionalReceiver, receiver_fn};
pub use subscriber::Subscriber;
pub use transport::{Consumer, Dispatch, Producer};
