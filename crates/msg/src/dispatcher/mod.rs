//! Type-name routed receivers for commands, events and entity events.
//!
//! Each dispatcher is a table from payload name to handler. Messages
//! without a routing header, without a registered handler, or whose payload
//! cannot be decoded are logged and acknowledged, never retried.
//!
//! Dispatchers are generic over a scope `S`, the transaction opened by an
//! [`Outbox`](crate::Outbox), which is handed to handlers as `&mut S`. With
//! the default `S = ()` a dispatcher is an ordinary
//! [`MessageReceiver`](crate::MessageReceiver).

mod command;
mod entity_event;
mod event;

pub use command::{
    CommandDispatcher, CommandHandler, CommandMessage, correlation_headers, publish_replies,
};
pub use entity_event::{EntityEventDispatcher, EntityEventHandler, EntityEventMessage};
pub use event::{EventDispatcher, EventHandler, EventMessage};

use crate::payload::Payload;
use crate::{Message, TypeRegistry};

/// Decodes the payload of `message` registered under `name`, logging and
/// returning `None` when it cannot be decoded.
pub(crate) fn decode_payload(
    registry: &TypeRegistry,
    name: &str,
    message: &Message,
) -> Option<Box<dyn Payload>> {
    match registry.deserialize(name, message.payload()) {
        Ok(payload) => Some(payload),
        Err(e) => {
            tracing::error!(
                payload_name = name,
                message_id = message.id(),
                error = %e,
                "Failed to decode message payload"
            );
            None
        }
    }
}
