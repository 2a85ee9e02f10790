//! Domain values carried as message payloads.
//!
//! Concrete commands, events and replies implement [`Named`] plus one of the
//! marker traits ([`Command`], [`Event`], [`Reply`]). Once boxed they travel
//! as `Box<dyn Payload>`, and receivers recover the concrete type with
//! [`downcast_ref`](trait.Payload.html#method.downcast_ref).

use std::any::Any;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::Headers;
use crate::headers::{MESSAGE_REPLY_OUTCOME, REPLY_OUTCOME_FAILURE, REPLY_OUTCOME_SUCCESS};

/// A value with a stable wire name used for routing and registry lookup.
pub trait Named {
    const NAME: &'static str;
}

/// Object-safe view over any named, serializable value.
pub trait Payload: Any + Send + Sync + fmt::Debug {
    /// The stable wire name of the concrete type.
    fn payload_name(&self) -> &'static str;

    /// Converts the value into the self-describing tree handed to a
    /// [`Marshaller`](crate::Marshaller).
    fn to_value(&self) -> serde_json::Result<serde_json::Value>;

    fn as_any(&self) -> &dyn Any;
}

impl<T> Payload for T
where
    T: Named + Serialize + fmt::Debug + Send + Sync + 'static,
{
    fn payload_name(&self) -> &'static str {
        T::NAME
    }

    fn to_value(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl<'a> dyn Payload + 'a {
    /// Returns the concrete value if it is a `T`.
    pub fn downcast_ref<T: Payload>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// An instruction sent to one service, expecting a reply.
pub trait Command: Named + Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static {}

/// A fact broadcast to any interested service.
pub trait Event: Named + Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static {}

/// The answer to a command.
pub trait Reply: Named + Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static {}

/// Generic successful reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Success;

impl Named for Success {
    const NAME: &'static str = "msg.Success";
}

impl Reply for Success {}

/// Generic failed reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure;

impl Named for Failure {
    const NAME: &'static str = "msg.Failure";
}

impl Reply for Failure {}

/// An outbound command and the channel it should be delivered to.
///
/// When `destination_channel` is `None` the caller must supply the channel
/// through headers, otherwise publishing fails.
#[derive(Debug)]
pub struct DomainCommand {
    command: Box<dyn Payload>,
    pub destination_channel: Option<String>,
}

impl DomainCommand {
    pub fn new(command: impl Command) -> Self {
        Self {
            command: Box::new(command),
            destination_channel: None,
        }
    }

    /// Sets the channel the command is sent to.
    pub fn to_channel(mut self, channel: impl Into<String>) -> Self {
        self.destination_channel = Some(channel.into());
        self
    }

    pub fn command(&self) -> &dyn Payload {
        self.command.as_ref()
    }

    pub fn command_name(&self) -> &'static str {
        self.command.payload_name()
    }
}

/// An outbound event and the channel it should be delivered to.
#[derive(Debug)]
pub struct DomainEvent {
    event: Box<dyn Payload>,
    pub destination_channel: Option<String>,
}

impl DomainEvent {
    pub fn new(event: impl Event) -> Self {
        Self {
            event: Box::new(event),
            destination_channel: None,
        }
    }

    pub fn to_channel(mut self, channel: impl Into<String>) -> Self {
        self.destination_channel = Some(channel.into());
        self
    }

    pub fn event(&self) -> &dyn Payload {
        self.event.as_ref()
    }

    pub fn event_name(&self) -> &'static str {
        self.event.payload_name()
    }
}

/// An entity whose pending events are published together.
///
/// Events are published on the channel named after the entity unless
/// [`destination_channel`](Entity::destination_channel) says otherwise.
pub trait Entity: Send + Sync {
    fn entity_id(&self) -> String;

    fn entity_name(&self) -> &str;

    fn events(&self) -> &[DomainEvent];

    fn destination_channel(&self) -> Option<&str> {
        None
    }
}

/// A reply together with the headers it is published with, such as its
/// outcome.
#[derive(Debug)]
pub struct ReplyMessage {
    reply: Box<dyn Payload>,
    headers: Headers,
}

impl ReplyMessage {
    /// Wraps a reply with the given headers.
    pub fn new(reply: impl Reply, headers: Headers) -> Self {
        Self::from_parts(Box::new(reply), headers)
    }

    pub fn from_parts(reply: Box<dyn Payload>, headers: Headers) -> Self {
        Self { reply, headers }
    }

    /// A reply reporting a successful outcome.
    pub fn success(reply: impl Reply) -> Self {
        Self::new(
            reply,
            Headers::from([(MESSAGE_REPLY_OUTCOME, REPLY_OUTCOME_SUCCESS)]),
        )
    }

    /// A reply reporting a failed outcome.
    pub fn failure(reply: impl Reply) -> Self {
        Self::new(
            reply,
            Headers::from([(MESSAGE_REPLY_OUTCOME, REPLY_OUTCOME_FAILURE)]),
        )
    }

    /// The generic [`Success`] reply.
    pub fn with_success() -> Self {
        Self::success(Success)
    }

    /// The generic [`Failure`] reply.
    pub fn with_failure() -> Self {
        Self::failure(Failure)
    }

    pub fn reply(&self) -> &dyn Payload {
        self.reply.as_ref()
    }

    pub fn reply_name(&self) -> &'static str {
        self.reply.payload_name()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }
}
