use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use common::RequestContext;

use super::decode_payload;
use crate::headers::MESSAGE_EVENT_NAME;
use crate::payload::{Event, Payload};
use crate::receiver::{MessageReceiver, TransactionalReceiver};
use crate::{BoxError, Headers, Message, MsgError, Result, TypeRegistry};

/// A decoded event and the headers of the message that carried it.
#[derive(Debug)]
pub struct EventMessage {
    event: Box<dyn Payload>,
    headers: Headers,
}

impl EventMessage {
    pub fn new(event: Box<dyn Payload>, headers: Headers) -> Self {
        Self { event, headers }
    }

    pub fn event(&self) -> &dyn Payload {
        self.event.as_ref()
    }

    pub fn event_as<E: Payload>(&self) -> Option<&E> {
        self.event.downcast_ref::<E>()
    }

    pub fn event_name(&self) -> &'static str {
        self.event.payload_name()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }
}

#[async_trait]
pub trait EventHandler<S = ()>: Send + Sync {
    async fn handle(
        &self,
        scope: &mut S,
        ctx: &RequestContext,
        event: EventMessage,
    ) -> std::result::Result<(), BoxError>;
}

struct FnEventHandler<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<S, F, Fut> EventHandler<S> for FnEventHandler<F, Fut>
where
    S: Send,
    F: Fn(RequestContext, EventMessage) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), BoxError>> + Send,
{
    async fn handle(
        &self,
        _scope: &mut S,
        ctx: &RequestContext,
        event: EventMessage,
    ) -> std::result::Result<(), BoxError> {
        (self.f)(ctx.clone(), event).await
    }
}

/// Receives events by `event-name`. Handler errors are returned so the
/// message is redelivered.
pub struct EventDispatcher<S = ()> {
    registry: Arc<TypeRegistry>,
    handlers: HashMap<&'static str, Arc<dyn EventHandler<S>>>,
}

impl<S: Send + 'static> EventDispatcher<S> {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        tracing::info!("EventDispatcher constructed");
        Self {
            registry,
            handlers: HashMap::new(),
        }
    }

    pub fn handle<E: Event>(mut self, handler: impl EventHandler<S> + 'static) -> Self {
        tracing::info!(event_name = E::NAME, "Event handler added");
        self.handlers.insert(E::NAME, Arc::new(handler));
        self
    }

    pub fn handle_fn<E, F, Fut>(self, f: F) -> Self
    where
        E: Event,
        F: Fn(RequestContext, EventMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.handle::<E>(FnEventHandler {
            f,
            _marker: PhantomData,
        })
    }

    async fn dispatch(&self, scope: &mut S, ctx: &RequestContext, message: &Message) -> Result<()> {
        let event_name = match message.headers().get_required(MESSAGE_EVENT_NAME) {
            Ok(name) => name,
            Err(e) => {
                tracing::error!(message_id = message.id(), error = %e, "Failed to read event name");
                return Ok(());
            }
        };

        let Some(handler) = self.handlers.get(event_name) else {
            tracing::debug!(event_name, message_id = message.id(), "No event handler");
            return Ok(());
        };

        let Some(event) = decode_payload(&self.registry, event_name, message) else {
            return Ok(());
        };

        handler
            .handle(scope, ctx, EventMessage::new(event, message.headers().clone()))
            .await
            .map_err(|e| {
                tracing::error!(event_name, error = %e, "Event handler returned an error");
                MsgError::Handler(e)
            })
    }
}

#[async_trait]
impl<S: Send + 'static> TransactionalReceiver<S> for EventDispatcher<S> {
    async fn receive_in_transaction(
        &self,
        scope: &mut S,
        ctx: &RequestContext,
        message: &Message,
    ) -> Result<()> {
        self.dispatch(scope, ctx, message).await
    }
}

#[async_trait]
impl MessageReceiver for EventDispatcher {
    async fn receive_message(&self, ctx: &RequestContext, message: &Message) -> Result<()> {
        self.dispatch(&mut (), ctx, message).await
    }
}
