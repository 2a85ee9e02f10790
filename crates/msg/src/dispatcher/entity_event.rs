use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use common::RequestContext;

use super::decode_payload;
use crate::headers::{MESSAGE_EVENT_ENTITY_ID, MESSAGE_EVENT_ENTITY_NAME, MESSAGE_EVENT_NAME};
use crate::payload::{Event, Payload};
use crate::receiver::{MessageReceiver, TransactionalReceiver};
use crate::{BoxError, Headers, Message, MsgError, Result, TypeRegistry};

/// A decoded event together with the entity that emitted it.
#[derive(Debug)]
pub struct EntityEventMessage {
    entity_id: String,
    entity_name: String,
    event: Box<dyn Payload>,
    headers: Headers,
}

impl EntityEventMessage {
    pub fn new(
        entity_id: impl Into<String>,
        entity_name: impl Into<String>,
        event: Box<dyn Payload>,
        headers: Headers,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            entity_name: entity_name.into(),
            event,
            headers,
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
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
pub trait EntityEventHandler<S = ()>: Send + Sync {
    async fn handle(
        &self,
        scope: &mut S,
        ctx: &RequestContext,
        event: EntityEventMessage,
    ) -> std::result::Result<(), BoxError>;
}

struct FnEntityEventHandler<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<S, F, Fut> EntityEventHandler<S> for FnEntityEventHandler<F, Fut>
where
    S: Send,
    F: Fn(RequestContext, EntityEventMessage) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), BoxError>> + Send,
{
    async fn handle(
        &self,
        _scope: &mut S,
        ctx: &RequestContext,
        event: EntityEventMessage,
    ) -> std::result::Result<(), BoxError> {
        (self.f)(ctx.clone(), event).await
    }
}

/// Receives events published with
/// [`Publisher::publish_entity_events`](crate::Publisher::publish_entity_events).
///
/// Besides `event-name`, messages must carry the entity name and id headers.
pub struct EntityEventDispatcher<S = ()> {
    registry: Arc<TypeRegistry>,
    handlers: HashMap<&'static str, Arc<dyn EntityEventHandler<S>>>,
}

impl<S: Send + 'static> EntityEventDispatcher<S> {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        tracing::info!("EntityEventDispatcher constructed");
        Self {
            registry,
            handlers: HashMap::new(),
        }
    }

    pub fn handle<E: Event>(mut self, handler: impl EntityEventHandler<S> + 'static) -> Self {
        tracing::info!(event_name = E::NAME, "Entity event handler added");
        self.handlers.insert(E::NAME, Arc::new(handler));
        self
    }

    pub fn handle_fn<E, F, Fut>(self, f: F) -> Self
    where
        E: Event,
        F: Fn(RequestContext, EntityEventMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.handle::<E>(FnEntityEventHandler {
            f,
            _marker: PhantomData,
        })
    }

    async fn dispatch(&self, scope: &mut S, ctx: &RequestContext, message: &Message) -> Result<()> {
        let headers = message.headers();
        let routing = headers.get_required(MESSAGE_EVENT_NAME).and_then(|event_name| {
            Ok((
                event_name,
                headers.get_required(MESSAGE_EVENT_ENTITY_NAME)?,
                headers.get_required(MESSAGE_EVENT_ENTITY_ID)?,
            ))
        });
        let (event_name, entity_name, entity_id) = match routing {
            Ok(routing) => routing,
            Err(e) => {
                tracing::error!(message_id = message.id(), error = %e, "Failed to read entity event headers");
                return Ok(());
            }
        };

        let Some(handler) = self.handlers.get(event_name) else {
            tracing::debug!(event_name, entity_name, "No entity event handler");
            return Ok(());
        };

        let Some(event) = decode_payload(&self.registry, event_name, message) else {
            return Ok(());
        };

        let event = EntityEventMessage::new(entity_id, entity_name, event, headers.clone());
        handler.handle(scope, ctx, event).await.map_err(|e| {
            tracing::error!(
                event_name,
                entity_name,
                entity_id,
                error = %e,
                "Entity event handler returned an error"
            );
            MsgError::Handler(e)
        })
    }
}

#[async_trait]
impl<S: Send + 'static> TransactionalReceiver<S> for EntityEventDispatcher<S> {
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
impl MessageReceiver for EntityEventDispatcher {
    async fn receive_message(&self, ctx: &RequestContext, message: &Message) -> Result<()> {
        self.dispatch(&mut (), ctx, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{DomainEvent, Entity, Named};
    use crate::{InMemoryBroker, Publisher};
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;

    #[derive(Debug, Serialize, Deserialize)]
    struct TicketCreated {
        seat: String,
    }

    impl Named for TicketCreated {
        const NAME: &'static str = "kitchen.TicketCreated";
    }

    impl Event for TicketCreated {}

    struct Ticket {
        events: Vec<DomainEvent>,
    }

    impl Entity for Ticket {
        fn entity_id(&self) -> String {
            "t-9".into()
        }

        fn entity_name(&self) -> &str {
            "kitchen.Ticket"
        }

        fn events(&self) -> &[DomainEvent] {
            &self.events
        }
    }

    #[tokio::test]
    async fn test_handler_receives_entity_identity() {
        let broker = InMemoryBroker::new();
        let registry = TypeRegistry::builder()
            .register_event::<TicketCreated>()
            .build();
        let publisher = Publisher::new(Arc::new(broker.clone()), registry.clone());
        let ticket = Ticket {
            events: vec![DomainEvent::new(TicketCreated { seat: "4A".into() })],
        };
        publisher
            .publish_entity_events(&RequestContext::new(), &ticket, &Headers::new())
            .await
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let dispatcher: EntityEventDispatcher = {
            let seen = seen.clone();
            EntityEventDispatcher::new(registry).handle_fn::<TicketCreated, _, _>(
                move |_ctx, event| {
                    let seen = seen.clone();
                    async move {
                        let created = event.event_as::<TicketCreated>().ok_or("wrong event")?;
                        seen.lock().unwrap().push(format!(
                            "{}/{}/{}",
                            event.entity_name(),
                            event.entity_id(),
                            created.seat
                        ));
                        Ok::<_, BoxError>(())
                    }
                },
            )
        };

        for message in broker.sent_to("kitchen.Ticket").await {
            dispatcher
                .receive_message(&RequestContext::new(), &message)
                .await
                .unwrap();
        }

        assert_eq!(*seen.lock().unwrap(), vec!["kitchen.Ticket/t-9/4A"]);
    }

    #[tokio::test]
    async fn test_missing_entity_headers_are_dropped() {
        let registry = TypeRegistry::builder()
            .register_event::<TicketCreated>()
            .build();
        let dispatcher: EntityEventDispatcher = EntityEventDispatcher::new(registry.clone())
            .handle_fn::<TicketCreated, _, _>(|_ctx, _event| async {
                Err("should not be called".into())
            });
        let payload = registry
            .serialize(&TicketCreated { seat: "1C".into() })
            .unwrap();
        let message = Message::new(payload)
            .with_headers(&Headers::from([(MESSAGE_EVENT_NAME, TicketCreated::NAME)]));

        let result = dispatcher
            .receive_message(&RequestContext::new(), &message)
            .await;

        assert!(result.is_ok());
    }
}
