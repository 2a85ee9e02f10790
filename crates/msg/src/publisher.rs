//! Outbound side of the messaging layer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{SecondsFormat, Utc};
use common::RequestContext;

use crate::headers::{
    MESSAGE_CAUSATION_ID, MESSAGE_COMMAND_NAME, MESSAGE_COMMAND_REPLY_CHANNEL,
    MESSAGE_CORRELATION_ID, MESSAGE_DATE, MESSAGE_DESTINATION_CHANNEL, MESSAGE_EVENT_ENTITY_ID,
    MESSAGE_EVENT_ENTITY_NAME, MESSAGE_EVENT_NAME, MESSAGE_REPLY_NAME,
};
use crate::payload::{DomainCommand, DomainEvent, Entity, Payload};
use crate::transport::Producer;
use crate::{Headers, Message, MsgError, Result, TypeRegistry};

/// Serializes domain values into [`Message`]s and hands them to a
/// [`Producer`].
///
/// Every published message is stamped with a `date` header and, unless the
/// caller already set them, with the correlation id of the current request
/// and a causation id pointing at the request itself.
pub struct Publisher {
    producer: Arc<dyn Producer>,
    registry: Arc<TypeRegistry>,
    stopped: AtomicBool,
}

impl Publisher {
    pub fn new(producer: Arc<dyn Producer>, registry: Arc<TypeRegistry>) -> Self {
        tracing::info!("Publisher constructed");
        Self {
            producer,
            registry,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Publishes a command whose replies should go to `reply_channel`.
    #[tracing::instrument(skip_all, fields(command_name = command.command_name()))]
    pub async fn publish_command(
        &self,
        ctx: &RequestContext,
        reply_channel: &str,
        command: &DomainCommand,
        headers: &Headers,
    ) -> Result<()> {
        let mut message_headers = Headers::from([
            (MESSAGE_COMMAND_NAME, command.command_name()),
            (MESSAGE_COMMAND_REPLY_CHANNEL, reply_channel),
        ]);
        if let Some(channel) = &command.destination_channel {
            message_headers.insert(MESSAGE_DESTINATION_CHANNEL, channel.as_str());
        }
        message_headers.merge(headers);

        tracing::info!("Publishing command");
        let message = self.encode(command.command(), &message_headers)?;
        self.publish(ctx, message).await
    }

    /// Publishes a reply. The destination normally arrives in `headers`.
    #[tracing::instrument(skip_all, fields(reply_name = reply.payload_name()))]
    pub async fn publish_reply(
        &self,
        ctx: &RequestContext,
        reply: &dyn Payload,
        headers: &Headers,
    ) -> Result<()> {
        let mut message_headers = Headers::from([(MESSAGE_REPLY_NAME, reply.payload_name())]);
        message_headers.merge(headers);

        tracing::info!("Publishing reply");
        let message = self.encode(reply, &message_headers)?;
        self.publish(ctx, message).await
    }

    #[tracing::instrument(skip_all, fields(event_name = event.event_name()))]
    pub async fn publish_event(
        &self,
        ctx: &RequestContext,
        event: &DomainEvent,
        headers: &Headers,
    ) -> Result<()> {
        let mut message_headers = Headers::from([(MESSAGE_EVENT_NAME, event.event_name())]);
        if let Some(channel) = &event.destination_channel {
            message_headers.insert(MESSAGE_DESTINATION_CHANNEL, channel.as_str());
        }
        message_headers.merge(headers);

        tracing::info!("Publishing event");
        let message = self.encode(event.event(), &message_headers)?;
        self.publish(ctx, message).await
    }

    /// Publishes every pending event of `entity`, stopping at the first
    /// failure.
    ///
    /// Events go to the channel named after the entity unless the entity
    /// names another destination.
    pub async fn publish_entity_events(
        &self,
        ctx: &RequestContext,
        entity: &dyn Entity,
        headers: &Headers,
    ) -> Result<()> {
        let entity_id = entity.entity_id();
        let mut entity_headers = Headers::from([
            (MESSAGE_EVENT_ENTITY_ID, entity_id.as_str()),
            (MESSAGE_EVENT_ENTITY_NAME, entity.entity_name()),
            (MESSAGE_DESTINATION_CHANNEL, entity.entity_name()),
        ]);
        if let Some(channel) = entity.destination_channel() {
            entity_headers.insert(MESSAGE_DESTINATION_CHANNEL, channel);
        }
        entity_headers.merge(headers);

        for event in entity.events() {
            if let Err(e) = self.publish_event(ctx, event, &entity_headers).await {
                tracing::error!(
                    entity_id = %entity_id,
                    entity_name = entity.entity_name(),
                    error = %e,
                    "Failed to publish entity event"
                );
                return Err(e);
            }
        }

        Ok(())
    }

    /// Sends a prepared message to the channel named in its destination
    /// header.
    pub async fn publish(&self, ctx: &RequestContext, mut message: Message) -> Result<()> {
        let channel = message
            .headers()
            .get_required(MESSAGE_DESTINATION_CHANNEL)
            .map_err(|_| MsgError::DestinationMissing)?
            .to_string();

        let headers = message.headers_mut();
        headers.insert(
            MESSAGE_DATE,
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        // Published messages are request boundaries
        headers.insert_if_empty(MESSAGE_CORRELATION_ID, ctx.correlation_id());
        headers.insert_if_empty(MESSAGE_CAUSATION_ID, ctx.request_id());

        tracing::info!(
            message_id = message.id(),
            correlation_id = message.headers().get(MESSAGE_CORRELATION_ID),
            causation_id = message.headers().get(MESSAGE_CAUSATION_ID),
            destination = %channel,
            payload_size = message.payload().len(),
            "Publishing message"
        );

        match self.producer.send(&channel, message).await {
            Ok(()) => {
                metrics::counter!("messages_published_total", "channel" => channel).increment(1);
                Ok(())
            }
            Err(e) => {
                tracing::error!(destination = %channel, error = %e, "Failed to publish message");
                Err(e)
            }
        }
    }

    /// Closes the producer. Later calls do nothing.
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.producer.close().await;
        tracing::info!("Publisher stopped");
        result
    }

    fn encode(&self, value: &dyn Payload, headers: &Headers) -> Result<Message> {
        let payload = self.registry.serialize(value).map_err(|e| {
            tracing::error!(payload_name = value.payload_name(), error = %e, "Failed to serialize payload");
            e
        })?;
        Ok(Message::new(payload).with_headers(headers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{Command, Event, Named, Success};
    use crate::{InMemoryBroker, ReplyMessage};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct ReserveCredit {
        amount: i64,
    }

    impl Named for ReserveCredit {
        const NAME: &'static str = "customer.ReserveCredit";
    }

    impl Command for ReserveCredit {}

    #[derive(Debug, Serialize, Deserialize)]
    struct OrderCreated {
        order_id: String,
    }

    impl Named for OrderCreated {
        const NAME: &'static str = "order.OrderCreated";
    }

    impl Event for OrderCreated {}

    struct Order {
        id: String,
        events: Vec<DomainEvent>,
        channel: Option<&'static str>,
    }

    impl Entity for Order {
        fn entity_id(&self) -> String {
            self.id.clone()
        }

        fn entity_name(&self) -> &str {
            "order.Order"
        }

        fn events(&self) -> &[DomainEvent] {
            &self.events
        }

        fn destination_channel(&self) -> Option<&str> {
            self.channel
        }
    }

    fn setup() -> (InMemoryBroker, Publisher) {
        let broker = InMemoryBroker::new();
        let registry = TypeRegistry::builder()
            .register_command::<ReserveCredit>()
            .register_event::<OrderCreated>()
            .build();
        let publisher = Publisher::new(Arc::new(broker.clone()), registry);
        (broker, publisher)
    }

    #[tokio::test]
    async fn test_publish_without_destination_fails() {
        let (broker, publisher) = setup();
        let result = publisher
            .publish(&RequestContext::new(), Message::new(vec![]))
            .await;

        assert!(matches!(result, Err(MsgError::DestinationMissing)));
        assert!(broker.sent_messages().await.is_empty());
    }

    #[tokio::test]
    async fn test_publish_stamps_causal_headers() {
        let (broker, publisher) = setup();
        let ctx = RequestContext::for_message("m-1", "corr-1", "cause-0");

        publisher
            .publish(&ctx, Message::new(vec![]).with_destination_channel("orders"))
            .await
            .unwrap();

        let sent = broker.sent_to("orders").await;
        let headers = sent[0].headers();
        assert_eq!(headers.get(MESSAGE_CORRELATION_ID), "corr-1");
        assert_eq!(headers.get(MESSAGE_CAUSATION_ID), "m-1");
        assert!(!headers.get(MESSAGE_DATE).is_empty());
    }

    #[tokio::test]
    async fn test_publish_keeps_existing_causal_headers() {
        let (broker, publisher) = setup();
        let message = Message::new(vec![])
            .with_destination_channel("orders")
            .with_headers(&Headers::from([
                (MESSAGE_CORRELATION_ID, "keep-corr"),
                (MESSAGE_CAUSATION_ID, "keep-cause"),
            ]));

        publisher
            .publish(&RequestContext::new(), message)
            .await
            .unwrap();

        let sent = broker.sent_to("orders").await;
        assert_eq!(sent[0].headers().get(MESSAGE_CORRELATION_ID), "keep-corr");
        assert_eq!(sent[0].headers().get(MESSAGE_CAUSATION_ID), "keep-cause");
    }

    #[tokio::test]
    async fn test_command_headers_then_caller_headers() {
        let (broker, publisher) = setup();
        let command = DomainCommand::new(ReserveCredit { amount: 10 }).to_channel("customer");

        publisher
            .publish_command(
                &RequestContext::new(),
                "order-saga",
                &command,
                &Headers::from([("command-saga-id", "s-1")]),
            )
            .await
            .unwrap();

        let sent = broker.sent_to("customer").await;
        assert_eq!(sent.len(), 1);
        let headers = sent[0].headers();
        assert_eq!(headers.get(MESSAGE_COMMAND_NAME), ReserveCredit::NAME);
        assert_eq!(headers.get(MESSAGE_COMMAND_REPLY_CHANNEL), "order-saga");
        assert_eq!(headers.get("command-saga-id"), "s-1");
    }

    #[tokio::test]
    async fn test_caller_headers_override_destination() {
        let (broker, publisher) = setup();
        let command = DomainCommand::new(ReserveCredit { amount: 10 }).to_channel("customer");

        publisher
            .publish_command(
                &RequestContext::new(),
                "order-saga",
                &command,
                &Headers::from([(MESSAGE_DESTINATION_CHANNEL, "customer-v2")]),
            )
            .await
            .unwrap();

        assert!(broker.sent_to("customer").await.is_empty());
        assert_eq!(broker.sent_to("customer-v2").await.len(), 1);
    }

    #[tokio::test]
    async fn test_command_without_channel_fails() {
        let (_broker, publisher) = setup();
        let command = DomainCommand::new(ReserveCredit { amount: 10 });

        let result = publisher
            .publish_command(&RequestContext::new(), "order-saga", &command, &Headers::new())
            .await;

        assert!(matches!(result, Err(MsgError::DestinationMissing)));
    }

    #[tokio::test]
    async fn test_reply_uses_reply_headers() {
        let (broker, publisher) = setup();
        let reply = ReplyMessage::with_success();
        let mut headers = reply.headers().clone();
        headers.insert(MESSAGE_DESTINATION_CHANNEL, "order-saga");

        publisher
            .publish_reply(&RequestContext::new(), reply.reply(), &headers)
            .await
            .unwrap();

        let sent = broker.sent_to("order-saga").await;
        assert_eq!(sent[0].headers().get(MESSAGE_REPLY_NAME), Success::NAME);
    }

    #[tokio::test]
    async fn test_entity_events_go_to_entity_channel() {
        let (broker, publisher) = setup();
        let order = Order {
            id: "o-1".into(),
            events: vec![
                DomainEvent::new(OrderCreated {
                    order_id: "o-1".into(),
                }),
                DomainEvent::new(OrderCreated {
                    order_id: "o-1".into(),
                }),
            ],
            channel: None,
        };

        publisher
            .publish_entity_events(&RequestContext::new(), &order, &Headers::new())
            .await
            .unwrap();

        let sent = broker.sent_to("order.Order").await;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].headers().get(MESSAGE_EVENT_ENTITY_ID), "o-1");
        assert_eq!(sent[0].headers().get(MESSAGE_EVENT_NAME), OrderCreated::NAME);
    }

    #[tokio::test]
    async fn test_entity_channel_override() {
        let (broker, publisher) = setup();
        let order = Order {
            id: "o-2".into(),
            events: vec![DomainEvent::new(OrderCreated {
                order_id: "o-2".into(),
            })],
            channel: Some("order-events"),
        };

        publisher
            .publish_entity_events(&RequestContext::new(), &order, &Headers::new())
            .await
            .unwrap();

        assert_eq!(broker.sent_to("order-events").await.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_closes_producer_once() {
        let (broker, publisher) = setup();
        let publisher = Arc::new(publisher);

        let (a, b) = tokio::join!(publisher.stop(), publisher.stop());
        a.unwrap();
        b.unwrap();
        publisher.stop().await.unwrap();

        assert_eq!(broker.close_count(), 1);
    }
}
