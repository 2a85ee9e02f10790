//! Participant side of a saga: receives saga commands and replies to the
//! orchestrator.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use common::{RequestContext, SagaId};
use msg::dispatcher::{correlation_headers, publish_replies};
use msg::headers::{MESSAGE_COMMAND_NAME, MESSAGE_COMMAND_REPLY_CHANNEL};
use msg::{
    BoxError, Command, Headers, Message, MessageReceiver, Payload, Publisher, ReplyMessage,
    TransactionalReceiver,
};

use crate::headers::{MESSAGE_COMMAND_SAGA_ID, MESSAGE_COMMAND_SAGA_NAME};

/// A decoded command sent by a saga, with the saga it belongs to.
#[derive(Debug)]
pub struct SagaCommand {
    saga_id: SagaId,
    saga_name: String,
    command: Box<dyn Payload>,
    headers: Headers,
}

impl SagaCommand {
    pub fn saga_id(&self) -> SagaId {
        self.saga_id
    }

    pub fn saga_name(&self) -> &str {
        &self.saga_name
    }

    pub fn command(&self) -> &dyn Payload {
        self.command.as_ref()
    }

    pub fn command_as<C: Payload>(&self) -> Option<&C> {
        self.command.downcast_ref::<C>()
    }

    pub fn command_name(&self) -> &'static str {
        self.command.payload_name()
    }

    /// Correlation headers carried back on every reply.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }
}

/// Handles one saga command type.
///
/// An error is answered with a single generic failure reply, which makes the
/// orchestrator compensate.
#[async_trait]
pub trait SagaCommandHandler<S = ()>: Send + Sync {
    async fn handle(
        &self,
        scope: &mut S,
        ctx: &RequestContext,
        command: SagaCommand,
    ) -> std::result::Result<Vec<ReplyMessage>, BoxError>;
}

struct FnSagaCommandHandler<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<S, F, Fut> SagaCommandHandler<S> for FnSagaCommandHandler<F, Fut>
where
    S: Send,
    F: Fn(RequestContext, SagaCommand) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Vec<ReplyMessage>, BoxError>> + Send,
{
    async fn handle(
        &self,
        _scope: &mut S,
        ctx: &RequestContext,
        command: SagaCommand,
    ) -> std::result::Result<Vec<ReplyMessage>, BoxError> {
        (self.f)(ctx.clone(), command).await
    }
}

/// Receives saga commands and answers them on the saga's reply channel.
///
/// Messages without the saga id and name headers are dropped, as are
/// unknown commands and payloads that fail to decode.
pub struct SagaCommandDispatcher<S = ()> {
    publisher: Arc<Publisher>,
    handlers: HashMap<&'static str, Arc<dyn SagaCommandHandler<S>>>,
}

impl<S: Send + 'static> SagaCommandDispatcher<S> {
    pub fn new(publisher: Arc<Publisher>) -> Self {
        tracing::info!("SagaCommandDispatcher constructed");
        Self {
            publisher,
            handlers: HashMap::new(),
        }
    }

    pub fn handle<C: Command>(mut self, handler: impl SagaCommandHandler<S> + 'static) -> Self {
        tracing::info!(command_name = C::NAME, "Saga command handler added");
        self.handlers.insert(C::NAME, Arc::new(handler));
        self
    }

    pub fn handle_fn<C, F, Fut>(self, f: F) -> Self
    where
        C: Command,
        F: Fn(RequestContext, SagaCommand) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Vec<ReplyMessage>, BoxError>> + Send + 'static,
    {
        self.handle::<C>(FnSagaCommandHandler {
            f,
            _marker: PhantomData,
        })
    }

    #[tracing::instrument(skip_all, fields(message_id = message.id()))]
    async fn dispatch(
        &self,
        scope: &mut S,
        ctx: &RequestContext,
        message: &Message,
    ) -> msg::Result<()> {
        let headers = message.headers();
        let (command_name, saga_id, saga_name) = match command_info(headers) {
            Ok(info) => info,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read saga command headers");
                return Ok(());
            }
        };

        let Some(handler) = self.handlers.get(command_name) else {
            tracing::debug!(command_name, "No saga command handler");
            return Ok(());
        };

        let saga_id: SagaId = match saga_id.parse() {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(command_name, saga_id, error = %e, "Failed to parse saga id");
                return Ok(());
            }
        };

        let command = match self
            .publisher
            .registry()
            .deserialize(command_name, message.payload())
        {
            Ok(command) => command,
            Err(e) => {
                tracing::error!(command_name, %saga_id, error = %e, "Failed to decode saga command");
                return Ok(());
            }
        };

        let reply_channel = match headers.get_required(MESSAGE_COMMAND_REPLY_CHANNEL) {
            Ok(channel) => channel,
            Err(e) => {
                tracing::error!(command_name, %saga_id, error = %e, "Failed to read reply channel");
                return Ok(());
            }
        };

        tracing::debug!(command_name, saga_name, %saga_id, "Received saga command");

        let correlation = correlation_headers(headers);
        let command = SagaCommand {
            saga_id,
            saga_name: saga_name.to_string(),
            command,
            headers: correlation.clone(),
        };

        let replies = match handler.handle(scope, ctx, command).await {
            Ok(replies) => replies,
            Err(e) => {
                tracing::error!(command_name, %saga_id, error = %e, "Saga command handler returned an error");
                vec![ReplyMessage::with_failure()]
            }
        };

        publish_replies(&self.publisher, ctx, reply_channel, &replies, &correlation)
            .await
            .inspect_err(|e| tracing::error!(command_name, %saga_id, error = %e, "Failed to send replies"))
    }
}

fn command_info(headers: &Headers) -> msg::Result<(&str, &str, &str)> {
    Ok((
        headers.get_required(MESSAGE_COMMAND_NAME)?,
        headers.get_required(MESSAGE_COMMAND_SAGA_ID)?,
        headers.get_required(MESSAGE_COMMAND_SAGA_NAME)?,
    ))
}

#[async_trait]
impl<S: Send + 'static> TransactionalReceiver<S> for SagaCommandDispatcher<S> {
    async fn receive_in_transaction(
        &self,
        scope: &mut S,
        ctx: &RequestContext,
        message: &Message,
    ) -> msg::Result<()> {
        self.dispatch(scope, ctx, message).await
    }
}

#[async_trait]
impl MessageReceiver for SagaCommandDispatcher {
    async fn receive_message(&self, ctx: &RequestContext, message: &Message) -> msg::Result<()> {
        self.dispatch(&mut (), ctx, message).await
    }
}
