use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use common::RequestContext;

use super::decode_payload;
use crate::headers::{
    MESSAGE_COMMAND_NAME, MESSAGE_COMMAND_PREFIX, MESSAGE_COMMAND_REPLY_CHANNEL,
    MESSAGE_DESTINATION_CHANNEL, MESSAGE_REPLY_PREFIX,
};
use crate::payload::{Command, Payload};
use crate::receiver::{MessageReceiver, TransactionalReceiver};
use crate::{BoxError, Headers, Message, Publisher, ReplyMessage, Result};

/// A decoded command and the reply headers derived from its message.
#[derive(Debug)]
pub struct CommandMessage {
    command: Box<dyn Payload>,
    headers: Headers,
}

impl CommandMessage {
    pub fn new(command: Box<dyn Payload>, headers: Headers) -> Self {
        Self { command, headers }
    }

    pub fn command(&self) -> &dyn Payload {
        self.command.as_ref()
    }

    /// The command as its concrete type.
    pub fn command_as<C: Payload>(&self) -> Option<&C> {
        self.command.downcast_ref::<C>()
    }

    pub fn command_name(&self) -> &'static str {
        self.command.payload_name()
    }

    /// Correlation headers that every reply to this command carries.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }
}

/// Handles one command type, returning the replies to send back.
///
/// An error is answered with a single generic failure reply.
#[async_trait]
pub trait CommandHandler<S = ()>: Send + Sync {
    async fn handle(
        &self,
        scope: &mut S,
        ctx: &RequestContext,
        command: CommandMessage,
    ) -> std::result::Result<Vec<ReplyMessage>, BoxError>;
}

struct FnCommandHandler<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<S, F, Fut> CommandHandler<S> for FnCommandHandler<F, Fut>
where
    S: Send,
    F: Fn(RequestContext, CommandMessage) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Vec<ReplyMessage>, BoxError>> + Send,
{
    async fn handle(
        &self,
        _scope: &mut S,
        ctx: &RequestContext,
        command: CommandMessage,
    ) -> std::result::Result<Vec<ReplyMessage>, BoxError> {
        (self.f)(ctx.clone(), command).await
    }
}

/// Builds the reply correlation headers for a command message: every
/// `command-*` header except the command name, renamed to `reply-*`.
pub fn correlation_headers(headers: &Headers) -> Headers {
    headers
        .iter()
        .filter(|(key, _)| *key != MESSAGE_COMMAND_NAME)
        .filter_map(|(key, value)| {
            key.strip_prefix(MESSAGE_COMMAND_PREFIX)
                .map(|suffix| (format!("{MESSAGE_REPLY_PREFIX}{suffix}"), value))
        })
        .collect()
}

/// Publishes `replies` to `reply_channel`, each carrying the correlation
/// headers followed by its own headers.
pub async fn publish_replies(
    publisher: &Publisher,
    ctx: &RequestContext,
    reply_channel: &str,
    replies: &[ReplyMessage],
    correlation: &Headers,
) -> Result<()> {
    for reply in replies {
        let mut headers = correlation.clone();
        headers.merge(reply.headers());
        headers.insert(MESSAGE_DESTINATION_CHANNEL, reply_channel);
        publisher.publish_reply(ctx, reply.reply(), &headers).await?;
    }
    Ok(())
}

/// Receives commands and answers them on the channel named by
/// `command-reply-channel`.
pub struct CommandDispatcher<S = ()> {
    publisher: Arc<Publisher>,
    handlers: HashMap<&'static str, Arc<dyn CommandHandler<S>>>,
}

impl<S: Send + 'static> CommandDispatcher<S> {
    pub fn new(publisher: Arc<Publisher>) -> Self {
        tracing::info!("CommandDispatcher constructed");
        Self {
            publisher,
            handlers: HashMap::new(),
        }
    }

    /// Routes commands of type `C` to `handler`.
    pub fn handle<C: Command>(mut self, handler: impl CommandHandler<S> + 'static) -> Self {
        tracing::info!(command_name = C::NAME, "Command handler added");
        self.handlers.insert(C::NAME, Arc::new(handler));
        self
    }

    /// Routes commands of type `C` to an async closure that does not need
    /// the scope.
    pub fn handle_fn<C, F, Fut>(self, f: F) -> Self
    where
        C: Command,
        F: Fn(RequestContext, CommandMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Vec<ReplyMessage>, BoxError>> + Send + 'static,
    {
        self.handle::<C>(FnCommandHandler {
            f,
            _marker: PhantomData,
        })
    }

    async fn dispatch(&self, scope: &mut S, ctx: &RequestContext, message: &Message) -> Result<()> {
        let command_name = match message.headers().get_required(MESSAGE_COMMAND_NAME) {
            Ok(name) => name,
            Err(e) => {
                tracing::error!(message_id = message.id(), error = %e, "Failed to read command name");
                return Ok(());
            }
        };

        let Some(handler) = self.handlers.get(command_name) else {
            tracing::debug!(command_name, message_id = message.id(), "No command handler");
            return Ok(());
        };

        let Some(command) = decode_payload(self.publisher.registry(), command_name, message)
        else {
            return Ok(());
        };

        let reply_channel = match message.headers().get_required(MESSAGE_COMMAND_REPLY_CHANNEL) {
            Ok(channel) => channel,
            Err(e) => {
                tracing::error!(command_name, error = %e, "Failed to read reply channel");
                return Ok(());
            }
        };

        let correlation = correlation_headers(message.headers());
        let command = CommandMessage::new(command, correlation.clone());

        let replies = match handler.handle(scope, ctx, command).await {
            Ok(replies) => replies,
            Err(e) => {
                tracing::error!(command_name, error = %e, "Command handler returned an error");
                vec![ReplyMessage::with_failure()]
            }
        };

        publish_replies(&self.publisher, ctx, reply_channel, &replies, &correlation)
            .await
            .inspect_err(|e| tracing::error!(command_name, error = %e, "Failed to send replies"))
    }
}

#[async_trait]
impl<S: Send + 'static> TransactionalReceiver<S> for CommandDispatcher<S> {
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
impl MessageReceiver for CommandDispatcher {
    async fn receive_message(&self, ctx: &RequestContext, message: &Message) -> Result<()> {
        self.dispatch(&mut (), ctx, message).await
    }
}
