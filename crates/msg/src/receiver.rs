//! Receiver contracts and the middleware type used by the subscriber.

use std::sync::Arc;

use async_trait::async_trait;
use common::RequestContext;
use futures_util::future::BoxFuture;

use crate::{Message, Result};

/// Anything that can process an inbound message.
#[async_trait]
pub trait MessageReceiver: Send + Sync {
    async fn receive_message(&self, ctx: &RequestContext, message: &Message) -> Result<()>;
}

/// A receiver that does its work inside a caller-owned transaction.
///
/// The orchestrator and the dispatchers implement this so that state changes
/// and outbound messages share one unit of work; wrap them in an
/// [`Outbox`](crate::Outbox) to subscribe them.
#[async_trait]
pub trait TransactionalReceiver<Tx: Send>: Send + Sync {
    async fn receive_in_transaction(
        &self,
        tx: &mut Tx,
        ctx: &RequestContext,
        message: &Message,
    ) -> Result<()>;
}

/// Wraps a receiver with cross-cutting behavior.
pub type Middleware = Arc<dyn Fn(Arc<dyn MessageReceiver>) -> Arc<dyn MessageReceiver> + Send + Sync>;

struct FnReceiver<F>(F);

#[async_trait]
impl<F> MessageReceiver for FnReceiver<F>
where
    F: for<'a> Fn(&'a RequestContext, &'a Message) -> BoxFuture<'a, Result<()>> + Send + Sync,
{
    async fn receive_message(&self, ctx: &RequestContext, message: &Message) -> Result<()> {
        (self.0)(ctx, message).await
    }
}

/// Adapts a closure into a [`MessageReceiver`].
///
/// ```ignore
/// let receiver = receiver_fn(|_ctx, message| Box::pin(async move {
///     tracing::info!(id = message.id(), "got message");
///     Ok(())
/// }));
/// ```
pub fn receiver_fn<F>(f: F) -> Arc<dyn MessageReceiver>
where
    F: for<'a> Fn(&'a RequestContext, &'a Message) -> BoxFuture<'a, Result<()>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnReceiver(f))
}
