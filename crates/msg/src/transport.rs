//! Broker abstraction consumed by the publisher and subscriber.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tokio::sync::watch;

use crate::{Message, Result};

/// Callback a consumer invokes for every delivered message.
///
/// Returning `Ok` acknowledges the message; an error leaves it for
/// redelivery according to the broker's policy.
pub type Dispatch = Arc<dyn Fn(Message) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Sends messages to named channels.
#[async_trait]
pub trait Producer: Send + Sync {
    async fn send(&self, channel: &str, message: Message) -> Result<()>;

    /// Releases broker resources. Called exactly once by the publisher.
    async fn close(&self) -> Result<()>;
}

/// Receives messages from named channels.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Delivers each message on `channel` to `dispatch` until `shutdown`
    /// turns true. Returns an error when the channel can no longer be
    /// consumed.
    async fn listen(
        &self,
        channel: &str,
        shutdown: watch::Receiver<bool>,
        dispatch: Dispatch,
    ) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
