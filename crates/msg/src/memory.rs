use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock, mpsc, watch};

use crate::transport::{Consumer, Dispatch, Producer};
use crate::{Message, MsgError, Result};

/// Delivery policy for [`InMemoryBroker`].
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// How long a dispatch may run before the delivery counts as failed.
    pub ack_timeout: Duration,
    /// Deliveries attempted per message before the listener gives up.
    pub max_deliveries: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(30),
            max_deliveries: 3,
        }
    }
}

struct ChannelQueue {
    sender: mpsc::UnboundedSender<Message>,
    receiver: Option<mpsc::UnboundedReceiver<Message>>,
}

impl ChannelQueue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Some(receiver),
        }
    }
}

/// In-process broker implementing both [`Producer`] and [`Consumer`].
///
/// Each channel is a FIFO queue with a single active listener. A message is
/// acknowledged when dispatch returns `Ok` within the ack timeout; otherwise
/// it is redelivered, and after `max_deliveries` attempts the listener stops
/// with an error. Every sent message is also recorded so tests can inspect
/// traffic.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    config: BrokerConfig,
    channels: Arc<Mutex<HashMap<String, ChannelQueue>>>,
    sent: Arc<RwLock<Vec<(String, Message)>>>,
    closed: Arc<AtomicUsize>,
}

impl InMemoryBroker {
    /// Creates a broker with the default delivery policy.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: BrokerConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Every message sent so far, with its channel, in send order.
    pub async fn sent_messages(&self) -> Vec<(String, Message)> {
        self.sent.read().await.clone()
    }

    /// Messages sent to `channel`, in send order.
    pub async fn sent_to(&self, channel: &str) -> Vec<Message> {
        self.sent
            .read()
            .await
            .iter()
            .filter(|(sent_channel, _)| sent_channel == channel)
            .map(|(_, message)| message.clone())
            .collect()
    }

    /// Number of times `close` has been called, on either side.
    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    async fn take_receiver(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<Message>> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(channel.to_string())
            .or_insert_with(ChannelQueue::new)
            .receiver
            .take()
            .ok_or_else(|| {
                MsgError::Transport(format!("channel {channel} already has a listener").into())
            })
    }

    async fn return_receiver(&self, channel: &str, receiver: mpsc::UnboundedReceiver<Message>) {
        if let Some(queue) = self.channels.lock().await.get_mut(channel) {
            queue.receiver = Some(receiver);
        }
    }

    async fn consume(
        &self,
        channel: &str,
        receiver: &mut mpsc::UnboundedReceiver<Message>,
        mut shutdown: watch::Receiver<bool>,
        dispatch: &Dispatch,
    ) -> Result<()> {
        loop {
            let message = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stopping| *stopping) => return Ok(()),
                message = receiver.recv() => match message {
                    Some(message) => message,
                    None => return Ok(()),
                },
            };
            self.deliver(channel, message, dispatch).await?;
        }
    }

    async fn deliver(&self, channel: &str, message: Message, dispatch: &Dispatch) -> Result<()> {
        let max_deliveries = self.config.max_deliveries.max(1);
        for attempt in 1..=max_deliveries {
            match tokio::time::timeout(self.config.ack_timeout, dispatch(message.clone())).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => {
                    tracing::warn!(
                        channel,
                        message_id = message.id(),
                        attempt,
                        error = %e,
                        "Message delivery failed"
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        channel,
                        message_id = message.id(),
                        attempt,
                        "Message was not acknowledged in time"
                    );
                }
            }
            metrics::counter!("messages_redelivered_total").increment(1);
        }

        Err(MsgError::Transport(
            format!(
                "message {} on channel {channel} was not acknowledged after {max_deliveries} deliveries",
                message.id()
            )
            .into(),
        ))
    }
}

#[async_trait]
impl Producer for InMemoryBroker {
    async fn send(&self, channel: &str, message: Message) -> Result<()> {
        self.sent
            .write()
            .await
            .push((channel.to_string(), message.clone()));

        let mut channels = self.channels.lock().await;
        let queue = channels
            .entry(channel.to_string())
            .or_insert_with(ChannelQueue::new);
        queue
            .sender
            .send(message)
            .map_err(|e| MsgError::Transport(e.to_string().into()))
    }

    async fn close(&self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("In-memory producer closed");
        Ok(())
    }
}

#[async_trait]
impl Consumer for InMemoryBroker {
    #[tracing::instrument(skip(self, shutdown, dispatch))]
    async fn listen(
        &self,
        channel: &str,
        shutdown: watch::Receiver<bool>,
        dispatch: Dispatch,
    ) -> Result<()> {
        let mut receiver = self.take_receiver(channel).await?;
        tracing::debug!("Listening");
        let result = self
            .consume(channel, &mut receiver, shutdown, &dispatch)
            .await;
        self.return_receiver(channel, receiver).await;
        result
    }

    async fn close(&self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("In-memory consumer closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::future::Future;

    fn dispatch_fn<F, Fut>(f: F) -> Dispatch
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Arc::new(move |message| f(message).boxed())
    }

    fn collecting_dispatch(seen: Arc<Mutex<Vec<String>>>) -> Dispatch {
        dispatch_fn(move |message| {
            let seen = seen.clone();
            async move {
                seen.lock().await.push(message.id().to_string());
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_delivers_in_send_order() {
        let broker = InMemoryBroker::new();
        let first = Message::new(b"1".to_vec());
        let second = Message::new(b"2".to_vec());
        broker.send("orders", first.clone()).await.unwrap();
        broker.send("orders", second.clone()).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let (stop, shutdown) = watch::channel(false);
        let listener = {
            let broker = broker.clone();
            let dispatch = collecting_dispatch(seen.clone());
            tokio::spawn(async move { broker.listen("orders", shutdown, dispatch).await })
        };

        while seen.lock().await.len() < 2 {
            tokio::task::yield_now().await;
        }
        stop.send_replace(true);
        listener.await.unwrap().unwrap();

        assert_eq!(
            *seen.lock().await,
            vec![first.id().to_string(), second.id().to_string()]
        );
        assert_eq!(broker.sent_to("orders").await.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_delivery_is_retried() {
        let broker = InMemoryBroker::new();
        broker.send("orders", Message::new(vec![])).await.unwrap();

        let attempts = Arc::new(AtomicUsize::new(0));
        let (stop, shutdown) = watch::channel(false);
        let dispatch = {
            let attempts = attempts.clone();
            let stop = Arc::new(stop);
            dispatch_fn(move |_message| {
                let attempts = attempts.clone();
                let stop = stop.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        return Err(MsgError::Handler("first try fails".into()));
                    }
                    stop.send_replace(true);
                    Ok(())
                }
            })
        };

        broker.listen("orders", shutdown, dispatch).await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_listener_fails_after_max_deliveries() {
        let broker = InMemoryBroker::with_config(BrokerConfig {
            ack_timeout: Duration::from_secs(1),
            max_deliveries: 2,
        });
        broker.send("orders", Message::new(vec![])).await.unwrap();

        let (_stop, shutdown) = watch::channel(false);
        let dispatch =
            dispatch_fn(|_message| async { Err(MsgError::Handler("always".into())) });

        let result = broker.listen("orders", shutdown, dispatch).await;
        assert!(matches!(result, Err(MsgError::Transport(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_dispatch_counts_as_unacknowledged() {
        let broker = InMemoryBroker::with_config(BrokerConfig {
            ack_timeout: Duration::from_millis(50),
            max_deliveries: 1,
        });
        broker.send("orders", Message::new(vec![])).await.unwrap();

        let (_stop, shutdown) = watch::channel(false);
        let dispatch = dispatch_fn(|_message| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });

        let result = broker.listen("orders", shutdown, dispatch).await;
        assert!(matches!(result, Err(MsgError::Transport(_))));
    }

    #[tokio::test]
    async fn test_one_listener_per_channel() {
        let broker = InMemoryBroker::new();
        let (stop, shutdown) = watch::channel(false);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let broker = broker.clone();
            let shutdown = shutdown.clone();
            let dispatch = collecting_dispatch(seen.clone());
            tokio::spawn(async move { broker.listen("orders", shutdown, dispatch).await })
        };
        while broker.channels.lock().await.get("orders").is_none() {
            tokio::task::yield_now().await;
        }

        let second = broker
            .listen("orders", shutdown, collecting_dispatch(seen))
            .await;
        assert!(matches!(second, Err(MsgError::Transport(_))));

        stop.send_replace(true);
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_close_is_counted() {
        let broker = InMemoryBroker::new();
        Producer::close(&broker).await.unwrap();
        Consumer::close(&broker).await.unwrap();
        assert_eq!(broker.close_count(), 2);
    }
}
