//! Inbound side of the messaging layer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use common::RequestContext;
use futures_util::FutureExt;
use futures_util::future::try_join_all;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::headers::{MESSAGE_CAUSATION_ID, MESSAGE_CORRELATION_ID};
use crate::receiver::{MessageReceiver, Middleware};
use crate::transport::{Consumer, Dispatch};
use crate::{Message, MsgError, Result};

type Receivers = Arc<Vec<Arc<dyn MessageReceiver>>>;

/// Routes messages from a [`Consumer`] to the receivers subscribed to each
/// channel.
///
/// Middleware must be registered before the first subscription; each
/// subscribed receiver is wrapped by the whole chain, with the first
/// registered middleware outermost.
pub struct Subscriber {
    consumer: Arc<dyn Consumer>,
    middlewares: Mutex<Vec<Middleware>>,
    receivers: Mutex<HashMap<String, Vec<Arc<dyn MessageReceiver>>>>,
    shutdown: watch::Sender<bool>,
    drained: Mutex<Option<mpsc::Receiver<()>>>,
    stopped: AtomicBool,
}

impl Subscriber {
    pub fn new(consumer: Arc<dyn Consumer>) -> Self {
        tracing::info!("Subscriber constructed");
        Self {
            consumer,
            middlewares: Mutex::new(Vec::new()),
            receivers: Mutex::new(HashMap::new()),
            shutdown: watch::Sender::new(false),
            drained: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    /// Appends a middleware to the chain.
    pub fn use_middleware<F>(&self, middleware: F) -> Result<()>
    where
        F: Fn(Arc<dyn MessageReceiver>) -> Arc<dyn MessageReceiver> + Send + Sync + 'static,
    {
        let receivers = self.receivers.lock().unwrap_or_else(PoisonError::into_inner);
        if !receivers.is_empty() {
            return Err(MsgError::MiddlewareAfterSubscribe);
        }
        self.middlewares
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(middleware));
        Ok(())
    }

    /// Adds `receiver` to the receivers of `channel`.
    pub fn subscribe(&self, channel: impl Into<String>, receiver: Arc<dyn MessageReceiver>) {
        let channel = channel.into();
        let receiver = self.chain(receiver);
        tracing::info!(channel = %channel, "Subscribed");
        self.receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(channel)
            .or_default()
            .push(receiver);
    }

    /// Listens on every subscribed channel until [`stop`](Self::stop) is
    /// called or a channel fails.
    ///
    /// The first channel failure signals every other listener to stop and
    /// is returned once they have all exited.
    pub async fn start(&self) -> Result<()> {
        let channels: Vec<(String, Receivers)> = self
            .receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(channel, receivers)| (channel.clone(), Arc::new(receivers.clone())))
            .collect();

        let (drain_tx, drain_rx) = mpsc::channel::<()>(1);
        *self.drained.lock().unwrap_or_else(PoisonError::into_inner) = Some(drain_rx);
        if *self.shutdown.borrow() {
            return Ok(());
        }

        let mut listeners = JoinSet::new();
        for (channel, receivers) in channels {
            let consumer = self.consumer.clone();
            let shutdown = self.shutdown.subscribe();
            let drain = drain_tx.clone();
            let dispatch = dispatcher(receivers);
            listeners.spawn(async move {
                let _drain = drain;
                let result = consumer.listen(&channel, shutdown, dispatch).await;
                if let Err(e) = &result {
                    tracing::error!(channel = %channel, error = %e, "Consumer stopped with an error");
                }
                result
            });
        }
        drop(drain_tx);

        let mut first_error = None;
        while let Some(joined) = listeners.join_next().await {
            let result = joined.map_err(|e| MsgError::Transport(Box::new(e))).and_then(|r| r);
            if let Err(e) = result
                && first_error.is_none()
            {
                self.shutdown.send_replace(true);
                first_error = Some(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stops listening and closes the consumer, waiting up to `timeout` for
    /// in-flight messages to finish. Later calls do nothing.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.send_replace(true);

        let closed = self.consumer.close().await;

        let drained = self
            .drained
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut drained) = drained {
            match tokio::time::timeout(timeout, drained.recv()).await {
                Ok(_) => tracing::info!("All receivers are done"),
                Err(_) => {
                    tracing::warn!(?timeout, "Timed out waiting for receivers to finish")
                }
            }
        }

        closed
    }

    fn chain(&self, receiver: Arc<dyn MessageReceiver>) -> Arc<dyn MessageReceiver> {
        self.middlewares
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .fold(receiver, |inner, middleware| middleware(inner))
    }
}

fn dispatcher(receivers: Receivers) -> Dispatch {
    Arc::new(move |message: Message| dispatch_message(receivers.clone(), message).boxed())
}

async fn dispatch_message(receivers: Receivers, message: Message) -> Result<()> {
    let headers = message.headers();
    let ctx = RequestContext::for_message(
        message.id(),
        headers.get(MESSAGE_CORRELATION_ID),
        headers.get(MESSAGE_CAUSATION_ID),
    );

    tracing::info!(
        message_id = message.id(),
        correlation_id = ctx.correlation_id(),
        causation_id = ctx.causation_id(),
        payload_size = message.payload().len(),
        "Received message"
    );

    try_join_all(
        receivers
            .iter()
            .map(|receiver| receiver.receive_message(&ctx, &message)),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{BrokerConfig, InMemoryBroker};
    use crate::transport::Producer;
    use async_trait::async_trait;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recording {
        label: &'static str,
        log: Log,
        inner: Option<Arc<dyn MessageReceiver>>,
    }

    #[async_trait]
    impl MessageReceiver for Recording {
        async fn receive_message(&self, ctx: &RequestContext, message: &Message) -> Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.label, ctx.correlation_id()));
            match &self.inner {
                Some(inner) => inner.receive_message(ctx, message).await,
                None => Ok(()),
            }
        }
    }

    struct Failing;

    #[async_trait]
    impl MessageReceiver for Failing {
        async fn receive_message(&self, _ctx: &RequestContext, _message: &Message) -> Result<()> {
            Err(MsgError::Handler("boom".into()))
        }
    }

    fn recording(label: &'static str, log: &Log) -> Arc<dyn MessageReceiver> {
        Arc::new(Recording {
            label,
            log: log.clone(),
            inner: None,
        })
    }

    fn wrap(
        label: &'static str,
        log: &Log,
    ) -> impl Fn(Arc<dyn MessageReceiver>) -> Arc<dyn MessageReceiver> + Send + Sync + 'static {
        let log = log.clone();
        move |inner| {
            Arc::new(Recording {
                label,
                log: log.clone(),
                inner: Some(inner),
            }) as Arc<dyn MessageReceiver>
        }
    }

    async fn wait_for_entries(log: &Log, count: usize) {
        while log.lock().unwrap().len() < count {
            tokio::task::yield_now().await;
        }
    }

    fn correlated(id: &str) -> Message {
        Message::new(vec![]).with_headers(&crate::Headers::from([(MESSAGE_CORRELATION_ID, id)]))
    }

    #[tokio::test]
    async fn test_first_middleware_is_outermost() {
        let broker = InMemoryBroker::new();
        let subscriber = Arc::new(Subscriber::new(Arc::new(broker.clone())));
        let log: Log = Arc::default();
        subscriber.use_middleware(wrap("outer", &log)).unwrap();
        subscriber.use_middleware(wrap("inner", &log)).unwrap();
        subscriber.subscribe("orders", recording("receiver", &log));

        broker.send("orders", correlated("c-1")).await.unwrap();
        let running = {
            let subscriber = subscriber.clone();
            tokio::spawn(async move { subscriber.start().await })
        };
        wait_for_entries(&log, 3).await;
        subscriber.stop(Duration::from_secs(1)).await.unwrap();
        running.await.unwrap().unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["outer:c-1", "inner:c-1", "receiver:c-1"]
        );
    }

    #[test]
    fn test_middleware_after_subscribe_is_rejected() {
        let subscriber = Subscriber::new(Arc::new(InMemoryBroker::new()));
        let log: Log = Arc::default();
        subscriber.subscribe("orders", recording("receiver", &log));

        let result = subscriber.use_middleware(wrap("late", &log));
        assert!(matches!(result, Err(MsgError::MiddlewareAfterSubscribe)));
    }

    #[tokio::test]
    async fn test_every_receiver_on_a_channel_gets_the_message() {
        let broker = InMemoryBroker::new();
        let subscriber = Arc::new(Subscriber::new(Arc::new(broker.clone())));
        let log: Log = Arc::default();
        subscriber.subscribe("orders", recording("a", &log));
        subscriber.subscribe("orders", recording("b", &log));
        subscriber.subscribe("payments", recording("c", &log));

        broker.send("orders", correlated("c-7")).await.unwrap();
        let running = {
            let subscriber = subscriber.clone();
            tokio::spawn(async move { subscriber.start().await })
        };
        wait_for_entries(&log, 2).await;
        subscriber.stop(Duration::from_secs(1)).await.unwrap();
        running.await.unwrap().unwrap();

        let mut seen = log.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["a:c-7", "b:c-7"]);
    }

    #[tokio::test]
    async fn test_channel_failure_stops_every_listener() {
        let broker = InMemoryBroker::with_config(BrokerConfig {
            ack_timeout: Duration::from_secs(1),
            max_deliveries: 1,
        });
        let subscriber = Subscriber::new(Arc::new(broker.clone()));
        let log: Log = Arc::default();
        subscriber.subscribe("orders", Arc::new(Failing));
        subscriber.subscribe("payments", recording("payments", &log));

        broker.send("orders", Message::new(vec![])).await.unwrap();
        let result = subscriber.start().await;

        assert!(matches!(result, Err(MsgError::Transport(_))));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let broker = InMemoryBroker::new();
        let subscriber = Arc::new(Subscriber::new(Arc::new(broker.clone())));
        let log: Log = Arc::default();
        subscriber.subscribe("orders", recording("a", &log));

        let running = {
            let subscriber = subscriber.clone();
            tokio::spawn(async move { subscriber.start().await })
        };
        tokio::task::yield_now().await;

        subscriber.stop(Duration::from_secs(1)).await.unwrap();
        subscriber.stop(Duration::from_secs(1)).await.unwrap();
        running.await.unwrap().unwrap();

        assert_eq!(broker.close_count(), 1);
    }

    #[tokio::test]
    async fn test_start_after_stop_returns_immediately() {
        let subscriber = Subscriber::new(Arc::new(InMemoryBroker::new()));
        let log: Log = Arc::default();
        subscriber.subscribe("orders", recording("a", &log));

        subscriber.stop(Duration::from_secs(1)).await.unwrap();
        subscriber.start().await.unwrap();
    }
}
