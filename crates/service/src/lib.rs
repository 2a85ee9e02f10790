//! Wiring for a saga orchestration service.
//!
//! [`SagaService`] owns the instance store, the publisher and the subscriber
//! (instrumented with [`telemetry::message_instrumentation`]), subscribes
//! orchestrators and participants behind the transactional outbox, and runs
//! the messaging loop until shutdown. [`metrics_router`] exposes the
//! Prometheus endpoint.

pub mod config;
pub mod error;
pub mod routes;
pub mod telemetry;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use msg::{
    Consumer, MessageReceiver, Outbox, Producer, Publisher, Subscriber, TransactionalReceiver,
    TypeRegistry,
};
use saga::{InstanceStore, Orchestrator, PostgresInstanceStore, SagaData, SagaDefinition};
use sqlx::postgres::PgPoolOptions;
use tower_http::trace::TraceLayer;

pub use config::{Config, ConfigError, Transport};
pub use error::{Result, ServiceError};

/// Creates the router serving `GET /metrics`.
pub fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(handle)
        .layer(TraceLayer::new_for_http())
}

/// Store, publisher and subscriber of one service, with their lifecycle.
pub struct SagaService<St> {
    store: Arc<St>,
    publisher: Arc<Publisher>,
    subscriber: Arc<Subscriber>,
    shutdown_timeout: Duration,
}

impl SagaService<PostgresInstanceStore> {
    /// Connects to Postgres and builds a service over the resulting store.
    pub async fn connect(
        config: &Config,
        producer: Arc<dyn Producer>,
        consumer: Arc<dyn Consumer>,
        registry: Arc<TypeRegistry>,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await?;
        let store = PostgresInstanceStore::new(pool, registry.clone(), config.store_config())?;
        tracing::info!(table = store.table_name(), "Connected saga instance store");
        Self::new(
            Arc::new(store),
            producer,
            consumer,
            registry,
            config.shutdown_timeout,
        )
    }
}

impl<St> SagaService<St>
where
    St: InstanceStore + 'static,
{
    pub fn new(
        store: Arc<St>,
        producer: Arc<dyn Producer>,
        consumer: Arc<dyn Consumer>,
        registry: Arc<TypeRegistry>,
        shutdown_timeout: Duration,
    ) -> Result<Self> {
        let publisher = Arc::new(Publisher::new(producer, registry));
        let subscriber = Arc::new(Subscriber::new(consumer));
        subscriber.use_middleware(telemetry::message_instrumentation)?;
        Ok(Self {
            store,
            publisher,
            subscriber,
            shutdown_timeout,
        })
    }

    pub fn store(&self) -> &Arc<St> {
        &self.store
    }

    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    pub fn subscriber(&self) -> &Arc<Subscriber> {
        &self.subscriber
    }

    /// Wraps `receiver` so each message runs in its own store transaction.
    pub fn outbox<R>(&self, receiver: Arc<R>) -> Arc<dyn MessageReceiver>
    where
        R: TransactionalReceiver<St::Tx> + 'static,
    {
        Arc::new(Outbox::new(self.store.clone(), receiver))
    }

    /// Subscribes `receiver` to `channel` behind the outbox.
    pub fn subscribe<R>(&self, channel: impl Into<String>, receiver: Arc<R>)
    where
        R: TransactionalReceiver<St::Tx> + 'static,
    {
        self.subscriber.subscribe(channel, self.outbox(receiver));
    }

    /// Creates the orchestrator for `definition` and subscribes it to the
    /// saga's reply channel.
    pub fn register_saga<D: SagaData>(
        &self,
        definition: SagaDefinition<D, St::Tx>,
    ) -> Arc<Orchestrator<D, St>> {
        let orchestrator = Arc::new(Orchestrator::new(
            definition,
            self.store.clone(),
            self.publisher.clone(),
        ));
        self.subscribe(orchestrator.reply_channel().to_string(), orchestrator.clone());
        orchestrator
    }

    /// Listens for messages until `shutdown` resolves or the subscriber
    /// fails, then stops messaging.
    ///
    /// A subscriber failure is returned after the publisher and subscriber
    /// have been stopped.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let listening = self.subscriber.start();
        tokio::pin!(listening);
        tokio::pin!(shutdown);

        let finished = tokio::select! {
            result = &mut listening => Some(result),
            () = &mut shutdown => None,
        };

        match finished {
            Some(Err(e)) => {
                tracing::error!(error = %e, "Subscriber failed");
                self.stop().await;
                Err(e.into())
            }
            Some(Ok(())) => {
                tracing::info!("Subscriber has no channels, waiting for shutdown");
                shutdown.await;
                self.stop().await;
                Ok(())
            }
            None => {
                tracing::info!("Shutdown requested");
                self.stop().await;
                match tokio::time::timeout(self.shutdown_timeout, listening).await {
                    Ok(result) => result?,
                    Err(_) => tracing::warn!("Subscriber did not exit before the shutdown timeout"),
                }
                Ok(())
            }
        }
    }

    /// Stops the publisher and the subscriber concurrently, bounded by the
    /// shutdown timeout. Errors are logged.
    pub async fn stop(&self) {
        let timeout = self.shutdown_timeout;
        let stopping = async {
            let (published, subscribed) =
                tokio::join!(self.publisher.stop(), self.subscriber.stop(timeout));
            if let Err(e) = published {
                tracing::error!(error = %e, "Error stopping publisher");
            }
            if let Err(e) = subscribed {
                tracing::error!(error = %e, "Error stopping subscriber");
            }
        };
        match tokio::time::timeout(timeout, stopping).await {
            Ok(()) => tracing::info!("Messaging stopped"),
            Err(_) => tracing::warn!(?timeout, "Timed out stopping messaging"),
        }
    }
}
