//! Saga service entry point.
//!
//! This binary is a wiring template: it registers no sagas or participants
//! and the only built-in transport is the process-local broker, so it idles
//! until SIGINT or SIGTERM while serving Prometheus metrics. Applications
//! copy it, register their sagas and participants on the [`SagaService`],
//! and plug in their broker's [`Producer`](msg::Producer) and
//! [`Consumer`](msg::Consumer). `MESSAGE_TRANSPORT=memory` must be set to
//! run it as is.

use std::sync::Arc;

use msg::{InMemoryBroker, TypeRegistry};
use service::{Config, SagaService, ServiceError, Transport, telemetry};
use tokio::signal;
use tokio::sync::watch;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}

async fn stopped(mut stop: watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

#[tokio::main]
async fn main() -> Result<(), ServiceError> {
    let config = Config::from_env()?;

    telemetry::init_tracing(&config.log_level, config.log_json)?;
    let metrics_handle = telemetry::install_metrics_recorder()?;

    let broker = match config.require_transport()? {
        Transport::Memory => {
            tracing::warn!("Using the in-memory transport, no external messages will arrive");
            Arc::new(InMemoryBroker::new())
        }
    };
    let registry = TypeRegistry::builder().build();
    let service = SagaService::connect(&config, broker.clone(), broker, registry).await?;
    service.store().run_migrations().await?;

    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "Serving metrics");

    let stop = Arc::new(watch::Sender::new(false));
    let signal = tokio::spawn({
        let stop = stop.clone();
        async move {
            shutdown_signal().await;
            stop.send_replace(true);
        }
    });

    let serving = async {
        let result = axum::serve(listener, service::metrics_router(metrics_handle))
            .with_graceful_shutdown(stopped(stop.subscribe()))
            .await;
        stop.send_replace(true);
        result
    };
    let running = async {
        let result = service.run(stopped(stop.subscribe())).await;
        stop.send_replace(true);
        result
    };

    let (served, ran) = tokio::join!(serving, running);
    signal.abort();
    served?;
    ran?;

    tracing::info!("Service shut down gracefully");
    Ok(())
}
