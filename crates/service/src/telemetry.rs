//! Logging and metrics setup, plus the message instrumentation middleware.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use msg::{Message, MessageReceiver, RequestContext};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::error::Result;

/// Histogram of receiver latency in microseconds.
pub const MESSAGE_RESPONSE_TIME: &str = "message_response_time";

const RESPONSE_TIME_BUCKETS: [f64; 7] = [300.0, 600.0, 900.0, 1500.0, 5000.0, 10000.0, 20000.0];

/// Installs the global tracing subscriber. `filter` uses `RUST_LOG` syntax.
pub fn init_tracing(filter: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_new(filter)?;
    let (json_layer, text_layer) = if json {
        (Some(fmt::layer().json()), None)
    } else {
        (None, Some(fmt::layer()))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()?;
    Ok(())
}

/// Installs the global Prometheus recorder.
pub fn install_metrics_recorder() -> std::result::Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(MESSAGE_RESPONSE_TIME.to_string()),
            &RESPONSE_TIME_BUCKETS,
        )?
        .install_recorder()
}

/// Subscriber middleware recording how long each receiver takes.
pub fn message_instrumentation(next: Arc<dyn MessageReceiver>) -> Arc<dyn MessageReceiver> {
    Arc::new(Instrumented { next })
}

struct Instrumented {
    next: Arc<dyn MessageReceiver>,
}

#[async_trait]
impl MessageReceiver for Instrumented {
    async fn receive_message(&self, ctx: &RequestContext, message: &Message) -> msg::Result<()> {
        let started = Instant::now();
        let result = self.next.receive_message(ctx, message).await;
        let outcome = if result.is_ok() { "success" } else { "failure" };
        metrics::histogram!(MESSAGE_RESPONSE_TIME, "outcome" => outcome)
            .record(started.elapsed().as_micros() as f64);
        result
    }
}
