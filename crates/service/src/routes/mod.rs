//! HTTP route handlers.

pub mod metrics;
