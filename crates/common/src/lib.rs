//! Shared types for the saga workspace.

pub mod context;
pub mod types;

pub use context::RequestContext;
pub use types::SagaId;
