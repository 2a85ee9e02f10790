//! Orchestrated sagas on top of the `msg` messaging layer.
//!
//! A [`SagaDefinition`] lists the ordered steps of a business process. The
//! [`Orchestrator`] starts [`Instance`]s of it, publishes the commands of
//! remote steps, and advances or compensates each instance as replies
//! arrive. Participants answer saga commands with a
//! [`SagaCommandDispatcher`]. Instance state lives in an [`InstanceStore`],
//! updated inside the same transaction as the reply that caused it.

pub mod command;
pub mod definition;
pub mod error;
pub mod headers;
pub mod instance;
pub mod orchestrator;
pub mod step;
pub mod store;

pub use command::{SagaCommand, SagaCommandDispatcher, SagaCommandHandler};
pub use definition::{SagaDefinition, SagaDefinitionBuilder, SagaHook};
pub use error::{Result, SagaError};
pub use instance::{Instance, SAGA_NOT_STARTED, SagaData};
pub use orchestrator::Orchestrator;
pub use step::{
    LocalAction, LocalStep, RemoteAction, RemoteStep, ReplyHandler, Step, StepContext,
    StepPredicate, StepResults,
};
pub use store::{
    DEFAULT_TABLE_NAME, InMemoryInstanceStore, InMemoryTx, InstanceStore, PostgresInstanceStore,
    PostgresStoreConfig,
};
