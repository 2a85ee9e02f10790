//! Durable storage for saga instances.

mod memory;
mod postgres;

pub use memory::{InMemoryInstanceStore, InMemoryTx};
pub use postgres::{DEFAULT_TABLE_NAME, PostgresInstanceStore, PostgresStoreConfig};

use async_trait::async_trait;
use common::SagaId;
use msg::Transactor;

use crate::Result;
use crate::instance::{Instance, SagaData};

/// Reads and writes saga instances inside a caller-owned transaction.
///
/// The transaction comes from the store's own [`Transactor`] side, so an
/// [`Outbox`](msg::Outbox) built on the store commits instance changes
/// together with whatever else the message handler wrote.
#[async_trait]
pub trait InstanceStore: Transactor {
    /// Loads one instance. Missing rows are [`SagaError::InstanceNotFound`](crate::SagaError::InstanceNotFound).
    async fn find<D: SagaData>(
        &self,
        tx: &mut Self::Tx,
        saga_name: &str,
        saga_id: SagaId,
    ) -> Result<Instance<D>>;

    /// Inserts a new instance. Fails with
    /// [`SagaError::DuplicateInstance`](crate::SagaError::DuplicateInstance)
    /// if it already exists.
    async fn save<D: SagaData>(&self, tx: &mut Self::Tx, instance: &Instance<D>) -> Result<()>;

    /// Overwrites data, step, end state and compensating flag of an existing
    /// instance. Concurrent updates are last write wins.
    async fn update<D: SagaData>(&self, tx: &mut Self::Tx, instance: &Instance<D>) -> Result<()>;
}
