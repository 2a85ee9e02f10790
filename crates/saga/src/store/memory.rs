use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::SagaId;
use msg::{Transactor, TypeRegistry};
use tokio::sync::RwLock;

use super::InstanceStore;
use crate::instance::{Instance, SagaData};
use crate::{Result, SagaError};

type Key = (String, SagaId);

#[derive(Debug, Clone)]
struct StoredInstance {
    data_name: String,
    data: Vec<u8>,
    current_step: i32,
    end_state: bool,
    compensating: bool,
}

/// Pending writes of one [`InMemoryInstanceStore`] transaction.
#[derive(Debug, Default)]
pub struct InMemoryTx {
    staged: HashMap<Key, StoredInstance>,
}

/// In-memory instance store for tests and local runs.
///
/// Writes are staged in the transaction and only become visible to other
/// transactions on commit, so rollback behaves like the Postgres store.
#[derive(Clone)]
pub struct InMemoryInstanceStore {
    registry: Arc<TypeRegistry>,
    rows: Arc<RwLock<HashMap<Key, StoredInstance>>>,
}

impl InMemoryInstanceStore {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self {
            registry,
            rows: Arc::default(),
        }
    }

    /// Number of committed instances.
    pub async fn instance_count(&self) -> usize {
        self.rows.read().await.len()
    }

    /// Removes every committed instance.
    pub async fn clear(&self) {
        self.rows.write().await.clear();
    }

    async fn lookup(&self, tx: &InMemoryTx, key: &Key) -> Option<StoredInstance> {
        match tx.staged.get(key) {
            Some(row) => Some(row.clone()),
            None => self.rows.read().await.get(key).cloned(),
        }
    }

    fn encode<D: SagaData>(&self, instance: &Instance<D>) -> Result<StoredInstance> {
        Ok(StoredInstance {
            data_name: instance.data_name().to_string(),
            data: self.registry.serialize(instance.data())?,
            current_step: instance.current_step(),
            end_state: instance.end_state(),
            compensating: instance.compensating(),
        })
    }
}

#[async_trait]
impl Transactor for InMemoryInstanceStore {
    type Tx = InMemoryTx;
    type Error = SagaError;

    async fn begin(&self) -> Result<Self::Tx> {
        Ok(InMemoryTx::default())
    }

    async fn commit(&self, tx: Self::Tx) -> Result<()> {
        self.rows.write().await.extend(tx.staged);
        Ok(())
    }

    async fn rollback(&self, _tx: Self::Tx) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn find<D: SagaData>(
        &self,
        tx: &mut Self::Tx,
        saga_name: &str,
        saga_id: SagaId,
    ) -> Result<Instance<D>> {
        let key = (saga_name.to_string(), saga_id);
        let row = self
            .lookup(tx, &key)
            .await
            .ok_or_else(|| SagaError::InstanceNotFound {
                saga_name: saga_name.to_string(),
                saga_id,
            })?;

        let data: D = self.registry.deserialize_as(&row.data_name, &row.data)?;
        Ok(Instance::from_parts(
            saga_id,
            saga_name,
            data,
            row.current_step,
            row.end_state,
            row.compensating,
        ))
    }

    async fn save<D: SagaData>(&self, tx: &mut Self::Tx, instance: &Instance<D>) -> Result<()> {
        let key = (instance.saga_name().to_string(), instance.saga_id());
        if self.lookup(tx, &key).await.is_some() {
            return Err(SagaError::DuplicateInstance {
                saga_name: key.0,
                saga_id: key.1,
            });
        }
        let row = self.encode(instance)?;
        tx.staged.insert(key, row);
        Ok(())
    }

    async fn update<D: SagaData>(&self, tx: &mut Self::Tx, instance: &Instance<D>) -> Result<()> {
        let key = (instance.saga_name().to_string(), instance.saga_id());
        if self.lookup(tx, &key).await.is_none() {
            return Err(SagaError::InstanceNotFound {
                saga_name: key.0,
                saga_id: key.1,
            });
        }
        let row = self.encode(instance)?;
        tx.staged.insert(key, row);
        Ok(())
    }
}
