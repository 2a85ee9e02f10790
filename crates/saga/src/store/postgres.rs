use std::sync::Arc;

use async_trait::async_trait;
use common::SagaId;
use msg::{Transactor, TypeRegistry};
use sqlx::{PgPool, Postgres, Row, Transaction};

use super::InstanceStore;
use crate::instance::{Instance, SagaData};
use crate::{Result, SagaError};

pub const DEFAULT_TABLE_NAME: &str = "saga_instances";

/// Settings for [`PostgresInstanceStore`].
#[derive(Debug, Clone)]
pub struct PostgresStoreConfig {
    /// Table holding the instances, optionally schema qualified.
    pub table_name: String,
}

impl Default for PostgresStoreConfig {
    fn default() -> Self {
        Self {
            table_name: DEFAULT_TABLE_NAME.to_string(),
        }
    }
}

impl PostgresStoreConfig {
    pub fn with_table_name(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
        }
    }

    /// Rejects table names that are not plain or schema qualified SQL
    /// identifiers. The name is spliced into statements.
    pub fn validate(&self) -> Result<()> {
        let valid = !self.table_name.is_empty()
            && self.table_name.split('.').count() <= 2
            && self.table_name.split('.').all(|part| {
                let mut chars = part.chars();
                chars
                    .next()
                    .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            });
        if valid {
            Ok(())
        } else {
            Err(SagaError::InvalidConfig(format!(
                "invalid table name: {:?}",
                self.table_name
            )))
        }
    }
}

/// PostgreSQL-backed instance store.
///
/// Saga data is stored as bytes produced by the registry's marshaller,
/// tagged with the data type name.
#[derive(Clone)]
pub struct PostgresInstanceStore {
    pool: PgPool,
    registry: Arc<TypeRegistry>,
    table: String,
}

impl PostgresInstanceStore {
    pub fn new(
        pool: PgPool,
        registry: Arc<TypeRegistry>,
        config: PostgresStoreConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            pool,
            registry,
            table: config.table_name,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }
}

#[async_trait]
impl Transactor for PostgresInstanceStore {
    type Tx = Transaction<'static, Postgres>;
    type Error = sqlx::Error;

    async fn begin(&self) -> std::result::Result<Self::Tx, Self::Error> {
        self.pool.begin().await
    }

    async fn commit(&self, tx: Self::Tx) -> std::result::Result<(), Self::Error> {
        tx.commit().await
    }

    async fn rollback(&self, tx: Self::Tx) -> std::result::Result<(), Self::Error> {
        tx.rollback().await
    }
}

#[async_trait]
impl InstanceStore for PostgresInstanceStore {
    #[tracing::instrument(skip(self, tx))]
    async fn find<D: SagaData>(
        &self,
        tx: &mut Self::Tx,
        saga_name: &str,
        saga_id: SagaId,
    ) -> Result<Instance<D>> {
        let row = sqlx::query(&format!(
            "SELECT saga_data_name, saga_data, current_step, end_state, compensating \
             FROM {} WHERE saga_name = $1 AND saga_id = $2 LIMIT 1",
            self.table
        ))
        .bind(saga_name)
        .bind(saga_id.to_string())
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| SagaError::InstanceNotFound {
            saga_name: saga_name.to_string(),
            saga_id,
        })?;

        let data_name: String = row.try_get("saga_data_name")?;
        let bytes: Vec<u8> = row.try_get("saga_data")?;
        let data: D = self.registry.deserialize_as(&data_name, &bytes)?;

        Ok(Instance::from_parts(
            saga_id,
            saga_name,
            data,
            row.try_get("current_step")?,
            row.try_get("end_state")?,
            row.try_get("compensating")?,
        ))
    }

    #[tracing::instrument(skip_all, fields(saga_name = instance.saga_name(), saga_id = %instance.saga_id()))]
    async fn save<D: SagaData>(&self, tx: &mut Self::Tx, instance: &Instance<D>) -> Result<()> {
        let data = self.registry.serialize(instance.data())?;

        sqlx::query(&format!(
            r#"
            INSERT INTO {} (saga_name, saga_id, saga_data_name, saga_data, current_step, end_state, compensating, modified_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, CURRENT_TIMESTAMP)
            "#,
            self.table
        ))
        .bind(instance.saga_name())
        .bind(instance.saga_id().to_string())
        .bind(instance.data_name())
        .bind(data)
        .bind(instance.current_step())
        .bind(instance.end_state())
        .bind(instance.compensating())
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.is_unique_violation()
            {
                return SagaError::DuplicateInstance {
                    saga_name: instance.saga_name().to_string(),
                    saga_id: instance.saga_id(),
                };
            }
            SagaError::Database(e)
        })?;

        Ok(())
    }

    #[tracing::instrument(skip_all, fields(saga_name = instance.saga_name(), saga_id = %instance.saga_id()))]
    async fn update<D: SagaData>(&self, tx: &mut Self::Tx, instance: &Instance<D>) -> Result<()> {
        let data = self.registry.serialize(instance.data())?;

        let result = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET saga_data = $1, current_step = $2, end_state = $3, compensating = $4, modified_at = CURRENT_TIMESTAMP
            WHERE saga_name = $5 AND saga_id = $6
            "#,
            self.table
        ))
        .bind(data)
        .bind(instance.current_step())
        .bind(instance.end_state())
        .bind(instance.compensating())
        .bind(instance.saga_name())
        .bind(instance.saga_id().to_string())
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SagaError::InstanceNotFound {
                saga_name: instance.saga_name().to_string(),
                saga_id: instance.saga_id(),
            });
        }

        Ok(())
    }
}
