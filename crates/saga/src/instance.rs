//! Persistent saga instance state.

use std::fmt;

use common::SagaId;
use msg::Named;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::step::StepContext;

/// Business data carried by a saga run.
///
/// Saga data must be registered with the
/// [`TypeRegistry`](msg::TypeRegistry) so stores can decode it by name.
pub trait SagaData:
    Named + Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static
{
}

impl<T> SagaData for T where
    T: Named + Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static
{
}

/// The step before the first one; a saga that has not executed anything.
pub const SAGA_NOT_STARTED: i32 = -1;

/// One run of a saga.
///
/// Created by [`Orchestrator::start`](crate::Orchestrator::start) and
/// updated after every processed reply. Instances are never deleted.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance<D> {
    saga_id: SagaId,
    saga_name: String,
    data: D,
    current_step: i32,
    end_state: bool,
    compensating: bool,
}

impl<D: SagaData> Instance<D> {
    /// A fresh instance that has not executed any step.
    pub fn new(saga_name: impl Into<String>, data: D) -> Self {
        Self {
            saga_id: SagaId::new(),
            saga_name: saga_name.into(),
            data,
            current_step: SAGA_NOT_STARTED,
            end_state: false,
            compensating: false,
        }
    }

    /// Rebuilds an instance read from a store.
    pub fn from_parts(
        saga_id: SagaId,
        saga_name: impl Into<String>,
        data: D,
        current_step: i32,
        end_state: bool,
        compensating: bool,
    ) -> Self {
        Self {
            saga_id,
            saga_name: saga_name.into(),
            data,
            current_step,
            end_state,
            compensating,
        }
    }

    pub fn saga_id(&self) -> SagaId {
        self.saga_id
    }

    pub fn saga_name(&self) -> &str {
        &self.saga_name
    }

    pub fn data(&self) -> &D {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut D {
        &mut self.data
    }

    /// Wire name of the saga data type.
    pub fn data_name(&self) -> &'static str {
        D::NAME
    }

    pub fn current_step(&self) -> i32 {
        self.current_step
    }

    pub fn end_state(&self) -> bool {
        self.end_state
    }

    pub fn compensating(&self) -> bool {
        self.compensating
    }

    pub(crate) fn step_context(&self) -> StepContext {
        StepContext {
            step: self.current_step,
            compensating: self.compensating,
            ended: self.end_state,
        }
    }

    pub(crate) fn apply_step_context(&mut self, context: StepContext) {
        self.current_step = context.step;
        self.compensating = context.compensating;
        self.end_state = context.ended;
    }
}
