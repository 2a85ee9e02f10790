//! Immutable saga definitions.

use std::fmt;
use std::sync::Arc;

use crate::instance::{Instance, SagaData};
use crate::step::Step;
use crate::{Result, SagaError};

/// Lifecycle points at which a definition can run a hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SagaHook {
    Starting,
    Completed,
    Compensated,
}

impl fmt::Display for SagaHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SagaHook::Starting => write!(f, "Starting"),
            SagaHook::Completed => write!(f, "Completed"),
            SagaHook::Compensated => write!(f, "Compensated"),
        }
    }
}

type HookFn<D> = Arc<dyn Fn(&Instance<D>) + Send + Sync>;

/// Name, reply channel and ordered steps of a saga, shared by all of its
/// instances.
///
/// `S` is the scope step callbacks receive. An [`Orchestrator`] runs the
/// definition with its store's transaction as the scope.
///
/// [`Orchestrator`]: crate::Orchestrator
pub struct SagaDefinition<D, S = ()> {
    name: String,
    reply_channel: String,
    steps: Vec<Step<D, S>>,
    on_starting: Option<HookFn<D>>,
    on_completed: Option<HookFn<D>>,
    on_compensated: Option<HookFn<D>>,
}

impl<D: SagaData, S: Send> SagaDefinition<D, S> {
    /// Starts a definition for the saga `name`, whose participants reply on
    /// `reply_channel`.
    pub fn builder(
        name: impl Into<String>,
        reply_channel: impl Into<String>,
    ) -> SagaDefinitionBuilder<D, S> {
        SagaDefinitionBuilder {
            definition: SagaDefinition {
                name: name.into(),
                reply_channel: reply_channel.into(),
                steps: Vec::new(),
                on_starting: None,
                on_completed: None,
                on_compensated: None,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reply_channel(&self) -> &str {
        &self.reply_channel
    }

    pub fn steps(&self) -> &[Step<D, S>] {
        &self.steps
    }

    /// Runs the hook registered for `hook`, if any.
    pub fn on_hook(&self, hook: SagaHook, instance: &Instance<D>) {
        let registered = match hook {
            SagaHook::Starting => &self.on_starting,
            SagaHook::Completed => &self.on_completed,
            SagaHook::Compensated => &self.on_compensated,
        };
        if let Some(f) = registered {
            tracing::debug!(saga_name = %self.name, saga_id = %instance.saga_id(), %hook, "Running saga hook");
            f(instance);
        }
    }
}

impl<D, S> fmt::Debug for SagaDefinition<D, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaDefinition")
            .field("name", &self.name)
            .field("reply_channel", &self.reply_channel)
            .field("steps", &self.steps.len())
            .finish()
    }
}

/// Builder for [`SagaDefinition`].
pub struct SagaDefinitionBuilder<D, S = ()> {
    definition: SagaDefinition<D, S>,
}

impl<D: SagaData, S: Send> SagaDefinitionBuilder<D, S> {
    /// Appends a step.
    pub fn step(mut self, step: impl Into<Step<D, S>>) -> Self {
        self.definition.steps.push(step.into());
        self
    }

    pub fn on_starting(mut self, f: impl Fn(&Instance<D>) + Send + Sync + 'static) -> Self {
        self.definition.on_starting = Some(Arc::new(f));
        self
    }

    pub fn on_completed(mut self, f: impl Fn(&Instance<D>) + Send + Sync + 'static) -> Self {
        self.definition.on_completed = Some(Arc::new(f));
        self
    }

    pub fn on_compensated(mut self, f: impl Fn(&Instance<D>) + Send + Sync + 'static) -> Self {
        self.definition.on_compensated = Some(Arc::new(f));
        self
    }

    /// Validates and freezes the definition.
    pub fn build(self) -> Result<SagaDefinition<D, S>> {
        let definition = self.definition;
        if definition.name.trim().is_empty() {
            return Err(SagaError::InvalidDefinition(
                "saga name must not be empty".to_string(),
            ));
        }
        if definition.reply_channel.trim().is_empty() {
            return Err(SagaError::InvalidDefinition(format!(
                "saga {} has an empty reply channel",
                definition.name
            )));
        }
        if definition.steps.is_empty() {
            return Err(SagaError::InvalidDefinition(format!(
                "saga {} has no steps",
                definition.name
            )));
        }
        Ok(definition)
    }
}
