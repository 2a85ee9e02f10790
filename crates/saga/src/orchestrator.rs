//! Drives saga instances through their definition.
//!
//! The orchestrator is a [`TransactionalReceiver`] for the definition's reply
//! channel. Wrap it in an [`Outbox`](msg::Outbox) built on the same store so
//! that instance updates and the rollback on error share one transaction.
//! Step callbacks receive that transaction as their scope, so their writes
//! share its fate.
//!
//! Terminal hooks run only after the final instance update succeeds. They
//! still run before the caller commits, so a failed commit followed by
//! redelivery can run them again.

use std::sync::Arc;

use async_trait::async_trait;
use common::{RequestContext, SagaId};
use msg::headers::{MESSAGE_REPLY_NAME, MESSAGE_REPLY_OUTCOME, REPLY_OUTCOME_SUCCESS};
use msg::{Headers, Message, MsgError, Publisher, ReplyMessage, TransactionalReceiver};

use crate::definition::{SagaDefinition, SagaHook};
use crate::headers::{
    MESSAGE_COMMAND_SAGA_ID, MESSAGE_COMMAND_SAGA_NAME, MESSAGE_REPLY_SAGA_ID,
    MESSAGE_REPLY_SAGA_NAME,
};
use crate::instance::{Instance, SagaData};
use crate::step::{StepContext, StepResults};
use crate::store::InstanceStore;
use crate::{Result, SagaError};

/// Starts sagas and advances them as replies arrive.
pub struct Orchestrator<D, St: InstanceStore> {
    definition: Arc<SagaDefinition<D, St::Tx>>,
    store: Arc<St>,
    publisher: Arc<Publisher>,
}

impl<D, St> Orchestrator<D, St>
where
    D: SagaData,
    St: InstanceStore,
{
    pub fn new(
        definition: SagaDefinition<D, St::Tx>,
        store: Arc<St>,
        publisher: Arc<Publisher>,
    ) -> Self {
        tracing::info!(saga_name = definition.name(), "Orchestrator constructed");
        Self {
            definition: Arc::new(definition),
            store,
            publisher,
        }
    }

    pub fn definition(&self) -> &SagaDefinition<D, St::Tx> {
        &self.definition
    }

    /// Channel the orchestrator must be subscribed to.
    pub fn reply_channel(&self) -> &str {
        self.definition.reply_channel()
    }

    /// Creates a new instance for `data`, persists it and runs the saga up
    /// to its first remote step.
    ///
    /// The instance is saved before any command is published. Commit `tx`
    /// afterwards; the instance is not visible until then.
    #[tracing::instrument(skip_all, fields(saga_name = self.definition.name()))]
    pub async fn start(
        &self,
        tx: &mut St::Tx,
        ctx: &RequestContext,
        data: D,
    ) -> Result<Instance<D>> {
        let mut instance = Instance::new(self.definition.name(), data);
        self.store.save(tx, &instance).await?;

        tracing::info!(saga_id = %instance.saga_id(), "Saga started");
        metrics::counter!("saga_started_total", "saga_name" => self.definition.name().to_string())
            .increment(1);
        self.definition.on_hook(SagaHook::Starting, &instance);

        let results = self
            .execute_next_step(tx, ctx, instance.step_context(), instance.data_mut())
            .await;
        self.process_results(tx, ctx, &mut instance, results).await?;

        Ok(instance)
    }

    #[tracing::instrument(
        skip_all,
        fields(saga_name = self.definition.name(), message_id = message.id())
    )]
    async fn receive_reply(
        &self,
        tx: &mut St::Tx,
        ctx: &RequestContext,
        message: &Message,
    ) -> Result<()> {
        let (reply_name, saga_id, saga_name) = match reply_info(message.headers()) {
            Ok(info) => info,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read saga reply headers");
                return Ok(());
            }
        };

        if saga_name != self.definition.name() {
            tracing::error!(reply_saga_name = saga_name, "Reply belongs to another saga");
            return Ok(());
        }

        let saga_id: SagaId = match saga_id.parse() {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(saga_id, error = %e, "Failed to parse saga id");
                return Ok(());
            }
        };

        let reply = match self
            .publisher
            .registry()
            .deserialize(reply_name, message.payload())
        {
            Ok(reply) => ReplyMessage::from_parts(reply, message.headers().clone()),
            Err(e) => {
                tracing::error!(reply_name, %saga_id, error = %e, "Failed to decode reply payload");
                return Ok(());
            }
        };

        let mut instance = match self.store.find::<D>(tx, saga_name, saga_id).await {
            Ok(instance) => instance,
            Err(e @ SagaError::InstanceNotFound { .. }) => {
                tracing::error!(%saga_id, error = %e, "Failed to locate saga instance");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if instance.end_state() {
            tracing::warn!(%saga_id, reply_name, "Reply received for a finished saga");
            return Ok(());
        }

        tracing::debug!(%saga_id, reply_name, step = instance.current_step(), "Received saga reply");

        let results = self
            .handle_reply(tx, ctx, instance.step_context(), instance.data_mut(), &reply)
            .await?;
        self.process_results(tx, ctx, &mut instance, results).await
    }

    /// Publishes, persists and, for local steps, keeps going until the saga
    /// waits on a remote reply or ends.
    async fn process_results(
        &self,
        tx: &mut St::Tx,
        ctx: &RequestContext,
        instance: &mut Instance<D>,
        mut results: StepResults,
    ) -> Result<()> {
        loop {
            if let Some(failure) = results.failure.take() {
                tracing::warn!(
                    saga_id = %instance.saga_id(),
                    step = results.step_context.step,
                    error = %failure,
                    "Local step failed"
                );
                results = self
                    .handle_reply(
                        tx,
                        ctx,
                        results.step_context,
                        instance.data_mut(),
                        &ReplyMessage::with_failure(),
                    )
                    .await?;
                continue;
            }

            let saga_headers = Headers::from([
                (MESSAGE_COMMAND_SAGA_ID, instance.saga_id().to_string()),
                (MESSAGE_COMMAND_SAGA_NAME, instance.saga_name().to_string()),
            ]);
            for command in &results.commands {
                self.publisher
                    .publish_command(ctx, self.definition.reply_channel(), command, &saga_headers)
                    .await?;
            }

            instance.apply_step_context(results.step_context);
            self.store.update(tx, instance).await.inspect_err(|e| {
                tracing::error!(saga_id = %instance.saga_id(), error = %e, "Failed to update saga instance");
            })?;

            if results.step_context.ended {
                self.process_end(instance);
            }

            if !results.local {
                return Ok(());
            }

            results = self
                .handle_reply(
                    tx,
                    ctx,
                    results.step_context,
                    instance.data_mut(),
                    &ReplyMessage::with_success(),
                )
                .await?;
        }
    }

    fn process_end(&self, instance: &Instance<D>) {
        let saga_name = self.definition.name().to_string();
        if instance.compensating() {
            tracing::info!(saga_id = %instance.saga_id(), "Saga compensated");
            metrics::counter!("saga_compensated_total", "saga_name" => saga_name).increment(1);
            self.definition.on_hook(SagaHook::Compensated, instance);
        } else {
            tracing::info!(saga_id = %instance.saga_id(), "Saga completed");
            metrics::counter!("saga_completed_total", "saga_name" => saga_name).increment(1);
            self.definition.on_hook(SagaHook::Completed, instance);
        }
    }

    /// Applies a reply to the step at `context` and picks what runs next.
    async fn handle_reply(
        &self,
        tx: &mut St::Tx,
        ctx: &RequestContext,
        context: StepContext,
        data: &mut D,
        reply: &ReplyMessage,
    ) -> Result<StepResults> {
        let steps = self.definition.steps();
        let step = usize::try_from(context.step)
            .ok()
            .and_then(|index| steps.get(index))
            .ok_or(SagaError::StepOutOfBounds {
                step: context.step,
                steps: steps.len(),
            })?;

        if let Some(handler) = step.reply_handler(reply.reply_name(), context.compensating) {
            handler
                .handle(tx, ctx, data, reply.reply())
                .await
                .map_err(SagaError::ReplyHandler)?;
        }

        let outcome = reply.headers().get_required(MESSAGE_REPLY_OUTCOME)?;
        if outcome == REPLY_OUTCOME_SUCCESS {
            Ok(self.execute_next_step(tx, ctx, context, data).await)
        } else if context.compensating {
            Err(SagaError::DoubleFailure { step: context.step })
        } else {
            tracing::info!(step = context.step, "Compensating saga");
            Ok(self
                .execute_next_step(tx, ctx, context.compensate(), data)
                .await)
        }
    }

    /// Runs the first step after `context.step`, in the current direction,
    /// that has something to do. Ends the saga when there is none.
    async fn execute_next_step(
        &self,
        tx: &mut St::Tx,
        ctx: &RequestContext,
        context: StepContext,
        data: &mut D,
    ) -> StepResults {
        let direction = if context.compensating { -1 } else { 1 };
        let steps = self.definition.steps();

        let mut index = context.step + direction;
        while let Some(step) = usize::try_from(index).ok().and_then(|i| steps.get(i)) {
            if step
                .has_invocable_action(tx, ctx, data, context.compensating)
                .await
            {
                let next = context.next((index - context.step).abs());
                return step
                    .execute(tx, ctx, data, context.compensating, next)
                    .await;
            }
            index += direction;
        }

        StepResults::ended(context)
    }
}

fn reply_info(headers: &Headers) -> msg::Result<(&str, &str, &str)> {
    Ok((
        headers.get_required(MESSAGE_REPLY_NAME)?,
        headers.get_required(MESSAGE_REPLY_SAGA_ID)?,
        headers.get_required(MESSAGE_REPLY_SAGA_NAME)?,
    ))
}

#[async_trait]
impl<D, St> TransactionalReceiver<St::Tx> for Orchestrator<D, St>
where
    D: SagaData,
    St: InstanceStore + 'static,
{
    async fn receive_in_transaction(
        &self,
        tx: &mut St::Tx,
        ctx: &RequestContext,
        message: &Message,
    ) -> msg::Result<()> {
        self.receive_reply(tx, ctx, message)
            .await
            .map_err(MsgError::from)
    }
}
