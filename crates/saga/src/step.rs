//! Saga steps and the per-message step state.
//!
//! Step callbacks receive the scope `S` of the message being processed (the
//! instance store's transaction when run by an
//! [`Orchestrator`](crate::Orchestrator)) and its [`RequestContext`]. Work a
//! local step does through the scope commits or rolls back together with
//! the instance update.
//!
//! Plain closures can be registered with [`LocalStep::action`],
//! [`RemoteStep::action`] and friends; they see only the saga data.
//! Implement [`LocalAction`], [`RemoteAction`], [`StepPredicate`] or
//! [`ReplyHandler`] to reach the scope.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use common::RequestContext;
use msg::{BoxError, DomainCommand, Payload, Reply};

use crate::instance::SagaData;

/// Decides whether an action runs for the current saga data.
#[async_trait]
pub trait StepPredicate<D, S = ()>: Send + Sync {
    async fn holds(&self, scope: &mut S, ctx: &RequestContext, data: &D) -> bool;
}

/// Work done by a local step inside the message's transaction.
#[async_trait]
pub trait LocalAction<D, S = ()>: Send + Sync {
    async fn run(
        &self,
        scope: &mut S,
        ctx: &RequestContext,
        data: &mut D,
    ) -> std::result::Result<(), BoxError>;
}

/// Builds the commands a remote step sends, in order.
#[async_trait]
pub trait RemoteAction<D, S = ()>: Send + Sync {
    async fn commands(&self, scope: &mut S, ctx: &RequestContext, data: &D) -> Vec<DomainCommand>;
}

/// Folds a reply into the saga data before the saga moves on.
#[async_trait]
pub trait ReplyHandler<D, S = ()>: Send + Sync {
    async fn handle(
        &self,
        scope: &mut S,
        ctx: &RequestContext,
        data: &mut D,
        reply: &dyn Payload,
    ) -> std::result::Result<(), BoxError>;
}

struct FnPredicate<P>(P);

#[async_trait]
impl<D, S, P> StepPredicate<D, S> for FnPredicate<P>
where
    D: Sync,
    S: Send,
    P: Fn(&D) -> bool + Send + Sync,
{
    async fn holds(&self, _scope: &mut S, _ctx: &RequestContext, data: &D) -> bool {
        (self.0)(data)
    }
}

struct FnLocalAction<F>(F);

#[async_trait]
impl<D, S, F> LocalAction<D, S> for FnLocalAction<F>
where
    D: Send,
    S: Send,
    F: Fn(&mut D) -> std::result::Result<(), BoxError> + Send + Sync,
{
    async fn run(
        &self,
        _scope: &mut S,
        _ctx: &RequestContext,
        data: &mut D,
    ) -> std::result::Result<(), BoxError> {
        (self.0)(data)
    }
}

struct FnRemoteAction<F>(F);

#[async_trait]
impl<D, S, F> RemoteAction<D, S> for FnRemoteAction<F>
where
    D: Sync,
    S: Send,
    F: Fn(&D) -> Vec<DomainCommand> + Send + Sync,
{
    async fn commands(&self, _scope: &mut S, _ctx: &RequestContext, data: &D) -> Vec<DomainCommand> {
        (self.0)(data)
    }
}

struct TypedReplyHandler<R, F> {
    f: F,
    _reply: PhantomData<fn() -> R>,
}

#[async_trait]
impl<D, S, R, F> ReplyHandler<D, S> for TypedReplyHandler<R, F>
where
    D: Send,
    S: Send,
    R: Reply,
    F: Fn(&mut D, &R) -> std::result::Result<(), BoxError> + Send + Sync,
{
    async fn handle(
        &self,
        _scope: &mut S,
        _ctx: &RequestContext,
        data: &mut D,
        reply: &dyn Payload,
    ) -> std::result::Result<(), BoxError> {
        let reply = reply.downcast_ref::<R>().ok_or_else(|| {
            format!(
                "expected reply {}, received {}",
                R::NAME,
                reply.payload_name()
            )
        })?;
        (self.f)(data, reply)
    }
}

fn typed_reply_handler<D, S, R, F>(f: F) -> Arc<dyn ReplyHandler<D, S>>
where
    D: Send,
    S: Send,
    R: Reply,
    F: Fn(&mut D, &R) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
{
    Arc::new(TypedReplyHandler {
        f,
        _reply: PhantomData,
    })
}

/// Position of a saga between two messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepContext {
    pub step: i32,
    pub compensating: bool,
    pub ended: bool,
}

impl StepContext {
    /// Moves `delta` steps in the current direction.
    pub fn next(self, delta: i32) -> Self {
        let step = if self.compensating {
            self.step - delta
        } else {
            self.step + delta
        };
        Self { step, ..self }
    }

    /// Switches to walking backwards.
    pub fn compensate(self) -> Self {
        Self {
            compensating: true,
            ..self
        }
    }

    pub fn end(self) -> Self {
        Self {
            ended: true,
            ..self
        }
    }
}

/// What executing one step produced.
///
/// Saga data changes are applied in place; the orchestrator persists them
/// with the updated step context.
pub struct StepResults {
    pub commands: Vec<DomainCommand>,
    pub step_context: StepContext,
    /// The step finished without a remote round trip.
    pub local: bool,
    /// A local step failed.
    pub failure: Option<BoxError>,
}

impl StepResults {
    pub(crate) fn ended(context: StepContext) -> Self {
        Self {
            commands: Vec::new(),
            step_context: context.end(),
            local: false,
            failure: None,
        }
    }
}

impl fmt::Debug for StepResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepResults")
            .field("commands", &self.commands.len())
            .field("step_context", &self.step_context)
            .field("local", &self.local)
            .field("failure", &self.failure.as_ref().map(ToString::to_string))
            .finish()
    }
}

struct Action<H: ?Sized, D, S> {
    predicate: Option<Arc<dyn StepPredicate<D, S>>>,
    handler: Arc<H>,
}

impl<H: ?Sized, D, S> Action<H, D, S> {
    async fn is_invocable(&self, scope: &mut S, ctx: &RequestContext, data: &D) -> bool {
        match &self.predicate {
            Some(predicate) => predicate.holds(scope, ctx, data).await,
            None => true,
        }
    }
}

type LocalHandler<D, S> = Action<dyn LocalAction<D, S>, D, S>;
type RemoteHandler<D, S> = Action<dyn RemoteAction<D, S>, D, S>;

/// A step that runs inside the orchestrator's transaction.
pub struct LocalStep<D, S = ()> {
    action: Option<LocalHandler<D, S>>,
    compensation: Option<LocalHandler<D, S>>,
}

impl<D: SagaData, S: Send> LocalStep<D, S> {
    fn new() -> Self {
        Self {
            action: None,
            compensation: None,
        }
    }

    pub fn action<F>(self, f: F) -> Self
    where
        F: Fn(&mut D) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        self.action_with(FnLocalAction(f))
    }

    /// Runs the action only when `predicate` holds.
    pub fn action_if<P, F>(self, predicate: P, f: F) -> Self
    where
        P: Fn(&D) -> bool + Send + Sync + 'static,
        F: Fn(&mut D) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        self.action_when(FnPredicate(predicate), FnLocalAction(f))
    }

    /// Runs `action` with the message's scope and context.
    pub fn action_with(self, action: impl LocalAction<D, S> + 'static) -> Self {
        self.set_action(None, Arc::new(action))
    }

    pub fn action_when(
        self,
        predicate: impl StepPredicate<D, S> + 'static,
        action: impl LocalAction<D, S> + 'static,
    ) -> Self {
        self.set_action(Some(Arc::new(predicate)), Arc::new(action))
    }

    pub fn compensation<F>(self, f: F) -> Self
    where
        F: Fn(&mut D) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        self.compensation_with(FnLocalAction(f))
    }

    pub fn compensation_if<P, F>(self, predicate: P, f: F) -> Self
    where
        P: Fn(&D) -> bool + Send + Sync + 'static,
        F: Fn(&mut D) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        self.compensation_when(FnPredicate(predicate), FnLocalAction(f))
    }

    pub fn compensation_with(self, compensation: impl LocalAction<D, S> + 'static) -> Self {
        self.set_compensation(None, Arc::new(compensation))
    }

    pub fn compensation_when(
        self,
        predicate: impl StepPredicate<D, S> + 'static,
        compensation: impl LocalAction<D, S> + 'static,
    ) -> Self {
        self.set_compensation(Some(Arc::new(predicate)), Arc::new(compensation))
    }
}

impl<D, S> LocalStep<D, S> {
    fn set_action(
        mut self,
        predicate: Option<Arc<dyn StepPredicate<D, S>>>,
        handler: Arc<dyn LocalAction<D, S>>,
    ) -> Self {
        self.action = Some(Action { predicate, handler });
        self
    }

    fn set_compensation(
        mut self,
        predicate: Option<Arc<dyn StepPredicate<D, S>>>,
        handler: Arc<dyn LocalAction<D, S>>,
    ) -> Self {
        self.compensation = Some(Action { predicate, handler });
        self
    }

    fn selected(&self, compensating: bool) -> Option<&LocalHandler<D, S>> {
        if compensating {
            self.compensation.as_ref()
        } else {
            self.action.as_ref()
        }
    }
}

/// A step that sends commands to other services and waits for their
/// replies.
pub struct RemoteStep<D, S = ()> {
    action: Option<RemoteHandler<D, S>>,
    compensation: Option<RemoteHandler<D, S>>,
    action_replies: HashMap<&'static str, Arc<dyn ReplyHandler<D, S>>>,
    compensation_replies: HashMap<&'static str, Arc<dyn ReplyHandler<D, S>>>,
}

impl<D: SagaData, S: Send> RemoteStep<D, S> {
    fn new() -> Self {
        Self {
            action: None,
            compensation: None,
            action_replies: HashMap::new(),
            compensation_replies: HashMap::new(),
        }
    }

    /// Sends the command built by `f`.
    pub fn action<F>(self, f: F) -> Self
    where
        F: Fn(&D) -> DomainCommand + Send + Sync + 'static,
    {
        self.action_with(FnRemoteAction(move |data: &D| vec![f(data)]))
    }

    pub fn action_if<P, F>(self, predicate: P, f: F) -> Self
    where
        P: Fn(&D) -> bool + Send + Sync + 'static,
        F: Fn(&D) -> DomainCommand + Send + Sync + 'static,
    {
        self.action_when(
            FnPredicate(predicate),
            FnRemoteAction(move |data: &D| vec![f(data)]),
        )
    }

    /// Sends every command built by `f`, in order.
    pub fn action_many<F>(self, f: F) -> Self
    where
        F: Fn(&D) -> Vec<DomainCommand> + Send + Sync + 'static,
    {
        self.action_with(FnRemoteAction(f))
    }

    /// Sends the commands built by `action` with the message's scope and
    /// context.
    pub fn action_with(self, action: impl RemoteAction<D, S> + 'static) -> Self {
        self.set_action(None, Arc::new(action))
    }

    pub fn action_when(
        self,
        predicate: impl StepPredicate<D, S> + 'static,
        action: impl RemoteAction<D, S> + 'static,
    ) -> Self {
        self.set_action(Some(Arc::new(predicate)), Arc::new(action))
    }

    pub fn compensation<F>(self, f: F) -> Self
    where
        F: Fn(&D) -> DomainCommand + Send + Sync + 'static,
    {
        self.compensation_with(FnRemoteAction(move |data: &D| vec![f(data)]))
    }

    pub fn compensation_if<P, F>(self, predicate: P, f: F) -> Self
    where
        P: Fn(&D) -> bool + Send + Sync + 'static,
        F: Fn(&D) -> DomainCommand + Send + Sync + 'static,
    {
        self.compensation_when(
            FnPredicate(predicate),
            FnRemoteAction(move |data: &D| vec![f(data)]),
        )
    }

    pub fn compensation_many<F>(self, f: F) -> Self
    where
        F: Fn(&D) -> Vec<DomainCommand> + Send + Sync + 'static,
    {
        self.compensation_with(FnRemoteAction(f))
    }

    pub fn compensation_with(self, compensation: impl RemoteAction<D, S> + 'static) -> Self {
        self.set_compensation(None, Arc::new(compensation))
    }

    pub fn compensation_when(
        self,
        predicate: impl StepPredicate<D, S> + 'static,
        compensation: impl RemoteAction<D, S> + 'static,
    ) -> Self {
        self.set_compensation(Some(Arc::new(predicate)), Arc::new(compensation))
    }

    /// Handles replies of type `R` to the forward action. A later handler
    /// for the same reply replaces an earlier one.
    pub fn on_action_reply<R, F>(mut self, f: F) -> Self
    where
        R: Reply,
        F: Fn(&mut D, &R) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        self.action_replies.insert(R::NAME, typed_reply_handler(f));
        self
    }

    /// Handles replies named `R::NAME` to the forward action with the
    /// message's scope and context.
    pub fn on_action_reply_with<R: Reply>(
        mut self,
        handler: impl ReplyHandler<D, S> + 'static,
    ) -> Self {
        self.action_replies.insert(R::NAME, Arc::new(handler));
        self
    }

    /// Handles replies of type `R` to the compensation.
    pub fn on_compensation_reply<R, F>(mut self, f: F) -> Self
    where
        R: Reply,
        F: Fn(&mut D, &R) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        self.compensation_replies
            .insert(R::NAME, typed_reply_handler(f));
        self
    }

    pub fn on_compensation_reply_with<R: Reply>(
        mut self,
        handler: impl ReplyHandler<D, S> + 'static,
    ) -> Self {
        self.compensation_replies.insert(R::NAME, Arc::new(handler));
        self
    }
}

impl<D, S> RemoteStep<D, S> {
    fn set_action(
        mut self,
        predicate: Option<Arc<dyn StepPredicate<D, S>>>,
        handler: Arc<dyn RemoteAction<D, S>>,
    ) -> Self {
        self.action = Some(Action { predicate, handler });
        self
    }

    fn set_compensation(
        mut self,
        predicate: Option<Arc<dyn StepPredicate<D, S>>>,
        handler: Arc<dyn RemoteAction<D, S>>,
    ) -> Self {
        self.compensation = Some(Action { predicate, handler });
        self
    }

    fn selected(&self, compensating: bool) -> Option<&RemoteHandler<D, S>> {
        if compensating {
            self.compensation.as_ref()
        } else {
            self.action.as_ref()
        }
    }
}

/// One unit of saga work.
pub enum Step<D, S = ()> {
    Local(LocalStep<D, S>),
    Remote(RemoteStep<D, S>),
}

impl<D: SagaData, S: Send> Step<D, S> {
    pub fn local() -> LocalStep<D, S> {
        LocalStep::new()
    }

    pub fn remote() -> RemoteStep<D, S> {
        RemoteStep::new()
    }

    /// Whether the step has something to run in the given direction.
    pub async fn has_invocable_action(
        &self,
        scope: &mut S,
        ctx: &RequestContext,
        data: &D,
        compensating: bool,
    ) -> bool {
        match self {
            Step::Local(step) => match step.selected(compensating) {
                Some(action) => action.is_invocable(scope, ctx, data).await,
                None => false,
            },
            Step::Remote(step) => match step.selected(compensating) {
                Some(action) => action.is_invocable(scope, ctx, data).await,
                None => false,
            },
        }
    }

    pub fn reply_handler(
        &self,
        reply_name: &str,
        compensating: bool,
    ) -> Option<&Arc<dyn ReplyHandler<D, S>>> {
        match self {
            Step::Local(_) => None,
            Step::Remote(step) if compensating => step.compensation_replies.get(reply_name),
            Step::Remote(step) => step.action_replies.get(reply_name),
        }
    }

    /// Runs the step. `context` is the position the saga moves to.
    pub async fn execute(
        &self,
        scope: &mut S,
        ctx: &RequestContext,
        data: &mut D,
        compensating: bool,
        context: StepContext,
    ) -> StepResults {
        match self {
            Step::Local(step) => {
                let failure = match step.selected(compensating) {
                    Some(action) => action.handler.run(scope, ctx, data).await.err(),
                    None => None,
                };
                StepResults {
                    commands: Vec::new(),
                    step_context: context,
                    local: true,
                    failure,
                }
            }
            Step::Remote(step) => {
                let commands = match step.selected(compensating) {
                    Some(action) => action.handler.commands(scope, ctx, data).await,
                    None => Vec::new(),
                };
                StepResults {
                    commands,
                    step_context: context,
                    local: false,
                    failure: None,
                }
            }
        }
    }
}

impl<D, S> From<LocalStep<D, S>> for Step<D, S> {
    fn from(step: LocalStep<D, S>) -> Self {
        Step::Local(step)
    }
}

impl<D, S> From<RemoteStep<D, S>> for Step<D, S> {
    fn from(step: RemoteStep<D, S>) -> Self {
        Step::Remote(step)
    }
}
