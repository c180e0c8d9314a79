//! Flow builder
//!
//! Composition-style construction: the user builds a `FlowDefinition` and
//! hands it to the engine. Building is pure; nothing here touches a store or
//! the mediator. Attachment methods (`compensate`, `retry`, `timeout`,
//! `on_complete`, `on_item_fail`) modify the most recently added node and
//! panic when called out of order, which is a construction bug, not a
//! runtime condition.

use std::sync::Arc;
use std::time::Duration;

use cv_domain::{CvResult, MediatorError, Request};
use cv_mediator::behaviors::RetryPolicy;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::ast::{
    FlowBranch, FlowDefinition, FlowNode, ForEachNode, ForEachPolicy, IfNode, ItemFn, SendNode,
    StepNode, SwitchNode, WhenAllNode, WhenAnyNode,
};
use crate::context::FlowContext;

/// Builder for a [`FlowDefinition`].
pub struct FlowBuilder<S> {
    name: String,
    nodes: Vec<FlowNode<S>>,
}

impl<S: Send + Sync + 'static> FlowBuilder<S> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
        }
    }

    fn sub() -> Self {
        Self::new("")
    }

    /// Add a step executing `body` with exclusive state access.
    pub fn step<F>(mut self, name: impl Into<String>, body: F) -> Self
    where
        F: for<'a> Fn(&'a mut S, &'a FlowContext) -> BoxFuture<'a, CvResult<()>>
            + Send
            + Sync
            + 'static,
    {
        self.nodes.push(FlowNode::Step(StepNode {
            name: name.into(),
            body: Arc::new(body),
            compensate: None,
            retry: None,
            timeout: None,
        }));
        self
    }

    /// Attach a compensation body to the step or send added last.
    ///
    /// When a later step fails, compensations of completed steps run in
    /// reverse completion order.
    pub fn compensate<F>(mut self, body: F) -> Self
    where
        F: for<'a> Fn(&'a mut S, &'a FlowContext) -> BoxFuture<'a, CvResult<()>>
            + Send
            + Sync
            + 'static,
    {
        match self.nodes.last_mut() {
            Some(FlowNode::Step(step)) => step.compensate = Some(Arc::new(body)),
            Some(FlowNode::Send(send)) => send.compensate = Some(Arc::new(body)),
            _ => panic!("compensate() must follow step() or send()"),
        }
        self
    }

    /// Attach a retry policy to the step added last.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        match self.nodes.last_mut() {
            Some(FlowNode::Step(step)) => step.retry = Some(policy),
            _ => panic!("retry() must follow step()"),
        }
        self
    }

    /// Attach a timeout to the step added last; elapsing counts as step
    /// failure.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        match self.nodes.last_mut() {
            Some(FlowNode::Step(step)) => step.timeout = Some(timeout),
            _ => panic!("timeout() must follow step()"),
        }
        self
    }

    /// Add a mediator dispatch: build a request from state, send it, write
    /// the typed result back through `sink`. The node advances regardless of
    /// the dispatch outcome; the sink owns failure handling.
    pub fn send<R, Factory, Sink>(
        mut self,
        name: impl Into<String>,
        factory: Factory,
        sink: Sink,
    ) -> Self
    where
        R: Request + Clone,
        Factory: Fn(&S) -> R + Send + Sync + 'static,
        Sink: Fn(&mut S, CvResult<R::Response>) + Send + Sync + 'static,
    {
        let factory = Arc::new(factory);
        let sink = Arc::new(sink);
        let run: crate::ast::StepFn<S> = Arc::new(move |state, ctx| {
            let factory = Arc::clone(&factory);
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                let Some(mediator) = ctx.mediator.clone() else {
                    return Err(MediatorError::configuration(
                        "flow engine has no mediator configured for send nodes",
                    ));
                };
                let request = factory(&*state);
                let result = mediator.send(request, ctx.dispatch_context()).await;
                sink(&mut *state, result);
                Ok(())
            })
        });
        self.nodes.push(FlowNode::Send(SendNode {
            name: name.into(),
            run,
            compensate: None,
        }));
        self
    }

    /// Add an if/else-if/else chain.
    pub fn conditional(
        mut self,
        name: impl Into<String>,
        build: impl FnOnce(ConditionBuilder<S>) -> ConditionBuilder<S>,
    ) -> Self {
        let chain = build(ConditionBuilder::new());
        self.nodes.push(FlowNode::If(IfNode {
            name: name.into(),
            branches: chain.branches,
            else_branch: chain.else_branch,
        }));
        self
    }

    /// Sugar for a conditional with one branch.
    pub fn if_then(
        self,
        name: impl Into<String>,
        predicate: impl Fn(&S) -> bool + Send + Sync + 'static,
        then_branch: impl FnOnce(FlowBuilder<S>) -> FlowBuilder<S>,
    ) -> Self {
        self.conditional(name, |c| c.when(predicate, then_branch))
    }

    /// Sugar for a conditional with a then and an else branch.
    pub fn if_then_else(
        self,
        name: impl Into<String>,
        predicate: impl Fn(&S) -> bool + Send + Sync + 'static,
        then_branch: impl FnOnce(FlowBuilder<S>) -> FlowBuilder<S>,
        else_branch: impl FnOnce(FlowBuilder<S>) -> FlowBuilder<S>,
    ) -> Self {
        self.conditional(name, |c| {
            c.when(predicate, then_branch).otherwise(else_branch)
        })
    }

    /// Add a value dispatch over `selector`; exactly one case (or the
    /// default) executes.
    pub fn switch(
        mut self,
        name: impl Into<String>,
        selector: impl Fn(&S) -> String + Send + Sync + 'static,
        build: impl FnOnce(CaseBuilder<S>) -> CaseBuilder<S>,
    ) -> Self {
        let cases = build(CaseBuilder::new());
        self.nodes.push(FlowNode::Switch(SwitchNode {
            name: name.into(),
            selector: Arc::new(selector),
            cases: cases.cases,
            default: cases.default,
        }));
        self
    }

    /// Add a loop over a sequence snapshotted at entry.
    ///
    /// The body runs without state access so up to `parallelism` items can
    /// be in flight; each outcome merges into state serially through
    /// `merge(state, item_index, outcome)`.
    pub fn for_each<T, O, Seq, Body, Merge>(
        mut self,
        name: impl Into<String>,
        sequence: Seq,
        parallelism: usize,
        policy: ForEachPolicy,
        body: Body,
        merge: Merge,
    ) -> Self
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        O: Serialize + DeserializeOwned + Send + 'static,
        Seq: Fn(&S) -> Vec<T> + Send + Sync + 'static,
        Body: Fn(T, FlowContext) -> BoxFuture<'static, CvResult<O>> + Send + Sync + 'static,
        Merge: Fn(&mut S, usize, CvResult<O>) + Send + Sync + 'static,
    {
        let body = Arc::new(body);
        let item_fn: ItemFn = Arc::new(move |value, ctx| {
            let body = Arc::clone(&body);
            Box::pin(async move {
                let item: T = serde_json::from_value(value)
                    .map_err(|e| MediatorError::fatal(format!("undecodable loop item: {e}")))?;
                let output = body(item, ctx).await?;
                serde_json::to_value(output)
                    .map_err(|e| MediatorError::fatal(format!("unencodable loop output: {e}")))
            })
        });

        self.nodes.push(FlowNode::ForEach(ForEachNode {
            name: name.into(),
            sequence: Arc::new(move |state| {
                sequence(state)
                    .into_iter()
                    .map(|item| serde_json::to_value(item).unwrap_or(serde_json::Value::Null))
                    .collect()
            }),
            body: item_fn,
            merge: Arc::new(move |state, index, outcome| {
                let typed = outcome.and_then(|value| {
                    serde_json::from_value::<O>(value).map_err(|e| {
                        MediatorError::fatal(format!("undecodable loop output: {e}"))
                    })
                });
                merge(state, index, typed);
            }),
            parallelism: parallelism.max(1),
            policy,
            on_item_fail: None,
            on_complete: None,
        }));
        self
    }

    /// Attach a per-failure hook to the loop added last.
    pub fn on_item_fail(
        mut self,
        hook: impl Fn(&mut S, usize, &MediatorError) + Send + Sync + 'static,
    ) -> Self {
        match self.nodes.last_mut() {
            Some(FlowNode::ForEach(node)) => node.on_item_fail = Some(Arc::new(hook)),
            _ => panic!("on_item_fail() must follow for_each()"),
        }
        self
    }

    /// Attach a completion hook to the loop added last; runs once, also for
    /// an empty sequence.
    pub fn on_complete(mut self, hook: impl Fn(&mut S) + Send + Sync + 'static) -> Self {
        match self.nodes.last_mut() {
            Some(FlowNode::ForEach(node)) => node.on_complete = Some(Arc::new(hook)),
            _ => panic!("on_complete() must follow for_each()"),
        }
        self
    }

    /// Add a parallel group succeeding only when every branch succeeds.
    ///
    /// Branches run against independent state copies and must not depend on
    /// each other; `merge(state, branch_states)` reconciles on the engine's
    /// thread after the join.
    pub fn when_all(
        mut self,
        name: impl Into<String>,
        build: impl FnOnce(BranchGroupBuilder<S>) -> BranchGroupBuilder<S>,
        merge: impl Fn(&mut S, Vec<S>) + Send + Sync + 'static,
    ) -> Self {
        let group = build(BranchGroupBuilder::new());
        self.nodes.push(FlowNode::WhenAll(WhenAllNode {
            name: name.into(),
            branches: group.branches,
            merge: Arc::new(merge),
        }));
        self
    }

    /// Add a parallel race succeeding with the first branch that does;
    /// `adopt(state, winner_state, winner_index)` applies the winner.
    pub fn when_any(
        mut self,
        name: impl Into<String>,
        build: impl FnOnce(BranchGroupBuilder<S>) -> BranchGroupBuilder<S>,
        adopt: impl Fn(&mut S, S, usize) + Send + Sync + 'static,
    ) -> Self {
        let group = build(BranchGroupBuilder::new());
        self.nodes.push(FlowNode::WhenAny(WhenAnyNode {
            name: name.into(),
            branches: group.branches,
            adopt: Arc::new(adopt),
        }));
        self
    }

    pub fn build(self) -> FlowDefinition<S> {
        FlowDefinition {
            name: self.name,
            nodes: self.nodes,
        }
    }

    fn into_nodes(self) -> Vec<FlowNode<S>> {
        self.nodes
    }
}

/// Builds the condition chain of an `If` node.
pub struct ConditionBuilder<S> {
    branches: Vec<(crate::ast::PredicateFn<S>, Vec<FlowNode<S>>)>,
    else_branch: Option<Vec<FlowNode<S>>>,
}

impl<S: Send + Sync + 'static> ConditionBuilder<S> {
    fn new() -> Self {
        Self {
            branches: Vec::new(),
            else_branch: None,
        }
    }

    pub fn when(
        mut self,
        predicate: impl Fn(&S) -> bool + Send + Sync + 'static,
        build: impl FnOnce(FlowBuilder<S>) -> FlowBuilder<S>,
    ) -> Self {
        self.branches.push((
            Arc::new(predicate),
            build(FlowBuilder::sub()).into_nodes(),
        ));
        self
    }

    pub fn otherwise(
        mut self,
        build: impl FnOnce(FlowBuilder<S>) -> FlowBuilder<S>,
    ) -> Self {
        self.else_branch = Some(build(FlowBuilder::sub()).into_nodes());
        self
    }
}

/// Builds the case table of a `Switch` node.
pub struct CaseBuilder<S> {
    cases: Vec<(String, Vec<FlowNode<S>>)>,
    default: Option<Vec<FlowNode<S>>>,
}

impl<S: Send + Sync + 'static> CaseBuilder<S> {
    fn new() -> Self {
        Self {
            cases: Vec::new(),
            default: None,
        }
    }

    pub fn case(
        mut self,
        key: impl Into<String>,
        build: impl FnOnce(FlowBuilder<S>) -> FlowBuilder<S>,
    ) -> Self {
        self.cases
            .push((key.into(), build(FlowBuilder::sub()).into_nodes()));
        self
    }

    pub fn default(mut self, build: impl FnOnce(FlowBuilder<S>) -> FlowBuilder<S>) -> Self {
        self.default = Some(build(FlowBuilder::sub()).into_nodes());
        self
    }
}

/// Builds the branch list of a parallel group.
pub struct BranchGroupBuilder<S> {
    branches: Vec<FlowBranch<S>>,
}

impl<S: Send + Sync + 'static> BranchGroupBuilder<S> {
    fn new() -> Self {
        Self {
            branches: Vec::new(),
        }
    }

    pub fn branch(
        mut self,
        name: impl Into<String>,
        build: impl FnOnce(FlowBuilder<S>) -> FlowBuilder<S>,
    ) -> Self {
        self.branches.push(FlowBranch {
            name: name.into(),
            nodes: build(FlowBuilder::sub()).into_nodes(),
        });
        self
    }
}
