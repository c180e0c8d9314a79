//! Flow engine
//!
//! Interprets a `FlowDefinition` against durable state. The loop:
//! load-or-initialize the snapshot, execute the node at `position`, persist
//! at every node boundary, advance in pre-order. On failure the flow either
//! compensates (reverse completion order) or parks as `Failed` for a later
//! `resume`. Each flow instance executes single-threaded and cooperatively;
//! loop items and parallel branches are the only concurrency, and they never
//! share mutable state.

use std::sync::Arc;

use chrono::Utc;
use cv_domain::{
    CvResult, ErrorKind, FlowSnapshot, FlowState, FlowStatus, FlowStatusMachine, FlowTransition,
    LoopProgress, MediatorError, Position,
};
use cv_mediator::behaviors::RetryPolicy;
use cv_mediator::Mediator;
use cv_ports::{CancellationToken, FlowStore};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, info, instrument, warn};

use crate::ast::{FlowDefinition, FlowNode, ForEachNode, ForEachPolicy, StepNode, WhenAllNode, WhenAnyNode};
use crate::context::FlowContext;

/// Flow engine configuration
#[derive(Debug, Clone, Default)]
pub struct FlowEngineConfig {
    /// Retry policy applied to steps that declare none.
    pub default_retry: Option<RetryPolicy>,
}

/// Interprets flow definitions with durable position and state.
pub struct FlowEngine<FS> {
    store: Arc<FS>,
    mediator: Option<Arc<Mediator>>,
    config: FlowEngineConfig,
}

impl<FS: FlowStore> FlowEngine<FS> {
    pub fn new(store: Arc<FS>) -> Self {
        Self {
            store,
            mediator: None,
            config: FlowEngineConfig::default(),
        }
    }

    pub fn with_mediator(mut self, mediator: Arc<Mediator>) -> Self {
        self.mediator = Some(mediator);
        self
    }

    pub fn with_config(mut self, config: FlowEngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Start (or continue) the flow owning `state`.
    ///
    /// When a snapshot for the state's flow id already exists, the persisted
    /// state and position win over the passed value and execution continues
    /// from where it left off. Terminal flows return their snapshot
    /// untouched.
    pub async fn run<S: FlowState>(
        &self,
        definition: &FlowDefinition<S>,
        state: S,
    ) -> CvResult<FlowSnapshot> {
        self.run_with_cancellation(definition, state, CancellationToken::new())
            .await
    }

    #[instrument(skip(self, definition, state, cancel), fields(flow = %definition.name))]
    pub async fn run_with_cancellation<S: FlowState>(
        &self,
        definition: &FlowDefinition<S>,
        state: S,
        cancel: CancellationToken,
    ) -> CvResult<FlowSnapshot> {
        let flow_id = state.flow_id().to_string();
        match self.store.load(&flow_id).await? {
            Some(snapshot) => {
                if snapshot.status.is_terminal() {
                    return Ok(snapshot);
                }
                let snapshot = prepare_resume(snapshot)?;
                let state: S = decode_state(&snapshot)?;
                self.execute(definition, state, snapshot, cancel).await
            }
            None => {
                let value = serde_json::to_value(&state).map_err(|e| {
                    MediatorError::fatal(format!("unencodable flow state for {flow_id}: {e}"))
                })?;
                let mut state = state;
                state.clear_changes();
                let snapshot = FlowSnapshot::initial(&flow_id, value, Utc::now());
                self.store.save(snapshot.clone()).await?;
                self.execute(definition, state, snapshot, cancel).await
            }
        }
    }

    /// Continue a persisted flow from its snapshot.
    #[instrument(skip(self, definition), fields(flow = %definition.name, flow_id = %flow_id))]
    pub async fn resume<S: FlowState>(
        &self,
        definition: &FlowDefinition<S>,
        flow_id: &str,
    ) -> CvResult<FlowSnapshot> {
        let snapshot = self
            .store
            .load(flow_id)
            .await?
            .ok_or_else(|| MediatorError::not_found(format!("no snapshot for flow {flow_id}")))?;
        if snapshot.status.is_terminal() {
            return Ok(snapshot);
        }
        let snapshot = prepare_resume(snapshot)?;
        let state: S = decode_state(&snapshot)?;
        self.execute(definition, state, snapshot, CancellationToken::new())
            .await
    }

    async fn execute<S: FlowState>(
        &self,
        definition: &FlowDefinition<S>,
        mut state: S,
        mut snapshot: FlowSnapshot,
        cancel: CancellationToken,
    ) -> CvResult<FlowSnapshot> {
        let mut ctx = FlowContext::new(snapshot.flow_id.clone()).with_cancellation(cancel);
        if let Some(mediator) = &self.mediator {
            ctx = ctx.with_mediator(Arc::clone(mediator));
        }

        // A crash mid-compensation resumes compensating, not executing.
        if snapshot.status == FlowStatus::Compensating {
            self.compensate(definition, &mut state, &mut snapshot, &ctx, None)
                .await?;
            return Ok(snapshot);
        }

        let resume_path = snapshot.position.path().to_vec();
        let outcome = self
            .run_sequence(
                &definition.nodes,
                Position::start(),
                resume_path,
                &mut state,
                &mut snapshot,
                &ctx,
            )
            .await;

        match outcome {
            Ok(()) => {
                // Past the last root child.
                snapshot.position = Position::from_path(vec![definition.nodes.len()]);
                snapshot.status =
                    FlowStatusMachine::transition(snapshot.status, FlowTransition::Complete)?;
                snapshot.last_error = None;
                self.persist(&mut state, &mut snapshot).await?;
                info!(flow_id = %snapshot.flow_id, "flow succeeded");
            }
            Err(error) => {
                let compensable = snapshot.completed_steps.iter().any(|p| {
                    definition
                        .resolve(p.path())
                        .is_some_and(|n| n.compensation().is_some())
                });
                if compensable && error.kind != ErrorKind::Cancelled {
                    self.compensate(definition, &mut state, &mut snapshot, &ctx, Some(error))
                        .await?;
                } else {
                    snapshot.status =
                        FlowStatusMachine::transition(snapshot.status, FlowTransition::Fail)?;
                    warn!(
                        flow_id = %snapshot.flow_id,
                        position = %snapshot.position,
                        error = %error,
                        "flow failed"
                    );
                    snapshot.last_error = Some(error);
                    self.persist(&mut state, &mut snapshot).await?;
                }
            }
        }

        Ok(snapshot)
    }

    /// Execute `nodes` under `base`, descending along `resume` first.
    fn run_sequence<'a, S: FlowState>(
        &'a self,
        nodes: &'a [FlowNode<S>],
        base: Position,
        resume: Vec<usize>,
        state: &'a mut S,
        snapshot: &'a mut FlowSnapshot,
        ctx: &'a FlowContext,
    ) -> BoxFuture<'a, CvResult<()>> {
        Box::pin(async move {
            let (start_idx, deep_resume) = match resume.split_first() {
                Some((&idx, rest)) => (idx, rest.to_vec()),
                None => (0, Vec::new()),
            };

            for idx in start_idx..nodes.len() {
                if ctx.is_cancelled() {
                    return Err(MediatorError::cancelled());
                }
                let position = base.child(idx);
                let node = &nodes[idx];
                let node_resume = if idx == start_idx {
                    deep_resume.clone()
                } else {
                    Vec::new()
                };

                debug!(node = node.name(), position = %position, "executing node");
                match node {
                    FlowNode::Step(step) => {
                        self.run_step(step, state, snapshot, ctx).await?;
                        snapshot.completed_steps.push(position.clone());
                    }
                    FlowNode::Send(send) => {
                        (send.run)(state, ctx).await?;
                        snapshot.completed_steps.push(position.clone());
                    }
                    FlowNode::If(if_node) => {
                        let group = match node_resume.split_first() {
                            Some((&g, _)) => Some(g),
                            None => if_node
                                .branches
                                .iter()
                                .position(|(predicate, _)| predicate(&*state))
                                .or_else(|| {
                                    if_node.else_branch.as_ref().map(|_| if_node.branches.len())
                                }),
                        };
                        if let Some(group) = group {
                            if let Some(children) = node.group(group) {
                                let rest =
                                    node_resume.get(1..).map(<[usize]>::to_vec).unwrap_or_default();
                                self.run_sequence(
                                    children,
                                    position.child(group),
                                    rest,
                                    state,
                                    snapshot,
                                    ctx,
                                )
                                .await?;
                            }
                        }
                    }
                    FlowNode::Switch(switch) => {
                        let group = match node_resume.split_first() {
                            Some((&g, _)) => Some(g),
                            None => {
                                let key = (switch.selector)(&*state);
                                switch
                                    .cases
                                    .iter()
                                    .position(|(case, _)| *case == key)
                                    .or_else(|| {
                                        switch.default.as_ref().map(|_| switch.cases.len())
                                    })
                            }
                        };
                        if let Some(group) = group {
                            if let Some(children) = node.group(group) {
                                let rest =
                                    node_resume.get(1..).map(<[usize]>::to_vec).unwrap_or_default();
                                self.run_sequence(
                                    children,
                                    position.child(group),
                                    rest,
                                    state,
                                    snapshot,
                                    ctx,
                                )
                                .await?;
                            }
                        }
                    }
                    FlowNode::ForEach(for_each) => {
                        self.run_for_each(for_each, position.clone(), state, snapshot, ctx)
                            .await?;
                    }
                    FlowNode::WhenAll(when_all) => {
                        self.run_when_all(when_all, state, ctx).await?;
                    }
                    FlowNode::WhenAny(when_any) => {
                        self.run_when_any(when_any, state, ctx).await?;
                    }
                }

                snapshot.attempts = 0;
                snapshot.position = base.child(idx + 1);
                self.persist(state, snapshot).await?;
            }
            Ok(())
        })
    }

    /// Run a step body honoring its retry policy within this engine tick.
    /// The position does not advance until success or exhaustion.
    async fn run_step<S: FlowState>(
        &self,
        step: &StepNode<S>,
        state: &mut S,
        snapshot: &mut FlowSnapshot,
        ctx: &FlowContext,
    ) -> CvResult<()> {
        let policy = step.retry.clone().or_else(|| self.config.default_retry.clone());
        let max_attempts = policy.as_ref().map(|p| p.max_attempts.max(1)).unwrap_or(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            snapshot.attempts = attempt;
            match run_step_body(step, state, ctx).await {
                Ok(()) => return Ok(()),
                Err(error) if error.kind != ErrorKind::Cancelled && attempt < max_attempts => {
                    let delay = policy
                        .as_ref()
                        .map(|p| p.backoff(attempt))
                        .unwrap_or_default();
                    debug!(
                        step = %step.name,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "step failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn run_for_each<S: FlowState>(
        &self,
        node: &ForEachNode<S>,
        position: Position,
        state: &mut S,
        snapshot: &mut FlowSnapshot,
        ctx: &FlowContext,
    ) -> CvResult<()> {
        let mut progress = match snapshot.loop_progress.take() {
            Some(progress) if progress.position == position => progress,
            _ => {
                let items = (node.sequence)(&*state);
                let progress = LoopProgress::new(position.clone(), items);
                // Seal the sequence snapshot before any item runs.
                snapshot.loop_progress = Some(progress.clone());
                self.persist(state, snapshot).await?;
                progress
            }
        };

        let result = self
            .drive_loop(node, &mut progress, state, ctx, Some(snapshot))
            .await;

        match result {
            Ok(()) => {
                if let Some(hook) = &node.on_complete {
                    hook(state);
                }
                snapshot.loop_progress = None;
                Ok(())
            }
            Err(error) => {
                // Remaining progress stays durable so a resume continues the
                // same sequence instead of restarting it.
                snapshot.loop_progress = Some(progress);
                Err(error)
            }
        }
    }

    /// Core of the loop: waves of up to `parallelism` concurrent item
    /// bodies, serial merges, optional per-item durability.
    async fn drive_loop<S: FlowState>(
        &self,
        node: &ForEachNode<S>,
        progress: &mut LoopProgress,
        state: &mut S,
        ctx: &FlowContext,
        mut snapshot: Option<&mut FlowSnapshot>,
    ) -> CvResult<()> {
        let mut pending: std::collections::VecDeque<usize> = (0..progress.items.len())
            .filter(|i| !progress.completed.contains(i))
            .collect();

        let loop_cancel = ctx.cancellation.child();
        let loop_ctx = ctx.clone().with_cancellation(loop_cancel.clone());
        let mut in_flight = FuturesUnordered::new();
        let mut first_error: Option<MediatorError> = None;

        let schedule = |in_flight: &mut FuturesUnordered<_>, idx: usize, item: serde_json::Value| {
            let body = Arc::clone(&node.body);
            let item_ctx = loop_ctx.child();
            in_flight.push(async move { (idx, body(item, item_ctx).await) });
        };

        while in_flight.len() < node.parallelism {
            let Some(idx) = pending.pop_front() else { break };
            schedule(&mut in_flight, idx, progress.items[idx].clone());
        }

        while let Some((idx, outcome)) = in_flight.next().await {
            match outcome {
                Ok(value) => {
                    (node.merge)(state, idx, Ok(value));
                    progress.completed.push(idx);
                }
                Err(error) => {
                    if let Some(hook) = &node.on_item_fail {
                        hook(state, idx, &error);
                    }
                    (node.merge)(state, idx, Err(error.clone()));
                    match node.policy {
                        ForEachPolicy::ContinueOnFailure => progress.completed.push(idx),
                        ForEachPolicy::StopOnFirstFailure => {
                            if first_error.is_none() {
                                first_error = Some(error);
                                loop_cancel.cancel();
                                pending.clear();
                                in_flight.clear();
                            }
                        }
                    }
                }
            }

            if let Some(snap) = snapshot.as_deref_mut() {
                snap.loop_progress = Some(progress.clone());
                self.persist(state, snap).await?;
            }

            if first_error.is_none() {
                while in_flight.len() < node.parallelism {
                    let Some(idx) = pending.pop_front() else { break };
                    schedule(&mut in_flight, idx, progress.items[idx].clone());
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn run_when_all<S: FlowState>(
        &self,
        node: &WhenAllNode<S>,
        state: &mut S,
        ctx: &FlowContext,
    ) -> CvResult<()> {
        if node.branches.is_empty() {
            (node.merge)(state, Vec::new());
            return Ok(());
        }

        let group_cancel = ctx.cancellation.child();
        let mut in_flight = FuturesUnordered::new();
        for (index, branch) in node.branches.iter().enumerate() {
            let mut branch_state = clone_state(&*state)?;
            let branch_ctx = ctx.clone().with_cancellation(group_cancel.child());
            in_flight.push(async move {
                let result = self
                    .run_nodes_ephemeral(&branch.nodes, &mut branch_state, &branch_ctx)
                    .await;
                (index, branch_state, result)
            });
        }

        let mut finished: Vec<Option<S>> = node.branches.iter().map(|_| None).collect();
        let mut first_failure: Option<(usize, MediatorError)> = None;

        while let Some((index, branch_state, result)) = in_flight.next().await {
            match result {
                Ok(()) => finished[index] = Some(branch_state),
                Err(error) => {
                    if first_failure.is_none() {
                        first_failure = Some((index, error));
                        // Cooperative: remaining branches observe the token
                        // and wind down on their own.
                        group_cancel.cancel();
                    }
                }
            }
        }

        if let Some((index, error)) = first_failure {
            let kind = error.kind;
            return Err(MediatorError::new(
                kind,
                format!(
                    "when_all '{}' failed in branch '{}'",
                    node.name, node.branches[index].name
                ),
            )
            .with_cause(error));
        }

        let mut branch_states = Vec::with_capacity(finished.len());
        for branch_state in finished {
            branch_states.push(branch_state.ok_or_else(|| {
                MediatorError::fatal("when_all branch finished without a state")
            })?);
        }
        (node.merge)(state, branch_states);
        Ok(())
    }

    async fn run_when_any<S: FlowState>(
        &self,
        node: &WhenAnyNode<S>,
        state: &mut S,
        ctx: &FlowContext,
    ) -> CvResult<()> {
        if node.branches.is_empty() {
            return Err(MediatorError::configuration(format!(
                "when_any '{}' has no branches",
                node.name
            )));
        }

        let group_cancel = ctx.cancellation.child();
        let mut in_flight = FuturesUnordered::new();
        for (index, branch) in node.branches.iter().enumerate() {
            let mut branch_state = clone_state(&*state)?;
            let branch_ctx = ctx.clone().with_cancellation(group_cancel.child());
            in_flight.push(async move {
                let result = self
                    .run_nodes_ephemeral(&branch.nodes, &mut branch_state, &branch_ctx)
                    .await;
                (index, branch_state, result)
            });
        }

        let mut winner: Option<(usize, S)> = None;
        let mut last_failure: Option<MediatorError> = None;

        while let Some((index, branch_state, result)) = in_flight.next().await {
            match result {
                Ok(()) if winner.is_none() => {
                    winner = Some((index, branch_state));
                    group_cancel.cancel();
                }
                Ok(()) => {}
                Err(error) => last_failure = Some(error),
            }
        }

        match winner {
            Some((index, winner_state)) => {
                (node.adopt)(state, winner_state, index);
                Ok(())
            }
            None => {
                let cause = last_failure
                    .unwrap_or_else(|| MediatorError::fatal("when_any finished without outcomes"));
                Err(MediatorError::new(
                    cause.kind,
                    format!(
                        "all {} branches of when_any '{}' failed",
                        node.branches.len(),
                        node.name
                    ),
                )
                .with_cause(cause))
            }
        }
    }

    /// Branch-local interpreter: same node semantics, no durability. A
    /// parallel group is one node from the snapshot's point of view, so a
    /// crash inside re-runs the whole group.
    fn run_nodes_ephemeral<'a, S: FlowState>(
        &'a self,
        nodes: &'a [FlowNode<S>],
        state: &'a mut S,
        ctx: &'a FlowContext,
    ) -> BoxFuture<'a, CvResult<()>> {
        Box::pin(async move {
            for node in nodes {
                if ctx.is_cancelled() {
                    return Err(MediatorError::cancelled());
                }
                match node {
                    FlowNode::Step(step) => {
                        let policy =
                            step.retry.clone().or_else(|| self.config.default_retry.clone());
                        let max_attempts =
                            policy.as_ref().map(|p| p.max_attempts.max(1)).unwrap_or(1);
                        let mut attempt = 0;
                        loop {
                            attempt += 1;
                            match run_step_body(step, state, ctx).await {
                                Ok(()) => break,
                                Err(error)
                                    if error.kind != ErrorKind::Cancelled
                                        && attempt < max_attempts =>
                                {
                                    let delay = policy
                                        .as_ref()
                                        .map(|p| p.backoff(attempt))
                                        .unwrap_or_default();
                                    tokio::time::sleep(delay).await;
                                }
                                Err(error) => return Err(error),
                            }
                        }
                    }
                    FlowNode::Send(send) => (send.run)(state, ctx).await?,
                    FlowNode::If(if_node) => {
                        let group = if_node
                            .branches
                            .iter()
                            .position(|(predicate, _)| predicate(&*state))
                            .or_else(|| {
                                if_node.else_branch.as_ref().map(|_| if_node.branches.len())
                            });
                        if let Some(children) = group.and_then(|g| node.group(g)) {
                            self.run_nodes_ephemeral(children, state, ctx).await?;
                        }
                    }
                    FlowNode::Switch(switch) => {
                        let key = (switch.selector)(&*state);
                        let group = switch
                            .cases
                            .iter()
                            .position(|(case, _)| *case == key)
                            .or_else(|| switch.default.as_ref().map(|_| switch.cases.len()));
                        if let Some(children) = group.and_then(|g| node.group(g)) {
                            self.run_nodes_ephemeral(children, state, ctx).await?;
                        }
                    }
                    FlowNode::ForEach(for_each) => {
                        let items = (for_each.sequence)(&*state);
                        let mut progress = LoopProgress::new(Position::start(), items);
                        self.drive_loop(for_each, &mut progress, state, ctx, None)
                            .await?;
                        if let Some(hook) = &for_each.on_complete {
                            hook(state);
                        }
                    }
                    FlowNode::WhenAll(when_all) => {
                        self.run_when_all(when_all, state, ctx).await?
                    }
                    FlowNode::WhenAny(when_any) => {
                        self.run_when_any(when_any, state, ctx).await?
                    }
                }
            }
            Ok(())
        })
    }

    /// Run compensations of completed steps in reverse completion order.
    ///
    /// `original` is the failure that triggered compensation; `None` when
    /// resuming a flow that crashed while already compensating.
    async fn compensate<S: FlowState>(
        &self,
        definition: &FlowDefinition<S>,
        state: &mut S,
        snapshot: &mut FlowSnapshot,
        ctx: &FlowContext,
        original: Option<MediatorError>,
    ) -> CvResult<()> {
        if snapshot.status != FlowStatus::Compensating {
            snapshot.status =
                FlowStatusMachine::transition(snapshot.status, FlowTransition::Compensate)?;
        }
        if let Some(error) = original {
            warn!(
                flow_id = %snapshot.flow_id,
                error = %error,
                "flow failed, compensating completed steps"
            );
            snapshot.last_error = Some(error);
        }
        self.persist(state, snapshot).await?;

        let completed = snapshot.completed_steps.clone();
        for position in completed.iter().rev() {
            let Some(node) = definition.resolve(position.path()) else {
                continue;
            };
            let Some(compensation) = node.compensation() else {
                continue;
            };
            debug!(node = node.name(), position = %position, "compensating");
            if let Err(error) = compensation(state, ctx).await {
                snapshot.status =
                    FlowStatusMachine::transition(snapshot.status, FlowTransition::Fail)?;
                warn!(
                    flow_id = %snapshot.flow_id,
                    node = node.name(),
                    error = %error,
                    "compensation failed"
                );
                snapshot.last_error = Some(error);
                self.persist(state, snapshot).await?;
                return Ok(());
            }
        }

        snapshot.status =
            FlowStatusMachine::transition(snapshot.status, FlowTransition::Complete)?;
        self.persist(state, snapshot).await?;
        info!(flow_id = %snapshot.flow_id, "flow compensated");
        Ok(())
    }

    /// Persist the snapshot; re-serialize state only when it changed.
    async fn persist<S: FlowState>(
        &self,
        state: &mut S,
        snapshot: &mut FlowSnapshot,
    ) -> CvResult<()> {
        if state.has_changes() {
            snapshot.state = serde_json::to_value(&*state).map_err(|e| {
                MediatorError::fatal(format!("unencodable flow state: {e}"))
            })?;
            state.clear_changes();
        }
        snapshot.updated_at = Utc::now();
        self.store.save(snapshot.clone()).await?;
        Ok(())
    }
}

fn prepare_resume(mut snapshot: FlowSnapshot) -> CvResult<FlowSnapshot> {
    if snapshot.status == FlowStatus::Failed {
        snapshot.status = FlowStatusMachine::transition(snapshot.status, FlowTransition::Resume)?;
    }
    snapshot.attempts = 0;
    Ok(snapshot)
}

fn decode_state<S: FlowState>(snapshot: &FlowSnapshot) -> CvResult<S> {
    serde_json::from_value(snapshot.state.clone()).map_err(|e| {
        MediatorError::fatal(format!(
            "undecodable state for flow {}: {e}",
            snapshot.flow_id
        ))
    })
}

/// Serde round-trip copy of state for an isolated branch.
fn clone_state<S: FlowState>(state: &S) -> CvResult<S> {
    let value = serde_json::to_value(state)
        .map_err(|e| MediatorError::fatal(format!("unencodable flow state: {e}")))?;
    serde_json::from_value(value)
        .map_err(|e| MediatorError::fatal(format!("undecodable flow state: {e}")))
}

async fn run_step_body<S: FlowState>(
    step: &StepNode<S>,
    state: &mut S,
    ctx: &FlowContext,
) -> CvResult<()> {
    let body = (step.body)(state, ctx);
    match step.timeout {
        Some(limit) => match tokio::time::timeout(limit, body).await {
            Ok(result) => result,
            Err(_) => Err(MediatorError::transient(format!(
                "step '{}' timed out after {}ms",
                step.name,
                limit.as_millis()
            ))),
        },
        None => body.await,
    }
}
