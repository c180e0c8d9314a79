//! Flow definition AST
//!
//! Nodes carry in-process closures over the state type; only their ordinals
//! are ever persisted. Each composite node exposes its child sequences as
//! numbered groups, which is what makes a `Position` path resolvable without
//! re-evaluating predicates on resume.

use std::sync::Arc;

use cv_domain::{CvResult, MediatorError};
use cv_mediator::behaviors::RetryPolicy;
use futures::future::BoxFuture;

use crate::context::FlowContext;

/// Step body: exclusive state access for the duration of the step.
pub type StepFn<S> =
    Arc<dyn for<'a> Fn(&'a mut S, &'a FlowContext) -> BoxFuture<'a, CvResult<()>> + Send + Sync>;

/// State predicate.
pub type PredicateFn<S> = Arc<dyn Fn(&S) -> bool + Send + Sync>;

/// Switch selector producing a case key.
pub type SelectorFn<S> = Arc<dyn Fn(&S) -> String + Send + Sync>;

/// Sequence selector, snapshotted at loop entry.
pub type SequenceFn<S> = Arc<dyn Fn(&S) -> Vec<serde_json::Value> + Send + Sync>;

/// Loop item body. Runs without state access so items can run concurrently;
/// outcomes merge into state serially through [`MergeFn`].
pub type ItemFn = Arc<
    dyn Fn(serde_json::Value, FlowContext) -> BoxFuture<'static, CvResult<serde_json::Value>>
        + Send
        + Sync,
>;

/// Serial merge of one item outcome into state.
pub type MergeFn<S> =
    Arc<dyn Fn(&mut S, usize, CvResult<serde_json::Value>) + Send + Sync>;

/// Per-failure hook of a loop.
pub type ItemFailFn<S> = Arc<dyn Fn(&mut S, usize, &MediatorError) + Send + Sync>;

/// Loop completion hook.
pub type CompleteFn<S> = Arc<dyn Fn(&mut S) + Send + Sync>;

/// Merge of branch states after a parallel group joins.
pub type BranchMergeFn<S> = Arc<dyn Fn(&mut S, Vec<S>) + Send + Sync>;

/// Adoption of the winning branch state after a `WhenAny`.
pub type WinnerFn<S> = Arc<dyn Fn(&mut S, S, usize) + Send + Sync>;

/// Failure policy of a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForEachPolicy {
    /// Abort remaining items and fail the loop on the first failure.
    #[default]
    StopOnFirstFailure,
    /// Record failures (merge + hook) and keep iterating; the loop succeeds.
    ContinueOnFailure,
}

pub struct StepNode<S> {
    pub name: String,
    pub body: StepFn<S>,
    pub compensate: Option<StepFn<S>>,
    pub retry: Option<RetryPolicy>,
    pub timeout: Option<std::time::Duration>,
}

pub struct SendNode<S> {
    pub name: String,
    /// Build-dispatch-sink wrapper produced by the builder; failures land in
    /// state through the sink, the node itself advances.
    pub run: StepFn<S>,
    pub compensate: Option<StepFn<S>>,
}

pub struct IfNode<S> {
    pub name: String,
    /// Condition chain in declaration order; group ordinal = chain index.
    pub branches: Vec<(PredicateFn<S>, Vec<FlowNode<S>>)>,
    /// Group ordinal `branches.len()` when present.
    pub else_branch: Option<Vec<FlowNode<S>>>,
}

pub struct SwitchNode<S> {
    pub name: String,
    pub selector: SelectorFn<S>,
    /// Cases in declaration order; group ordinal = case index.
    pub cases: Vec<(String, Vec<FlowNode<S>>)>,
    /// Group ordinal `cases.len()` when present.
    pub default: Option<Vec<FlowNode<S>>>,
}

pub struct ForEachNode<S> {
    pub name: String,
    pub sequence: SequenceFn<S>,
    pub body: ItemFn,
    pub merge: MergeFn<S>,
    pub parallelism: usize,
    pub policy: ForEachPolicy,
    pub on_item_fail: Option<ItemFailFn<S>>,
    pub on_complete: Option<CompleteFn<S>>,
}

/// A named sub-sequence of a parallel group.
pub struct FlowBranch<S> {
    pub name: String,
    pub nodes: Vec<FlowNode<S>>,
}

pub struct WhenAllNode<S> {
    pub name: String,
    pub branches: Vec<FlowBranch<S>>,
    /// Applied on the engine's thread once every branch has succeeded, in
    /// branch order.
    pub merge: BranchMergeFn<S>,
}

pub struct WhenAnyNode<S> {
    pub name: String,
    pub branches: Vec<FlowBranch<S>>,
    pub adopt: WinnerFn<S>,
}

pub enum FlowNode<S> {
    Step(StepNode<S>),
    Send(SendNode<S>),
    If(IfNode<S>),
    Switch(SwitchNode<S>),
    ForEach(ForEachNode<S>),
    WhenAll(WhenAllNode<S>),
    WhenAny(WhenAnyNode<S>),
}

impl<S> FlowNode<S> {
    pub fn name(&self) -> &str {
        match self {
            FlowNode::Step(n) => &n.name,
            FlowNode::Send(n) => &n.name,
            FlowNode::If(n) => &n.name,
            FlowNode::Switch(n) => &n.name,
            FlowNode::ForEach(n) => &n.name,
            FlowNode::WhenAll(n) => &n.name,
            FlowNode::WhenAny(n) => &n.name,
        }
    }

    /// Child sequence for a group ordinal, where the node has any.
    pub fn group(&self, ordinal: usize) -> Option<&[FlowNode<S>]> {
        match self {
            FlowNode::If(n) => {
                if ordinal < n.branches.len() {
                    Some(&n.branches[ordinal].1)
                } else if ordinal == n.branches.len() {
                    n.else_branch.as_deref()
                } else {
                    None
                }
            }
            FlowNode::Switch(n) => {
                if ordinal < n.cases.len() {
                    Some(&n.cases[ordinal].1)
                } else if ordinal == n.cases.len() {
                    n.default.as_deref()
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Compensation body, for nodes that can carry one.
    pub fn compensation(&self) -> Option<&StepFn<S>> {
        match self {
            FlowNode::Step(n) => n.compensate.as_ref(),
            FlowNode::Send(n) => n.compensate.as_ref(),
            _ => None,
        }
    }
}

/// An immutable flow definition. Construction is pure; side effects happen
/// only at execution.
pub struct FlowDefinition<S> {
    pub name: String,
    pub nodes: Vec<FlowNode<S>>,
}

impl<S> FlowDefinition<S> {
    /// Resolve an ordinal path to its node.
    ///
    /// Paths alternate node ordinals and group ordinals: `[2, 1, 0]` is node
    /// 0 of group 1 of root node 2.
    pub fn resolve(&self, path: &[usize]) -> Option<&FlowNode<S>> {
        resolve_in(&self.nodes, path)
    }
}

fn resolve_in<'a, S>(nodes: &'a [FlowNode<S>], path: &[usize]) -> Option<&'a FlowNode<S>> {
    let (&idx, rest) = path.split_first()?;
    let node = nodes.get(idx)?;
    if rest.is_empty() {
        return Some(node);
    }
    let (&group, rest) = rest.split_first()?;
    resolve_in(node.group(group)?, rest)
}
