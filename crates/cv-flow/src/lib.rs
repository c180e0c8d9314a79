//! Convoy Flow Engine
//!
//! A declarative step/branch/loop/parallel workflow interpreter with durable
//! state. Definitions are pure data built once; node bodies stay in-process
//! while snapshots persist only ordinal positions plus serialized state, so
//! a flow resumes after a crash from its last completed step.

pub mod ast;
pub mod builder;
pub mod context;
pub mod engine;

pub use ast::{FlowBranch, FlowDefinition, FlowNode, ForEachPolicy};
pub use builder::{BranchGroupBuilder, CaseBuilder, ConditionBuilder, FlowBuilder};
pub use context::FlowContext;
pub use engine::{FlowEngine, FlowEngineConfig};
