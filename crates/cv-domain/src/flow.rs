//! Durable flow state: status machine, positions, and snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CvResult, MediatorError};

/// Capability the flow engine requires of user-defined state.
///
/// The engine treats the payload as opaque except for this surface: a stable
/// flow id plus a changed-field mask used to skip re-serializing unchanged
/// state into snapshots.
pub trait FlowState: Serialize + serde::de::DeserializeOwned + Send + Sync + 'static {
    fn flow_id(&self) -> &str;

    fn has_changes(&self) -> bool;

    fn changed_fields(&self) -> Vec<String>;

    fn mark_changed(&mut self, field: &str);

    fn clear_changes(&mut self);
}

/// Drop-in changed-field mask for user state structs.
///
/// Embed with `#[serde(skip)]` and delegate the [`FlowState`] mask methods
/// to it.
#[derive(Debug, Clone, Default)]
pub struct ChangeMask {
    changed: Vec<String>,
}

impl ChangeMask {
    pub fn has_changes(&self) -> bool {
        !self.changed.is_empty()
    }

    pub fn changed_fields(&self) -> Vec<String> {
        self.changed.clone()
    }

    pub fn mark(&mut self, field: &str) {
        if !self.changed.iter().any(|f| f == field) {
            self.changed.push(field.to_string());
        }
    }

    pub fn clear(&mut self) {
        self.changed.clear();
    }
}

/// Lifecycle of a flow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowStatus {
    Running,
    Succeeded,
    Failed,
    Compensating,
    Compensated,
}

impl FlowStatus {
    /// Terminal statuses never execute again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowStatus::Succeeded | FlowStatus::Compensated)
    }
}

/// Flow status transitions.
#[derive(Debug, Clone, Copy)]
pub enum FlowTransition {
    Complete,
    Fail,
    Resume,
    Compensate,
}

/// Validate and compute the next status for a flow transition.
pub struct FlowStatusMachine;

impl FlowStatusMachine {
    pub fn transition(current: FlowStatus, transition: FlowTransition) -> CvResult<FlowStatus> {
        match (current, transition) {
            (FlowStatus::Running, FlowTransition::Complete) => Ok(FlowStatus::Succeeded),
            (FlowStatus::Running, FlowTransition::Fail) => Ok(FlowStatus::Failed),
            (FlowStatus::Running, FlowTransition::Compensate) => Ok(FlowStatus::Compensating),

            (FlowStatus::Failed, FlowTransition::Resume) => Ok(FlowStatus::Running),
            (FlowStatus::Failed, FlowTransition::Compensate) => Ok(FlowStatus::Compensating),

            (FlowStatus::Compensating, FlowTransition::Complete) => Ok(FlowStatus::Compensated),
            (FlowStatus::Compensating, FlowTransition::Fail) => Ok(FlowStatus::Failed),

            (status, transition) => Err(MediatorError::fatal(format!(
                "invalid flow transition {transition:?} from {status:?}"
            ))),
        }
    }
}

/// Path of child ordinals from the root of a flow definition to a node.
///
/// The empty path addresses the first root child; `[2, 1]` addresses child 1
/// of root child 2. Snapshots persist ordinals only, never closures.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Position(Vec<usize>);

impl Position {
    pub fn start() -> Self {
        Self(Vec::new())
    }

    pub fn from_path(path: Vec<usize>) -> Self {
        Self(path)
    }

    pub fn path(&self) -> &[usize] {
        &self.0
    }

    pub fn is_start(&self) -> bool {
        self.0.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// Descend into child `ordinal` of the addressed node.
    pub fn child(&self, ordinal: usize) -> Self {
        let mut path = self.0.clone();
        path.push(ordinal);
        Self(path)
    }

    /// Path with the last ordinal removed, or `None` at the root.
    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            return None;
        }
        let mut path = self.0.clone();
        path.pop();
        Some(Self(path))
    }

    /// Last ordinal of the path, or `None` at the root.
    pub fn last(&self) -> Option<usize> {
        self.0.last().copied()
    }

    /// Sibling with the last ordinal advanced by one.
    pub fn next_sibling(&self) -> Option<Self> {
        let mut path = self.0.clone();
        let last = path.pop()?;
        path.push(last + 1);
        Some(Self(path))
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, ordinal) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{ordinal}")?;
        }
        write!(f, "]")
    }
}

/// Durable progress of a loop node.
///
/// The item sequence is captured once at loop entry, so items added to the
/// state mid-iteration (or after a crash) never change the iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopProgress {
    /// Position of the loop node this progress belongs to.
    pub position: Position,
    /// Sequence snapshot taken at loop entry.
    pub items: Vec<serde_json::Value>,
    /// Indices whose body already completed (success or recorded failure).
    pub completed: Vec<usize>,
}

impl LoopProgress {
    pub fn new(position: Position, items: Vec<serde_json::Value>) -> Self {
        Self {
            position,
            items,
            completed: Vec::new(),
        }
    }
}

/// Durable record of a flow instance: serialized state plus the ordinal path
/// of the next node to execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSnapshot {
    pub flow_id: String,
    pub state: serde_json::Value,
    pub position: Position,
    pub status: FlowStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_error: Option<MediatorError>,
    /// Attempts spent on the node at `position`.
    pub attempts: u32,
    /// Positions of steps that completed, in completion order. Compensation
    /// walks this list backwards, so it must survive a crash.
    #[serde(default)]
    pub completed_steps: Vec<Position>,
    /// Progress of the loop at `position`, when that node is a loop.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub loop_progress: Option<LoopProgress>,
    pub updated_at: DateTime<Utc>,
}

impl FlowSnapshot {
    pub fn initial(flow_id: impl Into<String>, state: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            flow_id: flow_id.into(),
            state,
            position: Position::start(),
            status: FlowStatus::Running,
            last_error: None,
            attempts: 0,
            completed_steps: Vec::new(),
            loop_progress: None,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(FlowStatus::Succeeded.is_terminal());
        assert!(FlowStatus::Compensated.is_terminal());
        assert!(!FlowStatus::Running.is_terminal());
        assert!(!FlowStatus::Failed.is_terminal());
    }

    #[test]
    fn legal_transitions() {
        let next =
            FlowStatusMachine::transition(FlowStatus::Running, FlowTransition::Fail).unwrap();
        assert_eq!(next, FlowStatus::Failed);
        let next = FlowStatusMachine::transition(next, FlowTransition::Resume).unwrap();
        assert_eq!(next, FlowStatus::Running);
        let next = FlowStatusMachine::transition(next, FlowTransition::Compensate).unwrap();
        assert_eq!(next, FlowStatus::Compensating);
        let next = FlowStatusMachine::transition(next, FlowTransition::Complete).unwrap();
        assert_eq!(next, FlowStatus::Compensated);
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let err = FlowStatusMachine::transition(FlowStatus::Succeeded, FlowTransition::Fail)
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Fatal);
    }

    #[test]
    fn position_navigation() {
        let p = Position::start().child(2).child(1);
        assert_eq!(p.path(), &[2, 1]);
        assert_eq!(p.parent().unwrap().path(), &[2]);
        assert_eq!(p.next_sibling().unwrap().path(), &[2, 2]);
        assert_eq!(p.to_string(), "[2.1]");
        assert!(Position::start().parent().is_none());
        assert!(Position::start().next_sibling().is_none());
    }

    #[test]
    fn change_mask_deduplicates() {
        let mut mask = ChangeMask::default();
        assert!(!mask.has_changes());
        mask.mark("total");
        mask.mark("total");
        mask.mark("status");
        assert_eq!(mask.changed_fields(), vec!["total", "status"]);
        mask.clear();
        assert!(!mask.has_changes());
    }
}
