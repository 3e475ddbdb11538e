// ABOUTME: Activity instance records and their lifecycle states
// ABOUTME: Tracks substate, busy accounting, children and continuations for one tree node

use serde::{Deserialize, Serialize};
use std::fmt;

use super::location::LocationRef;
use super::properties::ScopeId;
use crate::definition::{DefinitionRef, QualifiedId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityState {
    Executing,
    Closed,
    Canceled,
    Faulted,
}

impl ActivityState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ActivityState::Executing)
    }
}

impl fmt::Display for ActivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivityState::Executing => write!(f, "Executing"),
            ActivityState::Closed => write!(f, "Closed"),
            ActivityState::Canceled => write!(f, "Canceled"),
            ActivityState::Faulted => write!(f, "Faulted"),
        }
    }
}

/// Lifecycle phase of an executing instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Substate {
    Created,
    ResolvingArguments,
    ResolvingVariables,
    Initialized,
    /// Body has been dispatched.
    Executing,
    Canceling,
}

impl Substate {
    pub fn is_pre_executing(&self) -> bool {
        matches!(
            self,
            Substate::Created
                | Substate::ResolvingArguments
                | Substate::ResolvingVariables
                | Substate::Initialized
        )
    }
}

impl fmt::Display for Substate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// What the owner does when a scheduled child terminates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Continuation {
    /// Dispatched to the owner's native body by name.
    Named(String),
    /// Resume argument resolution at the given position.
    NextArgument(usize),
    /// Resume variable resolution at the given position.
    NextVariable(usize),
    /// Advance a composite body to its next child.
    CompositeStep,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionCallback {
    pub owner: InstanceId,
    pub continuation: Continuation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultCallback {
    pub owner: InstanceId,
    pub name: String,
}

/// One execution of one definition node.
#[derive(Debug, Clone)]
pub struct ActivityInstance {
    pub id: InstanceId,
    pub definition: Option<DefinitionRef>,
    pub qualified_id: QualifiedId,
    pub state: ActivityState,
    pub substate: Substate,
    pub busy_count: u32,
    pub blocking_bookmarks: u32,
    pub children: Vec<InstanceId>,
    pub parent: Option<InstanceId>,
    /// Owner of the environment this instance reads from.
    pub environment: Option<InstanceId>,
    pub owns_environment: bool,
    /// Environment argument bindings are evaluated in.
    pub binding_environment: Option<InstanceId>,
    pub completion: Option<CompletionCallback>,
    pub fault_callback: Option<FaultCallback>,
    pub cancellation_requested: bool,
    pub performing_default_cancel: bool,
    pub initialization_incomplete: bool,
    pub property_scope: Option<ScopeId>,
    /// Parent location receiving this instance's Result when it closes.
    pub result_target: Option<LocationRef>,
    /// Set while a raised fault is travelling to its handler.
    pub fault_pending: bool,
}

impl ActivityInstance {
    pub fn new(id: InstanceId, definition: DefinitionRef, parent: Option<InstanceId>) -> Self {
        Self {
            id,
            qualified_id: definition.qualified_id.clone(),
            definition: Some(definition),
            state: ActivityState::Executing,
            substate: Substate::Created,
            busy_count: 0,
            blocking_bookmarks: 0,
            children: Vec::new(),
            parent,
            environment: None,
            owns_environment: false,
            binding_environment: None,
            completion: None,
            fault_callback: None,
            cancellation_requested: false,
            performing_default_cancel: false,
            initialization_incomplete: false,
            property_scope: None,
            result_target: None,
            fault_pending: false,
        }
    }

    pub fn has_pending_work(&self) -> bool {
        !self.children.is_empty() || self.busy_count > 0
    }

    pub fn is_executing(&self) -> bool {
        self.state == ActivityState::Executing
    }

    pub fn increment_busy(&mut self) {
        self.busy_count += 1;
    }

    pub fn decrement_busy(&mut self) {
        debug_assert!(self.busy_count > 0, "busy count underflow on {}", self.id);
        self.busy_count = self.busy_count.saturating_sub(1);
    }

    pub fn add_blocking_bookmark(&mut self) {
        self.busy_count += 1;
        self.blocking_bookmarks += 1;
    }

    pub fn remove_blocking_bookmark(&mut self) {
        self.busy_count = self.busy_count.saturating_sub(1);
        self.blocking_bookmarks = self.blocking_bookmarks.saturating_sub(1);
    }

    pub fn remove_child(&mut self, child: InstanceId) {
        self.children.retain(|c| *c != child);
    }

    pub fn kind(&self) -> &str {
        self.definition
            .as_ref()
            .map(|d| d.kind.as_str())
            .unwrap_or("")
    }

    pub fn display_name(&self) -> &str {
        self.definition
            .as_ref()
            .map(|d| d.display_name.as_str())
            .unwrap_or("")
    }
}

/// Read-only view of an instance handed to hosts and tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub id: InstanceId,
    pub qualified_id: QualifiedId,
    pub kind: String,
    pub display_name: String,
    pub state: ActivityState,
    pub substate: Substate,
    pub busy_count: u32,
    pub blocking_bookmarks: u32,
    pub children: Vec<InstanceId>,
    pub parent: Option<InstanceId>,
    pub has_pending_work: bool,
}

impl From<&ActivityInstance> for InstanceInfo {
    fn from(instance: &ActivityInstance) -> Self {
        Self {
            id: instance.id,
            qualified_id: instance.qualified_id.clone(),
            kind: instance.kind().to_string(),
            display_name: instance.display_name().to_string(),
            state: instance.state,
            substate: instance.substate,
            busy_count: instance.busy_count,
            blocking_bookmarks: instance.blocking_bookmarks,
            children: instance.children.clone(),
            parent: instance.parent,
            has_pending_work: instance.has_pending_work(),
        }
    }
}

/// Final state of an instance that has left the tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminationRecord {
    pub id: InstanceId,
    pub qualified_id: QualifiedId,
    pub kind: String,
    pub state: ActivityState,
    /// False when the instance was torn down before its body ran.
    pub body_started: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{ActivityBuilder, Body, WorkflowDefinition};

    fn instance() -> ActivityInstance {
        let workflow =
            WorkflowDefinition::new("t", "1", ActivityBuilder::new("leaf", Body::Composite))
                .unwrap();
        ActivityInstance::new(InstanceId(1), workflow.root.clone(), None)
    }

    #[test]
    fn test_pending_work_tracks_children_and_busy() {
        let mut inst = instance();
        assert!(!inst.has_pending_work());

        inst.children.push(InstanceId(2));
        assert!(inst.has_pending_work());
        inst.remove_child(InstanceId(2));
        assert!(!inst.has_pending_work());

        inst.add_blocking_bookmark();
        assert!(inst.has_pending_work());
        assert_eq!(inst.blocking_bookmarks, 1);
        inst.remove_blocking_bookmark();
        assert!(!inst.has_pending_work());
    }

    #[test]
    fn test_pre_executing_substates() {
        assert!(Substate::Created.is_pre_executing());
        assert!(Substate::Initialized.is_pre_executing());
        assert!(!Substate::Executing.is_pre_executing());
        assert!(!Substate::Canceling.is_pre_executing());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ActivityState::Canceled.to_string(), "Canceled");
        assert!(ActivityState::Faulted.is_terminal());
        assert!(!ActivityState::Executing.is_terminal());
    }
}
