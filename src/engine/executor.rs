// ABOUTME: Single-worker executor driving activity instances through their lifecycle
// ABOUTME: Dispatches work items, runs the decision function, and handles completion, cancel, abort and faults

use indexmap::IndexMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::bookmark::{
    Bookmark, BookmarkManager, BookmarkOptions, BookmarkRecord, BookmarkResumptionResult,
    BookmarkScope, ExclusiveHandles, HandleId,
};
use super::context::{CodeContext, CompletedChild, FaultContext, FaultDisposition, NativeContext};
use super::error::{ExecutionError, Fault, FaultResult, Result};
use super::instance::{
    ActivityInstance, ActivityState, CompletionCallback, Continuation, FaultCallback, InstanceId,
    InstanceInfo, Substate, TerminationRecord,
};
use super::location::{Environments, Location, LocationRef};
use super::properties::{PropertyChain, PropertyEntry, PropertyValue, ScopeId};
use super::result::{RunOutcome, WorkflowCompletion};
use super::scheduler::{AsyncOperation, Inbox, OperationId, Scheduler, Stimulus, WorkItem};
use crate::definition::{
    ArgumentDirection, Body, DefinitionRef, QualifiedId, Value, WorkflowDefinition, RESULT_SLOT,
};

/// Which environment a new instance evaluates its argument bindings in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingScope {
    /// The scheduling parent's environment (ordinary children).
    ParentEnvironment,
    /// Wherever the parent evaluates its own bindings (argument expressions).
    ParentBindings,
    /// The new instance's own environment (delegate handlers).
    OwnEnvironment,
}

/// How a child is wired to the instance that schedules it.
#[derive(Debug, Clone)]
pub struct ChildSpec {
    pub completion: Option<CompletionCallback>,
    pub fault: Option<FaultCallback>,
    pub result_target: Option<LocationRef>,
    pub binding: BindingScope,
}

impl ChildSpec {
    pub fn plain() -> Self {
        Self {
            completion: None,
            fault: None,
            result_target: None,
            binding: BindingScope::ParentEnvironment,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PendingOperation {
    pub instance: InstanceId,
    pub cancel: Arc<AtomicBool>,
}

/// Owns the instance tree and everything attached to it. Only one thread
/// touches an executor at a time; other threads talk to it through the inbox.
pub struct Executor {
    pub(crate) workflow_name: String,
    pub(crate) definition_version: String,
    pub(crate) instances: BTreeMap<InstanceId, ActivityInstance>,
    pub(crate) next_instance_id: u64,
    pub(crate) root: Option<InstanceId>,
    pub(crate) environments: Environments,
    pub(crate) bookmarks: BookmarkManager,
    pub(crate) handles: ExclusiveHandles,
    pub(crate) properties: PropertyChain,
    pub(crate) host_scope: Option<ScopeId>,
    pub(crate) host_bookmark_scopes: Vec<BookmarkScope>,
    pub(crate) scheduler: Scheduler,
    pub(crate) inbox: Inbox,
    pub(crate) operations: BTreeMap<OperationId, PendingOperation>,
    pub(crate) started_operations: Vec<AsyncOperation>,
    pub(crate) next_operation_id: u64,
    pub(crate) isolation: Option<InstanceId>,
    pub(crate) completion: Option<WorkflowCompletion>,
    pub(crate) terminations: Vec<TerminationRecord>,
}

impl Executor {
    pub fn new(workflow: &WorkflowDefinition) -> Self {
        Self {
            workflow_name: workflow.name.clone(),
            definition_version: workflow.version.clone(),
            instances: BTreeMap::new(),
            next_instance_id: 0,
            root: None,
            environments: Environments::new(),
            bookmarks: BookmarkManager::new(),
            handles: ExclusiveHandles::new(),
            properties: PropertyChain::new(),
            host_scope: None,
            host_bookmark_scopes: Vec::new(),
            scheduler: Scheduler::new(),
            inbox: Inbox::new(),
            operations: BTreeMap::new(),
            started_operations: Vec::new(),
            next_operation_id: 0,
            isolation: None,
            completion: None,
            terminations: Vec::new(),
        }
    }

    // ---- accessors -------------------------------------------------------

    pub(crate) fn instance_ref(&self, id: InstanceId) -> Option<&ActivityInstance> {
        self.instances.get(&id)
    }

    pub(crate) fn instance_mut(&mut self, id: InstanceId) -> Result<&mut ActivityInstance> {
        self.instances
            .get_mut(&id)
            .ok_or(ExecutionError::InstanceNotFound(id))
    }

    pub(crate) fn definition_of(&self, id: InstanceId) -> Result<DefinitionRef> {
        self.instances
            .get(&id)
            .and_then(|i| i.definition.clone())
            .ok_or(ExecutionError::InstanceNotFound(id))
    }

    pub(crate) fn read_symbol(&self, id: InstanceId, name: &str) -> Result<Value> {
        let instance = self
            .instances
            .get(&id)
            .ok_or(ExecutionError::InstanceNotFound(id))?;
        self.environments.get_for_read(instance.environment, name)
    }

    pub(crate) fn write_symbol(&mut self, id: InstanceId, name: &str, value: Value) -> Result<()> {
        let environment = self
            .instances
            .get(&id)
            .ok_or(ExecutionError::InstanceNotFound(id))?
            .environment;
        self.environments.get_for_write(environment, name, value)
    }

    pub fn outcome(&self) -> RunOutcome {
        match &self.completion {
            Some(completion) => RunOutcome::Completed(completion.clone()),
            None => RunOutcome::Idle,
        }
    }

    pub fn take_started_operations(&mut self) -> Vec<AsyncOperation> {
        std::mem::take(&mut self.started_operations)
    }

    // ---- scheduling ------------------------------------------------------

    /// Queue `item`, charging it to its target's busy count.
    pub(crate) fn enqueue(&mut self, item: WorkItem, front: bool) {
        if let Some(instance) = self.instances.get_mut(&item.target()) {
            instance.increment_busy();
        }
        if front {
            self.scheduler.push_work(item);
        } else {
            self.scheduler.enqueue_work(item);
        }
    }

    pub(crate) fn create_root(
        &mut self,
        definition: DefinitionRef,
        inputs: IndexMap<String, Value>,
    ) -> Result<InstanceId> {
        for (name, value) in &inputs {
            let slot = definition
                .argument(name)
                .filter(|a| a.direction != ArgumentDirection::Out)
                .ok_or_else(|| ExecutionError::SlotNotFound { slot: name.clone() })?;
            if !slot.value_type.accepts(value) {
                return Err(ExecutionError::TypeMismatch {
                    slot: name.clone(),
                    expected: slot.value_type,
                    actual: value.to_string(),
                });
            }
        }

        let id = self.schedule_instance(definition.clone(), None, ChildSpec::plain(), Some(inputs))?;
        self.root = Some(id);
        info!(
            "Scheduled root {} ({}) for workflow {}",
            id, definition.display_name, self.workflow_name
        );
        Ok(id)
    }

    pub(crate) fn schedule_instance(
        &mut self,
        definition: DefinitionRef,
        parent: Option<InstanceId>,
        spec: ChildSpec,
        overrides: Option<IndexMap<String, Value>>,
    ) -> Result<InstanceId> {
        let id = self.create_instance(definition, parent, spec, false)?;
        self.enqueue(
            WorkItem::Execute {
                instance: id,
                overrides,
            },
            false,
        );
        Ok(id)
    }

    fn create_instance(
        &mut self,
        definition: DefinitionRef,
        parent: Option<InstanceId>,
        spec: ChildSpec,
        force_environment: bool,
    ) -> Result<InstanceId> {
        let (parent_env, parent_bindings, parent_scope) = match parent {
            Some(p) => {
                let record = self
                    .instances
                    .get(&p)
                    .ok_or(ExecutionError::InstanceNotFound(p))?;
                if !record.is_executing() {
                    return Err(ExecutionError::InstanceNotExecuting(p));
                }
                (
                    record.environment,
                    record.binding_environment,
                    record.property_scope,
                )
            }
            None => (None, None, self.host_scope),
        };

        self.next_instance_id += 1;
        let id = InstanceId(self.next_instance_id);
        let owns_environment = force_environment || definition.declares_symbols();
        let mut instance = ActivityInstance::new(id, definition, parent);

        if owns_environment {
            self.environments.create(id, parent_env);
            instance.environment = Some(id);
            instance.owns_environment = true;
        } else {
            instance.environment = parent_env;
        }
        instance.binding_environment = match spec.binding {
            BindingScope::ParentEnvironment => parent_env,
            BindingScope::ParentBindings => parent_bindings,
            BindingScope::OwnEnvironment => instance.environment,
        };
        instance.property_scope = parent_scope;
        instance.completion = spec.completion;
        instance.fault_callback = spec.fault;
        instance.result_target = spec.result_target;

        if let Some(p) = parent {
            self.instance_mut(p)?.children.push(id);
        }
        debug!(
            "Created instance {} ({}) under {:?}",
            id, instance.qualified_id, parent
        );
        self.instances.insert(id, instance);
        Ok(id)
    }

    pub(crate) fn schedule_delegate(
        &mut self,
        owner: InstanceId,
        name: &str,
        inputs: IndexMap<String, Value>,
        spec: ChildSpec,
    ) -> Result<Option<InstanceId>> {
        let definition = self.definition_of(owner)?;
        let delegate = definition
            .delegate(name)
            .ok_or_else(|| ExecutionError::DelegateNotFound {
                name: name.to_string(),
            })?;
        let Some(handler) = delegate.handler.clone() else {
            return Ok(None);
        };
        if self.refuses_children(owner) {
            return Ok(None);
        }

        for key in inputs.keys() {
            if !delegate.parameters.iter().any(|p| &p.name == key) {
                return Err(ExecutionError::SlotNotFound { slot: key.clone() });
            }
        }
        let mut declared = Vec::with_capacity(delegate.parameters.len());
        for parameter in &delegate.parameters {
            let value = inputs
                .get(&parameter.name)
                .cloned()
                .unwrap_or_else(|| parameter.value_type.default_value());
            if !parameter.value_type.accepts(&value) {
                return Err(ExecutionError::TypeMismatch {
                    slot: parameter.name.clone(),
                    expected: parameter.value_type,
                    actual: value.to_string(),
                });
            }
            declared.push((
                parameter.name.clone(),
                Location::with_value(parameter.value_type, value),
            ));
        }

        let id = self.create_instance(handler, Some(owner), spec, true)?;
        for (slot, location) in declared {
            self.environments.declare(id, &slot, location)?;
        }
        self.enqueue(
            WorkItem::Execute {
                instance: id,
                overrides: None,
            },
            false,
        );
        Ok(Some(id))
    }

    fn schedule_body(&mut self, id: InstanceId) -> Result<()> {
        self.instance_mut(id)?.substate = Substate::Initialized;
        self.enqueue(WorkItem::ExecuteBody { instance: id }, true);
        Ok(())
    }

    // ---- the worker loop -------------------------------------------------

    /// Drain the inbox and the work queue until nothing is runnable.
    pub fn run_until_quiescent(&mut self) -> RunOutcome {
        loop {
            self.drain_inbox();
            if self.scheduler.is_empty() {
                break;
            }
            while let Some(item) = self.scheduler.next() {
                self.execute_work_item(item);
            }
        }
        self.outcome()
    }

    /// Like `run_until_quiescent`, but aborts the workflow once more than
    /// `limit` work items have run in this pulse.
    pub fn run_bounded(&mut self, limit: usize) -> Result<RunOutcome> {
        let mut executed = 0usize;
        loop {
            self.drain_inbox();
            if self.scheduler.is_empty() {
                break;
            }
            while let Some(item) = self.scheduler.next() {
                executed += 1;
                if executed > limit {
                    let reason = format!("pulse exceeded {} work items", limit);
                    self.abort(&reason);
                    return Err(ExecutionError::WorkflowAborted { reason });
                }
                self.execute_work_item(item);
            }
        }
        Ok(self.outcome())
    }

    /// Run at most one work item. Returns false when the queue was empty.
    pub fn step(&mut self) -> bool {
        self.drain_inbox();
        match self.scheduler.next() {
            Some(item) => {
                self.execute_work_item(item);
                true
            }
            None => false,
        }
    }

    fn drain_inbox(&mut self) {
        while let Some(stimulus) = self.inbox.try_next() {
            self.apply_stimulus(stimulus);
        }
    }

    pub(crate) async fn wait_for_stimulus(&mut self) -> Result<()> {
        let stimulus = self.inbox.next().await.ok_or(ExecutionError::InboxClosed)?;
        self.apply_stimulus(stimulus);
        Ok(())
    }

    fn apply_stimulus(&mut self, stimulus: Stimulus) {
        match stimulus {
            Stimulus::ResumeBookmark {
                bookmark,
                value,
                reply,
            } => {
                let result = self.resume_bookmark(&bookmark, value);
                if let Some(reply) = reply {
                    // The caller may have stopped waiting.
                    let _ = reply.send(result);
                }
            }
            Stimulus::CompleteOperation { operation, outcome } => {
                match self.operations.get(&operation) {
                    Some(pending) => {
                        let instance = pending.instance;
                        self.enqueue(
                            WorkItem::CompleteOperation {
                                instance,
                                operation,
                                outcome,
                            },
                            false,
                        );
                    }
                    None => debug!("Dropping completion for unknown operation {}", operation),
                }
            }
            Stimulus::Cancel => self.request_cancel(),
            Stimulus::Abort { reason } => self.abort(&reason),
        }
    }

    fn execute_work_item(&mut self, item: WorkItem) {
        let target = item.target();
        if !self
            .instances
            .get(&target)
            .map(|i| i.is_executing())
            .unwrap_or(false)
        {
            debug!("Skipping work item {} for departed instance", item);
            return;
        }

        debug!("Running work item {}", item);
        let outcome = self.dispatch(item);

        if let Some(instance) = self.instances.get_mut(&target) {
            instance.decrement_busy();
        }
        if let Err(fault) = outcome {
            self.propagate_fault(target, fault);
        }
        self.settle(target);
    }

    fn settle(&mut self, id: InstanceId) {
        if !self.instances.contains_key(&id) {
            return;
        }
        if let Err(fault) = self.update_state(id) {
            self.propagate_fault(id, fault);
        }
    }

    fn dispatch(&mut self, item: WorkItem) -> FaultResult<()> {
        match item {
            WorkItem::Execute {
                instance,
                overrides,
            } => {
                self.instance_mut(instance)?.substate = Substate::ResolvingArguments;
                if let Some(overrides) = overrides {
                    self.apply_overrides(instance, overrides)?;
                }
                self.resolve_arguments(instance, 0).map(|_| ())
            }
            WorkItem::ExecuteBody { instance } => self.execute_body(instance),
            WorkItem::Completion {
                owner,
                continuation,
                child,
            } => self.handle_completion(owner, continuation, child),
            WorkItem::Fault {
                owner,
                callback,
                context,
            } => self.handle_fault(owner, &callback, context),
            WorkItem::BookmarkResumed {
                owner,
                callback,
                bookmark,
                value,
            } => {
                let definition = self.definition_of(owner)?;
                match &definition.body {
                    Body::Native(native) => native.on_bookmark_resumed(
                        &mut NativeContext::new(self, owner),
                        &callback,
                        &bookmark,
                        value,
                    ),
                    _ => Ok(()),
                }
            }
            WorkItem::Cancel { instance } => self.run_cancel(instance),
            WorkItem::Empty { .. } => Ok(()),
            WorkItem::CompleteOperation {
                instance,
                operation,
                outcome,
            } => self.complete_operation(instance, operation, outcome),
        }
    }

    /// Decide whether `id` can advance or terminate. Returns true once the
    /// instance has left the tree.
    fn update_state(&mut self, id: InstanceId) -> FaultResult<bool> {
        let isolating = self.isolation == Some(id);
        let instance = self.instance_mut(id)?;
        if instance.fault_pending {
            return Ok(false);
        }

        if instance.substate.is_pre_executing() {
            if instance.cancellation_requested {
                if instance.children.is_empty() {
                    self.complete_instance(id, ActivityState::Canceled);
                    return Ok(true);
                }
                for child in instance.children.clone() {
                    self.request_cancel_instance(child);
                }
                return Ok(false);
            }
            if instance.has_pending_work() {
                return Ok(false);
            }

            match instance.substate {
                Substate::ResolvingArguments => {
                    let owns = instance.owns_environment;
                    instance.substate = Substate::ResolvingVariables;
                    if owns {
                        self.environments.collapse_references(id)?;
                    }
                    if self.resolve_variables(id, 0)? {
                        self.schedule_body(id)?;
                    }
                }
                Substate::ResolvingVariables => self.schedule_body(id)?,
                _ => {}
            }
            return Ok(false);
        }

        if !instance.has_pending_work() && !isolating {
            let state = if instance.substate == Substate::Canceling {
                ActivityState::Canceled
            } else {
                ActivityState::Closed
            };
            self.complete_instance(id, state);
            return Ok(true);
        }

        if instance.performing_default_cancel
            && instance.children.is_empty()
            && instance.busy_count == instance.blocking_bookmarks
        {
            instance.substate = Substate::Canceling;
            debug!(
                "Force-purging {} bookmark(s) held by canceled instance {}",
                instance.blocking_bookmarks, id
            );
            self.purge_bookmarks_of(id);
            if self.isolation == Some(id) {
                self.isolation = None;
            }
            self.complete_instance(id, ActivityState::Canceled);
            return Ok(true);
        }

        Ok(false)
    }

    /// Remove a finished instance from the tree and notify whoever waits on it.
    fn complete_instance(&mut self, id: InstanceId, state: ActivityState) {
        let Some(mut instance) = self.instances.remove(&id) else {
            return;
        };
        instance.state = state;
        let definition = instance.definition.take();

        let outputs = match &definition {
            Some(def) if instance.owns_environment => self.gather_outputs(def, id),
            _ => IndexMap::new(),
        };

        let mut write_back = None;
        if state == ActivityState::Closed {
            if let (Some(target), Some(value)) = (&instance.result_target, outputs.get(RESULT_SLOT)) {
                if let Err(err) = self.environments.write_at(target, value.clone()) {
                    write_back = Some(Fault::from(err));
                }
            }
        }

        self.purge_bookmarks_of(id);
        self.release_properties(&instance);
        self.cancel_operations_of(id);
        if self.isolation == Some(id) {
            self.isolation = None;
        }
        if let Some(parent) = instance.parent.and_then(|p| self.instances.get_mut(&p)) {
            parent.remove_child(id);
            // A default-canceling parent ends Canceled once any child did not close.
            if parent.performing_default_cancel
                && state != ActivityState::Closed
                && !parent.substate.is_pre_executing()
            {
                parent.substate = Substate::Canceling;
            }
        }

        let kind = definition
            .as_ref()
            .map(|d| d.kind.clone())
            .unwrap_or_default();
        self.terminations.push(TerminationRecord {
            id,
            qualified_id: instance.qualified_id.clone(),
            kind: kind.clone(),
            state,
            body_started: !instance.substate.is_pre_executing(),
        });
        debug!("Instance {} ({}) completed as {}", id, instance.qualified_id, state);

        if instance.parent.is_none() {
            let outputs = if state == ActivityState::Closed {
                outputs
            } else {
                IndexMap::new()
            };
            info!("Workflow {} completed as {}", self.workflow_name, state);
            self.completion = Some(WorkflowCompletion::new(state, outputs, None));
        } else {
            let child = CompletedChild {
                id,
                qualified_id: instance.qualified_id.clone(),
                kind,
                state,
                outputs,
                fault: None,
            };
            match instance.completion.take() {
                Some(callback) => self.enqueue(
                    WorkItem::Completion {
                        owner: callback.owner,
                        continuation: callback.continuation,
                        child,
                    },
                    false,
                ),
                None => {
                    if let Some(parent) = instance.parent {
                        self.enqueue(WorkItem::Empty { instance: parent }, false);
                    }
                }
            }
        }

        if instance.owns_environment {
            self.environments.remove(id);
        }

        if let (Some(fault), Some(parent)) = (write_back, instance.parent) {
            self.propagate_fault(parent, fault);
        }
    }

    fn gather_outputs(&self, definition: &DefinitionRef, env: InstanceId) -> IndexMap<String, Value> {
        definition
            .arguments
            .iter()
            .filter(|a| a.direction != ArgumentDirection::In)
            .filter_map(|a| {
                self.environments
                    .get_for_read(Some(env), &a.name)
                    .ok()
                    .map(|v| (a.name.clone(), v))
            })
            .collect()
    }

    // ---- bodies ----------------------------------------------------------

    fn execute_body(&mut self, id: InstanceId) -> FaultResult<()> {
        let instance = self.instance_mut(id)?;
        if instance.cancellation_requested {
            // Left to the decision function, which cancels pre-executing instances.
            return Ok(());
        }
        if instance.initialization_incomplete {
            return Err(Fault::new(format!(
                "Instance {} ({}) cannot execute: initialization is incomplete",
                id, instance.qualified_id
            )));
        }
        instance.substate = Substate::Executing;

        let definition = self.definition_of(id)?;
        match &definition.body {
            Body::Code(code) => code(&mut CodeContext::new(self, id)),
            Body::Native(native) => native.execute(&mut NativeContext::new(self, id)),
            Body::Async(activity) => {
                let request = activity.begin(&mut NativeContext::new(self, id))?;
                self.start_operation(id, &definition.kind, request)?;
                Ok(())
            }
            Body::Composite => self.composite_step(id, None),
        }
    }

    fn composite_step(&mut self, id: InstanceId, after: Option<&QualifiedId>) -> FaultResult<()> {
        let definition = self.definition_of(id)?;
        let next = match after {
            None => 0,
            Some(previous) => definition
                .child_position(previous)
                .map(|p| p + 1)
                .unwrap_or(definition.children.len()),
        };
        if let Some(child) = definition.children.get(next) {
            if self.instance_mut(id)?.cancellation_requested {
                self.mark_canceling(id);
                return Ok(());
            }
            let spec = ChildSpec {
                completion: Some(CompletionCallback {
                    owner: id,
                    continuation: Continuation::CompositeStep,
                }),
                ..ChildSpec::plain()
            };
            self.schedule_instance(child.clone(), Some(id), spec, None)?;
        }
        Ok(())
    }

    fn handle_completion(
        &mut self,
        owner: InstanceId,
        continuation: Continuation,
        child: CompletedChild,
    ) -> FaultResult<()> {
        let canceling = self.instance_mut(owner)?.cancellation_requested;
        match continuation {
            Continuation::NextArgument(position) => {
                if expression_closed(owner, &child, canceling)? {
                    self.resolve_arguments(owner, position)?;
                }
                Ok(())
            }
            Continuation::NextVariable(position) => {
                if expression_closed(owner, &child, canceling)? {
                    self.resolve_variables(owner, position)?;
                }
                Ok(())
            }
            Continuation::CompositeStep => {
                if child.state == ActivityState::Closed {
                    self.composite_step(owner, Some(&child.qualified_id))?;
                }
                Ok(())
            }
            Continuation::Named(name) => {
                let definition = self.definition_of(owner)?;
                match &definition.body {
                    Body::Native(native) => {
                        native.on_child_completed(&mut NativeContext::new(self, owner), &name, &child)
                    }
                    _ => Ok(()),
                }
            }
        }
    }

    // ---- async operations ------------------------------------------------

    fn start_operation(&mut self, id: InstanceId, kind: &str, request: Value) -> Result<()> {
        self.next_operation_id += 1;
        let operation = OperationId(self.next_operation_id);
        let cancel = Arc::new(AtomicBool::new(false));
        self.instance_mut(id)?.increment_busy();
        self.operations.insert(
            operation,
            PendingOperation {
                instance: id,
                cancel: cancel.clone(),
            },
        );
        self.started_operations.push(AsyncOperation::new(
            operation,
            id,
            kind,
            request,
            cancel,
            self.inbox.sender(),
        ));
        debug!("Instance {} started operation {}", id, operation);
        Ok(())
    }

    fn complete_operation(
        &mut self,
        id: InstanceId,
        operation: OperationId,
        outcome: std::result::Result<Value, Fault>,
    ) -> FaultResult<()> {
        if self.operations.remove(&operation).is_none() {
            return Ok(());
        }
        let instance = self.instance_mut(id)?;
        instance.decrement_busy();
        if instance.substate == Substate::Canceling {
            debug!("Operation {} finished after cancel of {}", operation, id);
            return Ok(());
        }

        let value = outcome?;
        let definition = self.definition_of(id)?;
        match &definition.body {
            Body::Async(activity) => activity.end(&mut NativeContext::new(self, id), value),
            _ => Ok(()),
        }
    }

    fn signal_operations_of(&self, id: InstanceId) {
        for pending in self.operations.values().filter(|p| p.instance == id) {
            pending.cancel.store(true, Ordering::SeqCst);
        }
    }

    fn cancel_operations_of(&mut self, id: InstanceId) {
        self.signal_operations_of(id);
        self.operations.retain(|_, p| p.instance != id);
    }

    // ---- cancellation ----------------------------------------------------

    /// Request cancellation of the root.
    pub fn request_cancel(&mut self) {
        if let Some(root) = self.root {
            self.request_cancel_instance(root);
        }
    }

    pub(crate) fn request_cancel_instance(&mut self, id: InstanceId) {
        let Some(instance) = self.instances.get_mut(&id) else {
            return;
        };
        if !instance.is_executing() || instance.cancellation_requested {
            return;
        }
        instance.cancellation_requested = true;
        let item = if instance.substate.is_pre_executing() {
            WorkItem::Empty { instance: id }
        } else {
            WorkItem::Cancel { instance: id }
        };
        debug!("Cancellation requested for {}", id);
        self.enqueue(item, false);
    }

    fn run_cancel(&mut self, id: InstanceId) -> FaultResult<()> {
        let definition = self.definition_of(id)?;
        match &definition.body {
            Body::Native(native) => native.cancel(&mut NativeContext::new(self, id)),
            Body::Async(activity) => {
                self.signal_operations_of(id);
                activity.cancel(&mut NativeContext::new(self, id))?;
                self.mark_canceling(id);
                Ok(())
            }
            Body::Code(_) | Body::Composite => {
                self.default_cancel(id);
                Ok(())
            }
        }
    }

    pub(crate) fn default_cancel(&mut self, id: InstanceId) {
        let children = match self.instances.get_mut(&id) {
            Some(instance) => {
                instance.performing_default_cancel = true;
                instance.children.clone()
            }
            None => return,
        };
        for child in children {
            self.request_cancel_instance(child);
        }
    }

    /// True when `id` is performing default cancel and may not grow its
    /// subtree. The instance is marked canceled instead.
    pub(crate) fn refuses_children(&mut self, id: InstanceId) -> bool {
        let refused = self
            .instances
            .get(&id)
            .map(|i| i.performing_default_cancel)
            .unwrap_or(false);
        if refused {
            debug!("Instance {} is canceling; child not scheduled", id);
            self.mark_canceling(id);
        }
        refused
    }

    pub(crate) fn mark_canceling(&mut self, id: InstanceId) {
        if let Some(instance) = self.instances.get_mut(&id) {
            if !instance.substate.is_pre_executing() {
                instance.substate = Substate::Canceling;
            }
        }
    }

    // ---- abort -----------------------------------------------------------

    /// Hard-abort the whole tree.
    pub fn abort(&mut self, reason: &str) {
        if self.completion.is_some() {
            return;
        }
        warn!("Aborting workflow {}: {}", self.workflow_name, reason);
        self.terminate_workflow(Fault::new(reason));
    }

    fn terminate_workflow(&mut self, fault: Fault) {
        if let Some(root) = self.root {
            self.abort_instance(root, &fault.message);
        }
        let dropped = self.scheduler.clear();
        if !dropped.is_empty() {
            debug!("Dropped {} queued work item(s)", dropped.len());
        }
        for pending in self.operations.values() {
            pending.cancel.store(true, Ordering::SeqCst);
        }
        self.operations.clear();
        self.isolation = None;
        self.completion = Some(WorkflowCompletion::new(
            ActivityState::Faulted,
            IndexMap::new(),
            Some(fault),
        ));
    }

    /// Tear down the subtree rooted at `id`, deepest-leftmost node first.
    pub(crate) fn abort_instance(&mut self, id: InstanceId, reason: &str) {
        let mut order = Vec::new();
        let mut stack = vec![(id, false)];
        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                order.push(node);
                continue;
            }
            stack.push((node, true));
            if let Some(instance) = self.instances.get(&node) {
                for child in instance.children.iter().rev() {
                    stack.push((*child, false));
                }
            }
        }

        for node in order {
            self.abort_single(node, reason);
        }
    }

    fn abort_single(&mut self, id: InstanceId, reason: &str) {
        let Some(instance) = self.instances.get(&id) else {
            return;
        };
        let info = InstanceInfo::from(instance);
        let body_started = !instance.substate.is_pre_executing();
        if body_started {
            if let Some(Body::Native(native)) = instance.definition.as_ref().map(|d| &d.body) {
                let native = native.clone();
                if let Err(fault) = native.abort(&info, reason) {
                    warn!("Abort of {} raised a fault, ignoring: {}", id, fault);
                }
            }
        }

        let Some(mut instance) = self.instances.remove(&id) else {
            return;
        };
        instance.state = ActivityState::Faulted;
        self.cancel_operations_of(id);
        self.purge_bookmarks_of(id);
        self.release_properties(&instance);
        if self.isolation == Some(id) {
            self.isolation = None;
        }
        if instance.owns_environment {
            self.environments.remove(id);
        }
        if let Some(parent) = instance.parent.and_then(|p| self.instances.get_mut(&p)) {
            parent.remove_child(id);
        }
        self.terminations.push(TerminationRecord {
            id,
            qualified_id: instance.qualified_id.clone(),
            kind: info.kind,
            state: ActivityState::Faulted,
            body_started,
        });
    }

    // ---- faults ----------------------------------------------------------

    pub(crate) fn propagate_fault(&mut self, source: InstanceId, fault: Fault) {
        let source_qualified_id = self
            .instances
            .get(&source)
            .map(|i| i.qualified_id.clone())
            .unwrap_or_else(QualifiedId::root);
        debug!("Fault raised by {}: {}", source, fault);
        let context = FaultContext {
            source,
            source_qualified_id,
            propagator: source,
            fault,
        };
        self.raise_fault(source, context);
    }

    /// Route a fault to the nearest fault callback at or above `from`.
    fn raise_fault(&mut self, from: InstanceId, mut context: FaultContext) {
        if let Some(source) = self.instances.get_mut(&context.source) {
            source.fault_pending = true;
        }

        let mut current = Some(from);
        while let Some(id) = current {
            let Some(instance) = self.instances.get(&id) else {
                break;
            };
            let handler = instance
                .fault_callback
                .clone()
                .filter(|cb| self.instances.contains_key(&cb.owner));
            if let Some(callback) = handler {
                context.propagator = id;
                self.enqueue(
                    WorkItem::Fault {
                        owner: callback.owner,
                        callback: callback.name,
                        context,
                    },
                    true,
                );
                return;
            }
            current = instance.parent;
        }

        error!(
            "Unhandled fault from {} ({}): {}",
            context.source, context.source_qualified_id, context.fault
        );
        self.terminate_workflow(context.fault);
    }

    fn handle_fault(
        &mut self,
        owner: InstanceId,
        callback: &str,
        context: FaultContext,
    ) -> FaultResult<()> {
        let propagator = context.propagator;
        let Some(record) = self.instances.get(&propagator) else {
            return Ok(());
        };
        let completion = record.completion.clone();
        let qualified_id = record.qualified_id.clone();
        let kind = record.kind().to_string();

        let definition = self.definition_of(owner)?;
        let disposition = match &definition.body {
            Body::Native(native) => {
                native.on_child_faulted(&mut NativeContext::new(self, owner), callback, &context)?
            }
            _ => FaultDisposition::Propagate,
        };

        match disposition {
            FaultDisposition::Handled => {
                info!(
                    "Fault from {} handled by {}: {}",
                    context.source, owner, context.fault
                );
                self.abort_instance(propagator, &context.fault.message);
                let child = CompletedChild {
                    id: propagator,
                    qualified_id,
                    kind,
                    state: ActivityState::Faulted,
                    outputs: IndexMap::new(),
                    fault: Some(context.fault),
                };
                match completion {
                    Some(callback) => self.enqueue(
                        WorkItem::Completion {
                            owner: callback.owner,
                            continuation: callback.continuation,
                            child,
                        },
                        false,
                    ),
                    None => self.enqueue(WorkItem::Empty { instance: owner }, false),
                }
            }
            FaultDisposition::Propagate => self.raise_fault(owner, context),
        }
        Ok(())
    }

    // ---- bookmarks -------------------------------------------------------

    pub(crate) fn create_bookmark(
        &mut self,
        owner: InstanceId,
        bookmark: Bookmark,
        callback: &str,
        options: BookmarkOptions,
        handle: Option<(HandleId, bool)>,
    ) -> Result<Bookmark> {
        if !self.instance_mut(owner)?.is_executing() {
            return Err(ExecutionError::InstanceNotExecuting(owner));
        }
        if self.bookmarks.get(&bookmark).is_some() {
            return Err(ExecutionError::DuplicateBookmark {
                name: bookmark.to_string(),
            });
        }
        if let Some((id, important)) = handle {
            let handle = self
                .handles
                .get_mut(id)
                .ok_or_else(|| ExecutionError::HandleNotFound(id.0.to_string()))?;
            if !handle.can_see(&bookmark.scope) {
                return Err(ExecutionError::ScopeNotVisible {
                    handle: id.0,
                    scope: bookmark.scope.to_string(),
                });
            }
            handle.add(bookmark.clone(), important)?;
        }

        self.bookmarks.register(BookmarkRecord {
            bookmark: bookmark.clone(),
            owner,
            callback: callback.to_string(),
            options,
            handle: handle.map(|(id, _)| id),
        })?;
        if options.blocking {
            self.instance_mut(owner)?.add_blocking_bookmark();
        }
        debug!("Instance {} registered bookmark {}", owner, bookmark);
        Ok(bookmark)
    }

    pub(crate) fn remove_bookmark(&mut self, owner: InstanceId, bookmark: &Bookmark) -> Result<bool> {
        match self.bookmarks.get(bookmark) {
            Some(record) if record.owner == owner => {
                self.purge_bookmark(bookmark);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Drop a bookmark, releasing its busy count. Returns the former owner.
    fn purge_bookmark(&mut self, bookmark: &Bookmark) -> Option<InstanceId> {
        let record = self.bookmarks.remove(bookmark)?;
        if record.options.blocking {
            if let Some(owner) = self.instances.get_mut(&record.owner) {
                owner.remove_blocking_bookmark();
            }
        }
        self.handles.forget(bookmark);
        Some(record.owner)
    }

    pub(crate) fn purge_bookmarks_of(&mut self, owner: InstanceId) {
        for bookmark in self.bookmarks.owned_by(owner) {
            self.purge_bookmark(&bookmark);
        }
    }

    pub fn resume_bookmark(&mut self, bookmark: &Bookmark, value: Value) -> BookmarkResumptionResult {
        if self.completion.is_some() {
            return BookmarkResumptionResult::NotFound;
        }
        let Some(record) = self.bookmarks.get(bookmark).cloned() else {
            return BookmarkResumptionResult::NotFound;
        };
        if !self.instances.contains_key(&record.owner) {
            return BookmarkResumptionResult::NotFound;
        }
        if let Some(isolation) = self.isolation {
            if !self.is_within(record.owner, isolation) {
                return BookmarkResumptionResult::NotReady;
            }
        }

        if !record.options.multiple_resume {
            self.bookmarks.remove(bookmark);
            if record.options.blocking {
                if let Some(owner) = self.instances.get_mut(&record.owner) {
                    owner.remove_blocking_bookmark();
                }
            }
        }

        if let Some(handle) = record.handle {
            let losers = self
                .handles
                .get_mut(handle)
                .map(|h| h.settle(bookmark))
                .unwrap_or_default();
            for loser in losers {
                debug!("Bookmark {} lost exclusive handle race to {}", loser, bookmark);
                if let Some(owner) = self.purge_bookmark(&loser) {
                    if owner != record.owner {
                        self.enqueue(WorkItem::Empty { instance: owner }, false);
                    }
                }
            }
        }

        debug!("Resuming bookmark {} on {}", bookmark, record.owner);
        self.enqueue(
            WorkItem::BookmarkResumed {
                owner: record.owner,
                callback: record.callback,
                bookmark: bookmark.clone(),
                value,
            },
            false,
        );
        BookmarkResumptionResult::Success
    }

    pub(crate) fn declare_bookmark_scope(&mut self, owner: InstanceId) -> Result<BookmarkScope> {
        let environment = self
            .instance_mut(owner)?
            .environment
            .ok_or(ExecutionError::NoEnvironment(owner))?;
        let scope = BookmarkScope::new_named();
        self.environments
            .add_bookmark_scope(environment, scope.clone())?;
        Ok(scope)
    }

    pub fn register_bookmark_scope(&mut self, scope: BookmarkScope) {
        if !self.host_bookmark_scopes.contains(&scope) {
            self.host_bookmark_scopes.push(scope);
        }
    }

    // ---- properties ------------------------------------------------------

    pub(crate) fn add_property(
        &mut self,
        owner: InstanceId,
        name: &str,
        value: PropertyValue,
        only_visible_to_public_children: bool,
    ) -> Result<()> {
        let definition = self.definition_of(owner)?;
        let current = self.instance_mut(owner)?.property_scope;
        let removable_with_children = matches!(value, PropertyValue::ExclusiveHandle(_));
        let entry = PropertyEntry {
            value,
            fence: only_visible_to_public_children.then_some(definition.compile_unit),
            removable_with_children,
        };
        let scope = self.properties.add(Some(owner), current, name, entry)?;
        self.instance_mut(owner)?.property_scope = Some(scope);
        Ok(())
    }

    pub(crate) fn find_property(&self, id: InstanceId, name: &str) -> Option<&PropertyEntry> {
        let instance = self.instances.get(&id)?;
        let unit = instance.definition.as_ref()?.compile_unit;
        self.properties.find(instance.property_scope, name, unit)
    }

    pub(crate) fn remove_property(&mut self, owner: InstanceId, name: &str) -> Result<()> {
        let instance = self.instance_mut(owner)?;
        let has_children = !instance.children.is_empty();
        let scope = instance.property_scope;
        let entry = self.properties.remove(owner, scope, name, has_children)?;
        if let PropertyValue::ExclusiveHandle(handle) = entry.value {
            self.drop_handle(handle);
        }
        Ok(())
    }

    pub fn add_host_property(&mut self, name: &str, value: Value) -> Result<()> {
        let previous = self.host_scope;
        let scope = self.properties.add(
            None,
            previous,
            name,
            PropertyEntry::new(PropertyValue::Value(value)),
        )?;
        if previous != Some(scope) {
            // Instances created before the host scope existed inherit it now.
            for instance in self.instances.values_mut() {
                if instance.property_scope == previous {
                    instance.property_scope = Some(scope);
                }
            }
        }
        self.host_scope = Some(scope);
        Ok(())
    }

    fn release_properties(&mut self, instance: &ActivityInstance) {
        let Some(scope) = instance.property_scope else {
            return;
        };
        if self.properties.owner_of(scope) != Some(instance.id) {
            return;
        }
        for entry in self.properties.release(scope) {
            if let PropertyValue::ExclusiveHandle(handle) = entry.value {
                self.drop_handle(handle);
            }
        }
    }

    pub(crate) fn create_exclusive_handle(&mut self, owner: InstanceId, name: &str) -> Result<HandleId> {
        let instance = self.instance_mut(owner)?;
        let environment = instance.environment;
        if let Some(scope) = instance.property_scope {
            if self.properties.owner_of(scope) == Some(owner)
                && self.properties.local(Some(scope), name).is_some()
            {
                return Err(ExecutionError::HandleAlreadyInitialized {
                    name: name.to_string(),
                });
            }
        }

        let mut scopes = self.environments.visible_bookmark_scopes(environment);
        for scope in &self.host_bookmark_scopes {
            if !scopes.contains(scope) {
                scopes.push(scope.clone());
            }
        }
        if !scopes.contains(&BookmarkScope::Default) {
            scopes.push(BookmarkScope::Default);
        }

        let handle = self.handles.create(owner, name, scopes);
        if let Err(err) = self.add_property(owner, name, PropertyValue::ExclusiveHandle(handle), false) {
            self.handles.remove(handle);
            return Err(err);
        }
        debug!("Instance {} initialized exclusive handle {}", owner, name);
        Ok(handle)
    }

    fn drop_handle(&mut self, handle: HandleId) {
        if self.handles.remove(handle).is_some() {
            self.bookmarks.clear_handle(handle);
        }
    }

    // ---- isolation -------------------------------------------------------

    pub(crate) fn enter_isolation(&mut self, owner: InstanceId) -> Result<()> {
        if let Some(current) = self.isolation {
            return Err(ExecutionError::IsolationActive(current));
        }
        self.instance_mut(owner)?;
        self.isolation = Some(owner);
        debug!("Instance {} entered isolation", owner);
        Ok(())
    }

    pub(crate) fn exit_isolation(&mut self, owner: InstanceId) -> Result<()> {
        if self.isolation != Some(owner) {
            return Err(ExecutionError::NoIsolation(owner));
        }
        self.isolation = None;
        debug!("Instance {} left isolation", owner);
        Ok(())
    }

    /// True when `id` is `ancestor` or one of its descendants.
    pub(crate) fn is_within(&self, id: InstanceId, ancestor: InstanceId) -> bool {
        let mut current = Some(id);
        while let Some(node) = current {
            if node == ancestor {
                return true;
            }
            current = self.instances.get(&node).and_then(|i| i.parent);
        }
        false
    }

    // ---- quiescence ------------------------------------------------------

    /// Why the tree cannot be persisted right now, if anything.
    pub fn quiescence_violation(&self) -> Option<String> {
        if !self.scheduler.is_empty() {
            return Some(format!("{} work item(s) queued", self.scheduler.len()));
        }
        if !self.operations.is_empty() {
            return Some(format!(
                "{} async operation(s) outstanding",
                self.operations.len()
            ));
        }
        if let Some(owner) = self.isolation {
            return Some(format!("isolation scope owned by {} is active", owner));
        }
        self.instances
            .values()
            .find(|i| i.busy_count != i.blocking_bookmarks)
            .map(|i| {
                format!(
                    "instance {} has busy count {} with {} blocking bookmark(s)",
                    i.id, i.busy_count, i.blocking_bookmarks
                )
            })
    }
}

/// Whether an argument or variable expression produced its value. A faulted
/// expression is already propagating; any other non-closed end is a fault of
/// the owner unless the owner is being canceled.
fn expression_closed(
    owner: InstanceId,
    child: &CompletedChild,
    canceling: bool,
) -> FaultResult<bool> {
    match child.state {
        ActivityState::Closed => Ok(!canceling),
        ActivityState::Faulted => Ok(false),
        _ if canceling => Ok(false),
        state => Err(Fault::new(format!(
            "Expression {} of instance {} ended {} without a value",
            child.qualified_id, owner, state
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{ActivityBuilder, ArgumentSlot, ValueType, VariableSlot};
    use crate::definition::{BinaryOp, Expression};
    use crate::engine::context::NativeActivity;
    use serde_json::json;

    struct Waiter;

    impl NativeActivity for Waiter {
        fn execute(&self, ctx: &mut NativeContext<'_>) -> FaultResult<()> {
            ctx.create_bookmark("go", "resumed", BookmarkOptions::default())?;
            Ok(())
        }

        fn on_bookmark_resumed(
            &self,
            ctx: &mut NativeContext<'_>,
            _callback: &str,
            _bookmark: &Bookmark,
            value: Value,
        ) -> FaultResult<()> {
            ctx.set_result(value)
        }
    }

    fn waiter() -> ActivityBuilder {
        ActivityBuilder::new("waiter", Body::native(Waiter))
            .argument(ArgumentSlot::output(RESULT_SLOT, ValueType::Any))
    }

    fn start(root: ActivityBuilder) -> Executor {
        let workflow = WorkflowDefinition::new("unit", "1", root).unwrap();
        let mut executor = Executor::new(&workflow);
        executor
            .create_root(workflow.root.clone(), IndexMap::new())
            .unwrap();
        executor
    }

    #[test]
    fn test_code_body_closes_root() {
        let root = ActivityBuilder::new("code", Body::code(|ctx| ctx.set("out", json!(5))))
            .argument(ArgumentSlot::output("out", ValueType::Integer));
        let mut executor = start(root);
        let outcome = executor.run_until_quiescent();
        let completion = outcome.completion().unwrap();
        assert_eq!(completion.state, ActivityState::Closed);
        assert_eq!(completion.output("out"), Some(&json!(5)));
        assert!(executor.instances.is_empty());
        assert!(executor.environments.is_empty());
    }

    #[test]
    fn test_blocking_bookmark_keeps_root_busy() {
        let mut executor = start(waiter());
        assert!(executor.run_until_quiescent().is_idle());

        let root = executor.root.unwrap();
        let instance = executor.instance_ref(root).unwrap();
        assert_eq!(instance.busy_count, 1);
        assert_eq!(instance.blocking_bookmarks, 1);
        assert!(executor.quiescence_violation().is_none());

        let result = executor.resume_bookmark(&Bookmark::new("go"), json!("done"));
        assert_eq!(result, BookmarkResumptionResult::Success);
        let completion = executor.run_until_quiescent();
        assert_eq!(
            completion.completion().unwrap().output(RESULT_SLOT),
            Some(&json!("done"))
        );
    }

    #[test]
    fn test_variables_resolve_before_body() {
        let root = ActivityBuilder::new(
            "code",
            Body::code(|ctx| {
                let b = ctx.get("b")?;
                ctx.set("out", b)
            }),
        )
        .argument(ArgumentSlot::output("out", ValueType::Integer))
        .variable(VariableSlot::new("a", ValueType::Integer).with_default(Expression::literal(1)))
        .variable(VariableSlot::new("b", ValueType::Integer).with_default(Expression::binary(
            BinaryOp::Add,
            Expression::reference("a"),
            Expression::literal(1),
        )));
        let mut executor = start(root);
        let outcome = executor.run_until_quiescent();
        assert_eq!(outcome.completion().unwrap().output("out"), Some(&json!(2)));
    }

    #[test]
    fn test_cancel_before_execution() {
        let mut executor = start(waiter());
        executor.request_cancel();
        let outcome = executor.run_until_quiescent();
        assert_eq!(outcome.completion().unwrap().state, ActivityState::Canceled);
        assert!(executor.terminations.iter().all(|t| !t.body_started));
    }

    #[test]
    fn test_unhandled_fault_faults_workflow() {
        let root = ActivityBuilder::new("boom", Body::code(|_| Err(Fault::new("boom"))));
        let mut executor = start(root);
        let outcome = executor.run_until_quiescent();
        let completion = outcome.completion().unwrap();
        assert_eq!(completion.state, ActivityState::Faulted);
        assert_eq!(completion.fault.as_ref().unwrap().message, "boom");
    }

    #[test]
    fn test_unknown_root_input_rejected() {
        let workflow = WorkflowDefinition::new("unit", "1", waiter()).unwrap();
        let mut executor = Executor::new(&workflow);
        let mut inputs = IndexMap::new();
        inputs.insert("nope".to_string(), json!(1));
        assert!(matches!(
            executor.create_root(workflow.root.clone(), inputs),
            Err(ExecutionError::SlotNotFound { .. })
        ));
    }
}
