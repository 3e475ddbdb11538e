// ABOUTME: Synchronous host API over one executing instance tree
// ABOUTME: Creates the root, pulses the scheduler, resumes bookmarks, cancels, aborts and persists

use indexmap::IndexMap;
use tracing::{info, instrument};

use super::bookmark::{Bookmark, BookmarkRecord, BookmarkResumptionResult, BookmarkScope};
use super::error::Result;
use super::executor::Executor;
use super::instance::{InstanceId, InstanceInfo, TerminationRecord};
use super::persistence::PersistedState;
use super::result::RunOutcome;
use super::scheduler::{AsyncOperation, ExternalHandle, WorkItem};
use crate::definition::{Value, WorkflowDefinition};

pub struct InstanceTree {
    workflow: WorkflowDefinition,
    executor: Executor,
}

impl std::fmt::Debug for InstanceTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceTree")
            .field("workflow", &self.workflow.name)
            .field("instances", &self.executor.instances.len())
            .field("bookmarks", &self.executor.bookmarks.len())
            .finish()
    }
}

impl InstanceTree {
    /// Schedule the workflow's root with the given inputs. Nothing runs until
    /// the first call to `run_until_quiescent`.
    #[instrument(skip(workflow, inputs), fields(workflow_name = %workflow.name))]
    pub fn create_root(
        workflow: &WorkflowDefinition,
        inputs: IndexMap<String, Value>,
    ) -> Result<Self> {
        let mut executor = Executor::new(workflow);
        executor.create_root(workflow.root.clone(), inputs)?;
        Ok(Self {
            workflow: workflow.clone(),
            executor,
        })
    }

    /// Rebuild a tree persisted by `snapshot`.
    #[instrument(skip(state, workflow), fields(workflow_name = %workflow.name))]
    pub fn restore(state: PersistedState, workflow: &WorkflowDefinition) -> Result<Self> {
        let executor = Executor::restore(state, workflow)?;
        Ok(Self {
            workflow: workflow.clone(),
            executor,
        })
    }

    pub fn workflow(&self) -> &WorkflowDefinition {
        &self.workflow
    }

    pub fn root(&self) -> Option<InstanceId> {
        self.executor.root
    }

    #[instrument(skip(self), fields(workflow_name = %self.workflow.name))]
    pub fn run_until_quiescent(&mut self) -> Result<RunOutcome> {
        let outcome = self.executor.run_until_quiescent();
        info!("Pulse finished: {}", outcome);
        Ok(outcome)
    }

    /// Pulse with an upper bound on executed work items; the workflow is
    /// aborted when the bound is exceeded.
    pub fn run_bounded(&mut self, limit: usize) -> Result<RunOutcome> {
        self.executor.run_bounded(limit)
    }

    /// Execute a single work item, draining the inbox first.
    pub fn step(&mut self) -> bool {
        self.executor.step()
    }

    pub fn outcome(&self) -> RunOutcome {
        self.executor.outcome()
    }

    #[instrument(skip(self, value), fields(workflow_name = %self.workflow.name))]
    pub fn resume_bookmark(
        &mut self,
        name: &str,
        scope: BookmarkScope,
        value: Value,
    ) -> BookmarkResumptionResult {
        self.executor
            .resume_bookmark(&Bookmark::in_scope(name, scope), value)
    }

    pub fn request_cancel(&mut self) {
        info!("Cancellation requested for workflow {}", self.workflow.name);
        self.executor.request_cancel();
    }

    pub fn abort(&mut self, reason: &str) {
        self.executor.abort(reason);
    }

    #[instrument(skip(self), fields(workflow_name = %self.workflow.name))]
    pub fn snapshot(&self) -> Result<PersistedState> {
        self.executor.snapshot()
    }

    pub fn is_quiescent(&self) -> bool {
        self.executor.quiescence_violation().is_none()
    }

    pub fn external_handle(&self) -> ExternalHandle {
        self.executor.inbox.handle()
    }

    /// Async operations started since the last call, for the host to perform.
    pub fn take_started_operations(&mut self) -> Vec<AsyncOperation> {
        self.executor.take_started_operations()
    }

    pub fn bookmarks(&self) -> Vec<BookmarkRecord> {
        self.executor.bookmarks.records().cloned().collect()
    }

    /// Target instance of every queued work item, front of the queue first.
    pub fn queued_work(&self) -> Vec<InstanceId> {
        self.executor.scheduler.iter().map(WorkItem::target).collect()
    }

    /// Owning instance of every async operation still awaiting its answer.
    pub fn pending_operations(&self) -> Vec<InstanceId> {
        self.executor.operations.values().map(|p| p.instance).collect()
    }

    pub fn instance(&self, id: InstanceId) -> Option<InstanceInfo> {
        self.executor.instance_ref(id).map(InstanceInfo::from)
    }

    pub fn instances(&self) -> Vec<InstanceInfo> {
        self.executor
            .instances
            .values()
            .map(InstanceInfo::from)
            .collect()
    }

    /// Every instance that has left the tree, in termination order.
    pub fn terminations(&self) -> &[TerminationRecord] {
        &self.executor.terminations
    }

    pub fn environment_count(&self) -> usize {
        self.executor.environments.len()
    }

    /// Make `scope` visible to every exclusive handle created from now on.
    pub fn register_bookmark_scope(&mut self, scope: BookmarkScope) {
        self.executor.register_bookmark_scope(scope);
    }

    pub fn add_host_property(&mut self, name: &str, value: Value) -> Result<()> {
        self.executor.add_host_property(name, value)
    }

    pub(crate) fn executor_mut(&mut self) -> &mut Executor {
        &mut self.executor
    }
}
