// ABOUTME: Tokio host loop that keeps an instance tree running between external stimuli
// ABOUTME: Pulses the tree, hands started async operations to the caller and waits on the inbox

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use super::error::Result;
use super::result::RunOutcome;
use super::scheduler::{AsyncOperation, ExternalHandle};
use super::tree::InstanceTree;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long the loop waits for a stimulus before reporting the tree idle.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Work items one pulse may run before the workflow is aborted.
    pub max_pulse_items: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
            max_pulse_items: 100_000,
        }
    }
}

pub struct WorkflowEngine {
    tree: InstanceTree,
    config: EngineConfig,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("tree", &self.tree)
            .field("config", &self.config)
            .finish()
    }
}

impl WorkflowEngine {
    pub fn new(tree: InstanceTree, config: EngineConfig) -> Self {
        Self { tree, config }
    }

    pub fn handle(&self) -> ExternalHandle {
        self.tree.external_handle()
    }

    pub fn tree(&self) -> &InstanceTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut InstanceTree {
        &mut self.tree
    }

    pub fn into_tree(self) -> InstanceTree {
        self.tree
    }

    /// Run until the workflow completes or no stimulus arrives within the idle
    /// timeout. Every async operation the tree starts is passed to
    /// `on_operation`, which must eventually complete or fail it.
    #[instrument(skip(self, on_operation), fields(workflow_name = %self.tree.workflow().name))]
    pub async fn run<F>(&mut self, mut on_operation: F) -> Result<RunOutcome>
    where
        F: FnMut(AsyncOperation),
    {
        loop {
            let outcome = self.tree.run_bounded(self.config.max_pulse_items)?;
            for operation in self.tree.take_started_operations() {
                debug!("Dispatching operation {} ({})", operation.id, operation.kind);
                on_operation(operation);
            }
            if let RunOutcome::Completed(completion) = outcome {
                info!("Workflow completed as {}", completion.state);
                return Ok(RunOutcome::Completed(completion));
            }

            let waited = timeout(
                self.config.idle_timeout,
                self.tree.executor_mut().wait_for_stimulus(),
            )
            .await;
            match waited {
                Ok(result) => result?,
                Err(_) => {
                    warn!(
                        "No stimulus within {:?}; leaving workflow idle",
                        self.config.idle_timeout
                    );
                    return Ok(RunOutcome::Idle);
                }
            }
        }
    }
}
