// ABOUTME: Common utilities and helpers for integration tests
// ABOUTME: Builds workflows from YAML, starts instance trees and checks tree-wide invariants

#![allow(dead_code)]

use indexmap::IndexMap;
use std::path::PathBuf;
use tempfile::TempDir;
use tokio::fs;

use trailhead::definition::{Value, WorkflowDefinition};
use trailhead::engine::{InstanceTree, RunOutcome};
use trailhead::parser::WorkflowParser;

/// Parse and freeze a workflow document.
pub fn workflow(yaml: &str) -> WorkflowDefinition {
    let parser = WorkflowParser::new();
    let document = parser.parse_string(yaml).expect("workflow should parse");
    parser.build(&document).expect("workflow should build")
}

pub fn start(workflow: &WorkflowDefinition, inputs: IndexMap<String, Value>) -> InstanceTree {
    InstanceTree::create_root(workflow, inputs).expect("root should be created")
}

pub fn inputs(pairs: &[(&str, Value)]) -> IndexMap<String, Value> {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

/// Every live instance's busy count equals the work queued for it, plus its
/// outstanding async operations, plus the blocking bookmarks it owns.
pub fn assert_pending_work_invariant(tree: &InstanceTree) {
    let queued = tree.queued_work();
    let operations = tree.pending_operations();
    let bookmarks = tree.bookmarks();
    for info in tree.instances() {
        let expected = queued.iter().filter(|id| **id == info.id).count()
            + operations.iter().filter(|id| **id == info.id).count()
            + bookmarks
                .iter()
                .filter(|r| r.owner == info.id && r.options.blocking)
                .count();
        assert_eq!(
            info.busy_count as usize, expected,
            "busy count mismatch on {} ({})",
            info.id, info.qualified_id
        );
        assert_eq!(
            info.has_pending_work,
            !info.children.is_empty() || info.busy_count > 0,
            "pending work mismatch on {} ({})",
            info.id, info.qualified_id
        );
    }
}

/// Drive the tree one work item at a time, checking the invariant after each.
pub fn run_checked(tree: &mut InstanceTree) -> RunOutcome {
    assert_pending_work_invariant(tree);
    while tree.step() {
        assert_pending_work_invariant(tree);
    }
    tree.outcome()
}

pub struct TestEnvironment {
    pub temp_dir: TempDir,
}

impl TestEnvironment {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }

    pub async fn create_workflow_file(&self, name: &str, yaml: &str) -> PathBuf {
        let path = self.path(&format!("{}.yaml", name));
        fs::write(&path, yaml)
            .await
            .expect("Failed to write workflow file");
        path
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

pub const APPROVAL_WORKFLOW: &str = r#"
name: approval
version: "1.0"
arguments:
  amount: { type: integer, required: true }
  decision: { direction: out }
  summary: { direction: out }
root:
  type: sequence
  variables:
    answer: {}
  children:
    - type: log
      with: { message: { ref: amount } }
    - type: wait_for_bookmark
      config: { bookmark: approve }
      with: { Result: { ref: answer } }
    - type: assign
      with: { to: { ref: decision }, value: { ref: answer } }
    - type: assign
      with:
        to: { ref: summary }
        value: { op: add, left: "decided: ", right: { ref: answer } }
"#;
