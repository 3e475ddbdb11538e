// ABOUTME: Command implementations for the trailhead CLI
// ABOUTME: Handles run, resume and validate, including snapshot files between runs

use anyhow::{anyhow, Result};
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

use super::args::parse_value;
use super::config::Config;
use crate::definition::{Value, WorkflowDefinition};
use crate::engine::{
    BookmarkResumptionResult, BookmarkScope, InstanceTree, PersistedState, RunOutcome,
    WorkflowEngine,
};
use crate::parser::{WorkflowParser, WorkflowValidator};

/// Start a workflow from a YAML file
pub async fn run_workflow(
    workflow_path: PathBuf,
    inputs: IndexMap<String, Value>,
    snapshot: Option<PathBuf>,
    complete_operations: bool,
    config: &Config,
) -> Result<()> {
    info!("Starting workflow execution: {}", workflow_path.display());

    let workflow = load_workflow(&workflow_path).await?;
    let mut all_inputs = config.inputs.clone();
    all_inputs.extend(inputs);
    let tree = InstanceTree::create_root(&workflow, all_inputs)
        .map_err(|e| anyhow!("Failed to start workflow: {}", e))?;

    drive(tree, snapshot, complete_operations, config).await
}

/// Restore a snapshot, apply the requested stimulus and keep running
#[allow(clippy::too_many_arguments)]
pub async fn resume_workflow(
    state_path: PathBuf,
    workflow_path: PathBuf,
    bookmark: Option<String>,
    value: Option<String>,
    cancel: bool,
    snapshot: Option<PathBuf>,
    complete_operations: bool,
    config: &Config,
) -> Result<()> {
    info!("Resuming workflow from {}", state_path.display());

    let workflow = load_workflow(&workflow_path).await?;
    let content = fs::read_to_string(&state_path)
        .await
        .map_err(|e| anyhow!("Failed to read snapshot '{}': {}", state_path.display(), e))?;
    let state = PersistedState::from_json(&content)
        .map_err(|e| anyhow!("Failed to parse snapshot: {}", e))?;
    let mut tree = InstanceTree::restore(state, &workflow)
        .map_err(|e| anyhow!("Failed to restore workflow: {}", e))?;

    if let Some(name) = bookmark {
        let value = value.as_deref().map(parse_value).unwrap_or(Value::Null);
        match tree.resume_bookmark(&name, BookmarkScope::Default, value) {
            BookmarkResumptionResult::Success => info!("Resumed bookmark '{}'", name),
            other => return Err(anyhow!("Cannot resume bookmark '{}': {}", name, other)),
        }
    }
    if cancel {
        tree.request_cancel();
    }

    let snapshot = snapshot.or(Some(state_path));
    drive(tree, snapshot, complete_operations, config).await
}

/// Validate a workflow file
pub async fn validate_workflow(workflow_path: PathBuf, strict: bool) -> Result<()> {
    info!("Validating workflow: {}", workflow_path.display());

    let parser = WorkflowParser::new();
    let document = parser
        .parse_file(&workflow_path)
        .await
        .map_err(|e| anyhow!("Workflow validation failed: {}", e))?;

    let report = WorkflowValidator::new()
        .with_strict_mode(strict)
        .validate(&document)
        .map_err(|e| anyhow!("Workflow validation failed: {}", e))?;

    for warning in &report.warnings {
        println!("  warning: {}", warning);
    }
    if !report.is_valid {
        for error in &report.errors {
            println!("  error: {}", error);
        }
        return Err(anyhow!(
            "Workflow '{}' has {} validation error(s)",
            document.name,
            report.errors.len()
        ));
    }

    println!("✓ Workflow '{}' is valid", document.name);
    println!("  Activities: {}", document.nodes().len());
    println!("  Arguments: {}", document.arguments.len());

    info!("Workflow validation completed successfully");
    Ok(())
}

async fn load_workflow(path: &Path) -> Result<WorkflowDefinition> {
    let parser = WorkflowParser::new();
    let (_, workflow) = parser
        .load_file(path)
        .await
        .map_err(|e| anyhow!("Failed to load workflow: {}", e))?;
    info!("Loaded workflow: {} v{}", workflow.name, workflow.version);
    Ok(workflow)
}

/// Run the tree on the host loop, then report the outcome or persist it.
async fn drive(
    tree: InstanceTree,
    snapshot: Option<PathBuf>,
    complete_operations: bool,
    config: &Config,
) -> Result<()> {
    let complete_operations = complete_operations || config.complete_operations;
    let mut engine = WorkflowEngine::new(tree, config.engine_config());
    let mut deferred = Vec::new();

    let outcome = engine
        .run(|operation| {
            if complete_operations {
                let answer = operation.request.clone();
                if let Err(e) = operation.complete(answer) {
                    warn!("Could not complete operation: {}", e);
                }
            } else {
                warn!(
                    "External call {} ({}) left pending; pass --complete-operations to answer it",
                    operation.id, operation.kind
                );
                deferred.push(operation);
            }
        })
        .await
        .map_err(|e| anyhow!("Workflow execution failed: {}", e))?;

    let tree = engine.into_tree();
    match outcome {
        RunOutcome::Completed(completion) => {
            println!(
                "Workflow '{}' completed with state: {}",
                tree.workflow().name,
                completion.state
            );
            for (name, value) in &completion.outputs {
                println!("  {}: {}", name, value);
            }
            match &completion.fault {
                Some(fault) => Err(anyhow!("Workflow faulted: {}", fault)),
                None if completion.is_success() => Ok(()),
                None => Err(anyhow!("Workflow finished as {}", completion.state)),
            }
        }
        RunOutcome::Idle => {
            let state = tree
                .snapshot()
                .map_err(|e| anyhow!("Workflow is idle but cannot be persisted: {}", e))?;
            let path = match snapshot {
                Some(path) => path,
                None => default_snapshot_path(config, &tree.workflow().name)?,
            };
            let json = state
                .to_json()
                .map_err(|e| anyhow!("Failed to serialize snapshot: {}", e))?;
            fs::write(&path, json)
                .await
                .map_err(|e| anyhow!("Failed to write snapshot '{}': {}", path.display(), e))?;

            println!("Workflow '{}' is waiting", tree.workflow().name);
            for bookmark in state.bookmark_names() {
                println!("  bookmark: {}", bookmark);
            }
            println!("Snapshot written to: {}", path.display());
            Ok(())
        }
    }
}

fn default_snapshot_path(config: &Config, workflow_name: &str) -> Result<PathBuf> {
    let dir = config
        .snapshot_dir
        .clone()
        .ok_or_else(|| anyhow!("Workflow is idle; pass --snapshot or configure snapshot_dir"))?;
    Ok(dir.join(format!("{}.json", workflow_name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    fn workflow_file(yaml: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_run_then_resume_through_snapshot() {
        let file = workflow_file(
            r#"
name: approval
arguments:
  decision: { direction: out }
root:
  type: wait_for_bookmark
  config: { bookmark: approve }
  with: { Result: { ref: decision } }
"#,
        );
        let dir = tempdir().unwrap();
        let snapshot = dir.path().join("state.json");
        let config = Config::default();

        run_workflow(
            file.path().to_path_buf(),
            IndexMap::new(),
            Some(snapshot.clone()),
            false,
            &config,
        )
        .await
        .unwrap();
        assert!(snapshot.exists());

        resume_workflow(
            snapshot.clone(),
            file.path().to_path_buf(),
            Some("approve".to_string()),
            Some("\"yes\"".to_string()),
            false,
            None,
            false,
            &config,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_bookmark_is_error() {
        let file = workflow_file(
            "name: w\nroot: { type: wait_for_bookmark, config: { bookmark: approve } }",
        );
        let dir = tempdir().unwrap();
        let snapshot = dir.path().join("state.json");
        let config = Config::default();
        run_workflow(
            file.path().to_path_buf(),
            IndexMap::new(),
            Some(snapshot.clone()),
            false,
            &config,
        )
        .await
        .unwrap();

        let result = resume_workflow(
            snapshot,
            file.path().to_path_buf(),
            Some("reject".to_string()),
            None,
            false,
            None,
            false,
            &config,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_faulted_run_is_error() {
        let file = workflow_file("name: w\nroot: { type: throw, with: { message: boom } }");
        let result = run_workflow(
            file.path().to_path_buf(),
            IndexMap::new(),
            None,
            false,
            &Config::default(),
        )
        .await;
        assert!(result.unwrap_err().to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_validate_rejects_unknown_kind() {
        let file = workflow_file("name: w\nroot: { type: teleport }");
        assert!(validate_workflow(file.path().to_path_buf(), false)
            .await
            .is_err());
    }
}
