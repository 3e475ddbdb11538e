// ABOUTME: Fault handling activity that runs a try block and an optional catch block
// ABOUTME: Faults from the try block are handled here and exposed to the catch block as `error`

use tracing::info;

use super::{require_children, ActivityFactory, ActivityRegistry, Result};
use crate::definition::{ActivityBuilder, Body, Value, ValueType, VariableSlot};
use crate::engine::{
    ActivityState, CompletedChild, FaultContext, FaultDisposition, FaultResult, NativeActivity,
    NativeContext,
};
use crate::parser::document::ActivityNode;

pub const ERROR_VARIABLE: &str = "error";

pub struct TryCatch;

impl NativeActivity for TryCatch {
    fn execute(&self, ctx: &mut NativeContext<'_>) -> FaultResult<()> {
        let definition = ctx.definition()?;
        if let Some(block) = definition.children.first() {
            ctx.schedule_child(block, Some("try_done"), Some("try_faulted"))?;
        }
        Ok(())
    }

    fn on_child_faulted(
        &self,
        ctx: &mut NativeContext<'_>,
        _callback: &str,
        fault: &FaultContext,
    ) -> FaultResult<FaultDisposition> {
        info!(
            "Try block of {} faulted at {}: {}",
            ctx.id(),
            fault.source_qualified_id,
            fault.fault
        );
        ctx.set(ERROR_VARIABLE, Value::String(fault.fault.message.clone()))?;
        Ok(FaultDisposition::Handled)
    }

    fn on_child_completed(
        &self,
        ctx: &mut NativeContext<'_>,
        callback: &str,
        child: &CompletedChild,
    ) -> FaultResult<()> {
        if callback != "try_done"
            || child.state != ActivityState::Faulted
            || ctx.is_cancellation_requested()
        {
            return Ok(());
        }
        let definition = ctx.definition()?;
        if let Some(handler) = definition.children.get(1) {
            ctx.schedule_child(handler, None, None)?;
        }
        Ok(())
    }
}

pub struct TryCatchFactory;

impl ActivityFactory for TryCatchFactory {
    fn kind(&self) -> &'static str {
        "try_catch"
    }

    fn build(&self, node: &ActivityNode, registry: &ActivityRegistry) -> Result<ActivityBuilder> {
        self.validate_config(node)?;
        let mut builder = ActivityBuilder::new(self.kind(), Body::native(TryCatch))
            .variable(VariableSlot::new(ERROR_VARIABLE, ValueType::String))
            .children(registry.build_all(&node.children)?);
        if let Some(handler) = &node.catch {
            builder = builder.child(registry.build(handler)?);
        }
        Ok(builder)
    }

    fn validate_config(&self, node: &ActivityNode) -> Result<()> {
        require_children(node, 1, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::WorkflowDefinition;
    use crate::engine::{InstanceTree, WorkflowCompletion};
    use indexmap::IndexMap;

    fn run(yaml: &str) -> WorkflowCompletion {
        let node: ActivityNode = serde_yaml::from_str(yaml).unwrap();
        let root = ActivityRegistry::new().build(&node).unwrap();
        let workflow = WorkflowDefinition::new("try", "1", root).unwrap();
        let mut tree = InstanceTree::create_root(&workflow, IndexMap::new()).unwrap();
        tree.run_until_quiescent().unwrap().completion().unwrap().clone()
    }

    #[test]
    fn test_fault_is_handled_and_catch_sees_error() {
        let completion = run(
            r#"
type: try_catch
children:
  - type: sequence
    children:
      - { type: throw, with: { message: first } }
catch:
  type: throw
  with: { message: { op: add, left: "caught ", right: { ref: error } } }
"#,
        );
        assert_eq!(completion.state, ActivityState::Faulted);
        assert_eq!(completion.fault.unwrap().message, "caught first");
    }

    #[test]
    fn test_handled_fault_without_catch_closes() {
        let completion = run(
            r#"
type: try_catch
children:
  - { type: throw, with: { message: ignored } }
"#,
        );
        assert_eq!(completion.state, ActivityState::Closed);
    }

    #[test]
    fn test_catch_skipped_when_try_succeeds() {
        let completion = run(
            r#"
type: try_catch
children:
  - { type: log, with: { message: fine } }
catch:
  type: throw
  with: { message: unreachable }
"#,
        );
        assert!(completion.is_success());
    }

    #[test]
    fn test_requires_try_block() {
        let node: ActivityNode = serde_yaml::from_str("type: try_catch").unwrap();
        assert!(ActivityRegistry::new().build(&node).is_err());
    }
}
