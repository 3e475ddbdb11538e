// ABOUTME: Iterates a list by invoking the `body` delegate once per element, one at a time
// ABOUTME: The current element is passed to the handler as the `item` parameter

use indexmap::IndexMap;
use tracing::debug;

use super::{ActivityError, ActivityFactory, ActivityRegistry, Result};
use crate::definition::{
    ActivityBuilder, ArgumentSlot, Body, ParameterSlot, Value, ValueType, VariableSlot,
};
use crate::engine::{ActivityState, CompletedChild, FaultResult, NativeActivity, NativeContext};
use crate::parser::document::ActivityNode;

const INDEX: &str = "index";

pub struct ForEach;

impl ForEach {
    /// Schedule the handler for element `index`. Returns false past the end.
    fn schedule(&self, ctx: &mut NativeContext<'_>, index: usize) -> FaultResult<bool> {
        let values = ctx.get("values")?;
        let Some(item) = values.as_array().and_then(|v| v.get(index)).cloned() else {
            return Ok(false);
        };
        ctx.set(INDEX, Value::from(index as u64))?;
        let mut inputs = IndexMap::new();
        inputs.insert("item".to_string(), item);
        let scheduled = ctx.schedule_delegate("body", inputs, Some("next"), None)?;
        Ok(scheduled.is_some())
    }
}

impl NativeActivity for ForEach {
    fn execute(&self, ctx: &mut NativeContext<'_>) -> FaultResult<()> {
        self.schedule(ctx, 0)?;
        Ok(())
    }

    fn on_child_completed(
        &self,
        ctx: &mut NativeContext<'_>,
        _callback: &str,
        child: &CompletedChild,
    ) -> FaultResult<()> {
        if child.state != ActivityState::Closed || ctx.is_cancellation_requested() {
            return Ok(());
        }
        let next = ctx.get(INDEX)?.as_u64().unwrap_or(0) as usize + 1;
        if !self.schedule(ctx, next)? {
            debug!("For-each {} finished after {} element(s)", ctx.id(), next);
        }
        Ok(())
    }
}

pub struct ForEachFactory;

impl ActivityFactory for ForEachFactory {
    fn kind(&self) -> &'static str {
        "for_each"
    }

    fn build(&self, node: &ActivityNode, registry: &ActivityRegistry) -> Result<ActivityBuilder> {
        self.validate_config(node)?;
        let handler = node
            .body
            .as_deref()
            .map(|body| registry.build(body))
            .transpose()?;
        Ok(ActivityBuilder::new(self.kind(), Body::native(ForEach))
            .argument(ArgumentSlot::input("values", ValueType::List).required())
            .variable(VariableSlot::new(INDEX, ValueType::Integer).implementation())
            .delegate(
                "body",
                vec![ParameterSlot::new("item", ValueType::Any)],
                handler,
            ))
    }

    fn validate_config(&self, node: &ActivityNode) -> Result<()> {
        if !node.children.is_empty() {
            return Err(ActivityError::InvalidConfig {
                activity: node.label(),
                reason: "for_each takes its handler from `body`, not `children`".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{WorkflowDefinition, RESULT_SLOT};
    use crate::engine::{BookmarkScope, InstanceTree};
    use serde_json::json;

    fn start(yaml: &str) -> InstanceTree {
        let node: ActivityNode = serde_yaml::from_str(yaml).unwrap();
        let root = ActivityRegistry::new().build(&node).unwrap();
        let workflow = WorkflowDefinition::new("loop", "1", root).unwrap();
        InstanceTree::create_root(&workflow, IndexMap::new()).unwrap()
    }

    #[test]
    fn test_body_runs_once_per_element_in_order() {
        let mut tree = start(
            r#"
type: for_each
with: { values: [a, b] }
body:
  type: wait_for_bookmark
  config: { bookmark: step }
"#,
        );
        assert!(tree.run_until_quiescent().unwrap().is_idle());
        tree.resume_bookmark("step", BookmarkScope::Default, json!(1));
        assert!(tree.run_until_quiescent().unwrap().is_idle());
        tree.resume_bookmark("step", BookmarkScope::Default, json!(2));
        let outcome = tree.run_until_quiescent().unwrap();
        assert!(outcome.completion().unwrap().is_success());

        let handlers = tree
            .terminations()
            .iter()
            .filter(|t| t.kind == "wait_for_bookmark")
            .count();
        assert_eq!(handlers, 2);
    }

    #[test]
    fn test_handler_reads_item_parameter() {
        let mut tree = start(
            r#"
type: for_each
with: { values: [only] }
body:
  type: throw
  with: { message: { ref: item } }
"#,
        );
        let outcome = tree.run_until_quiescent().unwrap();
        assert_eq!(outcome.completion().unwrap().fault.as_ref().unwrap().message, "only");
    }

    #[test]
    fn test_empty_list_closes_immediately() {
        let mut tree = start("type: for_each\nwith: { values: [] }\nbody: { type: log }");
        let outcome = tree.run_until_quiescent().unwrap();
        assert!(outcome.completion().unwrap().is_success());
        assert!(outcome.completion().unwrap().output(RESULT_SLOT).is_none());
    }

    #[test]
    fn test_children_rejected() {
        let node: ActivityNode =
            serde_yaml::from_str("type: for_each\nchildren: [ { type: log } ]").unwrap();
        assert!(ActivityRegistry::new().build(&node).is_err());
    }
}
