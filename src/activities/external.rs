// ABOUTME: Activity that hands a request to the host as an async operation
// ABOUTME: The host completes the operation through the inbox and the answer becomes the Result

use serde::Deserialize;
use serde_json::json;

use super::{parse_config, ActivityFactory, ActivityRegistry, Result};
use crate::definition::{ActivityBuilder, ArgumentSlot, Body, Value, ValueType, RESULT_SLOT};
use crate::engine::{AsyncActivity, FaultResult, NativeContext};
use crate::parser::document::ActivityNode;

#[derive(Debug, Deserialize)]
struct ExternalConfig {
    operation: String,
}

pub struct ExternalCall {
    operation: String,
}

impl AsyncActivity for ExternalCall {
    fn begin(&self, ctx: &mut NativeContext<'_>) -> FaultResult<Value> {
        let request = ctx.get("request")?;
        Ok(json!({ "operation": self.operation, "request": request }))
    }

    fn end(&self, ctx: &mut NativeContext<'_>, result: Value) -> FaultResult<()> {
        ctx.set_result(result)
    }
}

pub struct ExternalCallFactory;

impl ActivityFactory for ExternalCallFactory {
    fn kind(&self) -> &'static str {
        "external_call"
    }

    fn build(&self, node: &ActivityNode, _registry: &ActivityRegistry) -> Result<ActivityBuilder> {
        let config: ExternalConfig = parse_config(node)?;
        Ok(ActivityBuilder::new(
            self.kind(),
            Body::asynchronous(ExternalCall {
                operation: config.operation,
            }),
        )
        .argument(ArgumentSlot::input("request", ValueType::Any))
        .argument(ArgumentSlot::output(RESULT_SLOT, ValueType::Any)))
    }

    fn validate_config(&self, node: &ActivityNode) -> Result<()> {
        parse_config::<ExternalConfig>(node).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::WorkflowDefinition;
    use crate::engine::{ActivityState, Fault, InstanceTree};
    use indexmap::IndexMap;

    fn start() -> InstanceTree {
        let node: ActivityNode = serde_yaml::from_str(
            "type: external_call\nconfig: { operation: lookup }\nwith: { request: 42 }",
        )
        .unwrap();
        let root = ActivityRegistry::new().build(&node).unwrap();
        let workflow = WorkflowDefinition::new("external", "1", root).unwrap();
        InstanceTree::create_root(&workflow, IndexMap::new()).unwrap()
    }

    #[test]
    fn test_operation_result_becomes_output() {
        let mut tree = start();
        assert!(tree.run_until_quiescent().unwrap().is_idle());
        assert!(!tree.is_quiescent());

        let mut operations = tree.take_started_operations();
        assert_eq!(operations.len(), 1);
        let operation = operations.remove(0);
        assert_eq!(
            operation.request,
            json!({ "operation": "lookup", "request": 42 })
        );
        operation.complete(json!("answer")).unwrap();

        let outcome = tree.run_until_quiescent().unwrap();
        assert_eq!(
            outcome.completion().unwrap().output(RESULT_SLOT),
            Some(&json!("answer"))
        );
    }

    #[test]
    fn test_failed_operation_faults() {
        let mut tree = start();
        tree.run_until_quiescent().unwrap();
        let operation = tree.take_started_operations().remove(0);
        operation.fail(Fault::new("service down")).unwrap();

        let outcome = tree.run_until_quiescent().unwrap();
        let completion = outcome.completion().unwrap();
        assert_eq!(completion.state, ActivityState::Faulted);
        assert_eq!(completion.fault.as_ref().unwrap().message, "service down");
    }

    #[test]
    fn test_operation_name_required() {
        let node: ActivityNode = serde_yaml::from_str("type: external_call").unwrap();
        assert!(ActivityRegistry::new().build(&node).is_err());
    }
}
