// ABOUTME: Leaf activities backed by code bodies: assign, log, throw and evaluate
// ABOUTME: They read their resolved arguments and finish within a single work item

use tracing::info;

use super::{ActivityFactory, ActivityRegistry, Result};
use crate::definition::{ActivityBuilder, ArgumentSlot, Body, Value, ValueType, RESULT_SLOT};
use crate::engine::Fault;
use crate::parser::document::ActivityNode;

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Copies `value` into the location bound to `to`.
pub struct AssignFactory;

impl ActivityFactory for AssignFactory {
    fn kind(&self) -> &'static str {
        "assign"
    }

    fn build(&self, _node: &ActivityNode, _registry: &ActivityRegistry) -> Result<ActivityBuilder> {
        Ok(ActivityBuilder::new(
            self.kind(),
            Body::code(|ctx| {
                let value = ctx.get("value")?;
                ctx.set("to", value)
            }),
        )
        .argument(ArgumentSlot::output("to", ValueType::Any).required())
        .argument(ArgumentSlot::input("value", ValueType::Any).required()))
    }
}

pub struct LogFactory;

impl ActivityFactory for LogFactory {
    fn kind(&self) -> &'static str {
        "log"
    }

    fn build(&self, _node: &ActivityNode, _registry: &ActivityRegistry) -> Result<ActivityBuilder> {
        Ok(ActivityBuilder::new(
            self.kind(),
            Body::code(|ctx| {
                let message = ctx.get("message")?;
                info!(activity = %ctx.display_name(), "{}", render(&message));
                Ok(())
            }),
        )
        .argument(ArgumentSlot::input("message", ValueType::Any)))
    }
}

/// Raises a fault carrying `message` and optional `data`.
pub struct ThrowFactory;

impl ActivityFactory for ThrowFactory {
    fn kind(&self) -> &'static str {
        "throw"
    }

    fn build(&self, _node: &ActivityNode, _registry: &ActivityRegistry) -> Result<ActivityBuilder> {
        Ok(ActivityBuilder::new(
            self.kind(),
            Body::code(|ctx| {
                let message = render(&ctx.get("message")?);
                let fault = match ctx.get("data")? {
                    Value::Null => Fault::new(message),
                    data => Fault::new(message).with_data(data),
                };
                Err(fault)
            }),
        )
        .argument(ArgumentSlot::input("message", ValueType::Any).required())
        .argument(ArgumentSlot::input("data", ValueType::Any)))
    }
}

/// Expression activity: its Result is its `value` argument.
pub struct EvaluateFactory;

impl ActivityFactory for EvaluateFactory {
    fn kind(&self) -> &'static str {
        "evaluate"
    }

    fn build(&self, _node: &ActivityNode, _registry: &ActivityRegistry) -> Result<ActivityBuilder> {
        Ok(ActivityBuilder::new(
            self.kind(),
            Body::code(|ctx| {
                let value = ctx.get("value")?;
                ctx.set_result(value)
            }),
        )
        .argument(ArgumentSlot::input("value", ValueType::Any))
        .argument(ArgumentSlot::output(RESULT_SLOT, ValueType::Any)))
    }
}
