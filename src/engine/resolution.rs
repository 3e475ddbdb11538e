// ABOUTME: Argument and variable resolution run before an instance's body
// ABOUTME: Orders slots deterministically and suspends on expression activities until they complete

use indexmap::IndexMap;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::error::{ExecutionError, Fault, FaultResult, Result};
use super::executor::{BindingScope, ChildSpec, Executor};
use super::instance::{CompletionCallback, Continuation, InstanceId};
use super::location::{Location, LocationRef, ReferenceLocation};
use crate::definition::{
    ActivityDefinition, ArgumentDirection, DefinitionRef, Expression, Value, VariableScope,
    RESULT_SLOT,
};

/// Stable 32-bit ordering key for an argument name: the first four bytes of
/// its SHA-256 digest, big endian. Changing this reorders evaluation.
pub fn ordering_key(name: &str) -> u32 {
    let digest = Sha256::digest(name.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Indices into `definition.arguments` in evaluation order.
pub fn argument_order(definition: &ActivityDefinition) -> Vec<usize> {
    let arguments = &definition.arguments;
    if arguments.len() == 1 && arguments[0].name == RESULT_SLOT && definition.variables.is_empty() {
        return vec![0];
    }

    let mut explicit: Vec<(i32, usize)> = arguments
        .iter()
        .enumerate()
        .filter_map(|(i, a)| a.evaluation_order.map(|order| (order, i)))
        .collect();
    explicit.sort();

    let mut hashed: Vec<(u32, &str, usize)> = arguments
        .iter()
        .enumerate()
        .filter(|(_, a)| a.evaluation_order.is_none())
        .map(|(i, a)| (ordering_key(&a.name), a.name.as_str(), i))
        .collect();
    hashed.sort();

    explicit
        .into_iter()
        .map(|(_, i)| i)
        .chain(hashed.into_iter().map(|(_, _, i)| i))
        .collect()
}

/// Indices into `definition.variables`: implementation-scoped first, then
/// public, each in declaration order.
pub fn variable_order(definition: &ActivityDefinition) -> Vec<usize> {
    let variables = &definition.variables;
    let implementation = (0..variables.len())
        .filter(|&i| variables[i].scope == VariableScope::Implementation);
    let public = (0..variables.len()).filter(|&i| variables[i].scope == VariableScope::Public);
    implementation.chain(public).collect()
}

impl Executor {
    fn own_environment(&self, id: InstanceId) -> Result<InstanceId> {
        let instance = self
            .instance_ref(id)
            .ok_or(ExecutionError::InstanceNotFound(id))?;
        match instance.environment {
            Some(env) if instance.owns_environment => Ok(env),
            _ => Err(ExecutionError::NoEnvironment(id)),
        }
    }

    fn is_declared(&self, env: InstanceId, slot: &str) -> bool {
        self.environments
            .get(env)
            .map(|e| e.slots.contains_key(slot))
            .unwrap_or(false)
    }

    /// Declare host-supplied root inputs ahead of normal resolution.
    pub(crate) fn apply_overrides(
        &mut self,
        id: InstanceId,
        overrides: IndexMap<String, Value>,
    ) -> Result<()> {
        if overrides.is_empty() {
            return Ok(());
        }
        let definition = self.definition_of(id)?;
        let env = self.own_environment(id)?;
        for (name, value) in overrides {
            let slot = definition
                .argument(&name)
                .ok_or_else(|| ExecutionError::SlotNotFound { slot: name.clone() })?;
            if !slot.value_type.accepts(&value) {
                return Err(ExecutionError::TypeMismatch {
                    slot: name,
                    expected: slot.value_type,
                    actual: value.to_string(),
                });
            }
            self.environments
                .declare(env, &name, Location::with_value(slot.value_type, value))?;
        }
        Ok(())
    }

    /// Resolve arguments starting at `from` in evaluation order. Returns false
    /// when an expression activity was scheduled and resolution is suspended.
    pub(crate) fn resolve_arguments(&mut self, id: InstanceId, from: usize) -> FaultResult<bool> {
        let definition = self.definition_of(id)?;
        if definition.arguments.is_empty() {
            return Ok(true);
        }
        let env = self.own_environment(id)?;
        let binding_env = self
            .instance_ref(id)
            .ok_or(ExecutionError::InstanceNotFound(id))?
            .binding_environment;
        let order = argument_order(&definition);

        for (position, &index) in order.iter().enumerate().skip(from) {
            let slot = &definition.arguments[index];
            if self.is_declared(env, &slot.name) {
                continue;
            }

            match (&slot.binding, slot.direction) {
                (Some(Expression::Activity(expression)), ArgumentDirection::In) => {
                    self.environments
                        .declare(env, &slot.name, Location::default_for(slot.value_type))?;
                    self.schedule_expression(
                        id,
                        expression,
                        LocationRef {
                            environment: env,
                            slot: slot.name.clone(),
                        },
                        Continuation::NextArgument(position + 1),
                        BindingScope::ParentBindings,
                    )?;
                    return Ok(false);
                }
                (Some(binding), ArgumentDirection::In) => {
                    let value = binding.evaluate(&self.environments.lookup(binding_env))?;
                    if !slot.value_type.accepts(&value) {
                        return Err(ExecutionError::TypeMismatch {
                            slot: slot.name.clone(),
                            expected: slot.value_type,
                            actual: value.to_string(),
                        }
                        .into());
                    }
                    self.environments.declare(
                        env,
                        &slot.name,
                        Location::with_value(slot.value_type, value),
                    )?;
                }
                (Some(Expression::Reference(name)), direction) => {
                    let target = self.environments.resolve(binding_env, name).ok_or_else(|| {
                        ExecutionError::SlotNotFound { slot: name.clone() }
                    })?;
                    let buffered = match direction {
                        ArgumentDirection::InOut => self.environments.read_at(&target)?,
                        _ => slot.value_type.default_value(),
                    };
                    self.environments.declare(
                        env,
                        &slot.name,
                        Location::Reference(ReferenceLocation {
                            value_type: slot.value_type,
                            target,
                            buffered: Some(buffered),
                        }),
                    )?;
                }
                (None, direction) if slot.required && direction != ArgumentDirection::Out => {
                    return Err(Fault::new(format!(
                        "Required argument '{}' of {} ({}) has no value",
                        slot.name, definition.display_name, definition.qualified_id
                    )));
                }
                _ => {
                    self.environments
                        .declare(env, &slot.name, Location::default_for(slot.value_type))?;
                }
            }
        }
        Ok(true)
    }

    /// Resolve variable defaults starting at `from`. The first call declares
    /// every variable so later defaults can read earlier ones.
    pub(crate) fn resolve_variables(&mut self, id: InstanceId, from: usize) -> FaultResult<bool> {
        let definition = self.definition_of(id)?;
        if definition.variables.is_empty() {
            return Ok(true);
        }
        let env = self.own_environment(id)?;
        let order = variable_order(&definition);

        if from == 0 {
            for &index in &order {
                let variable = &definition.variables[index];
                self.environments.declare(
                    env,
                    &variable.name,
                    Location::default_for(variable.value_type),
                )?;
            }
        }

        for (position, &index) in order.iter().enumerate().skip(from) {
            let variable = &definition.variables[index];
            let target = LocationRef {
                environment: env,
                slot: variable.name.clone(),
            };
            match &variable.default {
                None => {}
                Some(Expression::Activity(expression)) if expression.has_result() => {
                    self.schedule_expression(
                        id,
                        expression,
                        target,
                        Continuation::NextVariable(position + 1),
                        BindingScope::ParentEnvironment,
                    )?;
                    return Ok(false);
                }
                Some(Expression::Activity(expression)) => {
                    debug!(
                        "Default of '{}' on {} has no result; initialization is incomplete",
                        variable.name, id
                    );
                    self.schedule_instance(expression.clone(), Some(id), ChildSpec::plain(), None)?;
                    self.instance_mut(id)?.initialization_incomplete = true;
                }
                Some(expression) => {
                    let value = expression.evaluate(&self.environments.lookup(Some(env)))?;
                    self.environments.write_at(&target, value)?;
                }
            }
        }
        Ok(true)
    }

    fn schedule_expression(
        &mut self,
        owner: InstanceId,
        expression: &DefinitionRef,
        target: LocationRef,
        continuation: Continuation,
        binding: BindingScope,
    ) -> Result<InstanceId> {
        debug!(
            "Instance {} evaluating '{}' via expression activity {}",
            owner, target.slot, expression.qualified_id
        );
        let spec = ChildSpec {
            completion: Some(CompletionCallback {
                owner,
                continuation,
            }),
            fault: None,
            result_target: Some(target),
            binding,
        };
        self.schedule_instance(expression.clone(), Some(owner), spec, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{
        ActivityBuilder, ArgumentSlot, Body, ValueType, VariableSlot, WorkflowDefinition,
    };

    fn frozen(builder: ActivityBuilder) -> DefinitionRef {
        WorkflowDefinition::new("order", "1", builder).unwrap().root
    }

    #[test]
    fn test_ordering_key_is_pinned() {
        // SHA-256("a") begins ca978112
        assert_eq!(ordering_key("a"), 0xca97_8112);
    }

    #[test]
    fn test_explicit_order_precedes_hashed() {
        let def = frozen(
            ActivityBuilder::new("code", Body::Composite)
                .argument(ArgumentSlot::input("x", ValueType::Any))
                .argument(ArgumentSlot::input("late", ValueType::Any).with_order(2))
                .argument(ArgumentSlot::input("early", ValueType::Any).with_order(1))
                .argument(ArgumentSlot::input("y", ValueType::Any)),
        );
        let order = argument_order(&def);
        assert_eq!(&order[..2], &[2, 1]);

        let mut rest = vec![(ordering_key("x"), 0usize), (ordering_key("y"), 3usize)];
        rest.sort();
        assert_eq!(order[2], rest[0].1);
        assert_eq!(order[3], rest[1].1);
    }

    #[test]
    fn test_order_is_independent_of_declaration_order() {
        let names = ["alpha", "beta", "gamma", "delta"];
        let forward = frozen(names.iter().fold(
            ActivityBuilder::new("code", Body::Composite),
            |b, n| b.argument(ArgumentSlot::input(n, ValueType::Any)),
        ));
        let backward = frozen(names.iter().rev().fold(
            ActivityBuilder::new("code", Body::Composite),
            |b, n| b.argument(ArgumentSlot::input(n, ValueType::Any)),
        ));
        let by_name = |def: &DefinitionRef| -> Vec<String> {
            argument_order(def)
                .into_iter()
                .map(|i| def.arguments[i].name.clone())
                .collect()
        };
        assert_eq!(by_name(&forward), by_name(&backward));
    }

    #[test]
    fn test_single_result_fast_path() {
        let def = frozen(
            ActivityBuilder::new("evaluate", Body::Composite)
                .argument(ArgumentSlot::output(RESULT_SLOT, ValueType::Any)),
        );
        assert_eq!(argument_order(&def), vec![0]);
    }

    #[test]
    fn test_implementation_variables_first() {
        let def = frozen(
            ActivityBuilder::new("code", Body::Composite)
                .variable(VariableSlot::new("public", ValueType::Any))
                .variable(VariableSlot::new("hidden", ValueType::Any).implementation()),
        );
        assert_eq!(variable_order(&def), vec![1, 0]);
    }
}
