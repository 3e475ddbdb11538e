// ABOUTME: Built-in activity kinds and the registry that builds them from document nodes
// ABOUTME: Each factory turns one authored node into an unfrozen activity builder

pub mod bookmarks;
pub mod control;
pub mod error;
pub mod external;
pub mod for_each;
pub mod primitives;
pub mod try_catch;

use serde::de::DeserializeOwned;
use std::collections::HashMap;

use crate::definition::{ActivityBuilder, Expression, VariableSlot};
use crate::parser::document::{yaml_to_value, ActivityNode, ExpressionDoc, VariableDoc};

pub use error::{ActivityError, Result};

pub trait ActivityFactory: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Build the kind-specific part of `node`: slots, body and nested nodes.
    /// Name, variables and `with` bindings are applied by the registry.
    fn build(&self, node: &ActivityNode, registry: &ActivityRegistry) -> Result<ActivityBuilder>;

    /// Check kind-specific configuration without building.
    fn validate_config(&self, _node: &ActivityNode) -> Result<()> {
        Ok(())
    }
}

pub struct ActivityRegistry {
    factories: HashMap<String, Box<dyn ActivityFactory>>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };

        registry.register(Box::new(control::SequenceFactory));
        registry.register(Box::new(control::ParallelFactory));
        registry.register(Box::new(control::IsolatedFactory));
        registry.register(Box::new(bookmarks::WaitForBookmarkFactory));
        registry.register(Box::new(bookmarks::ExclusiveWaitFactory));
        registry.register(Box::new(primitives::AssignFactory));
        registry.register(Box::new(primitives::LogFactory));
        registry.register(Box::new(primitives::ThrowFactory));
        registry.register(Box::new(primitives::EvaluateFactory));
        registry.register(Box::new(try_catch::TryCatchFactory));
        registry.register(Box::new(for_each::ForEachFactory));
        registry.register(Box::new(external::ExternalCallFactory));

        registry
    }

    pub fn register(&mut self, factory: Box<dyn ActivityFactory>) {
        self.factories.insert(factory.kind().to_string(), factory);
    }

    pub fn get(&self, kind: &str) -> Option<&dyn ActivityFactory> {
        self.factories.get(kind).map(|f| f.as_ref())
    }

    pub fn supported_kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(|k| k.as_str()).collect();
        kinds.sort_unstable();
        kinds
    }

    fn factory(&self, kind: &str) -> Result<&dyn ActivityFactory> {
        self.get(kind).ok_or_else(|| ActivityError::UnsupportedKind {
            kind: kind.to_string(),
            supported: self
                .supported_kinds()
                .into_iter()
                .map(String::from)
                .collect(),
        })
    }

    pub fn validate_config(&self, node: &ActivityNode) -> Result<()> {
        self.factory(&node.kind)?.validate_config(node)
    }

    /// Build `node` and everything nested under it.
    pub fn build(&self, node: &ActivityNode) -> Result<ActivityBuilder> {
        let mut builder = self.factory(&node.kind)?.build(node, self)?;

        if let Some(name) = &node.name {
            builder = builder.named(name);
        }
        for (name, variable) in &node.variables {
            builder = builder.variable(self.variable(node, name, variable)?);
        }
        for (slot, expression) in &node.with {
            if !builder.has_argument(slot) {
                return Err(ActivityError::UnknownArgument {
                    activity: node.label(),
                    slot: slot.clone(),
                });
            }
            builder = builder.bind(slot, self.expression(node, expression)?);
        }
        Ok(builder)
    }

    pub fn build_all(&self, nodes: &[ActivityNode]) -> Result<Vec<ActivityBuilder>> {
        nodes.iter().map(|n| self.build(n)).collect()
    }

    pub fn variable(
        &self,
        node: &ActivityNode,
        name: &str,
        doc: &VariableDoc,
    ) -> Result<VariableSlot<ActivityBuilder>> {
        let mut slot = VariableSlot::new(name, doc.value_type);
        if let Some(default) = &doc.default {
            slot = slot.with_default(self.expression(node, default)?);
        }
        if doc.implementation {
            slot = slot.implementation();
        }
        Ok(slot)
    }

    pub fn expression(
        &self,
        node: &ActivityNode,
        doc: &ExpressionDoc,
    ) -> Result<Expression<ActivityBuilder>> {
        let literal = |value: &serde_yaml::Value| {
            yaml_to_value(value).map_err(|e| ActivityError::InvalidExpression {
                activity: node.label(),
                reason: e.to_string(),
            })
        };
        Ok(match doc {
            ExpressionDoc::Literal { literal: value } | ExpressionDoc::Value(value) => {
                Expression::Literal(literal(value)?)
            }
            ExpressionDoc::Reference { reference } => Expression::reference(reference.as_str()),
            ExpressionDoc::Binary { op, left, right } => Expression::binary(
                *op,
                self.expression(node, left)?,
                self.expression(node, right)?,
            ),
            ExpressionDoc::Activity { activity } => Expression::activity(self.build(activity)?),
        })
    }
}

impl Default for ActivityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Deserialize a node's `config` block. A missing block reads as empty.
pub fn parse_config<T: DeserializeOwned>(node: &ActivityNode) -> Result<T> {
    let config = if node.config.is_null() {
        serde_yaml::Value::Mapping(serde_yaml::Mapping::new())
    } else {
        node.config.clone()
    };
    serde_yaml::from_value(config).map_err(|e| ActivityError::InvalidConfig {
        activity: node.label(),
        reason: e.to_string(),
    })
}

pub(crate) fn require_children(node: &ActivityNode, min: usize, max: usize) -> Result<()> {
    let count = node.children.len();
    if count < min || count > max {
        let expected = if min == max {
            format!("exactly {}", min)
        } else if max == usize::MAX {
            format!("at least {}", min)
        } else {
            format!("between {} and {}", min, max)
        };
        return Err(ActivityError::InvalidConfig {
            activity: node.label(),
            reason: format!("expected {} child activities, found {}", expected, count),
        });
    }
    Ok(())
}
