// ABOUTME: Frozen activity definitions and the builder that produces them
// ABOUTME: Assigns qualified ids and compile units while freezing an authored activity tree

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::error::{DefinitionError, Result};
use super::expression::Expression;
use super::Value;
use crate::engine::context::{AsyncActivity, CodeContext, NativeActivity};
use crate::engine::error::Fault;

pub type DefinitionRef = Arc<ActivityDefinition>;

/// Name of the slot an expression activity writes its value to.
pub const RESULT_SLOT: &str = "Result";

/// Stable identity of a definition node inside its workflow, e.g. `1.2.3`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QualifiedId(String);

impl QualifiedId {
    pub fn root() -> Self {
        QualifiedId("1".to_string())
    }

    pub fn child(&self, position: usize) -> Self {
        QualifiedId(format!("{}.{}", self.0, position))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for QualifiedId {
    fn from(value: &str) -> Self {
        QualifiedId(value.to_string())
    }
}

impl fmt::Display for QualifiedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    #[default]
    Any,
    Bool,
    Integer,
    Float,
    String,
    List,
    Map,
}

impl ValueType {
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ValueType::Any => true,
            ValueType::Bool => value.is_boolean(),
            ValueType::Integer => value.is_i64() || value.is_u64(),
            ValueType::Float => value.is_number(),
            ValueType::String => value.is_string(),
            ValueType::List => value.is_array(),
            ValueType::Map => value.is_object(),
        }
    }

    pub fn default_value(&self) -> Value {
        match self {
            ValueType::Any => Value::Null,
            ValueType::Bool => Value::Bool(false),
            ValueType::Integer => Value::from(0),
            ValueType::Float => Value::from(0.0),
            ValueType::String => Value::String(String::new()),
            ValueType::List => Value::Array(Vec::new()),
            ValueType::Map => Value::Object(serde_json::Map::new()),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Any => "any",
            ValueType::Bool => "bool",
            ValueType::Integer => "integer",
            ValueType::Float => "float",
            ValueType::String => "string",
            ValueType::List => "list",
            ValueType::Map => "map",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ArgumentDirection {
    #[default]
    In,
    Out,
    InOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VariableScope {
    #[default]
    Public,
    Implementation,
}

#[derive(Debug, Clone)]
pub struct ArgumentSlot<A = DefinitionRef> {
    pub name: String,
    pub value_type: ValueType,
    pub direction: ArgumentDirection,
    pub required: bool,
    pub evaluation_order: Option<i32>,
    pub binding: Option<Expression<A>>,
}

impl<A> ArgumentSlot<A> {
    pub fn new(name: &str, value_type: ValueType, direction: ArgumentDirection) -> Self {
        Self {
            name: name.to_string(),
            value_type,
            direction,
            required: false,
            evaluation_order: None,
            binding: None,
        }
    }

    pub fn input(name: &str, value_type: ValueType) -> Self {
        Self::new(name, value_type, ArgumentDirection::In)
    }

    pub fn output(name: &str, value_type: ValueType) -> Self {
        Self::new(name, value_type, ArgumentDirection::Out)
    }

    pub fn in_out(name: &str, value_type: ValueType) -> Self {
        Self::new(name, value_type, ArgumentDirection::InOut)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.evaluation_order = Some(order);
        self
    }

    pub fn with_binding(mut self, binding: Expression<A>) -> Self {
        self.binding = Some(binding);
        self
    }
}

#[derive(Debug, Clone)]
pub struct VariableSlot<A = DefinitionRef> {
    pub name: String,
    pub value_type: ValueType,
    pub default: Option<Expression<A>>,
    pub scope: VariableScope,
}

impl<A> VariableSlot<A> {
    pub fn new(name: &str, value_type: ValueType) -> Self {
        Self {
            name: name.to_string(),
            value_type,
            default: None,
            scope: VariableScope::Public,
        }
    }

    pub fn with_default(mut self, default: Expression<A>) -> Self {
        self.default = Some(default);
        self
    }

    pub fn implementation(mut self) -> Self {
        self.scope = VariableScope::Implementation;
        self
    }
}

/// A named, typed delegate parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSlot {
    pub name: String,
    #[serde(default)]
    pub value_type: ValueType,
}

impl ParameterSlot {
    pub fn new(name: &str, value_type: ValueType) -> Self {
        Self {
            name: name.to_string(),
            value_type,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DelegateSlot<A = DefinitionRef> {
    pub name: String,
    pub parameters: Vec<ParameterSlot>,
    pub handler: Option<A>,
}

pub type CodeFn = Arc<dyn Fn(&mut CodeContext<'_>) -> std::result::Result<(), Fault> + Send + Sync>;

/// What runs once an instance has resolved its slots.
#[derive(Clone)]
pub enum Body {
    Code(CodeFn),
    Async(Arc<dyn AsyncActivity>),
    Native(Arc<dyn NativeActivity>),
    /// Runs public children one after another in definition order.
    Composite,
}

impl Body {
    pub fn code<F>(f: F) -> Self
    where
        F: Fn(&mut CodeContext<'_>) -> std::result::Result<(), Fault> + Send + Sync + 'static,
    {
        Body::Code(Arc::new(f))
    }

    pub fn native(activity: impl NativeActivity + 'static) -> Self {
        Body::Native(Arc::new(activity))
    }

    pub fn asynchronous(activity: impl AsyncActivity + 'static) -> Self {
        Body::Async(Arc::new(activity))
    }

    pub fn variant(&self) -> &'static str {
        match self {
            Body::Code(_) => "code",
            Body::Async(_) => "async",
            Body::Native(_) => "native",
            Body::Composite => "composite",
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Body::{}", self.variant())
    }
}

/// A frozen node of the activity tree. Never mutated once built.
#[derive(Debug)]
pub struct ActivityDefinition {
    pub kind: String,
    pub display_name: String,
    pub qualified_id: QualifiedId,
    pub compile_unit: u32,
    pub is_implementation: bool,
    pub arguments: Vec<ArgumentSlot>,
    pub variables: Vec<VariableSlot>,
    pub delegates: Vec<DelegateSlot>,
    pub children: Vec<DefinitionRef>,
    pub implementation_children: Vec<DefinitionRef>,
    pub body: Body,
}

impl ActivityDefinition {
    pub fn argument(&self, name: &str) -> Option<&ArgumentSlot> {
        self.arguments.iter().find(|a| a.name == name)
    }

    pub fn delegate(&self, name: &str) -> Option<&DelegateSlot> {
        self.delegates.iter().find(|d| d.name == name)
    }

    pub fn has_result(&self) -> bool {
        self.argument(RESULT_SLOT)
            .map(|a| a.direction != ArgumentDirection::In)
            .unwrap_or(false)
    }

    pub fn declares_symbols(&self) -> bool {
        !self.arguments.is_empty() || !self.variables.is_empty()
    }

    /// Position of a direct public child, by qualified id.
    pub fn child_position(&self, qualified_id: &QualifiedId) -> Option<usize> {
        self.children
            .iter()
            .position(|c| &c.qualified_id == qualified_id)
    }

    /// Every definition node reachable from this one, including expression
    /// activities and delegate handlers.
    pub fn descendants(self: &Arc<Self>) -> Vec<DefinitionRef> {
        let mut out = vec![self.clone()];
        let mut i = 0;
        while i < out.len() {
            let node = out[i].clone();
            out.extend(node.children.iter().cloned());
            out.extend(node.implementation_children.iter().cloned());
            for arg in &node.arguments {
                if let Some(Expression::Activity(def)) = &arg.binding {
                    out.push(def.clone());
                }
            }
            for var in &node.variables {
                if let Some(Expression::Activity(def)) = &var.default {
                    out.push(def.clone());
                }
            }
            for delegate in &node.delegates {
                if let Some(handler) = &delegate.handler {
                    out.push(handler.clone());
                }
            }
            i += 1;
        }
        out
    }
}

/// Unfrozen activity node.
#[derive(Debug, Clone)]
pub struct ActivityBuilder {
    kind: String,
    display_name: Option<String>,
    arguments: Vec<ArgumentSlot<ActivityBuilder>>,
    variables: Vec<VariableSlot<ActivityBuilder>>,
    delegates: Vec<DelegateSlot<ActivityBuilder>>,
    children: Vec<ActivityBuilder>,
    implementation_children: Vec<ActivityBuilder>,
    bindings: Vec<(String, Expression<ActivityBuilder>)>,
    body: Body,
}

impl ActivityBuilder {
    pub fn new(kind: &str, body: Body) -> Self {
        Self {
            kind: kind.to_string(),
            display_name: None,
            arguments: Vec::new(),
            variables: Vec::new(),
            delegates: Vec::new(),
            children: Vec::new(),
            implementation_children: Vec::new(),
            bindings: Vec::new(),
            body,
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn named(mut self, display_name: &str) -> Self {
        self.display_name = Some(display_name.to_string());
        self
    }

    pub fn argument(mut self, slot: ArgumentSlot<ActivityBuilder>) -> Self {
        self.arguments.push(slot);
        self
    }

    pub fn variable(mut self, slot: VariableSlot<ActivityBuilder>) -> Self {
        self.variables.push(slot);
        self
    }

    /// Bind an expression to an already declared argument.
    pub fn bind(mut self, slot: &str, expression: Expression<ActivityBuilder>) -> Self {
        self.bindings.push((slot.to_string(), expression));
        self
    }

    pub fn child(mut self, child: ActivityBuilder) -> Self {
        self.children.push(child);
        self
    }

    pub fn children(mut self, children: impl IntoIterator<Item = ActivityBuilder>) -> Self {
        self.children.extend(children);
        self
    }

    pub fn implementation_child(mut self, child: ActivityBuilder) -> Self {
        self.implementation_children.push(child);
        self
    }

    pub fn delegate(
        mut self,
        name: &str,
        parameters: Vec<ParameterSlot>,
        handler: Option<ActivityBuilder>,
    ) -> Self {
        self.delegates.push(DelegateSlot {
            name: name.to_string(),
            parameters,
            handler,
        });
        self
    }

    pub fn set_delegate_handler(&mut self, name: &str, handler: ActivityBuilder) -> bool {
        match self.delegates.iter_mut().find(|d| d.name == name) {
            Some(delegate) => {
                delegate.handler = Some(handler);
                true
            }
            None => false,
        }
    }

    pub fn has_argument(&self, name: &str) -> bool {
        self.arguments.iter().any(|a| a.name == name)
    }

    pub fn argument_direction(&self, name: &str) -> Option<ArgumentDirection> {
        self.arguments
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.direction)
    }
}

struct Freezer {
    next_unit: u32,
    index: HashMap<QualifiedId, DefinitionRef>,
}

impl Freezer {
    fn freeze(
        &mut self,
        builder: ActivityBuilder,
        qualified_id: QualifiedId,
        compile_unit: u32,
        is_implementation: bool,
    ) -> Result<DefinitionRef> {
        let ActivityBuilder {
            kind,
            display_name,
            mut arguments,
            variables,
            delegates,
            children,
            implementation_children,
            bindings,
            body,
        } = builder;
        let display_name = display_name.unwrap_or_else(|| kind.clone());
        let label = format!("{} ({})", display_name, qualified_id);

        let mut seen = std::collections::HashSet::new();
        for name in arguments
            .iter()
            .map(|a| &a.name)
            .chain(variables.iter().map(|v| &v.name))
        {
            if !seen.insert(name.clone()) {
                return Err(DefinitionError::DuplicateSlot {
                    activity: label.clone(),
                    name: name.clone(),
                });
            }
        }

        for (slot, expression) in bindings {
            let argument = arguments.iter_mut().find(|a| a.name == slot).ok_or_else(|| {
                DefinitionError::InvalidBinding {
                    activity: label.clone(),
                    slot: slot.clone(),
                    reason: "no such argument".to_string(),
                }
            })?;
            argument.binding = Some(expression);
        }

        let mut position = 0;
        let mut next_id = || {
            position += 1;
            qualified_id.child(position)
        };

        let mut frozen_children = Vec::with_capacity(children.len());
        for child in children {
            let id = next_id();
            frozen_children.push(self.freeze(child, id, compile_unit, false)?);
        }

        let mut frozen_implementation = Vec::with_capacity(implementation_children.len());
        for child in implementation_children {
            let id = next_id();
            self.next_unit += 1;
            let unit = self.next_unit;
            frozen_implementation.push(self.freeze(child, id, unit, true)?);
        }

        let mut frozen_arguments = Vec::with_capacity(arguments.len());
        for argument in arguments {
            let binding = match argument.binding {
                Some(expression) => {
                    if expression.has_nested_activity() {
                        return Err(DefinitionError::NestedActivityExpression {
                            activity: label.clone(),
                        });
                    }
                    if argument.direction != ArgumentDirection::In
                        && expression.as_reference().is_none()
                    {
                        return Err(DefinitionError::InvalidBinding {
                            activity: label.clone(),
                            slot: argument.name.clone(),
                            reason: "out and in-out arguments must bind a reference".to_string(),
                        });
                    }
                    Some(self.freeze_expression(expression, &mut next_id, compile_unit)?)
                }
                None => None,
            };
            frozen_arguments.push(ArgumentSlot {
                name: argument.name,
                value_type: argument.value_type,
                direction: argument.direction,
                required: argument.required,
                evaluation_order: argument.evaluation_order,
                binding,
            });
        }

        let mut frozen_variables = Vec::with_capacity(variables.len());
        for variable in variables {
            let default = match variable.default {
                Some(expression) => {
                    if expression.has_nested_activity() {
                        return Err(DefinitionError::NestedActivityExpression {
                            activity: label.clone(),
                        });
                    }
                    // A default activity without a Result slot is legal here and
                    // leaves the instance initialization-incomplete at runtime.
                    Some(self.freeze_any_expression(expression, &mut next_id, compile_unit)?)
                }
                None => None,
            };
            frozen_variables.push(VariableSlot {
                name: variable.name,
                value_type: variable.value_type,
                default,
                scope: variable.scope,
            });
        }

        let mut frozen_delegates = Vec::with_capacity(delegates.len());
        let mut delegate_names = std::collections::HashSet::new();
        for delegate in delegates {
            if !delegate_names.insert(delegate.name.clone()) {
                return Err(DefinitionError::DuplicateDelegate {
                    activity: label.clone(),
                    name: delegate.name,
                });
            }
            let handler = match delegate.handler {
                Some(handler) => {
                    let id = next_id();
                    Some(self.freeze(handler, id, compile_unit, false)?)
                }
                None => None,
            };
            frozen_delegates.push(DelegateSlot {
                name: delegate.name,
                parameters: delegate.parameters,
                handler,
            });
        }

        let definition = Arc::new(ActivityDefinition {
            kind,
            display_name,
            qualified_id: qualified_id.clone(),
            compile_unit,
            is_implementation,
            arguments: frozen_arguments,
            variables: frozen_variables,
            delegates: frozen_delegates,
            children: frozen_children,
            implementation_children: frozen_implementation,
            body,
        });
        self.index.insert(qualified_id, definition.clone());
        Ok(definition)
    }

    fn freeze_expression(
        &mut self,
        expression: Expression<ActivityBuilder>,
        next_id: &mut impl FnMut() -> QualifiedId,
        compile_unit: u32,
    ) -> Result<Expression> {
        let frozen = self.freeze_any_expression(expression, next_id, compile_unit)?;
        if let Expression::Activity(def) = &frozen {
            if !def.has_result() {
                return Err(DefinitionError::MissingResult {
                    activity: format!("{} ({})", def.display_name, def.qualified_id),
                });
            }
        }
        Ok(frozen)
    }

    fn freeze_any_expression(
        &mut self,
        expression: Expression<ActivityBuilder>,
        next_id: &mut impl FnMut() -> QualifiedId,
        compile_unit: u32,
    ) -> Result<Expression> {
        expression.try_map(&mut |builder| {
            let id = next_id();
            self.freeze(builder, id, compile_unit, false)
        })
    }
}

/// A frozen workflow: the root definition plus an index by qualified id.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    pub name: String,
    pub version: String,
    pub root: DefinitionRef,
    index: HashMap<QualifiedId, DefinitionRef>,
}

impl WorkflowDefinition {
    pub fn new(name: &str, version: &str, root: ActivityBuilder) -> Result<Self> {
        let mut freezer = Freezer {
            next_unit: 0,
            index: HashMap::new(),
        };
        let root = freezer.freeze(root, QualifiedId::root(), 0, false)?;
        Ok(Self {
            name: name.to_string(),
            version: version.to_string(),
            root,
            index: freezer.index,
        })
    }

    pub fn find(&self, qualified_id: &QualifiedId) -> Option<&DefinitionRef> {
        self.index.get(qualified_id)
    }

    pub fn node_count(&self) -> usize {
        self.index.len()
    }
}
