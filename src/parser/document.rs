// ABOUTME: YAML document model for workflow definitions
// ABOUTME: Describes activity nodes, slots and binding expressions as authored on disk

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::error::{ParserError, Result, ValidationError};
use crate::definition::{ArgumentDirection, BinaryOp, Value, ValueType};

fn default_version() -> String {
    "1.0".to_string()
}

/// Top-level workflow file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDocument {
    pub name: String,
    pub description: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
    pub author: Option<String>,
    /// Arguments of the root activity; inputs and outputs of the workflow.
    #[serde(default)]
    pub arguments: IndexMap<String, ArgumentDoc>,
    pub root: ActivityNode,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArgumentDoc {
    #[serde(rename = "type", default)]
    pub value_type: ValueType,
    #[serde(default)]
    pub direction: ArgumentDirection,
    #[serde(default)]
    pub required: bool,
    pub order: Option<i32>,
    /// Binding used when the host supplies no value.
    pub default: Option<ExpressionDoc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariableDoc {
    #[serde(rename = "type", default)]
    pub value_type: ValueType,
    pub default: Option<ExpressionDoc>,
    #[serde(default)]
    pub implementation: bool,
}

/// One authored activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityNode {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: Option<String>,
    /// Bindings for the arguments the activity kind declares.
    #[serde(default)]
    pub with: IndexMap<String, ExpressionDoc>,
    #[serde(default)]
    pub variables: IndexMap<String, VariableDoc>,
    #[serde(default)]
    pub children: Vec<ActivityNode>,
    /// Kind-specific settings such as a bookmark name.
    #[serde(default)]
    pub config: serde_yaml::Value,
    /// Handler for kinds that invoke a delegate (`for_each`).
    pub body: Option<Box<ActivityNode>>,
    /// Fault handler for `try_catch`.
    pub catch: Option<Box<ActivityNode>>,
}

impl ActivityNode {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            name: None,
            with: IndexMap::new(),
            variables: IndexMap::new(),
            children: Vec::new(),
            config: serde_yaml::Value::Null,
            body: None,
            catch: None,
        }
    }

    /// Label used in validation messages.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("{} '{}'", self.kind, name),
            None => self.kind.clone(),
        }
    }

    /// Nested nodes paired with their path suffix, in authoring order.
    pub fn nested(&self) -> Vec<(String, &ActivityNode)> {
        let mut nested: Vec<(String, &ActivityNode)> = self
            .children
            .iter()
            .enumerate()
            .map(|(i, c)| (format!("children[{}]", i), c))
            .collect();
        if let Some(body) = &self.body {
            nested.push(("body".to_string(), body));
        }
        if let Some(catch) = &self.catch {
            nested.push(("catch".to_string(), catch));
        }
        for (slot, expression) in &self.with {
            if let ExpressionDoc::Activity { activity } = expression {
                nested.push((format!("with.{}", slot), activity));
            }
        }
        for (name, variable) in &self.variables {
            if let Some(ExpressionDoc::Activity { activity }) = &variable.default {
                nested.push((format!("variables.{}", name), activity));
            }
        }
        nested
    }
}

/// Authored binding expression. Plain YAML values are literals; maps with a
/// `literal`, `ref`, `op` or `activity` key select the other forms.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExpressionDoc {
    Literal {
        literal: serde_yaml::Value,
    },
    Reference {
        #[serde(rename = "ref")]
        reference: String,
    },
    Binary {
        op: BinaryOp,
        left: Box<ExpressionDoc>,
        right: Box<ExpressionDoc>,
    },
    Activity {
        activity: Box<ActivityNode>,
    },
    Value(serde_yaml::Value),
}

/// Convert an authored YAML value into a runtime value.
pub fn yaml_to_value(value: &serde_yaml::Value) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| {
        ParserError::InvalidFormat(format!("value cannot be represented at runtime: {}", e))
    })
}

impl WorkflowDocument {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(ParserError::IoError)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let document: WorkflowDocument =
            serde_yaml::from_str(content).map_err(ParserError::YamlError)?;
        document.validate_structure()?;
        Ok(document)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(ParserError::YamlError)
    }

    fn validate_structure(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ParserError::MissingField("name".to_string()));
        }
        if self.version.trim().is_empty() {
            return Err(ParserError::MissingField("version".to_string()));
        }
        for (name, argument) in &self.arguments {
            if argument.direction == ArgumentDirection::Out && argument.default.is_some() {
                return Err(ParserError::ValidationError(
                    ValidationError::InvalidArgument {
                        name: name.clone(),
                        reason: "out arguments cannot have a default".to_string(),
                    },
                ));
            }
        }
        Ok(())
    }

    /// Every node in the document with its path, root first.
    pub fn nodes(&self) -> Vec<(String, &ActivityNode)> {
        let mut out = vec![("root".to_string(), &self.root)];
        let mut i = 0;
        while i < out.len() {
            let (path, node) = (out[i].0.clone(), out[i].1);
            for (suffix, child) in node.nested() {
                out.push((format!("{}.{}", path, suffix), child));
            }
            i += 1;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expression_forms() {
        let yaml = r#"
- 42
- { literal: { ref: not-a-reference } }
- { ref: total }
- { op: add, left: { ref: a }, right: 1 }
- { activity: { type: evaluate, with: { value: 3 } } }
"#;
        let parsed: Vec<ExpressionDoc> = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(parsed[0], ExpressionDoc::Value(_)));
        assert!(matches!(parsed[1], ExpressionDoc::Literal { .. }));
        assert!(matches!(&parsed[2], ExpressionDoc::Reference { reference } if reference == "total"));
        assert!(matches!(parsed[3], ExpressionDoc::Binary { op: BinaryOp::Add, .. }));
        assert!(matches!(parsed[4], ExpressionDoc::Activity { .. }));
    }

    #[test]
    fn test_parse_document_and_walk_nodes() {
        let yaml = r#"
name: approval
arguments:
  amount: { type: integer, required: true }
  decision: { type: string, direction: out }
root:
  type: sequence
  children:
    - type: log
      with: { message: "waiting" }
    - type: wait_for_bookmark
      config: { bookmark: approve }
      with: { Result: { ref: decision } }
"#;
        let document = WorkflowDocument::from_yaml(yaml).unwrap();
        assert_eq!(document.version, "1.0");
        assert_eq!(document.arguments.len(), 2);
        assert!(document.arguments["amount"].required);

        let paths: Vec<String> = document.nodes().into_iter().map(|(p, _)| p).collect();
        assert_eq!(
            paths,
            vec!["root", "root.children[0]", "root.children[1]"]
        );
    }

    #[test]
    fn test_empty_name_rejected() {
        let yaml = "name: \"\"\nroot: { type: sequence }\n";
        assert!(matches!(
            WorkflowDocument::from_yaml(yaml),
            Err(ParserError::MissingField(_))
        ));
    }

    #[test]
    fn test_out_argument_default_rejected() {
        let yaml = r#"
name: bad
arguments:
  result: { direction: out, default: 1 }
root: { type: sequence }
"#;
        assert!(WorkflowDocument::from_yaml(yaml).is_err());
    }
}
