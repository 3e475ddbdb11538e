// ABOUTME: Workflow validation ahead of execution
// ABOUTME: Checks activity kinds, kind configuration, argument bindings, symbol references and bookmarks

use std::collections::{BTreeMap, HashSet};

use super::document::WorkflowDocument;
use super::error::{ParserError, Result, ValidationError};
use super::workflow::WorkflowParser;
use crate::activities::bookmarks::declared_bookmarks;
use crate::activities::{ActivityError, ActivityRegistry};
use crate::definition::{ActivityDefinition, Expression, WorkflowDefinition};

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<String>,
    pub is_valid: bool,
}

pub struct WorkflowValidator {
    strict_mode: bool,
    parser: WorkflowParser,
}

impl WorkflowValidator {
    pub fn new() -> Self {
        Self {
            strict_mode: false,
            parser: WorkflowParser::new(),
        }
    }

    /// In strict mode unknown symbols and shared bookmark names are errors
    /// instead of warnings.
    pub fn with_strict_mode(mut self, strict: bool) -> Self {
        self.strict_mode = strict;
        self
    }

    pub fn with_registry(mut self, registry: ActivityRegistry) -> Self {
        self.parser = WorkflowParser::with_registry(registry);
        self
    }

    pub fn validate(&self, document: &WorkflowDocument) -> Result<ValidationReport> {
        let mut report = ValidationReport::new();

        self.validate_activity_types(document, &mut report);
        self.validate_bookmarks(document, &mut report);
        self.check_empty_containers(document, &mut report);

        // Building reports binding and freezing problems, but only makes
        // sense once every node is individually valid.
        if report.errors.is_empty() {
            match self.parser.build(document) {
                Ok(workflow) => self.validate_references(&workflow, &mut report),
                Err(err) => report.errors.push(Self::build_error(err)?),
            }
        }

        report.is_valid = report.errors.is_empty();
        Ok(report)
    }

    fn validate_activity_types(&self, document: &WorkflowDocument, report: &mut ValidationReport) {
        let registry = self.parser.registry();
        for (path, node) in document.nodes() {
            match registry.validate_config(node) {
                Ok(()) => {}
                Err(ActivityError::UnsupportedKind { kind, supported }) => {
                    report.errors.push(ValidationError::UnsupportedActivityType {
                        path,
                        kind,
                        supported,
                    });
                }
                Err(err) => report.errors.push(ValidationError::InvalidActivityConfig {
                    path,
                    reason: err.to_string(),
                }),
            }
        }
    }

    fn validate_bookmarks(&self, document: &WorkflowDocument, report: &mut ValidationReport) {
        let mut owners: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (path, node) in document.nodes() {
            for bookmark in declared_bookmarks(node) {
                owners.entry(bookmark).or_default().push(path.clone());
            }
        }

        for (bookmark, paths) in owners {
            if paths.len() < 2 {
                continue;
            }
            let error = ValidationError::DuplicateBookmark { bookmark, paths };
            if self.strict_mode {
                report.errors.push(error);
            } else {
                report.warnings.push(error.to_string());
            }
        }
    }

    fn check_empty_containers(&self, document: &WorkflowDocument, report: &mut ValidationReport) {
        for (path, node) in document.nodes() {
            if matches!(node.kind.as_str(), "sequence" | "parallel") && node.children.is_empty() {
                report
                    .warnings
                    .push(format!("{} at {} has no children", node.kind, path));
            }
        }
    }

    /// Flag references to names no enclosing activity declares.
    fn validate_references(&self, workflow: &WorkflowDefinition, report: &mut ValidationReport) {
        let mut stack: Vec<(&ActivityDefinition, HashSet<String>)> =
            vec![(workflow.root.as_ref(), HashSet::new())];

        while let Some((node, inherited)) = stack.pop() {
            let mut visible = inherited;
            visible.extend(node.arguments.iter().map(|a| a.name.clone()));
            visible.extend(node.variables.iter().map(|v| v.name.clone()));

            let bindings = node
                .arguments
                .iter()
                .filter_map(|a| a.binding.as_ref())
                .chain(node.variables.iter().filter_map(|v| v.default.as_ref()));
            for expression in bindings {
                for symbol in expression.references() {
                    if !visible.contains(symbol) {
                        let error = ValidationError::UnknownSymbol {
                            path: format!("{} ({})", node.display_name, node.qualified_id),
                            symbol: symbol.to_string(),
                        };
                        if self.strict_mode {
                            report.errors.push(error);
                        } else {
                            report.warnings.push(error.to_string());
                        }
                    }
                }
                if let Expression::Activity(activity) = expression {
                    stack.push((activity.as_ref(), visible.clone()));
                }
            }

            for child in node.children.iter().chain(&node.implementation_children) {
                stack.push((child.as_ref(), visible.clone()));
            }
            for delegate in &node.delegates {
                if let Some(handler) = &delegate.handler {
                    let mut scope = visible.clone();
                    scope.extend(delegate.parameters.iter().map(|p| p.name.clone()));
                    stack.push((handler.as_ref(), scope));
                }
            }
        }
    }

    fn build_error(err: ParserError) -> Result<ValidationError> {
        Ok(match err {
            ParserError::ActivityError(ActivityError::UnknownArgument { activity, slot }) => {
                ValidationError::UnknownArgument {
                    path: activity,
                    slot,
                }
            }
            ParserError::ActivityError(err) => ValidationError::InvalidDefinition {
                reason: err.to_string(),
            },
            ParserError::DefinitionError(err) => ValidationError::InvalidDefinition {
                reason: err.to_string(),
            },
            ParserError::ValidationError(err) => err,
            other => return Err(other),
        })
    }
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidationReport {
    pub fn new() -> Self {
        Self {
            errors: Vec::new(),
            warnings: Vec::new(),
            is_valid: true,
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

impl Default for WorkflowValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validate(yaml: &str, strict: bool) -> ValidationReport {
        let document = WorkflowDocument::from_yaml(yaml).unwrap();
        WorkflowValidator::new()
            .with_strict_mode(strict)
            .validate(&document)
            .unwrap()
    }

    #[test]
    fn test_valid_workflow() {
        let report = validate(
            r#"
name: ok
arguments:
  who: { type: string }
root:
  type: sequence
  children:
    - { type: log, with: { message: { ref: who } } }
"#,
            true,
        );
        assert!(report.is_valid, "{:?}", report.errors);
        assert!(!report.has_warnings());
    }

    #[test]
    fn test_unknown_kind_reported_with_path() {
        let report = validate(
            "name: bad\nroot: { type: sequence, children: [ { type: teleport } ] }",
            false,
        );
        assert!(!report.is_valid);
        assert!(matches!(
            &report.errors[0],
            ValidationError::UnsupportedActivityType { path, kind, .. }
                if path == "root.children[0]" && kind == "teleport"
        ));
    }

    #[test]
    fn test_bad_config_reported() {
        let report = validate("name: bad\nroot: { type: wait_for_bookmark }", false);
        assert!(matches!(
            report.errors[0],
            ValidationError::InvalidActivityConfig { .. }
        ));
    }

    #[test]
    fn test_unknown_argument_reported() {
        let report = validate("name: bad\nroot: { type: log, with: { colour: red } }", false);
        assert!(matches!(
            &report.errors[0],
            ValidationError::UnknownArgument { slot, .. } if slot == "colour"
        ));
    }

    #[test]
    fn test_unknown_symbol_is_warning_unless_strict() {
        let yaml = "name: refs\nroot: { type: log, with: { message: { ref: ghost } } }";
        let lenient = validate(yaml, false);
        assert!(lenient.is_valid);
        assert!(lenient.warnings[0].contains("ghost"));

        let strict = validate(yaml, true);
        assert!(matches!(
            &strict.errors[0],
            ValidationError::UnknownSymbol { symbol, .. } if symbol == "ghost"
        ));
    }

    #[test]
    fn test_delegate_parameters_are_visible_to_handler() {
        let report = validate(
            r#"
name: loop
root:
  type: for_each
  with: { values: [1, 2] }
  body: { type: log, with: { message: { ref: item } } }
"#,
            true,
        );
        assert!(report.is_valid, "{:?}", report.errors);
    }

    #[test]
    fn test_shared_bookmark_names() {
        let yaml = r#"
name: shared
root:
  type: parallel
  children:
    - { type: wait_for_bookmark, config: { bookmark: go } }
    - { type: wait_for_bookmark, config: { bookmark: go } }
"#;
        assert!(validate(yaml, false).has_warnings());
        assert!(matches!(
            validate(yaml, true).errors[0],
            ValidationError::DuplicateBookmark { .. }
        ));
    }

    #[test]
    fn test_empty_sequence_warns() {
        let report = validate("name: empty\nroot: { type: sequence }", false);
        assert!(report.is_valid);
        assert!(report.warnings[0].contains("no children"));
    }
}
