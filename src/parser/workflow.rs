// ABOUTME: Loads workflow documents and freezes them into executable definitions
// ABOUTME: Uses the activity registry to turn each authored node into an activity definition

use std::path::Path;
use tokio::fs;
use tracing::debug;

use super::document::WorkflowDocument;
use super::error::{ParserError, Result};
use crate::activities::ActivityRegistry;
use crate::definition::{ArgumentSlot, WorkflowDefinition};

pub struct WorkflowParser {
    registry: ActivityRegistry,
}

impl WorkflowParser {
    pub fn new() -> Self {
        Self {
            registry: ActivityRegistry::new(),
        }
    }

    pub fn with_registry(registry: ActivityRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ActivityRegistry {
        &self.registry
    }

    pub async fn parse_file<P: AsRef<Path>>(&self, path: P) -> Result<WorkflowDocument> {
        let content = fs::read_to_string(path.as_ref())
            .await
            .map_err(ParserError::IoError)?;
        self.parse_string(&content)
    }

    pub fn parse_string(&self, content: &str) -> Result<WorkflowDocument> {
        WorkflowDocument::from_yaml(content)
    }

    /// Build the frozen definition for a parsed document. Document arguments
    /// become arguments of the root activity.
    pub fn build(&self, document: &WorkflowDocument) -> Result<WorkflowDefinition> {
        let mut root = self.registry.build(&document.root)?;

        for (name, doc) in &document.arguments {
            let mut slot = ArgumentSlot::new(name, doc.value_type, doc.direction);
            if doc.required {
                slot = slot.required();
            }
            if let Some(order) = doc.order {
                slot = slot.with_order(order);
            }
            if let Some(default) = &doc.default {
                slot = slot.with_binding(self.registry.expression(&document.root, default)?);
            }
            root = root.argument(slot);
        }

        let definition = WorkflowDefinition::new(&document.name, &document.version, root)?;
        debug!(
            "Built workflow {} v{} with {} definition node(s)",
            definition.name,
            definition.version,
            definition.node_count()
        );
        Ok(definition)
    }

    /// Read, parse and build a workflow file in one step.
    pub async fn load_file<P: AsRef<Path>>(
        &self,
        path: P,
    ) -> Result<(WorkflowDocument, WorkflowDefinition)> {
        let document = self.parse_file(path).await?;
        let definition = self.build(&document)?;
        Ok((document, definition))
    }
}

impl Default for WorkflowParser {
    fn default() -> Self {
        Self::new()
    }
}
