// ABOUTME: Activities that suspend the workflow on named bookmarks
// ABOUTME: wait_for_bookmark waits on one name; exclusive_wait races several through an exclusive handle

use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{parse_config, ActivityError, ActivityFactory, ActivityRegistry, Result};
use crate::definition::{ActivityBuilder, ArgumentSlot, Body, Value, ValueType, RESULT_SLOT};
use crate::engine::{Bookmark, BookmarkOptions, FaultResult, NativeActivity, NativeContext};
use crate::parser::document::ActivityNode;

const HANDLE_PROPERTY: &str = "exclusive";

#[derive(Debug, Deserialize)]
struct WaitConfig {
    bookmark: String,
}

/// Suspends until the host resumes its bookmark, then returns the resumption value.
pub struct WaitForBookmark {
    bookmark: String,
}

impl NativeActivity for WaitForBookmark {
    fn execute(&self, ctx: &mut NativeContext<'_>) -> FaultResult<()> {
        ctx.create_bookmark(&self.bookmark, "resumed", BookmarkOptions::default())?;
        Ok(())
    }

    fn on_bookmark_resumed(
        &self,
        ctx: &mut NativeContext<'_>,
        _callback: &str,
        _bookmark: &Bookmark,
        value: Value,
    ) -> FaultResult<()> {
        ctx.set_result(value)
    }
}

pub struct WaitForBookmarkFactory;

impl ActivityFactory for WaitForBookmarkFactory {
    fn kind(&self) -> &'static str {
        "wait_for_bookmark"
    }

    fn build(&self, node: &ActivityNode, _registry: &ActivityRegistry) -> Result<ActivityBuilder> {
        let config: WaitConfig = parse_config(node)?;
        if config.bookmark.is_empty() {
            return Err(ActivityError::InvalidConfig {
                activity: node.label(),
                reason: "bookmark name must not be empty".to_string(),
            });
        }
        Ok(ActivityBuilder::new(
            self.kind(),
            Body::native(WaitForBookmark {
                bookmark: config.bookmark,
            }),
        )
        .argument(ArgumentSlot::output(RESULT_SLOT, ValueType::Any)))
    }

    fn validate_config(&self, node: &ActivityNode) -> Result<()> {
        parse_config::<WaitConfig>(node).map(|_| ())
    }
}

#[derive(Debug, Deserialize)]
struct ExclusiveConfig {
    #[serde(default)]
    important: Vec<String>,
    #[serde(default)]
    unimportant: Vec<String>,
}

/// Waits on several bookmarks sharing one exclusive handle. The first
/// important bookmark resumed wins and the rest are withdrawn.
pub struct ExclusiveWait {
    important: Vec<String>,
    unimportant: Vec<String>,
}

impl NativeActivity for ExclusiveWait {
    fn execute(&self, ctx: &mut NativeContext<'_>) -> FaultResult<()> {
        ctx.create_exclusive_handle(HANDLE_PROPERTY)?;
        for name in &self.important {
            ctx.create_exclusive_bookmark(HANDLE_PROPERTY, Bookmark::new(name), "resumed", true)?;
        }
        for name in &self.unimportant {
            ctx.create_exclusive_bookmark(HANDLE_PROPERTY, Bookmark::new(name), "resumed", false)?;
        }
        Ok(())
    }

    fn on_bookmark_resumed(
        &self,
        ctx: &mut NativeContext<'_>,
        _callback: &str,
        bookmark: &Bookmark,
        value: Value,
    ) -> FaultResult<()> {
        debug!("Exclusive wait {} resumed by {}", ctx.id(), bookmark);
        ctx.set_result(json!({ "bookmark": bookmark.name, "value": value }))
    }
}

pub struct ExclusiveWaitFactory;

impl ActivityFactory for ExclusiveWaitFactory {
    fn kind(&self) -> &'static str {
        "exclusive_wait"
    }

    fn build(&self, node: &ActivityNode, _registry: &ActivityRegistry) -> Result<ActivityBuilder> {
        let config: ExclusiveConfig = parse_config(node)?;
        if config.important.is_empty() && config.unimportant.is_empty() {
            return Err(ActivityError::InvalidConfig {
                activity: node.label(),
                reason: "at least one bookmark is required".to_string(),
            });
        }
        Ok(ActivityBuilder::new(
            self.kind(),
            Body::native(ExclusiveWait {
                important: config.important,
                unimportant: config.unimportant,
            }),
        )
        .argument(ArgumentSlot::output(RESULT_SLOT, ValueType::Any)))
    }

    fn validate_config(&self, node: &ActivityNode) -> Result<()> {
        parse_config::<ExclusiveConfig>(node).map(|_| ())
    }
}

/// Bookmark names a node waits on, for duplicate detection during validation.
pub fn declared_bookmarks(node: &ActivityNode) -> Vec<String> {
    match node.kind.as_str() {
        "wait_for_bookmark" => parse_config::<WaitConfig>(node)
            .map(|c| vec![c.bookmark])
            .unwrap_or_default(),
        "exclusive_wait" => parse_config::<ExclusiveConfig>(node)
            .map(|c| c.important.into_iter().chain(c.unimportant).collect())
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::WorkflowDefinition;
    use crate::engine::{BookmarkResumptionResult, BookmarkScope, InstanceTree};
    use indexmap::IndexMap;

    fn tree(yaml: &str) -> InstanceTree {
        let node: ActivityNode = serde_yaml::from_str(yaml).unwrap();
        let root = ActivityRegistry::new().build(&node).unwrap();
        let workflow = WorkflowDefinition::new("bookmarks", "1", root).unwrap();
        InstanceTree::create_root(&workflow, IndexMap::new()).unwrap()
    }

    #[test]
    fn test_wait_returns_resumption_value() {
        let mut tree = tree("type: wait_for_bookmark\nconfig: { bookmark: approve }");
        assert!(tree.run_until_quiescent().unwrap().is_idle());

        let result = tree.resume_bookmark("approve", BookmarkScope::Default, json!("yes"));
        assert_eq!(result, BookmarkResumptionResult::Success);
        let outcome = tree.run_until_quiescent().unwrap();
        assert_eq!(
            outcome.completion().unwrap().output(RESULT_SLOT),
            Some(&json!("yes"))
        );
    }

    #[test]
    fn test_wait_requires_bookmark_name() {
        let node: ActivityNode = serde_yaml::from_str("type: wait_for_bookmark").unwrap();
        let err = ActivityRegistry::new().build(&node).unwrap_err();
        assert!(matches!(err, ActivityError::InvalidConfig { .. }));
    }

    #[test]
    fn test_important_bookmark_wins_exclusive_wait() {
        let mut tree = tree(
            "type: exclusive_wait\nconfig: { important: [approve, reject], unimportant: [remind] }",
        );
        assert!(tree.run_until_quiescent().unwrap().is_idle());
        assert_eq!(tree.bookmarks().len(), 3);

        tree.resume_bookmark("reject", BookmarkScope::Default, json!(1));
        let outcome = tree.run_until_quiescent().unwrap();
        assert_eq!(
            outcome.completion().unwrap().output(RESULT_SLOT),
            Some(&json!({ "bookmark": "reject", "value": 1 }))
        );
        assert!(tree.bookmarks().is_empty());

        let late = tree.resume_bookmark("approve", BookmarkScope::Default, json!(2));
        assert_eq!(late, BookmarkResumptionResult::NotFound);
    }

    #[test]
    fn test_unimportant_bookmark_does_not_settle_handle() {
        let mut tree = tree(
            "type: exclusive_wait\nconfig: { important: [approve], unimportant: [remind] }",
        );
        tree.run_until_quiescent().unwrap();

        tree.resume_bookmark("remind", BookmarkScope::Default, json!(null));
        assert!(tree.run_until_quiescent().unwrap().is_idle());
        assert_eq!(tree.bookmarks().len(), 1);
    }

    #[test]
    fn test_declared_bookmarks() {
        let node: ActivityNode = serde_yaml::from_str(
            "type: exclusive_wait\nconfig: { important: [a], unimportant: [b] }",
        )
        .unwrap();
        assert_eq!(declared_bookmarks(&node), vec!["a", "b"]);
    }
}
