// ABOUTME: Control-flow activities: sequence, parallel and isolated
// ABOUTME: Each schedules its child activities and completes when they have all left the tree

use tracing::debug;

use super::{require_children, ActivityFactory, ActivityRegistry, Result};
use crate::definition::{ActivityBuilder, Body};
use crate::engine::{CompletedChild, FaultResult, NativeActivity, NativeContext};
use crate::parser::document::ActivityNode;

pub struct SequenceFactory;

impl ActivityFactory for SequenceFactory {
    fn kind(&self) -> &'static str {
        "sequence"
    }

    fn build(&self, node: &ActivityNode, registry: &ActivityRegistry) -> Result<ActivityBuilder> {
        Ok(ActivityBuilder::new(self.kind(), Body::Composite)
            .children(registry.build_all(&node.children)?))
    }
}

/// Runs every child at once. Completion order follows the scheduler.
pub struct Parallel;

impl NativeActivity for Parallel {
    fn execute(&self, ctx: &mut NativeContext<'_>) -> FaultResult<()> {
        let definition = ctx.definition()?;
        for child in &definition.children {
            ctx.schedule_child(child, Some("branch_done"), None)?;
        }
        Ok(())
    }

    fn on_child_completed(
        &self,
        ctx: &mut NativeContext<'_>,
        _callback: &str,
        child: &CompletedChild,
    ) -> FaultResult<()> {
        debug!(
            "Parallel {} branch {} finished as {}, {} still running",
            ctx.id(),
            child.qualified_id,
            child.state,
            ctx.children().len()
        );
        Ok(())
    }
}

pub struct ParallelFactory;

impl ActivityFactory for ParallelFactory {
    fn kind(&self) -> &'static str {
        "parallel"
    }

    fn build(&self, node: &ActivityNode, registry: &ActivityRegistry) -> Result<ActivityBuilder> {
        Ok(ActivityBuilder::new(self.kind(), Body::native(Parallel))
            .children(registry.build_all(&node.children)?))
    }
}

/// Runs its single child with the tree isolated: bookmarks outside the
/// subtree report not-ready and the tree cannot be persisted until it ends.
pub struct Isolated;

impl NativeActivity for Isolated {
    fn execute(&self, ctx: &mut NativeContext<'_>) -> FaultResult<()> {
        let definition = ctx.definition()?;
        let Some(child) = definition.children.first() else {
            return Ok(());
        };
        ctx.enter_isolation()?;
        ctx.schedule_child(child, Some("done"), None)?;
        Ok(())
    }

    fn on_child_completed(
        &self,
        ctx: &mut NativeContext<'_>,
        _callback: &str,
        _child: &CompletedChild,
    ) -> FaultResult<()> {
        ctx.exit_isolation()
    }
}

pub struct IsolatedFactory;

impl ActivityFactory for IsolatedFactory {
    fn kind(&self) -> &'static str {
        "isolated"
    }

    fn build(&self, node: &ActivityNode, registry: &ActivityRegistry) -> Result<ActivityBuilder> {
        self.validate_config(node)?;
        Ok(ActivityBuilder::new(self.kind(), Body::native(Isolated))
            .children(registry.build_all(&node.children)?))
    }

    fn validate_config(&self, node: &ActivityNode) -> Result<()> {
        require_children(node, 0, 1)
    }
}
