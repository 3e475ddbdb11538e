// ABOUTME: Activity body traits and the contexts handed to them during execution
// ABOUTME: Contexts borrow the executor for one work item and expose the safe activity API

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::bookmark::{Bookmark, BookmarkOptions, BookmarkScope, HandleId};
use super::error::{ExecutionError, Fault, FaultResult};
use super::executor::{BindingScope, ChildSpec, Executor};
use super::instance::{
    ActivityState, CompletionCallback, Continuation, FaultCallback, InstanceId, InstanceInfo,
};
use super::properties::{ExecutionProperty, PropertyEntry, PropertyValue};
use crate::definition::{DefinitionRef, QualifiedId, Value, RESULT_SLOT};

/// Summary of a child that has left the tree, handed to its owner's continuation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedChild {
    pub id: InstanceId,
    pub qualified_id: QualifiedId,
    pub kind: String,
    pub state: ActivityState,
    pub outputs: IndexMap<String, Value>,
    pub fault: Option<Fault>,
}

impl CompletedChild {
    pub fn result(&self) -> Option<&Value> {
        self.outputs.get(RESULT_SLOT)
    }
}

/// A fault travelling towards its handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultContext {
    /// Instance whose work raised the fault.
    pub source: InstanceId,
    pub source_qualified_id: QualifiedId,
    /// Child of the handler on the path to the source.
    pub propagator: InstanceId,
    pub fault: Fault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDisposition {
    /// The propagator's subtree is torn down and completes as faulted.
    Handled,
    /// Keep looking further up the tree.
    Propagate,
}

/// Activities that schedule children, create bookmarks and react to callbacks.
pub trait NativeActivity: Send + Sync {
    fn execute(&self, ctx: &mut NativeContext<'_>) -> FaultResult<()>;

    fn cancel(&self, ctx: &mut NativeContext<'_>) -> FaultResult<()> {
        ctx.default_cancel();
        Ok(())
    }

    /// Best effort notification during a hard abort. Faults are logged and dropped.
    fn abort(&self, _instance: &InstanceInfo, _reason: &str) -> FaultResult<()> {
        Ok(())
    }

    fn on_child_completed(
        &self,
        _ctx: &mut NativeContext<'_>,
        _callback: &str,
        _child: &CompletedChild,
    ) -> FaultResult<()> {
        Ok(())
    }

    fn on_child_faulted(
        &self,
        _ctx: &mut NativeContext<'_>,
        _callback: &str,
        _fault: &FaultContext,
    ) -> FaultResult<FaultDisposition> {
        Ok(FaultDisposition::Propagate)
    }

    fn on_bookmark_resumed(
        &self,
        _ctx: &mut NativeContext<'_>,
        _callback: &str,
        _bookmark: &Bookmark,
        _value: Value,
    ) -> FaultResult<()> {
        Ok(())
    }
}

/// Activities backed by one external operation. `begin` returns the request
/// payload handed to the host; `end` receives the host's answer.
pub trait AsyncActivity: Send + Sync {
    fn begin(&self, ctx: &mut NativeContext<'_>) -> FaultResult<Value>;

    fn end(&self, ctx: &mut NativeContext<'_>, result: Value) -> FaultResult<()>;

    fn cancel(&self, _ctx: &mut NativeContext<'_>) -> FaultResult<()> {
        Ok(())
    }
}

/// Full activity API, valid for the duration of one work item.
pub struct NativeContext<'a> {
    executor: &'a mut Executor,
    instance: InstanceId,
}

impl<'a> NativeContext<'a> {
    pub(crate) fn new(executor: &'a mut Executor, instance: InstanceId) -> Self {
        Self { executor, instance }
    }

    pub fn id(&self) -> InstanceId {
        self.instance
    }

    pub fn definition(&self) -> FaultResult<DefinitionRef> {
        Ok(self.executor.definition_of(self.instance)?)
    }

    pub fn display_name(&self) -> String {
        self.executor
            .definition_of(self.instance)
            .map(|d| d.display_name.clone())
            .unwrap_or_default()
    }

    pub fn get(&self, name: &str) -> FaultResult<Value> {
        Ok(self.executor.read_symbol(self.instance, name)?)
    }

    pub fn set(&mut self, name: &str, value: Value) -> FaultResult<()> {
        Ok(self.executor.write_symbol(self.instance, name, value)?)
    }

    pub fn set_result(&mut self, value: Value) -> FaultResult<()> {
        self.set(RESULT_SLOT, value)
    }

    pub fn children(&self) -> Vec<InstanceId> {
        self.executor
            .instance_ref(self.instance)
            .map(|i| i.children.clone())
            .unwrap_or_default()
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.executor
            .instance_ref(self.instance)
            .map(|i| i.cancellation_requested)
            .unwrap_or(false)
    }

    /// Schedule a child definition. Named callbacks are dispatched back to this
    /// activity when the child completes or faults. Returns `None` when this
    /// instance is performing default cancel; it is marked canceled instead.
    pub fn schedule_child(
        &mut self,
        definition: &DefinitionRef,
        on_completed: Option<&str>,
        on_faulted: Option<&str>,
    ) -> FaultResult<Option<InstanceId>> {
        if self.executor.refuses_children(self.instance) {
            return Ok(None);
        }
        let spec = self.child_spec(on_completed, on_faulted, BindingScope::ParentEnvironment);
        Ok(Some(self.executor.schedule_instance(
            definition.clone(),
            Some(self.instance),
            spec,
            None,
        )?))
    }

    /// Schedule the handler of delegate `name` with the given parameter values.
    /// Returns `None` when the delegate has no handler or this instance is
    /// performing default cancel.
    pub fn schedule_delegate(
        &mut self,
        name: &str,
        inputs: IndexMap<String, Value>,
        on_completed: Option<&str>,
        on_faulted: Option<&str>,
    ) -> FaultResult<Option<InstanceId>> {
        let spec = self.child_spec(on_completed, on_faulted, BindingScope::OwnEnvironment);
        Ok(self
            .executor
            .schedule_delegate(self.instance, name, inputs, spec)?)
    }

    fn child_spec(
        &self,
        on_completed: Option<&str>,
        on_faulted: Option<&str>,
        binding: BindingScope,
    ) -> ChildSpec {
        ChildSpec {
            completion: on_completed.map(|name| CompletionCallback {
                owner: self.instance,
                continuation: Continuation::Named(name.to_string()),
            }),
            fault: on_faulted.map(|name| FaultCallback {
                owner: self.instance,
                name: name.to_string(),
            }),
            result_target: None,
            binding,
        }
    }

    pub fn create_bookmark(
        &mut self,
        name: &str,
        callback: &str,
        options: BookmarkOptions,
    ) -> FaultResult<Bookmark> {
        self.create_scoped_bookmark(Bookmark::new(name), callback, options)
    }

    pub fn create_scoped_bookmark(
        &mut self,
        bookmark: Bookmark,
        callback: &str,
        options: BookmarkOptions,
    ) -> FaultResult<Bookmark> {
        Ok(self
            .executor
            .create_bookmark(self.instance, bookmark, callback, options, None)?)
    }

    /// Register a bookmark on the exclusive handle stored under `handle_property`.
    pub fn create_exclusive_bookmark(
        &mut self,
        handle_property: &str,
        bookmark: Bookmark,
        callback: &str,
        important: bool,
    ) -> FaultResult<Bookmark> {
        let handle = self.find_handle(handle_property)?;
        Ok(self.executor.create_bookmark(
            self.instance,
            bookmark,
            callback,
            BookmarkOptions::default(),
            Some((handle, important)),
        )?)
    }

    pub fn remove_bookmark(&mut self, bookmark: &Bookmark) -> FaultResult<bool> {
        Ok(self.executor.remove_bookmark(self.instance, bookmark)?)
    }

    pub fn remove_all_bookmarks(&mut self) {
        self.executor.purge_bookmarks_of(self.instance);
    }

    pub fn bookmark_exists(&self, bookmark: &Bookmark) -> bool {
        self.executor.bookmarks.get(bookmark).is_some()
    }

    /// Declare a fresh bookmark scope in this instance's environment.
    pub fn declare_bookmark_scope(&mut self) -> FaultResult<BookmarkScope> {
        Ok(self.executor.declare_bookmark_scope(self.instance)?)
    }

    pub fn cancel_child(&mut self, child: InstanceId) -> FaultResult<()> {
        let is_child = self
            .executor
            .instance_ref(self.instance)
            .map(|i| i.children.contains(&child))
            .unwrap_or(false);
        if !is_child {
            return Err(ExecutionError::InstanceNotFound(child).into());
        }
        self.executor.request_cancel_instance(child);
        Ok(())
    }

    pub fn cancel_children(&mut self) {
        for child in self.children() {
            self.executor.request_cancel_instance(child);
        }
    }

    /// Cancel every child and let the decision function finish the instance
    /// once only bookmarks remain.
    pub fn default_cancel(&mut self) {
        self.executor.default_cancel(self.instance);
    }

    pub fn mark_canceled(&mut self) {
        self.executor.mark_canceling(self.instance);
    }

    pub fn add_property(
        &mut self,
        name: &str,
        value: Value,
        only_visible_to_public_children: bool,
    ) -> FaultResult<()> {
        Ok(self.executor.add_property(
            self.instance,
            name,
            PropertyValue::Value(value),
            only_visible_to_public_children,
        )?)
    }

    pub fn add_custom_property(
        &mut self,
        name: &str,
        property: std::sync::Arc<dyn ExecutionProperty>,
    ) -> FaultResult<()> {
        Ok(self
            .executor
            .add_property(self.instance, name, PropertyValue::Custom(property), false)?)
    }

    pub fn find_property(&self, name: &str) -> Option<PropertyEntry> {
        self.executor.find_property(self.instance, name).cloned()
    }

    pub fn find_property_value(&self, name: &str) -> Option<Value> {
        match self.find_property(name)?.value {
            PropertyValue::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn remove_property(&mut self, name: &str) -> FaultResult<()> {
        Ok(self.executor.remove_property(self.instance, name)?)
    }

    /// Create an exclusive handle and publish it as property `name`.
    pub fn create_exclusive_handle(&mut self, name: &str) -> FaultResult<HandleId> {
        Ok(self.executor.create_exclusive_handle(self.instance, name)?)
    }

    fn find_handle(&self, name: &str) -> FaultResult<HandleId> {
        match self.find_property(name).map(|e| e.value) {
            Some(PropertyValue::ExclusiveHandle(id)) => Ok(id),
            _ => Err(ExecutionError::HandleNotFound(name.to_string()).into()),
        }
    }

    pub fn enter_isolation(&mut self) -> FaultResult<()> {
        Ok(self.executor.enter_isolation(self.instance)?)
    }

    pub fn exit_isolation(&mut self) -> FaultResult<()> {
        Ok(self.executor.exit_isolation(self.instance)?)
    }
}

/// Restricted context for code bodies: symbol access only.
pub struct CodeContext<'a> {
    inner: NativeContext<'a>,
}

impl<'a> CodeContext<'a> {
    pub(crate) fn new(executor: &'a mut Executor, instance: InstanceId) -> Self {
        Self {
            inner: NativeContext::new(executor, instance),
        }
    }

    pub fn id(&self) -> InstanceId {
        self.inner.id()
    }

    pub fn display_name(&self) -> String {
        self.inner.display_name()
    }

    pub fn get(&self, name: &str) -> FaultResult<Value> {
        self.inner.get(name)
    }

    pub fn set(&mut self, name: &str, value: Value) -> FaultResult<()> {
        self.inner.set(name, value)
    }

    pub fn set_result(&mut self, value: Value) -> FaultResult<()> {
        self.inner.set_result(value)
    }

    pub fn find_property_value(&self, name: &str) -> Option<Value> {
        self.inner.find_property_value(name)
    }
}
