// ABOUTME: Snapshot and restore of a quiescent instance tree
// ABOUTME: Persisted nodes are re-attached to the definition by qualified id with identity and version checks

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

use super::bookmark::{
    BookmarkManager, BookmarkRecord, BookmarkScope, ExclusiveHandle, ExclusiveHandles, HandleId,
};
use super::error::{ExecutionError, Result};
use super::executor::Executor;
use super::instance::{
    ActivityInstance, ActivityState, CompletionCallback, FaultCallback, InstanceId, Substate,
};
use super::location::{Environment, Environments, LocationRef};
use super::properties::{PropertyChain, PropertyEntry, PropertyScope, PropertyValue, ScopeId};
use super::result::WorkflowCompletion;
use crate::definition::{QualifiedId, Value, WorkflowDefinition};

/// Bumped whenever the persisted layout changes incompatibly.
pub const FORMAT_VERSION: u32 = 1;

/// Children are stored compactly: most nodes have none or one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PersistedChildren {
    #[default]
    None,
    Single(InstanceId),
    Many(Vec<InstanceId>),
}

impl From<&[InstanceId]> for PersistedChildren {
    fn from(children: &[InstanceId]) -> Self {
        match children {
            [] => PersistedChildren::None,
            [only] => PersistedChildren::Single(*only),
            many => PersistedChildren::Many(many.to_vec()),
        }
    }
}

impl From<PersistedChildren> for Vec<InstanceId> {
    fn from(children: PersistedChildren) -> Self {
        match children {
            PersistedChildren::None => Vec::new(),
            PersistedChildren::Single(only) => vec![only],
            PersistedChildren::Many(many) => many,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedInstance {
    pub id: InstanceId,
    pub qualified_id: QualifiedId,
    pub kind: String,
    pub display_name: String,
    pub state: ActivityState,
    pub substate: Substate,
    pub busy_count: u32,
    pub blocking_bookmarks: u32,
    #[serde(default)]
    pub cancellation_requested: bool,
    #[serde(default)]
    pub performing_default_cancel: bool,
    #[serde(default)]
    pub initialization_incomplete: bool,
    pub parent: Option<InstanceId>,
    #[serde(default)]
    pub children: PersistedChildren,
    pub environment: Option<InstanceId>,
    pub owns_environment: bool,
    pub binding_environment: Option<InstanceId>,
    pub completion: Option<CompletionCallback>,
    pub fault_callback: Option<FaultCallback>,
    pub property_scope: Option<ScopeId>,
    pub result_target: Option<LocationRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PersistedPropertyValue {
    Value(Value),
    ExclusiveHandle(HandleId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedProperty {
    pub value: PersistedPropertyValue,
    pub fence: Option<u32>,
    pub removable_with_children: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedPropertyScope {
    pub id: ScopeId,
    pub owner: Option<InstanceId>,
    pub parent: Option<ScopeId>,
    pub entries: IndexMap<String, PersistedProperty>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Counters {
    pub next_instance_id: u64,
    pub next_operation_id: u64,
    pub next_handle_id: u64,
    pub next_scope_id: u64,
}

/// Everything needed to rebuild an executor at the point it was persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub format_version: u32,
    pub workflow: String,
    pub definition_version: String,
    pub counters: Counters,
    pub root: Option<InstanceId>,
    pub instances: Vec<PersistedInstance>,
    pub environments: Vec<Environment>,
    pub bookmarks: Vec<BookmarkRecord>,
    pub handles: Vec<ExclusiveHandle>,
    pub property_scopes: Vec<PersistedPropertyScope>,
    pub host_scope: Option<ScopeId>,
    #[serde(default)]
    pub host_bookmark_scopes: Vec<BookmarkScope>,
    pub completion: Option<WorkflowCompletion>,
    pub persisted_at: DateTime<Utc>,
}

impl PersistedState {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn bookmark_names(&self) -> Vec<String> {
        self.bookmarks
            .iter()
            .map(|r| r.bookmark.to_string())
            .collect()
    }
}

fn persist_entry(entry: &PropertyEntry) -> Option<PersistedProperty> {
    let value = match &entry.value {
        PropertyValue::Value(v) => PersistedPropertyValue::Value(v.clone()),
        PropertyValue::ExclusiveHandle(h) => PersistedPropertyValue::ExclusiveHandle(*h),
        PropertyValue::Custom(_) => return None,
    };
    Some(PersistedProperty {
        value,
        fence: entry.fence,
        removable_with_children: entry.removable_with_children,
    })
}

fn restore_entry(entry: PersistedProperty) -> PropertyEntry {
    PropertyEntry {
        value: match entry.value {
            PersistedPropertyValue::Value(v) => PropertyValue::Value(v),
            PersistedPropertyValue::ExclusiveHandle(h) => PropertyValue::ExclusiveHandle(h),
        },
        fence: entry.fence,
        removable_with_children: entry.removable_with_children,
    }
}

fn identity(qualified_id: &QualifiedId, field: &str, value: &str) -> String {
    format!("{} {} '{}'", qualified_id, field, value)
}

impl Executor {
    /// Capture the tree. Refused unless the tree is quiescent.
    pub fn snapshot(&self) -> Result<PersistedState> {
        if let Some(reason) = self.quiescence_violation() {
            return Err(ExecutionError::NotQuiescent { reason });
        }

        let property_scopes = self.persist_property_scopes();

        let instances = self
            .instances
            .values()
            .map(|instance| PersistedInstance {
                id: instance.id,
                qualified_id: instance.qualified_id.clone(),
                kind: instance.kind().to_string(),
                display_name: instance.display_name().to_string(),
                state: instance.state,
                substate: instance.substate,
                busy_count: instance.busy_count,
                blocking_bookmarks: instance.blocking_bookmarks,
                cancellation_requested: instance.cancellation_requested,
                performing_default_cancel: instance.performing_default_cancel,
                initialization_incomplete: instance.initialization_incomplete,
                parent: instance.parent,
                children: PersistedChildren::from(instance.children.as_slice()),
                environment: instance.environment,
                owns_environment: instance.owns_environment,
                binding_environment: instance.binding_environment,
                completion: instance.completion.clone(),
                fault_callback: instance.fault_callback.clone(),
                property_scope: self.properties.nearest_serializable(instance.property_scope),
                result_target: instance.result_target.clone(),
            })
            .collect();

        Ok(PersistedState {
            format_version: FORMAT_VERSION,
            workflow: self.workflow_name.clone(),
            definition_version: self.definition_version.clone(),
            counters: Counters {
                next_instance_id: self.next_instance_id,
                next_operation_id: self.next_operation_id,
                next_handle_id: self.handles.next_id(),
                next_scope_id: self.properties.next_id(),
            },
            root: self.root,
            instances,
            environments: self.environments.iter().cloned().collect(),
            bookmarks: self.bookmarks.records().cloned().collect(),
            handles: self.handles.iter().cloned().collect(),
            property_scopes,
            host_scope: self.properties.nearest_serializable(self.host_scope),
            host_bookmark_scopes: self.host_bookmark_scopes.clone(),
            completion: self.completion.clone(),
            persisted_at: Utc::now(),
        })
    }

    fn persist_property_scopes(&self) -> Vec<PersistedPropertyScope> {
        let mut persisted = Vec::new();
        for scope in self.properties.iter() {
            if !scope.is_serializable() {
                warn!(
                    "Dropping property scope {:?} owned by {:?}: it holds host-only properties",
                    scope.id, scope.owner
                );
                continue;
            }
            persisted.push(PersistedPropertyScope {
                id: scope.id,
                owner: scope.owner,
                parent: self.properties.nearest_serializable(scope.parent),
                entries: scope
                    .entries
                    .iter()
                    .filter_map(|(name, entry)| persist_entry(entry).map(|e| (name.clone(), e)))
                    .collect(),
            });
        }
        persisted
    }

    /// Rebuild an executor from `state` against `workflow`.
    pub fn restore(state: PersistedState, workflow: &WorkflowDefinition) -> Result<Self> {
        if state.format_version != FORMAT_VERSION {
            return Err(ExecutionError::VersionMismatch {
                expected: format!("format {}", FORMAT_VERSION),
                actual: format!("format {}", state.format_version),
            });
        }
        if state.definition_version != workflow.version {
            return Err(ExecutionError::VersionMismatch {
                expected: workflow.version.clone(),
                actual: state.definition_version,
            });
        }
        if state.workflow != workflow.name {
            return Err(ExecutionError::IdentityMismatch {
                expected: format!("workflow '{}'", workflow.name),
                actual: format!("workflow '{}'", state.workflow),
            });
        }

        let mut instances = BTreeMap::new();
        for persisted in state.instances {
            let definition = workflow.find(&persisted.qualified_id).ok_or_else(|| {
                ExecutionError::IdentityMismatch {
                    expected: format!("a definition node at {}", persisted.qualified_id),
                    actual: format!("none in workflow '{}'", workflow.name),
                }
            })?;
            if definition.kind != persisted.kind {
                return Err(ExecutionError::IdentityMismatch {
                    expected: identity(&persisted.qualified_id, "kind", &definition.kind),
                    actual: identity(&persisted.qualified_id, "kind", &persisted.kind),
                });
            }
            if definition.display_name != persisted.display_name {
                return Err(ExecutionError::IdentityMismatch {
                    expected: identity(
                        &persisted.qualified_id,
                        "display name",
                        &definition.display_name,
                    ),
                    actual: identity(
                        &persisted.qualified_id,
                        "display name",
                        &persisted.display_name,
                    ),
                });
            }

            let mut instance =
                ActivityInstance::new(persisted.id, definition.clone(), persisted.parent);
            instance.state = persisted.state;
            instance.substate = persisted.substate;
            instance.busy_count = persisted.busy_count;
            instance.blocking_bookmarks = persisted.blocking_bookmarks;
            instance.cancellation_requested = persisted.cancellation_requested;
            instance.performing_default_cancel = persisted.performing_default_cancel;
            instance.initialization_incomplete = persisted.initialization_incomplete;
            instance.children = persisted.children.into();
            instance.environment = persisted.environment;
            instance.owns_environment = persisted.owns_environment;
            instance.binding_environment = persisted.binding_environment;
            instance.completion = persisted.completion;
            instance.fault_callback = persisted.fault_callback;
            instance.property_scope = persisted.property_scope;
            instance.result_target = persisted.result_target;
            instances.insert(instance.id, instance);
        }

        let mut environments = Environments::new();
        for environment in state.environments {
            environments.insert(environment);
        }

        let mut bookmarks = BookmarkManager::new();
        for record in state.bookmarks {
            bookmarks.register(record)?;
        }

        let scopes = state
            .property_scopes
            .into_iter()
            .map(|scope| PropertyScope {
                id: scope.id,
                owner: scope.owner,
                parent: scope.parent,
                entries: scope
                    .entries
                    .into_iter()
                    .map(|(name, entry)| (name, restore_entry(entry)))
                    .collect(),
            })
            .collect();

        let mut executor = Executor::new(workflow);
        executor.instances = instances;
        executor.next_instance_id = state.counters.next_instance_id;
        executor.next_operation_id = state.counters.next_operation_id;
        executor.root = state.root;
        executor.environments = environments;
        executor.bookmarks = bookmarks;
        executor.handles = ExclusiveHandles::restore(state.handles, state.counters.next_handle_id);
        executor.properties = PropertyChain::restore(scopes, state.counters.next_scope_id);
        executor.host_scope = state.host_scope;
        executor.host_bookmark_scopes = state.host_bookmark_scopes;
        executor.completion = state.completion;

        info!(
            "Restored workflow {} with {} instance(s) and {} bookmark(s)",
            executor.workflow_name,
            executor.instances.len(),
            executor.bookmarks.len()
        );
        Ok(executor)
    }
}
