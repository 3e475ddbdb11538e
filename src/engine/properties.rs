// ABOUTME: Copy-on-write ambient property chain scoped to instances
// ABOUTME: Properties are layered per owning instance and fenced by definition compile unit

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::bookmark::HandleId;
use super::error::{ExecutionError, Result};
use super::instance::InstanceId;
use crate::definition::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeId(pub u64);

/// A property that wants to know when it enters and leaves the chain.
pub trait ExecutionProperty: Send + Sync + fmt::Debug {
    fn register(&self, _owner: Option<InstanceId>) {}

    fn unregister(&self, _owner: Option<InstanceId>) {}
}

#[derive(Debug, Clone)]
pub enum PropertyValue {
    Value(Value),
    ExclusiveHandle(HandleId),
    Custom(Arc<dyn ExecutionProperty>),
}

impl PropertyValue {
    pub fn is_serializable(&self) -> bool {
        !matches!(self, PropertyValue::Custom(_))
    }
}

#[derive(Debug, Clone)]
pub struct PropertyEntry {
    pub value: PropertyValue,
    /// Compile unit the entry is restricted to, if any.
    pub fence: Option<u32>,
    pub removable_with_children: bool,
}

impl PropertyEntry {
    pub fn new(value: PropertyValue) -> Self {
        Self {
            value,
            fence: None,
            removable_with_children: false,
        }
    }

    pub fn visible_to(&self, compile_unit: u32) -> bool {
        self.fence.map(|f| f == compile_unit).unwrap_or(true)
    }
}

#[derive(Debug, Clone)]
pub struct PropertyScope {
    pub id: ScopeId,
    pub owner: Option<InstanceId>,
    pub parent: Option<ScopeId>,
    pub entries: IndexMap<String, PropertyEntry>,
}

impl PropertyScope {
    pub fn is_serializable(&self) -> bool {
        self.entries.values().all(|e| e.value.is_serializable())
    }
}

#[derive(Debug, Clone, Default)]
pub struct PropertyChain {
    scopes: BTreeMap<ScopeId, PropertyScope>,
    next_id: u64,
}

impl PropertyChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ScopeId) -> Option<&PropertyScope> {
        self.scopes.get(&id)
    }

    pub fn owner_of(&self, id: ScopeId) -> Option<InstanceId> {
        self.scopes.get(&id).and_then(|s| s.owner)
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PropertyScope> {
        self.scopes.values()
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn restore(scopes: Vec<PropertyScope>, next_id: u64) -> Self {
        Self {
            scopes: scopes.into_iter().map(|s| (s.id, s)).collect(),
            next_id,
        }
    }

    /// Add `name` on behalf of `owner`, whose current scope is `current`.
    /// A new scope is layered on top when `owner` does not own `current`.
    /// Returns the scope the owner should now point at.
    pub fn add(
        &mut self,
        owner: Option<InstanceId>,
        current: Option<ScopeId>,
        name: &str,
        entry: PropertyEntry,
    ) -> Result<ScopeId> {
        let target = match current {
            Some(id) if self.scopes.get(&id).map(|s| s.owner) == Some(owner) => id,
            _ => {
                self.next_id += 1;
                let id = ScopeId(self.next_id);
                self.scopes.insert(
                    id,
                    PropertyScope {
                        id,
                        owner,
                        parent: current,
                        entries: IndexMap::new(),
                    },
                );
                id
            }
        };

        let scope = self
            .scopes
            .get_mut(&target)
            .ok_or_else(|| ExecutionError::PropertyNotFound {
                name: name.to_string(),
            })?;
        if scope.entries.contains_key(name) {
            return Err(ExecutionError::DuplicateProperty {
                name: name.to_string(),
            });
        }
        if let PropertyValue::Custom(property) = &entry.value {
            property.register(owner);
        }
        scope.entries.insert(name.to_string(), entry);
        Ok(target)
    }

    /// Walk from `start` towards the root, returning the first entry named
    /// `name` that is visible to `compile_unit`.
    pub fn find(
        &self,
        start: Option<ScopeId>,
        name: &str,
        compile_unit: u32,
    ) -> Option<&PropertyEntry> {
        let mut current = start;
        while let Some(id) = current {
            let scope = self.scopes.get(&id)?;
            if let Some(entry) = scope.entries.get(name) {
                if entry.visible_to(compile_unit) {
                    return Some(entry);
                }
            }
            current = scope.parent;
        }
        None
    }

    /// Entry registered directly in `scope`.
    pub fn local(&self, scope: Option<ScopeId>, name: &str) -> Option<&PropertyEntry> {
        scope
            .and_then(|id| self.scopes.get(&id))
            .and_then(|s| s.entries.get(name))
    }

    pub fn remove(
        &mut self,
        owner: InstanceId,
        scope: Option<ScopeId>,
        name: &str,
        has_executing_children: bool,
    ) -> Result<PropertyEntry> {
        let not_found = || ExecutionError::PropertyNotFound {
            name: name.to_string(),
        };
        let scope = scope
            .and_then(|id| self.scopes.get_mut(&id))
            .filter(|s| s.owner == Some(owner))
            .ok_or_else(not_found)?;
        let entry = scope.entries.get(name).ok_or_else(not_found)?;
        if has_executing_children && !entry.removable_with_children {
            return Err(ExecutionError::PropertyInUse {
                name: name.to_string(),
            });
        }
        let entry = scope.entries.shift_remove(name).ok_or_else(not_found)?;
        if let PropertyValue::Custom(property) = &entry.value {
            property.unregister(Some(owner));
        }
        Ok(entry)
    }

    /// Drop a scope entirely, unregistering its entries.
    pub fn release(&mut self, id: ScopeId) -> Vec<PropertyEntry> {
        let Some(scope) = self.scopes.remove(&id) else {
            return Vec::new();
        };
        scope
            .entries
            .into_values()
            .inspect(|entry| {
                if let PropertyValue::Custom(property) = &entry.value {
                    property.unregister(scope.owner);
                }
            })
            .collect()
    }

    /// Nearest scope at or above `start` that can be persisted.
    pub fn nearest_serializable(&self, start: Option<ScopeId>) -> Option<ScopeId> {
        let mut current = start;
        while let Some(id) = current {
            let scope = self.scopes.get(&id)?;
            if scope.is_serializable() {
                return Some(id);
            }
            current = scope.parent;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct Counter {
        registered: AtomicUsize,
        unregistered: AtomicUsize,
    }

    impl ExecutionProperty for Counter {
        fn register(&self, _owner: Option<InstanceId>) {
            self.registered.fetch_add(1, Ordering::SeqCst);
        }

        fn unregister(&self, _owner: Option<InstanceId>) {
            self.unregistered.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn value(v: Value) -> PropertyEntry {
        PropertyEntry::new(PropertyValue::Value(v))
    }

    #[test]
    fn test_add_layers_new_scope_for_new_owner() {
        let mut chain = PropertyChain::new();
        let parent = chain
            .add(Some(InstanceId(1)), None, "tenant", value(json!("a")))
            .unwrap();
        let same = chain
            .add(Some(InstanceId(1)), Some(parent), "region", value(json!("eu")))
            .unwrap();
        assert_eq!(parent, same);

        let child = chain
            .add(Some(InstanceId(2)), Some(parent), "tenant", value(json!("b")))
            .unwrap();
        assert_ne!(child, parent);

        let found = chain.find(Some(child), "tenant", 0).unwrap();
        assert!(matches!(&found.value, PropertyValue::Value(v) if v == &json!("b")));
        let found = chain.find(Some(parent), "tenant", 0).unwrap();
        assert!(matches!(&found.value, PropertyValue::Value(v) if v == &json!("a")));
        assert!(chain.find(Some(child), "region", 0).is_some());
    }

    #[test]
    fn test_duplicate_in_same_scope_rejected() {
        let mut chain = PropertyChain::new();
        let scope = chain
            .add(Some(InstanceId(1)), None, "tenant", value(json!(1)))
            .unwrap();
        let err = chain
            .add(Some(InstanceId(1)), Some(scope), "tenant", value(json!(2)))
            .unwrap_err();
        assert!(matches!(err, ExecutionError::DuplicateProperty { .. }));
    }

    #[test]
    fn test_fence_hides_entry_from_other_compile_units() {
        let mut chain = PropertyChain::new();
        let outer = chain
            .add(Some(InstanceId(1)), None, "tx", value(json!("outer")))
            .unwrap();
        let mut fenced = value(json!("inner"));
        fenced.fence = Some(0);
        let inner = chain
            .add(Some(InstanceId(2)), Some(outer), "tx", fenced)
            .unwrap();

        let seen = chain.find(Some(inner), "tx", 0).unwrap();
        assert!(matches!(&seen.value, PropertyValue::Value(v) if v == &json!("inner")));
        let seen = chain.find(Some(inner), "tx", 3).unwrap();
        assert!(matches!(&seen.value, PropertyValue::Value(v) if v == &json!("outer")));
    }

    #[test]
    fn test_remove_rejected_with_executing_children() {
        let mut chain = PropertyChain::new();
        let scope = chain
            .add(Some(InstanceId(1)), None, "tenant", value(json!(1)))
            .unwrap();
        let err = chain
            .remove(InstanceId(1), Some(scope), "tenant", true)
            .unwrap_err();
        assert!(matches!(err, ExecutionError::PropertyInUse { .. }));

        let mut handle = PropertyEntry::new(PropertyValue::ExclusiveHandle(HandleId(1)));
        handle.removable_with_children = true;
        chain
            .add(Some(InstanceId(1)), Some(scope), "lock", handle)
            .unwrap();
        assert!(chain.remove(InstanceId(1), Some(scope), "lock", true).is_ok());
        assert!(chain.remove(InstanceId(1), Some(scope), "tenant", false).is_ok());
    }

    #[test]
    fn test_custom_properties_registered_and_released() {
        let counter = Arc::new(Counter::default());
        let mut chain = PropertyChain::new();
        let scope = chain
            .add(
                Some(InstanceId(1)),
                None,
                "counter",
                PropertyEntry::new(PropertyValue::Custom(counter.clone())),
            )
            .unwrap();
        assert_eq!(counter.registered.load(Ordering::SeqCst), 1);
        assert!(!chain.get(scope).unwrap().is_serializable());

        let released = chain.release(scope);
        assert_eq!(released.len(), 1);
        assert_eq!(counter.unregistered.load(Ordering::SeqCst), 1);
        assert!(chain.is_empty());
    }

    #[test]
    fn test_nearest_serializable_skips_custom_scopes() {
        let mut chain = PropertyChain::new();
        let base = chain
            .add(Some(InstanceId(1)), None, "tenant", value(json!(1)))
            .unwrap();
        let custom = chain
            .add(
                Some(InstanceId(2)),
                Some(base),
                "counter",
                PropertyEntry::new(PropertyValue::Custom(Arc::new(Counter::default()))),
            )
            .unwrap();
        assert_eq!(chain.nearest_serializable(Some(custom)), Some(base));
    }
}
