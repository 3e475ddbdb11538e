// ABOUTME: Typed locations and the environment chain that holds them
// ABOUTME: Environments are keyed by owning instance and fall back to parent scopes on lookup

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::bookmark::BookmarkScope;
use super::error::{ExecutionError, Result};
use super::instance::InstanceId;
use crate::definition::{SymbolLookup, Value, ValueType};

/// Upper bound on reference hops when writing through reference locations.
const MAX_REFERENCE_DEPTH: usize = 64;

/// Address of a concrete slot in a concrete environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationRef {
    pub environment: InstanceId,
    pub slot: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueLocation {
    pub value_type: ValueType,
    pub value: Value,
}

/// A location that forwards to another one. When buffered, reads return the
/// buffer, and writes update both the buffer and the target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceLocation {
    pub value_type: ValueType,
    pub target: LocationRef,
    pub buffered: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Location {
    Value(ValueLocation),
    Reference(ReferenceLocation),
}

impl Location {
    pub fn with_value(value_type: ValueType, value: Value) -> Self {
        Location::Value(ValueLocation { value_type, value })
    }

    pub fn default_for(value_type: ValueType) -> Self {
        Location::with_value(value_type, value_type.default_value())
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            Location::Value(v) => v.value_type,
            Location::Reference(r) => r.value_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub owner: InstanceId,
    pub parent: Option<InstanceId>,
    pub slots: IndexMap<String, Location>,
    #[serde(default)]
    pub bookmark_scopes: Vec<BookmarkScope>,
}

/// Arena of environments keyed by owning instance id.
#[derive(Debug, Clone, Default)]
pub struct Environments {
    scopes: BTreeMap<InstanceId, Environment>,
}

impl Environments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, owner: InstanceId, parent: Option<InstanceId>) {
        self.scopes.insert(
            owner,
            Environment {
                owner,
                parent,
                slots: IndexMap::new(),
                bookmark_scopes: Vec::new(),
            },
        );
    }

    pub fn get(&self, owner: InstanceId) -> Option<&Environment> {
        self.scopes.get(&owner)
    }

    pub fn contains(&self, owner: InstanceId) -> bool {
        self.scopes.contains_key(&owner)
    }

    pub fn remove(&mut self, owner: InstanceId) -> Option<Environment> {
        self.scopes.remove(&owner)
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Environment> {
        self.scopes.values()
    }

    pub fn insert(&mut self, environment: Environment) {
        self.scopes.insert(environment.owner, environment);
    }

    pub fn declare(&mut self, env: InstanceId, slot: &str, location: Location) -> Result<()> {
        let environment = self
            .scopes
            .get_mut(&env)
            .ok_or(ExecutionError::NoEnvironment(env))?;
        if environment.slots.contains_key(slot) {
            return Err(ExecutionError::DuplicateSlot {
                environment: env,
                slot: slot.to_string(),
            });
        }
        environment.slots.insert(slot.to_string(), location);
        Ok(())
    }

    pub fn add_bookmark_scope(&mut self, env: InstanceId, scope: BookmarkScope) -> Result<()> {
        let environment = self
            .scopes
            .get_mut(&env)
            .ok_or(ExecutionError::NoEnvironment(env))?;
        if !environment.bookmark_scopes.contains(&scope) {
            environment.bookmark_scopes.push(scope);
        }
        Ok(())
    }

    /// Bookmark scopes declared along the chain starting at `env`, nearest first.
    pub fn visible_bookmark_scopes(&self, env: Option<InstanceId>) -> Vec<BookmarkScope> {
        let mut scopes = Vec::new();
        let mut current = env;
        while let Some(id) = current {
            let Some(environment) = self.scopes.get(&id) else {
                break;
            };
            scopes.extend(environment.bookmark_scopes.iter().cloned());
            current = environment.parent;
        }
        scopes
    }

    /// Find the environment on the chain that declares `slot`.
    pub fn resolve(&self, env: Option<InstanceId>, slot: &str) -> Option<LocationRef> {
        let mut current = env;
        while let Some(id) = current {
            let environment = self.scopes.get(&id)?;
            if environment.slots.contains_key(slot) {
                return Some(LocationRef {
                    environment: id,
                    slot: slot.to_string(),
                });
            }
            current = environment.parent;
        }
        None
    }

    pub fn location(&self, target: &LocationRef) -> Option<&Location> {
        self.scopes
            .get(&target.environment)
            .and_then(|e| e.slots.get(&target.slot))
    }

    fn location_mut(&mut self, target: &LocationRef) -> Option<&mut Location> {
        self.scopes
            .get_mut(&target.environment)
            .and_then(|e| e.slots.get_mut(&target.slot))
    }

    pub fn get_for_read(&self, env: Option<InstanceId>, slot: &str) -> Result<Value> {
        let target = self
            .resolve(env, slot)
            .ok_or_else(|| ExecutionError::SlotNotFound {
                slot: slot.to_string(),
            })?;
        self.read_at(&target)
    }

    pub fn read_at(&self, target: &LocationRef) -> Result<Value> {
        let mut current = target.clone();
        for _ in 0..MAX_REFERENCE_DEPTH {
            match self.location(&current) {
                Some(Location::Value(v)) => return Ok(v.value.clone()),
                Some(Location::Reference(r)) => {
                    if let Some(buffered) = &r.buffered {
                        return Ok(buffered.clone());
                    }
                    current = r.target.clone();
                }
                None => {
                    return Err(ExecutionError::SlotNotFound {
                        slot: current.slot.clone(),
                    })
                }
            }
        }
        Err(ExecutionError::SlotNotFound {
            slot: target.slot.clone(),
        })
    }

    /// Set the value seen through `slot`, writing through any references.
    pub fn get_for_write(&mut self, env: Option<InstanceId>, slot: &str, value: Value) -> Result<()> {
        let target = self
            .resolve(env, slot)
            .ok_or_else(|| ExecutionError::SlotNotFound {
                slot: slot.to_string(),
            })?;
        self.write_at(&target, value)
    }

    /// Write `value` at `target` and through every reference it forwards to.
    /// Nothing is written unless every hop accepts the value.
    pub fn write_at(&mut self, target: &LocationRef, value: Value) -> Result<()> {
        let hops = self.write_chain(target, &value)?;
        for hop in &hops {
            match self.location_mut(hop) {
                Some(Location::Value(v)) => v.value = value.clone(),
                Some(Location::Reference(r)) => {
                    if r.buffered.is_some() {
                        r.buffered = Some(value.clone());
                    }
                }
                None => {}
            }
        }
        Ok(())
    }

    /// Every location a write at `target` touches, ending at a value location.
    fn write_chain(&self, target: &LocationRef, value: &Value) -> Result<Vec<LocationRef>> {
        let mut hops = Vec::new();
        let mut current = target.clone();
        for _ in 0..MAX_REFERENCE_DEPTH {
            let location = self
                .location(&current)
                .ok_or_else(|| ExecutionError::SlotNotFound {
                    slot: current.slot.clone(),
                })?;
            let value_type = location.value_type();
            if !value_type.accepts(value) {
                return Err(ExecutionError::TypeMismatch {
                    slot: current.slot.clone(),
                    expected: value_type,
                    actual: value.to_string(),
                });
            }
            let next = match location {
                Location::Value(_) => None,
                Location::Reference(r) => Some(r.target.clone()),
            };
            hops.push(current);
            match next {
                Some(next) => current = next,
                None => return Ok(hops),
            }
        }
        Err(ExecutionError::SlotNotFound {
            slot: target.slot.clone(),
        })
    }

    /// Refresh every buffered reference in `env` from its target.
    pub fn collapse_references(&mut self, env: InstanceId) -> Result<()> {
        let pending: Vec<(String, LocationRef)> = match self.scopes.get(&env) {
            Some(environment) => environment
                .slots
                .iter()
                .filter_map(|(name, location)| match location {
                    Location::Reference(r) if r.buffered.is_some() => {
                        Some((name.clone(), r.target.clone()))
                    }
                    _ => None,
                })
                .collect(),
            None => return Ok(()),
        };

        for (name, target) in pending {
            let value = self.read_at(&target)?;
            let slot = LocationRef {
                environment: env,
                slot: name,
            };
            if let Some(Location::Reference(r)) = self.location_mut(&slot) {
                r.buffered = Some(value);
            }
        }
        Ok(())
    }

    /// Snapshot of every value visible from `env`, nearest scope winning.
    pub fn visible_values(&self, env: Option<InstanceId>) -> IndexMap<String, Value> {
        let mut values = IndexMap::new();
        let mut current = env;
        while let Some(id) = current {
            let Some(environment) = self.scopes.get(&id) else {
                break;
            };
            for name in environment.slots.keys() {
                if values.contains_key(name) {
                    continue;
                }
                let at = LocationRef {
                    environment: id,
                    slot: name.clone(),
                };
                if let Ok(value) = self.read_at(&at) {
                    values.insert(name.clone(), value);
                }
            }
            current = environment.parent;
        }
        values
    }

    pub fn lookup(&self, env: Option<InstanceId>) -> EnvironmentLookup<'_> {
        EnvironmentLookup {
            environments: self,
            env,
        }
    }
}

/// Borrowed view used for synchronous expression evaluation.
pub struct EnvironmentLookup<'a> {
    environments: &'a Environments,
    env: Option<InstanceId>,
}

impl SymbolLookup for EnvironmentLookup<'_> {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.environments.get_for_read(self.env, name).ok()
    }
}
