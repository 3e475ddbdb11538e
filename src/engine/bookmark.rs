// ABOUTME: Bookmarks, bookmark scopes and exclusive handles
// ABOUTME: Name-addressable resumption points and the per-resource exclusivity bookkeeping

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use super::error::{ExecutionError, Result};
use super::instance::InstanceId;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BookmarkScope {
    #[default]
    Default,
    Named(Uuid),
}

impl BookmarkScope {
    pub fn new_named() -> Self {
        BookmarkScope::Named(Uuid::new_v4())
    }
}

impl fmt::Display for BookmarkScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BookmarkScope::Default => write!(f, "default"),
            BookmarkScope::Named(id) => write!(f, "{}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bookmark {
    pub name: String,
    #[serde(default)]
    pub scope: BookmarkScope,
}

impl Bookmark {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            scope: BookmarkScope::Default,
        }
    }

    pub fn in_scope(name: &str, scope: BookmarkScope) -> Self {
        Self {
            name: name.to_string(),
            scope,
        }
    }
}

impl fmt::Display for Bookmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            BookmarkScope::Default => write!(f, "{}", self.name),
            scope => write!(f, "{}@{}", self.name, scope),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookmarkOptions {
    /// Blocking bookmarks keep their owner busy until purged.
    pub blocking: bool,
    /// Stays registered after being resumed.
    pub multiple_resume: bool,
}

impl Default for BookmarkOptions {
    fn default() -> Self {
        Self {
            blocking: true,
            multiple_resume: false,
        }
    }
}

impl BookmarkOptions {
    pub fn non_blocking() -> Self {
        Self {
            blocking: false,
            multiple_resume: false,
        }
    }

    pub fn multiple_resume(mut self) -> Self {
        self.multiple_resume = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookmarkRecord {
    pub bookmark: Bookmark,
    pub owner: InstanceId,
    pub callback: String,
    pub options: BookmarkOptions,
    #[serde(default)]
    pub handle: Option<HandleId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookmarkResumptionResult {
    Success,
    NotFound,
    NotReady,
}

impl fmt::Display for BookmarkResumptionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BookmarkResumptionResult::Success => write!(f, "Success"),
            BookmarkResumptionResult::NotFound => write!(f, "NotFound"),
            BookmarkResumptionResult::NotReady => write!(f, "NotReady"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BookmarkManager {
    records: IndexMap<Bookmark, BookmarkRecord>,
}

impl BookmarkManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, record: BookmarkRecord) -> Result<()> {
        if self.records.contains_key(&record.bookmark) {
            return Err(ExecutionError::DuplicateBookmark {
                name: record.bookmark.to_string(),
            });
        }
        self.records.insert(record.bookmark.clone(), record);
        Ok(())
    }

    pub fn get(&self, bookmark: &Bookmark) -> Option<&BookmarkRecord> {
        self.records.get(bookmark)
    }

    pub fn remove(&mut self, bookmark: &Bookmark) -> Option<BookmarkRecord> {
        self.records.shift_remove(bookmark)
    }

    pub fn owned_by(&self, owner: InstanceId) -> Vec<Bookmark> {
        self.records
            .values()
            .filter(|r| r.owner == owner)
            .map(|r| r.bookmark.clone())
            .collect()
    }

    pub fn records(&self) -> impl Iterator<Item = &BookmarkRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Detach every bookmark from a handle that is going away.
    pub fn clear_handle(&mut self, handle: HandleId) {
        for record in self.records.values_mut() {
            if record.handle == Some(handle) {
                record.handle = None;
            }
        }
    }

    pub fn clear(&mut self) -> Vec<BookmarkRecord> {
        self.records.drain(..).map(|(_, r)| r).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleId(pub u64);

/// Groups bookmarks that guard one resource so that at most one outstanding
/// operation on it can proceed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExclusiveHandle {
    pub id: HandleId,
    pub owner: InstanceId,
    pub property_name: String,
    pub visible_scopes: Vec<BookmarkScope>,
    pub important: Vec<Bookmark>,
    pub unimportant: Vec<Bookmark>,
}

impl ExclusiveHandle {
    pub fn can_see(&self, scope: &BookmarkScope) -> bool {
        self.visible_scopes.contains(scope)
    }

    pub fn contains(&self, bookmark: &Bookmark) -> bool {
        self.important.contains(bookmark) || self.unimportant.contains(bookmark)
    }

    pub fn add(&mut self, bookmark: Bookmark, important: bool) -> Result<()> {
        if self.contains(&bookmark) {
            return Err(ExecutionError::DuplicateBookmark {
                name: bookmark.to_string(),
            });
        }
        if important {
            self.important.push(bookmark);
        } else {
            self.unimportant.push(bookmark);
        }
        Ok(())
    }

    pub fn forget(&mut self, bookmark: &Bookmark) {
        self.important.retain(|b| b != bookmark);
        self.unimportant.retain(|b| b != bookmark);
    }

    /// Record that `bookmark` was resumed. Returns the siblings that lose the
    /// race and must be purged: everything else on the handle when the resumed
    /// bookmark is important, nothing otherwise.
    pub fn settle(&mut self, bookmark: &Bookmark) -> Vec<Bookmark> {
        let important = self.important.contains(bookmark);
        self.forget(bookmark);
        if !important {
            return Vec::new();
        }
        let mut losers: Vec<Bookmark> = self.important.drain(..).collect();
        losers.extend(self.unimportant.drain(..));
        losers
    }

    pub fn is_empty(&self) -> bool {
        self.important.is_empty() && self.unimportant.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExclusiveHandles {
    handles: BTreeMap<HandleId, ExclusiveHandle>,
    next_id: u64,
}

impl ExclusiveHandles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &mut self,
        owner: InstanceId,
        property_name: &str,
        visible_scopes: Vec<BookmarkScope>,
    ) -> HandleId {
        self.next_id += 1;
        let id = HandleId(self.next_id);
        self.handles.insert(
            id,
            ExclusiveHandle {
                id,
                owner,
                property_name: property_name.to_string(),
                visible_scopes,
                important: Vec::new(),
                unimportant: Vec::new(),
            },
        );
        id
    }

    pub fn get(&self, id: HandleId) -> Option<&ExclusiveHandle> {
        self.handles.get(&id)
    }

    pub fn get_mut(&mut self, id: HandleId) -> Option<&mut ExclusiveHandle> {
        self.handles.get_mut(&id)
    }

    pub fn remove(&mut self, id: HandleId) -> Option<ExclusiveHandle> {
        self.handles.remove(&id)
    }

    pub fn owned_by(&self, owner: InstanceId) -> Vec<HandleId> {
        self.handles
            .values()
            .filter(|h| h.owner == owner)
            .map(|h| h.id)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExclusiveHandle> {
        self.handles.values()
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn restore(handles: Vec<ExclusiveHandle>, next_id: u64) -> Self {
        Self {
            handles: handles.into_iter().map(|h| (h.id, h)).collect(),
            next_id,
        }
    }

    /// Drop `bookmark` from every handle.
    pub fn forget(&mut self, bookmark: &Bookmark) {
        for handle in self.handles.values_mut() {
            handle.forget(bookmark);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, owner: u64) -> BookmarkRecord {
        BookmarkRecord {
            bookmark: Bookmark::new(name),
            owner: InstanceId(owner),
            callback: "resumed".to_string(),
            options: BookmarkOptions::default(),
            handle: None,
        }
    }

    #[test]
    fn test_duplicate_bookmark_rejected() {
        let mut manager = BookmarkManager::new();
        manager.register(record("approve", 1)).unwrap();
        assert!(matches!(
            manager.register(record("approve", 2)),
            Err(ExecutionError::DuplicateBookmark { .. })
        ));
    }

    #[test]
    fn test_same_name_in_different_scopes() {
        let mut manager = BookmarkManager::new();
        manager.register(record("approve", 1)).unwrap();
        let mut scoped = record("approve", 2);
        scoped.bookmark.scope = BookmarkScope::new_named();
        manager.register(scoped).unwrap();
        assert_eq!(manager.len(), 2);
        assert_eq!(manager.owned_by(InstanceId(2)).len(), 1);
    }

    #[test]
    fn test_important_resumption_purges_siblings() {
        let mut handles = ExclusiveHandles::new();
        let id = handles.create(InstanceId(1), "lock", vec![BookmarkScope::Default]);
        let handle = handles.get_mut(id).unwrap();
        handle.add(Bookmark::new("commit"), true).unwrap();
        handle.add(Bookmark::new("poll"), false).unwrap();
        handle.add(Bookmark::new("retry"), false).unwrap();

        let losers = handle.settle(&Bookmark::new("commit"));
        assert_eq!(losers.len(), 2);
        assert!(handle.is_empty());
    }

    #[test]
    fn test_unimportant_resumption_only_removes_itself() {
        let mut handles = ExclusiveHandles::new();
        let id = handles.create(InstanceId(1), "lock", vec![BookmarkScope::Default]);
        let handle = handles.get_mut(id).unwrap();
        handle.add(Bookmark::new("commit"), true).unwrap();
        handle.add(Bookmark::new("poll"), false).unwrap();

        let losers = handle.settle(&Bookmark::new("poll"));
        assert!(losers.is_empty());
        assert!(handle.contains(&Bookmark::new("commit")));
        assert!(!handle.contains(&Bookmark::new("poll")));
    }

    #[test]
    fn test_scope_visibility() {
        let mut handles = ExclusiveHandles::new();
        let scope = BookmarkScope::new_named();
        let id = handles.create(InstanceId(1), "lock", vec![BookmarkScope::Default]);
        assert!(handles.get(id).unwrap().can_see(&BookmarkScope::Default));
        assert!(!handles.get(id).unwrap().can_see(&scope));
    }
}
