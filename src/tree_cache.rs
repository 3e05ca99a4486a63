//! Last-good syntax trees, keyed by module
//!
//! A tree is reused when the module's source hash matches the hash it was
//! built from. A module that fails to build keeps its previous entry, so
//! resolution can still see the last version that parsed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use crate::project::{ModuleId, SourceModule};

/// One cached tree with the hash of the source it came from
#[derive(Debug)]
pub struct CachedTree<T> {
    pub hash: u64,
    pub tree: Arc<T>,
    pub built_at: Instant,
}

impl<T> Clone for CachedTree<T> {
    fn clone(&self) -> Self {
        Self {
            hash: self.hash,
            tree: Arc::clone(&self.tree),
            built_at: self.built_at,
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeCacheStats {
    pub entries: usize,
    /// Entries whose hash no longer matches the latest source seen
    pub stale: usize,
}

/// Syntax-tree cache shared by parse passes
#[derive(Debug)]
pub struct TreeCache<T> {
    trees: RwLock<BTreeMap<ModuleId, CachedTree<T>>>,
}

impl<T> TreeCache<T> {
    pub fn new() -> Self {
        Self {
            trees: RwLock::new(BTreeMap::new()),
        }
    }

    /// Tree for this exact source, if one was built from it
    pub fn fresh(&self, module: &SourceModule) -> Option<Arc<T>> {
        let hash = module.content_hash();
        self.trees
            .read()
            .get(&module.id)
            .filter(|cached| cached.hash == hash)
            .map(|cached| Arc::clone(&cached.tree))
    }

    /// Last tree built for the module, regardless of source hash
    pub fn last_good(&self, module: &ModuleId) -> Option<Arc<T>> {
        self.trees
            .read()
            .get(module)
            .map(|cached| Arc::clone(&cached.tree))
    }

    pub fn insert(&self, module: ModuleId, hash: u64, tree: Arc<T>) {
        self.trees.write().insert(
            module,
            CachedTree {
                hash,
                tree,
                built_at: Instant::now(),
            },
        );
    }

    /// Drop entries for modules that are no longer in the project
    pub fn retain_modules(&self, present: &BTreeSet<ModuleId>) -> usize {
        let mut trees = self.trees.write();
        let before = trees.len();
        trees.retain(|id, _| present.contains(id));
        before - trees.len()
    }

    pub fn contains(&self, module: &ModuleId) -> bool {
        self.trees.read().contains_key(module)
    }

    pub fn len(&self) -> usize {
        self.trees.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.trees.read().is_empty()
    }

    pub fn stats(&self, modules: &[SourceModule]) -> TreeCacheStats {
        let trees = self.trees.read();
        let stale = modules
            .iter()
            .filter(|m| {
                trees
                    .get(&m.id)
                    .is_some_and(|cached| cached.hash != m.content_hash())
            })
            .count();
        TreeCacheStats {
            entries: trees.len(),
            stale,
        }
    }

    pub fn clear(&self) {
        self.trees.write().clear();
    }
}

impl<T> Default for TreeCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
