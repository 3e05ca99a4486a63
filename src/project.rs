//! Project modules and where their source text comes from
//!
//! A parse pass starts by asking a [`ModuleProvider`] for the current module
//! set. Two providers ship with the crate:
//!
//! - [`InMemoryProject`] - editable in-memory sources (tests, refactorings
//!   that rewrite text inside a suspension)
//! - [`DirectoryProject`] - `.bas`/`.cls`/`.frm` files under a directory

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ignore::WalkBuilder;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{ParserStateError, Result};

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// Stable content hash used to detect unchanged modules
pub fn content_hash(data: &str) -> u64 {
    let mut hash = FNV_OFFSET;
    for byte in data.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Name of a module within a project
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleId(String);

impl ModuleId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Module id for a source file (its file stem)
    pub fn from_path(path: &Path) -> Option<Self> {
        path.file_stem()
            .and_then(|s| s.to_str())
            .map(|s| Self(s.to_string()))
    }
}

impl std::fmt::Display for ModuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModuleId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Kind of source module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    Standard,
    Class,
    Form,
}

impl ModuleKind {
    /// Determine the kind from a file extension
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "bas" => Some(Self::Standard),
            "cls" => Some(Self::Class),
            "frm" => Some(Self::Form),
            _ => None,
        }
    }
}

/// One module's source text at the moment a pass started
#[derive(Debug, Clone)]
pub struct SourceModule {
    pub id: ModuleId,
    pub kind: ModuleKind,
    pub text: Arc<str>,
}

impl SourceModule {
    pub fn new(id: impl Into<ModuleId>, kind: ModuleKind, text: impl Into<Arc<str>>) -> Self {
        Self {
            id: id.into(),
            kind,
            text: text.into(),
        }
    }

    pub fn content_hash(&self) -> u64 {
        content_hash(&self.text)
    }
}

/// Source of the module set parsed by each pass
pub trait ModuleProvider: Send + Sync {
    /// Current modules, in a deterministic order
    fn modules(&self) -> Result<Vec<SourceModule>>;
}

/// Thread-safe, editable in-memory project
#[derive(Debug, Clone, Default)]
pub struct InMemoryProject {
    modules: Arc<RwLock<BTreeMap<ModuleId, SourceModule>>>,
}

impl InMemoryProject {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style helper for a standard module
    pub fn with_module(self, name: &str, text: &str) -> Self {
        self.set_module(SourceModule::new(name, ModuleKind::Standard, text));
        self
    }

    /// Insert or replace a module
    pub fn set_module(&self, module: SourceModule) {
        self.modules.write().insert(module.id.clone(), module);
    }

    /// Replace a module's text, keeping its kind. Returns false if unknown.
    pub fn set_text(&self, id: &ModuleId, text: &str) -> bool {
        let mut modules = self.modules.write();
        match modules.get_mut(id) {
            Some(module) => {
                module.text = Arc::from(text);
                true
            }
            None => false,
        }
    }

    pub fn remove_module(&self, id: &ModuleId) -> Option<SourceModule> {
        self.modules.write().remove(id)
    }

    pub fn source(&self, id: &ModuleId) -> Option<Arc<str>> {
        self.modules.read().get(id).map(|m| Arc::clone(&m.text))
    }

    pub fn len(&self) -> usize {
        self.modules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.read().is_empty()
    }
}

impl ModuleProvider for InMemoryProject {
    fn modules(&self) -> Result<Vec<SourceModule>> {
        Ok(self.modules.read().values().cloned().collect())
    }
}

/// Project backed by source files under a directory
#[derive(Debug, Clone)]
pub struct DirectoryProject {
    root: PathBuf,
    extensions: Vec<String>,
    max_depth: usize,
}

impl DirectoryProject {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            extensions: default_extensions(),
            max_depth: 10,
        }
    }

    /// Restrict the file extensions considered module sources
    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        if !extensions.is_empty() {
            self.extensions = extensions
                .into_iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect();
        }
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    /// Whether a path is one of this project's module sources
    pub fn is_module_path(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
            .unwrap_or(false)
    }

    fn collect_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = WalkBuilder::new(&self.root)
            .max_depth(Some(self.max_depth))
            .hidden(true)
            .git_ignore(true)
            .build()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|entry| entry.into_path())
            .filter(|path| self.is_module_path(path))
            .collect();
        paths.sort();
        paths
    }
}

impl ModuleProvider for DirectoryProject {
    fn modules(&self) -> Result<Vec<SourceModule>> {
        if !self.root.is_dir() {
            return Err(ParserStateError::ModuleSource {
                message: format!("{} is not a directory", self.root.display()),
            });
        }

        let mut modules = BTreeMap::new();
        for path in self.collect_paths() {
            let Some(id) = ModuleId::from_path(&path) else {
                continue;
            };
            let kind = path
                .extension()
                .and_then(|e| e.to_str())
                .and_then(ModuleKind::from_extension)
                .unwrap_or(ModuleKind::Standard);

            let text = match fs::read_to_string(&path) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!("[PROJECT] Skipping {}: {}", path.display(), e);
                    continue;
                }
            };

            if modules.contains_key(&id) {
                tracing::warn!(
                    "[PROJECT] Duplicate module name {} at {}, keeping the first",
                    id,
                    path.display()
                );
                continue;
            }
            modules.insert(id.clone(), SourceModule::new(id, kind, text));
        }

        Ok(modules.into_values().collect())
    }
}

/// Module source extensions picked up when none are configured
pub fn default_extensions() -> Vec<String> {
    vec!["bas".to_string(), "cls".to_string(), "frm".to_string()]
}

// ============================================================================
// Tests
// ============================================================================
