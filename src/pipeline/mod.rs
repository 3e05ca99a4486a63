//! The resolution pipeline seam
//!
//! The coordinator decides *when* syntax trees are built and symbols are
//! resolved; a [`ResolutionPipeline`] decides *how*. A pass calls the three
//! stages in order:
//!
//! ```text
//! build_syntax_tree (per module) ──> resolve_declarations (project) ──> resolve_references
//! ```
//!
//! `build_syntax_tree` may be called from several threads at once when
//! parallel syntax building is enabled.

pub mod line_scan;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::declarations::DeclarationIndexBuilder;
use crate::error::{ResolutionError, SyntaxError};
use crate::project::{ModuleId, SourceModule};

pub use line_scan::{LineScanPipeline, ScannedModule};

/// External collaborator that turns sources into a declaration index
pub trait ResolutionPipeline: Send + Sync + 'static {
    /// Syntax tree produced for one module
    type Tree: Send + Sync + 'static;

    fn build_syntax_tree(&self, module: &SourceModule) -> Result<Self::Tree, SyntaxError>;

    /// Collect declarations across the whole project
    fn resolve_declarations(
        &self,
        project: &ProjectSyntax<Self::Tree>,
    ) -> Result<DeclarationIndexBuilder, ResolutionError>;

    /// Link identifier references to the declarations collected before
    fn resolve_references(
        &self,
        declarations: DeclarationIndexBuilder,
        project: &ProjectSyntax<Self::Tree>,
    ) -> Result<DeclarationIndexBuilder, ResolutionError>;
}

/// Syntax trees of every module taking part in resolution
#[derive(Debug)]
pub struct ProjectSyntax<T> {
    trees: BTreeMap<ModuleId, Arc<T>>,
}

impl<T> ProjectSyntax<T> {
    pub fn new(trees: BTreeMap<ModuleId, Arc<T>>) -> Self {
        Self { trees }
    }

    pub fn get(&self, module: &ModuleId) -> Option<&T> {
        self.trees.get(module).map(|t| t.as_ref())
    }

    /// Trees in module-name order
    pub fn iter(&self) -> impl Iterator<Item = (&ModuleId, &T)> {
        self.trees.iter().map(|(id, tree)| (id, tree.as_ref()))
    }

    pub fn modules(&self) -> impl Iterator<Item = &ModuleId> {
        self.trees.keys()
    }

    pub fn len(&self) -> usize {
        self.trees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }
}

impl<T> Default for ProjectSyntax<T> {
    fn default() -> Self {
        Self {
            trees: BTreeMap::new(),
        }
    }
}
