//! Immutable declaration index published by each completed parse pass
//!
//! A [`DeclarationIndex`] maps qualified names to [`Declaration`]s and each
//! declaration to the ordered list of places it is referenced. Once built it
//! is never mutated: a new pass builds a new index through
//! [`DeclarationIndexBuilder`] and the coordinator swaps it in atomically.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::project::ModuleId;

/// Fully qualified symbol name: `Module`, `Module.Member` or
/// `Module.Procedure.Local`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QualifiedName {
    pub module: ModuleId,
    pub path: Vec<String>,
}

impl QualifiedName {
    pub fn module(module: ModuleId) -> Self {
        Self {
            module,
            path: Vec::new(),
        }
    }

    pub fn member(module: ModuleId, member: impl Into<String>) -> Self {
        Self {
            module,
            path: vec![member.into()],
        }
    }

    /// Name nested under this one (e.g. a local inside a procedure)
    pub fn child(&self, name: impl Into<String>) -> Self {
        let mut path = self.path.clone();
        path.push(name.into());
        Self {
            module: self.module.clone(),
            path,
        }
    }

    /// Unqualified identifier (last path segment, or the module name)
    pub fn identifier(&self) -> &str {
        self.path
            .last()
            .map(String::as_str)
            .unwrap_or_else(|| self.module.as_str())
    }

    /// Parse `Module.Member.Local` notation
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('.').filter(|p| !p.is_empty());
        let module = ModuleId::new(parts.next()?);
        Some(Self {
            module,
            path: parts.map(str::to_string).collect(),
        })
    }
}

impl std::fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.module)?;
        for segment in &self.path {
            write!(f, ".{}", segment)?;
        }
        Ok(())
    }
}

/// Kind of declared symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclarationKind {
    Module,
    Procedure,
    Function,
    PropertyGet,
    PropertyLet,
    PropertySet,
    Variable,
    Constant,
    Parameter,
    UserDefinedType,
    Enumeration,
    EnumerationMember,
}

impl DeclarationKind {
    pub fn is_member(&self) -> bool {
        !matches!(self, Self::Module | Self::Parameter)
    }

    pub fn is_procedure(&self) -> bool {
        matches!(
            self,
            Self::Procedure
                | Self::Function
                | Self::PropertyGet
                | Self::PropertyLet
                | Self::PropertySet
        )
    }
}

/// Member visibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accessibility {
    Public,
    Private,
    /// Procedure-scoped (locals and parameters)
    Local,
}

/// A named symbol discovered during resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Declaration {
    pub name: QualifiedName,
    pub kind: DeclarationKind,
    pub accessibility: Accessibility,
    /// 1-based source line
    pub line: usize,
}

impl Declaration {
    pub fn identifier(&self) -> &str {
        self.name.identifier()
    }

    pub fn module(&self) -> &ModuleId {
        &self.name.module
    }
}

/// One occurrence of an identifier that resolves to a declaration
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentifierReference {
    pub module: ModuleId,
    /// 1-based line and column
    pub line: usize,
    pub column: usize,
    pub identifier: String,
    /// Procedure the reference sits in, if any
    pub scope: Option<String>,
}

/// Immutable snapshot of all declarations and references of a project
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeclarationIndex {
    generation: u64,
    declarations: BTreeMap<QualifiedName, Declaration>,
    references: BTreeMap<QualifiedName, Vec<IdentifierReference>>,
}

impl DeclarationIndex {
    /// Empty index handed out before the first pass completes
    pub fn empty() -> Self {
        Self::default()
    }

    /// Pass number that produced this index (0 = never parsed)
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.declarations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }

    pub fn get(&self, name: &QualifiedName) -> Option<&Declaration> {
        self.declarations.get(name)
    }

    pub fn declarations(&self) -> impl Iterator<Item = &Declaration> {
        self.declarations.values()
    }

    pub fn declarations_in<'a>(
        &'a self,
        module: &'a ModuleId,
    ) -> impl Iterator<Item = &'a Declaration> + 'a {
        self.declarations
            .values()
            .filter(move |d| &d.name.module == module)
    }

    /// Declarations whose unqualified identifier matches (case-insensitive)
    pub fn find_by_identifier<'a>(
        &'a self,
        identifier: &'a str,
    ) -> impl Iterator<Item = &'a Declaration> + 'a {
        self.declarations
            .values()
            .filter(move |d| d.identifier().eq_ignore_ascii_case(identifier))
    }

    /// References to a declaration, in source order
    pub fn references_to(&self, name: &QualifiedName) -> &[IdentifierReference] {
        self.references
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn reference_count(&self) -> usize {
        self.references.values().map(Vec::len).sum()
    }

    /// Modules that have a module declaration in this index
    pub fn modules(&self) -> impl Iterator<Item = &ModuleId> {
        self.declarations
            .values()
            .filter(|d| d.kind == DeclarationKind::Module)
            .map(|d| &d.name.module)
    }

    /// Compare symbol content, ignoring the generation
    pub fn same_symbols(&self, other: &DeclarationIndex) -> bool {
        self.declarations == other.declarations && self.references == other.references
    }
}

/// Mutable, partially resolved index passed between pipeline stages
#[derive(Debug, Clone, Default)]
pub struct DeclarationIndexBuilder {
    declarations: BTreeMap<QualifiedName, Declaration>,
    references: BTreeMap<QualifiedName, Vec<IdentifierReference>>,
}

impl DeclarationIndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a declaration. Returns the previous one with the same name.
    pub fn declare(&mut self, declaration: Declaration) -> Option<Declaration> {
        self.declarations
            .insert(declaration.name.clone(), declaration)
    }

    pub fn contains(&self, name: &QualifiedName) -> bool {
        self.declarations.contains_key(name)
    }

    pub fn get(&self, name: &QualifiedName) -> Option<&Declaration> {
        self.declarations.get(name)
    }

    pub fn declarations(&self) -> impl Iterator<Item = &Declaration> {
        self.declarations.values()
    }

    /// Record a reference. Returns false if the target is not declared.
    pub fn add_reference(&mut self, target: &QualifiedName, reference: IdentifierReference) -> bool {
        if !self.declarations.contains_key(target) {
            return false;
        }
        self.references
            .entry(target.clone())
            .or_default()
            .push(reference);
        true
    }

    pub fn len(&self) -> usize {
        self.declarations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }

    /// Freeze into an index stamped with the producing pass's generation
    pub fn build(mut self, generation: u64) -> DeclarationIndex {
        for refs in self.references.values_mut() {
            refs.sort();
        }
        DeclarationIndex {
            generation,
            declarations: self.declarations,
            references: self.references,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
