//! Line-oriented reference pipeline for VBA-style modules
//!
//! This is not a grammar. It recognizes block structure and declarations
//! line by line with regular expressions, which is enough to drive the
//! coordinator end to end:
//!
//! - declarations: `Sub`, `Function`, `Property Get/Let/Set`, module fields
//!   (`Dim/Private/Public/Global`), `Const`, `Type`, `Enum` (with members),
//!   procedure locals and parameters
//! - syntax errors: unterminated, mismatched or nested blocks
//! - resolution errors: two members with the same name in one module
//! - references: identifiers inside procedure bodies, resolved local →
//!   module member → module name → unique public member elsewhere, plus
//!   `Module.Member` qualified access

use std::collections::{BTreeMap, HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;

use super::{ProjectSyntax, ResolutionPipeline};
use crate::declarations::{
    Accessibility, Declaration, DeclarationIndexBuilder, DeclarationKind, IdentifierReference,
    QualifiedName,
};
use crate::error::{ResolutionError, SyntaxError};
use crate::project::{ModuleId, ModuleKind, SourceModule};

static PROC_START: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*(?:(public|private|friend|global)\s+)?(?:static\s+)?(sub|function|property\s+get|property\s+let|property\s+set)\s+([\p{L}_]\w*)\s*(?:\((.*)\))?",
    )
    .expect("static pattern")
});
static PROC_END: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*end\s+(sub|function|property)\b").expect("static pattern"));
static TYPE_START: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(?:(public|private)\s+)?(type|enum)\s+([\p{L}_]\w*)\s*$")
        .expect("static pattern")
});
static TYPE_END: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*end\s+(type|enum)\b").expect("static pattern"));
static CONST_DECL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(?:(public|private|global)\s+)?const\s+([\p{L}_]\w*)")
        .expect("static pattern")
});
static VAR_DECL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(dim|public|private|global|static)\s+(?:withevents\s+)?(.+)$")
        .expect("static pattern")
});
static LEADING_IDENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(?:(?:byval|byref|optional|paramarray)\s+)*([\p{L}_]\w*)")
        .expect("static pattern")
});
static IDENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b[\p{L}_]\w*\b").expect("static pattern"));

const KEYWORDS: &[&str] = &[
    "and", "as", "boolean", "byref", "byte", "byval", "call", "case", "const", "currency",
    "date", "debug", "dim", "do", "double", "each", "else", "elseif", "empty", "end", "enum",
    "exit", "false", "for", "function", "get", "global", "goto", "if", "in", "integer", "is",
    "let", "long", "loop", "me", "mod", "new", "next", "not", "nothing", "null", "object", "on",
    "optional", "or", "paramarray", "print", "private", "property", "public", "redim", "resume",
    "select", "set", "single", "static", "step", "stop", "string", "sub", "then", "to", "true",
    "type", "until", "variant", "wend", "while", "with", "xor",
];

/// Member declared at module level
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedMember {
    pub name: String,
    pub kind: DeclarationKind,
    pub accessibility: Accessibility,
    pub line: usize,
    /// Enum members, for `Enum` blocks
    pub children: Vec<(String, usize)>,
}

/// Procedure with its parameters and locals
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedProcedure {
    pub name: String,
    pub kind: DeclarationKind,
    pub accessibility: Accessibility,
    pub line: usize,
    pub end_line: usize,
    pub parameters: Vec<(String, usize)>,
    pub locals: Vec<(String, usize)>,
}

impl ScannedProcedure {
    /// Name of the local scope holding parameters and locals
    ///
    /// `Property Let`/`Set` accessors share their name with the `Get`, so
    /// their scopes carry the accessor, e.g. `Name(Let)`.
    pub fn scope(&self) -> String {
        match self.kind {
            DeclarationKind::PropertyLet => format!("{}(Let)", self.name),
            DeclarationKind::PropertySet => format!("{}(Set)", self.name),
            _ => self.name.clone(),
        }
    }
}

/// Identifier occurrence inside a procedure body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedToken {
    pub identifier: String,
    /// Identifier before a `.`, e.g. `Module1` in `Module1.Foo`
    pub qualifier: Option<String>,
    pub line: usize,
    pub column: usize,
    /// Local scope of the enclosing procedure, see [`ScannedProcedure::scope`]
    pub procedure: String,
}

/// Syntax tree produced by [`LineScanPipeline`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedModule {
    pub module: ModuleId,
    pub kind: ModuleKind,
    pub members: Vec<ScannedMember>,
    pub procedures: Vec<ScannedProcedure>,
    pub tokens: Vec<ScannedToken>,
}

/// Regex-based pipeline used by the CLI and the tests
#[derive(Debug, Clone, Default)]
pub struct LineScanPipeline;

impl LineScanPipeline {
    pub fn new() -> Self {
        Self
    }

    /// Scan one module into declarations and identifier tokens
    pub fn scan(&self, module: &SourceModule) -> Result<ScannedModule, SyntaxError> {
        let mut scanned = ScannedModule {
            module: module.id.clone(),
            kind: module.kind,
            members: Vec::new(),
            procedures: Vec::new(),
            tokens: Vec::new(),
        };

        let mut open_proc: Option<(ScannedProcedure, String)> = None;
        let mut open_type: Option<(ScannedMember, String)> = None;

        for (idx, raw) in module.text.lines().enumerate() {
            let line_no = idx + 1;
            let line = strip_comment(raw);
            if line.trim().is_empty() || is_directive(&line) {
                continue;
            }

            if let Some(caps) = PROC_END.captures(&line) {
                let keyword = caps[1].to_ascii_lowercase();
                match open_proc.take() {
                    Some((mut proc, opened_with)) if opened_with == keyword => {
                        proc.end_line = line_no;
                        scanned.procedures.push(proc);
                    }
                    Some((proc, opened_with)) => {
                        return Err(SyntaxError::at_line(
                            module.id.clone(),
                            line_no,
                            format!(
                                "'End {}' does not close {} {} opened at line {}",
                                capitalize(&keyword),
                                capitalize(&opened_with),
                                proc.name,
                                proc.line
                            ),
                        ));
                    }
                    None => {
                        return Err(SyntaxError::at_line(
                            module.id.clone(),
                            line_no,
                            format!("'End {}' without an open block", capitalize(&keyword)),
                        ));
                    }
                }
                continue;
            }

            if let Some(caps) = PROC_START.captures(&line) {
                if let Some((proc, _)) = &open_proc {
                    return Err(SyntaxError::at_line(
                        module.id.clone(),
                        line_no,
                        format!("Procedure nested inside {} (line {})", proc.name, proc.line),
                    ));
                }
                if open_type.is_some() {
                    return Err(SyntaxError::at_line(
                        module.id.clone(),
                        line_no,
                        "Procedure declared inside a Type or Enum block",
                    ));
                }
                let keyword = caps[2].to_ascii_lowercase();
                let kind = procedure_kind(&keyword);
                let parameters = caps
                    .get(4)
                    .map(|m| parse_parameters(m.as_str(), line_no))
                    .unwrap_or_default();
                let proc = ScannedProcedure {
                    name: caps[3].to_string(),
                    kind,
                    accessibility: accessibility(caps.get(1).map(|m| m.as_str()), true),
                    line: line_no,
                    end_line: line_no,
                    parameters,
                    locals: Vec::new(),
                };
                let opened_with = keyword
                    .split_whitespace()
                    .next()
                    .unwrap_or_default()
                    .to_string();
                open_proc = Some((proc, opened_with));
                continue;
            }

            if let Some((proc, _)) = open_proc.as_mut() {
                let declared = if let Some(caps) = CONST_DECL.captures(&line) {
                    vec![caps[2].to_string()]
                } else if let Some(caps) = VAR_DECL.captures(&line) {
                    declared_names(&caps[2])
                } else {
                    Vec::new()
                };
                for name in &declared {
                    proc.locals.push((name.clone(), line_no));
                }
                scan_tokens(&line, line_no, &proc.scope(), &declared, &mut scanned.tokens);
                continue;
            }

            if let Some(caps) = TYPE_END.captures(&line) {
                let keyword = caps[1].to_ascii_lowercase();
                match open_type.take() {
                    Some((member, opened_with)) if opened_with == keyword => {
                        scanned.members.push(member);
                    }
                    _ => {
                        return Err(SyntaxError::at_line(
                            module.id.clone(),
                            line_no,
                            format!("'End {}' without an open block", capitalize(&keyword)),
                        ));
                    }
                }
                continue;
            }

            if let Some((member, _)) = open_type.as_mut() {
                if member.kind == DeclarationKind::Enumeration {
                    if let Some(caps) = LEADING_IDENT.captures(&line) {
                        member.children.push((caps[1].to_string(), line_no));
                    }
                }
                continue;
            }

            if let Some(caps) = TYPE_START.captures(&line) {
                let keyword = caps[2].to_ascii_lowercase();
                let kind = if keyword == "enum" {
                    DeclarationKind::Enumeration
                } else {
                    DeclarationKind::UserDefinedType
                };
                let member = ScannedMember {
                    name: caps[3].to_string(),
                    kind,
                    accessibility: accessibility(caps.get(1).map(|m| m.as_str()), true),
                    line: line_no,
                    children: Vec::new(),
                };
                open_type = Some((member, keyword));
                continue;
            }

            if let Some(caps) = CONST_DECL.captures(&line) {
                scanned.members.push(ScannedMember {
                    name: caps[2].to_string(),
                    kind: DeclarationKind::Constant,
                    accessibility: accessibility(caps.get(1).map(|m| m.as_str()), false),
                    line: line_no,
                    children: Vec::new(),
                });
                continue;
            }

            if let Some(caps) = VAR_DECL.captures(&line) {
                let keyword = caps[1].to_ascii_lowercase();
                if caps[2].trim_start().to_ascii_lowercase().starts_with("declare ") {
                    continue;
                }
                let access = match keyword.as_str() {
                    "public" | "global" => Accessibility::Public,
                    _ => Accessibility::Private,
                };
                for name in declared_names(&caps[2]) {
                    scanned.members.push(ScannedMember {
                        name,
                        kind: DeclarationKind::Variable,
                        accessibility: access,
                        line: line_no,
                        children: Vec::new(),
                    });
                }
            }
        }

        if let Some((proc, opened_with)) = open_proc {
            return Err(SyntaxError::at_line(
                module.id.clone(),
                proc.line,
                format!("Missing 'End {}' for {}", capitalize(&opened_with), proc.name),
            ));
        }
        if let Some((member, opened_with)) = open_type {
            return Err(SyntaxError::at_line(
                module.id.clone(),
                member.line,
                format!("Missing 'End {}' for {}", capitalize(&opened_with), member.name),
            ));
        }

        Ok(scanned)
    }
}

impl ResolutionPipeline for LineScanPipeline {
    type Tree = ScannedModule;

    fn build_syntax_tree(&self, module: &SourceModule) -> Result<ScannedModule, SyntaxError> {
        self.scan(module)
    }

    fn resolve_declarations(
        &self,
        project: &ProjectSyntax<ScannedModule>,
    ) -> Result<DeclarationIndexBuilder, ResolutionError> {
        let mut builder = DeclarationIndexBuilder::new();

        for (module_id, tree) in project.iter() {
            builder.declare(Declaration {
                name: QualifiedName::module(module_id.clone()),
                kind: DeclarationKind::Module,
                accessibility: Accessibility::Public,
                line: 1,
            });

            let mut seen: HashMap<String, DeclarationKind> = HashMap::new();
            let mut check = |name: &str, kind: DeclarationKind, line: usize| {
                match seen.get(&name.to_ascii_lowercase()) {
                    // Property Get/Let/Set accessors share one name
                    Some(existing) if is_property(*existing) && is_property(kind) => Ok(false),
                    Some(_) => Err(ResolutionError::in_module(
                        module_id.clone(),
                        format!("Duplicate declaration '{}' at line {}", name, line),
                    )),
                    None => {
                        seen.insert(name.to_ascii_lowercase(), kind);
                        Ok(true)
                    }
                }
            };

            for member in &tree.members {
                if !check(&member.name, member.kind, member.line)? {
                    continue;
                }
                let name = QualifiedName::member(module_id.clone(), &member.name);
                for (child, line) in &member.children {
                    builder.declare(Declaration {
                        name: name.child(child),
                        kind: DeclarationKind::EnumerationMember,
                        accessibility: member.accessibility,
                        line: *line,
                    });
                }
                builder.declare(Declaration {
                    name,
                    kind: member.kind,
                    accessibility: member.accessibility,
                    line: member.line,
                });
            }

            for proc in &tree.procedures {
                // Later accessors of a property only add their own locals
                let declare_member = check(&proc.name, proc.kind, proc.line)?;
                let scope = QualifiedName::member(module_id.clone(), proc.scope());
                let mut locals = HashSet::new();
                for (param, line) in &proc.parameters {
                    if locals.insert(param.to_ascii_lowercase()) {
                        builder.declare(Declaration {
                            name: scope.child(param),
                            kind: DeclarationKind::Parameter,
                            accessibility: Accessibility::Local,
                            line: *line,
                        });
                    }
                }
                for (local, line) in &proc.locals {
                    if locals.insert(local.to_ascii_lowercase()) {
                        builder.declare(Declaration {
                            name: scope.child(local),
                            kind: DeclarationKind::Variable,
                            accessibility: Accessibility::Local,
                            line: *line,
                        });
                    }
                }
                if declare_member {
                    builder.declare(Declaration {
                        name: QualifiedName::member(module_id.clone(), &proc.name),
                        kind: proc.kind,
                        accessibility: proc.accessibility,
                        line: proc.line,
                    });
                }
            }
        }

        Ok(builder)
    }

    fn resolve_references(
        &self,
        mut declarations: DeclarationIndexBuilder,
        project: &ProjectSyntax<ScannedModule>,
    ) -> Result<DeclarationIndexBuilder, ResolutionError> {
        let scopes = Scopes::collect(&declarations);

        for (module_id, tree) in project.iter() {
            for token in &tree.tokens {
                let Some(target) = scopes.resolve(module_id, token) else {
                    continue;
                };
                declarations.add_reference(
                    &target,
                    IdentifierReference {
                        module: module_id.clone(),
                        line: token.line,
                        column: token.column,
                        identifier: token.identifier.clone(),
                        scope: Some(token.procedure.clone()),
                    },
                );
            }
        }

        Ok(declarations)
    }
}

/// Case-insensitive name lookup tables built from declarations
struct Scopes {
    modules: HashMap<String, ModuleId>,
    /// (module, identifier) → member
    members: HashMap<(ModuleId, String), (QualifiedName, Accessibility)>,
    /// (module, procedure, identifier) → local or parameter
    locals: HashMap<(ModuleId, String, String), QualifiedName>,
    /// identifier → public members across the project
    public: BTreeMap<String, Vec<QualifiedName>>,
}

impl Scopes {
    fn collect(declarations: &DeclarationIndexBuilder) -> Self {
        let mut scopes = Scopes {
            modules: HashMap::new(),
            members: HashMap::new(),
            locals: HashMap::new(),
            public: BTreeMap::new(),
        };

        for decl in declarations.declarations() {
            let module = decl.name.module.clone();
            let ident = decl.identifier().to_ascii_lowercase();
            match (decl.kind, decl.name.path.len()) {
                (DeclarationKind::Module, _) => {
                    scopes
                        .modules
                        .insert(module.as_str().to_ascii_lowercase(), module);
                }
                (DeclarationKind::Parameter, _) | (_, 2) if decl.accessibility == Accessibility::Local => {
                    let proc = decl.name.path[0].to_ascii_lowercase();
                    scopes
                        .locals
                        .insert((module, proc, ident), decl.name.clone());
                }
                _ => {
                    scopes.members.insert(
                        (module, ident.clone()),
                        (decl.name.clone(), decl.accessibility),
                    );
                    if decl.accessibility == Accessibility::Public {
                        scopes
                            .public
                            .entry(ident)
                            .or_default()
                            .push(decl.name.clone());
                    }
                }
            }
        }

        scopes
    }

    fn resolve(&self, module: &ModuleId, token: &ScannedToken) -> Option<QualifiedName> {
        let ident = token.identifier.to_ascii_lowercase();

        if let Some(qualifier) = &token.qualifier {
            let target_module = self.modules.get(&qualifier.to_ascii_lowercase())?;
            let (name, access) = self.members.get(&(target_module.clone(), ident))?;
            let visible = target_module == module || *access == Accessibility::Public;
            return visible.then(|| name.clone());
        }

        let proc = token.procedure.to_ascii_lowercase();
        if let Some(local) = self.locals.get(&(module.clone(), proc, ident.clone())) {
            return Some(local.clone());
        }
        if let Some((member, _)) = self.members.get(&(module.clone(), ident.clone())) {
            return Some(member.clone());
        }
        if let Some(module_id) = self.modules.get(&ident) {
            return Some(QualifiedName::module(module_id.clone()));
        }
        match self.public.get(&ident).map(Vec::as_slice) {
            Some([single]) => Some(single.clone()),
            _ => None,
        }
    }
}

fn is_property(kind: DeclarationKind) -> bool {
    matches!(
        kind,
        DeclarationKind::PropertyGet | DeclarationKind::PropertyLet | DeclarationKind::PropertySet
    )
}

fn procedure_kind(keyword: &str) -> DeclarationKind {
    let normalized: Vec<&str> = keyword.split_whitespace().collect();
    match normalized.as_slice() {
        ["function"] => DeclarationKind::Function,
        ["property", "get"] => DeclarationKind::PropertyGet,
        ["property", "let"] => DeclarationKind::PropertyLet,
        ["property", "set"] => DeclarationKind::PropertySet,
        _ => DeclarationKind::Procedure,
    }
}

fn accessibility(modifier: Option<&str>, default_public: bool) -> Accessibility {
    match modifier.map(|m| m.to_ascii_lowercase()) {
        Some(m) if m == "private" => Accessibility::Private,
        Some(_) => Accessibility::Public,
        None if default_public => Accessibility::Public,
        None => Accessibility::Private,
    }
}

fn parse_parameters(list: &str, line: usize) -> Vec<(String, usize)> {
    list.split(',')
        .filter_map(|part| LEADING_IDENT.captures(part))
        .map(|caps| (caps[1].to_string(), line))
        .collect()
}

/// Names declared by `a As Long, b(10) As String, c`
fn declared_names(list: &str) -> Vec<String> {
    list.split(',')
        .filter_map(|part| LEADING_IDENT.captures(part))
        .map(|caps| caps[1].to_string())
        .collect()
}

fn scan_tokens(
    line: &str,
    line_no: usize,
    procedure: &str,
    declared: &[String],
    tokens: &mut Vec<ScannedToken>,
) {
    let mut previous: Option<(String, usize)> = None;

    for m in IDENT.find_iter(line) {
        let text = m.as_str();
        let qualifier = previous.as_ref().and_then(|(prev, end)| {
            (line[*end..m.start()].trim() == ".").then(|| prev.clone())
        });
        previous = Some((text.to_string(), m.end()));

        if qualifier.is_none() && line[..m.start()].trim_end().ends_with('.') {
            // member access on an expression we do not track (e.g. obj.Method)
            continue;
        }
        if is_keyword(text) || text.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            continue;
        }
        if qualifier.is_none() && declared.iter().any(|d| d.eq_ignore_ascii_case(text)) {
            continue;
        }

        tokens.push(ScannedToken {
            identifier: text.to_string(),
            qualifier,
            line: line_no,
            column: m.start() + 1,
            procedure: procedure.to_string(),
        });
    }
}

fn is_keyword(word: &str) -> bool {
    let lower = word.to_ascii_lowercase();
    KEYWORDS.binary_search(&lower.as_str()).is_ok()
}

fn is_directive(line: &str) -> bool {
    let lower = line.trim_start().to_ascii_lowercase();
    lower.starts_with("option ") || lower.starts_with("attribute ")
}

/// Remove `'` / `Rem` comments and blank out string literals
fn strip_comment(line: &str) -> String {
    if is_rem_comment(line) {
        return String::new();
    }

    let mut out = String::with_capacity(line.len());
    let mut in_string = false;
    for ch in line.chars() {
        match ch {
            '"' => {
                in_string = !in_string;
                out.push('"');
            }
            '\'' if !in_string => break,
            _ if in_string => out.push(' '),
            _ => out.push(ch),
        }
    }
    out
}

fn is_rem_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    let Some(keyword) = trimmed.get(..3) else {
        return false;
    };
    keyword.eq_ignore_ascii_case("rem")
        && trimmed[3..].chars().next().map_or(true, char::is_whitespace)
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

// ============================================================================
// Tests
// ============================================================================
