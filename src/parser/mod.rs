//! Grammar adapter registry producing a uniform syntax-tree view.
//!
//! Every supported language is wrapped by a [`GrammarAdapter`] that knows its
//! tree-sitter grammar and the structural queries for each [`QueryKind`].
//! Callers never branch on a concrete language: they ask the
//! [`GrammarRegistry`] to parse a file and then issue queries such as
//! `QueryKind::RouteCall` against the resulting [`SourceUnit`].
//!
//! # Example
//!
//! ```no_run
//! use openapi_synth::parser::{GrammarRegistry, QueryKind};
//! use std::path::Path;
//!
//! let registry = GrammarRegistry::new();
//! let source = std::fs::read_to_string("src/app.js").unwrap();
//! let unit = registry.parse(Path::new("src/app.js"), source).unwrap();
//! for m in registry.query(&unit, QueryKind::RouteCall) {
//!     println!("{:?}", m.text("verb"));
//! }
//! ```

pub mod go;
pub mod javascript;
pub mod python;
pub mod rust;

use crate::error::{PipelineError, Result};
use log::{debug, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tree_sitter::{Node, Parser, Query, QueryCursor, StreamingIterator, Tree};

/// Source languages with a registered grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Rust,
    Python,
    JavaScript,
    TypeScript,
    Tsx,
    Go,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Rust => "rust",
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Tsx => "tsx",
            Language::Go => "go",
        }
    }

    /// Whether a signature written for `self` applies to a unit in `other`.
    ///
    /// JavaScript signatures also cover TypeScript and TSX sources, and
    /// TypeScript signatures cover TSX.
    pub fn covers(&self, other: Language) -> bool {
        match self {
            Language::JavaScript => matches!(
                other,
                Language::JavaScript | Language::TypeScript | Language::Tsx
            ),
            Language::TypeScript => matches!(other, Language::TypeScript | Language::Tsx),
            _ => *self == other,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structural queries every adapter may answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    /// Method-style calls such as `app.get(...)` or `.route(...)`.
    RouteCall,
    /// Decorators and attributes attached to handlers.
    RouteDecorator,
    /// Router objects created or mounted with a path prefix.
    RouterPrefix,
    /// Type and function definitions.
    Definition,
    /// Comments and docstrings.
    Comment,
}

impl QueryKind {
    pub const ALL: [QueryKind; 5] = [
        QueryKind::RouteCall,
        QueryKind::RouteDecorator,
        QueryKind::RouterPrefix,
        QueryKind::Definition,
        QueryKind::Comment,
    ];
}

/// 1-based inclusive line range within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LineRange {
    pub start: usize,
    pub end: usize,
}

impl LineRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    pub fn of(node: Node<'_>) -> Self {
        Self::new(node.start_position().row + 1, node.end_position().row + 1)
    }
}

impl fmt::Display for LineRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// A parsed source file. Read-only once produced by the registry.
#[derive(Debug, Clone)]
pub struct SourceUnit {
    pub path: PathBuf,
    pub language: Language,
    pub text: String,
    pub tree: Tree,
}

impl SourceUnit {
    pub fn root(&self) -> Node<'_> {
        self.tree.root_node()
    }

    /// Text of the given 1-based line range, clamped to the file.
    pub fn lines(&self, range: LineRange) -> String {
        self.text
            .lines()
            .skip(range.start.saturating_sub(1))
            .take(range.end + 1 - range.start.max(1))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn display_path(&self) -> String {
        self.path.display().to_string()
    }
}

/// One named capture inside a query match.
#[derive(Debug, Clone)]
pub struct Capture<'u> {
    pub name: String,
    pub node: Node<'u>,
    pub text: &'u str,
    pub lines: LineRange,
}

/// A single structural match with its captures.
#[derive(Debug, Clone)]
pub struct QueryMatch<'u> {
    pub pattern_index: usize,
    pub captures: Vec<Capture<'u>>,
}

impl<'u> QueryMatch<'u> {
    pub fn get(&self, name: &str) -> Option<&Capture<'u>> {
        self.captures.iter().find(|c| c.name == name)
    }

    pub fn node(&self, name: &str) -> Option<Node<'u>> {
        self.get(name).map(|c| c.node)
    }

    pub fn text(&self, name: &str) -> Option<&'u str> {
        self.get(name).map(|c| c.text)
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
}

/// A language grammar plus the query sources answering each [`QueryKind`].
pub trait GrammarAdapter: Send + Sync {
    fn language(&self) -> Language;

    /// File extensions (without the dot) handled by this adapter.
    fn extensions(&self) -> &'static [&'static str];

    fn grammar(&self) -> tree_sitter::Language;

    /// Query source for `kind`, or `None` when the language has no such construct.
    fn query_source(&self, kind: QueryKind) -> Option<&'static str>;

    /// Parse `text` into a tree. Trees containing error nodes are rejected.
    fn parse(&self, path: &Path, text: &str) -> Result<Tree> {
        let mut parser = Parser::new();
        parser
            .set_language(&self.grammar())
            .map_err(|e| PipelineError::ParseError {
                file: path.to_path_buf(),
                message: format!("grammar rejected: {}", e),
            })?;
        let tree = parser
            .parse(text, None)
            .ok_or_else(|| PipelineError::ParseError {
                file: path.to_path_buf(),
                message: "parser produced no tree".to_string(),
            })?;
        let root = tree.root_node();
        if root.has_error() {
            let location = first_error(root)
                .map(|n| format!("line {}", n.start_position().row + 1))
                .unwrap_or_else(|| "unknown location".to_string());
            return Err(PipelineError::ParseError {
                file: path.to_path_buf(),
                message: format!("syntax error at {}", location),
            });
        }
        Ok(tree)
    }
}

fn first_error(node: Node<'_>) -> Option<Node<'_>> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    if !node.has_error() {
        return None;
    }
    for i in 0..node.child_count() {
        if let Some(found) = node.child(i).and_then(first_error) {
            return Some(found);
        }
    }
    Some(node)
}

struct CompiledGrammar {
    adapter: Arc<dyn GrammarAdapter>,
    queries: HashMap<QueryKind, Query>,
}

impl CompiledGrammar {
    fn compile(adapter: Arc<dyn GrammarAdapter>) -> Self {
        let grammar = adapter.grammar();
        let mut queries = HashMap::new();
        for kind in QueryKind::ALL {
            let Some(source) = adapter.query_source(kind) else {
                continue;
            };
            match Query::new(&grammar, source) {
                Ok(query) => {
                    queries.insert(kind, query);
                }
                Err(e) => warn!(
                    "Query {:?} for {} failed to compile: {}",
                    kind,
                    adapter.language(),
                    e
                ),
            }
        }
        Self { adapter, queries }
    }
}

/// Maps file extensions to grammar adapters with precompiled queries.
pub struct GrammarRegistry {
    grammars: HashMap<Language, CompiledGrammar>,
    extensions: HashMap<&'static str, Language>,
}

impl GrammarRegistry {
    /// Registry with every built-in adapter.
    pub fn new() -> Self {
        let mut registry = Self {
            grammars: HashMap::new(),
            extensions: HashMap::new(),
        };
        registry.register(Arc::new(rust::RustAdapter));
        registry.register(Arc::new(python::PythonAdapter));
        registry.register(Arc::new(javascript::JavaScriptAdapter));
        registry.register(Arc::new(javascript::TypeScriptAdapter::typescript()));
        registry.register(Arc::new(javascript::TypeScriptAdapter::tsx()));
        registry.register(Arc::new(go::GoAdapter));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn GrammarAdapter>) {
        let language = adapter.language();
        for ext in adapter.extensions() {
            self.extensions.insert(ext, language);
        }
        self.grammars
            .insert(language, CompiledGrammar::compile(adapter));
    }

    /// All extensions with a registered grammar, sorted.
    pub fn extensions(&self) -> Vec<String> {
        let mut exts: Vec<String> = self.extensions.keys().map(|e| e.to_string()).collect();
        exts.sort();
        exts
    }

    pub fn language_for(&self, path: &Path) -> Option<Language> {
        let ext = path.extension()?.to_str()?;
        self.extensions.get(ext).copied()
    }

    /// Parse one file, failing with `UnsupportedLanguage` or `ParseError`.
    pub fn parse(&self, path: &Path, text: String) -> Result<SourceUnit> {
        let language = self
            .language_for(path)
            .ok_or_else(|| PipelineError::UnsupportedLanguage(path.to_path_buf()))?;
        let grammar = self
            .grammars
            .get(&language)
            .ok_or_else(|| PipelineError::UnsupportedLanguage(path.to_path_buf()))?;
        let tree = grammar.adapter.parse(path, &text)?;
        debug!("Parsed {} as {}", path.display(), language);
        Ok(SourceUnit {
            path: path.to_path_buf(),
            language,
            text,
            tree,
        })
    }

    /// Parse many files on the rayon pool, one result per input in input order.
    pub fn parse_all(&self, files: Vec<(PathBuf, String)>) -> Vec<Result<SourceUnit>> {
        debug!("Parsing {} files", files.len());
        let results: Vec<Result<SourceUnit>> = files
            .into_par_iter()
            .map(|(path, text)| self.parse(&path, text))
            .collect();

        let failures = results.iter().filter(|r| r.is_err()).count();
        debug!(
            "Parsing complete: {} succeeded, {} failed",
            results.len() - failures,
            failures
        );
        results
    }

    /// Run a structural query against a parsed unit.
    ///
    /// Languages without the construct (or whose query failed to compile)
    /// yield no matches.
    pub fn query<'u>(&self, unit: &'u SourceUnit, kind: QueryKind) -> Vec<QueryMatch<'u>> {
        let Some(query) = self
            .grammars
            .get(&unit.language)
            .and_then(|g| g.queries.get(&kind))
        else {
            return Vec::new();
        };

        let names = query.capture_names();
        let source = unit.text.as_bytes();
        let mut cursor = QueryCursor::new();
        let mut matches = cursor.matches(query, unit.root(), source);
        let mut out = Vec::new();
        while let Some(m) = matches.next() {
            let captures = m
                .captures
                .iter()
                .map(|c| Capture {
                    name: names[c.index as usize].to_string(),
                    node: c.node,
                    text: node_text(c.node, &unit.text),
                    lines: LineRange::of(c.node),
                })
                .collect();
            out.push(QueryMatch {
                pattern_index: m.pattern_index,
                captures,
            });
        }
        out
    }
}

impl Default for GrammarRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Source text covered by `node`.
pub fn node_text<'u>(node: Node<'_>, source: &'u str) -> &'u str {
    source.get(node.byte_range()).unwrap_or("")
}

/// Named children of `node`, in source order.
pub fn named_children(node: Node<'_>) -> Vec<Node<'_>> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor).collect()
}

/// Ancestors of `node`, nearest first.
pub fn ancestors(node: Node<'_>) -> impl Iterator<Item = Node<'_>> {
    std::iter::successors(node.parent(), |n| n.parent())
}

const STRING_KINDS: &[&str] = &[
    "string_literal",
    "raw_string_literal",
    "string",
    "template_string",
    "interpreted_string_literal",
];

const INTERPOLATION_KINDS: &[&str] = &["template_substitution", "interpolation"];

/// Literal value of a string node, or `None` for non-strings and
/// interpolated strings whose value is only known at runtime.
pub fn string_value(node: Node<'_>, source: &str) -> Option<String> {
    if !STRING_KINDS.contains(&node.kind()) {
        return None;
    }
    if contains_kind(node, INTERPOLATION_KINDS) {
        return None;
    }
    unquote(node_text(node, source))
}

fn contains_kind(node: Node<'_>, kinds: &[&str]) -> bool {
    named_children(node)
        .into_iter()
        .any(|child| kinds.contains(&child.kind()) || contains_kind(child, kinds))
}

/// Strip string prefixes (`r`, `b`, `f`, `u`), raw-string hashes and quotes.
pub fn unquote(raw: &str) -> Option<String> {
    let body = raw
        .trim()
        .trim_start_matches(|c: char| c.is_ascii_alphabetic());
    let body = body.trim_start_matches('#').trim_end_matches('#');
    for quote in ["\"\"\"", "'''", "\"", "'", "`"] {
        if body.len() >= 2 * quote.len() && body.starts_with(quote) && body.ends_with(quote) {
            return Some(body[quote.len()..body.len() - quote.len()].to_string());
        }
    }
    None
}

/// First string literal among the named children of `node`.
pub fn first_string_child(node: Node<'_>, source: &str) -> Option<String> {
    named_children(node)
        .into_iter()
        .find_map(|child| string_value(child, source))
}
