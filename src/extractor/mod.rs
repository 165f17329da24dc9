//! Endpoint harvesting: framework-specific structural extractors, the model
//! fallback and deduplication of the combined candidates.
//!
//! Each framework has a [`RouteExtractor`] that walks a parsed
//! [`SourceUnit`] through the registry's structural queries and reports the
//! routes it registers.
//!
//! # Supported Frameworks
//!
//! - **Axum**: See [`axum::AxumExtractor`]
//! - **Actix-Web**: See [`actix::ActixExtractor`]
//! - **Flask / FastAPI**: See [`python::PythonExtractor`]
//! - **Express**: See [`express::ExpressExtractor`]
//! - **NestJS**: See [`nest::NestExtractor`]
//! - **Gin / Echo / Chi / Fiber**: See [`go::GoExtractor`]
//!
//! Frameworks without an extractor (Django, or anything the model reports)
//! are covered by [`model::ModelExtractor`].
//!
//! # Example
//!
//! ```no_run
//! use openapi_synth::extractor::{extractor_for, RouteExtractor};
//! use openapi_synth::parser::GrammarRegistry;
//! use std::path::Path;
//!
//! let registry = GrammarRegistry::new();
//! let source = std::fs::read_to_string("src/main.rs").unwrap();
//! let unit = registry.parse(Path::new("src/main.rs"), source).unwrap();
//! let extractor = extractor_for("axum").unwrap();
//! let routes = extractor.extract_routes(&unit, &registry);
//! println!("Found {} routes", routes.len());
//! ```

pub mod actix;
pub mod axum;
pub mod express;
pub mod go;
pub mod model;
pub mod nest;
pub mod python;

use crate::config::DetectionConfig;
use crate::detector::FrameworkTag;
use crate::error::{FailureKind, SoftFailure};
use crate::parser::{named_children, node_text, GrammarRegistry, LineRange, QueryKind, SourceUnit};
use log::debug;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tree_sitter::Node;

/// Walks one parsed unit and reports the routes a framework registers in it.
pub trait RouteExtractor: Send + Sync {
    fn extract_routes(&self, unit: &SourceUnit, registry: &GrammarRegistry) -> Vec<RouteInfo>;
}

/// A route as found in source, before path normalization.
#[derive(Debug, Clone)]
pub struct RouteInfo {
    /// The URL path pattern as written (e.g. "/users/:id" or "/users/{id}")
    pub path: String,
    pub method: HttpMethod,
    pub handler_name: String,
    /// Lines of the registration (call, decorator or attribute).
    pub lines: LineRange,
    /// Lines of the handler body when the extractor already knows them.
    pub handler_lines: Option<LineRange>,
}

impl RouteInfo {
    pub fn new(path: String, method: HttpMethod, handler_name: String, lines: LineRange) -> Self {
        Self {
            path,
            method,
            handler_name,
            lines,
            handler_lines: None,
        }
    }

    pub fn with_handler_lines(mut self, lines: LineRange) -> Self {
        self.handler_lines = Some(lines);
        self
    }
}

/// HTTP methods, declared in canonical document order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Options,
    Head,
    Trace,
}

impl HttpMethod {
    /// Methods that a catch-all registration such as `app.all(...)` expands to.
    pub const COMMON: [HttpMethod; 5] = [
        HttpMethod::Get,
        HttpMethod::Post,
        HttpMethod::Put,
        HttpMethod::Patch,
        HttpMethod::Delete,
    ];

    /// Case-insensitive lookup by method name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "get" => Some(HttpMethod::Get),
            "post" => Some(HttpMethod::Post),
            "put" => Some(HttpMethod::Put),
            "patch" => Some(HttpMethod::Patch),
            "delete" => Some(HttpMethod::Delete),
            "options" => Some(HttpMethod::Options),
            "head" => Some(HttpMethod::Head),
            "trace" => Some(HttpMethod::Trace),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "get",
            HttpMethod::Post => "post",
            HttpMethod::Put => "put",
            HttpMethod::Patch => "patch",
            HttpMethod::Delete => "delete",
            HttpMethod::Options => "options",
            HttpMethod::Head => "head",
            HttpMethod::Trace => "trace",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_ascii_uppercase())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMethod {
    Native,
    Model,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct SourceLocation {
    pub file: PathBuf,
    pub lines: LineRange,
}

/// A provisional record of one discovered route.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointCandidate {
    pub method: HttpMethod,
    /// Normalized path template.
    pub path: String,
    pub location: SourceLocation,
    pub handler: String,
    pub handler_lines: Option<LineRange>,
    pub raw_params: Vec<String>,
    pub tag: FrameworkTag,
    pub extraction: ExtractionMethod,
    /// Set when a model pass disagreed with the native result.
    pub conflict: Option<String>,
}

impl EndpointCandidate {
    pub fn identity_key(&self) -> (HttpMethod, &str, &Path, &str) {
        (
            self.method,
            self.path.as_str(),
            self.location.file.as_path(),
            self.handler.as_str(),
        )
    }

    /// Lines to show when describing the handler: its body if known, else the registration.
    pub fn handler_range(&self) -> LineRange {
        self.handler_lines.unwrap_or(self.location.lines)
    }
}

/// The extractor registered for `framework`, if any.
pub fn extractor_for(framework: &str) -> Option<&'static dyn RouteExtractor> {
    static AXUM: axum::AxumExtractor = axum::AxumExtractor;
    static ACTIX: actix::ActixExtractor = actix::ActixExtractor;
    static PYTHON: python::PythonExtractor = python::PythonExtractor;
    static EXPRESS: express::ExpressExtractor = express::ExpressExtractor;
    static NEST: nest::NestExtractor = nest::NestExtractor;
    static GO: go::GoExtractor = go::GoExtractor;

    match framework {
        "axum" => Some(&AXUM),
        "actix-web" | "actix" => Some(&ACTIX),
        "flask" | "fastapi" => Some(&PYTHON),
        "express" => Some(&EXPRESS),
        "nestjs" => Some(&NEST),
        "gin" | "echo" | "chi" | "fiber" => Some(&GO),
        _ => None,
    }
}

/// Which passes to run for one tagged unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarvestPlan {
    /// No structural extractor for the framework.
    ModelOnly,
    /// Confident tag: native, with the model only when native finds nothing.
    NativeFirst,
    /// Weak tag: both passes, deduplicated afterwards.
    NativeAndModel,
}

impl HarvestPlan {
    pub fn for_tag(tag: &FrameworkTag, settings: &DetectionConfig) -> Self {
        if extractor_for(&tag.framework).is_none() {
            HarvestPlan::ModelOnly
        } else if tag.confidence >= settings.native_first_confidence {
            HarvestPlan::NativeFirst
        } else {
            HarvestPlan::NativeAndModel
        }
    }

    pub fn runs_native(&self) -> bool {
        !matches!(self, HarvestPlan::ModelOnly)
    }

    pub fn needs_model(&self, native_count: usize) -> bool {
        match self {
            HarvestPlan::ModelOnly | HarvestPlan::NativeAndModel => true,
            HarvestPlan::NativeFirst => native_count == 0,
        }
    }
}

/// Run the structural extractor for `tag` over `unit`.
pub fn harvest_native(
    unit: &SourceUnit,
    tag: &FrameworkTag,
    registry: &GrammarRegistry,
) -> Vec<EndpointCandidate> {
    let Some(extractor) = extractor_for(&tag.framework) else {
        return Vec::new();
    };
    let routes = extractor.extract_routes(unit, registry);
    debug!(
        "{}: {} routes from the {} extractor",
        unit.display_path(),
        routes.len(),
        tag.framework
    );

    let definitions = definition_lines(unit, registry);
    routes
        .into_iter()
        .filter_map(|route| {
            let Some(path) = normalize_path(&route.path) else {
                debug!("Skipping wildcard route {:?}", route.path);
                return None;
            };
            let handler_lines = route.handler_lines.or_else(|| {
                definitions.get(short_name(&route.handler_name)).copied()
            });
            let body = unit.lines(handler_lines.unwrap_or(route.lines));
            Some(EndpointCandidate {
                method: route.method,
                raw_params: raw_params(&path, &body),
                path,
                location: SourceLocation {
                    file: unit.path.clone(),
                    lines: route.lines,
                },
                handler: route.handler_name,
                handler_lines,
                tag: tag.clone(),
                extraction: ExtractionMethod::Native,
                conflict: None,
            })
        })
        .collect()
}

/// Line ranges of named definitions in `unit`, first definition wins.
pub fn definition_lines(unit: &SourceUnit, registry: &GrammarRegistry) -> BTreeMap<String, LineRange> {
    let mut out = BTreeMap::new();
    for m in registry.query(unit, QueryKind::Definition) {
        let Some(name) = m.text("name") else {
            continue;
        };
        let Some(span) = m.get("function").or_else(|| m.get("binding")).or_else(|| m.get("type")) else {
            continue;
        };
        out.entry(name.to_string()).or_insert(span.lines);
    }
    out
}

// ============ Call shapes ============

/// The called name of a call expression and the object it is called on.
pub(crate) struct CallTarget<'t> {
    pub name: String,
    pub receiver: Option<Node<'t>>,
}

/// Resolve `f(..)`, `a::f(..)`, `x.f(..)` in every supported grammar.
pub(crate) fn call_target<'t>(call: Node<'t>, source: &str) -> Option<CallTarget<'t>> {
    let function = call.child_by_field_name("function")?;
    let (name, receiver) = match function.kind() {
        "identifier" => (Some(function), None),
        "scoped_identifier" => (function.child_by_field_name("name"), None),
        "field_expression" => (
            function.child_by_field_name("field"),
            function.child_by_field_name("value"),
        ),
        "member_expression" => (
            function.child_by_field_name("property"),
            function.child_by_field_name("object"),
        ),
        "selector_expression" => (
            function.child_by_field_name("field"),
            function.child_by_field_name("operand"),
        ),
        "attribute" => (
            function.child_by_field_name("attribute"),
            function.child_by_field_name("object"),
        ),
        _ => (None, None),
    };
    Some(CallTarget {
        name: node_text(name?, source).to_string(),
        receiver,
    })
}

/// Argument expressions of a call, comments excluded.
pub(crate) fn call_arguments(call: Node<'_>) -> Vec<Node<'_>> {
    call.child_by_field_name("arguments")
        .map(|args| {
            named_children(args)
                .into_iter()
                .filter(|n| !n.kind().contains("comment"))
                .collect()
        })
        .unwrap_or_default()
}

/// Last `::`- or `.`-separated segment of a handler expression.
pub(crate) fn short_name(text: &str) -> &str {
    text.rsplit("::")
        .next()
        .and_then(|s| s.rsplit('.').next())
        .unwrap_or(text)
        .trim()
}

/// Handler name for a handler argument: identifiers and paths by name,
/// anything else (closures, inline functions) synthesized from the route.
pub(crate) fn handler_name(node: Option<Node<'_>>, source: &str, method: HttpMethod, path: &str) -> String {
    match node {
        Some(n)
            if matches!(
                n.kind(),
                "identifier"
                    | "scoped_identifier"
                    | "field_expression"
                    | "member_expression"
                    | "selector_expression"
                    | "attribute"
            ) =>
        {
            short_name(node_text(n, source)).to_string()
        }
        _ => synthetic_handler(method, &normalize_path(path).unwrap_or_default()),
    }
}

/// Lines of an inline handler (closure or function literal), if `node` is one.
pub(crate) fn inline_handler_lines(node: Option<Node<'_>>) -> Option<LineRange> {
    let node = node?;
    matches!(
        node.kind(),
        "closure_expression"
            | "arrow_function"
            | "function_expression"
            | "function"
            | "func_literal"
            | "lambda"
    )
    .then(|| LineRange::of(node))
}

// ============ Paths ============

static COLON_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^:([A-Za-z_]\w*)(?:\(.*\))?\??$").unwrap());
static ANGLE_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^<(?:[A-Za-z_]\w*:)?([A-Za-z_]\w*)>$").unwrap());
static BRACE_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\{([A-Za-z_]\w*)(?::[^}]*)?\}$").unwrap());
static TEMPLATE_PARAM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{([A-Za-z_]\w*)\}").unwrap());

/// Normalize a route path: `{param}` delimiters, leading slash, no repeated or
/// trailing slashes. A path with a wildcard segment (`*`, `*rest`) has no
/// OpenAPI form and yields `None`.
pub fn normalize_path(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let mut segments = Vec::new();

    for segment in raw.split('/').filter(|s| !s.is_empty()) {
        if segment == "*" || (segment.starts_with('*') && !segment.contains('{')) {
            return None;
        }
        let converted = if let Some(caps) = COLON_PARAM.captures(segment) {
            format!("{{{}}}", &caps[1])
        } else if let Some(caps) = ANGLE_PARAM.captures(segment) {
            format!("{{{}}}", &caps[1])
        } else if let Some(caps) = BRACE_PARAM.captures(segment) {
            format!("{{{}}}", &caps[1])
        } else {
            segment.to_string()
        };
        segments.push(converted);
    }

    Some(format!("/{}", segments.join("/")))
}

/// Join a router prefix and a route path. The result still needs [`normalize_path`].
pub fn combine_paths(prefix: &str, path: &str) -> String {
    if prefix.is_empty() {
        return path.to_string();
    }

    let prefix = prefix.trim_end_matches('/');
    let path = path.trim_start_matches('/');

    if path.is_empty() {
        prefix.to_string()
    } else {
        format!("{}/{}", prefix, path)
    }
}

/// Names of the `{param}` segments of a normalized path, in order.
pub fn path_parameters(path: &str) -> Vec<String> {
    TEMPLATE_PARAM
        .captures_iter(path)
        .map(|c| c[1].to_string())
        .collect()
}

/// Synthesized handler name for anonymous handlers, e.g. `get_users_id`.
pub fn synthetic_handler(method: HttpMethod, path: &str) -> String {
    let mut name = method.as_str().to_string();
    for part in path.split(|c: char| !c.is_ascii_alphanumeric()).filter(|p| !p.is_empty()) {
        name.push('_');
        name.push_str(&part.to_ascii_lowercase());
    }
    name
}

// ============ Raw parameter tokens ============

/// Token patterns for request inputs: (location, pattern with one capture).
///
/// `<location>-type` tokens name a whole typed input, such as an extractor's
/// type argument or the variable a body is bound into. They are hints for
/// enrichment, never parameters of their own.
static PARAM_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("path", r"\breq(?:uest)?\.params\.(\w+)"),
        ("path", r#"\.Param\(\s*"(\w+)""#),
        ("path", r#"\bURLParam\(\s*\w+\s*,\s*"(\w+)""#),
        ("path", r#"@Param\(\s*['"](\w+)['"]"#),
        ("path-type", r"\bPath<([^>]+)>"),
        ("query", r"\breq(?:uest)?\.query\.(\w+)"),
        ("query", r#"\.(?:Query|QueryParam|DefaultQuery|FormValue)\(\s*"(\w+)""#),
        ("query", r#"@Query\(\s*['"](\w+)['"]"#),
        ("query", r#"\brequest\.args\.get\(\s*['"](\w+)['"]"#),
        ("query-type", r"\bQuery<([^>]+)>"),
        ("body", r"\breq(?:uest)?\.body\.(\w+)"),
        ("body-type", r"@Body\(\)\s*\w+\s*:\s*(\w+)"),
        ("body-type", r"\bJson<([^>]+)>"),
        ("body-type", r"\.(?:ShouldBindJSON|BindJSON|Bind|BodyParser)\(\s*&(\w+)"),
        ("body", r#"\brequest\.(?:json|get_json\(\))\.get\(\s*['"](\w+)['"]"#),
        ("header", r#"\breq(?:uest)?\.headers\[\s*['"]([\w-]+)['"]"#),
        ("header", r#"\breq\.(?:get|header)\(\s*['"]([\w-]+)['"]"#),
        ("header", r#"@Headers?\(\s*['"]([\w-]+)['"]"#),
        ("header", r#"\.(?:GetHeader|Get)\(\s*"([A-Z][\w-]+)""#),
        ("header", r#"\brequest\.headers\.get\(\s*['"]([\w-]+)['"]"#),
    ]
    .into_iter()
    .map(|(location, pattern)| (location, Regex::new(pattern).unwrap()))
    .collect()
});

/// Request-input tokens (`location:name`) for a route: every path template
/// parameter, then inputs read in the handler body, without duplicates.
pub fn raw_params(path: &str, body: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut tokens = Vec::new();
    let mut push = |token: String| {
        if seen.insert(token.clone()) {
            tokens.push(token);
        }
    };

    for name in path_parameters(path) {
        push(format!("path:{}", name));
    }
    for (location, regex) in PARAM_PATTERNS.iter() {
        for caps in regex.captures_iter(body) {
            push(format!("{}:{}", location, caps[1].trim()));
        }
    }
    tokens
}

// ============ Deduplication ============

pub struct Deduplicated {
    pub candidates: Vec<EndpointCandidate>,
    pub conflicts: Vec<SoftFailure>,
}

/// Collapse candidates sharing an identity key, native fields winning.
///
/// A model candidate that matches a native one on (method, path, file) is
/// folded into it whatever its handler name. When both carry non-path
/// parameter tokens and those differ, the native candidate is kept and flagged.
/// Model candidates from overlapping windows collapse on the same key.
pub fn deduplicate(mut candidates: Vec<EndpointCandidate>) -> Deduplicated {
    candidates.sort_by(|a, b| {
        a.extraction
            .cmp(&b.extraction)
            .then_with(|| a.location.cmp(&b.location))
            .then_with(|| a.method.cmp(&b.method))
            .then_with(|| a.path.cmp(&b.path))
            .then_with(|| a.handler.cmp(&b.handler))
    });

    let mut kept: Vec<EndpointCandidate> = Vec::new();
    let mut conflicts = Vec::new();

    for candidate in candidates {
        let exact = kept
            .iter()
            .position(|k| k.identity_key() == candidate.identity_key());
        let loose = || {
            kept.iter().position(|k| {
                k.method == candidate.method
                    && k.path == candidate.path
                    && k.location.file == candidate.location.file
            })
        };

        let target = match candidate.extraction {
            ExtractionMethod::Native => exact,
            ExtractionMethod::Model => exact.or_else(loose),
        };
        let Some(index) = target else {
            kept.push(candidate);
            continue;
        };

        let existing = &mut kept[index];
        if existing.extraction == ExtractionMethod::Native
            && candidate.extraction == ExtractionMethod::Model
        {
            let native = non_path_tokens(&existing.raw_params);
            let model = non_path_tokens(&candidate.raw_params);
            if !native.is_empty() && !model.is_empty() && native != model {
                let message = format!(
                    "model reported [{}], native reported [{}]",
                    model.into_iter().collect::<Vec<_>>().join(", "),
                    native.into_iter().collect::<Vec<_>>().join(", ")
                );
                conflicts.push(SoftFailure::new(
                    format!(
                        "{} {} ({})",
                        existing.method,
                        existing.path,
                        existing.location.file.display()
                    ),
                    FailureKind::Conflict,
                    message.clone(),
                ));
                existing.conflict = Some(message);
            }
        }
    }

    kept.sort_by(|a, b| {
        a.path
            .cmp(&b.path)
            .then_with(|| a.method.cmp(&b.method))
            .then_with(|| a.location.cmp(&b.location))
            .then_with(|| a.handler.cmp(&b.handler))
    });
    Deduplicated {
        candidates: kept,
        conflicts,
    }
}

fn non_path_tokens(tokens: &[String]) -> BTreeSet<&str> {
    tokens
        .iter()
        .map(String::as_str)
        .filter(|t| {
            t.split_once(':')
                .is_some_and(|(location, _)| matches!(location, "query" | "header" | "body"))
        })
        .collect()
}
