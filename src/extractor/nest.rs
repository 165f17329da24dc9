use crate::extractor::{call_arguments, call_target, combine_paths, HttpMethod, RouteExtractor, RouteInfo};
use crate::parser::{ancestors, named_children, node_text, string_value, GrammarRegistry, LineRange, QueryKind, SourceUnit};
use tree_sitter::Node;

/// NestJS route extractor
///
/// Combines the class-level `@Controller(prefix)` with method decorators
/// `@Get(path)`, `@Post(path)` and friends. Decorator arguments may be a
/// string, an array of strings or, for the controller, `{ path: '...' }`.
pub struct NestExtractor;

impl RouteExtractor for NestExtractor {
    fn extract_routes(&self, unit: &SourceUnit, registry: &GrammarRegistry) -> Vec<RouteInfo> {
        let source = unit.text.as_str();
        let mut routes = Vec::new();

        for m in registry.query(unit, QueryKind::RouteDecorator) {
            let Some(decorator) = m.node("decorator") else {
                continue;
            };
            let Some((name, args)) = decorator_call(decorator, source) else {
                continue;
            };
            let methods = match HttpMethod::from_name(&name) {
                Some(method) if name.starts_with(char::is_uppercase) => vec![method],
                None if name == "All" => HttpMethod::COMMON.to_vec(),
                _ => continue,
            };
            let Some(method_node) = decorated_method(decorator) else {
                continue;
            };
            let Some(handler) = method_node
                .child_by_field_name("name")
                .map(|n| node_text(n, source).to_string())
            else {
                continue;
            };

            let prefixes = controller_prefixes(method_node, source);
            let paths = decorator_paths(&args, source);
            for prefix in &prefixes {
                for path in &paths {
                    for method in &methods {
                        routes.push(
                            RouteInfo::new(
                                combine_paths(prefix, path),
                                *method,
                                handler.clone(),
                                LineRange::of(decorator),
                            )
                            .with_handler_lines(LineRange::of(method_node)),
                        );
                    }
                }
            }
        }
        routes
    }
}

/// Name and argument nodes of `@Name(args)`. Bare `@Name` yields no arguments.
fn decorator_call<'t>(decorator: Node<'t>, source: &str) -> Option<(String, Vec<Node<'t>>)> {
    let expr = named_children(decorator).into_iter().next()?;
    match expr.kind() {
        "call_expression" => {
            let target = call_target(expr, source)?;
            Some((target.name, call_arguments(expr)))
        }
        "identifier" => Some((node_text(expr, source).to_string(), Vec::new())),
        _ => None,
    }
}

/// Path arguments of a decorator; no argument means the controller root.
fn decorator_paths(args: &[Node<'_>], source: &str) -> Vec<String> {
    let Some(first) = args.first() else {
        return vec![String::new()];
    };
    if let Some(path) = string_value(*first, source) {
        return vec![path];
    }
    match first.kind() {
        "array" => {
            let paths: Vec<String> = named_children(*first)
                .into_iter()
                .filter_map(|item| string_value(item, source))
                .collect();
            if paths.is_empty() {
                vec![String::new()]
            } else {
                paths
            }
        }
        "object" => vec![object_path(*first, source).unwrap_or_default()],
        _ => vec![String::new()],
    }
}

/// `{ path: 'users' }` -> `users`.
fn object_path(object: Node<'_>, source: &str) -> Option<String> {
    named_children(object)
        .into_iter()
        .filter(|p| p.kind() == "pair")
        .find(|p| {
            p.child_by_field_name("key")
                .is_some_and(|k| node_text(k, source).trim_matches(['\'', '"']) == "path")
        })
        .and_then(|p| p.child_by_field_name("value"))
        .and_then(|v| string_value(v, source))
}

/// The method a member decorator applies to. Member decorators are siblings
/// of the method inside the class body.
fn decorated_method(decorator: Node<'_>) -> Option<Node<'_>> {
    if let Some(parent) = decorator.parent().filter(|p| p.kind() == "method_definition") {
        return Some(parent);
    }
    let mut next = decorator.next_named_sibling();
    while let Some(node) = next {
        match node.kind() {
            "method_definition" => return Some(node),
            "decorator" | "comment" => next = node.next_named_sibling(),
            _ => return None,
        }
    }
    None
}

/// `@Controller` prefixes of the class enclosing `member`; `[""]` when absent.
fn controller_prefixes(member: Node<'_>, source: &str) -> Vec<String> {
    let Some(class) = ancestors(member).find(|n| {
        matches!(
            n.kind(),
            "class_declaration" | "abstract_class_declaration" | "class"
        )
    }) else {
        return vec![String::new()];
    };

    let mut decorators: Vec<Node<'_>> = named_children(class)
        .into_iter()
        .filter(|n| n.kind() == "decorator")
        .collect();
    if let Some(export) = class.parent().filter(|p| p.kind() == "export_statement") {
        decorators.extend(
            named_children(export)
                .into_iter()
                .filter(|n| n.kind() == "decorator"),
        );
    }

    decorators
        .into_iter()
        .filter_map(|d| decorator_call(d, source))
        .find(|(name, _)| name == "Controller")
        .map(|(_, args)| decorator_paths(&args, source))
        .unwrap_or_else(|| vec![String::new()])
}
