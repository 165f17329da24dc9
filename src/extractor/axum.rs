use crate::extractor::{
    call_arguments, call_target, combine_paths, handler_name, inline_handler_lines, HttpMethod,
    RouteExtractor, RouteInfo,
};
use crate::parser::{ancestors, node_text, string_value, GrammarRegistry, LineRange, QueryKind, SourceUnit};
use log::debug;
use std::collections::HashMap;
use tree_sitter::Node;

/// Axum route extractor
///
/// Handles `.route(path, get(h).post(h2))` chains and `.nest(prefix, router)`,
/// both for routers built inline and for routers returned by a function in the
/// same file (`.nest("/api", api_routes())`).
pub struct AxumExtractor;

impl RouteExtractor for AxumExtractor {
    fn extract_routes(&self, unit: &SourceUnit, registry: &GrammarRegistry) -> Vec<RouteInfo> {
        let source = unit.text.as_str();
        let calls = registry.query(unit, QueryKind::RouteCall);
        let function_prefixes = nested_function_prefixes(
            calls.iter().filter_map(|m| m.node("call")),
            source,
        );

        let mut routes = Vec::new();
        for m in &calls {
            if m.text("verb") != Some("route") {
                continue;
            }
            let Some(call) = m.node("call") else {
                continue;
            };
            let args = call_arguments(call);
            let Some(path) = args.first().and_then(|a| string_value(*a, source)) else {
                continue;
            };
            let Some(method_router) = args.get(1) else {
                continue;
            };

            let mut prefix = enclosing_function(call, source)
                .and_then(|name| function_prefixes.get(name).cloned())
                .unwrap_or_default();
            for nest in nest_prefixes(call, source) {
                prefix = combine_paths(&prefix, &nest);
            }
            let full_path = combine_paths(&prefix, &path);
            // chained calls start at the router; report from `.route` onwards
            let lines = LineRange::new(
                m.get("verb").map(|v| v.lines.start).unwrap_or(1),
                LineRange::of(call).end,
            );

            let mut handlers = Vec::new();
            collect_method_router(*method_router, source, &mut handlers);
            if handlers.is_empty() {
                debug!("No method router recognized for route {}", full_path);
            }
            for (method, handler) in handlers {
                let mut route = RouteInfo::new(
                    full_path.clone(),
                    method,
                    handler_name(handler, source, method, &full_path),
                    lines,
                );
                if let Some(lines) = inline_handler_lines(handler) {
                    route = route.with_handler_lines(lines);
                }
                routes.push(route);
            }
        }
        routes
    }
}

/// Walk a method router such as `get(list).post(create)`, collecting
/// (method, handler) pairs. `.layer(..)` and similar calls are skipped.
fn collect_method_router<'t>(
    node: Node<'t>,
    source: &str,
    out: &mut Vec<(HttpMethod, Option<Node<'t>>)>,
) {
    if node.kind() != "call_expression" {
        return;
    }
    let Some(target) = call_target(node, source) else {
        return;
    };
    if let Some(receiver) = target.receiver {
        collect_method_router(receiver, source, out);
    }
    if let Some(method) = HttpMethod::from_name(&target.name) {
        out.push((method, call_arguments(node).first().copied()));
    } else if target.name == "any" {
        let handler = call_arguments(node).first().copied();
        out.extend(HttpMethod::COMMON.iter().map(|m| (*m, handler)));
    }
}

/// Prefixes of the `.nest(prefix, ...)` calls whose router argument contains
/// `node`, outermost first.
fn nest_prefixes(node: Node<'_>, source: &str) -> Vec<String> {
    let mut prefixes = Vec::new();
    let mut child = node;
    for ancestor in ancestors(node) {
        if ancestor.kind() == "arguments" {
            if let Some(prefix) = ancestor
                .parent()
                .and_then(|call| nest_prefix_of(call, child, source))
            {
                prefixes.push(prefix);
            }
        }
        child = ancestor;
    }
    prefixes.reverse();
    prefixes
}

/// The prefix of `call` when it is `.nest(prefix, router)` and `arg` is the router.
fn nest_prefix_of(call: Node<'_>, arg: Node<'_>, source: &str) -> Option<String> {
    if call.kind() != "call_expression" || call_target(call, source)?.name != "nest" {
        return None;
    }
    let args = call_arguments(call);
    if args.get(1).map(|n| n.id()) != Some(arg.id()) {
        return None;
    }
    string_value(*args.first()?, source)
}

fn enclosing_function<'s>(node: Node<'_>, source: &'s str) -> Option<&'s str> {
    ancestors(node)
        .find(|n| n.kind() == "function_item")
        .and_then(|f| f.child_by_field_name("name"))
        .map(|n| node_text(n, source))
}

/// Map of function name -> prefix for routers built by a function and mounted
/// with `.nest(prefix, function())`. Chains of such functions are followed.
fn nested_function_prefixes<'t>(
    calls: impl Iterator<Item = Node<'t>>,
    source: &str,
) -> HashMap<String, String> {
    // (mounted function, nest prefix chain at the mount site, enclosing function)
    let mut mounts: Vec<(String, String, Option<String>)> = Vec::new();
    for call in calls {
        let Some(target) = call_target(call, source) else {
            continue;
        };
        if target.name != "nest" {
            continue;
        }
        let args = call_arguments(call);
        let Some(prefix) = args.first().and_then(|a| string_value(*a, source)) else {
            continue;
        };
        let Some(router) = args.get(1) else {
            continue;
        };
        if router.kind() != "call_expression" {
            continue;
        }
        let Some(mounted) = call_target(*router, source).filter(|t| t.receiver.is_none()) else {
            continue;
        };
        let mut full = String::new();
        for outer in nest_prefixes(call, source) {
            full = combine_paths(&full, &outer);
        }
        full = combine_paths(&full, &prefix);
        mounts.push((
            mounted.name,
            full,
            enclosing_function(call, source).map(String::from),
        ));
    }

    let mut resolved: HashMap<String, String> = HashMap::new();
    for _ in 0..=mounts.len() {
        let mut changed = false;
        for (function, prefix, parent) in &mounts {
            let base = parent
                .as_ref()
                .and_then(|p| resolved.get(p).cloned())
                .unwrap_or_default();
            let full = combine_paths(&base, prefix);
            if resolved.get(function) != Some(&full) {
                resolved.insert(function.clone(), full);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::tests::{parse, summarize};
    use pretty_assertions::assert_eq;

    fn extract(code: &str) -> Vec<RouteInfo> {
        let (registry, unit) = parse("main.rs", code);
        AxumExtractor.extract_routes(&unit, &registry)
    }

    #[test]
    fn test_simple_get_route() {
        let routes = extract(
            r#"
            use axum::{routing::get, Router};

            async fn hello() -> &'static str {
                "Hello, World!"
            }

            fn app() -> Router {
                Router::new().route("/hello", get(hello))
            }
            "#,
        );
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].path, "/hello");
        assert_eq!(routes[0].method, HttpMethod::Get);
        assert_eq!(routes[0].handler_name, "hello");
    }

    #[test]
    fn test_chained_method_router() {
        let routes = extract(
            r#"
            fn app() -> Router {
                Router::new()
                    .route("/users", get(list_users).post(create_user))
                    .route("/users/:id", get(get_user).delete(handlers::delete_user).layer(auth))
            }
            "#,
        );
        assert_eq!(
            summarize(&routes),
            vec![
                "DELETE /users/{id}",
                "GET /users",
                "GET /users/{id}",
                "POST /users",
            ]
        );
        let delete = routes.iter().find(|r| r.method == HttpMethod::Delete).unwrap();
        assert_eq!(delete.handler_name, "delete_user");
    }

    #[test]
    fn test_inline_nest() {
        let routes = extract(
            r#"
            fn app() -> Router {
                Router::new()
                    .route("/health", get(health))
                    .nest("/api", Router::new().route("/users", get(list_users)))
            }
            "#,
        );
        assert_eq!(summarize(&routes), vec!["GET /api/users", "GET /health"]);
    }

    #[test]
    fn test_nest_of_router_function() {
        let routes = extract(
            r#"
            fn app() -> Router {
                Router::new().nest("/api", api_routes())
            }

            fn api_routes() -> Router {
                Router::new()
                    .route("/posts", get(list_posts))
                    .nest("/v2", v2_routes())
            }

            fn v2_routes() -> Router {
                Router::new().route("/posts/:id", get(get_post))
            }
            "#,
        );
        assert_eq!(
            summarize(&routes),
            vec!["GET /api/posts", "GET /api/v2/posts/{id}"]
        );
    }

    #[test]
    fn test_closure_handler_is_named_from_route() {
        let routes = extract(
            r#"
            fn app() -> Router {
                Router::new().route("/ping", get(|| async { "pong" }))
            }
            "#,
        );
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].handler_name, "get_ping");
        assert!(routes[0].handler_lines.is_some());
    }
}
