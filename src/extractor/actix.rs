use crate::extractor::{
    call_arguments, call_target, combine_paths, handler_name, inline_handler_lines, short_name,
    HttpMethod, RouteExtractor, RouteInfo,
};
use crate::parser::{ancestors, named_children, node_text, string_value, GrammarRegistry, LineRange, QueryKind, SourceUnit};
use log::debug;
use std::collections::BTreeMap;
use tree_sitter::Node;

/// Actix-Web route extractor
///
/// Covers the route macros (`#[get("/p")]`, `#[route("/p", method = "GET")]`)
/// and the builder API (`.route("/p", web::get().to(h))`,
/// `web::resource("/p").route(web::get().to(h))`). `web::scope` prefixes are
/// applied to builder routes and to macro handlers registered with `.service(h)`.
pub struct ActixExtractor;

impl RouteExtractor for ActixExtractor {
    fn extract_routes(&self, unit: &SourceUnit, registry: &GrammarRegistry) -> Vec<RouteInfo> {
        let source = unit.text.as_str();
        let calls = registry.query(unit, QueryKind::RouteCall);

        // handler -> scope prefixes it is registered under
        let mut services: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut routes = Vec::new();

        for m in &calls {
            let Some(call) = m.node("call") else {
                continue;
            };
            match m.text("verb") {
                Some("service") => {
                    let Some(arg) = call_arguments(call).into_iter().next() else {
                        continue;
                    };
                    if matches!(arg.kind(), "identifier" | "scoped_identifier") {
                        let name = short_name(node_text(arg, source)).to_string();
                        services.entry(name).or_default().push(scope_prefix(call, source));
                    }
                }
                Some("route") => {
                    if let Some(route) = builder_route(call, source) {
                        routes.push(route);
                    }
                }
                _ => {}
            }
        }

        for m in registry.query(unit, QueryKind::RouteDecorator) {
            let (Some(attribute), Some(item)) = (m.node("attribute"), m.node("decorator")) else {
                continue;
            };
            let Some((methods, path)) = parse_route_macro(attribute, source) else {
                continue;
            };
            let Some(function) = decorated_function(item) else {
                continue;
            };
            let Some(name) = function
                .child_by_field_name("name")
                .map(|n| node_text(n, source).to_string())
            else {
                continue;
            };
            let prefixes = services
                .get(&name)
                .cloned()
                .unwrap_or_else(|| vec![String::new()]);
            for prefix in prefixes {
                for method in &methods {
                    routes.push(
                        RouteInfo::new(
                            combine_paths(&prefix, &path),
                            *method,
                            name.clone(),
                            LineRange::of(item),
                        )
                        .with_handler_lines(LineRange::of(function)),
                    );
                }
            }
        }

        debug!("Actix: {} routes in {}", routes.len(), unit.display_path());
        routes
    }
}

/// Parse `get("/p")`, `actix_web::post("/p")` or `route("/p", method = "GET", ...)`.
fn parse_route_macro(attribute: Node<'_>, source: &str) -> Option<(Vec<HttpMethod>, String)> {
    let path_node = named_children(attribute)
        .into_iter()
        .find(|n| matches!(n.kind(), "identifier" | "scoped_identifier"))?;
    let name = short_name(node_text(path_node, source)).to_ascii_lowercase();
    let args = attribute.child_by_field_name("arguments")?;

    let mut tokens = Vec::new();
    collect_tokens(args, source, &mut tokens);
    let path = tokens.iter().find_map(|t| match t {
        Token::Str(s) => Some(s.clone()),
        Token::Ident(_) => None,
    })?;

    if let Some(method) = HttpMethod::from_name(&name) {
        return Some((vec![method], path));
    }
    if name != "route" {
        return None;
    }
    let mut methods = Vec::new();
    for (i, token) in tokens.iter().enumerate() {
        if !matches!(token, Token::Ident(id) if id == "method") {
            continue;
        }
        let method = tokens[i + 1..].iter().find_map(|t| match t {
            Token::Str(s) => HttpMethod::from_name(s),
            Token::Ident(_) => None,
        });
        methods.extend(method);
    }
    if methods.is_empty() {
        methods.extend(HttpMethod::COMMON);
    }
    Some((methods, path))
}

enum Token {
    Ident(String),
    Str(String),
}

fn collect_tokens(node: Node<'_>, source: &str, out: &mut Vec<Token>) {
    match node.kind() {
        "identifier" => out.push(Token::Ident(node_text(node, source).to_string())),
        "string_literal" | "raw_string_literal" => {
            if let Some(value) = string_value(node, source) {
                out.push(Token::Str(value));
            }
            return;
        }
        _ => {}
    }
    for child in named_children(node) {
        collect_tokens(child, source, out);
    }
}

/// The function an attribute item is attached to, skipping sibling attributes and comments.
fn decorated_function(item: Node<'_>) -> Option<Node<'_>> {
    let mut next = item.next_named_sibling();
    while let Some(node) = next {
        match node.kind() {
            "function_item" => return Some(node),
            "attribute_item" | "line_comment" | "block_comment" => next = node.next_named_sibling(),
            _ => return None,
        }
    }
    None
}

/// `.route("/p", web::get().to(h))` or `web::resource("/p").route(web::get().to(h))`.
fn builder_route(call: Node<'_>, source: &str) -> Option<RouteInfo> {
    let args = call_arguments(call);
    let (path, route_arg) = match args.first().and_then(|a| string_value(*a, source)) {
        Some(path) => (path, *args.get(1)?),
        None => (chain_argument(call, "resource", source)?, *args.first()?),
    };

    let target = call_target(route_arg, source)?;
    if !matches!(target.name.as_str(), "to" | "to_async") {
        return None;
    }
    let method = builder_method(target.receiver?, source)?;
    let handler = call_arguments(route_arg).into_iter().next();
    let full_path = combine_paths(&scope_prefix(call, source), &path);

    let lines = LineRange::new(
        call.child_by_field_name("function")
            .and_then(|f| f.child_by_field_name("field"))
            .map(|f| f.start_position().row + 1)
            .unwrap_or(1),
        LineRange::of(call).end,
    );
    let mut route = RouteInfo::new(
        full_path.clone(),
        method,
        handler_name(handler, source, method, &full_path),
        lines,
    );
    if let Some(lines) = inline_handler_lines(handler) {
        route = route.with_handler_lines(lines);
    }
    Some(route)
}

/// Method of a builder such as `web::get()` or `web::post().guard(..)`.
fn builder_method(node: Node<'_>, source: &str) -> Option<HttpMethod> {
    let mut current = node;
    loop {
        if current.kind() != "call_expression" {
            return None;
        }
        let target = call_target(current, source)?;
        if let Some(method) = HttpMethod::from_name(&target.name) {
            return Some(method);
        }
        current = target.receiver?;
    }
}

/// First string argument of the call named `name` in the receiver chain of `call`.
fn chain_argument(call: Node<'_>, name: &str, source: &str) -> Option<String> {
    let mut current = call;
    loop {
        if current.kind() != "call_expression" {
            return None;
        }
        let target = call_target(current, source)?;
        if target.name == name {
            return call_arguments(current)
                .first()
                .and_then(|a| string_value(*a, source));
        }
        current = target.receiver?;
    }
}

/// Combined `web::scope` prefix for a call: its own receiver chain plus every
/// enclosing `.service(scope...)` it is passed to, outermost first.
fn scope_prefix(call: Node<'_>, source: &str) -> String {
    let mut parts: Vec<String> = chain_argument(call, "scope", source).into_iter().collect();
    for ancestor in ancestors(call) {
        if ancestor.kind() != "arguments" {
            continue;
        }
        if let Some(outer) = ancestor.parent().filter(|p| p.kind() == "call_expression") {
            parts.extend(chain_argument(outer, "scope", source));
        }
    }
    parts
        .iter()
        .rev()
        .fold(String::new(), |acc, part| combine_paths(&acc, part))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::tests::{parse, summarize};
    use pretty_assertions::assert_eq;

    fn extract(code: &str) -> Vec<RouteInfo> {
        let (registry, unit) = parse("main.rs", code);
        ActixExtractor.extract_routes(&unit, &registry)
    }

    #[test]
    fn test_simple_get_route() {
        let routes = extract(
            r#"
            use actix_web::{get, HttpResponse};

            #[get("/hello")]
            async fn hello() -> HttpResponse {
                HttpResponse::Ok().body("Hello world!")
            }
            "#,
        );
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].path, "/hello");
        assert_eq!(routes[0].method, HttpMethod::Get);
        assert_eq!(routes[0].handler_name, "hello");
        assert_eq!(routes[0].handler_lines, Some(LineRange::new(5, 7)));
    }

    #[test]
    fn test_multiple_http_methods() {
        let routes = extract(
            r#"
            #[get("/resource")]
            async fn get_resource() -> HttpResponse { HttpResponse::Ok().finish() }

            #[post("/resource")]
            async fn create_resource() -> HttpResponse { HttpResponse::Created().finish() }

            #[actix_web::put("/resource/{id}")]
            async fn update_resource() -> HttpResponse { HttpResponse::Ok().finish() }

            #[delete("/resource/{id}")]
            async fn delete_resource() -> HttpResponse { HttpResponse::NoContent().finish() }

            #[route("/resource/{id}", method = "PATCH", method = "HEAD")]
            async fn patch_resource() -> HttpResponse { HttpResponse::Ok().finish() }
            "#,
        );
        assert_eq!(
            summarize(&routes),
            vec![
                "DELETE /resource/{id}",
                "GET /resource",
                "HEAD /resource/{id}",
                "PATCH /resource/{id}",
                "POST /resource",
                "PUT /resource/{id}",
            ]
        );
    }

    #[test]
    fn test_scope_handling() {
        let routes = extract(
            r#"
            use actix_web::{web, get, HttpResponse, App};

            #[get("/users")]
            async fn list_users() -> HttpResponse {
                HttpResponse::Ok().finish()
            }

            #[get("/users/{id}")]
            async fn get_user() -> HttpResponse {
                HttpResponse::Ok().finish()
            }

            fn config(cfg: &mut web::ServiceConfig) {
                cfg.service(
                    web::scope("/api")
                        .service(list_users)
                        .service(get_user)
                );
            }
            "#,
        );
        assert_eq!(
            summarize(&routes),
            vec!["GET /api/users", "GET /api/users/{id}"]
        );
    }

    #[test]
    fn test_builder_routes() {
        let routes = extract(
            r#"
            fn config(cfg: &mut web::ServiceConfig) {
                cfg.service(
                    web::scope("/v1")
                        .route("/items", web::get().to(list_items))
                        .route("/items", web::post().to(create_item))
                        .service(
                            web::resource("/items/{id}")
                                .route(web::get().to(get_item))
                                .route(web::delete().to(delete_item)),
                        ),
                );
            }
            "#,
        );
        assert_eq!(
            summarize(&routes),
            vec![
                "DELETE /v1/items/{id}",
                "GET /v1/items",
                "GET /v1/items/{id}",
                "POST /v1/items",
            ]
        );
        let create = routes.iter().find(|r| r.method == HttpMethod::Post).unwrap();
        assert_eq!(create.handler_name, "create_item");
    }
}
