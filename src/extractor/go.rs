use crate::extractor::{
    call_arguments, call_target, combine_paths, handler_name, inline_handler_lines, HttpMethod,
    RouteExtractor, RouteInfo,
};
use crate::parser::{
    ancestors, first_string_child, node_text, string_value, GrammarRegistry, LineRange, QueryKind,
    SourceUnit,
};
use std::collections::HashMap;
use tree_sitter::Node;

/// Go router extractor for gin, echo, chi and fiber.
///
/// Recognizes verb calls (`r.GET`, `e.POST`, `r.Get`, `app.Delete`),
/// `Handle("GET", path, h)` / `Method("GET", path, h)`, `Any(path, h)` and
/// `HandleFunc(path, h).Methods("GET", ...)`. Prefixes come from
/// `g := r.Group("/p")` variables (chained), inline `.Group("/p")` receivers and
/// chi's `r.Route("/p", func(r chi.Router) { ... })`. A bare
/// `HandleFunc(path, h)` has no method and is left to the model pass.
pub struct GoExtractor;

impl RouteExtractor for GoExtractor {
    fn extract_routes(&self, unit: &SourceUnit, registry: &GrammarRegistry) -> Vec<RouteInfo> {
        let source = unit.text.as_str();
        let groups = group_prefixes(unit, registry);

        let mut routes = Vec::new();
        for m in registry.query(unit, QueryKind::RouteCall) {
            let (Some(call), Some(verb), Some(receiver)) =
                (m.node("call"), m.text("verb"), m.node("receiver"))
            else {
                continue;
            };
            let Some((methods, path, handler, router)) = parse_route_call(call, verb, receiver, source)
            else {
                continue;
            };
            // "" registers on the group root
            if !path.is_empty() && !path.starts_with('/') {
                continue;
            }

            let prefix = receiver_prefix(router, &groups, source);
            let full_path = combine_paths(&prefix, &path);
            let lines = LineRange::new(
                m.get("verb").map(|v| v.lines.start).unwrap_or(1),
                LineRange::of(call).end,
            );
            for method in methods {
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

type RouteCall<'t> = (Vec<HttpMethod>, String, Option<Node<'t>>, Node<'t>);

fn parse_route_call<'t>(
    call: Node<'t>,
    verb: &str,
    receiver: Node<'t>,
    source: &str,
) -> Option<RouteCall<'t>> {
    let args = call_arguments(call);
    match verb {
        "Handle" | "Method" | "MethodFunc" | "Add" => {
            let method = HttpMethod::from_name(&string_value(*args.first()?, source)?)?;
            let path = string_value(*args.get(1)?, source)?;
            Some((vec![method], path, args.last().copied(), receiver))
        }
        "Any" | "All" => {
            let path = string_value(*args.first()?, source)?;
            if args.len() < 2 {
                return None;
            }
            Some((HttpMethod::COMMON.to_vec(), path, args.last().copied(), receiver))
        }
        "Methods" => {
            // mux: r.HandleFunc("/p", h).Methods("GET", "POST")
            let target = call_target(receiver, source)?;
            if !matches!(target.name.as_str(), "HandleFunc" | "Handle") {
                return None;
            }
            let inner = call_arguments(receiver);
            let path = string_value(*inner.first()?, source)?;
            let methods: Vec<HttpMethod> = args
                .iter()
                .filter_map(|a| string_value(*a, source))
                .filter_map(|m| HttpMethod::from_name(&m))
                .collect();
            if methods.is_empty() {
                return None;
            }
            Some((methods, path, inner.get(1).copied(), target.receiver?))
        }
        _ => {
            // GET (gin/echo) or Get (chi/fiber); lowercase is not a router verb
            if !verb.starts_with(char::is_uppercase) {
                return None;
            }
            let method = HttpMethod::from_name(verb)?;
            let path = string_value(*args.first()?, source)?;
            if args.len() < 2 {
                return None;
            }
            Some((vec![method], path, args.last().copied(), receiver))
        }
    }
}

/// Group variable -> (parent receiver, own prefix).
fn group_prefixes(unit: &SourceUnit, registry: &GrammarRegistry) -> HashMap<String, (String, String)> {
    let source = unit.text.as_str();
    let mut groups = HashMap::new();
    for m in registry.query(unit, QueryKind::RouterPrefix) {
        if m.text("method") != Some("Group") {
            continue;
        }
        let (Some(var), Some(receiver), Some(args)) = (m.text("var"), m.node("receiver"), m.node("args")) else {
            continue;
        };
        let Some(prefix) = first_string_child(args, source) else {
            continue;
        };
        groups.insert(
            var.to_string(),
            (node_text(receiver, source).to_string(), prefix),
        );
    }
    groups
}

/// Full prefix for routes registered on `router`: group variables, inline
/// `.Group(...)` receivers and enclosing chi `Route` blocks.
fn receiver_prefix(router: Node<'_>, groups: &HashMap<String, (String, String)>, source: &str) -> String {
    let mut parts = Vec::new();

    let mut current = router;
    loop {
        if current.kind() == "call_expression" {
            let Some(target) = call_target(current, source) else {
                break;
            };
            if target.name == "Group" {
                parts.extend(call_arguments(current).first().and_then(|a| string_value(*a, source)));
            }
            match target.receiver {
                Some(next) => current = next,
                None => break,
            }
        } else {
            break;
        }
    }

    if current.kind() == "identifier" {
        let mut name = node_text(current, source).to_string();
        // bounded walk in case of self-referencing assignments
        for _ in 0..16 {
            let Some((parent, prefix)) = groups.get(&name) else {
                break;
            };
            parts.push(prefix.clone());
            name = parent.clone();
        }
    }

    for ancestor in ancestors(router) {
        if ancestor.kind() != "func_literal" {
            continue;
        }
        let Some(call) = ancestor
            .parent()
            .filter(|p| p.kind() == "argument_list")
            .and_then(|p| p.parent())
        else {
            continue;
        };
        if call_target(call, source).is_some_and(|t| t.name == "Route") {
            parts.extend(call_arguments(call).first().and_then(|a| string_value(*a, source)));
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
        let (registry, unit) = parse("main.go", code);
        GoExtractor.extract_routes(&unit, &registry)
    }

    #[test]
    fn test_gin_routes_and_groups() {
        let routes = extract(
            r#"package main

import "github.com/gin-gonic/gin"

func main() {
	r := gin.Default()
	r.GET("/ping", ping)
	v1 := r.Group("/v1")
	users := v1.Group("/users")
	users.GET("/:id", h.GetUser)
	users.POST("", h.CreateUser)
	r.Group("/admin").DELETE("/cache", purge)
	r.Run(":8080")
}
"#,
        );
        assert_eq!(
            summarize(&routes),
            vec![
                "DELETE /admin/cache",
                "GET /ping",
                "GET /v1/users/{id}",
                "POST /v1/users",
            ]
        );
        let create = routes.iter().find(|r| r.method == HttpMethod::Post).unwrap();
        assert_eq!(create.handler_name, "CreateUser");
    }

    #[test]
    fn test_chi_route_blocks() {
        let routes = extract(
            r#"package main

func routes() http.Handler {
	r := chi.NewRouter()
	r.Get("/health", health)
	r.Route("/articles", func(r chi.Router) {
		r.Get("/{articleID}", getArticle)
		r.Method("PUT", "/{articleID}", updateArticle)
	})
	return r
}
"#,
        );
        assert_eq!(
            summarize(&routes),
            vec![
                "GET /articles/{articleID}",
                "GET /health",
                "PUT /articles/{articleID}",
            ]
        );
    }

    #[test]
    fn test_client_calls_and_bare_handlefunc_are_skipped() {
        let routes = extract(
            r#"package main

func main() {
	resp, _ := http.Get("https://example.com")
	http.HandleFunc("/legacy", legacy)
	r.HandleFunc("/books/{id}", getBook).Methods("GET")
	app.Post("/upload", func(c *fiber.Ctx) error {
		return nil
	})
}
"#,
        );
        assert_eq!(
            summarize(&routes),
            vec!["GET /books/{id}", "POST /upload"]
        );
        let upload = routes.iter().find(|r| r.method == HttpMethod::Post).unwrap();
        assert_eq!(upload.handler_name, "post_upload");
        assert_eq!(upload.handler_lines, Some(LineRange::new(7, 9)));
    }
}
