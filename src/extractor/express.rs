use crate::extractor::{
    call_arguments, call_target, combine_paths, handler_name, inline_handler_lines, short_name,
    HttpMethod, RouteExtractor, RouteInfo,
};
use crate::parser::{node_text, string_value, GrammarRegistry, LineRange, QueryKind, SourceUnit};
use log::debug;
use std::collections::HashMap;
use tree_sitter::Node;

const ROUTE_OBJECT_KEYWORDS: &[&str] = &["app", "router", "route", "api", "controller", "server"];
const ROUTE_OBJECT_SUFFIXES: &[&str] = &["router", "routes", "route", "app", "server", "controller", "api"];
const ROUTE_OBJECT_PREFIXES: &[&str] = &["app", "api"];

/// Express route extractor
///
/// Matches `<receiver>.<verb>('/path', ...handlers)` where the receiver looks
/// like a router object, plus `router.route('/path').get(h).post(h2)` chains.
/// `app.use('/prefix', router)` mounts in the same file prefix the routes of
/// that router. The last argument is taken as the handler.
pub struct ExpressExtractor;

impl RouteExtractor for ExpressExtractor {
    fn extract_routes(&self, unit: &SourceUnit, registry: &GrammarRegistry) -> Vec<RouteInfo> {
        let source = unit.text.as_str();

        let mut mounts: HashMap<String, String> = HashMap::new();
        for m in registry.query(unit, QueryKind::RouterPrefix) {
            if m.text("method") != Some("use") {
                continue;
            }
            let (Some(var), Some(prefix)) = (
                m.text("var"),
                m.node("prefix").and_then(|p| string_value(p, source)),
            ) else {
                continue;
            };
            mounts.insert(var.to_string(), prefix);
        }

        let mut routes = Vec::new();
        for m in registry.query(unit, QueryKind::RouteCall) {
            let (Some(call), Some(verb), Some(receiver)) =
                (m.node("call"), m.text("verb"), m.node("receiver"))
            else {
                continue;
            };
            let verb = verb.to_ascii_lowercase();
            let methods: Vec<HttpMethod> = match HttpMethod::from_name(&verb) {
                Some(method) => vec![method],
                None if verb == "all" => HttpMethod::COMMON.to_vec(),
                None => continue,
            };

            let args = call_arguments(call);
            let (path, router) = match args.first().and_then(|a| string_value(*a, source)) {
                Some(path) => (path, receiver),
                None => match route_chain(receiver, source) {
                    Some(found) => found,
                    None => {
                        if args.first().is_some_and(|a| a.kind() == "template_string") {
                            debug!("Skipping dynamic route path at line {}", LineRange::of(call).start);
                        }
                        continue;
                    }
                },
            };
            if args.is_empty() || !looks_like_route_object(object_name(router, source)) {
                continue;
            }
            // `app.get('setting')` reads configuration: a route needs a handler
            if args.len() < 2 && string_value(args[0], source).is_some() {
                continue;
            }

            let prefix = mounts
                .get(object_name(router, source))
                .map(String::as_str)
                .unwrap_or("");
            let full_path = combine_paths(prefix, &path);
            let handler = args.last().copied();
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

/// For `router.route('/p').get(h)`: the path of the `.route(...)` call and its receiver.
fn route_chain<'t>(receiver: Node<'t>, source: &str) -> Option<(String, Node<'t>)> {
    let mut current = receiver;
    while current.kind() == "call_expression" {
        let target = call_target(current, source)?;
        if target.name == "route" {
            let path = call_arguments(current)
                .first()
                .and_then(|a| string_value(*a, source))?;
            return Some((path, target.receiver?));
        }
        current = target.receiver?;
    }
    None
}

/// Name of the object a route is registered on: `router`, `this.app` -> `app`.
fn object_name<'s>(node: Node<'_>, source: &'s str) -> &'s str {
    short_name(node_text(node, source))
}

fn looks_like_route_object(name: &str) -> bool {
    let low = name.to_ascii_lowercase();
    ROUTE_OBJECT_KEYWORDS.contains(&low.as_str())
        || ROUTE_OBJECT_SUFFIXES.iter().any(|s| low.ends_with(s))
        || ROUTE_OBJECT_PREFIXES.iter().any(|p| low.starts_with(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::tests::{parse, summarize};
    use pretty_assertions::assert_eq;

    fn extract(path: &str, code: &str) -> Vec<RouteInfo> {
        let (registry, unit) = parse(path, code);
        ExpressExtractor.extract_routes(&unit, &registry)
    }

    #[test]
    fn test_basic_routes() {
        let routes = extract(
            "app.js",
            r#"
const express = require('express');
const app = express();

app.get('/posts', listPosts);
app.post('/posts', auth, createPost);
app.get('/posts/:id', (req, res) => {
  res.json({ id: req.params.id });
});
app.listen(3000);
"#,
        );
        assert_eq!(
            summarize(&routes),
            vec!["GET /posts", "GET /posts/{id}", "POST /posts"]
        );
        let create = routes.iter().find(|r| r.method == HttpMethod::Post).unwrap();
        assert_eq!(create.handler_name, "createPost");
        let show = routes.iter().find(|r| r.path == "/posts/:id").unwrap();
        assert_eq!(show.handler_name, "get_posts_id");
        assert_eq!(show.handler_lines, Some(LineRange::new(7, 9)));
    }

    #[test]
    fn test_router_mount_and_route_chain() {
        let routes = extract(
            "server.js",
            r#"
const usersRouter = express.Router();
usersRouter.route('/users/:id').get(getUser).put(updateUser);
usersRouter.delete('/users/:id', controller.removeUser);
app.use('/api', usersRouter);
"#,
        );
        assert_eq!(
            summarize(&routes),
            vec![
                "DELETE /api/users/{id}",
                "GET /api/users/{id}",
                "PUT /api/users/{id}",
            ]
        );
        let delete = routes.iter().find(|r| r.method == HttpMethod::Delete).unwrap();
        assert_eq!(delete.handler_name, "removeUser");
    }

    #[test]
    fn test_non_router_receivers_and_dynamic_paths_are_skipped() {
        let routes = extract(
            "client.ts",
            r#"
const value = cache.get('/key', fallback);
http.get('/status', onStatus);
app.get('env');
app.get(`/items/${id}`, handler);
api.all('/ping', ping);
"#,
        );
        assert_eq!(
            summarize(&routes),
            vec![
                "DELETE /ping",
                "GET /ping",
                "PATCH /ping",
                "POST /ping",
                "PUT /ping",
            ]
        );
    }
}
