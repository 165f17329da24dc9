use crate::extractor::{call_arguments, call_target, combine_paths, short_name, HttpMethod, RouteExtractor, RouteInfo};
use crate::parser::{named_children, node_text, string_value, GrammarRegistry, LineRange, QueryKind, SourceUnit};
use std::collections::HashMap;
use tree_sitter::Node;

/// Flask and FastAPI route extractor
///
/// Reads `@app.route("/p", methods=[...])`, `@router.get("/p")` and
/// `@bp.post("/p")` decorators. Router prefixes come from
/// `APIRouter(prefix=...)`, `Blueprint(..., url_prefix=...)`,
/// `include_router(r, prefix=...)` and `register_blueprint(bp, url_prefix=...)`
/// in the same file.
pub struct PythonExtractor;

impl RouteExtractor for PythonExtractor {
    fn extract_routes(&self, unit: &SourceUnit, registry: &GrammarRegistry) -> Vec<RouteInfo> {
        let source = unit.text.as_str();
        let prefixes = router_prefixes(unit, registry);

        let mut routes = Vec::new();
        for m in registry.query(unit, QueryKind::RouteDecorator) {
            let (Some(decorator), Some(target)) = (m.node("decorator"), m.text("target")) else {
                continue;
            };
            let Some(call) = named_children(decorator)
                .into_iter()
                .find(|n| n.kind() == "call")
            else {
                continue;
            };
            let Some(route) = parse_route_decorator(call, source) else {
                continue;
            };
            let prefix = route
                .receiver
                .as_deref()
                .and_then(|r| prefixes.get(r))
                .map(String::as_str)
                .unwrap_or("");
            let handler_lines = m
                .node("target")
                .and_then(|t| t.parent())
                .map(LineRange::of);

            for method in route.methods {
                let mut info = RouteInfo::new(
                    combine_paths(prefix, &route.path),
                    method,
                    target.to_string(),
                    LineRange::of(decorator),
                );
                if let Some(lines) = handler_lines {
                    info = info.with_handler_lines(lines);
                }
                routes.push(info);
            }
        }
        routes
    }
}

struct DecoratorRoute {
    receiver: Option<String>,
    path: String,
    methods: Vec<HttpMethod>,
}

fn parse_route_decorator(call: Node<'_>, source: &str) -> Option<DecoratorRoute> {
    let target = call_target(call, source)?;
    let receiver = target.receiver.map(|r| node_text(r, source).to_string());
    let args = call_arguments(call);

    let path = args
        .iter()
        .find(|a| a.kind() != "keyword_argument")
        .and_then(|a| string_value(*a, source))
        .or_else(|| {
            ["rule", "path"]
                .iter()
                .find_map(|k| keyword_argument(&args, k, source))
                .and_then(|v| string_value(v, source))
        })?;

    let methods = if let Some(method) = HttpMethod::from_name(&target.name) {
        vec![method]
    } else if matches!(target.name.as_str(), "route" | "api_route") {
        let listed: Vec<HttpMethod> = keyword_argument(&args, "methods", source)
            .map(|list| {
                named_children(list)
                    .into_iter()
                    .filter_map(|item| string_value(item, source))
                    .filter_map(|name| HttpMethod::from_name(&name))
                    .collect()
            })
            .unwrap_or_default();
        if listed.is_empty() {
            vec![HttpMethod::Get]
        } else {
            listed
        }
    } else {
        return None;
    };

    Some(DecoratorRoute {
        receiver,
        path,
        methods,
    })
}

/// Value node of the keyword argument `name`.
fn keyword_argument<'t>(args: &[Node<'t>], name: &str, source: &str) -> Option<Node<'t>> {
    args.iter()
        .filter(|a| a.kind() == "keyword_argument")
        .find(|a| {
            a.child_by_field_name("name")
                .is_some_and(|n| node_text(n, source) == name)
        })
        .and_then(|a| a.child_by_field_name("value"))
}

/// Router variable -> combined path prefix.
fn router_prefixes(unit: &SourceUnit, registry: &GrammarRegistry) -> HashMap<String, String> {
    let source = unit.text.as_str();
    let mut own: HashMap<String, String> = HashMap::new();
    for m in registry.query(unit, QueryKind::RouterPrefix) {
        let (Some(var), Some(ctor), Some(call)) = (m.text("var"), m.text("ctor"), m.node("call")) else {
            continue;
        };
        let keyword = match short_name(ctor) {
            "APIRouter" => "prefix",
            "Blueprint" => "url_prefix",
            _ => continue,
        };
        let args = call
            .child_by_field_name("right")
            .map(call_arguments)
            .unwrap_or_default();
        let prefix = keyword_argument(&args, keyword, source)
            .and_then(|v| string_value(v, source))
            .unwrap_or_default();
        own.insert(var.to_string(), prefix);
    }

    // mount prefixes from include_router / register_blueprint
    let mut mounted: HashMap<String, String> = HashMap::new();
    let mut stack = vec![unit.root()];
    while let Some(node) = stack.pop() {
        if node.kind() == "call" {
            if let Some((var, prefix)) = mount_call(node, source) {
                mounted.insert(var, prefix);
            }
        }
        stack.extend(named_children(node));
    }

    let mut out = own;
    for (var, mount) in mounted {
        let entry = out.entry(var).or_default();
        *entry = combine_paths(&mount, entry);
    }
    out
}

fn mount_call(call: Node<'_>, source: &str) -> Option<(String, String)> {
    let target = call_target(call, source)?;
    let keyword = match target.name.as_str() {
        "include_router" => "prefix",
        "register_blueprint" => "url_prefix",
        _ => return None,
    };
    let args = call_arguments(call);
    let router = args.iter().find(|a| a.kind() == "identifier")?;
    let prefix = keyword_argument(&args, keyword, source).and_then(|v| string_value(v, source))?;
    Some((node_text(*router, source).to_string(), prefix))
}
