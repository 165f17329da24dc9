//! Reconciliation of a freshly built document with the previous run's output.
//!
//! Schema names are already stabilized while building (see
//! [`SchemaGenerator::with_baseline`](crate::schema_generator::SchemaGenerator::with_baseline)).
//! This pass works on whole operations: it reports what was added and
//! removed, and with `preserve_removed_endpoints` carries removed operations
//! over together with every component they reference.

use crate::error::Result;
use crate::extractor::HttpMethod;
use crate::openapi_builder::{unique_operation_id, Components, OpenApiDocument, Operation};
use crate::schema_generator::ref_name;
use log::{debug, info};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

const SCHEMA_REF_PREFIX: &str = "#/components/schemas/";

#[derive(Debug)]
pub struct MergeReport {
    pub document: OpenApiDocument,
    /// `METHOD /path` of operations absent from the baseline.
    pub added: Vec<String>,
    /// `METHOD /path` of baseline operations the new run no longer finds.
    pub removed: Vec<String>,
    /// How many removed operations were carried over.
    pub preserved: usize,
    /// Baseline component name -> name it was copied under.
    pub renamed: BTreeMap<String, String>,
}

pub fn merge(
    document: OpenApiDocument,
    baseline: Option<&OpenApiDocument>,
    preserve_removed: bool,
) -> Result<MergeReport> {
    let Some(baseline) = baseline else {
        let added = operation_keys(&document)
            .into_iter()
            .map(|(path, method)| label(&path, method))
            .collect();
        return Ok(MergeReport {
            document,
            added,
            removed: Vec::new(),
            preserved: 0,
            renamed: BTreeMap::new(),
        });
    };

    let current = operation_keys(&document);
    let previous = operation_keys(baseline);
    let added: Vec<String> = current
        .difference(&previous)
        .map(|(p, m)| label(p, *m))
        .collect();
    let removed_keys: Vec<(String, HttpMethod)> = previous.difference(&current).cloned().collect();
    let removed: Vec<String> = removed_keys.iter().map(|(p, m)| label(p, *m)).collect();

    let mut report = MergeReport {
        document,
        added,
        removed,
        preserved: 0,
        renamed: BTreeMap::new(),
    };
    if preserve_removed && !removed_keys.is_empty() {
        preserve(&mut report, baseline, &removed_keys)?;
    }

    info!(
        "Merge: {} added, {} removed, {} preserved",
        report.added.len(),
        report.removed.len(),
        report.preserved
    );
    Ok(report)
}

fn preserve(
    report: &mut MergeReport,
    baseline: &OpenApiDocument,
    removed: &[(String, HttpMethod)],
) -> Result<()> {
    let operations: Vec<(String, HttpMethod, Operation)> = removed
        .iter()
        .filter_map(|(path, method)| {
            baseline
                .operation(path, *method)
                .map(|op| (path.clone(), *method, op.clone()))
        })
        .collect();

    // components reachable from the carried operations
    let mut needed = BTreeSet::new();
    for (_, _, op) in &operations {
        collect_refs(&serde_json::to_value(op)?, &mut needed);
    }
    let baseline_schemas = baseline.schemas();
    let mut queue: Vec<String> = needed.iter().cloned().collect();
    while let Some(name) = queue.pop() {
        if let Some(schema) = baseline_schemas.get(&name) {
            let mut nested = BTreeSet::new();
            collect_refs(schema, &mut nested);
            for n in nested {
                if needed.insert(n.clone()) {
                    queue.push(n);
                }
            }
        }
    }

    // preserved operations must not reuse an operationId the new run assigned
    let mut operation_ids: BTreeSet<String> = report
        .document
        .paths
        .values()
        .flat_map(|item| item.operations())
        .filter_map(|(_, op)| op.operation_id.clone())
        .collect();

    let components = report
        .document
        .components
        .get_or_insert_with(Components::default);

    // decide names before copying so references can be rewritten in one pass
    let mut renames: BTreeMap<String, String> = BTreeMap::new();
    let mut copies: Vec<(String, String)> = Vec::new();
    for name in &needed {
        let Some(schema) = baseline_schemas.get(name) else {
            // dangling in the baseline; validation reports it
            continue;
        };
        match components.schemas.get(name) {
            Some(existing) if existing == schema => {}
            Some(_) => {
                let fresh = (2..)
                    .map(|n| format!("{}{}", name, n))
                    .find(|candidate| {
                        !components.schemas.contains_key(candidate)
                            && !needed.contains(candidate)
                            && !renames.values().any(|v| v == candidate)
                    })
                    .unwrap_or_else(|| format!("{}Previous", name));
                debug!("Renaming preserved component {} to {}", name, fresh);
                renames.insert(name.clone(), fresh.clone());
                copies.push((name.clone(), fresh));
            }
            None => copies.push((name.clone(), name.clone())),
        }
    }

    for (from, to) in copies {
        if let Some(schema) = baseline_schemas.get(&from) {
            let mut schema = schema.clone();
            rewrite_refs(&mut schema, &renames);
            components.schemas.insert(to, schema);
        }
    }

    let baseline_schemes = baseline
        .components
        .as_ref()
        .map(|c| &c.security_schemes);
    for (path, method, op) in operations {
        let mut value = serde_json::to_value(&op)?;
        rewrite_refs(&mut value, &renames);
        let mut op: Operation = serde_json::from_value(value)?;
        if let Some(id) = op.operation_id.take() {
            let unique = unique_operation_id(&mut operation_ids, &id, method);
            if unique != id {
                debug!("Renaming preserved operationId {} to {}", id, unique);
            }
            op.operation_id = Some(unique);
        }

        for requirement in &op.security {
            for scheme in requirement.keys() {
                if let Some(definition) = baseline_schemes.and_then(|s| s.get(scheme)) {
                    components
                        .security_schemes
                        .entry(scheme.clone())
                        .or_insert_with(|| definition.clone());
                }
            }
        }
        debug!("Preserving removed operation {}", label(&path, method));
        *report
            .document
            .paths
            .entry(path)
            .or_default()
            .slot(method) = Some(op);
        report.preserved += 1;
    }

    if components.schemas.is_empty() && components.security_schemes.is_empty() {
        report.document.components = None;
    }
    report.renamed = renames;
    Ok(())
}

fn operation_keys(document: &OpenApiDocument) -> BTreeSet<(String, HttpMethod)> {
    document
        .paths
        .iter()
        .flat_map(|(path, item)| {
            item.operations()
                .into_iter()
                .map(move |(method, _)| (path.clone(), method))
        })
        .collect()
}

fn label(path: &str, method: HttpMethod) -> String {
    format!("{} {}", method, path)
}

/// Every component schema name referenced anywhere inside `value`.
pub fn collect_refs(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) => {
            if let Some(name) = ref_name(value) {
                out.insert(name.to_string());
            }
            for inner in map.values() {
                collect_refs(inner, out);
            }
        }
        Value::Array(items) => items.iter().for_each(|i| collect_refs(i, out)),
        _ => {}
    }
}

fn rewrite_refs(value: &mut Value, renames: &BTreeMap<String, String>) {
    if renames.is_empty() {
        return;
    }
    match value {
        Value::Object(map) => {
            if let Some(Value::String(reference)) = map.get_mut("$ref") {
                if let Some(new) = reference
                    .strip_prefix(SCHEMA_REF_PREFIX)
                    .and_then(|name| renames.get(name))
                {
                    *reference = format!("{}{}", SCHEMA_REF_PREFIX, new);
                }
            }
            for inner in map.values_mut() {
                rewrite_refs(inner, renames);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|i| rewrite_refs(i, renames)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn document(value: Value) -> OpenApiDocument {
        serde_json::from_value(value).unwrap()
    }

    fn baseline() -> OpenApiDocument {
        document(json!({
            "openapi": "3.0.3",
            "info": {"title": "blog", "version": "1.0.0"},
            "paths": {
                "/users/{id}": {"get": {
                    "operationId": "getUser",
                    "parameters": [{"name": "id", "in": "path", "required": true, "schema": {"type": "string"}}],
                    "responses": {"200": {"description": "ok", "content": {"application/json": {"schema": {"$ref": "#/components/schemas/User"}}}}}
                }},
                "/legacy": {"post": {
                    "operationId": "legacy",
                    "requestBody": {"required": true, "content": {"application/json": {"schema": {"$ref": "#/components/schemas/LegacyRequest"}}}},
                    "responses": {"200": {"description": "ok"}},
                    "security": [{"apiKeyAuth": []}]
                }}
            },
            "components": {
                "schemas": {
                    "User": {"type": "object", "properties": {"id": {"type": "string"}}},
                    "LegacyRequest": {"type": "object", "properties": {"owner": {"$ref": "#/components/schemas/User"}}}
                },
                "securitySchemes": {"apiKeyAuth": {"type": "apiKey", "in": "header", "name": "X-API-Key"}}
            }
        }))
    }

    /// New run: GET /users/{id} still there, but `User` changed shape.
    fn current() -> OpenApiDocument {
        document(json!({
            "openapi": "3.0.3",
            "info": {"title": "blog", "version": "1.0.0"},
            "paths": {
                "/users/{id}": {"get": {
                    "operationId": "getUser",
                    "parameters": [{"name": "id", "in": "path", "required": true, "schema": {"type": "string"}}],
                    "responses": {"200": {"description": "ok", "content": {"application/json": {"schema": {"$ref": "#/components/schemas/User"}}}}}
                }},
                "/posts": {"get": {"operationId": "listPosts", "responses": {"200": {"description": "ok"}}}}
            },
            "components": {"schemas": {
                "User": {"type": "object", "properties": {"id": {"type": "integer"}, "email": {"type": "string"}}}
            }}
        }))
    }

    #[test]
    fn test_without_baseline_everything_is_added() {
        let report = merge(current(), None, false).unwrap();
        assert_eq!(report.added, vec!["GET /posts", "GET /users/{id}"]);
        assert!(report.removed.is_empty());
    }

    #[test]
    fn test_removed_endpoints_are_dropped_by_default() {
        let report = merge(current(), Some(&baseline()), false).unwrap();
        assert_eq!(report.added, vec!["GET /posts"]);
        assert_eq!(report.removed, vec!["POST /legacy"]);
        assert_eq!(report.preserved, 0);
        assert!(report.document.paths.get("/legacy").is_none());
    }

    #[test]
    fn test_preserved_endpoint_brings_components() {
        let report = merge(current(), Some(&baseline()), true).unwrap();
        assert_eq!(report.preserved, 1);
        assert_eq!(report.renamed, BTreeMap::from([("User".to_string(), "User2".to_string())]));

        let document = report.document;
        let legacy = document.operation("/legacy", HttpMethod::Post).unwrap();
        assert_eq!(
            legacy.request_body.as_ref().unwrap().json_schema(),
            Some(&json!({"$ref": "#/components/schemas/LegacyRequest"}))
        );

        let schemas = document.schemas();
        assert_eq!(
            schemas.keys().collect::<Vec<_>>(),
            vec!["LegacyRequest", "User", "User2"]
        );
        assert_eq!(
            schemas["LegacyRequest"]["properties"]["owner"],
            json!({"$ref": "#/components/schemas/User2"})
        );
        assert_eq!(schemas["User2"]["properties"]["id"]["type"], "string");
        assert!(document
            .components
            .as_ref()
            .unwrap()
            .security_schemes
            .contains_key("apiKeyAuth"));
    }

    #[test]
    fn test_preserved_operation_id_does_not_collide() {
        let mut current = current();
        current
            .paths
            .get_mut("/posts")
            .unwrap()
            .slot(HttpMethod::Get)
            .as_mut()
            .unwrap()
            .operation_id = Some("legacy".to_string());

        let report = merge(current, Some(&baseline()), true).unwrap();
        let document = report.document;
        let legacy = document.operation("/legacy", HttpMethod::Post).unwrap();
        assert_eq!(legacy.operation_id.as_deref(), Some("legacy_post"));
        let posts = document.operation("/posts", HttpMethod::Get).unwrap();
        assert_eq!(posts.operation_id.as_deref(), Some("legacy"));
        assert_eq!(crate::validator::validate(&document), Vec::<String>::new());
    }

    #[test]
    fn test_collect_refs() {
        let mut refs = BTreeSet::new();
        collect_refs(
            &json!({"a": [{"$ref": "#/components/schemas/A"}], "b": {"items": {"$ref": "#/components/schemas/B"}}}),
            &mut refs,
        );
        assert_eq!(refs.into_iter().collect::<Vec<_>>(), vec!["A", "B"]);
    }
}
