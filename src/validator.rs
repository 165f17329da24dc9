//! Structural checks that gate writing the document.

use crate::error::{PipelineError, Result};
use crate::extractor::path_parameters;
use crate::openapi_builder::OpenApiDocument;
use log::{debug, warn};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

const SCHEMA_REF_PREFIX: &str = "#/components/schemas/";

/// Every structural problem found in `document`, in document order.
///
/// An empty list means the document may be written.
pub fn validate(document: &OpenApiDocument) -> Vec<String> {
    let mut problems = Vec::new();

    if !document.openapi.starts_with("3.") {
        problems.push(format!("unsupported openapi version {}", document.openapi));
    }
    if document.info.title.trim().is_empty() {
        problems.push("info.title is empty".to_string());
    }

    let schemas = document.schemas();
    let schemes = document.components.as_ref().map(|c| &c.security_schemes);
    let mut operation_ids = BTreeSet::new();

    for (path, item) in &document.paths {
        if !path.starts_with('/') {
            problems.push(format!("path {} does not start with '/'", path));
        }
        let operations = item.operations();
        if operations.is_empty() {
            problems.push(format!("path {} has no operations", path));
        }
        let template = path_parameters(path);
        for (method, operation) in operations {
            let at = format!("{} {}", method, path);
            if operation.responses.is_empty() {
                problems.push(format!("{}: no responses", at));
            }
            if let Some(id) = &operation.operation_id {
                if !operation_ids.insert(id.as_str()) {
                    problems.push(format!("{}: duplicate operationId {}", at, id));
                }
            }
            for name in &template {
                let declared = operation
                    .parameters
                    .iter()
                    .any(|p| p.location == "path" && &p.name == name && p.required);
                if !declared {
                    problems.push(format!("{}: path parameter {} is not declared", at, name));
                }
            }
            for requirement in &operation.security {
                for scheme in requirement.keys() {
                    if !schemes.is_some_and(|s| s.contains_key(scheme)) {
                        problems.push(format!("{}: unknown security scheme {}", at, scheme));
                    }
                }
            }
        }
    }

    match serde_json::to_value(document) {
        Ok(value) => check_schemas(&value, "#", schemas, &mut problems),
        Err(e) => problems.push(format!("document does not serialize: {}", e)),
    }

    debug!("Validation found {} problems", problems.len());
    problems
}

/// [`validate`], turned into the fatal error the pipeline stops on.
pub fn ensure_valid(document: &OpenApiDocument) -> Result<()> {
    let problems = validate(document);
    if problems.is_empty() {
        return Ok(());
    }
    for problem in &problems {
        warn!("Invalid document: {}", problem);
    }
    Err(PipelineError::ValidationFailed(problems))
}

/// Every `$ref` resolves and every array schema declares its items.
/// Example values are literal data and are not inspected.
fn check_schemas(
    value: &Value,
    pointer: &str,
    schemas: &BTreeMap<String, Value>,
    problems: &mut Vec<String>,
) {
    match value {
        Value::Object(map) => {
            if let Some(reference) = map.get("$ref") {
                match reference.as_str().and_then(|r| r.strip_prefix(SCHEMA_REF_PREFIX)) {
                    Some(name) if schemas.contains_key(name) => {}
                    Some(name) => problems.push(format!("{}: unresolved reference to {}", pointer, name)),
                    None => problems.push(format!("{}: unsupported reference {}", pointer, reference)),
                }
            }
            if map.get("type").and_then(Value::as_str) == Some("array")
                && !map.get("items").is_some_and(Value::is_object)
            {
                problems.push(format!("{}: array schema without items", pointer));
            }
            for (key, inner) in map {
                if key == "example" || key == "examples" {
                    continue;
                }
                let child = format!("{}/{}", pointer, key.replace('~', "~0").replace('/', "~1"));
                check_schemas(inner, &child, schemas, problems);
            }
        }
        Value::Array(items) => {
            for (i, inner) in items.iter().enumerate() {
                check_schemas(inner, &format!("{}/{}", pointer, i), schemas, problems);
            }
        }
        _ => {}
    }
}
