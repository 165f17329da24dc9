//! Endpoint enrichment: parameters, schemas, responses and security inferred
//! by the completion service from the handler source and retrieved context.
//!
//! Each reply is validated strictly. A rejected reply gets one corrective
//! retry listing the problems; after that the valid parts of the last reply
//! are salvaged and the endpoint is marked degraded. Endpoints are never
//! dropped: a failed service call also yields a degraded endpoint built from
//! the path template and the raw parameter hints.

use crate::context::{ContextChunk, ContextIndex};
use crate::error::{FailureKind, SoftFailure};
use crate::extractor::{path_parameters, EndpointCandidate, ExtractionMethod};
use crate::parser::SourceUnit;
use crate::prompts::{self, EnrichmentInput};
use crate::service::{CompletionRequest, Purpose, ServiceGateway};
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

/// Middleware chunks shared by every enrichment prompt.
const SECURITY_CHUNKS: usize = 2;
const MODEL_EXTRACTION_FACTOR: f32 = 0.8;
const DEGRADED_FACTOR: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterLocation {
    Path,
    Query,
    Header,
    Body,
}

impl ParameterLocation {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "path" => Some(ParameterLocation::Path),
            "query" => Some(ParameterLocation::Query),
            "header" => Some(ParameterLocation::Header),
            "body" => Some(ParameterLocation::Body),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterLocation::Path => "path",
            ParameterLocation::Query => "query",
            ParameterLocation::Header => "header",
            ParameterLocation::Body => "body",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferredParameter {
    pub name: String,
    pub location: ParameterLocation,
    /// JSON schema primitive type name.
    pub schema_type: String,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferredResponse {
    pub description: String,
    pub schema: Option<Value>,
}

/// Authentication schemes the document can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SecurityScheme {
    Bearer,
    ApiKey,
    Basic,
    OAuth2,
    Cookie,
}

impl SecurityScheme {
    /// Map a free-form scheme name from a model reply.
    pub fn from_hint(hint: &str) -> Option<Self> {
        let low = hint.trim().to_ascii_lowercase().replace(['_', '-', ' '], "");
        match low.as_str() {
            "bearer" | "bearerauth" | "jwt" | "token" | "http" => Some(SecurityScheme::Bearer),
            "apikey" | "apikeyauth" | "key" => Some(SecurityScheme::ApiKey),
            "basic" | "basicauth" => Some(SecurityScheme::Basic),
            "oauth" | "oauth2" | "openidconnect" => Some(SecurityScheme::OAuth2),
            "cookie" | "cookieauth" | "session" => Some(SecurityScheme::Cookie),
            _ => None,
        }
    }

    /// Name under `components.securitySchemes`.
    pub fn name(&self) -> &'static str {
        match self {
            SecurityScheme::Bearer => "bearerAuth",
            SecurityScheme::ApiKey => "apiKeyAuth",
            SecurityScheme::Basic => "basicAuth",
            SecurityScheme::OAuth2 => "oauth2",
            SecurityScheme::Cookie => "cookieAuth",
        }
    }

    /// Canonical security scheme object.
    pub fn definition(&self) -> Value {
        match self {
            SecurityScheme::Bearer => json!({"type": "http", "scheme": "bearer", "bearerFormat": "JWT"}),
            SecurityScheme::ApiKey => json!({"type": "apiKey", "in": "header", "name": "X-API-Key"}),
            SecurityScheme::Basic => json!({"type": "http", "scheme": "basic"}),
            SecurityScheme::OAuth2 => json!({
                "type": "oauth2",
                "flows": {"authorizationCode": {
                    "authorizationUrl": "/oauth/authorize",
                    "tokenUrl": "/oauth/token",
                    "scopes": {}
                }}
            }),
            SecurityScheme::Cookie => json!({"type": "apiKey", "in": "cookie", "name": "session"}),
        }
    }
}

impl fmt::Display for SecurityScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for SecurityScheme {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

/// A candidate plus everything inferred about it.
#[derive(Debug, Clone, Serialize)]
pub struct EnrichedEndpoint {
    pub candidate: EndpointCandidate,
    pub summary: Option<String>,
    pub parameters: Vec<InferredParameter>,
    pub request_body: Option<Value>,
    /// Status code -> response.
    pub responses: BTreeMap<String, InferredResponse>,
    pub security: Vec<SecurityScheme>,
    pub example: Option<Value>,
    pub confidence: f32,
    /// Why the endpoint carries best-effort fields, when it does.
    pub degraded: Option<String>,
}

impl EnrichedEndpoint {
    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }
}

/// What one reply yielded, valid parts only.
#[derive(Debug, Clone, Default, PartialEq)]
struct Inference {
    summary: Option<String>,
    parameters: Vec<InferredParameter>,
    request_body: Option<Value>,
    responses: BTreeMap<String, InferredResponse>,
    security: Vec<SecurityScheme>,
    example: Option<Value>,
}

pub struct Enricher<'a> {
    units: BTreeMap<&'a Path, &'a SourceUnit>,
    index: &'a ContextIndex,
    gateway: &'a ServiceGateway,
    max_context_chunks: usize,
}

impl<'a> Enricher<'a> {
    pub fn new(
        units: &'a [SourceUnit],
        index: &'a ContextIndex,
        gateway: &'a ServiceGateway,
        max_context_chunks: usize,
    ) -> Self {
        Self {
            units: units.iter().map(|u| (u.path.as_path(), u)).collect(),
            index,
            gateway,
            max_context_chunks,
        }
    }

    /// Enrich every candidate. Output order follows the candidates' sort key,
    /// not completion order.
    pub async fn enrich_all(
        &self,
        candidates: Vec<EndpointCandidate>,
    ) -> (Vec<EnrichedEndpoint>, Vec<SoftFailure>) {
        info!("Enriching {} endpoints", candidates.len());
        let security = self
            .index
            .security_context(SECURITY_CHUNKS, self.gateway)
            .await;

        let results = futures::future::join_all(
            candidates.into_iter().map(|c| self.enrich(c, &security)),
        )
        .await;

        let mut endpoints = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        for (endpoint, failure) in results {
            endpoints.push(endpoint);
            failures.extend(failure);
        }
        endpoints.sort_by(|a, b| {
            let (a, b) = (&a.candidate, &b.candidate);
            (&a.path, a.method, &a.location, &a.handler).cmp(&(&b.path, b.method, &b.location, &b.handler))
        });

        let degraded = endpoints.iter().filter(|e| e.is_degraded()).count();
        info!(
            "Enrichment complete: {} endpoints, {} degraded",
            endpoints.len(),
            degraded
        );
        (endpoints, failures)
    }

    async fn enrich(
        &self,
        candidate: EndpointCandidate,
        security: &[&ContextChunk],
    ) -> (EnrichedEndpoint, Option<SoftFailure>) {
        let subject = format!(
            "{} {} ({})",
            candidate.method,
            candidate.path,
            candidate.location.file.display()
        );
        let budget = self.gateway.policy().max_input_chars;
        let handler_text = self
            .units
            .get(candidate.location.file.as_path())
            .map(|u| u.lines(candidate.handler_range()))
            .unwrap_or_default();
        let handler_text = prompts::truncate_chars(&handler_text, budget / 3);

        let query = format!("{} {}\n{}", candidate.method, candidate.path, handler_text);
        let context = self
            .index
            .retrieve(&query, self.max_context_chunks, self.gateway)
            .await;
        let per_chunk = budget / (3 * self.max_context_chunks.max(1));
        let method = candidate.method.to_string();
        let input = EnrichmentInput {
            method: &method,
            path: &candidate.path,
            framework: &candidate.tag.framework,
            handler: &candidate.handler,
            handler_text,
            raw_params: &candidate.raw_params,
            context: context
                .iter()
                .map(|c| prompts::truncate_chars(&c.text, per_chunk))
                .collect(),
            security_context: security
                .iter()
                .map(|c| prompts::truncate_chars(&c.text, budget / 12))
                .collect(),
        };
        let prompt = prompts::enrichment_prompt(&input);
        let request = CompletionRequest {
            purpose: Purpose::Enrichment,
            system: prompts::ENRICH_SYSTEM.to_string(),
            prompt,
        };

        let first = match self.gateway.complete(&request).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Enrichment of {} failed: {}", subject, e);
                let reason = format!("service unavailable: {}", e);
                let failure = SoftFailure::new(&subject, FailureKind::ServiceUnavailable, e.to_string());
                return (finalize(candidate, Inference::default(), Some(reason)), Some(failure));
            }
        };

        let problems = match strict(&first) {
            Ok(inference) => return (finalize(candidate, inference, None), None),
            Err(problems) => problems,
        };
        debug!("{}: reply rejected ({}), retrying", subject, problems.join("; "));

        let retry = CompletionRequest {
            prompt: prompts::corrective_prompt(&request.prompt, &problems),
            ..request
        };
        let (salvage_from, failure) = match self.gateway.complete(&retry).await {
            Ok(second) => match strict(&second) {
                Ok(inference) => return (finalize(candidate, inference, None), None),
                Err(problems) => (
                    second,
                    SoftFailure::new(&subject, FailureKind::ExtractionMalformed, problems.join("; ")),
                ),
            },
            Err(e) => (
                first,
                SoftFailure::new(&subject, FailureKind::ServiceUnavailable, e.to_string()),
            ),
        };
        warn!("Enrichment of {} degraded: {}", subject, failure.message);
        let reason = format!("{}: {}", failure.kind, failure.message);
        (
            finalize(candidate, lenient(&salvage_from), Some(reason)),
            Some(failure),
        )
    }
}

/// Apply the invariants every endpoint carries, degraded or not.
fn finalize(
    candidate: EndpointCandidate,
    mut inference: Inference,
    degraded: Option<String>,
) -> EnrichedEndpoint {
    let template: Vec<String> = path_parameters(&candidate.path);

    if degraded.is_some() {
        for token in &candidate.raw_params {
            let Some((location, name)) = token.split_once(':') else {
                continue;
            };
            let Some(location) = ParameterLocation::from_name(location) else {
                continue;
            };
            inference.parameters.push(InferredParameter {
                name: name.to_string(),
                location,
                schema_type: "string".to_string(),
                required: false,
            });
        }
    }

    // path parameters: exactly the template's, always required
    let mut seen = BTreeSet::new();
    let mut parameters: Vec<InferredParameter> = template
        .iter()
        .map(|name| {
            let schema_type = inference
                .parameters
                .iter()
                .find(|p| p.location == ParameterLocation::Path && &p.name == name)
                .map(|p| p.schema_type.clone())
                .unwrap_or_else(|| "string".to_string());
            seen.insert((ParameterLocation::Path, name.clone()));
            InferredParameter {
                name: name.clone(),
                location: ParameterLocation::Path,
                schema_type,
                required: true,
            }
        })
        .collect();
    for parameter in inference.parameters {
        if parameter.location == ParameterLocation::Path {
            continue;
        }
        if seen.insert((parameter.location, parameter.name.clone())) {
            parameters.push(parameter);
        }
    }
    parameters.sort_by_key(|p| p.location);

    if inference.responses.is_empty() {
        inference.responses.insert(
            "200".to_string(),
            InferredResponse {
                description: default_description("200").to_string(),
                schema: None,
            },
        );
    }

    let extraction_factor = match candidate.extraction {
        ExtractionMethod::Native => 1.0,
        ExtractionMethod::Model => MODEL_EXTRACTION_FACTOR,
    };
    let degraded_factor = if degraded.is_some() { DEGRADED_FACTOR } else { 1.0 };
    let confidence = candidate.tag.confidence * extraction_factor * degraded_factor;

    EnrichedEndpoint {
        candidate,
        summary: inference.summary,
        parameters,
        request_body: inference.request_body,
        responses: inference.responses,
        security: inference.security,
        example: inference.example,
        confidence,
        degraded,
    }
}

fn strict(text: &str) -> Result<Inference, Vec<String>> {
    let value = parse_object(text).map_err(|e| vec![e])?;
    let (inference, mut problems) = interpret(&value);
    if inference.responses.is_empty() && !problems.iter().any(|p| p.starts_with("responses")) {
        problems.push("responses: at least one response is required".to_string());
    }
    if problems.is_empty() {
        Ok(inference)
    } else {
        Err(problems)
    }
}

fn lenient(text: &str) -> Inference {
    parse_object(text)
        .map(|value| interpret(&value).0)
        .unwrap_or_default()
}

fn parse_object(text: &str) -> Result<Value, String> {
    let json = prompts::extract_json_object(text).ok_or("reply holds no JSON object")?;
    let value: Value = serde_json::from_str(json).map_err(|e| format!("invalid JSON: {}", e))?;
    if value.is_object() {
        Ok(value)
    } else {
        Err("reply is not a JSON object".to_string())
    }
}

/// Read every field of a reply, keeping valid parts and describing the rest.
fn interpret(value: &Value) -> (Inference, Vec<String>) {
    let mut inference = Inference::default();
    let mut problems = Vec::new();

    match value.get("summary") {
        None | Some(Value::Null) => {}
        Some(Value::String(s)) => {
            let s = s.trim();
            if !s.is_empty() {
                inference.summary = Some(s.to_string());
            }
        }
        Some(_) => problems.push("summary: must be a string".to_string()),
    }

    match value.get("parameters") {
        None | Some(Value::Null) => {}
        Some(Value::Array(items)) => {
            for (i, item) in items.iter().enumerate() {
                match parameter(item) {
                    Ok(p) => inference.parameters.push(p),
                    Err(e) => problems.push(format!("parameters[{}]: {}", i, e)),
                }
            }
        }
        Some(_) => problems.push("parameters: must be an array".to_string()),
    }

    match value.get("request_body") {
        None | Some(Value::Null) => {}
        Some(schema) => match check_schema(schema) {
            Ok(()) => inference.request_body = Some(schema.clone()),
            Err(e) => problems.push(format!("request_body: {}", e)),
        },
    }

    match value.get("responses") {
        Some(Value::Object(map)) => {
            for (status, body) in map {
                match response(status, body) {
                    Ok(r) => {
                        inference.responses.insert(status.clone(), r);
                    }
                    Err(e) => problems.push(format!("responses.{}: {}", status, e)),
                }
            }
        }
        None | Some(Value::Null) => {}
        Some(_) => problems.push("responses: must be an object keyed by status code".to_string()),
    }

    match value.get("security") {
        None | Some(Value::Null) => {}
        Some(Value::Array(items)) => {
            for item in items {
                match item.as_str().and_then(SecurityScheme::from_hint) {
                    Some(scheme) if !inference.security.contains(&scheme) => {
                        inference.security.push(scheme)
                    }
                    Some(_) => {}
                    None => problems.push(format!("security: unknown scheme {}", item)),
                }
            }
            inference.security.sort();
        }
        Some(_) => problems.push("security: must be an array of scheme names".to_string()),
    }

    match value.get("example") {
        None | Some(Value::Null) => {}
        Some(example) => inference.example = Some(example.clone()),
    }

    (inference, problems)
}

fn parameter(item: &Value) -> Result<InferredParameter, String> {
    let name = item
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or("name must be a non-empty string")?;
    let location = item
        .get("in")
        .and_then(Value::as_str)
        .and_then(ParameterLocation::from_name)
        .ok_or("in must be one of path, query, header, body")?;
    let schema_type = match item.get("type") {
        None | Some(Value::Null) => "string",
        Some(t) => t
            .as_str()
            .and_then(canonical_type)
            .ok_or_else(|| format!("unknown type {}", t))?,
    };
    let required = match item.get("required") {
        None | Some(Value::Null) => location == ParameterLocation::Path,
        Some(Value::Bool(b)) => *b,
        Some(_) => return Err("required must be a boolean".to_string()),
    };
    Ok(InferredParameter {
        name: name.to_string(),
        location,
        schema_type: schema_type.to_string(),
        required,
    })
}

fn response(status: &str, body: &Value) -> Result<InferredResponse, String> {
    let valid_status = status == "default"
        || (status.len() == 3
            && status.parse::<u16>().is_ok_and(|code| (100..600).contains(&code)));
    if !valid_status {
        return Err("not an HTTP status code".to_string());
    }
    let Value::Object(fields) = body else {
        return Err("must be an object".to_string());
    };
    let description = match fields.get("description") {
        Some(Value::String(d)) if !d.trim().is_empty() => d.trim().to_string(),
        None | Some(Value::Null) | Some(Value::String(_)) => default_description(status).to_string(),
        Some(_) => return Err("description must be a string".to_string()),
    };
    let schema = match fields.get("schema") {
        None | Some(Value::Null) => None,
        Some(schema) => {
            check_schema(schema)?;
            Some(schema.clone())
        }
    };
    Ok(InferredResponse {
        description,
        schema,
    })
}

/// Schemas must be inline JSON objects.
fn check_schema(schema: &Value) -> Result<(), String> {
    let Value::Object(map) = schema else {
        return Err("schema must be a JSON object".to_string());
    };
    if contains_ref(map) {
        return Err("schema must not contain $ref".to_string());
    }
    if has_itemless_array(map) {
        return Err("array schemas must declare items".to_string());
    }
    Ok(())
}

fn has_itemless_array(map: &Map<String, Value>) -> bool {
    let itemless = map.get("type").and_then(Value::as_str) == Some("array")
        && !map.get("items").is_some_and(Value::is_object);
    itemless
        || map.values().any(|value| match value {
            Value::Object(inner) => has_itemless_array(inner),
            Value::Array(items) => items.iter().any(|i| match i {
                Value::Object(inner) => has_itemless_array(inner),
                _ => false,
            }),
            _ => false,
        })
}

fn contains_ref(map: &Map<String, Value>) -> bool {
    map.iter().any(|(key, value)| {
        key == "$ref"
            || match value {
                Value::Object(inner) => contains_ref(inner),
                Value::Array(items) => items.iter().any(|i| match i {
                    Value::Object(inner) => contains_ref(inner),
                    _ => false,
                }),
                _ => false,
            }
    })
}

/// JSON schema primitive for a type name or a common alias.
fn canonical_type(name: &str) -> Option<&'static str> {
    match name.trim().to_ascii_lowercase().as_str() {
        "string" | "str" | "text" | "uuid" | "date" | "datetime" | "date-time" => Some("string"),
        "integer" | "int" | "i32" | "i64" | "u32" | "u64" | "long" => Some("integer"),
        "number" | "float" | "double" | "decimal" | "f32" | "f64" => Some("number"),
        "boolean" | "bool" => Some("boolean"),
        "array" | "list" => Some("array"),
        "object" | "dict" | "map" => Some("object"),
        _ => None,
    }
}

fn default_description(status: &str) -> &'static str {
    match status {
        "200" => "Successful response",
        "201" => "Created",
        "202" => "Accepted",
        "204" => "No content",
        "400" => "Bad request",
        "401" => "Unauthorized",
        "403" => "Forbidden",
        "404" => "Not found",
        "409" => "Conflict",
        "422" => "Unprocessable entity",
        "500" => "Internal server error",
        _ => "Response",
    }
}
