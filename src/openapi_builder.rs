use crate::config::InfoConfig;
use crate::enricher::{EnrichedEndpoint, ParameterLocation, SecurityScheme};
use crate::error::{FailureKind, SoftFailure};
use crate::extractor::{ExtractionMethod, HttpMethod};
use crate::schema_generator::{SchemaGenerator, SchemaOwner, SchemaSlot};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

pub const OPENAPI_VERSION: &str = "3.0.3";
const JSON_MEDIA_TYPE: &str = "application/json";

/// OpenAPI document builder
///
/// Folds enriched endpoints into a document with deterministic layout:
/// paths sorted lexicographically, methods in canonical order, schemas
/// hoisted with stable names.
pub struct OpenApiBuilder {
    info: Info,
    servers: Vec<Server>,
    paths: BTreeMap<String, PathItem>,
    schemas: SchemaGenerator,
    security_schemes: BTreeSet<SecurityScheme>,
    operation_ids: BTreeSet<String>,
    conflicts: Vec<SoftFailure>,
}

/// OpenAPI Info object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Info {
    pub title: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Info {
    /// Info from configuration, titled after the repository when no title is set.
    pub fn from_config(config: &InfoConfig, repository_name: &str) -> Self {
        Self {
            title: config
                .title
                .clone()
                .unwrap_or_else(|| repository_name.to_string()),
            version: config.version.clone(),
            description: Some(config.description.clone().unwrap_or_else(|| {
                format!("API documentation generated from the {} source code", repository_name)
            })),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub url: String,
}

/// OpenAPI PathItem object. Field order is the canonical method order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PathItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get: Option<Operation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post: Option<Operation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub put: Option<Operation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<Operation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete: Option<Operation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Operation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head: Option<Operation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<Operation>,
}

impl PathItem {
    pub fn slot(&mut self, method: HttpMethod) -> &mut Option<Operation> {
        match method {
            HttpMethod::Get => &mut self.get,
            HttpMethod::Post => &mut self.post,
            HttpMethod::Put => &mut self.put,
            HttpMethod::Patch => &mut self.patch,
            HttpMethod::Delete => &mut self.delete,
            HttpMethod::Options => &mut self.options,
            HttpMethod::Head => &mut self.head,
            HttpMethod::Trace => &mut self.trace,
        }
    }

    pub fn get_operation(&self, method: HttpMethod) -> Option<&Operation> {
        match method {
            HttpMethod::Get => self.get.as_ref(),
            HttpMethod::Post => self.post.as_ref(),
            HttpMethod::Put => self.put.as_ref(),
            HttpMethod::Patch => self.patch.as_ref(),
            HttpMethod::Delete => self.delete.as_ref(),
            HttpMethod::Options => self.options.as_ref(),
            HttpMethod::Head => self.head.as_ref(),
            HttpMethod::Trace => self.trace.as_ref(),
        }
    }

    /// Present operations in canonical order.
    pub fn operations(&self) -> Vec<(HttpMethod, &Operation)> {
        [
            HttpMethod::Get,
            HttpMethod::Post,
            HttpMethod::Put,
            HttpMethod::Patch,
            HttpMethod::Delete,
            HttpMethod::Options,
            HttpMethod::Head,
            HttpMethod::Trace,
        ]
        .into_iter()
        .filter_map(|m| self.get_operation(m).map(|op| (m, op)))
        .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.operations().is_empty()
    }
}

/// OpenAPI Operation object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(rename = "operationId", default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
    #[serde(rename = "requestBody", default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<RequestBody>,
    #[serde(default)]
    pub responses: BTreeMap<String, Response>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security: Vec<BTreeMap<String, Vec<String>>>,
    /// Native and model extraction disagreed; native was kept.
    #[serde(rename = "x-extraction-conflict", default, skip_serializing_if = "Option::is_none")]
    pub extraction_conflict: Option<String>,
    /// Why the operation holds best-effort fields.
    #[serde(rename = "x-degraded", default, skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
}

/// OpenAPI Parameter object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "in")]
    pub location: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default = "string_schema")]
    pub schema: Value,
}

fn string_schema() -> Value {
    json!({"type": "string"})
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestBody {
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub content: BTreeMap<String, MediaType>,
}

impl RequestBody {
    pub fn json_schema(&self) -> Option<&Value> {
        self.content.get(JSON_MEDIA_TYPE).map(|m| &m.schema)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaType {
    pub schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<BTreeMap<String, MediaType>>,
}

impl Response {
    pub fn json_schema(&self) -> Option<&Value> {
        self.content
            .as_ref()
            .and_then(|c| c.get(JSON_MEDIA_TYPE))
            .map(|m| &m.schema)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Components {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub schemas: BTreeMap<String, Value>,
    #[serde(rename = "securitySchemes", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub security_schemes: BTreeMap<String, Value>,
}

impl Components {
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty() && self.security_schemes.is_empty()
    }
}

/// Complete OpenAPI document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenApiDocument {
    pub openapi: String,
    pub info: Info,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<Server>,
    #[serde(default)]
    pub paths: BTreeMap<String, PathItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub components: Option<Components>,
}

static NO_SCHEMAS: BTreeMap<String, Value> = BTreeMap::new();

impl OpenApiDocument {
    pub fn schemas(&self) -> &BTreeMap<String, Value> {
        self.components
            .as_ref()
            .map(|c| &c.schemas)
            .unwrap_or(&NO_SCHEMAS)
    }

    pub fn operation(&self, path: &str, method: HttpMethod) -> Option<&Operation> {
        self.paths.get(path).and_then(|item| item.get_operation(method))
    }

    /// Number of (path, method) operations.
    pub fn operation_count(&self) -> usize {
        self.paths.values().map(|item| item.operations().len()).sum()
    }
}

impl OpenApiBuilder {
    pub fn new(info: Info) -> Self {
        debug!("Initializing OpenApiBuilder");
        Self {
            info,
            servers: Vec::new(),
            paths: BTreeMap::new(),
            schemas: SchemaGenerator::new(),
            security_schemes: BTreeSet::new(),
            operation_ids: BTreeSet::new(),
            conflicts: Vec::new(),
        }
    }

    pub fn with_server(mut self, api_host: Option<&str>) -> Self {
        if let Some(url) = api_host.map(str::trim).filter(|u| !u.is_empty()) {
            self.servers.push(Server {
                url: url.to_string(),
            });
        }
        self
    }

    /// Reuse schema names from a previous document where structures match.
    pub fn with_baseline(mut self, baseline: Option<&OpenApiDocument>) -> Self {
        if let Some(baseline) = baseline {
            self.schemas = std::mem::take(&mut self.schemas).with_baseline(baseline);
        }
        self
    }

    /// Add endpoints in priority order. When two endpoints map to the same
    /// (path, method), the first wins and the other is recorded as a conflict.
    pub fn add_endpoints(&mut self, endpoints: &[EnrichedEndpoint]) {
        let mut ordered: Vec<&EnrichedEndpoint> = endpoints.iter().collect();
        ordered.sort_by(|a, b| priority(a, b));
        for endpoint in ordered {
            self.add_endpoint(endpoint);
        }
    }

    fn add_endpoint(&mut self, endpoint: &EnrichedEndpoint) {
        let candidate = &endpoint.candidate;
        let path = candidate.path.clone();
        let method = candidate.method;

        if self
            .paths
            .get(&path)
            .is_some_and(|item| item.get_operation(method).is_some())
        {
            warn!(
                "{} {} already documented; skipping handler {} in {}",
                method,
                path,
                candidate.handler,
                candidate.location.file.display()
            );
            self.conflicts.push(SoftFailure::new(
                format!("{} {}", method, path),
                FailureKind::Conflict,
                format!(
                    "handler {} in {} maps to an already documented operation",
                    candidate.handler,
                    candidate.location.file.display()
                ),
            ));
            return;
        }
        debug!("Adding operation: {} {}", method, path);

        let mut parameters: Vec<Parameter> = endpoint
            .parameters
            .iter()
            .filter(|p| p.location != ParameterLocation::Body)
            .map(|p| Parameter {
                name: p.name.clone(),
                location: p.location.as_str().to_string(),
                required: p.required,
                schema: primitive_schema(&p.schema_type),
            })
            .collect();
        parameters.sort_by(|a, b| {
            location_rank(&a.location)
                .cmp(&location_rank(&b.location))
                .then_with(|| a.name.cmp(&b.name))
        });

        let body_schema = endpoint.request_body.clone().or_else(|| body_parameters(endpoint));
        let request_body = body_schema.map(|schema| {
            let schema = self.schemas.hoist(
                &schema,
                &SchemaOwner {
                    path: &path,
                    method,
                    handler: &candidate.handler,
                    slot: SchemaSlot::Request,
                },
            );
            RequestBody {
                required: true,
                content: BTreeMap::from([(
                    JSON_MEDIA_TYPE.to_string(),
                    MediaType {
                        schema,
                        example: None,
                    },
                )]),
            }
        });

        let example_status = endpoint
            .responses
            .iter()
            .find(|(status, r)| status.starts_with('2') && r.schema.is_some())
            .map(|(status, _)| status.clone());
        let mut responses = BTreeMap::new();
        for (status, inferred) in &endpoint.responses {
            let content = inferred.schema.as_ref().map(|schema| {
                let schema = self.schemas.hoist(
                    schema,
                    &SchemaOwner {
                        path: &path,
                        method,
                        handler: &candidate.handler,
                        slot: SchemaSlot::Response(status.clone()),
                    },
                );
                let example = if example_status.as_deref() == Some(status.as_str()) {
                    endpoint.example.clone()
                } else {
                    None
                };
                BTreeMap::from([(JSON_MEDIA_TYPE.to_string(), MediaType { schema, example })])
            });
            responses.insert(
                status.clone(),
                Response {
                    description: inferred.description.clone(),
                    content,
                },
            );
        }

        for scheme in &endpoint.security {
            self.security_schemes.insert(*scheme);
        }
        let security = endpoint
            .security
            .iter()
            .map(|s| BTreeMap::from([(s.name().to_string(), Vec::new())]))
            .collect();

        let operation = Operation {
            summary: Some(
                endpoint
                    .summary
                    .clone()
                    .unwrap_or_else(|| format!("{} {}", method, path)),
            ),
            operation_id: Some(unique_operation_id(
                &mut self.operation_ids,
                &candidate.handler,
                method,
            )),
            parameters,
            request_body,
            responses,
            security,
            extraction_conflict: candidate.conflict.clone(),
            degraded: endpoint.degraded.clone(),
        };
        *self.paths.entry(path).or_default().slot(method) = Some(operation);
    }

    /// Build the final OpenAPI document plus the conflicts met on the way.
    pub fn build(self) -> (OpenApiDocument, Vec<SoftFailure>) {
        debug!("Building final OpenAPI document");
        let components = Components {
            schemas: self.schemas.into_components(),
            security_schemes: self
                .security_schemes
                .iter()
                .map(|s| (s.name().to_string(), s.definition()))
                .collect(),
        };
        let document = OpenApiDocument {
            openapi: OPENAPI_VERSION.to_string(),
            info: self.info,
            servers: self.servers,
            paths: self.paths,
            components: (!components.is_empty()).then_some(components),
        };
        (document, self.conflicts)
    }
}

/// Native before model, then higher confidence, then file and handler.
fn priority(a: &EnrichedEndpoint, b: &EnrichedEndpoint) -> Ordering {
    let (ca, cb) = (&a.candidate, &b.candidate);
    let is_model = |e: ExtractionMethod| e == ExtractionMethod::Model;
    is_model(ca.extraction)
        .cmp(&is_model(cb.extraction))
        .then_with(|| b.confidence.total_cmp(&a.confidence))
        .then_with(|| ca.location.cmp(&cb.location))
        .then_with(|| ca.handler.cmp(&cb.handler))
}

/// Unique operationId for `base`: as is, then suffixed with the method, then
/// numbered. The chosen id is added to `taken`.
pub fn unique_operation_id(taken: &mut BTreeSet<String>, base: &str, method: HttpMethod) -> String {
    let mut id = base.to_string();
    if taken.contains(&id) {
        id = format!("{}_{}", base, method.as_str());
    }
    let stem = id.clone();
    let mut n = 2;
    while taken.contains(&id) {
        id = format!("{}{}", stem, n);
        n += 1;
    }
    taken.insert(id.clone());
    id
}

/// Inline schema for a parameter or body field of a primitive type.
/// Arrays carry string items, since only the container type is known.
fn primitive_schema(schema_type: &str) -> Value {
    if schema_type == "array" {
        json!({"type": "array", "items": {"type": "string"}})
    } else {
        json!({"type": schema_type})
    }
}

fn location_rank(location: &str) -> u8 {
    match location {
        "path" => 0,
        "query" => 1,
        "header" => 2,
        _ => 3,
    }
}

/// Object schema assembled from `in: body` parameters.
fn body_parameters(endpoint: &EnrichedEndpoint) -> Option<Value> {
    let fields: Vec<_> = endpoint
        .parameters
        .iter()
        .filter(|p| p.location == ParameterLocation::Body)
        .collect();
    if fields.is_empty() {
        return None;
    }
    let properties: serde_json::Map<String, Value> = fields
        .iter()
        .map(|p| (p.name.clone(), primitive_schema(&p.schema_type)))
        .collect();
    let required: Vec<&str> = fields
        .iter()
        .filter(|p| p.required)
        .map(|p| p.name.as_str())
        .collect();
    let mut schema = json!({"type": "object", "properties": properties});
    if !required.is_empty() {
        schema["required"] = json!(required);
    }
    Some(schema)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::detector::{DetectionMethod, FrameworkTag};
    use crate::enricher::{InferredParameter, InferredResponse};
    use crate::extractor::{EndpointCandidate, SourceLocation};
    use crate::parser::{Language, LineRange};
    use pretty_assertions::assert_eq;

    /// Minimal enriched endpoint for builder tests.
    pub(crate) fn endpoint(method: HttpMethod, path: &str, handler: &str) -> EnrichedEndpoint {
        EnrichedEndpoint {
            candidate: EndpointCandidate {
                method,
                path: path.to_string(),
                location: SourceLocation {
                    file: "app.js".into(),
                    lines: LineRange::new(1, 1),
                },
                handler: handler.to_string(),
                handler_lines: None,
                raw_params: Vec::new(),
                tag: FrameworkTag {
                    language: Language::JavaScript,
                    framework: "express".to_string(),
                    confidence: 1.0,
                    method: DetectionMethod::Rule,
                },
                extraction: ExtractionMethod::Native,
                conflict: None,
            },
            summary: None,
            parameters: Vec::new(),
            request_body: None,
            responses: BTreeMap::from([(
                "200".to_string(),
                InferredResponse {
                    description: "Successful response".to_string(),
                    schema: None,
                },
            )]),
            security: Vec::new(),
            example: None,
            confidence: 1.0,
            degraded: None,
        }
    }

    fn info() -> Info {
        Info {
            title: "blog".to_string(),
            version: "1.0.0".to_string(),
            description: None,
        }
    }

    #[test]
    fn test_info_from_config() {
        let info = Info::from_config(&InfoConfig::default(), "blog");
        assert_eq!(info.title, "blog");
        assert_eq!(info.version, "1.0.0");
        assert!(info.description.is_some());
    }

    #[test]
    fn test_deterministic_layout() {
        let mut builder = OpenApiBuilder::new(info()).with_server(Some("https://api.example.com"));
        builder.add_endpoints(&[
            endpoint(HttpMethod::Delete, "/posts/{id}", "remove"),
            endpoint(HttpMethod::Post, "/posts", "create"),
            endpoint(HttpMethod::Get, "/posts", "list"),
            endpoint(HttpMethod::Get, "/comments", "comments"),
        ]);
        let (document, conflicts) = builder.build();
        assert!(conflicts.is_empty());

        let json = serde_json::to_string(&document).unwrap();
        let paths: Vec<&String> = document.paths.keys().collect();
        assert_eq!(paths, vec!["/comments", "/posts", "/posts/{id}"]);
        assert!(json.find("\"get\"").unwrap() < json.find("\"post\"").unwrap());
        assert_eq!(document.servers[0].url, "https://api.example.com");
        assert_eq!(document.operation_count(), 4);
        assert!(document.components.is_none());
    }

    #[test]
    fn test_operation_contents() {
        let mut show = endpoint(HttpMethod::Get, "/users/{id}", "show");
        show.parameters = vec![
            InferredParameter {
                name: "verbose".to_string(),
                location: ParameterLocation::Query,
                schema_type: "boolean".to_string(),
                required: false,
            },
            InferredParameter {
                name: "id".to_string(),
                location: ParameterLocation::Path,
                schema_type: "integer".to_string(),
                required: true,
            },
        ];
        show.responses.insert(
            "200".to_string(),
            InferredResponse {
                description: "The user".to_string(),
                schema: Some(json!({"type": "object", "properties": {"id": {"type": "integer"}}})),
            },
        );
        show.example = Some(json!({"id": 7}));
        show.security = vec![SecurityScheme::Bearer];
        show.candidate.conflict = Some("model reported query:page".to_string());

        let mut create = endpoint(HttpMethod::Post, "/users", "show");
        create.parameters = vec![InferredParameter {
            name: "name".to_string(),
            location: ParameterLocation::Body,
            schema_type: "string".to_string(),
            required: true,
        }];

        let mut builder = OpenApiBuilder::new(info());
        builder.add_endpoints(&[show, create]);
        let (document, _) = builder.build();

        let op = document.operation("/users/{id}", HttpMethod::Get).unwrap();
        let names: Vec<&str> = op.parameters.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["id", "verbose"]);
        let media = &op.responses["200"].content.as_ref().unwrap()[JSON_MEDIA_TYPE];
        assert_eq!(media.schema, json!({"$ref": "#/components/schemas/ShowResponse"}));
        assert_eq!(media.example, Some(json!({"id": 7})));
        assert_eq!(op.extraction_conflict.as_deref(), Some("model reported query:page"));
        assert_eq!(op.security[0]["bearerAuth"], Vec::<String>::new());

        let post = document.operation("/users", HttpMethod::Post).unwrap();
        assert_eq!(post.operation_id.as_deref(), Some("show_post"));
        assert_eq!(
            post.request_body.as_ref().unwrap().json_schema(),
            Some(&json!({"$ref": "#/components/schemas/ShowRequest"}))
        );

        let components = document.components.unwrap();
        assert_eq!(
            components.schemas.keys().collect::<Vec<_>>(),
            vec!["ShowRequest", "ShowResponse"]
        );
        assert_eq!(components.security_schemes["bearerAuth"]["scheme"], "bearer");
    }

    #[test]
    fn test_array_fields_carry_items() {
        let mut search = endpoint(HttpMethod::Post, "/search", "search");
        search.parameters = vec![
            InferredParameter {
                name: "tags".to_string(),
                location: ParameterLocation::Query,
                schema_type: "array".to_string(),
                required: false,
            },
            InferredParameter {
                name: "ids".to_string(),
                location: ParameterLocation::Body,
                schema_type: "array".to_string(),
                required: true,
            },
        ];

        let mut builder = OpenApiBuilder::new(info());
        builder.add_endpoints(&[search]);
        let (document, _) = builder.build();

        let op = document.operation("/search", HttpMethod::Post).unwrap();
        assert_eq!(
            op.parameters[0].schema,
            json!({"type": "array", "items": {"type": "string"}})
        );
        assert_eq!(
            document.schemas()["SearchRequest"]["properties"]["ids"],
            json!({"type": "array", "items": {"type": "string"}})
        );
        assert!(crate::validator::validate(&document).is_empty());
    }

    #[test]
    fn test_unique_operation_id() {
        let mut taken = BTreeSet::new();
        assert_eq!(unique_operation_id(&mut taken, "list", HttpMethod::Get), "list");
        assert_eq!(unique_operation_id(&mut taken, "list", HttpMethod::Post), "list_post");
        assert_eq!(unique_operation_id(&mut taken, "list", HttpMethod::Post), "list_post2");
    }

    #[test]
    fn test_same_operation_keeps_native_first() {
        let mut model = endpoint(HttpMethod::Get, "/posts", "list_posts");
        model.candidate.extraction = ExtractionMethod::Model;
        model.candidate.location.file = "a.js".into();
        let native = endpoint(HttpMethod::Get, "/posts", "listPosts");

        let mut builder = OpenApiBuilder::new(info());
        builder.add_endpoints(&[model, native]);
        let (document, conflicts) = builder.build();

        let op = document.operation("/posts", HttpMethod::Get).unwrap();
        assert_eq!(op.operation_id.as_deref(), Some("listPosts"));
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, FailureKind::Conflict);
    }
}
