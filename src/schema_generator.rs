use crate::extractor::HttpMethod;
use crate::openapi_builder::OpenApiDocument;
use log::debug;
use serde_json::{json, Value};
use std::collections::BTreeMap;

const REF_PREFIX: &str = "#/components/schemas/";

/// Where a schema is used within an operation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum SchemaSlot {
    Request,
    Response(String),
}

/// The operation a schema belongs to.
pub struct SchemaOwner<'a> {
    pub path: &'a str,
    pub method: HttpMethod,
    pub handler: &'a str,
    pub slot: SchemaSlot,
}

/// Schema generator - hoists object schemas into `components/schemas`
///
/// Structurally identical schemas share one component. Names are the
/// PascalCase handler plus `Request`/`Response`, with numeric suffixes on
/// collision. With a baseline document, a schema identical to the one the
/// same operation slot referenced before keeps that name; failing that, an
/// identical baseline component lends its name.
pub struct SchemaGenerator {
    /// Component name -> schema
    components: BTreeMap<String, Value>,
    /// Canonical JSON -> component name
    by_structure: BTreeMap<String, String>,
    baseline_components: BTreeMap<String, Value>,
    baseline_slots: BTreeMap<(String, HttpMethod, SchemaSlot), String>,
}

impl SchemaGenerator {
    pub fn new() -> Self {
        debug!("Initializing SchemaGenerator");
        Self {
            components: BTreeMap::new(),
            by_structure: BTreeMap::new(),
            baseline_components: BTreeMap::new(),
            baseline_slots: BTreeMap::new(),
        }
    }

    pub fn with_baseline(mut self, baseline: &OpenApiDocument) -> Self {
        self.baseline_components = baseline.schemas().clone();
        for (path, item) in &baseline.paths {
            for (method, operation) in item.operations() {
                let request = operation
                    .request_body
                    .as_ref()
                    .and_then(|b| b.json_schema())
                    .and_then(ref_name);
                if let Some(name) = request {
                    self.baseline_slots
                        .insert((path.clone(), method, SchemaSlot::Request), name.to_string());
                }
                for (status, response) in &operation.responses {
                    if let Some(name) = response.json_schema().and_then(ref_name) {
                        self.baseline_slots.insert(
                            (path.clone(), method, SchemaSlot::Response(status.clone())),
                            name.to_string(),
                        );
                    }
                }
            }
        }
        debug!(
            "Baseline: {} components, {} referenced slots",
            self.baseline_components.len(),
            self.baseline_slots.len()
        );
        self
    }

    /// Hoist `schema` if it is an object (or an array of objects) and return
    /// what the operation should embed: a `$ref`, or the schema unchanged.
    pub fn hoist(&mut self, schema: &Value, owner: &SchemaOwner<'_>) -> Value {
        if is_object_schema(schema) {
            return reference(&self.register(schema, owner));
        }
        if schema.get("type").and_then(Value::as_str) == Some("array") {
            if let Some(items) = schema.get("items").filter(|i| is_object_schema(i)) {
                let name = self.register(items, owner);
                let mut array = schema.clone();
                array["items"] = reference(&name);
                return array;
            }
        }
        schema.clone()
    }

    fn register(&mut self, schema: &Value, owner: &SchemaOwner<'_>) -> String {
        let key = canonical(schema);
        if let Some(name) = self.by_structure.get(&key) {
            return name.clone();
        }

        let name = self
            .baseline_name(schema, owner)
            .unwrap_or_else(|| self.fresh_name(owner));
        debug!("Hoisting schema {} for {} {}", name, owner.method, owner.path);
        self.components.insert(name.clone(), schema.clone());
        self.by_structure.insert(key, name.clone());
        name
    }

    fn baseline_name(&self, schema: &Value, owner: &SchemaOwner<'_>) -> Option<String> {
        let available = |name: &String| {
            !self.components.contains_key(name)
                && self.baseline_components.get(name) == Some(schema)
        };
        let slot = (owner.path.to_string(), owner.method, owner.slot.clone());
        if let Some(name) = self.baseline_slots.get(&slot).filter(|n| available(n)) {
            return Some(name.clone());
        }
        self.baseline_components
            .keys()
            .find(|name| available(name))
            .cloned()
    }

    fn fresh_name(&self, owner: &SchemaOwner<'_>) -> String {
        let suffix = match owner.slot {
            SchemaSlot::Request => "Request",
            SchemaSlot::Response(_) => "Response",
        };
        let base = format!("{}{}", pascal_case(owner.handler), suffix);
        let taken = |name: &str| {
            self.components.contains_key(name) || self.baseline_components.contains_key(name)
        };
        if !taken(&base) {
            return base;
        }
        (2..)
            .map(|n| format!("{}{}", base, n))
            .find(|name| !taken(name))
            .unwrap_or(base)
    }

    pub fn into_components(self) -> BTreeMap<String, Value> {
        self.components
    }
}

impl Default for SchemaGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Objects with declared properties are worth a component; everything else stays inline.
fn is_object_schema(schema: &Value) -> bool {
    let typed_object = match schema.get("type") {
        Some(Value::String(t)) => t == "object",
        None => true,
        Some(_) => false,
    };
    typed_object
        && schema
            .get("properties")
            .and_then(Value::as_object)
            .is_some_and(|p| !p.is_empty())
}

/// Key-sorted JSON text, so equal structures compare equal.
fn canonical(schema: &Value) -> String {
    serde_json::to_string(schema).unwrap_or_default()
}

pub fn reference(name: &str) -> Value {
    json!({ "$ref": format!("{}{}", REF_PREFIX, name) })
}

/// Component name of a `{"$ref": "#/components/schemas/Name"}` schema.
pub fn ref_name(schema: &Value) -> Option<&str> {
    schema
        .get("$ref")
        .and_then(Value::as_str)
        .and_then(|r| r.strip_prefix(REF_PREFIX))
}

/// `get_users_id` -> `GetUsersId`, `findOne` -> `FindOne`.
pub fn pascal_case(text: &str) -> String {
    let mut out = String::new();
    for part in text.split(|c: char| !c.is_ascii_alphanumeric()) {
        let mut chars = part.chars();
        if let Some(first) = chars.next() {
            out.push(first.to_ascii_uppercase());
            out.extend(chars);
        }
    }
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert_str(0, "Anonymous");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn owner<'a>(path: &'a str, handler: &'a str, slot: SchemaSlot) -> SchemaOwner<'a> {
        SchemaOwner {
            path,
            method: HttpMethod::Get,
            handler,
            slot,
        }
    }

    fn user() -> Value {
        json!({"type": "object", "properties": {"id": {"type": "integer"}, "name": {"type": "string"}}})
    }

    #[test]
    fn test_pascal_case() {
        assert_eq!(pascal_case("get_users_id"), "GetUsersId");
        assert_eq!(pascal_case("findOne"), "FindOne");
        assert_eq!(pascal_case("list-items"), "ListItems");
        assert_eq!(pascal_case("404"), "Anonymous404");
    }

    #[test]
    fn test_primitives_stay_inline() {
        let mut generator = SchemaGenerator::new();
        let schema = json!({"type": "string"});
        let out = generator.hoist(&schema, &owner("/x", "x", SchemaSlot::Request));
        assert_eq!(out, schema);
        let bare = json!({"type": "object"});
        assert_eq!(generator.hoist(&bare, &owner("/x", "x", SchemaSlot::Request)), bare);
        assert!(generator.into_components().is_empty());
    }

    #[test]
    fn test_structural_dedup_and_suffixes() {
        let mut generator = SchemaGenerator::new();
        let a = generator.hoist(&user(), &owner("/users/{id}", "get_user", SchemaSlot::Response("200".into())));
        let b = generator.hoist(&user(), &owner("/me", "me", SchemaSlot::Response("200".into())));
        assert_eq!(a, json!({"$ref": "#/components/schemas/GetUserResponse"}));
        assert_eq!(a, b);

        let other = json!({"type": "object", "properties": {"error": {"type": "string"}}});
        let c = generator.hoist(&other, &owner("/users/{id}", "get_user", SchemaSlot::Response("404".into())));
        assert_eq!(c, json!({"$ref": "#/components/schemas/GetUserResponse2"}));

        let list = json!({"type": "array", "items": user()});
        let d = generator.hoist(&list, &owner("/users", "list_users", SchemaSlot::Response("200".into())));
        assert_eq!(
            d,
            json!({"type": "array", "items": {"$ref": "#/components/schemas/GetUserResponse"}})
        );

        let names: Vec<String> = generator.into_components().into_keys().collect();
        assert_eq!(names, vec!["GetUserResponse", "GetUserResponse2"]);
    }

    #[test]
    fn test_baseline_names_are_reused() {
        let baseline: OpenApiDocument = serde_json::from_value(json!({
            "openapi": "3.0.3",
            "info": {"title": "t", "version": "1"},
            "paths": {
                "/users/{id}": {"get": {
                    "responses": {"200": {
                        "description": "ok",
                        "content": {"application/json": {"schema": {"$ref": "#/components/schemas/User"}}}
                    }}
                }}
            },
            "components": {"schemas": {
                "User": user(),
                "Problem": {"type": "object", "properties": {"detail": {"type": "string"}}}
            }}
        }))
        .unwrap();
        let mut generator = SchemaGenerator::new().with_baseline(&baseline);

        let slot = generator.hoist(&user(), &owner("/users/{id}", "show", SchemaSlot::Response("200".into())));
        assert_eq!(slot, reference("User"));

        let problem = json!({"type": "object", "properties": {"detail": {"type": "string"}}});
        let any = generator.hoist(&problem, &owner("/other", "other", SchemaSlot::Response("500".into())));
        assert_eq!(any, reference("Problem"));

        // a changed structure does not steal the old name
        let changed = json!({"type": "object", "properties": {"id": {"type": "string"}}});
        let fresh = generator.hoist(&changed, &owner("/users/{id}", "User", SchemaSlot::Request));
        assert_eq!(fresh, reference("UserRequest"));
    }
}
