use super::{GrammarAdapter, Language, QueryKind};

/// Adapter for Rust sources (`tree-sitter-rust`).
pub struct RustAdapter;

const ROUTE_CALL: &str = r#"
(call_expression
  function: (field_expression
    value: (_) @receiver
    field: (field_identifier) @verb)
  arguments: (arguments) @args) @call
"#;

const ROUTE_DECORATOR: &str = r#"
(attribute_item (attribute) @attribute) @decorator
"#;

const DEFINITION: &str = r#"
(struct_item name: (type_identifier) @name) @type
(enum_item name: (type_identifier) @name) @type
(function_item name: (identifier) @name) @function
"#;

const COMMENT: &str = r#"
(line_comment) @comment
(block_comment) @comment
"#;

impl GrammarAdapter for RustAdapter {
    fn language(&self) -> Language {
        Language::Rust
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["rs"]
    }

    fn grammar(&self) -> tree_sitter::Language {
        tree_sitter_rust::LANGUAGE.into()
    }

    fn query_source(&self, kind: QueryKind) -> Option<&'static str> {
        match kind {
            QueryKind::RouteCall => Some(ROUTE_CALL),
            QueryKind::RouteDecorator => Some(ROUTE_DECORATOR),
            // nest/scope prefixes are resolved by walking up from each route call
            QueryKind::RouterPrefix => None,
            QueryKind::Definition => Some(DEFINITION),
            QueryKind::Comment => Some(COMMENT),
        }
    }
}
