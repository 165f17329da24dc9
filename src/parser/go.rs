use super::{GrammarAdapter, Language, QueryKind};

/// Adapter for Go sources (`tree-sitter-go`).
pub struct GoAdapter;

const ROUTE_CALL: &str = r#"
(call_expression
  function: (selector_expression
    operand: (_) @receiver
    field: (field_identifier) @verb)
  arguments: (argument_list) @args) @call
"#;

const ROUTER_PREFIX: &str = r#"
(short_var_declaration
  left: (expression_list . (identifier) @var)
  right: (expression_list
    . (call_expression
      function: (selector_expression
        operand: (_) @receiver
        field: (field_identifier) @method)
      arguments: (argument_list) @args))) @call
"#;

const DEFINITION: &str = r#"
(type_declaration (type_spec name: (type_identifier) @name)) @type
(function_declaration name: (identifier) @name) @function
(method_declaration name: (field_identifier) @name) @function
"#;

const COMMENT: &str = r#"
(comment) @comment
"#;

impl GrammarAdapter for GoAdapter {
    fn language(&self) -> Language {
        Language::Go
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["go"]
    }

    fn grammar(&self) -> tree_sitter::Language {
        tree_sitter_go::LANGUAGE.into()
    }

    fn query_source(&self, kind: QueryKind) -> Option<&'static str> {
        match kind {
            QueryKind::RouteCall => Some(ROUTE_CALL),
            QueryKind::RouteDecorator => None,
            QueryKind::RouterPrefix => Some(ROUTER_PREFIX),
            QueryKind::Definition => Some(DEFINITION),
            QueryKind::Comment => Some(COMMENT),
        }
    }
}
