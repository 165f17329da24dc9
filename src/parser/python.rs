use super::{GrammarAdapter, Language, QueryKind};

/// Adapter for Python sources (`tree-sitter-python`).
pub struct PythonAdapter;

const ROUTE_DECORATOR: &str = r#"
(decorated_definition
  (decorator) @decorator
  definition: (function_definition
    name: (identifier) @target)) @definition
"#;

const ROUTER_PREFIX: &str = r#"
(assignment
  left: (identifier) @var
  right: (call
    function: (_) @ctor
    arguments: (argument_list) @args)) @call
"#;

const DEFINITION: &str = r#"
(class_definition name: (identifier) @name) @type
(function_definition name: (identifier) @name) @function
"#;

const COMMENT: &str = r#"
(comment) @comment
(block . (expression_statement (string) @comment))
"#;

impl GrammarAdapter for PythonAdapter {
    fn language(&self) -> Language {
        Language::Python
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["py"]
    }

    fn grammar(&self) -> tree_sitter::Language {
        tree_sitter_python::LANGUAGE.into()
    }

    fn query_source(&self, kind: QueryKind) -> Option<&'static str> {
        match kind {
            QueryKind::RouteCall => None,
            QueryKind::RouteDecorator => Some(ROUTE_DECORATOR),
            QueryKind::RouterPrefix => Some(ROUTER_PREFIX),
            QueryKind::Definition => Some(DEFINITION),
            QueryKind::Comment => Some(COMMENT),
        }
    }
}
