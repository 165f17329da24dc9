use super::{GrammarAdapter, Language, QueryKind};

/// Adapter for JavaScript sources, including JSX.
pub struct JavaScriptAdapter;

/// Adapter for TypeScript, constructed for either `.ts` or `.tsx` grammars.
pub struct TypeScriptAdapter {
    tsx: bool,
}

impl TypeScriptAdapter {
    pub fn typescript() -> Self {
        Self { tsx: false }
    }

    pub fn tsx() -> Self {
        Self { tsx: true }
    }
}

const ROUTE_CALL: &str = r#"
(call_expression
  function: (member_expression
    object: (_) @receiver
    property: (_) @verb)
  arguments: (arguments) @args) @call
"#;

const ROUTE_DECORATOR: &str = r#"
(decorator) @decorator
"#;

const ROUTER_PREFIX: &str = r#"
(call_expression
  function: (member_expression
    object: (_) @receiver
    property: (_) @method)
  arguments: (arguments . (string) @prefix . (identifier) @var)) @call
"#;

const JS_DEFINITION: &str = r#"
(class_declaration name: (_) @name) @type
(function_declaration name: (_) @name) @function
(variable_declarator name: (identifier) @name value: (_) @value) @binding
"#;

const TS_DEFINITION: &str = r#"
(class_declaration name: (_) @name) @type
(abstract_class_declaration name: (_) @name) @type
(interface_declaration name: (_) @name) @type
(type_alias_declaration name: (_) @name) @type
(enum_declaration name: (_) @name) @type
(function_declaration name: (_) @name) @function
(variable_declarator name: (identifier) @name value: (_) @value) @binding
"#;

const COMMENT: &str = r#"
(comment) @comment
"#;

fn shared_query(kind: QueryKind) -> Option<&'static str> {
    match kind {
        QueryKind::RouteCall => Some(ROUTE_CALL),
        QueryKind::RouteDecorator => Some(ROUTE_DECORATOR),
        QueryKind::RouterPrefix => Some(ROUTER_PREFIX),
        QueryKind::Definition => Some(JS_DEFINITION),
        QueryKind::Comment => Some(COMMENT),
    }
}

impl GrammarAdapter for JavaScriptAdapter {
    fn language(&self) -> Language {
        Language::JavaScript
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["js", "cjs", "mjs", "jsx"]
    }

    fn grammar(&self) -> tree_sitter::Language {
        tree_sitter_javascript::LANGUAGE.into()
    }

    fn query_source(&self, kind: QueryKind) -> Option<&'static str> {
        shared_query(kind)
    }
}

impl GrammarAdapter for TypeScriptAdapter {
    fn language(&self) -> Language {
        if self.tsx {
            Language::Tsx
        } else {
            Language::TypeScript
        }
    }

    fn extensions(&self) -> &'static [&'static str] {
        if self.tsx {
            &["tsx"]
        } else {
            &["ts", "cts", "mts"]
        }
    }

    fn grammar(&self) -> tree_sitter::Language {
        if self.tsx {
            tree_sitter_typescript::LANGUAGE_TSX.into()
        } else {
            tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()
        }
    }

    fn query_source(&self, kind: QueryKind) -> Option<&'static str> {
        match kind {
            QueryKind::Definition => Some(TS_DEFINITION),
            other => shared_query(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::parser::{GrammarRegistry, QueryKind};
    use std::path::Path;

    #[test]
    fn test_express_route_calls() {
        let registry = GrammarRegistry::new();
        let unit = registry
            .parse(
                Path::new("app.js"),
                r#"
const router = express.Router();
router.get('/posts', listPosts);
app.use('/api', router);
"#
                .to_string(),
            )
            .unwrap();
        let verbs: Vec<&str> = registry
            .query(&unit, QueryKind::RouteCall)
            .iter()
            .filter_map(|m| m.text("verb"))
            .collect();
        assert_eq!(verbs, vec!["Router", "get", "use"]);

        let mounts: Vec<_> = registry
            .query(&unit, QueryKind::RouterPrefix)
            .into_iter()
            .filter(|m| m.text("method") == Some("use"))
            .collect();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].text("var"), Some("router"));
        assert_eq!(mounts[0].text("prefix"), Some("'/api'"));
    }

    #[test]
    fn test_typescript_definitions() {
        let registry = GrammarRegistry::new();
        let unit = registry
            .parse(
                Path::new("dto.ts"),
                r#"
export interface CreateUserDto { name: string }
export class UsersController {}
type Id = string;
"#
                .to_string(),
            )
            .unwrap();
        let names: Vec<&str> = registry
            .query(&unit, QueryKind::Definition)
            .iter()
            .filter_map(|m| m.text("name"))
            .collect();
        assert_eq!(names.len(), 3);
        assert!(names.contains(&"CreateUserDto"));
        assert!(names.contains(&"UsersController"));
        assert!(names.contains(&"Id"));
    }

    #[test]
    fn test_decorators_in_typescript() {
        let registry = GrammarRegistry::new();
        let unit = registry
            .parse(
                Path::new("users.controller.ts"),
                r#"
@Controller('users')
export class UsersController {
  @Get(':id')
  findOne(id: string) { return id; }
}
"#
                .to_string(),
            )
            .unwrap();
        assert_eq!(registry.query(&unit, QueryKind::RouteDecorator).len(), 2);
    }
}
