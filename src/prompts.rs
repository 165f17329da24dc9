//! Prompt templates for the completion service and helpers for reading its replies.

use crate::parser::Language;
use std::fmt::Write;

pub const CLASSIFY_SYSTEM: &str = "You classify source files by the HTTP web framework they use \
to declare API routes. Reply with a single JSON object and nothing else.";

pub const EXTRACT_SYSTEM: &str = "You find HTTP API endpoints declared in source code. \
Report only routes that the code registers; never invent routes. \
Reply with a single JSON object and nothing else.";

pub const ENRICH_SYSTEM: &str = "You are an expert in documenting REST APIs as OpenAPI 3.0. \
Given a route handler and related source excerpts, you describe its parameters, request body, \
responses and authentication. Reply with a single JSON object and nothing else.";

/// One file offered for framework classification.
pub struct ClassificationEntry<'a> {
    pub index: usize,
    pub path: &'a str,
    pub language: Language,
    pub excerpt: &'a str,
}

pub fn classification_prompt(entries: &[ClassificationEntry<'_>], frameworks: &[String]) -> String {
    let mut prompt = String::new();
    let _ = writeln!(
        prompt,
        "Known frameworks: {}. Use \"none\" when the file declares no routes and \"other\" for an unlisted framework.",
        frameworks.join(", ")
    );
    let _ = writeln!(
        prompt,
        "Return {{\"classifications\": [{{\"file\": <number>, \"framework\": <name>, \"confidence\": <0..1>}}]}} with one entry per file.\n"
    );
    for entry in entries {
        let _ = writeln!(
            prompt,
            "### File {}: {} ({})\n{}\n",
            entry.index, entry.path, entry.language, entry.excerpt
        );
    }
    prompt
}

pub fn extraction_prompt(
    path: &str,
    language: Language,
    framework: &str,
    first_line: usize,
    text: &str,
) -> String {
    let mut prompt = String::new();
    let _ = writeln!(
        prompt,
        "File: {} ({}, framework: {}). Lines are numbered from {}.",
        path, language, framework, first_line
    );
    let _ = writeln!(
        prompt,
        "Return {{\"endpoints\": [{{\"method\": \"GET\", \"path\": \"/users/{{id}}\", \"handler\": \"getUser\", \"start_line\": 12, \"end_line\": 20}}]}}. \
Use an empty list when the excerpt declares no routes.\n"
    );
    for (offset, line) in text.lines().enumerate() {
        let _ = writeln!(prompt, "{:>5} | {}", first_line + offset, line);
    }
    prompt
}

/// Everything the enrichment prompt needs about one endpoint.
pub struct EnrichmentInput<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub framework: &'a str,
    pub handler: &'a str,
    pub handler_text: &'a str,
    pub raw_params: &'a [String],
    pub context: Vec<&'a str>,
    pub security_context: Vec<&'a str>,
}

pub fn enrichment_prompt(input: &EnrichmentInput<'_>) -> String {
    let mut prompt = String::new();
    let _ = writeln!(
        prompt,
        "Endpoint: {} {} (framework: {}, handler: {})\n",
        input.method, input.path, input.framework, input.handler
    );
    let _ = writeln!(prompt, "Handler source:\n```\n{}\n```\n", input.handler_text);
    if !input.raw_params.is_empty() {
        let _ = writeln!(
            prompt,
            "Parameter hints found in the code: {}\n",
            input.raw_params.join(", ")
        );
    }
    if !input.context.is_empty() {
        let _ = writeln!(prompt, "Related definitions:");
        for chunk in &input.context {
            let _ = writeln!(prompt, "```\n{}\n```", chunk);
        }
        prompt.push('\n');
    }
    if !input.security_context.is_empty() {
        let _ = writeln!(prompt, "Authentication related code:");
        for chunk in &input.security_context {
            let _ = writeln!(prompt, "```\n{}\n```", chunk);
        }
        prompt.push('\n');
    }
    prompt.push_str(ENRICHMENT_SCHEMA);
    prompt
}

const ENRICHMENT_SCHEMA: &str = r#"Return exactly this JSON shape:
{
  "summary": "<one sentence>",
  "parameters": [{"name": "<name>", "in": "path|query|header|body", "type": "string|integer|number|boolean|array|object", "required": true}],
  "request_body": <JSON schema object or null>,
  "responses": {"200": {"description": "<text>", "schema": <JSON schema object or null>}},
  "security": ["bearer|apiKey|basic|oauth2|cookie"],
  "example": <example request or response value or null>
}
Rules: schemas are inline JSON Schema objects without "$ref"; include at least one response."#;

/// Follow-up prompt listing what was wrong with the previous reply.
pub fn corrective_prompt(original: &str, problems: &[String]) -> String {
    let mut prompt = String::from(original);
    let _ = write!(
        prompt,
        "\n\nYour previous reply was rejected:\n- {}\nReply again with corrected JSON only.",
        problems.join("\n- ")
    );
    prompt
}

/// The outermost `{ ... }` span of a model reply: from the first `{` to the last `}`.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&text[start..=end])
}

/// Prefix of `text` at most `max` bytes long, cut on a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
