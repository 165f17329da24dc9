//! Model-assisted endpoint extraction for files without a structural
//! extractor, or where the structural pass found nothing.
//!
//! The file is cut into line windows that fit the completion input limit.
//! Each window is sent with line numbers in file coordinates, so reported
//! lines need no shifting beyond clamping into the window.

use crate::chunking::{line_windows, TextWindow};
use crate::detector::FrameworkTag;
use crate::error::{FailureKind, SoftFailure};
use crate::extractor::{
    normalize_path, raw_params, synthetic_handler, EndpointCandidate, ExtractionMethod, HttpMethod,
    SourceLocation,
};
use crate::parser::{LineRange, SourceUnit};
use crate::prompts;
use crate::service::{CompletionRequest, Purpose, ServiceGateway};
use log::{debug, warn};
use serde::Deserialize;

/// Room left in each request for the instructions around the numbered excerpt.
const PROMPT_OVERHEAD_CHARS: usize = 1500;
/// Smallest window offered to the model, whatever the input limit.
const MIN_WINDOW_CHARS: usize = 500;
/// Per-line cost of the `{:>5} | ` numbering prefix.
const LINE_PREFIX_CHARS: usize = 8;

#[derive(Debug, Deserialize)]
struct ExtractionReply {
    endpoints: Vec<ReportedEndpoint>,
}

#[derive(Debug, Deserialize)]
struct ReportedEndpoint {
    method: String,
    path: String,
    #[serde(default)]
    handler: Option<String>,
    #[serde(default)]
    start_line: Option<usize>,
    #[serde(default)]
    end_line: Option<usize>,
}

pub struct ModelExtractor {
    window_chars: usize,
    overlap_chars: usize,
}

impl ModelExtractor {
    pub fn new(max_input_chars: usize, overlap_chars: usize) -> Self {
        let window_chars = max_input_chars
            .saturating_sub(PROMPT_OVERHEAD_CHARS)
            .max(MIN_WINDOW_CHARS);
        Self {
            window_chars,
            overlap_chars: overlap_chars.min(window_chars / 2),
        }
    }

    /// Ask the completion service for the endpoints `unit` declares.
    pub async fn extract(
        &self,
        unit: &SourceUnit,
        tag: &FrameworkTag,
        gateway: &ServiceGateway,
    ) -> (Vec<EndpointCandidate>, Vec<SoftFailure>) {
        let windows = self.windows(&unit.text);
        let path = unit.display_path();
        debug!("{}: model extraction over {} windows", path, windows.len());

        let requests: Vec<CompletionRequest> = windows
            .iter()
            .map(|w| CompletionRequest {
                purpose: Purpose::Extraction,
                system: prompts::EXTRACT_SYSTEM.to_string(),
                prompt: prompts::extraction_prompt(
                    &path,
                    unit.language,
                    &tag.framework,
                    w.lines.start,
                    &w.text,
                ),
            })
            .collect();
        let replies =
            futures::future::join_all(requests.iter().map(|r| gateway.complete(r))).await;

        let mut candidates = Vec::new();
        let mut failures = Vec::new();
        for (window, reply) in windows.iter().zip(replies) {
            let subject = format!("{}:{}-{}", path, window.lines.start, window.lines.end);
            let text = match reply {
                Ok(text) => text,
                Err(e) => {
                    warn!("Model extraction for {} failed: {}", subject, e);
                    failures.push(SoftFailure::new(
                        subject,
                        FailureKind::ServiceUnavailable,
                        e.to_string(),
                    ));
                    continue;
                }
            };
            match parse_reply(&text, window) {
                Ok((reported, rejected)) => {
                    if rejected > 0 {
                        failures.push(SoftFailure::new(
                            subject.clone(),
                            FailureKind::ExtractionMalformed,
                            format!("{} reported endpoints rejected", rejected),
                        ));
                    }
                    candidates.extend(
                        reported
                            .into_iter()
                            .map(|r| r.into_candidate(unit, tag)),
                    );
                }
                Err(message) => {
                    warn!("Model extraction for {}: {}", subject, message);
                    failures.push(SoftFailure::new(
                        subject,
                        FailureKind::ExtractionMalformed,
                        message,
                    ));
                }
            }
        }
        (candidates, failures)
    }

    fn windows(&self, text: &str) -> Vec<TextWindow> {
        // leave room for the numbering the prompt adds to every line
        let lines = text.lines().count().max(1);
        let avg_line = text.len() / lines + 1;
        let budget = self.window_chars * avg_line / (avg_line + LINE_PREFIX_CHARS);
        line_windows(
            text,
            1,
            budget.max(1),
            self.overlap_chars.min(budget / 2),
        )
    }
}

/// One accepted endpoint, in file coordinates.
struct Reported {
    method: HttpMethod,
    path: String,
    handler: Option<String>,
    lines: LineRange,
}

impl Reported {
    fn into_candidate(self, unit: &SourceUnit, tag: &FrameworkTag) -> EndpointCandidate {
        let handler = self
            .handler
            .unwrap_or_else(|| synthetic_handler(self.method, &self.path));
        EndpointCandidate {
            method: self.method,
            raw_params: raw_params(&self.path, &unit.lines(self.lines)),
            path: self.path,
            location: SourceLocation {
                file: unit.path.clone(),
                lines: self.lines,
            },
            handler,
            handler_lines: Some(self.lines),
            tag: tag.clone(),
            extraction: ExtractionMethod::Model,
            conflict: None,
        }
    }
}

/// Accepted endpoints plus the number of entries that did not conform.
fn parse_reply(text: &str, window: &TextWindow) -> Result<(Vec<Reported>, usize), String> {
    let json = prompts::extract_json_object(text).ok_or("reply holds no JSON object")?;
    let reply: ExtractionReply =
        serde_json::from_str(json).map_err(|e| format!("unexpected reply shape: {}", e))?;

    let mut accepted = Vec::new();
    let mut rejected = 0;
    for entry in reply.endpoints {
        match accept(entry, window) {
            Some(reported) => accepted.push(reported),
            None => rejected += 1,
        }
    }
    Ok((accepted, rejected))
}

fn accept(entry: ReportedEndpoint, window: &TextWindow) -> Option<Reported> {
    let method = HttpMethod::from_name(entry.method.trim())?;
    let raw = entry.path.trim();
    if !raw.starts_with('/') || raw.contains("${") {
        return None;
    }
    let path = normalize_path(raw)?;

    let clamp = |line: usize| line.clamp(window.lines.start, window.lines.end);
    let start = clamp(entry.start_line.unwrap_or(window.lines.start));
    let end = clamp(entry.end_line.unwrap_or(start)).max(start);

    let handler = entry
        .handler
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty() && !h.contains(char::is_whitespace));

    Some(Reported {
        method,
        path,
        handler,
        lines: LineRange::new(start, end),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::DetectionMethod;
    use crate::error::ServiceError;
    use crate::parser::{GrammarRegistry, Language};
    use crate::service::{CallPolicy, CompletionService, DisabledService};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Scripted<F>(F);

    #[async_trait]
    impl<F> CompletionService for Scripted<F>
    where
        F: Fn(&CompletionRequest) -> Result<String, ServiceError> + Send + Sync,
    {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, request: &CompletionRequest) -> Result<String, ServiceError> {
            (self.0)(request)
        }
    }

    fn gateway(completion: Arc<dyn CompletionService>) -> ServiceGateway {
        ServiceGateway::new(
            completion,
            Arc::new(DisabledService),
            2,
            CallPolicy {
                timeout: Duration::from_secs(5),
                max_retries: 0,
                backoff_base: Duration::from_millis(1),
                max_input_chars: 24_000,
            },
            CancellationToken::new(),
        )
    }

    fn tag() -> FrameworkTag {
        FrameworkTag {
            language: Language::Python,
            framework: "django".to_string(),
            confidence: 0.9,
            method: DetectionMethod::Rule,
        }
    }

    fn unit(source: &str) -> SourceUnit {
        GrammarRegistry::new()
            .parse(Path::new("views.py"), source.to_string())
            .unwrap()
    }

    const VIEWS: &str = r#"from django.urls import path

def post_detail(request, pk):
    page = request.GET.get("page")
    return JsonResponse({})

urlpatterns = [
    path("posts/<int:pk>/", post_detail),
]
"#;

    #[tokio::test]
    async fn test_reported_endpoints_become_candidates() {
        let reply = r#"Here you go:
{"endpoints": [
  {"method": "get", "path": "/posts/<int:pk>/", "handler": "post_detail", "start_line": 3, "end_line": 5},
  {"method": "FETCH", "path": "/nope"},
  {"method": "POST", "path": "/posts", "start_line": 99}
]}"#;
        let gw = gateway(Arc::new(Scripted(move |_: &CompletionRequest| {
            Ok(reply.to_string())
        })));
        let u = unit(VIEWS);
        let (candidates, failures) = ModelExtractor::new(24_000, 200).extract(&u, &tag(), &gw).await;

        assert_eq!(candidates.len(), 2);
        let detail = &candidates[0];
        assert_eq!(detail.method, HttpMethod::Get);
        assert_eq!(detail.path, "/posts/{pk}");
        assert_eq!(detail.handler, "post_detail");
        assert_eq!(detail.location.lines, LineRange::new(3, 5));
        assert_eq!(detail.extraction, ExtractionMethod::Model);
        assert!(detail.raw_params.contains(&"path:pk".to_string()));

        // out-of-window lines are clamped, missing handlers synthesized
        let create = &candidates[1];
        assert_eq!(create.handler, "post_posts");
        assert_eq!(create.location.lines, LineRange::new(9, 9));

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, FailureKind::ExtractionMalformed);
    }

    #[tokio::test]
    async fn test_large_file_is_windowed_in_file_coordinates() {
        let source: String = (1..=400)
            .map(|i| format!("# filler line number {:04} of the module\n", i))
            .collect();
        let gw = gateway(Arc::new(Scripted(|request: &CompletionRequest| {
            let first: usize = request
                .prompt
                .split("numbered from ")
                .nth(1)
                .and_then(|rest| rest.split('.').next())
                .and_then(|n| n.parse().ok())
                .unwrap_or(0);
            Ok(format!(
                r#"{{"endpoints": [{{"method": "GET", "path": "/w{first}", "start_line": {line}}}]}}"#,
                line = first + 1
            ))
        })));
        let u = unit(&source);
        let (candidates, failures) = ModelExtractor::new(2_000, 100).extract(&u, &tag(), &gw).await;

        assert!(failures.is_empty());
        assert!(candidates.len() > 1);
        assert_eq!(candidates[0].path, "/w1");
        assert_eq!(candidates[0].location.lines.start, 2);
        for candidate in &candidates {
            let first: usize = candidate.path[2..].parse().unwrap();
            assert_eq!(candidate.location.lines.start, first + 1);
            assert!(candidate.location.lines.end <= 400);
        }
    }

    #[tokio::test]
    async fn test_malformed_and_unavailable_are_soft_failures() {
        let u = unit(VIEWS);

        let gw = gateway(Arc::new(Scripted(|_: &CompletionRequest| {
            Ok("I could not find any routes.".to_string())
        })));
        let (candidates, failures) = ModelExtractor::new(24_000, 200).extract(&u, &tag(), &gw).await;
        assert!(candidates.is_empty());
        assert_eq!(failures[0].kind, FailureKind::ExtractionMalformed);

        let gw = gateway(Arc::new(DisabledService));
        let (candidates, failures) = ModelExtractor::new(24_000, 200).extract(&u, &tag(), &gw).await;
        assert!(candidates.is_empty());
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, FailureKind::ServiceUnavailable);
    }
}
