use crate::config::DetectionConfig;
use crate::error::{FailureKind, SoftFailure};
use crate::parser::{Language, SourceUnit};
use crate::prompts::{self, ClassificationEntry};
use crate::service::{CompletionRequest, Purpose, ServiceGateway};
use log::{debug, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::LazyLock;

/// How a framework tag was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMethod {
    Rule,
    Model,
}

/// A framework attributed to one source unit, with the confidence of the attribution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameworkTag {
    pub language: Language,
    pub framework: String,
    pub confidence: f32,
    pub method: DetectionMethod,
}

/// A lexical signature: a regex whose presence adds `weight` to a framework's score.
#[derive(Debug, Clone, Deserialize)]
pub struct FrameworkSignature {
    pub framework: String,
    pub language: Language,
    pub pattern: String,
    #[serde(default = "default_weight")]
    pub weight: f32,
}

fn default_weight() -> f32 {
    0.5
}

struct CompiledSignature {
    framework: String,
    language: Language,
    regex: Regex,
    weight: f32,
}

/// Built-in table: (framework, language, pattern, weight).
const BUILTIN_SIGNATURES: &[(&str, Language, &str, f32)] = &[
    ("axum", Language::Rust, r"\buse\s+axum\b|\baxum::", 0.6),
    ("axum", Language::Rust, r#"\.route\(\s*""#, 0.3),
    ("axum", Language::Rust, r"Router::new\(\)", 0.2),
    ("actix-web", Language::Rust, r"\bactix_web\b", 0.6),
    ("actix-web", Language::Rust, r#"#\[(get|post|put|delete|patch)\(\s*""#, 0.4),
    ("actix-web", Language::Rust, r"web::(get|post|put|delete|patch|scope|resource)\(", 0.3),
    ("flask", Language::Python, r"from\s+flask\s+import|import\s+flask\b", 0.6),
    ("flask", Language::Python, r"@\w+\.route\(", 0.4),
    ("flask", Language::Python, r"\bBlueprint\(", 0.3),
    ("fastapi", Language::Python, r"from\s+fastapi\b|import\s+fastapi\b", 0.6),
    ("fastapi", Language::Python, r"@\w+\.(get|post|put|delete|patch)\(", 0.4),
    ("fastapi", Language::Python, r"\bAPIRouter\(", 0.3),
    ("django", Language::Python, r"from\s+django\b|import\s+django\b", 0.4),
    ("django", Language::Python, r"\burlpatterns\s*=", 0.5),
    ("django", Language::Python, r"from\s+rest_framework\b", 0.3),
    ("express", Language::JavaScript, r#"require\(\s*['"]express['"]\s*\)|from\s+['"]express['"]"#, 0.6),
    ("express", Language::JavaScript, r"\bexpress\.Router\(\)|\bRouter\(\)", 0.4),
    ("express", Language::JavaScript, r#"\b\w*(app|router|routes|api|server)\.(get|post|put|delete|patch)\(\s*['"`]/"#, 0.4),
    ("nestjs", Language::TypeScript, r"@nestjs/", 0.6),
    ("nestjs", Language::TypeScript, r"@Controller\(", 0.4),
    ("nestjs", Language::TypeScript, r"@(Get|Post|Put|Delete|Patch)\(", 0.3),
    ("gin", Language::Go, r"github\.com/gin-gonic/gin", 0.7),
    ("gin", Language::Go, r#"\.(GET|POST|PUT|DELETE|PATCH)\(\s*""#, 0.3),
    ("echo", Language::Go, r"github\.com/labstack/echo", 0.7),
    ("echo", Language::Go, r#"\.(GET|POST|PUT|DELETE|PATCH)\(\s*""#, 0.3),
    ("chi", Language::Go, r"github\.com/go-chi/chi", 0.7),
    ("chi", Language::Go, r#"\.(Get|Post|Put|Delete|Patch)\(\s*""#, 0.3),
    ("fiber", Language::Go, r"github\.com/gofiber/fiber", 0.7),
    ("fiber", Language::Go, r#"\.(Get|Post|Put|Delete|Patch)\(\s*""#, 0.3),
];

/// Generic signs that a file registers routes, whatever the framework.
static ROUTING_HINTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\.(get|post|put|delete|patch|route|handle|handlefunc|all)\s*\(\s*["'`]/|@\w*(route|mapping)\b|@(get|post|put|delete|patch)\(|\burlpatterns\b"#).unwrap()
});

const EXCERPT_CHARS: usize = 2000;
const PROMPT_OVERHEAD_CHARS: usize = 1000;

/// Result of framework detection.
///
/// Units without an entry carry no tag and are not harvested.
pub struct DetectionResult {
    pub tags: BTreeMap<PathBuf, Vec<FrameworkTag>>,
    pub failures: Vec<SoftFailure>,
}

impl DetectionResult {
    pub fn tags_for(&self, unit: &SourceUnit) -> &[FrameworkTag] {
        self.tags.get(&unit.path).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Framework detector combining signature rules with batched model classification.
pub struct FrameworkDetector {
    signatures: Vec<CompiledSignature>,
    settings: DetectionConfig,
    forced: Option<String>,
}

impl FrameworkDetector {
    /// Build a detector from the built-in table plus `extra` signatures.
    ///
    /// Invalid extra patterns are reported as soft failures and skipped.
    pub fn new(
        extra: &[FrameworkSignature],
        settings: DetectionConfig,
        forced: Option<String>,
    ) -> (Self, Vec<SoftFailure>) {
        let mut signatures = Vec::new();
        let mut failures = Vec::new();

        for (framework, language, pattern, weight) in BUILTIN_SIGNATURES {
            if let Ok(regex) = Regex::new(pattern) {
                signatures.push(CompiledSignature {
                    framework: framework.to_string(),
                    language: *language,
                    regex,
                    weight: *weight,
                });
            }
        }

        for signature in extra {
            match Regex::new(&signature.pattern) {
                Ok(regex) => signatures.push(CompiledSignature {
                    framework: signature.framework.to_lowercase(),
                    language: signature.language,
                    regex,
                    weight: signature.weight.clamp(0.0, 1.0),
                }),
                Err(e) => {
                    warn!("Ignoring signature for {}: {}", signature.framework, e);
                    failures.push(SoftFailure::new(
                        format!("signature {}", signature.framework),
                        FailureKind::DetectionAmbiguous,
                        format!("invalid pattern: {}", e),
                    ));
                }
            }
        }

        let detector = Self {
            signatures,
            settings,
            forced: forced.map(|f| f.to_lowercase()),
        };
        (detector, failures)
    }

    /// Framework names known to the signature table, sorted.
    pub fn known_frameworks(&self) -> Vec<String> {
        let names: BTreeSet<&str> = self.signatures.iter().map(|s| s.framework.as_str()).collect();
        names.into_iter().map(String::from).collect()
    }

    /// Rule-stage tags for every framework with a non-zero score, highest first.
    pub fn rule_tags(&self, unit: &SourceUnit) -> Vec<FrameworkTag> {
        let mut scores: BTreeMap<&str, f32> = BTreeMap::new();
        for signature in &self.signatures {
            if signature.language.covers(unit.language) && signature.regex.is_match(&unit.text) {
                *scores.entry(signature.framework.as_str()).or_insert(0.0) += signature.weight;
            }
        }
        let mut tags: Vec<FrameworkTag> = scores
            .into_iter()
            .map(|(framework, score)| FrameworkTag {
                language: unit.language,
                framework: framework.to_string(),
                confidence: score.min(1.0),
                method: DetectionMethod::Rule,
            })
            .collect();
        sort_tags(&mut tags);
        tags
    }

    pub fn has_routing_hints(&self, unit: &SourceUnit) -> bool {
        ROUTING_HINTS.is_match(&unit.text)
    }

    /// Tag every unit. Units whose rules are inconclusive but that show routing
    /// hints are classified by the completion service in as few batches as fit.
    pub async fn detect(&self, units: &[SourceUnit], gateway: &ServiceGateway) -> DetectionResult {
        debug!("Detecting frameworks in {} files", units.len());
        let mut result = DetectionResult {
            tags: BTreeMap::new(),
            failures: Vec::new(),
        };

        if let Some(forced) = &self.forced {
            self.apply_override(forced, units, &mut result);
            return result;
        }

        let mut ambiguous: Vec<(&SourceUnit, Option<FrameworkTag>)> = Vec::new();
        for unit in units {
            let rule = self.rule_tags(unit);
            let confident: Vec<FrameworkTag> = rule
                .iter()
                .filter(|t| t.confidence >= self.settings.threshold)
                .cloned()
                .collect();
            if !confident.is_empty() {
                debug!("{}: {:?}", unit.display_path(), confident);
                result.tags.insert(unit.path.clone(), confident);
            } else if self.has_routing_hints(unit) {
                ambiguous.push((unit, rule.into_iter().next()));
            } else if let Some(weak) = rule.first() {
                debug!("{}: weak {:?} without routing hints", unit.display_path(), weak);
                result.failures.push(SoftFailure::new(
                    unit.display_path(),
                    FailureKind::DetectionAmbiguous,
                    format!(
                        "{} signature at confidence {:.2} is below the threshold {:.2} and no routes are visible; file not harvested",
                        weak.framework, weak.confidence, self.settings.threshold
                    ),
                ));
            }
        }

        if !ambiguous.is_empty() {
            info!(
                "{} files need model classification",
                ambiguous.len()
            );
            let model_tags = self.classify(&ambiguous, gateway, &mut result.failures).await;
            for (i, (unit, rule)) in ambiguous.iter().enumerate() {
                let model = model_tags.get(&i);
                match resolve(rule.as_ref(), model, self.settings.tie_margin) {
                    Some(tag) if tag.framework != "none" => {
                        debug!("{}: resolved to {:?}", unit.display_path(), tag);
                        result.tags.insert(unit.path.clone(), vec![tag]);
                    }
                    _ => debug!("{}: no framework", unit.display_path()),
                }
            }
        }

        info!(
            "Tagged {} of {} files with a framework",
            result.tags.len(),
            units.len()
        );
        result
    }

    fn apply_override(&self, forced: &str, units: &[SourceUnit], result: &mut DetectionResult) {
        let languages: Vec<Language> = self
            .signatures
            .iter()
            .filter(|s| s.framework == forced)
            .map(|s| s.language)
            .collect();
        if languages.is_empty() {
            warn!(
                "Framework '{}' has no signatures; applying it to every file",
                forced
            );
        }
        info!("Using user-specified framework: {}", forced);
        for unit in units {
            if languages.is_empty() || languages.iter().any(|l| l.covers(unit.language)) {
                result.tags.insert(
                    unit.path.clone(),
                    vec![FrameworkTag {
                        language: unit.language,
                        framework: forced.to_string(),
                        confidence: 1.0,
                        method: DetectionMethod::Rule,
                    }],
                );
            }
        }
    }

    /// Ask the completion service for labels. Returns tags keyed by position in `ambiguous`.
    async fn classify(
        &self,
        ambiguous: &[(&SourceUnit, Option<FrameworkTag>)],
        gateway: &ServiceGateway,
        failures: &mut Vec<SoftFailure>,
    ) -> BTreeMap<usize, FrameworkTag> {
        let budget = gateway
            .policy()
            .max_input_chars
            .saturating_sub(PROMPT_OVERHEAD_CHARS)
            .max(EXCERPT_CHARS);
        let frameworks = self.known_frameworks();

        let mut batches: Vec<Vec<ClassificationEntry<'_>>> = vec![Vec::new()];
        let mut used = 0;
        for (index, (unit, _)) in ambiguous.iter().enumerate() {
            let excerpt = prompts::truncate_chars(&unit.text, EXCERPT_CHARS);
            let cost = excerpt.len() + unit.path.as_os_str().len() + 32;
            if used + cost > budget && batches.last().is_some_and(|b| !b.is_empty()) {
                batches.push(Vec::new());
                used = 0;
            }
            used += cost;
            if let Some(batch) = batches.last_mut() {
                batch.push(ClassificationEntry {
                    index,
                    path: unit.path.to_str().unwrap_or_default(),
                    language: unit.language,
                    excerpt,
                });
            }
        }

        let requests: Vec<CompletionRequest> = batches
            .iter()
            .map(|batch| CompletionRequest {
                purpose: Purpose::Classification,
                system: prompts::CLASSIFY_SYSTEM.to_string(),
                prompt: prompts::classification_prompt(batch, &frameworks),
            })
            .collect();
        let replies =
            futures::future::join_all(requests.iter().map(|r| gateway.complete(r))).await;

        let mut tags = BTreeMap::new();
        for (batch, reply) in batches.iter().zip(replies) {
            let subject = format!("framework classification ({} files)", batch.len());
            let text = match reply {
                Ok(text) => text,
                Err(e) => {
                    warn!("{} failed: {}", subject, e);
                    failures.push(SoftFailure::new(
                        subject,
                        FailureKind::ServiceUnavailable,
                        e.to_string(),
                    ));
                    continue;
                }
            };
            match parse_classifications(&text) {
                Some(items) => {
                    let indices: BTreeSet<usize> = batch.iter().map(|e| e.index).collect();
                    for item in items {
                        if !indices.contains(&item.file) {
                            continue;
                        }
                        let (unit, _) = &ambiguous[item.file];
                        tags.insert(
                            item.file,
                            FrameworkTag {
                                language: unit.language,
                                framework: item.framework.trim().to_lowercase(),
                                confidence: item.confidence.clamp(0.0, 1.0),
                                method: DetectionMethod::Model,
                            },
                        );
                    }
                }
                None => {
                    warn!("{}: unparseable reply", subject);
                    failures.push(SoftFailure::new(
                        subject,
                        FailureKind::DetectionAmbiguous,
                        "classification reply did not match the expected shape",
                    ));
                }
            }
        }
        tags
    }
}

#[derive(Deserialize)]
struct ClassificationReply {
    classifications: Vec<Classification>,
}

#[derive(Deserialize)]
struct Classification {
    file: usize,
    framework: String,
    confidence: f32,
}

fn parse_classifications(text: &str) -> Option<Vec<Classification>> {
    let json = prompts::extract_json_object(text)?;
    serde_json::from_str::<ClassificationReply>(json)
        .ok()
        .map(|r| r.classifications)
}

/// Tie-break between a rule tag and a model tag.
///
/// The rule result wins when the confidences differ by less than `margin`;
/// otherwise the higher confidence wins.
pub fn resolve(
    rule: Option<&FrameworkTag>,
    model: Option<&FrameworkTag>,
    margin: f32,
) -> Option<FrameworkTag> {
    match (rule, model) {
        (Some(r), Some(m)) => {
            if (r.confidence - m.confidence).abs() < margin || r.confidence >= m.confidence {
                Some(r.clone())
            } else {
                Some(m.clone())
            }
        }
        (Some(r), None) => Some(r.clone()),
        (None, Some(m)) => Some(m.clone()),
        (None, None) => None,
    }
}

fn sort_tags(tags: &mut [FrameworkTag]) {
    tags.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| a.framework.cmp(&b.framework))
    });
}
