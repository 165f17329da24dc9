//! The end-to-end run: scan, parse, detect, harvest, enrich, build, merge,
//! validate and write.
//!
//! Stages are separated by barriers and their results folded here. CPU-bound
//! stages (parsing and native harvesting) run on the rayon pool behind
//! `spawn_blocking`; service-bound stages run as tokio futures whose calls the
//! [`ServiceGateway`] bounds, times out and retries. Per-file and
//! per-endpoint problems are collected into the [`RunSummary`]; only
//! validation, cancellation and output I/O end a run.

use crate::config::GeneratorConfig;
use crate::context::ContextIndex;
use crate::detector::{FrameworkDetector, FrameworkTag};
use crate::enricher::Enricher;
use crate::error::{PipelineError, Result, SoftFailure};
use crate::extractor::model::ModelExtractor;
use crate::extractor::{deduplicate, harvest_native, EndpointCandidate, HarvestPlan};
use crate::merger;
use crate::openapi_builder::{Info, OpenApiBuilder, OpenApiDocument};
use crate::parser::{GrammarRegistry, SourceUnit};
use crate::scanner::FileScanner;
use crate::serializer;
use crate::service::{CallPolicy, CompletionService, EmbeddingService, ServiceGateway};
use crate::validator;
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum RunStatus {
    Succeeded,
    Failed(String),
}

/// What a run did, including everything it had to skip or degrade.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub status: RunStatus,
    pub files_scanned: usize,
    pub files_parsed: usize,
    /// Files that could not be read or parsed.
    pub skipped_files: Vec<PathBuf>,
    pub candidates: usize,
    pub operations: usize,
    /// `METHOD /path` of operations emitted with best-effort fields.
    pub degraded_endpoints: Vec<String>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub preserved: usize,
    pub failures: Vec<SoftFailure>,
    pub warnings: Vec<String>,
    pub output: Option<PathBuf>,
}

impl RunSummary {
    fn new() -> Self {
        Self {
            status: RunStatus::Succeeded,
            files_scanned: 0,
            files_parsed: 0,
            skipped_files: Vec::new(),
            candidates: 0,
            operations: 0,
            degraded_endpoints: Vec::new(),
            added: Vec::new(),
            removed: Vec::new(),
            preserved: 0,
            failures: Vec::new(),
            warnings: Vec::new(),
            output: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.status {
            RunStatus::Succeeded => writeln!(f, "Run succeeded")?,
            RunStatus::Failed(reason) => writeln!(f, "Run failed: {}", reason)?,
        }
        writeln!(
            f,
            "  files: {} scanned, {} parsed, {} skipped",
            self.files_scanned,
            self.files_parsed,
            self.skipped_files.len()
        )?;
        writeln!(
            f,
            "  endpoints: {} candidates, {} operations, {} degraded",
            self.candidates,
            self.operations,
            self.degraded_endpoints.len()
        )?;
        writeln!(
            f,
            "  merge: {} added, {} removed, {} preserved",
            self.added.len(),
            self.removed.len(),
            self.preserved
        )?;
        write!(f, "  soft failures: {}", self.failures.len())?;
        if let Some(output) = &self.output {
            write!(f, "\n  output: {}", output.display())?;
        }
        Ok(())
    }
}

/// One harvested (unit, tag) pair, before any model pass.
struct Harvest {
    unit: usize,
    tag: FrameworkTag,
    plan: HarvestPlan,
    native: Vec<EndpointCandidate>,
}

pub struct Pipeline {
    config: GeneratorConfig,
    registry: Arc<GrammarRegistry>,
    gateway: ServiceGateway,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(
        config: GeneratorConfig,
        completion: Arc<dyn CompletionService>,
        embedding: Arc<dyn EmbeddingService>,
        cancel: CancellationToken,
    ) -> Self {
        let gateway = ServiceGateway::new(
            completion,
            embedding,
            config.concurrency_limit,
            CallPolicy::from(&config.service),
            cancel.clone(),
        );
        Self {
            config,
            registry: Arc::new(GrammarRegistry::new()),
            gateway,
            cancel,
        }
    }

    /// Generate the document for `root` and write it to `output`.
    ///
    /// The document at `output`, if any, is the merge baseline. It is only
    /// replaced when the new document validates and the run was not
    /// cancelled.
    pub async fn run(&self, root: &Path, output: &Path) -> RunSummary {
        let mut summary = RunSummary::new();
        if let Err(e) = self.run_inner(root, output, &mut summary).await {
            warn!("Run failed: {}", e);
            summary.status = RunStatus::Failed(e.to_string());
        }
        summary.failures.sort();
        summary
    }

    async fn run_inner(&self, root: &Path, output: &Path, summary: &mut RunSummary) -> Result<()> {
        let baseline = serializer::read_baseline(output)?;
        let document = self.generate(root, baseline.as_ref(), summary).await?;
        self.check_cancelled()?;

        let content = serializer::serialize_for(&document, output)?;
        serializer::write_atomic(&content, output)?;
        info!("Wrote {} operations to {}", document.operation_count(), output.display());
        summary.output = Some(output.to_path_buf());
        Ok(())
    }

    /// Every stage up to and including validation, without touching the output.
    pub async fn generate(
        &self,
        root: &Path,
        baseline: Option<&OpenApiDocument>,
        summary: &mut RunSummary,
    ) -> Result<OpenApiDocument> {
        let units = self.parse_repository(root, summary).await?;
        self.check_cancelled()?;

        info!("Detecting frameworks...");
        let (detector, failures) = FrameworkDetector::new(
            &self.config.framework_signatures,
            self.config.detection.clone(),
            self.config.framework.clone(),
        );
        summary.failures.extend(failures);
        let detection = detector.detect(&units, &self.gateway).await;
        summary.failures.extend(detection.failures.iter().cloned());
        self.check_cancelled()?;

        let units = Arc::new(units);
        let tagged: Vec<(usize, Vec<FrameworkTag>)> = units
            .iter()
            .enumerate()
            .filter_map(|(i, unit)| {
                let tags = detection.tags_for(unit);
                (!tags.is_empty()).then(|| (i, tags.to_vec()))
            })
            .collect();
        info!("{} files carry a framework tag", tagged.len());

        let harvests = self.harvest(Arc::clone(&units), tagged).await?;
        let mut candidates: Vec<EndpointCandidate> = Vec::new();
        let extractor = ModelExtractor::new(
            self.gateway.policy().max_input_chars,
            self.config.chunking.overlap_chars,
        );
        let model_jobs: Vec<&Harvest> = harvests
            .iter()
            .filter(|h| h.plan.needs_model(h.native.len()))
            .collect();
        info!(
            "Native harvest found {} routes; {} files need model extraction",
            harvests.iter().map(|h| h.native.len()).sum::<usize>(),
            model_jobs.len()
        );
        let model_results = futures::future::join_all(
            model_jobs
                .iter()
                .map(|h| extractor.extract(&units[h.unit], &h.tag, &self.gateway)),
        )
        .await;
        for harvest in &harvests {
            candidates.extend(harvest.native.iter().cloned());
        }
        for (found, failures) in model_results {
            candidates.extend(found);
            summary.failures.extend(failures);
        }
        self.check_cancelled()?;

        let deduplicated = deduplicate(candidates);
        summary.failures.extend(deduplicated.conflicts);
        summary.candidates = deduplicated.candidates.len();
        info!("{} endpoint candidates after deduplication", summary.candidates);

        let (index, failures) = ContextIndex::build(
            &units,
            &self.registry,
            &self.config.chunking,
            self.config.embedding.batch_size,
            &self.gateway,
        )
        .await;
        summary.failures.extend(failures);
        self.check_cancelled()?;

        let enricher = Enricher::new(&units, &index, &self.gateway, self.config.max_context_chunks);
        let (endpoints, failures) = enricher.enrich_all(deduplicated.candidates).await;
        summary.failures.extend(failures);
        self.check_cancelled()?;

        info!("Building OpenAPI document...");
        let mut builder = OpenApiBuilder::new(Info::from_config(&self.config.info, &repository_name(root)))
            .with_server(self.config.api_host.as_deref())
            .with_baseline(baseline);
        builder.add_endpoints(&endpoints);
        let (document, conflicts) = builder.build();
        summary.failures.extend(conflicts);

        let report = merger::merge(document, baseline, self.config.preserve_removed_endpoints)?;
        summary.added = report.added;
        summary.removed = report.removed;
        summary.preserved = report.preserved;
        let document = report.document;

        validator::ensure_valid(&document)?;
        summary.operations = document.operation_count();
        summary.degraded_endpoints = document
            .paths
            .iter()
            .flat_map(|(path, item)| {
                item.operations()
                    .into_iter()
                    .filter(|(_, op)| op.degraded.is_some())
                    .map(move |(method, _)| format!("{} {}", method, path))
            })
            .collect();
        Ok(document)
    }

    /// Scan and parse on the rayon pool. Unreadable and unparseable files are
    /// skipped and recorded.
    async fn parse_repository(&self, root: &Path, summary: &mut RunSummary) -> Result<Vec<SourceUnit>> {
        info!("Scanning {}...", root.display());
        let scanner = FileScanner::new(
            root.to_path_buf(),
            &self.config.ignore_patterns,
            &self.registry.extensions(),
        )?;
        let scan = scanner.scan()?;
        summary.files_scanned = scan.files.len();
        summary.warnings.extend(scan.warnings);
        info!("Found {} source files", scan.files.len());

        let registry = Arc::clone(&self.registry);
        let root = root.to_path_buf();
        let files = scan.files;
        let results = tokio::task::spawn_blocking(move || {
            let reads: Vec<(PathBuf, std::io::Result<String>)> = files
                .into_par_iter()
                .map(|path| {
                    let relative = path.strip_prefix(&root).unwrap_or(&path).to_path_buf();
                    (relative, std::fs::read_to_string(&path))
                })
                .collect();
            let mut readable = Vec::new();
            let mut unreadable = Vec::new();
            for (path, text) in reads {
                match text {
                    Ok(text) => readable.push((path, text)),
                    Err(e) => unreadable.push((path, e)),
                }
            }
            let paths: Vec<PathBuf> = readable.iter().map(|(p, _)| p.clone()).collect();
            let parsed = registry.parse_all(readable);
            (paths.into_iter().zip(parsed).collect::<Vec<_>>(), unreadable)
        })
        .await
        .map_err(|e| PipelineError::Io(std::io::Error::other(e.to_string())))?;

        let (parsed, unreadable) = results;
        for (path, e) in unreadable {
            warn!("Skipping unreadable file {}: {}", path.display(), e);
            summary.failures.push(SoftFailure::from_error(
                path.display().to_string(),
                &PipelineError::ParseError {
                    file: path.clone(),
                    message: e.to_string(),
                },
            ));
            summary.skipped_files.push(path);
        }

        let mut units = Vec::new();
        for (path, result) in parsed {
            match result {
                Ok(unit) => units.push(unit),
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                    summary
                        .failures
                        .push(SoftFailure::from_error(path.display().to_string(), &e));
                    summary.skipped_files.push(path);
                }
            }
        }
        summary.skipped_files.sort();
        summary.files_parsed = units.len();
        info!("Parsed {} files, skipped {}", units.len(), summary.skipped_files.len());
        Ok(units)
    }

    async fn harvest(
        &self,
        units: Arc<Vec<SourceUnit>>,
        tagged: Vec<(usize, Vec<FrameworkTag>)>,
    ) -> Result<Vec<Harvest>> {
        let registry = Arc::clone(&self.registry);
        let settings = self.config.detection.clone();
        tokio::task::spawn_blocking(move || {
            let (units, registry, settings) = (&units, &registry, &settings);
            tagged
                .into_par_iter()
                .flat_map_iter(move |(unit, tags)| {
                    tags.into_iter().map(move |tag| {
                        let plan = HarvestPlan::for_tag(&tag, settings);
                        let native = if plan.runs_native() {
                            harvest_native(&units[unit], &tag, registry)
                        } else {
                            Vec::new()
                        };
                        debug!(
                            "{}: {:?} for {} found {} routes",
                            units[unit].display_path(),
                            plan,
                            tag.framework,
                            native.len()
                        );
                        Harvest {
                            unit,
                            tag,
                            plan,
                            native,
                        }
                    })
                })
                .collect()
        })
        .await
        .map_err(|e| PipelineError::Io(std::io::Error::other(e.to_string())))
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }
}

/// Directory name of the repository root, used as the default API title.
fn repository_name(root: &Path) -> String {
    root.canonicalize()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .or_else(|| root.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "api".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::DisabledService;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;

    fn offline(config: GeneratorConfig) -> Pipeline {
        Pipeline::new(
            config,
            Arc::new(DisabledService),
            Arc::new(DisabledService),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_offline_run_uses_native_routes() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("shop");
        fs::create_dir_all(&root).unwrap();
        fs::write(
            root.join("app.py"),
            "from flask import Flask\napp = Flask(__name__)\n\n@app.route('/items/<int:item_id>', methods=['GET'])\ndef get_item(item_id):\n    return {}\n",
        )
        .unwrap();

        let output = root.join("openapi.json");
        let summary = offline(GeneratorConfig::default()).run(&root, &output).await;
        assert!(summary.succeeded(), "{}", summary);
        assert_eq!(summary.operations, 1);
        assert_eq!(summary.degraded_endpoints, vec!["GET /items/{item_id}"]);

        let document = serializer::read_baseline(&output).unwrap().unwrap();
        assert_eq!(document.info.title, "shop");
        let op = document
            .operation("/items/{item_id}", crate::extractor::HttpMethod::Get)
            .unwrap();
        assert_eq!(op.parameters[0].name, "item_id");
        assert_eq!(op.parameters[0].location, "path");
    }

    #[tokio::test]
    async fn test_offline_run_keeps_extractor_types_out_of_parameters() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("main.rs"),
            r#"use axum::{extract::{Json, Query}, routing::get, Router};

fn app() -> Router {
    Router::new().route("/users", get(list_users).post(create_user))
}

async fn list_users(Query(page): Query<Pagination>) -> String {
    String::new()
}

async fn create_user(Json(body): Json<CreateUser>) -> String {
    String::new()
}
"#,
        )
        .unwrap();

        let output = dir.path().join("openapi.json");
        let summary = offline(GeneratorConfig::default()).run(dir.path(), &output).await;
        assert!(summary.succeeded(), "{}", summary);
        assert_eq!(summary.degraded_endpoints, vec!["GET /users", "POST /users"]);

        let document = serializer::read_baseline(&output).unwrap().unwrap();
        let list = document.operation("/users", crate::extractor::HttpMethod::Get).unwrap();
        let create = document.operation("/users", crate::extractor::HttpMethod::Post).unwrap();
        assert!(list.parameters.is_empty());
        assert!(create.request_body.is_none());
        assert!(document.schemas().is_empty());

        let written = fs::read_to_string(&output).unwrap();
        assert!(!written.contains("Pagination"));
        assert!(!written.contains("CreateUser"));
    }

    #[tokio::test]
    async fn test_cancelled_run_writes_nothing() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("main.rs"),
            "use axum::{routing::get, Router};\nfn app() -> Router { Router::new().route(\"/health\", get(health)) }\nasync fn health() {}\n",
        )
        .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let pipeline = Pipeline::new(
            GeneratorConfig::default(),
            Arc::new(DisabledService),
            Arc::new(DisabledService),
            cancel,
        );

        let output = dir.path().join("openapi.json");
        let summary = pipeline.run(dir.path(), &output).await;
        assert_eq!(summary.status, RunStatus::Failed("run cancelled".to_string()));
        assert!(!output.exists());
    }

    #[test]
    fn test_repository_name() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("billing-service");
        fs::create_dir_all(&root).unwrap();
        assert_eq!(repository_name(&root), "billing-service");
    }
}
