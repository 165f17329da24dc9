use crate::config::{load_config, GeneratorConfig};
use crate::pipeline::{Pipeline, RunSummary};
use crate::service::{create_completion_service, create_embedding_service, CallPolicy};
use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// OpenAPI Synth - Generate an OpenAPI 3.0 document from a polyglot source repository
#[derive(Parser, Debug)]
#[command(name = "openapi-synth")]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to the repository root
    #[arg(value_name = "PROJECT_PATH")]
    pub project_path: PathBuf,

    /// Output file path (default: <PROJECT_PATH>/openapi.json; .yaml/.yml selects YAML)
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    pub output_path: Option<PathBuf>,

    /// Configuration file (TOML, or YAML by extension)
    #[arg(short = 'c', long = "config", value_name = "CONFIG")]
    pub config_path: Option<PathBuf>,

    /// Force this framework instead of auto-detecting (e.g. axum, express, fastapi, gin)
    #[arg(short = 'w', long = "framework", value_name = "FRAMEWORK")]
    pub framework: Option<String>,

    /// Keep operations from the previous document that are no longer found
    #[arg(long = "preserve-removed")]
    pub preserve_removed: bool,

    /// Maximum concurrent service calls
    #[arg(short = 'j', long = "jobs", value_name = "N")]
    pub jobs: Option<usize>,

    /// Enable verbose output
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl CliArgs {
    pub fn output(&self) -> PathBuf {
        self.output_path
            .clone()
            .unwrap_or_else(|| self.project_path.join("openapi.json"))
    }
}

/// Validate already-parsed arguments.
pub fn parse_args_from_parsed(args: CliArgs) -> Result<CliArgs> {
    debug!("Parsed arguments: {:?}", args);

    if !args.project_path.exists() {
        anyhow::bail!(
            "Project path does not exist: {}",
            args.project_path.display()
        );
    }
    if !args.project_path.is_dir() {
        anyhow::bail!(
            "Project path is not a directory: {}",
            args.project_path.display()
        );
    }
    if args.jobs == Some(0) {
        anyhow::bail!("--jobs must be at least 1");
    }

    info!("Project path: {}", args.project_path.display());
    info!("Output file: {}", args.output().display());
    match &args.framework {
        Some(framework) => info!("Framework: {}", framework),
        None => info!("Framework: auto-detect"),
    }
    Ok(args)
}

/// Configuration file (or defaults) with command-line overrides applied.
pub fn resolve_config(args: &CliArgs) -> Result<GeneratorConfig> {
    let mut config = match &args.config_path {
        Some(path) => load_config(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => GeneratorConfig::default(),
    };
    if let Some(framework) = &args.framework {
        config.framework = Some(framework.clone());
    }
    if args.preserve_removed {
        config.preserve_removed_endpoints = true;
    }
    if let Some(jobs) = args.jobs {
        config.concurrency_limit = jobs;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Run the main workflow
pub async fn run(args: CliArgs) -> Result<RunSummary> {
    let config = resolve_config(&args)?;
    let timeout = CallPolicy::from(&config.service).timeout;
    let completion = create_completion_service(&config.completion, timeout)
        .context("Failed to set up the completion service")?;
    let embedding = create_embedding_service(&config.embedding, timeout)
        .context("Failed to set up the embedding service")?;
    if !config.completion.is_enabled() {
        warn!("Completion service disabled: model passes will be skipped and endpoints degraded");
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            on_interrupt.cancel();
        }
    });

    let output = args.output();
    info!("Starting OpenAPI document generation...");
    let pipeline = Pipeline::new(config, completion, embedding, cancel);
    let summary = pipeline.run(&args.project_path, &output).await;

    for failure in &summary.failures {
        warn!("{}", failure);
    }
    for line in summary.to_string().lines() {
        info!("{}", line);
    }
    Ok(summary)
}
