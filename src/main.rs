//! OpenAPI Synth - command-line tool for generating an OpenAPI document from source.
//!
//! # Usage
//!
//! ```bash
//! openapi-synth [OPTIONS] <PROJECT_PATH>
//! ```
//!
//! # Examples
//!
//! Offline run, native extraction only:
//! ```bash
//! openapi-synth ./my-api-project
//! ```
//!
//! With a configuration enabling the model passes, keeping removed endpoints:
//! ```bash
//! openapi-synth ./my-api-project -c synth.toml --preserve-removed -o docs/openapi.json
//! ```

use anyhow::Result;
use clap::Parser;
use log::info;
use openapi_synth::cli;
use openapi_synth::pipeline::RunStatus;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::CliArgs::parse();

    let log_level = if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    info!("OpenAPI Synth starting...");

    let args = cli::parse_args_from_parsed(args)?;
    let summary = cli::run(args).await?;

    match summary.status {
        RunStatus::Succeeded => {
            info!("OpenAPI document generation completed successfully");
            Ok(())
        }
        RunStatus::Failed(reason) => anyhow::bail!("OpenAPI document generation failed: {}", reason),
    }
}
