//! OpenAPI Synth - OpenAPI 3.0 documents from polyglot source repositories.
//!
//! The library reads a repository (Rust, Python, JavaScript/TypeScript and Go),
//! finds the HTTP endpoints its web frameworks register, infers their
//! parameters, schemas and security, and produces a validated, deterministic
//! OpenAPI document that stays stable across runs.
//!
//! # Supported Frameworks
//!
//! Structural extraction: Axum, Actix-Web, Flask, FastAPI, Express, NestJS,
//! Gin, Echo, Chi and Fiber. Anything else a completion service can read is
//! handled by model extraction.
//!
//! # Architecture
//!
//! 1. [`scanner`] - walks the repository, honoring ignore globs
//! 2. [`parser`] - tree-sitter grammar adapters behind one query interface
//! 3. [`detector`] - signature rules plus model classification per file
//! 4. [`extractor`] - native route extractors, model extraction, deduplication
//! 5. [`context`] - embedded source chunks for retrieval
//! 6. [`enricher`] - model-inferred parameters, schemas, security and examples
//! 7. [`openapi_builder`] / [`schema_generator`] - the document, with hoisted components
//! 8. [`merger`] / [`validator`] - reconciliation with the previous run, structural gate
//! 9. [`serializer`] - atomic output
//!
//! [`pipeline`] runs these stages end to end; [`service`] holds the
//! completion and embedding clients and the gateway that bounds them.
//!
//! # Example Usage
//!
//! ```no_run
//! use openapi_synth::config::GeneratorConfig;
//! use openapi_synth::pipeline::Pipeline;
//! use openapi_synth::service::DisabledService;
//! use std::path::Path;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() {
//! let pipeline = Pipeline::new(
//!     GeneratorConfig::default(),
//!     Arc::new(DisabledService),
//!     Arc::new(DisabledService),
//!     CancellationToken::new(),
//! );
//! let summary = pipeline
//!     .run(Path::new("./my-project"), Path::new("./my-project/openapi.json"))
//!     .await;
//! println!("{}", summary);
//! # }
//! ```
//!
//! # Command-Line Interface
//!
//! For command-line usage, see the [`cli`] module.

pub mod chunking;
pub mod cli;
pub mod config;
pub mod context;
pub mod detector;
pub mod enricher;
pub mod error;
pub mod extractor;
pub mod merger;
pub mod openapi_builder;
pub mod parser;
pub mod pipeline;
pub mod prompts;
pub mod scanner;
pub mod schema_generator;
pub mod serializer;
pub mod service;
pub mod validator;
