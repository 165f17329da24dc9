//! Semantic context index: source chunks that help describe an endpoint,
//! embedded once per run and retrieved by cosine similarity.
//!
//! Chunks come from the registry's `Definition` and `Comment` queries:
//! - type definitions (structs, classes, interfaces) are always indexed;
//! - functions and bindings only when their name marks them as a
//!   serializer or middleware;
//! - runs of adjacent comments long enough to carry documentation.
//!
//! Each definition is cut into line windows per [`ChunkingConfig`]. Chunks
//! keep a deterministic order (file, then line range) which also breaks
//! similarity ties.

use crate::chunking::line_windows;
use crate::config::ChunkingConfig;
use crate::error::{FailureKind, SoftFailure};
use crate::extractor::SourceLocation;
use crate::parser::{GrammarRegistry, LineRange, QueryKind, SourceUnit};
use crate::prompts;
use crate::service::ServiceGateway;
use log::{debug, info, warn};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::LazyLock;

static SERIALIZER_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(serializer|schema|dto|request|response|payload|input|output)").unwrap()
});

static MIDDLEWARE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(auth|middleware|guard|jwt|token|session|permission)").unwrap()
});

/// Comment blocks shorter than this are not worth indexing.
const MIN_COMMENT_CHARS: usize = 60;

/// Query used to find authentication code for every enrichment prompt.
const SECURITY_QUERY: &str =
    "authentication middleware: bearer token, JWT verification, API key header, session cookie, permission guard";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChunkKind {
    ModelDefinition,
    Serializer,
    Middleware,
    DocComment,
}

impl ChunkKind {
    fn for_definition(name: &str) -> Option<Self> {
        if MIDDLEWARE_NAME.is_match(name) {
            Some(ChunkKind::Middleware)
        } else if SERIALIZER_NAME.is_match(name) {
            Some(ChunkKind::Serializer)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextChunk {
    pub location: SourceLocation,
    pub text: String,
    /// `None` when embedding this chunk failed; such chunks are never retrieved.
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    pub kind: ChunkKind,
}

/// Per-run arena of context chunks.
#[derive(Debug, Default)]
pub struct ContextIndex {
    chunks: Vec<ContextChunk>,
}

impl ContextIndex {
    /// Index without chunks; every retrieval comes back empty.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_chunks(chunks: Vec<ContextChunk>) -> Self {
        Self { chunks }
    }

    pub fn chunks(&self) -> &[ContextChunk] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Number of chunks that have an embedding.
    pub fn embedded(&self) -> usize {
        self.chunks.iter().filter(|c| c.embedding.is_some()).count()
    }

    /// Discover chunks in `units` and embed them in batches. Failed batches
    /// and vectors of the wrong dimension leave those chunks unembedded.
    pub async fn build(
        units: &[SourceUnit],
        registry: &GrammarRegistry,
        chunking: &ChunkingConfig,
        batch_size: usize,
        gateway: &ServiceGateway,
    ) -> (Self, Vec<SoftFailure>) {
        let mut chunks = discover_chunks(units, registry, chunking);
        let mut failures = Vec::new();
        if chunks.is_empty() {
            return (Self::from_chunks(chunks), failures);
        }

        let max_chars = gateway.policy().max_input_chars;
        let texts: Vec<String> = chunks
            .iter()
            .map(|c| prompts::truncate_chars(&c.text, max_chars).to_string())
            .collect();
        let batches: Vec<&[String]> = texts.chunks(batch_size.max(1)).collect();
        let replies = futures::future::join_all(batches.iter().map(|b| gateway.embed(b))).await;

        let dims = gateway.embedding_dims();
        let mut wrong_dims = 0;
        for (i, (batch, reply)) in batches.iter().zip(replies).enumerate() {
            let offset = i * batch_size.max(1);
            match reply {
                Ok(vectors) => {
                    for (j, vector) in vectors.into_iter().enumerate() {
                        if vector.len() == dims {
                            chunks[offset + j].embedding = Some(vector);
                        } else {
                            wrong_dims += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!("Embedding batch {} failed: {}", i, e);
                    failures.push(SoftFailure::new(
                        format!("context chunks {}-{}", offset, offset + batch.len() - 1),
                        FailureKind::ServiceUnavailable,
                        e.to_string(),
                    ));
                }
            }
        }
        if wrong_dims > 0 {
            failures.push(SoftFailure::new(
                "context chunks",
                FailureKind::ServiceUnavailable,
                format!("{} embeddings did not have {} dimensions", wrong_dims, dims),
            ));
        }

        let index = Self::from_chunks(chunks);
        info!(
            "Context index: {} chunks, {} embedded",
            index.len(),
            index.embedded()
        );
        (index, failures)
    }

    /// The `k` chunks closest to `query`. Returns nothing when the query
    /// cannot be embedded.
    pub async fn retrieve(
        &self,
        query: &str,
        k: usize,
        gateway: &ServiceGateway,
    ) -> Vec<&ContextChunk> {
        if k == 0 || self.embedded() == 0 {
            return Vec::new();
        }
        match embed_query(query, gateway).await {
            Some(vector) => self.nearest(&vector, k, |_| true),
            None => Vec::new(),
        }
    }

    /// Middleware chunks relevant to authentication. Without a usable query
    /// embedding the first `k` middleware chunks are returned in index order.
    pub async fn security_context(&self, k: usize, gateway: &ServiceGateway) -> Vec<&ContextChunk> {
        let is_middleware = |c: &ContextChunk| c.kind == ChunkKind::Middleware;
        if k == 0 {
            return Vec::new();
        }
        if self.embedded() > 0 {
            if let Some(vector) = embed_query(SECURITY_QUERY, gateway).await {
                return self.nearest(&vector, k, is_middleware);
            }
        }
        self.chunks
            .iter()
            .filter(|c| c.kind == ChunkKind::Middleware)
            .take(k)
            .collect()
    }

    /// The `k` embedded chunks passing `filter` with the highest cosine
    /// similarity to `query`. Ties keep index order.
    pub fn nearest(
        &self,
        query: &[f32],
        k: usize,
        filter: impl Fn(&ContextChunk) -> bool,
    ) -> Vec<&ContextChunk> {
        let mut scored: Vec<(usize, f32)> = self
            .chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| filter(c))
            .filter_map(|(i, c)| {
                c.embedding
                    .as_deref()
                    .map(|e| (i, cosine_similarity(query, e)))
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored
            .into_iter()
            .take(k)
            .map(|(i, _)| &self.chunks[i])
            .collect()
    }
}

async fn embed_query(query: &str, gateway: &ServiceGateway) -> Option<Vec<f32>> {
    let text = prompts::truncate_chars(query, gateway.policy().max_input_chars).to_string();
    match gateway.embed(&[text]).await {
        Ok(mut vectors) => vectors
            .pop()
            .filter(|v| v.len() == gateway.embedding_dims()),
        Err(e) => {
            debug!("Query embedding failed: {}", e);
            None
        }
    }
}

/// Cosine similarity of two vectors; 0 for mismatched lengths or zero norms.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Find and window every context chunk in `units`, ordered by file then lines.
pub fn discover_chunks(
    units: &[SourceUnit],
    registry: &GrammarRegistry,
    chunking: &ChunkingConfig,
) -> Vec<ContextChunk> {
    let mut spans: BTreeMap<(std::path::PathBuf, LineRange), ChunkKind> = BTreeMap::new();

    for unit in units {
        for m in registry.query(unit, QueryKind::Definition) {
            let Some(name) = m.text("name") else {
                continue;
            };
            let (span, kind) = if let Some(ty) = m.get("type") {
                (ty.lines, ChunkKind::for_definition(name).unwrap_or(ChunkKind::ModelDefinition))
            } else if let Some(span) = m.get("function").or_else(|| m.get("binding")) {
                match ChunkKind::for_definition(name) {
                    Some(kind) => (span.lines, kind),
                    None => continue,
                }
            } else {
                continue;
            };
            spans.entry((unit.path.clone(), span)).or_insert(kind);
        }

        for block in comment_blocks(unit, registry) {
            spans
                .entry((unit.path.clone(), block))
                .or_insert(ChunkKind::DocComment);
        }
    }

    let by_path: BTreeMap<&std::path::Path, &SourceUnit> =
        units.iter().map(|u| (u.path.as_path(), u)).collect();

    let mut chunks = Vec::new();
    for ((path, span), kind) in spans {
        let Some(unit) = by_path.get(path.as_path()) else {
            continue;
        };
        let text = unit.lines(span);
        for window in line_windows(&text, span.start, chunking.max_chars, chunking.overlap_chars) {
            if window.text.trim().is_empty() {
                continue;
            }
            chunks.push(ContextChunk {
                location: SourceLocation {
                    file: path.clone(),
                    lines: window.lines,
                },
                text: window.text,
                embedding: None,
                kind,
            });
        }
    }
    debug!("Discovered {} context chunks", chunks.len());
    chunks
}

/// Line ranges of adjacent comment runs with enough text to be documentation.
fn comment_blocks(unit: &SourceUnit, registry: &GrammarRegistry) -> Vec<LineRange> {
    let mut comments: Vec<(LineRange, usize)> = registry
        .query(unit, QueryKind::Comment)
        .iter()
        .filter_map(|m| m.get("comment").map(|c| (c.lines, c.text.trim().len())))
        .collect();
    comments.sort();

    let mut blocks: Vec<(LineRange, usize)> = Vec::new();
    for (lines, size) in comments {
        match blocks.last_mut() {
            Some((block, total)) if lines.start <= block.end + 1 => {
                block.end = block.end.max(lines.end);
                *total += size;
            }
            _ => blocks.push((lines, size)),
        }
    }
    blocks
        .into_iter()
        .filter(|(_, size)| *size >= MIN_COMMENT_CHARS)
        .map(|(lines, _)| lines)
        .collect()
}
