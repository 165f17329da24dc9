//! Generator configuration, loaded from TOML or YAML. Every key is optional.

use crate::detector::FrameworkSignature;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Extra glob patterns to skip, on top of the built-in dependency and build directories.
    pub ignore_patterns: Vec<String>,
    /// Signatures appended to the built-in detection table.
    pub framework_signatures: Vec<FrameworkSignature>,
    /// Force this framework on every unit of a matching language.
    pub framework: Option<String>,
    pub max_context_chunks: usize,
    pub concurrency_limit: usize,
    pub preserve_removed_endpoints: bool,
    pub detection: DetectionConfig,
    pub chunking: ChunkingConfig,
    pub service: ServiceConfig,
    pub completion: CompletionConfig,
    pub embedding: EmbeddingConfig,
    pub info: InfoConfig,
    pub api_host: Option<String>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            ignore_patterns: Vec::new(),
            framework_signatures: Vec::new(),
            framework: None,
            max_context_chunks: 5,
            concurrency_limit: 4,
            preserve_removed_endpoints: false,
            detection: DetectionConfig::default(),
            chunking: ChunkingConfig::default(),
            service: ServiceConfig::default(),
            completion: CompletionConfig::default(),
            embedding: EmbeddingConfig::default(),
            info: InfoConfig::default(),
            api_host: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DetectionConfig {
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    #[serde(default = "default_tie_margin")]
    pub tie_margin: f32,
    #[serde(default = "default_native_first_confidence")]
    pub native_first_confidence: f32,
}

fn default_threshold() -> f32 {
    0.5
}
fn default_tie_margin() -> f32 {
    0.1
}
fn default_native_first_confidence() -> f32 {
    0.75
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            tie_margin: default_tie_margin(),
            native_first_confidence: default_native_first_confidence(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
}

fn default_max_chars() -> usize {
    1500
}
fn default_overlap_chars() -> usize {
    200
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            overlap_chars: default_overlap_chars(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Upper bound on prompt size sent to the completion service.
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
}

fn default_timeout_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_max_input_chars() -> usize {
    24_000
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            max_input_chars: default_max_input_chars(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompletionConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_completion_model")]
    pub model: String,
    #[serde(default = "default_completion_url")]
    pub url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_completion_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_completion_url() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_completion_model(),
            url: default_completion_url(),
            api_key_env: default_api_key_env(),
        }
    }
}

impl CompletionConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_embedding_url")]
    pub url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_embedding_url() -> String {
    "https://api.openai.com/v1/embeddings".to_string()
}
fn default_dims() -> usize {
    1536
}
fn default_batch_size() -> usize {
    64
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_embedding_model(),
            url: default_embedding_url(),
            api_key_env: default_api_key_env(),
            dims: default_dims(),
            batch_size: default_batch_size(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct InfoConfig {
    /// Defaults to the repository directory name when absent.
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl Default for InfoConfig {
    fn default() -> Self {
        Self {
            title: None,
            version: default_version(),
            description: None,
        }
    }
}

/// Load a configuration file. `.yaml`/`.yml` files are read as YAML,
/// everything else as TOML.
pub fn load_config(path: &Path) -> Result<GeneratorConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let config: GeneratorConfig = if is_yaml {
        serde_yaml::from_str(&content).context("Failed to parse YAML config file")?
    } else {
        toml::from_str(&content).context("Failed to parse TOML config file")?
    };

    config.validate()?;
    Ok(config)
}

impl GeneratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.concurrency_limit == 0 {
            anyhow::bail!("concurrency_limit must be > 0");
        }
        if self.chunking.max_chars == 0 {
            anyhow::bail!("chunking.max_chars must be > 0");
        }
        if self.chunking.overlap_chars >= self.chunking.max_chars {
            anyhow::bail!("chunking.overlap_chars must be < chunking.max_chars");
        }
        if self.embedding.batch_size == 0 {
            anyhow::bail!("embedding.batch_size must be > 0");
        }
        if self.service.max_input_chars < 1000 {
            anyhow::bail!("service.max_input_chars must be >= 1000");
        }
        if !(1..=3600).contains(&self.service.timeout_secs) {
            anyhow::bail!("service.timeout_secs must be within [1, 3600]");
        }
        if self.service.backoff_base_ms > 60_000 {
            anyhow::bail!("service.backoff_base_ms must be <= 60000");
        }
        for (name, value) in [
            ("detection.threshold", self.detection.threshold),
            ("detection.tie_margin", self.detection.tie_margin),
            (
                "detection.native_first_confidence",
                self.detection.native_first_confidence,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("{} must be within [0, 1]", name);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Language;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = GeneratorConfig::default();
        assert_eq!(config.max_context_chunks, 5);
        assert_eq!(config.concurrency_limit, 4);
        assert!(!config.preserve_removed_endpoints);
        assert_eq!(config.chunking.max_chars, 1500);
        assert_eq!(config.service.max_retries, 3);
        assert!(!config.completion.is_enabled());
        assert!(!config.embedding.is_enabled());
        assert_eq!(config.info.version, "1.0.0");
    }

    #[test]
    fn test_load_toml() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("openapi-synth.toml");
        fs::write(
            &path,
            r#"
ignore_patterns = ["**/fixtures/**"]
concurrency_limit = 8
preserve_removed_endpoints = true
api_host = "https://api.example.com"

[[framework_signatures]]
framework = "koa"
language = "javascript"
pattern = "require\\(['\"]koa['\"]\\)"
weight = 0.6

[detection]
threshold = 0.4

[completion]
provider = "openai"
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.ignore_patterns, vec!["**/fixtures/**"]);
        assert_eq!(config.concurrency_limit, 8);
        assert!(config.preserve_removed_endpoints);
        assert_eq!(config.framework_signatures.len(), 1);
        assert_eq!(config.framework_signatures[0].language, Language::JavaScript);
        assert_eq!(config.detection.threshold, 0.4);
        assert_eq!(config.detection.tie_margin, 0.1);
        assert!(config.completion.is_enabled());
        assert_eq!(config.completion.model, "gpt-4o-mini");
        assert_eq!(config.api_host.as_deref(), Some("https://api.example.com"));
    }

    #[test]
    fn test_load_yaml() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.yaml");
        fs::write(
            &path,
            "framework: express\nmax_context_chunks: 3\ninfo:\n  title: Blog API\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.framework.as_deref(), Some("express"));
        assert_eq!(config.max_context_chunks, 3);
        assert_eq!(config.info.title.as_deref(), Some("Blog API"));
        assert_eq!(config.info.version, "1.0.0");
    }

    #[test]
    fn test_rejects_invalid_values() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bad.toml");
        fs::write(&path, "concurrency_limit = 0\n").unwrap();
        assert!(load_config(&path).is_err());

        fs::write(&path, "[chunking]\nmax_chars = 100\noverlap_chars = 100\n").unwrap();
        assert!(load_config(&path).is_err());

        fs::write(&path, "[service]\nbackoff_base_ms = 120000\n").unwrap();
        assert!(load_config(&path).is_err());

        fs::write(&path, "[service]\ntimeout_secs = 0\n").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(load_config(Path::new("/nonexistent/config.toml")).is_err());
    }
}
