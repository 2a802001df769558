//! TOML configuration.
//!
//! Every section is optional: a missing file or an empty file yields a
//! working configuration that stores the archive under `./notion_archive_db`,
//! uses keyword search, and points deep research at the OpenAI API.
//!
//! ```toml
//! [db]
//! path = "./notion_archive_db/archive.sqlite"
//!
//! [chunking]
//! max_tokens = 300
//! overlap_tokens = 40
//!
//! [embedding]
//! provider = "local"
//! model = "all-minilm-l6-v2"
//!
//! [research]
//! model = "o4-mini-deep-research-2025-06-26"
//! top_k = 10
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable consulted for the config path when `--config` is absent.
pub const CONFIG_ENV: &str = "NOTION_ARCHIVE_CONFIG";

/// Config file picked up from the working directory when present.
pub const DEFAULT_CONFIG_FILE: &str = "notion-archive.toml";

/// Default deep-research model.
pub const DEFAULT_RESEARCH_MODEL: &str = "o4-mini-deep-research-2025-06-26";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub research: ResearchConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./notion_archive_db/archive.sqlite"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default)]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: 0,
        }
    }
}

fn default_max_tokens() -> usize {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k: i64,
    #[serde(default = "default_limit")]
    pub default_limit: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            hybrid_alpha: default_hybrid_alpha(),
            candidate_k: default_candidate_k(),
            default_limit: default_limit(),
        }
    }
}

fn default_hybrid_alpha() -> f64 {
    0.6
}
fn default_candidate_k() -> i64 {
    80
}
fn default_limit() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    /// Point embeddings at `model`, picking the provider that serves it.
    ///
    /// `text-embedding-*` names go to the OpenAI provider with their known
    /// dimensionality; anything else is treated as a local fastembed model.
    pub fn select_model(&mut self, model: &str) {
        self.model = Some(model.to_string());
        if model.starts_with("text-embedding-") {
            self.provider = "openai".to_string();
            self.dims = Some(openai_model_dims(model));
        } else if self.provider != "local" {
            self.provider = "local".to_string();
            self.dims = None;
        }
    }
}

fn openai_model_dims(model: &str) -> usize {
    match model {
        "text-embedding-3-large" => 3072,
        _ => 1536,
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResearchConfig {
    #[serde(default = "default_research_model")]
    pub model: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            model: default_research_model(),
            top_k: default_top_k(),
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
        }
    }
}

fn default_research_model() -> String {
    DEFAULT_RESEARCH_MODEL.to_string()
}
fn default_top_k() -> usize {
    10
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:5000".to_string()
}

/// Resolve which config file to read, if any.
///
/// An explicit path wins, then [`CONFIG_ENV`], then [`DEFAULT_CONFIG_FILE`]
/// in the working directory. `None` means "use defaults".
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    let local = PathBuf::from(DEFAULT_CONFIG_FILE);
    local.exists().then_some(local)
}

/// Load configuration from `path`, or defaults when `path` is `None`.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            parse_config(&content)?
        }
        None => Config::default(),
    };
    validate(&config)?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).with_context(|| "Failed to parse config file")
}

pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        bail!("chunking.overlap_tokens must be smaller than chunking.max_tokens");
    }

    if !(0.0..=1.0).contains(&config.retrieval.hybrid_alpha) {
        bail!("retrieval.hybrid_alpha must be in [0.0, 1.0]");
    }
    if config.retrieval.default_limit == 0 {
        bail!("retrieval.default_limit must be >= 1");
    }

    if config.research.top_k == 0 {
        bail!("research.top_k must be >= 1");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "local" => {}
        "openai" => {
            if config.embedding.model.is_none() {
                bail!("embedding.model must be specified when provider is 'openai'");
            }
            if matches!(config.embedding.dims, None | Some(0)) {
                bail!("embedding.dims must be > 0 when provider is 'openai'");
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or local.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let cfg = parse_config("").unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.chunking.max_tokens, 300);
        assert_eq!(cfg.research.top_k, 10);
        assert_eq!(cfg.research.model, DEFAULT_RESEARCH_MODEL);
        assert_eq!(cfg.research.api_key_env, "OPENAI_API_KEY");
        assert!(!cfg.embedding.is_enabled());
    }

    #[test]
    fn test_partial_sections() {
        let cfg = parse_config(
            r#"
[db]
path = "/tmp/a.sqlite"

[research]
top_k = 4
"#,
        )
        .unwrap();
        assert_eq!(cfg.db.path, PathBuf::from("/tmp/a.sqlite"));
        assert_eq!(cfg.research.top_k, 4);
        assert_eq!(cfg.research.base_url, "https://api.openai.com/v1");
    }

    #[test]
    fn test_rejects_zero_top_k() {
        let cfg = parse_config("[research]\ntop_k = 0\n").unwrap();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn test_rejects_overlap_not_below_max() {
        let cfg = parse_config("[chunking]\nmax_tokens = 10\noverlap_tokens = 10\n").unwrap();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn test_openai_embedding_requires_model_and_dims() {
        let cfg = parse_config("[embedding]\nprovider = \"openai\"\n").unwrap();
        let err = validate(&cfg).unwrap_err().to_string();
        assert!(err.contains("embedding.model"));
    }

    #[test]
    fn test_unknown_provider() {
        let cfg = parse_config("[embedding]\nprovider = \"magic\"\n").unwrap();
        let err = validate(&cfg).unwrap_err().to_string();
        assert!(err.contains("Unknown embedding provider"));
    }

    #[test]
    fn test_select_model_routes_openai_names() {
        let mut cfg = Config::default();
        cfg.embedding.select_model("text-embedding-3-large");
        assert_eq!(cfg.embedding.provider, "openai");
        assert_eq!(cfg.embedding.model.as_deref(), Some("text-embedding-3-large"));
        assert_eq!(cfg.embedding.dims, Some(3072));
        validate(&cfg).unwrap();

        cfg.embedding.select_model("text-embedding-3-small");
        assert_eq!(cfg.embedding.dims, Some(1536));
    }

    #[test]
    fn test_select_model_routes_other_names_to_local() {
        let mut cfg = Config::default();
        cfg.embedding.select_model("all-minilm-l6-v2");
        assert_eq!(cfg.embedding.provider, "local");
        assert_eq!(cfg.embedding.dims, None);
        validate(&cfg).unwrap();

        let mut cfg = parse_config(
            "[embedding]\nprovider = \"openai\"\nmodel = \"text-embedding-3-small\"\ndims = 1536\n",
        )
        .unwrap();
        cfg.embedding.select_model("bge-small-en-v1.5");
        assert_eq!(cfg.embedding.provider, "local");
        assert_eq!(cfg.embedding.dims, None);
    }

    #[test]
    fn test_explicit_path_wins() {
        let p = Path::new("/some/where.toml");
        assert_eq!(resolve_config_path(Some(p)), Some(p.to_path_buf()));
    }
}
