//! TOML configuration parsing and validation.
//!
//! ```toml
//! [store]
//! backend = "sqlite"          # or "qdrant"
//! dir = "./data"
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-large"
//!
//! [chunking]
//! max_tokens = 700
//!
//! [retrieval]
//! final_limit = 10
//!
//! [server]
//! bind = "127.0.0.1:7331"
//!
//! [[sources]]
//! name = "docs"
//! kind = "directory"
//! product_name = "acme"
//! version = "2.0"
//! root = "./docs"
//! url_prefix = "https://docs.acme.dev"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::hash::collection_name;

/// Default embedding dimensionality.
pub const DEFAULT_DIMS: usize = 3072;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub store: StoreConfig,
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Sqlite,
    Qdrant,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Sqlite => write!(f, "sqlite"),
            BackendKind::Qdrant => write!(f, "qdrant"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub backend: BackendKind,
    #[serde(default = "default_store_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default)]
    pub qdrant: QdrantConfig,
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_table() -> String {
    "vectors".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct QdrantConfig {
    #[serde(default = "default_qdrant_url")]
    pub url: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_scroll_page_size")]
    pub scroll_page_size: usize,
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self {
            url: default_qdrant_url(),
            api_key_env: None,
            timeout_secs: default_timeout_secs(),
            scroll_page_size: default_scroll_page_size(),
        }
    }
}

fn default_qdrant_url() -> String {
    "http://localhost:6333".to_string()
}
fn default_scroll_page_size() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    pub max_tokens: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_final_limit")]
    pub final_limit: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            final_limit: default_final_limit(),
        }
    }
}

fn default_final_limit() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: default_dims(),
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_chars: default_max_chars(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_dims() -> usize {
    DEFAULT_DIMS
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_chars() -> usize {
    30_000
}
fn default_timeout_secs() -> u64 {
    30
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
    "127.0.0.1:7331".to_string()
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Directory,
    Git,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub name: String,
    pub kind: SourceKind,
    #[serde(default)]
    pub product_name: String,
    #[serde(default)]
    pub version: String,
    /// Explicit collection; overrides the product/version derived name.
    #[serde(default)]
    pub collection: Option<String>,
    /// Directory to scan. For git sources, relative to the clone.
    #[serde(default = "default_root")]
    pub root: String,
    /// External url prefix that replaces the local root in stored urls.
    #[serde(default)]
    pub url_prefix: Option<String>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// Remote url or local path of the repository (git only).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Repository identifier used in metadata and watermark keys.
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub shallow: bool,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

fn default_root() -> String {
    ".".to_string()
}
fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}
fn default_branch() -> String {
    "main".to_string()
}

impl SourceConfig {
    /// Collection this source writes to, if it can be resolved.
    pub fn collection(&self) -> Option<String> {
        resolve_collection(
            self.collection.as_deref(),
            Some(&self.product_name),
            Some(&self.version),
        )
    }

    /// Identifier used for watermark keys: the repo, else the source name.
    pub fn repo_key(&self) -> &str {
        self.repo.as_deref().unwrap_or(&self.name)
    }
}

/// Resolve a collection from an explicit name or a product + version pair.
pub fn resolve_collection(
    explicit: Option<&str>,
    product_name: Option<&str>,
    version: Option<&str>,
) -> Option<String> {
    if let Some(name) = explicit.map(str::trim).filter(|s| !s.is_empty()) {
        return Some(name.to_string());
    }
    match (
        product_name.map(str::trim).filter(|s| !s.is_empty()),
        version.map(str::trim).filter(|s| !s.is_empty()),
    ) {
        (Some(product), Some(version)) => Some(collection_name(product, version)),
        _ => None,
    }
}

/// Read, parse and validate a configuration file.
///
/// Every failure is an [`Error::Configuration`].
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
    parse_config(&content).with_context(|| format!("invalid config file {}", path.display()))
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config =
        toml::from_str(content).map_err(|e| Error::config(format!("failed to parse: {}", e)))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<(), Error> {
    if config.chunking.max_tokens == 0 {
        return Err(Error::config("chunking.max_tokens must be > 0"));
    }
    if config.retrieval.final_limit < 1 {
        return Err(Error::config("retrieval.final_limit must be >= 1"));
    }
    if config.store.table.trim().is_empty()
        || !config
            .store
            .table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(Error::config(
            "store.table must be a non-empty identifier of [A-Za-z0-9_]",
        ));
    }

    let emb = &config.embedding;
    match emb.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => {
            return Err(Error::config(format!(
                "unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
                other
            )))
        }
    }
    if emb.is_enabled() {
        if emb.dims == 0 {
            return Err(Error::config("embedding.dims must be > 0"));
        }
        if emb.model.is_none() {
            return Err(Error::config(format!(
                "embedding.model must be specified when provider is '{}'",
                emb.provider
            )));
        }
        if emb.batch_size == 0 || emb.max_chars == 0 || emb.max_retries == 0 {
            return Err(Error::config(
                "embedding.batch_size, max_chars and max_retries must be > 0",
            ));
        }
    }

    let mut names = HashSet::new();
    for source in &config.sources {
        if !names.insert(source.name.as_str()) {
            return Err(Error::config(format!(
                "duplicate source name '{}'",
                source.name
            )));
        }
        if source.collection().is_none() {
            return Err(Error::config(format!(
                "source '{}' needs either collection or both product_name and version",
                source.name
            )));
        }
        if source.kind == SourceKind::Git && source.url.is_none() {
            return Err(Error::config(format!(
                "git source '{}' requires url",
                source.name
            )));
        }
    }

    Ok(())
}
