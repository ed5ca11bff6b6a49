//! Backend-polymorphic index storage.
//!
//! Two structurally different engines sit behind one contract:
//!
//! | Backend | Type | Addressing |
//! |---------|------|------------|
//! | embedded | [`sqlite::SqliteBackend`] | `<store.dir>/<collection>.db`, one vector table + `metadata` |
//! | remote | [`qdrant::QdrantBackend`] | one named Qdrant collection; bookkeeping points flagged `is_metadata` |
//!
//! Backends implement the raw [`StoreBackend`] trait and may fail freely.
//! [`IndexStore`] wraps the selected backend and adds the behavior both must
//! share:
//!
//! - insert-vs-update is decided by an existence + hash check before any
//!   write, so a changed chunk is updated in place and an unchanged one is
//!   left alone, whatever the backend's native duplicate-key semantics;
//! - every mutating or lookup operation swallows backend errors, logs them,
//!   and returns a neutral default so one failed write never aborts a run;
//! - obsolescence deletion is scoped by url prefix, and by [`PathScope`] for
//!   file-backed sources.

pub mod qdrant;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;

use crate::config::{BackendKind, StoreConfig};
use crate::models::{Chunk, SearchHit, StoredChunk, VectorRecord};

/// Raw storage operations implemented by each backend.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Create the vector table/collection and bookkeeping storage if absent.
    async fn init_schema(&self) -> Result<()>;

    /// Stored hash of the chunk with this id, if present.
    async fn chunk_hash(&self, chunk_id: &str) -> Result<Option<String>>;

    async fn insert_chunk(&self, record: &VectorRecord) -> Result<()>;

    /// Overwrite the record whose `chunk_id` matches.
    async fn update_chunk(&self, record: &VectorRecord) -> Result<()>;

    /// Hashes of every content record stored under `url`, in any order.
    async fn hashes_for_url(&self, url: &str) -> Result<Vec<String>>;

    /// Distinct urls of content records starting with `prefix`.
    async fn urls_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Delete every content record stored under one of `urls`.
    async fn delete_urls(&self, urls: &[String]) -> Result<usize>;

    async fn get_metadata(&self, key: &str) -> Result<Option<String>>;

    async fn set_metadata(&self, key: &str, value: &str) -> Result<()>;

    /// Nearest content records to `vector`, closest first.
    async fn search(&self, vector: &[f32], limit: usize, repo: Option<&str>)
        -> Result<Vec<SearchHit>>;

    /// Every content record stored under `url`, in any order.
    async fn document_chunks(&self, url: &str) -> Result<Vec<StoredChunk>>;

    async fn close(&self);
}

/// Result of [`IndexStore::upsert_chunk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
    Failed,
}

/// Tolerant facade over the configured [`StoreBackend`].
pub struct IndexStore {
    backend: Box<dyn StoreBackend>,
}

impl IndexStore {
    pub fn new(backend: Box<dyn StoreBackend>) -> Self {
        Self { backend }
    }

    /// Open (creating if needed) the store for `collection`.
    pub async fn open(config: &StoreConfig, collection: &str, dims: usize) -> Result<Self> {
        let backend: Box<dyn StoreBackend> = match config.backend {
            BackendKind::Sqlite => Box::new(
                sqlite::SqliteBackend::open(&config.dir, collection, &config.table, true).await?,
            ),
            BackendKind::Qdrant => {
                Box::new(qdrant::QdrantBackend::new(&config.qdrant, collection, dims)?)
            }
        };
        Ok(Self::new(backend))
    }

    /// Open the store for `collection` without creating it.
    ///
    /// Fails when the collection has never been indexed.
    pub async fn open_existing(config: &StoreConfig, collection: &str, dims: usize) -> Result<Self> {
        let backend: Box<dyn StoreBackend> = match config.backend {
            BackendKind::Sqlite => Box::new(
                sqlite::SqliteBackend::open(&config.dir, collection, &config.table, false).await?,
            ),
            BackendKind::Qdrant => {
                let backend = qdrant::QdrantBackend::new(&config.qdrant, collection, dims)?;
                backend.ensure_exists().await?;
                Box::new(backend)
            }
        };
        Ok(Self::new(backend))
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Idempotent; safe to call any number of times.
    pub async fn init_schema(&self) -> Result<()> {
        self.backend.init_schema().await
    }

    /// Insert or update the chunk keyed by its `chunk_id`.
    ///
    /// An existing record with the same hash is left untouched.
    pub async fn upsert_chunk(&self, chunk: &Chunk, embedding: &[f32], hash: &str) -> UpsertOutcome {
        let chunk_id = chunk.metadata.chunk_id.as_str();
        let record = VectorRecord::from_chunk(chunk, embedding, hash);

        let existing = match self.backend.chunk_hash(chunk_id).await {
            Ok(existing) => existing,
            Err(e) => {
                tracing::warn!(chunk_id, url = %record.url, error = %e, "hash lookup failed; skipping upsert");
                return UpsertOutcome::Failed;
            }
        };

        let (result, outcome) = match existing {
            Some(stored) if stored == hash => return UpsertOutcome::Unchanged,
            Some(_) => (self.backend.update_chunk(&record).await, UpsertOutcome::Updated),
            None => (self.backend.insert_chunk(&record).await, UpsertOutcome::Inserted),
        };

        match result {
            Ok(()) => outcome,
            Err(e) => {
                tracing::warn!(chunk_id, url = %record.url, error = %e, "upsert failed");
                UpsertOutcome::Failed
            }
        }
    }

    /// Stored hash for `chunk_id`; `None` when absent or on failure.
    pub async fn chunk_hash(&self, chunk_id: &str) -> Option<String> {
        match self.backend.chunk_hash(chunk_id).await {
            Ok(hash) => hash,
            Err(e) => {
                tracing::warn!(chunk_id, error = %e, "hash lookup failed");
                None
            }
        }
    }

    /// Sorted hashes of all chunks stored under `url`, duplicates kept.
    pub async fn get_hashes_for_url(&self, url: &str) -> Vec<String> {
        match self.backend.hashes_for_url(url).await {
            Ok(mut hashes) => {
                hashes.sort();
                hashes
            }
            Err(e) => {
                tracing::warn!(url, error = %e, "hash listing failed");
                Vec::new()
            }
        }
    }

    pub async fn delete_by_url(&self, url: &str) -> usize {
        match self.backend.delete_urls(&[url.to_string()]).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(url, error = %e, "delete by url failed");
                0
            }
        }
    }

    /// Delete records whose url starts with `scope_prefix` and is not in
    /// `visited`. Bookkeeping entries are never candidates.
    ///
    /// An empty prefix would cover the whole collection and is refused.
    pub async fn delete_obsolete(&self, visited: &HashSet<String>, scope_prefix: &str) -> usize {
        if scope_prefix.is_empty() {
            tracing::warn!("refusing obsolescence deletion without a scope prefix");
            return 0;
        }

        let stored = match self.backend.urls_with_prefix(scope_prefix).await {
            Ok(urls) => urls,
            Err(e) => {
                tracing::warn!(scope = scope_prefix, error = %e, "listing urls for obsolescence failed");
                return 0;
            }
        };

        let stale: Vec<String> = stored
            .into_iter()
            .filter(|url| url.starts_with(scope_prefix) && !visited.contains(url))
            .collect();
        if stale.is_empty() {
            return 0;
        }

        match self.backend.delete_urls(&stale).await {
            Ok(n) => {
                tracing::info!(scope = scope_prefix, urls = stale.len(), records = n, "deleted obsolete records");
                n
            }
            Err(e) => {
                tracing::warn!(scope = scope_prefix, error = %e, "obsolescence deletion failed");
                0
            }
        }
    }

    /// [`delete_obsolete`](Self::delete_obsolete) keyed by local file paths.
    ///
    /// `processed` holds the paths produced by this pass; each is mapped to
    /// its stored url through `scope` before comparison.
    pub async fn delete_obsolete_files(&self, processed: &HashSet<String>, scope: &PathScope) -> usize {
        let visited: HashSet<String> = processed.iter().filter_map(|p| scope.url_for(p)).collect();
        self.delete_obsolete(&visited, &scope.url_prefix()).await
    }

    pub async fn get_metadata(&self, key: &str, default: &str) -> String {
        match self.backend.get_metadata(key).await {
            Ok(Some(value)) => value,
            Ok(None) => default.to_string(),
            Err(e) => {
                tracing::warn!(key, error = %e, "metadata read failed");
                default.to_string()
            }
        }
    }

    pub async fn set_metadata(&self, key: &str, value: &str) -> bool {
        match self.backend.set_metadata(key, value).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(key, error = %e, "metadata write failed");
                false
            }
        }
    }

    pub async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        repo: Option<&str>,
    ) -> Result<Vec<SearchHit>> {
        self.backend.search(vector, limit, repo).await
    }

    /// All chunks of one document, ascending by `chunk_index`.
    pub async fn document_chunks(&self, url: &str) -> Result<Vec<StoredChunk>> {
        let mut chunks = self.backend.document_chunks(url).await?;
        chunks.sort_by_key(|c| c.chunk_index);
        Ok(chunks)
    }

    pub async fn close(&self) {
        self.backend.close().await;
    }
}

/// Maps local file paths under a root to the urls stored for them.
///
/// Two addressing modes:
/// - direct: the stored url is the normalized path itself;
/// - rewritten: the path below `root` is appended to an external prefix.
///
/// A leading `./` and trailing `/` are stripped from the root, and a
/// trailing `/` from the prefix, so matching happens on exact boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathScope {
    root: String,
    rewrite_prefix: Option<String>,
}

impl PathScope {
    pub fn new(root: &str, rewrite_prefix: Option<&str>) -> Self {
        Self {
            root: normalize_path(root),
            rewrite_prefix: rewrite_prefix
                .map(|p| p.trim_end_matches('/').to_string())
                .filter(|p| !p.is_empty()),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Prefix shared by every url inside this scope, ending in `/`.
    pub fn url_prefix(&self) -> String {
        match (&self.rewrite_prefix, self.root.is_empty()) {
            (Some(prefix), _) => format!("{}/", prefix),
            (None, true) => String::new(),
            (None, false) => format!("{}/", self.root),
        }
    }

    /// Path of `path` relative to the root, if it lies inside it.
    pub fn relative<'a>(&self, path: &'a str) -> Option<&'a str> {
        let path = path.strip_prefix("./").unwrap_or(path);
        if self.root.is_empty() {
            return Some(path);
        }
        path.strip_prefix(self.root.as_str())?
            .strip_prefix('/')
            .filter(|rest| !rest.is_empty())
    }

    /// Stored url for a local path.
    pub fn url_for(&self, path: &str) -> Option<String> {
        let relative = self.relative(path)?;
        Some(format!("{}{}", self.url_prefix(), relative))
    }
}

fn normalize_path(path: &str) -> String {
    let mut p = path.trim();
    while let Some(rest) = p.strip_prefix("./") {
        p = rest;
    }
    let p = p.trim_end_matches('/');
    if p == "." {
        String::new()
    } else if p.is_empty() && path.starts_with('/') {
        "/".to_string()
    } else {
        p.to_string()
    }
}
