//! Sync pipeline orchestration.
//!
//! Coordinates, per source: content provider → per-chunk change detection →
//! embedding → [`IndexStore`] upsert → obsolescence deletion → watermarks.
//!
//! # Modes
//!
//! - **Full**: every document is scanned. Afterwards, records inside the
//!   provider's scope that were not produced by this pass are deleted.
//! - **Incremental**: for versioned sources with a recorded commit, only
//!   paths reported by the diff are scanned; deleted and renamed-away paths
//!   have their records removed explicitly. A missing commit, a failed
//!   diff, or an empty diff falls back to a full pass.
//!
//! # Guarantees
//!
//! - Unchanged chunks never reach the embedding provider.
//! - Writes happen one chunk at a time, each confirmed before the next.
//! - Watermarks are written only after every index mutation of the pass,
//!   and only when no chunk failed, so an interrupted or partial run is
//!   reprocessed from the previous baseline next time.
//! - A failing source is logged and skipped; the rest of the run proceeds.

use anyhow::Result;
use std::collections::HashSet;

use crate::config::{Config, SourceConfig, SourceKind};
use crate::connector_fs::DirectoryProvider;
use crate::connector_git::GitProvider;
use crate::diff::{parse_name_status, DiffChanges};
use crate::embedding::EmbeddingClient;
use crate::error::Error;
use crate::hash::{last_run_key, last_sha_key};
use crate::models::SourceDocument;
use crate::store::{IndexStore, UpsertOutcome};
use crate::traits::{ContentProvider, ObsolescenceScope};

/// How a pass selects its documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMode {
    Full,
    Incremental { since: String, changes: DiffChanges },
}

/// Counters for one source pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub incremental: bool,
    /// Documents produced by the provider.
    pub documents: usize,
    /// Chunks whose stored hash already matched.
    pub unchanged: usize,
    /// Chunks embedded and written.
    pub embedded: usize,
    /// Chunks that could not be embedded or written.
    pub failed: usize,
    /// Records removed (shrunk documents, deletions, obsolescence).
    pub deleted: usize,
    /// Whether watermarks were advanced.
    pub watermarked: bool,
}

pub struct SyncEngine<'a> {
    store: &'a IndexStore,
    embedder: &'a EmbeddingClient,
}

impl<'a> SyncEngine<'a> {
    pub fn new(store: &'a IndexStore, embedder: &'a EmbeddingClient) -> Self {
        Self { store, embedder }
    }

    /// Run one pass for `provider`. `repo_key` names its watermarks.
    pub async fn sync(
        &self,
        provider: &dyn ContentProvider,
        repo_key: &str,
        force_full: bool,
    ) -> Result<SyncStats> {
        provider.prepare().await?;

        let mode = if force_full {
            SyncMode::Full
        } else {
            self.plan(provider, repo_key).await
        };

        let mut stats = SyncStats::default();
        let scope = provider.scope();

        match mode {
            SyncMode::Full => {
                let docs = provider.scan(None).await?;
                self.process_documents(&docs, &mut stats).await;
                stats.deleted += self.delete_obsolete(&docs, &scope).await;
            }
            SyncMode::Incremental { since, changes } => {
                tracing::info!(
                    source = provider.name(),
                    since = %since,
                    changed = changes.changed_files.len(),
                    deleted = changes.deleted_paths.len(),
                    "incremental pass"
                );
                stats.incremental = true;
                let docs = provider.scan(Some(&changes.changed_files)).await?;
                self.process_documents(&docs, &mut stats).await;
                stats.deleted += self.delete_paths(provider, &changes.deleted_paths, &scope).await;
            }
        }

        if stats.failed == 0 {
            stats.watermarked = self.advance_watermarks(provider, repo_key).await;
        } else {
            tracing::warn!(
                source = provider.name(),
                failed = stats.failed,
                "pass had failures; watermarks left unchanged"
            );
        }

        Ok(stats)
    }

    /// Decide between an incremental and a full pass.
    pub async fn plan(&self, provider: &dyn ContentProvider, repo_key: &str) -> SyncMode {
        let Some(diff) = provider.diff_provider() else {
            return SyncMode::Full;
        };

        let since = self
            .store
            .get_metadata(&last_sha_key(repo_key, diff.branch()), "")
            .await;
        if since.is_empty() {
            tracing::info!(source = provider.name(), "no recorded commit; full pass");
            return SyncMode::Full;
        }

        let raw = match diff.diff_since(&since).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(source = provider.name(), since = %since, error = %e, "diff failed; full pass");
                return SyncMode::Full;
            }
        };

        let changes = parse_name_status(&raw, diff.repo_root());
        if changes.is_empty() {
            tracing::info!(source = provider.name(), "empty diff; full pass");
            return SyncMode::Full;
        }
        SyncMode::Incremental { since, changes }
    }

    async fn process_documents(&self, docs: &[SourceDocument], stats: &mut SyncStats) {
        for doc in docs {
            stats.documents += 1;
            self.process_document(doc, stats).await;
        }
    }

    async fn process_document(&self, doc: &SourceDocument, stats: &mut SyncStats) {
        let mut new_hashes: Vec<String> = doc.chunks.iter().map(|c| c.metadata.hash.clone()).collect();
        new_hashes.sort();
        let stored = self.store.get_hashes_for_url(&doc.url).await;

        if stored == new_hashes {
            stats.unchanged += doc.chunks.len();
            return;
        }

        // A different chunk count changes `total_chunks` on every position,
        // and a shrunk document would leave trailing chunks behind: rewrite
        // the document from scratch.
        let rewrite = !stored.is_empty() && stored.len() != doc.chunks.len();
        if rewrite {
            stats.deleted += self.store.delete_by_url(&doc.url).await;
        }

        let mut pending = Vec::new();
        for chunk in &doc.chunks {
            if !rewrite {
                let existing = self.store.chunk_hash(&chunk.metadata.chunk_id).await;
                if existing.as_deref() == Some(chunk.metadata.hash.as_str()) {
                    stats.unchanged += 1;
                    continue;
                }
            }
            pending.push(chunk);
        }
        if pending.is_empty() {
            return;
        }

        let texts: Vec<String> = pending.iter().map(|c| c.content.clone()).collect();
        let vectors = self.embedder.embed_all(&texts).await;

        for (chunk, vector) in pending.into_iter().zip(vectors) {
            let Some(vector) = vector else {
                stats.failed += 1;
                continue;
            };
            match self.store.upsert_chunk(chunk, &vector, &chunk.metadata.hash).await {
                UpsertOutcome::Inserted | UpsertOutcome::Updated => stats.embedded += 1,
                UpsertOutcome::Unchanged => stats.unchanged += 1,
                UpsertOutcome::Failed => stats.failed += 1,
            }
        }
    }

    async fn delete_obsolete(&self, docs: &[SourceDocument], scope: &ObsolescenceScope) -> usize {
        match scope {
            ObsolescenceScope::UrlPrefix(prefix) => {
                let visited: HashSet<String> = docs.iter().map(|d| d.url.clone()).collect();
                self.store.delete_obsolete(&visited, prefix).await
            }
            ObsolescenceScope::Files(path_scope) => {
                let processed: HashSet<String> =
                    docs.iter().filter_map(|d| d.path.clone()).collect();
                self.store.delete_obsolete_files(&processed, path_scope).await
            }
        }
    }

    async fn delete_paths(
        &self,
        provider: &dyn ContentProvider,
        deleted_paths: &[String],
        scope: &ObsolescenceScope,
    ) -> usize {
        let Some(diff) = provider.diff_provider() else {
            return 0;
        };

        let mut deleted = 0;
        for path in deleted_paths {
            let url = match scope {
                ObsolescenceScope::Files(path_scope) => {
                    path_scope.url_for(&diff.repo_root().join(path).to_string_lossy())
                }
                ObsolescenceScope::UrlPrefix(prefix) => Some(format!("{}{}", prefix, path)),
            };
            match url {
                Some(url) => deleted += self.store.delete_by_url(&url).await,
                None => tracing::debug!(path = %path, "deleted path outside source scope"),
            }
        }
        deleted
    }

    async fn advance_watermarks(&self, provider: &dyn ContentProvider, repo_key: &str) -> bool {
        let mut ok = self
            .store
            .set_metadata(&last_run_key(repo_key), &chrono::Utc::now().to_rfc3339())
            .await;

        if let Some(diff) = provider.diff_provider() {
            match diff.head().await {
                Ok(head) => {
                    ok &= self
                        .store
                        .set_metadata(&last_sha_key(repo_key, diff.branch()), &head)
                        .await;
                }
                Err(e) => {
                    tracing::warn!(source = provider.name(), error = %e, "could not resolve HEAD");
                    ok = false;
                }
            }
        }
        ok
    }
}

/// Build the content provider for a configured source.
pub fn build_provider(source: &SourceConfig, config: &Config) -> Result<Box<dyn ContentProvider>> {
    let max_tokens = config.chunking.max_tokens;
    Ok(match source.kind {
        SourceKind::Directory => Box::new(DirectoryProvider::new(source, max_tokens)?),
        SourceKind::Git => Box::new(GitProvider::new(source, &config.store.dir, max_tokens)?),
    })
}

/// Open, initialize and sync one source's collection.
pub async fn sync_source(
    config: &Config,
    source: &SourceConfig,
    embedder: &EmbeddingClient,
    full: bool,
) -> Result<SyncStats> {
    let collection = source
        .collection()
        .ok_or_else(|| Error::config(format!("source '{}' has no collection", source.name)))?;
    let provider = build_provider(source, config)?;

    let store = IndexStore::open(&config.store, &collection, config.embedding.dims).await?;
    let result = match store.init_schema().await {
        Ok(()) => {
            SyncEngine::new(&store, embedder)
                .sync(provider.as_ref(), source.repo_key(), full)
                .await
        }
        Err(e) => Err(e),
    };
    store.close().await;
    result
}

/// Sync every configured source (or just `only`), in configured order.
///
/// Configuration problems abort before any store is opened; a failing
/// source is logged and the remaining sources still run.
pub async fn run_sync(config: &Config, only: Option<&str>, full: bool) -> Result<()> {
    if !config.embedding.is_enabled() {
        return Err(Error::config("sync requires an embedding provider ([embedding] provider)").into());
    }
    let sources: Vec<&SourceConfig> = config
        .sources
        .iter()
        .filter(|s| only.map_or(true, |name| s.name == name))
        .collect();
    if sources.is_empty() {
        return Err(match only {
            Some(name) => Error::config(format!("unknown source '{}'", name)),
            None => Error::config("no [[sources]] configured"),
        }
        .into());
    }

    let embedder = EmbeddingClient::from_config(&config.embedding)?;
    tracing::info!(
        model = embedder.provider().model_name(),
        dims = embedder.provider().dims(),
        batch_size = embedder.batch_size(),
        "embedding provider ready"
    );
    let mut failed_sources = 0usize;

    for source in sources {
        match sync_source(config, source, &embedder, full).await {
            Ok(stats) => {
                tracing::info!(source = %source.name, ?stats, "source synced");
                println!(
                    "sync {} ({})",
                    source.name,
                    if stats.incremental { "incremental" } else { "full" }
                );
                println!("  documents: {}", stats.documents);
                println!("  unchanged chunks: {}", stats.unchanged);
                println!("  embedded chunks: {}", stats.embedded);
                println!("  failed chunks: {}", stats.failed);
                println!("  deleted records: {}", stats.deleted);
                println!(
                    "  watermark: {}",
                    if stats.watermarked { "advanced" } else { "unchanged" }
                );
            }
            Err(e) => {
                failed_sources += 1;
                tracing::error!(source = %source.name, error = %format!("{:#}", e), "source sync failed");
                println!("sync {}", source.name);
                println!("  error: {:#}", e);
            }
        }
    }

    if failed_sources == 0 {
        println!("ok");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{chunk_document, DocumentContext};
    use crate::config::EmbeddingConfig;
    use crate::embedding::EmbeddingProvider;
    use crate::store::sqlite::SqliteBackend;
    use crate::store::PathScope;
    use crate::traits::DiffProvider;
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    struct CountingProvider {
        calls: AtomicUsize,
        texts: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for CountingProvider {
        fn model_name(&self) -> &str {
            "counting"
        }
        fn dims(&self) -> usize {
            3
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.texts.fetch_add(texts.len(), Ordering::SeqCst);
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0, 0.0]).collect())
        }
    }

    /// Serves fixed documents and a scripted diff.
    struct FakeSource {
        root: PathBuf,
        docs: Mutex<Vec<(String, String)>>,
        head: String,
        diff: Option<String>,
        versioned: bool,
    }

    impl FakeSource {
        fn document(&self, rel: &str, body: &str) -> SourceDocument {
            let path = format!("{}/{}", self.root.display(), rel);
            let url = format!("https://code.example/{}", rel);
            let ctx = DocumentContext {
                product_name: "acme".to_string(),
                version: "1".to_string(),
                url: url.clone(),
                ..Default::default()
            };
            SourceDocument {
                url,
                path: Some(path),
                chunks: chunk_document(&ctx, body, 700),
            }
        }
    }

    #[async_trait]
    impl ContentProvider for FakeSource {
        fn name(&self) -> &str {
            "fake"
        }

        fn scope(&self) -> ObsolescenceScope {
            ObsolescenceScope::Files(PathScope::new(
                &self.root.to_string_lossy(),
                Some("https://code.example/"),
            ))
        }

        async fn scan(&self, only: Option<&BTreeSet<PathBuf>>) -> Result<Vec<SourceDocument>> {
            let docs = self.docs.lock().unwrap().clone();
            Ok(docs
                .iter()
                .filter(|(rel, _)| only.map_or(true, |set| set.contains(&self.root.join(rel))))
                .map(|(rel, body)| self.document(rel, body))
                .collect())
        }

        fn diff_provider(&self) -> Option<&dyn DiffProvider> {
            if self.versioned {
                Some(self)
            } else {
                None
            }
        }
    }

    #[async_trait]
    impl DiffProvider for FakeSource {
        async fn head(&self) -> Result<String> {
            Ok(self.head.clone())
        }
        async fn diff_since(&self, _since: &str) -> Result<String> {
            self.diff.clone().ok_or_else(|| anyhow::anyhow!("bad revision"))
        }
        fn repo_root(&self) -> &Path {
            &self.root
        }
        fn branch(&self) -> &str {
            "main"
        }
    }

    fn fake(docs: &[(&str, &str)], head: &str, diff: Option<&str>) -> FakeSource {
        FakeSource {
            root: PathBuf::from("/repo"),
            docs: Mutex::new(
                docs.iter()
                    .map(|(a, b)| (a.to_string(), b.to_string()))
                    .collect(),
            ),
            head: head.to_string(),
            diff: diff.map(str::to_string),
            versioned: true,
        }
    }

    async fn setup() -> (TempDir, IndexStore, EmbeddingClient, Arc<CountingProvider>) {
        let tmp = TempDir::new().unwrap();
        let backend = SqliteBackend::open(tmp.path(), "test", "vectors", true)
            .await
            .unwrap();
        let store = IndexStore::new(Box::new(backend));
        store.init_schema().await.unwrap();
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            texts: AtomicUsize::new(0),
        });
        let embedder = EmbeddingClient::new(provider.clone(), &EmbeddingConfig::default());
        (tmp, store, embedder, provider)
    }

    #[tokio::test]
    async fn test_unchanged_rerun_makes_no_embedding_calls() {
        let (_tmp, store, embedder, counter) = setup().await;
        let source = fake(&[("a.md", "alpha"), ("b.md", "beta")], "c1", None);
        let engine = SyncEngine::new(&store, &embedder);

        let first = engine.sync(&source, "acme/widgets", false).await.unwrap();
        assert_eq!(first.embedded, 2);
        assert!(first.watermarked);
        let calls = counter.calls.load(Ordering::SeqCst);

        let second = engine.sync(&source, "acme/widgets", true).await.unwrap();
        assert_eq!(second.embedded, 0);
        assert_eq!(second.unchanged, 2);
        assert_eq!(counter.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn test_full_pass_deletes_files_no_longer_produced() {
        let (_tmp, store, embedder, _) = setup().await;
        let source = fake(&[("a.md", "alpha"), ("b.md", "beta")], "c1", None);
        let engine = SyncEngine::new(&store, &embedder);
        engine.sync(&source, "r", true).await.unwrap();

        source.docs.lock().unwrap().retain(|(rel, _)| rel == "a.md");
        let stats = engine.sync(&source, "r", true).await.unwrap();

        assert_eq!(stats.deleted, 1);
        assert!(store.get_hashes_for_url("https://code.example/b.md").await.is_empty());
        assert_eq!(store.get_hashes_for_url("https://code.example/a.md").await.len(), 1);
    }

    #[tokio::test]
    async fn test_incremental_pass_uses_diff() {
        let (_tmp, store, embedder, counter) = setup().await;
        let mut source = fake(
            &[("a.md", "alpha"), ("b.md", "beta"), ("c.md", "gamma")],
            "c1",
            None,
        );
        let engine = SyncEngine::new(&store, &embedder);
        engine.sync(&source, "r", false).await.unwrap();
        assert_eq!(store.get_metadata(&last_sha_key("r", "main"), "").await, "c1");

        // b.md changes, c.md is deleted
        source.docs = Mutex::new(vec![
            ("a.md".to_string(), "alpha".to_string()),
            ("b.md".to_string(), "beta v2".to_string()),
        ]);
        source.head = "c2".to_string();
        source.diff = Some("M\tb.md\nD\tc.md\n".to_string());
        let before = counter.texts.load(Ordering::SeqCst);

        let stats = engine.sync(&source, "r", false).await.unwrap();

        assert!(stats.incremental);
        assert_eq!(stats.documents, 1);
        assert_eq!(stats.embedded, 1);
        assert_eq!(stats.deleted, 1);
        assert_eq!(counter.texts.load(Ordering::SeqCst) - before, 1);
        assert!(store.get_hashes_for_url("https://code.example/c.md").await.is_empty());
        assert_eq!(store.get_metadata(&last_sha_key("r", "main"), "").await, "c2");
    }

    #[tokio::test]
    async fn test_failed_diff_falls_back_to_full_pass() {
        let (_tmp, store, embedder, _) = setup().await;
        let source = fake(&[("a.md", "alpha")], "c1", None);
        let engine = SyncEngine::new(&store, &embedder);
        engine.sync(&source, "r", false).await.unwrap();

        assert_eq!(engine.plan(&source, "r").await, SyncMode::Full);
        let stats = engine.sync(&source, "r", false).await.unwrap();
        assert!(!stats.incremental);
        assert_eq!(stats.unchanged, 1);
    }

    #[tokio::test]
    async fn test_shrunk_document_is_rewritten() {
        let (_tmp, store, embedder, _) = setup().await;
        let long = (0..200)
            .map(|i| format!("Paragraph number {} with some words.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let source = fake(&[("a.md", long.as_str())], "c1", None);
        let engine = SyncEngine::new(&store, &embedder);
        engine.sync(&source, "r", true).await.unwrap();
        let before = store.get_hashes_for_url("https://code.example/a.md").await.len();
        assert!(before > 1);

        *source.docs.lock().unwrap() = vec![("a.md".to_string(), "short now".to_string())];
        engine.sync(&source, "r", true).await.unwrap();

        let chunks = store.document_chunks("https://code.example/a.md").await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "short now");
    }

    #[tokio::test]
    async fn test_grown_document_refreshes_every_position_marker() {
        let (_tmp, store, embedder, _) = setup().await;
        let paragraphs = |n: usize| {
            (0..n)
                .map(|i| format!("Paragraph number {} with some words.", i))
                .collect::<Vec<_>>()
                .join("\n\n")
        };
        let short = paragraphs(150);
        let source = fake(&[("a.md", short.as_str())], "c1", None);
        let engine = SyncEngine::new(&store, &embedder);
        engine.sync(&source, "r", true).await.unwrap();
        let before = store.document_chunks("https://code.example/a.md").await.unwrap().len();
        assert!(before > 1);

        // appending keeps the leading chunks byte-identical
        *source.docs.lock().unwrap() = vec![("a.md".to_string(), paragraphs(300))];
        engine.sync(&source, "r", true).await.unwrap();

        let chunks = store.document_chunks("https://code.example/a.md").await.unwrap();
        let total = chunks.len();
        assert!(total > before);
        assert!(chunks.iter().all(|c| c.total_chunks == total as i64));
        let indexes: Vec<i64> = chunks.iter().map(|c| c.chunk_index).collect();
        assert_eq!(indexes, (0..total as i64).collect::<Vec<_>>());

        let rendered = crate::query::QueryResponse::Chunks(chunks).render();
        assert_eq!(
            rendered.matches(&format!(" of {}\n", total)).count(),
            total
        );
    }
}
