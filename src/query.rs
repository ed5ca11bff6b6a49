//! Backend-agnostic retrieval.
//!
//! [`QueryService`] resolves the target collection from the request,
//! embeds the query text, runs nearest-neighbor search through
//! [`IndexStore`], and post-filters the hits:
//!
//! 1. hits with empty or whitespace-only content are dropped;
//! 2. with a `url_prefix`, hits whose url does not start with it are dropped.
//!
//! Every outcome, including missing parameters and backend failures, is a
//! [`QueryResponse`]; nothing here returns an error to the caller, because
//! the consumer is an automated client that expects a payload every time.

use serde::{Deserialize, Serialize};

use crate::config::{resolve_collection, Config, StoreConfig};
use crate::embedding::EmbeddingClient;
use crate::error::Error;
use crate::models::{SearchHit, StoredChunk};
use crate::store::IndexStore;

/// Which index to query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Target {
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    /// Explicit collection (database) name; wins over product + version.
    #[serde(default)]
    pub collection: Option<String>,
}

impl Target {
    pub fn collection(&self) -> Option<String> {
        resolve_collection(
            self.collection.as_deref(),
            self.product_name.as_deref(),
            self.version.as_deref(),
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(flatten)]
    pub target: Target,
    #[serde(default)]
    pub url_prefix: Option<String>,
    /// Restrict code search to one repository.
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GetChunksRequest {
    pub url: String,
    #[serde(flatten)]
    pub target: Target,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum QueryResponse {
    Results(Vec<SearchHit>),
    Chunks(Vec<StoredChunk>),
    /// Diagnostic for insufficient input or degenerate results.
    Message(String),
}

impl QueryResponse {
    fn message(msg: impl Into<String>) -> Self {
        QueryResponse::Message(msg.into())
    }

    /// Plain-text rendering for CLI output and tool payloads.
    pub fn render(&self) -> String {
        match self {
            QueryResponse::Message(msg) => msg.clone(),
            QueryResponse::Results(hits) => hits
                .iter()
                .enumerate()
                .map(|(i, hit)| {
                    let mut out = format!("## Result {}\nURL: {}\n", i + 1, hit.url);
                    if !hit.section.is_empty() {
                        out.push_str(&format!("Section: {}\n", hit.section));
                    }
                    if !hit.repo.is_empty() {
                        out.push_str(&format!("Repo: {}\n", hit.repo));
                    }
                    out.push_str(&format!(
                        "Distance: {:.4}\nChunk {} of {}\n\n{}",
                        hit.distance,
                        hit.chunk_index + 1,
                        hit.total_chunks,
                        hit.content.trim()
                    ));
                    out
                })
                .collect::<Vec<_>>()
                .join("\n\n---\n\n"),
            QueryResponse::Chunks(chunks) => chunks
                .iter()
                .map(|c| {
                    format!(
                        "Chunk {} of {}\n\n{}",
                        c.chunk_index + 1,
                        c.total_chunks,
                        c.content.trim()
                    )
                })
                .collect::<Vec<_>>()
                .join("\n\n---\n\n"),
        }
    }
}

/// Hits left after filtering, plus how many were dropped for empty content.
#[derive(Debug, Clone, PartialEq)]
pub struct Filtered {
    pub hits: Vec<SearchHit>,
    pub empty_content: usize,
}

/// Drop empty/whitespace content and, with a prefix, out-of-scope urls.
pub fn filter_hits(hits: Vec<SearchHit>, url_prefix: Option<&str>) -> Filtered {
    let prefix = url_prefix.filter(|p| !p.is_empty());
    let mut empty_content = 0;
    let hits = hits
        .into_iter()
        .filter(|hit| {
            if hit.content.trim().is_empty() {
                empty_content += 1;
                return false;
            }
            prefix.map_or(true, |p| hit.url.starts_with(p))
        })
        .collect();
    Filtered {
        hits,
        empty_content,
    }
}

pub struct QueryService {
    store: StoreConfig,
    embedder: Option<EmbeddingClient>,
    dims: usize,
    default_limit: usize,
}

impl QueryService {
    /// Service using the configured embedding provider.
    ///
    /// With embeddings disabled, searches answer with a diagnostic while
    /// [`get_chunks`](Self::get_chunks) keeps working.
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let embedder = if config.embedding.is_enabled() {
            Some(EmbeddingClient::from_config(&config.embedding)?)
        } else {
            None
        };
        Ok(Self::with_embedder(config, embedder))
    }

    pub fn with_embedder(config: &Config, embedder: Option<EmbeddingClient>) -> Self {
        Self {
            store: config.store.clone(),
            embedder,
            dims: config.embedding.dims,
            default_limit: config.retrieval.final_limit,
        }
    }

    pub async fn search_docs(&self, req: &SearchRequest) -> QueryResponse {
        self.search(req, None).await
    }

    /// Search restricted to code records, optionally of one repository.
    pub async fn search_code(&self, req: &SearchRequest) -> QueryResponse {
        let repo = req.repo.as_deref().map(str::trim).filter(|r| !r.is_empty());
        self.search(req, repo).await
    }

    async fn search(&self, req: &SearchRequest, repo: Option<&str>) -> QueryResponse {
        let Some(collection) = req.target.collection() else {
            return QueryResponse::message(missing_target_message());
        };
        if req.query.trim().is_empty() {
            return QueryResponse::message("query must not be empty");
        }
        let Some(embedder) = &self.embedder else {
            return QueryResponse::message(
                "Search requires embeddings. Set [embedding] provider in config.",
            );
        };

        let store = match self.open(&collection).await {
            Ok(store) => store,
            Err(msg) => return QueryResponse::Message(msg),
        };

        let response = match embedder.embed_query(&req.query).await {
            None => QueryResponse::message(
                "Could not embed the query: the embedding provider is unavailable.",
            ),
            Some(vector) => {
                let limit = req.limit.unwrap_or(self.default_limit).max(1);
                match store.search(&vector, limit, repo).await {
                    Ok(hits) => Self::finish(hits, req.url_prefix.as_deref()),
                    Err(e) => {
                        tracing::warn!(collection = %collection, error = %e, "search failed");
                        QueryResponse::Message(format!("Search failed: {:#}", e))
                    }
                }
            }
        };

        store.close().await;
        response
    }

    fn finish(hits: Vec<SearchHit>, url_prefix: Option<&str>) -> QueryResponse {
        let total = hits.len();
        let filtered = filter_hits(hits, url_prefix);
        if !filtered.hits.is_empty() {
            return QueryResponse::Results(filtered.hits);
        }
        if total == 0 {
            QueryResponse::message("No results found.")
        } else if filtered.empty_content == total {
            QueryResponse::Message(format!(
                "Found {} matching chunks, but their content is empty. The index may need to be re-synced.",
                total
            ))
        } else {
            QueryResponse::Message(format!(
                "No results under url prefix '{}'.",
                url_prefix.unwrap_or_default()
            ))
        }
    }

    /// Every chunk of one document, in reading order.
    pub async fn get_chunks(&self, req: &GetChunksRequest) -> QueryResponse {
        let Some(collection) = req.target.collection() else {
            return QueryResponse::message(missing_target_message());
        };
        if req.url.trim().is_empty() {
            return QueryResponse::message("url must not be empty");
        }

        let store = match self.open(&collection).await {
            Ok(store) => store,
            Err(msg) => return QueryResponse::Message(msg),
        };
        let response = match store.document_chunks(req.url.trim()).await {
            Ok(chunks) if chunks.is_empty() => {
                QueryResponse::Message(format!("No chunks stored for '{}'.", req.url.trim()))
            }
            Ok(chunks) => QueryResponse::Chunks(chunks),
            Err(e) => {
                tracing::warn!(collection = %collection, url = %req.url, error = %e, "document fetch failed");
                QueryResponse::Message(format!("Fetching document failed: {:#}", e))
            }
        };
        store.close().await;
        response
    }

    async fn open(&self, collection: &str) -> Result<IndexStore, String> {
        IndexStore::open_existing(&self.store, collection, self.dims)
            .await
            .map_err(|e| match e.downcast_ref::<Error>() {
                Some(Error::Validation(msg)) => msg.clone(),
                _ => {
                    tracing::warn!(collection, error = %e, "failed to open index");
                    format!("Failed to open index '{}': {:#}", collection, e)
                }
            })
    }
}

fn missing_target_message() -> &'static str {
    "Missing index identifier: provide product_name and version, or collection."
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(content: &str, url: &str) -> SearchHit {
        SearchHit {
            content: content.to_string(),
            url: url.to_string(),
            section: String::new(),
            distance: 0.1,
            chunk_index: 0,
            total_chunks: 1,
            repo: String::new(),
            branch: String::new(),
        }
    }

    #[test]
    fn test_filter_keeps_only_valid_in_scope_hits() {
        let hits = vec![
            hit("", "https://docs.acme.dev/a"),
            hit("   \n\t", "https://docs.acme.dev/b"),
            hit("outside", "https://blog.acme.dev/c"),
            hit("valid", "https://docs.acme.dev/d"),
        ];
        let filtered = filter_hits(hits, Some("https://docs.acme.dev/"));
        assert_eq!(filtered.hits, vec![hit("valid", "https://docs.acme.dev/d")]);
        assert_eq!(filtered.empty_content, 2);
    }

    #[test]
    fn test_all_empty_content_is_distinguishable() {
        let response = QueryService::finish(vec![hit("", "u1"), hit(" ", "u2")], None);
        match response {
            QueryResponse::Message(msg) => assert!(msg.contains("content is empty")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            QueryService::finish(vec![], None),
            QueryResponse::Message("No results found.".to_string())
        );
    }

    #[test]
    fn test_target_resolution() {
        let target = Target {
            product_name: Some("Acme".to_string()),
            version: Some("2.0".to_string()),
            collection: None,
        };
        assert_eq!(target.collection().as_deref(), Some("Acme_2_0"));
        assert_eq!(Target::default().collection(), None);
    }

    #[test]
    fn test_render_chunks_with_markers() {
        let chunks = vec![
            StoredChunk {
                content: "first".to_string(),
                url: "u".to_string(),
                section: String::new(),
                chunk_index: 0,
                total_chunks: 2,
            },
            StoredChunk {
                content: "second".to_string(),
                url: "u".to_string(),
                section: String::new(),
                chunk_index: 1,
                total_chunks: 2,
            },
        ];
        let text = QueryResponse::Chunks(chunks).render();
        assert!(text.starts_with("Chunk 1 of 2\n\nfirst"));
        assert!(text.contains("Chunk 2 of 2\n\nsecond"));
    }

    #[test]
    fn test_request_deserializes_flattened_target() {
        let req: SearchRequest = serde_json::from_str(
            r#"{"query": "install", "product_name": "acme", "version": "1", "limit": 3}"#,
        )
        .unwrap();
        assert_eq!(req.target.collection().as_deref(), Some("acme_1"));
        assert_eq!(req.limit, Some(3));
    }
}
