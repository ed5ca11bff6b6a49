//! Remote backend: a named Qdrant collection over the REST API.
//!
//! Content points carry the chunk metadata as payload plus
//! `is_metadata: false`. Bookkeeping entries are stored as points with
//! `is_metadata: true`, a dummy vector, and `key`/`value` payload fields;
//! every content query excludes them explicitly.
//!
//! Qdrant only accepts UUIDs (or integers) as point ids, so chunk ids are
//! mapped to UUIDs deterministically with [`point_id`]. Reads never assume
//! that mapping and look points up by their `chunk_id` payload instead.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

use super::StoreBackend;
use crate::config::{BackendKind, QdrantConfig};
use crate::models::{SearchHit, StoredChunk, VectorRecord};

/// Payload fields that get a keyword index.
const INDEXED_FIELDS: &[&str] = &["url", "chunk_id", "repo"];

pub struct QdrantBackend {
    client: Client,
    base: String,
    collection: String,
    dims: usize,
    page_size: usize,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    result: T,
}

#[derive(Debug, Deserialize)]
struct ScrollResult {
    #[serde(default)]
    points: Vec<Point>,
    #[serde(default)]
    next_page_offset: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Point {
    id: Value,
    #[serde(default)]
    payload: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ScoredPoint {
    score: f32,
    #[serde(default)]
    payload: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CountResult {
    count: usize,
}

/// Deterministic point id for a chunk id.
///
/// A chunk id that already is a UUID is used as-is; anything else is hashed
/// into a v5 UUID. An empty id cannot be mapped and gets a random UUID.
pub fn point_id(chunk_id: &str) -> Uuid {
    if chunk_id.is_empty() {
        let id = Uuid::new_v4();
        tracing::warn!(point_id = %id, "empty chunk id; using random point id");
        return id;
    }
    Uuid::parse_str(chunk_id).unwrap_or_else(|_| Uuid::new_v5(&Uuid::NAMESPACE_OID, chunk_id.as_bytes()))
}

/// Point id of the bookkeeping entry for `key`.
pub fn metadata_point_id(key: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("metadata:{}", key).as_bytes())
}

/// Filter matching content points, optionally narrowed by `must` conditions.
fn content_filter(must: Vec<Value>) -> Value {
    json!({
        "must": must,
        "must_not": [{ "key": "is_metadata", "match": { "value": true } }],
    })
}

fn match_value(key: &str, value: &str) -> Value {
    json!({ "key": key, "match": { "value": value } })
}

fn payload_str(payload: &Value, key: &str) -> String {
    payload
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn payload_i64(payload: &Value, key: &str) -> i64 {
    payload.get(key).and_then(Value::as_i64).unwrap_or_default()
}

fn record_payload(record: &VectorRecord) -> Value {
    json!({
        "product_name": record.product_name,
        "version": record.version,
        "branch": record.branch,
        "repo": record.repo,
        "heading_hierarchy": record.heading_hierarchy_json(),
        "section": record.section,
        "chunk_id": record.chunk_id,
        "content": record.content,
        "url": record.url,
        "hash": record.hash,
        "chunk_index": record.chunk_index,
        "total_chunks": record.total_chunks,
        "is_metadata": false,
    })
}

fn stored_chunk(payload: &Value) -> StoredChunk {
    StoredChunk {
        content: payload_str(payload, "content"),
        url: payload_str(payload, "url"),
        section: payload_str(payload, "section"),
        chunk_index: payload_i64(payload, "chunk_index"),
        total_chunks: payload_i64(payload, "total_chunks"),
    }
}

impl QdrantBackend {
    pub fn new(config: &QdrantConfig, collection: &str, dims: usize) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(var) = &config.api_key_env {
            let key = std::env::var(var)
                .with_context(|| format!("environment variable {} not set", var))?;
            headers.insert(
                "api-key",
                HeaderValue::from_str(key.trim()).context("invalid Qdrant API key")?,
            );
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .context("failed to build Qdrant HTTP client")?;

        Ok(Self {
            client,
            base: config.url.trim_end_matches('/').to_string(),
            collection: collection.to_string(),
            dims,
            page_size: config.scroll_page_size.max(1),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/collections/{}{}", self.base, self.collection, path)
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(anyhow!("Qdrant request failed ({}): {}", status, body));
        }
        let envelope: Envelope<T> = response
            .json()
            .await
            .context("failed to parse Qdrant response")?;
        Ok(envelope.result)
    }

    async fn collection_exists(&self) -> Result<bool> {
        let response = self.client.get(self.url("")).send().await?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(anyhow!("Qdrant collection lookup failed ({})", s)),
        }
    }

    /// Fail unless the collection has been created.
    pub async fn ensure_exists(&self) -> Result<()> {
        if self.collection_exists().await? {
            Ok(())
        } else {
            Err(crate::error::Error::Validation(format!(
                "No index found for collection '{}'. Run `docsync sync` first.",
                self.collection
            ))
            .into())
        }
    }

    /// Scroll every point matching `filter`, one page at a time.
    async fn scroll_all(&self, filter: Value, with_payload: Value) -> Result<Vec<Point>> {
        let mut points = Vec::new();
        let mut offset: Option<Value> = None;
        loop {
            let mut body = json!({
                "filter": filter,
                "limit": self.page_size,
                "with_payload": with_payload,
                "with_vector": false,
            });
            if let Some(o) = offset.take() {
                body["offset"] = o;
            }
            let page: ScrollResult = self
                .send(self.client.post(self.url("/points/scroll")).json(&body))
                .await?;
            points.extend(page.points);
            match page.next_page_offset {
                Some(next) if !next.is_null() => offset = Some(next),
                _ => break,
            }
        }
        Ok(points)
    }

    /// Id and stored hash of the content point for `chunk_id`.
    async fn find_chunk(&self, chunk_id: &str) -> Result<Option<(Value, String)>> {
        let body = json!({
            "filter": content_filter(vec![match_value("chunk_id", chunk_id)]),
            "limit": 1,
            "with_payload": ["hash"],
            "with_vector": false,
        });
        let page: ScrollResult = self
            .send(self.client.post(self.url("/points/scroll")).json(&body))
            .await?;
        Ok(page.points.into_iter().next().map(|p| {
            let hash = p.payload.as_ref().map(|pl| payload_str(pl, "hash")).unwrap_or_default();
            (p.id, hash)
        }))
    }

    async fn put_point(&self, id: Value, vector: &[f32], payload: Value) -> Result<()> {
        let body = json!({
            "points": [{ "id": id, "vector": vector, "payload": payload }],
        });
        let _: Value = self
            .send(self.client.put(self.url("/points?wait=true")).json(&body))
            .await?;
        Ok(())
    }

    fn dummy_vector(&self) -> Vec<f32> {
        let mut v = vec![0.0; self.dims.max(1)];
        v[0] = 1.0;
        v
    }
}

#[async_trait]
impl StoreBackend for QdrantBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Qdrant
    }

    async fn init_schema(&self) -> Result<()> {
        if !self.collection_exists().await? {
            let body = json!({
                "vectors": { "size": self.dims, "distance": "Cosine" },
            });
            let _: Value = self.send(self.client.put(self.url("")).json(&body)).await?;
            tracing::info!(collection = %self.collection, dims = self.dims, "created Qdrant collection");
        }

        for field in INDEXED_FIELDS {
            let body = json!({ "field_name": field, "field_schema": "keyword" });
            let _: Value = self
                .send(self.client.put(self.url("/index?wait=true")).json(&body))
                .await?;
        }
        let body = json!({ "field_name": "is_metadata", "field_schema": "bool" });
        let _: Value = self
            .send(self.client.put(self.url("/index?wait=true")).json(&body))
            .await?;
        Ok(())
    }

    async fn chunk_hash(&self, chunk_id: &str) -> Result<Option<String>> {
        Ok(self.find_chunk(chunk_id).await?.map(|(_, hash)| hash))
    }

    async fn insert_chunk(&self, record: &VectorRecord) -> Result<()> {
        let id = point_id(&record.chunk_id);
        self.put_point(json!(id.to_string()), &record.embedding, record_payload(record))
            .await
    }

    async fn update_chunk(&self, record: &VectorRecord) -> Result<()> {
        let id = match self.find_chunk(&record.chunk_id).await? {
            Some((id, _)) => id,
            None => json!(point_id(&record.chunk_id).to_string()),
        };
        self.put_point(id, &record.embedding, record_payload(record)).await
    }

    async fn hashes_for_url(&self, url: &str) -> Result<Vec<String>> {
        let points = self
            .scroll_all(content_filter(vec![match_value("url", url)]), json!(["hash"]))
            .await?;
        Ok(points
            .iter()
            .filter_map(|p| p.payload.as_ref())
            .map(|pl| payload_str(pl, "hash"))
            .collect())
    }

    async fn urls_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        // keyword indexes have no prefix match, so filter client-side
        let points = self.scroll_all(content_filter(vec![]), json!(["url"])).await?;
        let urls: BTreeSet<String> = points
            .iter()
            .filter_map(|p| p.payload.as_ref())
            .map(|pl| payload_str(pl, "url"))
            .filter(|u| u.starts_with(prefix))
            .collect();
        Ok(urls.into_iter().collect())
    }

    async fn delete_urls(&self, urls: &[String]) -> Result<usize> {
        if urls.is_empty() {
            return Ok(0);
        }
        let filter = content_filter(vec![json!({ "key": "url", "match": { "any": urls } })]);

        let counted: CountResult = self
            .send(
                self.client
                    .post(self.url("/points/count"))
                    .json(&json!({ "filter": filter, "exact": true })),
            )
            .await?;

        let _: Value = self
            .send(
                self.client
                    .post(self.url("/points/delete?wait=true"))
                    .json(&json!({ "filter": filter })),
            )
            .await?;
        Ok(counted.count)
    }

    async fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let id = metadata_point_id(key);
        let response = self
            .client
            .get(self.url(&format!("/points/{}", id)))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(anyhow!("Qdrant metadata lookup failed ({})", response.status()));
        }
        let envelope: Envelope<Point> = response.json().await?;
        Ok(envelope
            .result
            .payload
            .as_ref()
            .and_then(|pl| pl.get("value"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    async fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        let payload = json!({ "is_metadata": true, "key": key, "value": value });
        self.put_point(
            json!(metadata_point_id(key).to_string()),
            &self.dummy_vector(),
            payload,
        )
        .await
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        repo: Option<&str>,
    ) -> Result<Vec<SearchHit>> {
        let must = repo
            .filter(|r| !r.is_empty())
            .map(|r| vec![match_value("repo", r)])
            .unwrap_or_default();
        let body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
            "filter": content_filter(must),
        });
        let points: Vec<ScoredPoint> = self
            .send(self.client.post(self.url("/points/search")).json(&body))
            .await?;

        Ok(points
            .into_iter()
            .map(|p| {
                let payload = p.payload.unwrap_or(Value::Null);
                let chunk = stored_chunk(&payload);
                SearchHit {
                    content: chunk.content,
                    url: chunk.url,
                    section: chunk.section,
                    distance: 1.0 - p.score,
                    chunk_index: chunk.chunk_index,
                    total_chunks: chunk.total_chunks,
                    repo: payload_str(&payload, "repo"),
                    branch: payload_str(&payload, "branch"),
                }
            })
            .collect())
    }

    async fn document_chunks(&self, url: &str) -> Result<Vec<StoredChunk>> {
        let points = self
            .scroll_all(content_filter(vec![match_value("url", url)]), json!(true))
            .await?;
        let mut chunks: Vec<StoredChunk> = points
            .iter()
            .filter_map(|p| p.payload.as_ref())
            .map(stored_chunk)
            .collect();
        // scroll order is by point id, not position
        chunks.sort_by_key(|c| c.chunk_index);
        Ok(chunks)
    }

    async fn close(&self) {}
}
