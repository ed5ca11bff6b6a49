//! Core data models used throughout docsync.
//!
//! These types represent the chunks, stored records, and search results
//! that flow through the synchronization and retrieval pipeline.

use serde::{Deserialize, Serialize};

/// Provenance and position of a chunk.
///
/// `branch` and `repo` are optional at the source; stores coerce a missing
/// value to the empty string (see [`VectorRecord::from_chunk`]).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub product_name: String,
    pub version: String,
    pub branch: Option<String>,
    pub repo: Option<String>,
    pub heading_hierarchy: Vec<String>,
    pub section: String,
    pub chunk_id: String,
    pub url: String,
    pub hash: String,
    pub chunk_index: i64,
    pub total_chunks: i64,
}

/// A bounded unit of source content plus its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub content: String,
    pub metadata: ChunkMetadata,
}

/// All chunks produced for one url (web page or file) in a pass.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    /// Url or filesystem locator stored on every chunk.
    pub url: String,
    /// Local path, for file-backed sources.
    pub path: Option<String>,
    pub chunks: Vec<Chunk>,
}

/// One stored unit: the embedding plus a denormalized copy of the metadata.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub embedding: Vec<f32>,
    pub product_name: String,
    pub version: String,
    pub branch: String,
    pub repo: String,
    pub heading_hierarchy: Vec<String>,
    pub section: String,
    pub chunk_id: String,
    pub content: String,
    pub url: String,
    pub hash: String,
    pub chunk_index: i64,
    pub total_chunks: i64,
}

impl VectorRecord {
    pub fn from_chunk(chunk: &Chunk, embedding: &[f32], hash: &str) -> Self {
        let meta = &chunk.metadata;
        Self {
            embedding: embedding.to_vec(),
            product_name: meta.product_name.clone(),
            version: meta.version.clone(),
            branch: meta.branch.clone().unwrap_or_default(),
            repo: meta.repo.clone().unwrap_or_default(),
            heading_hierarchy: meta.heading_hierarchy.clone(),
            section: meta.section.clone(),
            chunk_id: meta.chunk_id.clone(),
            content: chunk.content.clone(),
            url: meta.url.clone(),
            hash: hash.to_string(),
            chunk_index: meta.chunk_index,
            total_chunks: meta.total_chunks,
        }
    }

    /// Heading hierarchy as the JSON string stored by both backends.
    pub fn heading_hierarchy_json(&self) -> String {
        serde_json::to_string(&self.heading_hierarchy).unwrap_or_else(|_| "[]".to_string())
    }
}

/// A nearest-neighbor result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub content: String,
    pub url: String,
    pub section: String,
    /// Cosine distance (`1 - similarity`); lower is closer.
    pub distance: f32,
    pub chunk_index: i64,
    pub total_chunks: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub repo: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub branch: String,
}

/// A stored chunk fetched for whole-document reassembly.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredChunk {
    pub content: String,
    pub url: String,
    pub section: String,
    pub chunk_index: i64,
    pub total_chunks: i64,
}
