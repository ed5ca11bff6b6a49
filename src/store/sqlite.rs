//! Embedded backend: one SQLite file per collection.
//!
//! The file holds a single vector table (name from `store.table`) and a
//! `metadata` key/value table. Embeddings are stored as little-endian `f32`
//! BLOBs and searched by brute-force cosine distance.
//!
//! The pool holds exactly one connection, so the file is touched only by
//! the run's own control flow. Column introspection (`PRAGMA table_info`)
//! is cached per backend instance, and reads/writes fall back to a reduced
//! projection when an older file lacks the `branch` or `repo` columns.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::sync::OnceCell;

use super::StoreBackend;
use crate::config::BackendKind;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::Error;
use crate::models::{SearchHit, StoredChunk, VectorRecord};

const REQUIRED_COLUMNS: [&str; 5] = ["chunk_id", "url", "hash", "content", "embedding"];

/// Optional columns present in the vector table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaInfo {
    pub has_branch: bool,
    pub has_repo: bool,
}

pub struct SqliteBackend {
    pool: SqlitePool,
    table: String,
    path: PathBuf,
    schema: OnceCell<SchemaInfo>,
}

/// Database file for `collection` under `dir`.
pub fn db_path(dir: &Path, collection: &str) -> PathBuf {
    dir.join(format!("{}.db", collection))
}

impl SqliteBackend {
    /// Open `<dir>/<collection>.db`.
    ///
    /// With `create = false` a missing file is an error instead of being
    /// created empty.
    pub async fn open(dir: &Path, collection: &str, table: &str, create: bool) -> Result<Self> {
        let path = db_path(dir, collection);
        if !create && !path.exists() {
            return Err(Error::Validation(format!(
                "No index found for collection '{}' ({} does not exist). Run `docsync sync` first.",
                collection,
                path.display()
            ))
            .into());
        }
        if create {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(create)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;

        Ok(Self {
            pool,
            table: table.to_string(),
            path,
            schema: OnceCell::new(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Cached column introspection, populated on first use.
    pub async fn schema_info(&self) -> Result<SchemaInfo> {
        let info = self
            .schema
            .get_or_try_init(|| async {
                let rows = sqlx::query(&format!("PRAGMA table_info({})", self.table))
                    .fetch_all(&self.pool)
                    .await?;
                let columns: Vec<String> = rows.iter().map(|r| r.get::<String, _>("name")).collect();
                // An absent table will be created with the full schema.
                let has = |name: &str| columns.is_empty() || columns.iter().any(|c| c == name);
                if let Some(missing) = REQUIRED_COLUMNS.iter().find(|c| !has(**c)) {
                    return Err(Error::SchemaCompatibility(format!(
                        "table '{}' in {} has no '{}' column",
                        self.table,
                        self.path.display(),
                        missing
                    ))
                    .into());
                }
                let info = SchemaInfo {
                    has_branch: has("branch"),
                    has_repo: has("repo"),
                };
                if !info.has_branch || !info.has_repo {
                    tracing::debug!(table = %self.table, ?info, "older table schema; using reduced projection");
                }
                Ok::<_, anyhow::Error>(info)
            })
            .await?;
        Ok(*info)
    }

    fn optional_columns(info: SchemaInfo) -> Vec<&'static str> {
        let mut cols = Vec::new();
        if info.has_branch {
            cols.push("branch");
        }
        if info.has_repo {
            cols.push("repo");
        }
        cols
    }

    fn read_optional(row: &SqliteRow, info: SchemaInfo) -> (String, String) {
        let branch = if info.has_branch {
            row.try_get::<Option<String>, _>("branch").ok().flatten().unwrap_or_default()
        } else {
            String::new()
        };
        let repo = if info.has_repo {
            row.try_get::<Option<String>, _>("repo").ok().flatten().unwrap_or_default()
        } else {
            String::new()
        };
        (branch, repo)
    }
}

#[async_trait]
impl StoreBackend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {t} (
                embedding BLOB NOT NULL,
                product_name TEXT NOT NULL,
                version TEXT NOT NULL,
                branch TEXT NOT NULL DEFAULT '',
                repo TEXT NOT NULL DEFAULT '',
                heading_hierarchy TEXT NOT NULL DEFAULT '[]',
                section TEXT NOT NULL DEFAULT '',
                chunk_id TEXT NOT NULL UNIQUE,
                content TEXT NOT NULL,
                url TEXT NOT NULL,
                hash TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                total_chunks INTEGER NOT NULL
            )
            "#,
            t = self.table
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{t}_url ON {t}(url)",
            t = self.table
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn chunk_hash(&self, chunk_id: &str) -> Result<Option<String>> {
        let hash: Option<String> = sqlx::query_scalar(&format!(
            "SELECT hash FROM {} WHERE chunk_id = ?",
            self.table
        ))
        .bind(chunk_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(hash)
    }

    async fn insert_chunk(&self, record: &VectorRecord) -> Result<()> {
        let info = self.schema_info().await?;
        let optional = Self::optional_columns(info);

        let mut columns = vec![
            "embedding",
            "product_name",
            "version",
            "heading_hierarchy",
            "section",
            "chunk_id",
            "content",
            "url",
            "hash",
            "chunk_index",
            "total_chunks",
        ];
        columns.extend(optional.iter().copied());
        let placeholders = vec!["?"; columns.len()].join(", ");

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT(chunk_id) DO NOTHING",
            self.table,
            columns.join(", "),
            placeholders
        );

        let mut query = sqlx::query(&sql)
            .bind(vec_to_blob(&record.embedding))
            .bind(&record.product_name)
            .bind(&record.version)
            .bind(record.heading_hierarchy_json())
            .bind(&record.section)
            .bind(&record.chunk_id)
            .bind(&record.content)
            .bind(&record.url)
            .bind(&record.hash)
            .bind(record.chunk_index)
            .bind(record.total_chunks);
        if info.has_branch {
            query = query.bind(&record.branch);
        }
        if info.has_repo {
            query = query.bind(&record.repo);
        }
        query.execute(&self.pool).await?;
        Ok(())
    }

    async fn update_chunk(&self, record: &VectorRecord) -> Result<()> {
        let info = self.schema_info().await?;

        let mut assignments = vec![
            "embedding = ?",
            "product_name = ?",
            "version = ?",
            "heading_hierarchy = ?",
            "section = ?",
            "content = ?",
            "url = ?",
            "hash = ?",
            "chunk_index = ?",
            "total_chunks = ?",
        ];
        if info.has_branch {
            assignments.push("branch = ?");
        }
        if info.has_repo {
            assignments.push("repo = ?");
        }

        let sql = format!(
            "UPDATE {} SET {} WHERE chunk_id = ?",
            self.table,
            assignments.join(", ")
        );

        let mut query = sqlx::query(&sql)
            .bind(vec_to_blob(&record.embedding))
            .bind(&record.product_name)
            .bind(&record.version)
            .bind(record.heading_hierarchy_json())
            .bind(&record.section)
            .bind(&record.content)
            .bind(&record.url)
            .bind(&record.hash)
            .bind(record.chunk_index)
            .bind(record.total_chunks);
        if info.has_branch {
            query = query.bind(&record.branch);
        }
        if info.has_repo {
            query = query.bind(&record.repo);
        }
        query.bind(&record.chunk_id).execute(&self.pool).await?;
        Ok(())
    }

    async fn hashes_for_url(&self, url: &str) -> Result<Vec<String>> {
        let hashes: Vec<String> =
            sqlx::query_scalar(&format!("SELECT hash FROM {} WHERE url = ?", self.table))
                .bind(url)
                .fetch_all(&self.pool)
                .await?;
        Ok(hashes)
    }

    async fn urls_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        // substr comparison, so `%` and `_` in urls are not wildcards
        let urls: Vec<String> = sqlx::query_scalar(&format!(
            "SELECT DISTINCT url FROM {} WHERE substr(url, 1, length(?)) = ?",
            self.table
        ))
        .bind(prefix)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        Ok(urls)
    }

    async fn delete_urls(&self, urls: &[String]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut deleted = 0u64;
        for url in urls {
            let result = sqlx::query(&format!("DELETE FROM {} WHERE url = ?", self.table))
                .bind(url)
                .execute(&mut *tx)
                .await?;
            deleted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(deleted as usize)
    }

    async fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM metadata WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO metadata (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        repo: Option<&str>,
    ) -> Result<Vec<SearchHit>> {
        let info = self.schema_info().await?;
        let mut columns = vec!["embedding", "content", "url", "section", "chunk_index", "total_chunks"];
        columns.extend(Self::optional_columns(info));

        let repo_filter = repo.filter(|r| !r.is_empty());
        if repo_filter.is_some() && !info.has_repo {
            tracing::warn!(table = %self.table, path = %self.path.display(), "repo filter requested on a table without a repo column");
            return Err(Error::SchemaCompatibility(format!(
                "the index at {} predates repository scoping; re-sync it to search by repo",
                self.path.display()
            ))
            .into());
        }
        let mut sql = format!("SELECT {} FROM {}", columns.join(", "), self.table);
        if repo_filter.is_some() {
            sql.push_str(" WHERE repo = ?");
        }

        let mut query = sqlx::query(&sql);
        if let Some(r) = repo_filter {
            query = query.bind(r);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut hits: Vec<SearchHit> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let similarity = cosine_similarity(vector, &blob_to_vec(&blob));
                let (branch, repo) = Self::read_optional(row, info);
                SearchHit {
                    content: row.get("content"),
                    url: row.get("url"),
                    section: row.get("section"),
                    distance: 1.0 - similarity,
                    chunk_index: row.get("chunk_index"),
                    total_chunks: row.get("total_chunks"),
                    repo,
                    branch,
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn document_chunks(&self, url: &str) -> Result<Vec<StoredChunk>> {
        let rows = sqlx::query(&format!(
            "SELECT content, url, section, chunk_index, total_chunks FROM {} WHERE url = ?",
            self.table
        ))
        .bind(url)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| StoredChunk {
                content: row.get("content"),
                url: row.get("url"),
                section: row.get("section"),
                chunk_index: row.get("chunk_index"),
                total_chunks: row.get("total_chunks"),
            })
            .collect())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
