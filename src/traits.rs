//! Collaborator traits consumed by the sync engine.
//!
//! The engine never fetches content itself. It pulls already-chunked
//! documents from a [`ContentProvider`] and, for version-controlled
//! sources, asks a [`DiffProvider`] what changed since the last recorded
//! commit.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │            ContentProvider               │
//! │  ┌───────────┐ ┌──────────┐ ┌─────────┐ │
//! │  │ Directory │ │   Git    │ │ Custom  │ │
//! │  │ (walkdir) │ │ (+ diff) │ │ (Rust)  │ │
//! │  └───────────┘ └──────────┘ └─────────┘ │
//! └──────────────┬───────────────────────────┘
//!                ▼
//!        SyncEngine::sync() → IndexStore
//! ```
//!
//! Built-in providers live in [`connector_fs`](crate::connector_fs) and
//! [`connector_git`](crate::connector_git). A crawler or ticketing
//! integration plugs in by implementing [`ContentProvider`] with an
//! [`ObsolescenceScope::UrlPrefix`] scope.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::models::SourceDocument;
use crate::store::PathScope;

/// Where a provider's records live, for obsolescence deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObsolescenceScope {
    /// Records addressed by url; every stored url with this prefix belongs
    /// to the provider.
    UrlPrefix(String),
    /// Records addressed by local file path (directly or rewritten).
    Files(PathScope),
}

/// A source of chunked documents.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use anyhow::Result;
/// use std::collections::BTreeSet;
/// use std::path::PathBuf;
/// use docsync::models::SourceDocument;
/// use docsync::traits::{ContentProvider, ObsolescenceScope};
///
/// pub struct StaticPages;
///
/// #[async_trait]
/// impl ContentProvider for StaticPages {
///     fn name(&self) -> &str { "static" }
///
///     fn scope(&self) -> ObsolescenceScope {
///         ObsolescenceScope::UrlPrefix("https://example.com/".to_string())
///     }
///
///     async fn scan(&self, _only: Option<&BTreeSet<PathBuf>>) -> Result<Vec<SourceDocument>> {
///         Ok(vec![])
///     }
/// }
/// ```
#[async_trait]
pub trait ContentProvider: Send + Sync {
    /// Source name, used in logs and the run summary.
    fn name(&self) -> &str;

    /// Fetch or refresh content before scanning (clone, pull, login).
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    fn scope(&self) -> ObsolescenceScope;

    /// Produce documents.
    ///
    /// With `only`, restrict the scan to those local paths; paths outside
    /// the provider's root or filters are ignored.
    async fn scan(&self, only: Option<&BTreeSet<PathBuf>>) -> Result<Vec<SourceDocument>>;

    /// Diff support for incremental passes, if the source is versioned.
    fn diff_provider(&self) -> Option<&dyn DiffProvider> {
        None
    }
}

/// Change listing for a version-controlled source.
#[async_trait]
pub trait DiffProvider: Send + Sync {
    /// Current commit reference.
    async fn head(&self) -> Result<String>;

    /// Raw tab-separated name-status lines between `since` and HEAD.
    async fn diff_since(&self, since: &str) -> Result<String>;

    /// Directory that diff paths are relative to.
    fn repo_root(&self) -> &Path;

    /// Branch the watermark is recorded for.
    fn branch(&self) -> &str;
}
