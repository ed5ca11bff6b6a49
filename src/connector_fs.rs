//! Local directory content provider.
//!
//! Walks a directory with `walkdir`, keeps files matching the include globs
//! and not matching the exclude globs (plus built-in excludes for `.git`,
//! `target` and `node_modules`), and chunks each file into a
//! [`SourceDocument`].
//!
//! Stored urls come from the source's [`PathScope`]: the external
//! `url_prefix` when configured, otherwise the file path itself. A root of
//! `.` without a prefix is canonicalized so obsolescence deletion always
//! has a non-empty scope.

use anyhow::{bail, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::chunk::{chunk_document, DocumentContext};
use crate::config::SourceConfig;
use crate::models::SourceDocument;
use crate::store::PathScope;
use crate::traits::{ContentProvider, ObsolescenceScope};

const DEFAULT_EXCLUDES: &[&str] = &["**/.git/**", "**/target/**", "**/node_modules/**"];

/// Walks one directory tree and chunks matching files.
pub struct FileScanner {
    pub root: PathBuf,
    pub scope: PathScope,
    include: GlobSet,
    exclude: GlobSet,
    follow_symlinks: bool,
    max_tokens: usize,
    context: DocumentContext,
}

impl FileScanner {
    /// `context.url` is ignored; each file gets its own.
    pub fn new(
        root: PathBuf,
        scope: PathScope,
        source: &SourceConfig,
        context: DocumentContext,
        max_tokens: usize,
    ) -> Result<Self> {
        let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        excludes.extend(source.exclude_globs.clone());
        Ok(Self {
            root,
            scope,
            include: build_globset(&source.include_globs)?,
            exclude: build_globset(&excludes)?,
            follow_symlinks: source.follow_symlinks,
            max_tokens,
            context,
        })
    }

    fn accepts(&self, relative: &str) -> bool {
        !self.exclude.is_match(relative) && self.include.is_match(relative)
    }

    /// Chunk every matching file, or only those in `only`.
    pub fn scan(&self, only: Option<&BTreeSet<PathBuf>>) -> Result<Vec<SourceDocument>> {
        if !self.root.exists() {
            bail!("source root does not exist: {}", self.root.display());
        }

        let mut paths = Vec::new();
        match only {
            Some(only) => {
                for path in only {
                    if path.is_file() && path.starts_with(&self.root) {
                        paths.push(path.clone());
                    }
                }
            }
            None => {
                let walker = WalkDir::new(&self.root).follow_links(self.follow_symlinks);
                for entry in walker {
                    let entry = entry?;
                    if entry.file_type().is_file() {
                        paths.push(entry.into_path());
                    }
                }
            }
        }

        let mut docs = Vec::new();
        for path in paths {
            let relative = path.strip_prefix(&self.root).unwrap_or(&path);
            let rel_str = relative.to_string_lossy().replace('\\', "/");
            if !self.accepts(&rel_str) {
                continue;
            }
            if let Some(doc) = self.file_document(&path)? {
                docs.push(doc);
            }
        }

        // Sort for deterministic ordering
        docs.sort_by(|a, b| a.url.cmp(&b.url));
        Ok(docs)
    }

    fn file_document(&self, path: &Path) -> Result<Option<SourceDocument>> {
        let path_str = path.to_string_lossy().to_string();
        let Some(url) = self.scope.url_for(&path_str) else {
            tracing::warn!(path = %path_str, "file outside source scope; skipping");
            return Ok(None);
        };

        let body = match std::fs::read_to_string(path) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(path = %path_str, error = %e, "unreadable file; skipping");
                return Ok(None);
            }
        };

        let context = DocumentContext {
            url: url.clone(),
            ..self.context.clone()
        };
        Ok(Some(SourceDocument {
            url,
            path: Some(path_str),
            chunks: chunk_document(&context, &body, self.max_tokens),
        }))
    }
}

/// Content provider over a local directory.
pub struct DirectoryProvider {
    name: String,
    scanner: FileScanner,
}

impl DirectoryProvider {
    pub fn new(source: &SourceConfig, max_tokens: usize) -> Result<Self> {
        let mut root = PathBuf::from(&source.root);
        let direct_cwd = source.url_prefix.is_none()
            && PathScope::new(&source.root, None).root().is_empty();
        if direct_cwd {
            root = root.canonicalize()?;
        }

        let scope = PathScope::new(&root.to_string_lossy(), source.url_prefix.as_deref());
        let context = DocumentContext {
            product_name: source.product_name.clone(),
            version: source.version.clone(),
            branch: None,
            repo: source.repo.clone(),
            url: String::new(),
        };

        Ok(Self {
            name: source.name.clone(),
            scanner: FileScanner::new(root, scope, source, context, max_tokens)?,
        })
    }
}

#[async_trait]
impl ContentProvider for DirectoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn scope(&self) -> ObsolescenceScope {
        ObsolescenceScope::Files(self.scanner.scope.clone())
    }

    async fn scan(&self, only: Option<&BTreeSet<PathBuf>>) -> Result<Vec<SourceDocument>> {
        self.scanner.scan(only)
    }
}

pub fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceKind;
    use tempfile::TempDir;

    fn source(root: &Path, url_prefix: Option<&str>) -> SourceConfig {
        SourceConfig {
            name: "docs".to_string(),
            kind: SourceKind::Directory,
            product_name: "acme".to_string(),
            version: "1".to_string(),
            collection: None,
            root: root.to_string_lossy().to_string(),
            url_prefix: url_prefix.map(str::to_string),
            include_globs: vec!["**/*.md".to_string()],
            exclude_globs: vec!["drafts/**".to_string()],
            follow_symlinks: false,
            url: None,
            branch: "main".to_string(),
            repo: None,
            shallow: false,
            cache_dir: None,
        }
    }

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    #[tokio::test]
    async fn test_scan_applies_globs_and_prefix() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "guide/intro.md", "# Intro\n\nWelcome.");
        write(tmp.path(), "notes.txt", "ignored");
        write(tmp.path(), "drafts/wip.md", "ignored");

        let provider =
            DirectoryProvider::new(&source(tmp.path(), Some("https://docs.acme.dev/")), 700)
                .unwrap();
        let docs = provider.scan(None).await.unwrap();

        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].url, "https://docs.acme.dev/guide/intro.md");
        assert_eq!(docs[0].chunks[0].metadata.product_name, "acme");
        assert_eq!(docs[0].chunks[0].metadata.section, "Intro");
    }

    #[tokio::test]
    async fn test_scan_only_restricts_paths() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.md", "alpha");
        write(tmp.path(), "b.md", "beta");

        let provider = DirectoryProvider::new(&source(tmp.path(), None), 700).unwrap();
        let only: BTreeSet<PathBuf> = [tmp.path().join("b.md"), tmp.path().join("gone.md")]
            .into_iter()
            .collect();
        let docs = provider.scan(Some(&only)).await.unwrap();

        assert_eq!(docs.len(), 1);
        assert!(docs[0].url.ends_with("b.md"));
        assert_eq!(docs[0].path.as_deref(), Some(docs[0].url.as_str()));
    }
}
