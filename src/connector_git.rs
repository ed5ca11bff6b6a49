//! Git repository content and diff provider.
//!
//! Workflow:
//! 1. Determine a local cache directory for the clone
//!    (`cache_dir`, else `<store.dir>/.git-cache/<hash of url>`).
//! 2. Clone (shallow if configured) or fetch + hard reset to update.
//! 3. Walk files under the configured `root` subdirectory and chunk them,
//!    or only the files a diff reported as changed.
//!
//! Stored urls use `url_prefix` when configured. Otherwise GitHub and
//! GitLab remotes map to their browsable `blob/<branch>/` pages, and any
//! other remote falls back to the local path inside the clone.
//!
//! Incremental passes use [`DiffProvider`]: `git rev-parse HEAD` for the
//! current commit and `git diff --name-status <ref> HEAD` for changes.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use crate::chunk::DocumentContext;
use crate::config::SourceConfig;
use crate::connector_fs::FileScanner;
use crate::models::SourceDocument;
use crate::store::PathScope;
use crate::traits::{ContentProvider, DiffProvider, ObsolescenceScope};

pub struct GitProvider {
    name: String,
    url: String,
    branch: String,
    shallow: bool,
    cache_dir: PathBuf,
    scanner: FileScanner,
}

impl GitProvider {
    pub fn new(source: &SourceConfig, store_dir: &Path, max_tokens: usize) -> Result<Self> {
        let url = source
            .url
            .clone()
            .with_context(|| format!("git source '{}' requires url", source.name))?;

        let cache_dir = match &source.cache_dir {
            Some(dir) => dir.clone(),
            None => store_dir.join(".git-cache").join(short_hash(&url)),
        };

        let relative_root = PathScope::new(&source.root, None).root().to_string();
        let scan_root = if relative_root.is_empty() {
            cache_dir.clone()
        } else {
            cache_dir.join(&relative_root)
        };

        let rewrite = source
            .url_prefix
            .clone()
            .or_else(|| build_web_url(&url, &source.branch, &source.root));
        let scope = PathScope::new(&scan_root.to_string_lossy(), rewrite.as_deref());

        let context = DocumentContext {
            product_name: source.product_name.clone(),
            version: source.version.clone(),
            branch: Some(source.branch.clone()),
            repo: Some(source.repo_key().to_string()),
            url: String::new(),
        };

        Ok(Self {
            name: source.name.clone(),
            url,
            branch: source.branch.clone(),
            shallow: source.shallow,
            scanner: FileScanner::new(scan_root, scope, source, context, max_tokens)?,
            cache_dir,
        })
    }
}

#[async_trait]
impl ContentProvider for GitProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn prepare(&self) -> Result<()> {
        if self.cache_dir.join(".git").exists() {
            git_pull(&self.cache_dir, &self.branch).await
        } else {
            git_clone(&self.url, &self.branch, self.shallow, &self.cache_dir).await
        }
    }

    fn scope(&self) -> ObsolescenceScope {
        ObsolescenceScope::Files(self.scanner.scope.clone())
    }

    async fn scan(&self, only: Option<&BTreeSet<PathBuf>>) -> Result<Vec<SourceDocument>> {
        self.scanner.scan(only)
    }

    fn diff_provider(&self) -> Option<&dyn DiffProvider> {
        Some(self)
    }
}

#[async_trait]
impl DiffProvider for GitProvider {
    async fn head(&self) -> Result<String> {
        git_output(&self.cache_dir, &["rev-parse", "HEAD"])
            .await
            .map(|s| s.trim().to_string())
    }

    async fn diff_since(&self, since: &str) -> Result<String> {
        git_output(&self.cache_dir, &["diff", "--name-status", since, "HEAD"]).await
    }

    fn repo_root(&self) -> &Path {
        &self.cache_dir
    }

    fn branch(&self) -> &str {
        &self.branch
    }
}

async fn git_output(repo_dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_dir)
        .output()
        .await
        .with_context(|| format!("Failed to execute 'git {}'", args.join(" ")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git {} failed: {}", args.join(" "), stderr.trim());
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

async fn git_clone(url: &str, branch: &str, shallow: bool, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create cache directory: {}", dest.display()))?;

    let mut cmd = Command::new("git");
    cmd.args(["clone", "--branch", branch, "--single-branch"]);
    if shallow {
        cmd.args(["--depth", "1"]);
    }
    cmd.arg(url);
    cmd.arg(dest);

    let output = cmd
        .output()
        .await
        .with_context(|| "Failed to execute 'git clone'. Is git installed?")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git clone failed: {}", stderr.trim());
    }

    tracing::info!(url, branch, dest = %dest.display(), "cloned repository");
    Ok(())
}

async fn git_pull(repo_dir: &Path, branch: &str) -> Result<()> {
    git_output(repo_dir, &["fetch", "origin", branch]).await?;
    let remote_ref = format!("origin/{}", branch);
    git_output(repo_dir, &["reset", "--hard", &remote_ref]).await?;
    Ok(())
}

/// Browsable url prefix for files under `root` of a GitHub/GitLab remote.
///
/// Keyed by branch rather than commit so urls stay stable across runs.
pub fn build_web_url(repo_url: &str, branch: &str, root: &str) -> Option<String> {
    let base = if let Some(rest) = repo_url.strip_prefix("git@github.com:") {
        format!("https://github.com/{}/blob/{}", rest.trim_end_matches(".git"), branch)
    } else if let Some(rest) = repo_url.strip_prefix("git@gitlab.com:") {
        format!("https://gitlab.com/{}/-/blob/{}", rest.trim_end_matches(".git"), branch)
    } else if repo_url.starts_with("https://github.com/") {
        format!("{}/blob/{}", repo_url.trim_end_matches(".git"), branch)
    } else if repo_url.starts_with("https://gitlab.com/") {
        format!("{}/-/blob/{}", repo_url.trim_end_matches(".git"), branch)
    } else {
        return None;
    };

    let root = PathScope::new(root, None);
    if root.root().is_empty() {
        Some(base)
    } else {
        Some(format!("{}/{}", base, root.root()))
    }
}

fn short_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())[..12].to_string()
}
