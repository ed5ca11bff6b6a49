//! Content hashing and key derivation.
//!
//! Every identifier the index depends on is derived here so that repeated
//! runs over the same input produce the same ids, hashes and keys:
//!
//! - [`content_hash`]: SHA-256 of chunk text, used for change detection.
//! - [`chunk_id`]: stable id for a chunk at a given position of a document.
//! - [`normalize_key`]: collapses non-alphanumeric runs for metadata keys.
//! - [`last_run_key`] / [`last_sha_key`]: watermark key formats.

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 digest of `content`.
///
/// Depends only on the text, never on the chunk's identity, so a chunk that
/// keeps its id but gets a different hash has changed content.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Deterministic chunk id for the chunk at `position` within `url`.
pub fn chunk_id(url: &str, position: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update(b"#");
    hasher.update(position.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Collapse every run of non-alphanumeric characters into one `_`.
///
/// ```rust
/// use docsync::hash::normalize_key;
///
/// assert_eq!(normalize_key("org/my-repo"), "org_my_repo");
/// assert_eq!(normalize_key("feature//x--y"), "feature_x_y");
/// ```
pub fn normalize_key(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_run = false;
    for ch in input.chars() {
        if ch.is_alphanumeric() {
            out.push(ch);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    out
}

/// Metadata key for the last successful run of a repository or source.
pub fn last_run_key(repo: &str) -> String {
    format!("last_run_{}", normalize_key(repo))
}

/// Metadata key for the last processed commit of a repository branch.
pub fn last_sha_key(repo: &str, branch: &str) -> String {
    format!(
        "code_last_sha_{}_{}",
        normalize_key(repo),
        normalize_key(branch)
    )
}

/// Collection (or database file stem) for a product and version.
pub fn collection_name(product_name: &str, version: &str) -> String {
    normalize_key(&format!("{}_{}", product_name.trim(), version.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_deterministic() {
        let a = content_hash("hello world");
        let b = content_hash("hello world");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, content_hash("hello world!"));
    }

    #[test]
    fn test_chunk_id_depends_on_position_and_url() {
        let a = chunk_id("https://docs.example.com/a", 0);
        assert_eq!(a, chunk_id("https://docs.example.com/a", 0));
        assert_ne!(a, chunk_id("https://docs.example.com/a", 1));
        assert_ne!(a, chunk_id("https://docs.example.com/b", 0));
    }

    #[test]
    fn test_normalize_key_collapses_runs() {
        assert_eq!(normalize_key("a..b//c"), "a_b_c");
        assert_eq!(normalize_key("plain"), "plain");
        assert_eq!(normalize_key("-lead"), "_lead");
    }

    #[test]
    fn test_watermark_keys() {
        assert_eq!(last_run_key("acme/widgets"), "last_run_acme_widgets");
        assert_eq!(
            last_sha_key("acme/widgets", "release/2.x"),
            "code_last_sha_acme_widgets_release_2_x"
        );
    }

    #[test]
    fn test_collection_name() {
        assert_eq!(collection_name("Acme Docs", "1.2"), "Acme_Docs_1_2");
    }
}
