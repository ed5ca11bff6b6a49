//! Paragraph-boundary text chunker with markdown heading tracking.
//!
//! Splits document text into [`Chunk`]s that respect a configurable
//! `max_tokens` limit. Splitting occurs on paragraph boundaries (`\n\n`)
//! to preserve semantic coherence within each chunk; a paragraph larger
//! than the limit is hard-split on the last newline or space that fits.
//!
//! Markdown ATX headings (`#`, `##`, ...) seen along the way maintain a
//! heading stack. Each chunk records the stack as it stood when the chunk
//! started, and its innermost heading as `section`.
//!
//! Chunk ids come from [`hash::chunk_id`](crate::hash::chunk_id), so the
//! same url and position always yield the same id.

use crate::hash::{chunk_id, content_hash};
use crate::models::{Chunk, ChunkMetadata};

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Provenance shared by every chunk of one document.
#[derive(Debug, Clone, Default)]
pub struct DocumentContext {
    pub product_name: String,
    pub version: String,
    pub branch: Option<String>,
    pub repo: Option<String>,
    pub url: String,
}

/// Split text into chunks on paragraph boundaries, respecting max_tokens.
///
/// Returns chunks with contiguous indices starting at 0; whitespace-only
/// text yields no chunks.
pub fn chunk_document(ctx: &DocumentContext, text: &str, max_tokens: usize) -> Vec<Chunk> {
    let pieces = split_text(text, max_tokens.max(1) * CHARS_PER_TOKEN);
    let total = pieces.len() as i64;

    pieces
        .into_iter()
        .enumerate()
        .map(|(i, (content, hierarchy))| Chunk {
            metadata: ChunkMetadata {
                product_name: ctx.product_name.clone(),
                version: ctx.version.clone(),
                branch: ctx.branch.clone(),
                repo: ctx.repo.clone(),
                section: hierarchy.last().cloned().unwrap_or_default(),
                heading_hierarchy: hierarchy,
                chunk_id: chunk_id(&ctx.url, i),
                url: ctx.url.clone(),
                hash: content_hash(&content),
                chunk_index: i as i64,
                total_chunks: total,
            },
            content,
        })
        .collect()
}

/// Text pieces paired with the heading stack at their start.
fn split_text(text: &str, max_chars: usize) -> Vec<(String, Vec<String>)> {
    let mut pieces = Vec::new();
    let mut headings: Vec<(usize, String)> = Vec::new();
    let mut current_buf = String::new();
    let mut current_headings: Vec<String> = Vec::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        // If adding this paragraph would exceed max, flush current buffer
        let would_be = if current_buf.is_empty() {
            trimmed.len()
        } else {
            current_buf.len() + 2 + trimmed.len()
        };
        if would_be > max_chars && !current_buf.is_empty() {
            pieces.push((std::mem::take(&mut current_buf), current_headings.clone()));
        }

        for line in trimmed.lines() {
            if let Some((level, title)) = parse_heading(line) {
                headings.retain(|(l, _)| *l < level);
                headings.push((level, title));
            }
        }
        let stack: Vec<String> = headings.iter().map(|(_, t)| t.clone()).collect();

        if trimmed.len() > max_chars {
            // Hard split at max_chars boundaries
            let mut remaining = trimmed;
            while !remaining.is_empty() {
                let split_at = split_point(remaining, max_chars);
                let piece = remaining[..split_at].trim();
                if !piece.is_empty() {
                    pieces.push((piece.to_string(), stack.clone()));
                }
                remaining = &remaining[split_at..];
            }
        } else {
            if current_buf.is_empty() {
                current_headings = stack;
            } else {
                current_buf.push_str("\n\n");
            }
            current_buf.push_str(trimmed);
        }
    }

    if !current_buf.is_empty() {
        pieces.push((current_buf, current_headings));
    }

    pieces
}

/// Byte offset to cut `text` at, preferring a newline or space boundary.
fn split_point(text: &str, max_chars: usize) -> usize {
    if text.len() <= max_chars {
        return text.len();
    }
    let mut limit = max_chars;
    while limit > 0 && !text.is_char_boundary(limit) {
        limit -= 1;
    }
    if limit == 0 {
        // a single character wider than the budget
        return text.chars().next().map(char::len_utf8).unwrap_or(text.len());
    }
    text[..limit]
        .rfind('\n')
        .or_else(|| text[..limit].rfind(' '))
        .map(|pos| pos + 1)
        .unwrap_or(limit)
}

/// `(level, title)` for an ATX heading line such as `## Install`.
fn parse_heading(line: &str) -> Option<(usize, String)> {
    let line = line.trim_start();
    let level = line.chars().take_while(|c| *c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &line[level..];
    if !rest.starts_with(' ') {
        return None;
    }
    let title = rest.trim().trim_end_matches('#').trim();
    if title.is_empty() {
        None
    } else {
        Some((level, title.to_string()))
    }
}
