//! Paragraph-boundary text chunker.
//!
//! Splits a page body into [`Chunk`]s of at most `max_tokens` (approximated
//! as four characters per token). Paragraphs (`\n\n`) are packed greedily;
//! a paragraph larger than the budget is cut on the last whitespace before
//! the limit. With `overlap_tokens > 0` each chunk after the first starts
//! with the tail of its predecessor so sentences cut at a boundary stay
//! searchable from both sides.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::Chunk;

const CHARS_PER_TOKEN: usize = 4;

/// Split `text` into chunks with contiguous indices starting at 0.
///
/// Always returns at least one chunk, even for empty input.
pub fn chunk_text(page_id: &str, text: &str, max_tokens: usize, overlap_tokens: usize) -> Vec<Chunk> {
    let max_chars = (max_tokens * CHARS_PER_TOKEN).max(1);
    let overlap_chars = (overlap_tokens * CHARS_PER_TOKEN).min(max_chars / 2);

    let pieces = pack_paragraphs(text, max_chars);
    if pieces.is_empty() {
        return vec![make_chunk(page_id, 0, text.trim())];
    }

    let mut chunks = Vec::with_capacity(pieces.len());
    let mut previous: Option<&str> = None;
    for (i, piece) in pieces.iter().enumerate() {
        let body = match previous {
            Some(prev) if overlap_chars > 0 => {
                let tail = tail_on_boundary(prev, overlap_chars);
                if tail.is_empty() {
                    piece.clone()
                } else {
                    format!("{} {}", tail, piece)
                }
            }
            _ => piece.clone(),
        };
        chunks.push(make_chunk(page_id, i as i64, &body));
        previous = Some(piece);
    }
    chunks
}

fn pack_paragraphs(text: &str, max_chars: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut buf = String::new();

    for para in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        let joined_len = if buf.is_empty() {
            para.len()
        } else {
            buf.len() + 2 + para.len()
        };
        if joined_len > max_chars && !buf.is_empty() {
            out.push(std::mem::take(&mut buf));
        }

        if para.len() > max_chars {
            if !buf.is_empty() {
                out.push(std::mem::take(&mut buf));
            }
            out.extend(hard_split(para, max_chars));
            continue;
        }

        if !buf.is_empty() {
            buf.push_str("\n\n");
        }
        buf.push_str(para);
    }

    if !buf.is_empty() {
        out.push(buf);
    }
    out
}

/// Cut an oversized paragraph on whitespace, never inside a UTF-8 sequence.
fn hard_split(para: &str, max_chars: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = para;
    while !rest.is_empty() {
        if rest.len() <= max_chars {
            out.push(rest.trim().to_string());
            break;
        }
        let mut limit = max_chars;
        while !rest.is_char_boundary(limit) {
            limit -= 1;
        }
        let cut = rest[..limit]
            .rfind(char::is_whitespace)
            .filter(|&pos| pos > 0)
            .unwrap_or(limit);
        let cut = if cut == 0 {
            rest.char_indices().nth(1).map(|(i, _)| i).unwrap_or(rest.len())
        } else {
            cut
        };
        let piece = rest[..cut].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        rest = rest[cut..].trim_start();
    }
    out
}

/// The last `n` bytes of `s`, advanced to the next word start.
fn tail_on_boundary(s: &str, n: usize) -> &str {
    if s.len() <= n {
        return s;
    }
    let mut start = s.len() - n;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    let tail = &s[start..];
    match tail.find(char::is_whitespace) {
        Some(pos) => tail[pos..].trim_start(),
        None => tail,
    }
}

fn make_chunk(page_id: &str, index: i64, text: &str) -> Chunk {
    Chunk {
        id: Uuid::new_v4().to_string(),
        page_id: page_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        hash: hash_text(text),
    }
}

pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
