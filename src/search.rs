//! Keyword, semantic, and hybrid chunk search.
//!
//! Keyword candidates come from FTS5 (bm25), semantic candidates from cosine
//! similarity against every stored vector of the active model. Each channel
//! is min-max normalized to `[0, 1]` and merged per chunk as
//! `(1 - α)·keyword + α·vector`, with `α` forced to 0 or 1 in the
//! single-channel modes. Results are ordered by score (desc), then page id,
//! then chunk index, so equal inputs always produce equal output.

use anyhow::{bail, Result};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::archive::NotionArchive;
use crate::config::Config;
use crate::embedding::{self, EmbeddingProvider};
use crate::models::{SearchFilters, SearchResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Keyword,
    Semantic,
    Hybrid,
}

impl SearchMode {
    /// Hybrid when embeddings are configured, keyword otherwise.
    pub fn default_for(config: &Config) -> Self {
        if config.embedding.is_enabled() {
            SearchMode::Hybrid
        } else {
            SearchMode::Keyword
        }
    }

    fn alpha(self, hybrid_alpha: f64) -> f64 {
        match self {
            SearchMode::Keyword => 0.0,
            SearchMode::Semantic => 1.0,
            SearchMode::Hybrid => hybrid_alpha,
        }
    }

    fn uses_keyword(self) -> bool {
        self != SearchMode::Semantic
    }

    fn uses_vectors(self) -> bool {
        self != SearchMode::Keyword
    }
}

impl FromStr for SearchMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "keyword" => Ok(SearchMode::Keyword),
            "semantic" => Ok(SearchMode::Semantic),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => bail!(
                "Unknown search mode: {}. Use keyword, semantic, or hybrid.",
                other
            ),
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SearchMode::Keyword => "keyword",
            SearchMode::Semantic => "semantic",
            SearchMode::Hybrid => "hybrid",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
struct ChunkCandidate {
    chunk_id: String,
    page_id: String,
    chunk_index: i64,
    text: String,
    raw_score: f64,
}

#[derive(Debug, Clone)]
struct PageMeta {
    notion_id: String,
    title: Option<String>,
    workspace: String,
    tags: Vec<String>,
}

pub async fn search_chunks(
    pool: &SqlitePool,
    config: &Config,
    provider: &dyn EmbeddingProvider,
    query: &str,
    limit: usize,
    filters: &SearchFilters,
    mode: SearchMode,
) -> Result<Vec<SearchResult>> {
    if query.trim().is_empty() || limit == 0 {
        return Ok(Vec::new());
    }
    if mode.uses_vectors() && !config.embedding.is_enabled() {
        bail!(
            "Mode '{}' requires embeddings. Set [embedding] provider in config.",
            mode
        );
    }

    // Filtering happens after retrieval, so lift the candidate cap when filtering.
    let candidate_k = if filters.is_empty() {
        config.retrieval.candidate_k.max(limit as i64)
    } else {
        -1
    };

    let keyword = if mode.uses_keyword() {
        fetch_keyword_candidates(pool, query, candidate_k).await?
    } else {
        Vec::new()
    };
    let vector = if mode.uses_vectors() {
        fetch_vector_candidates(pool, provider, query, candidate_k).await?
    } else {
        Vec::new()
    };

    let alpha = mode.alpha(config.retrieval.hybrid_alpha);
    let merged = merge_candidates(&keyword, &vector, alpha);

    let mut metas: HashMap<String, Option<PageMeta>> = HashMap::new();
    let mut results = Vec::new();
    for (cand, score) in merged {
        if !metas.contains_key(&cand.page_id) {
            let meta = fetch_page_meta(pool, &cand.page_id).await?;
            metas.insert(cand.page_id.clone(), meta);
        }
        let Some(Some(meta)) = metas.get(&cand.page_id) else {
            continue;
        };
        if !filters.matches(&meta.workspace, &meta.tags) {
            continue;
        }
        results.push(SearchResult {
            content: cand.text.clone(),
            title: meta.title.clone(),
            score,
            workspace: meta.workspace.clone(),
            tags: meta.tags.clone(),
            page_id: meta.notion_id.clone(),
            chunk_index: cand.chunk_index,
        });
    }

    sort_results(&mut results);
    results.truncate(limit);
    Ok(results)
}

fn sort_results(results: &mut [SearchResult]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.page_id.cmp(&b.page_id))
            .then_with(|| a.chunk_index.cmp(&b.chunk_index))
    });
}

/// Turn free text into an FTS5 query: every word quoted, OR-ed together.
pub fn fts_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect();
    (!terms.is_empty()).then(|| terms.join(" OR "))
}

async fn fetch_keyword_candidates(
    pool: &SqlitePool,
    query: &str,
    candidate_k: i64,
) -> Result<Vec<ChunkCandidate>> {
    let Some(fts) = fts_query(query) else {
        return Ok(Vec::new());
    };

    let rows = sqlx::query(
        r#"
        SELECT chunks_fts.chunk_id AS chunk_id, chunks_fts.page_id AS page_id,
               chunks_fts.rank AS rank, c.chunk_index AS chunk_index, c.text AS text
        FROM chunks_fts
        JOIN chunks c ON c.id = chunks_fts.chunk_id
        WHERE chunks_fts MATCH ?
        ORDER BY chunks_fts.rank
        LIMIT ?
        "#,
    )
    .bind(fts)
    .bind(candidate_k)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let rank: f64 = row.get("rank");
            ChunkCandidate {
                chunk_id: row.get("chunk_id"),
                page_id: row.get("page_id"),
                chunk_index: row.get("chunk_index"),
                text: row.get("text"),
                // bm25 rank is lower-is-better
                raw_score: -rank,
            }
        })
        .collect())
}

async fn fetch_vector_candidates(
    pool: &SqlitePool,
    provider: &dyn EmbeddingProvider,
    query: &str,
    candidate_k: i64,
) -> Result<Vec<ChunkCandidate>> {
    let query_vec = embedding::embed_query(provider, query).await?;

    let rows = sqlx::query(
        r#"
        SELECT v.chunk_id, v.page_id, v.embedding, c.chunk_index, c.text
        FROM chunk_vectors v
        JOIN chunks c ON c.id = v.chunk_id
        WHERE v.model = ?
        "#,
    )
    .bind(provider.model_name())
    .fetch_all(pool)
    .await?;

    let mut candidates: Vec<ChunkCandidate> = rows
        .iter()
        .map(|row| {
            let blob: Vec<u8> = row.get("embedding");
            let vec = embedding::blob_to_vec(&blob);
            ChunkCandidate {
                chunk_id: row.get("chunk_id"),
                page_id: row.get("page_id"),
                chunk_index: row.get("chunk_index"),
                text: row.get("text"),
                raw_score: embedding::cosine_similarity(&query_vec, &vec) as f64,
            }
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    if candidate_k >= 0 {
        candidates.truncate(candidate_k as usize);
    }
    Ok(candidates)
}

async fn fetch_page_meta(pool: &SqlitePool, page_id: &str) -> Result<Option<PageMeta>> {
    let row =
        sqlx::query("SELECT notion_id, title, workspace, tags_json FROM pages WHERE id = ?")
            .bind(page_id)
            .fetch_optional(pool)
            .await?;

    Ok(row.map(|row| {
        let tags_json: String = row.get("tags_json");
        PageMeta {
            notion_id: row.get("notion_id"),
            title: row.get("title"),
            workspace: row.get("workspace"),
            tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        }
    }))
}

/// Union both channels per chunk with the weighted, normalized score.
fn merge_candidates(
    keyword: &[ChunkCandidate],
    vector: &[ChunkCandidate],
    alpha: f64,
) -> Vec<(ChunkCandidate, f64)> {
    let kw: HashMap<&str, f64> = normalize_scores(keyword)
        .into_iter()
        .map(|(c, s)| (c.chunk_id.as_str(), s))
        .collect();
    let vec: HashMap<&str, f64> = normalize_scores(vector)
        .into_iter()
        .map(|(c, s)| (c.chunk_id.as_str(), s))
        .collect();

    let mut seen = HashMap::new();
    for c in keyword.iter().chain(vector.iter()) {
        seen.entry(c.chunk_id.as_str()).or_insert(c);
    }

    seen.into_iter()
        .map(|(id, cand)| {
            let k = kw.get(id).copied().unwrap_or(0.0);
            let v = vec.get(id).copied().unwrap_or(0.0);
            (cand.clone(), (1.0 - alpha) * k + alpha * v)
        })
        .collect()
}

/// Min-max normalize raw scores to `[0, 1]`; all-equal inputs map to 1.0.
fn normalize_scores(candidates: &[ChunkCandidate]) -> Vec<(&ChunkCandidate, f64)> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let s_min = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - s_min) / (s_max - s_min)
            };
            (c, norm)
        })
        .collect()
}

/// Characters of chunk text shown per result by `notion-archive search`.
const EXCERPT_CHARS: usize = 200;

/// Run a search from the CLI and print the results.
pub async fn run_search(
    archive: &NotionArchive,
    query: &str,
    limit: Option<usize>,
    filters: &SearchFilters,
    mode: Option<SearchMode>,
) -> Result<()> {
    let limit = limit.unwrap_or(archive.config().retrieval.default_limit);
    let mode = mode.unwrap_or_else(|| SearchMode::default_for(archive.config()));
    let results = archive.search_with_mode(query, limit, filters, mode).await?;

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, result) in results.iter().enumerate() {
        println!(
            "{}. [{:.2}] {} / {}",
            i + 1,
            result.score,
            result.workspace,
            result.title.as_deref().unwrap_or("(untitled)")
        );
        if !result.tags.is_empty() {
            println!("    tags: {}", result.tags.join(", "));
        }
        println!("    excerpt: \"{}\"", excerpt(&result.content));
        println!("    page: {} #{}", result.page_id, result.chunk_index);
        println!();
    }
    Ok(())
}

fn excerpt(text: &str) -> String {
    let flat = text.replace('\n', " ");
    let flat = flat.trim();
    if flat.chars().count() <= EXCERPT_CHARS {
        return flat.to_string();
    }
    let cut: String = flat.chars().take(EXCERPT_CHARS).collect();
    format!("{}...", cut.trim_end())
}
