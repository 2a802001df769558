//! Index building: export → pages → chunks → vectors.
//!
//! Registered exports are rescanned on every build. Pages are stored per
//! export, so two exports carrying the same Notion id are kept apart rather
//! than overwriting each other. A page is rewritten only
//! when its content hash changes, pages that disappeared from an export are
//! dropped, and chunks without a vector for the current model are embedded
//! afterwards. Embedding failures are non-fatal: the affected chunks stay
//! keyword-searchable and are retried on the next build.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::archive::NotionArchive;
use crate::chunk::{chunk_text, hash_text};
use crate::config::Config;
use crate::embedding::{self, EmbeddingProvider};
use crate::models::{Chunk, NotionPage};
use crate::notion;

/// Counters from one [`build_index`] run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildReport {
    pub exports: usize,
    pub pages_seen: u64,
    pub pages_updated: u64,
    pub pages_unchanged: u64,
    pub pages_removed: u64,
    pub chunks_written: u64,
    pub embeddings_written: u64,
    pub embeddings_pending: u64,
}

/// Record an export directory. Returns its canonical path.
pub async fn register_export(pool: &SqlitePool, path: &Path) -> Result<PathBuf> {
    if !path.exists() {
        anyhow::bail!("Export path does not exist: {}", path.display());
    }
    if !path.is_dir() {
        anyhow::bail!("Export path is not a directory: {}", path.display());
    }
    let canonical = path
        .canonicalize()
        .with_context(|| format!("Failed to resolve export path: {}", path.display()))?;

    sqlx::query("INSERT INTO exports (path, added_at) VALUES (?, ?) ON CONFLICT(path) DO NOTHING")
        .bind(canonical.to_string_lossy().to_string())
        .bind(chrono::Utc::now().timestamp())
        .execute(pool)
        .await?;

    info!(path = %canonical.display(), "registered export");
    Ok(canonical)
}

pub async fn list_exports(pool: &SqlitePool) -> Result<Vec<PathBuf>> {
    let rows: Vec<String> = sqlx::query_scalar("SELECT path FROM exports ORDER BY path")
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(PathBuf::from).collect())
}

pub async fn build_index(
    pool: &SqlitePool,
    config: &Config,
    provider: &dyn EmbeddingProvider,
) -> Result<BuildReport> {
    let exports = list_exports(pool).await?;
    let mut report = BuildReport {
        exports: exports.len(),
        ..Default::default()
    };

    for export in &exports {
        let pages = notion::scan_export(export)
            .with_context(|| format!("Failed to scan export: {}", export.display()))?;
        let export_key = export.to_string_lossy().to_string();
        let mut seen = HashSet::new();

        for page in &pages {
            report.pages_seen += 1;
            let key = page_key(&export_key, &page.page_id);
            seen.insert(key.clone());

            let hash = page_hash(page);
            let existing: Option<String> = sqlx::query_scalar("SELECT hash FROM pages WHERE id = ?")
                .bind(&key)
                .fetch_optional(pool)
                .await?;
            if existing.as_deref() == Some(hash.as_str()) {
                report.pages_unchanged += 1;
                continue;
            }

            upsert_page(pool, &key, &export_key, page, &hash).await?;
            let chunks = chunk_text(
                &key,
                &page.body,
                config.chunking.max_tokens,
                config.chunking.overlap_tokens,
            );
            replace_chunks(pool, &key, &chunks).await?;
            report.pages_updated += 1;
            report.chunks_written += chunks.len() as u64;
        }

        report.pages_removed += remove_missing_pages(pool, &export_key, &seen).await?;
    }

    if config.embedding.is_enabled() {
        let (written, pending) = embed_pending(pool, config, provider).await?;
        report.embeddings_written = written;
        report.embeddings_pending = pending;
    }

    info!(
        pages = report.pages_seen,
        updated = report.pages_updated,
        removed = report.pages_removed,
        "index built"
    );
    Ok(report)
}

/// `notion-archive build`: register an export (optional) and rebuild the index.
pub async fn run_build(archive: &NotionArchive, export: Option<&Path>) -> Result<BuildReport> {
    if let Some(path) = export {
        let canonical = archive.add_export(path).await?;
        println!("export {}", canonical.display());
    }
    let report = archive.build_index().await?;

    println!("build");
    println!("  exports: {}", report.exports);
    println!("  pages: {}", report.pages_seen);
    println!("  updated: {}", report.pages_updated);
    println!("  unchanged: {}", report.pages_unchanged);
    println!("  removed: {}", report.pages_removed);
    println!("  chunks written: {}", report.chunks_written);
    if archive.config().embedding.is_enabled() {
        println!("  embeddings written: {}", report.embeddings_written);
        println!("  embeddings pending: {}", report.embeddings_pending);
    }
    println!("ok");
    Ok(report)
}

/// Storage key of a page: the Notion id scoped by a short hash of its export.
fn page_key(export_key: &str, notion_id: &str) -> String {
    format!("{}-{}", &hash_text(export_key)[..12], notion_id)
}

fn page_hash(page: &NotionPage) -> String {
    let mut material = String::new();
    material.push_str(page.title.as_deref().unwrap_or(""));
    material.push('\u{1f}');
    material.push_str(&page.workspace);
    material.push('\u{1f}');
    material.push_str(&page.tags.join("\u{1e}"));
    material.push('\u{1f}');
    material.push_str(&page.body);
    hash_text(&material)
}

async fn upsert_page(
    pool: &SqlitePool,
    key: &str,
    export_key: &str,
    page: &NotionPage,
    hash: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO pages (id, notion_id, export_path, path, title, workspace, tags_json, body, modified_at, hash)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            notion_id = excluded.notion_id,
            export_path = excluded.export_path,
            path = excluded.path,
            title = excluded.title,
            workspace = excluded.workspace,
            tags_json = excluded.tags_json,
            body = excluded.body,
            modified_at = excluded.modified_at,
            hash = excluded.hash
        "#,
    )
    .bind(key)
    .bind(&page.page_id)
    .bind(export_key)
    .bind(page.path.to_string_lossy().to_string())
    .bind(&page.title)
    .bind(&page.workspace)
    .bind(serde_json::to_string(&page.tags)?)
    .bind(&page.body)
    .bind(page.modified_at)
    .bind(hash)
    .execute(pool)
    .await?;
    Ok(())
}

async fn replace_chunks(pool: &SqlitePool, page_id: &str, chunks: &[Chunk]) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM chunk_vectors WHERE page_id = ?")
        .bind(page_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM chunks_fts WHERE page_id = ?")
        .bind(page_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM chunks WHERE page_id = ?")
        .bind(page_id)
        .execute(&mut *tx)
        .await?;

    for chunk in chunks {
        sqlx::query("INSERT INTO chunks (id, page_id, chunk_index, text, hash) VALUES (?, ?, ?, ?, ?)")
            .bind(&chunk.id)
            .bind(&chunk.page_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .execute(&mut *tx)
            .await?;

        sqlx::query("INSERT INTO chunks_fts (chunk_id, page_id, text) VALUES (?, ?, ?)")
            .bind(&chunk.id)
            .bind(&chunk.page_id)
            .bind(&chunk.text)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}

async fn remove_missing_pages(
    pool: &SqlitePool,
    export_key: &str,
    seen: &HashSet<String>,
) -> Result<u64> {
    let stored: Vec<String> = sqlx::query_scalar("SELECT id FROM pages WHERE export_path = ?")
        .bind(export_key)
        .fetch_all(pool)
        .await?;

    let mut removed = 0;
    for id in stored.iter().filter(|id| !seen.contains(*id)) {
        replace_chunks(pool, id, &[]).await?;
        sqlx::query("DELETE FROM pages WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;
        removed += 1;
    }
    Ok(removed)
}

struct PendingChunk {
    chunk_id: String,
    page_id: String,
    text: String,
    hash: String,
}

/// Embed every chunk lacking a current vector for the provider's model.
/// Returns `(written, still_pending)`.
pub async fn embed_pending(
    pool: &SqlitePool,
    config: &Config,
    provider: &dyn EmbeddingProvider,
) -> Result<(u64, u64)> {
    let model = provider.model_name().to_string();
    let rows = sqlx::query(
        r#"
        SELECT c.id AS chunk_id, c.page_id, c.text, c.hash
        FROM chunks c
        LEFT JOIN chunk_vectors v ON v.chunk_id = c.id AND v.model = ?
        WHERE v.chunk_id IS NULL OR v.hash != c.hash
        ORDER BY c.page_id, c.chunk_index
        "#,
    )
    .bind(&model)
    .fetch_all(pool)
    .await?;

    let pending: Vec<PendingChunk> = rows
        .iter()
        .map(|row| PendingChunk {
            chunk_id: row.get("chunk_id"),
            page_id: row.get("page_id"),
            text: row.get("text"),
            hash: row.get("hash"),
        })
        .collect();

    let mut written = 0u64;
    let mut failed = 0u64;
    for batch in pending.chunks(config.embedding.batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();
        match provider.embed(&texts).await {
            Ok(vectors) => {
                if vectors.len() != batch.len() {
                    warn!(
                        sent = batch.len(),
                        received = vectors.len(),
                        "embedding count does not match batch"
                    );
                }
                for (item, vec) in batch.iter().zip(vectors.iter()) {
                    upsert_vector(pool, item, &model, vec).await?;
                    written += 1;
                }
                failed += batch.len().saturating_sub(vectors.len()) as u64;
            }
            Err(e) => {
                warn!(error = %e, batch = batch.len(), "embedding batch failed");
                failed += batch.len() as u64;
            }
        }
    }

    Ok((written, failed))
}

async fn upsert_vector(pool: &SqlitePool, item: &PendingChunk, model: &str, vec: &[f32]) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO chunk_vectors (chunk_id, page_id, model, dims, hash, embedding)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(chunk_id) DO UPDATE SET
            page_id = excluded.page_id,
            model = excluded.model,
            dims = excluded.dims,
            hash = excluded.hash,
            embedding = excluded.embedding
        "#,
    )
    .bind(&item.chunk_id)
    .bind(&item.page_id)
    .bind(model)
    .bind(vec.len() as i64)
    .bind(&item.hash)
    .bind(embedding::vec_to_blob(vec))
    .execute(pool)
    .await?;
    Ok(())
}
