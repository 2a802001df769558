//! The archive store: one SQLite database holding every indexed export.
//!
//! [`NotionArchive`] ties the pieces together (connection, migrations,
//! export registry, index build, search, stats). Consumers that only need
//! retrieval depend on the narrow [`Archive`] trait instead, which is what
//! the deep-research orchestrator takes.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::db;
use crate::embedding::{self, EmbeddingProvider};
use crate::ingest::{self, BuildReport};
use crate::migrate;
use crate::models::{ArchiveStats, SearchFilters, SearchResult};
use crate::search::{self, SearchMode};

/// Read-only retrieval over an archive.
#[async_trait]
pub trait Archive: Send + Sync {
    /// Best-matching records for `query`, best first, at most `limit`.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>>;
}

pub struct NotionArchive {
    pool: SqlitePool,
    config: Config,
    provider: Box<dyn EmbeddingProvider>,
}

impl NotionArchive {
    /// Open the database named by `config.db.path`, creating and migrating it
    /// if needed.
    pub async fn open(config: Config) -> Result<Self> {
        let provider = embedding::create_provider(&config.embedding)?;
        Self::open_with_provider(config, provider).await
    }

    pub async fn open_with_provider(
        config: Config,
        provider: Box<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let pool = db::connect(&config.db.path).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self {
            pool,
            config,
            provider,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn add_export(&self, path: &Path) -> Result<PathBuf> {
        ingest::register_export(&self.pool, path).await
    }

    pub async fn exports(&self) -> Result<Vec<PathBuf>> {
        ingest::list_exports(&self.pool).await
    }

    pub async fn build_index(&self) -> Result<BuildReport> {
        ingest::build_index(&self.pool, &self.config, self.provider.as_ref()).await
    }

    /// Search with the mode implied by the embedding configuration.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchResult>> {
        let mode = SearchMode::default_for(&self.config);
        self.search_with_mode(query, limit, filters, mode).await
    }

    pub async fn search_with_mode(
        &self,
        query: &str,
        limit: usize,
        filters: &SearchFilters,
        mode: SearchMode,
    ) -> Result<Vec<SearchResult>> {
        search::search_chunks(
            &self.pool,
            &self.config,
            self.provider.as_ref(),
            query,
            limit,
            filters,
            mode,
        )
        .await
    }

    pub async fn get_stats(&self) -> Result<ArchiveStats> {
        let total_documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pages")
            .fetch_one(&self.pool)
            .await?;
        let total_chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;

        let workspaces: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT workspace FROM pages ORDER BY workspace")
                .fetch_all(&self.pool)
                .await?;

        let tag_rows: Vec<String> = sqlx::query_scalar("SELECT tags_json FROM pages")
            .fetch_all(&self.pool)
            .await?;
        let mut tags = std::collections::BTreeSet::new();
        for raw in &tag_rows {
            let page_tags: Vec<String> = serde_json::from_str(raw).unwrap_or_default();
            tags.extend(page_tags);
        }

        // Most recently written model wins when several have been used.
        let embedding: Option<(String, i64)> = sqlx::query_as(
            "SELECT model, dims FROM chunk_vectors ORDER BY rowid DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(ArchiveStats {
            total_documents,
            total_chunks,
            workspaces: workspaces.into_iter().collect(),
            tags,
            embedding_model: embedding.as_ref().map(|(model, _)| model.clone()),
            embedding_dimension: embedding.map(|(_, dims)| dims as usize),
        })
    }

    /// Size of the database file on disk, 0 if it cannot be read.
    pub fn db_size(&self) -> u64 {
        std::fs::metadata(&self.config.db.path)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl Archive for NotionArchive {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>> {
        NotionArchive::search(self, query, limit, &SearchFilters::default()).await
    }
}
