//! Core data models.
//!
//! Pages come out of the export parser, get split into chunks, and come back
//! out of search as [`SearchResult`]s.

use serde::Serialize;
use std::collections::BTreeSet;
use std::path::PathBuf;

/// A Notion page parsed from an HTML export.
#[derive(Debug, Clone)]
pub struct NotionPage {
    /// Notion's 32-hex page id, or a path hash when the filename has none.
    pub page_id: String,
    pub title: Option<String>,
    pub workspace: String,
    pub tags: Vec<String>,
    pub body: String,
    /// Absolute path of the source HTML file.
    pub path: PathBuf,
    pub modified_at: i64,
}

/// A chunk of a page's body text.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub page_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub hash: String,
}

/// One search hit. Results are chunk-level: `content` is the chunk text.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SearchResult {
    pub content: String,
    pub title: Option<String>,
    pub score: f64,
    pub workspace: String,
    pub tags: Vec<String>,
    pub page_id: String,
    pub chunk_index: i64,
}

impl SearchResult {
    /// Minimal record carrying only the fields the research context reads.
    pub fn new(content: impl Into<String>, title: Option<&str>) -> Self {
        Self {
            content: content.into(),
            title: title.map(str::to_string),
            score: 0.0,
            workspace: String::new(),
            tags: Vec::new(),
            page_id: String::new(),
            chunk_index: 0,
        }
    }
}

/// Optional narrowing applied to search results.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    /// Exact workspace name.
    pub workspace: Option<String>,
    /// A page matches when it carries any of these tags.
    pub tags: Vec<String>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.workspace.is_none() && self.tags.is_empty()
    }

    pub fn matches(&self, workspace: &str, tags: &[String]) -> bool {
        if let Some(ref ws) = self.workspace {
            if ws != workspace {
                return false;
            }
        }
        if !self.tags.is_empty() && !self.tags.iter().any(|t| tags.contains(t)) {
            return false;
        }
        true
    }
}

/// Summary of what the archive holds.
#[derive(Debug, Clone, Serialize, Default)]
pub struct ArchiveStats {
    pub total_documents: i64,
    pub total_chunks: i64,
    pub workspaces: BTreeSet<String>,
    pub tags: BTreeSet<String>,
    pub embedding_model: Option<String>,
    pub embedding_dimension: Option<usize>,
}
