//! Archive statistics for `notion-archive stats`.

use anyhow::Result;

use crate::archive::NotionArchive;
use crate::models::ArchiveStats;

/// Tags listed before the rest are summarized as a count.
const MAX_TAGS_SHOWN: usize = 10;

pub async fn run_stats(archive: &NotionArchive) -> Result<()> {
    let stats = archive.get_stats().await?;
    let exports = archive.exports().await?;

    println!("Notion Archive Stats");
    println!("====================");
    println!();
    println!("  Database:    {}", archive.config().db.path.display());
    println!("  Size:        {}", format_bytes(archive.db_size()));
    println!("  Exports:     {}", exports.len());
    for export in &exports {
        println!("    {}", export.display());
    }
    println!();
    print!("{}", render_stats(&stats));
    println!();
    Ok(())
}

/// Everything below the database header, one line per field.
pub fn render_stats(stats: &ArchiveStats) -> String {
    let mut out = String::new();
    out.push_str(&format!("  Documents:   {}\n", stats.total_documents));
    out.push_str(&format!("  Chunks:      {}\n", stats.total_chunks));

    let embedding = match (&stats.embedding_model, stats.embedding_dimension) {
        (Some(model), Some(dims)) => format!("{} ({} dims)", model, dims),
        (Some(model), None) => model.clone(),
        _ => "none".to_string(),
    };
    out.push_str(&format!("  Embeddings:  {}\n", embedding));

    let workspaces: Vec<&str> = stats.workspaces.iter().map(String::as_str).collect();
    out.push_str(&format!(
        "  Workspaces:  {}\n",
        if workspaces.is_empty() {
            "none".to_string()
        } else {
            workspaces.join(", ")
        }
    ));

    let shown: Vec<&str> = stats
        .tags
        .iter()
        .take(MAX_TAGS_SHOWN)
        .map(String::as_str)
        .collect();
    let mut tags_line = if shown.is_empty() {
        "none".to_string()
    } else {
        shown.join(", ")
    };
    if stats.tags.len() > MAX_TAGS_SHOWN {
        tags_line.push_str(&format!(" ... and {} more", stats.tags.len() - MAX_TAGS_SHOWN));
    }
    out.push_str(&format!("  Tags:        {}\n", tags_line));
    out
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
