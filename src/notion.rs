//! Notion HTML export parser.
//!
//! Walks an export directory and turns every `.html` page into a
//! [`NotionPage`]. Notion names exported files `"<Title> <32-hex id>.html"`
//! and nests child pages in a folder named after the parent, so the id and
//! the workspace both come from the path. Title, tags, and body come from
//! the page markup:
//!
//! | Field | Source |
//! |-------|--------|
//! | title | `h1.page-title`, then `<title>`, then the file name |
//! | tags | `table.properties` row headed `Tags`, `span.selected-value` cells |
//! | body | block elements under `div.page-body`, one paragraph each |

use anyhow::{anyhow, bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use scraper::{ElementRef, Html, Selector};
use sha2::{Digest, Sha256};
use std::path::{Component, Path};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::models::NotionPage;

const BLOCK_TAGS: &[&str] = &[
    "p",
    "h1",
    "h2",
    "h3",
    "h4",
    "h5",
    "h6",
    "li",
    "pre",
    "blockquote",
    "figcaption",
    "td",
];

/// Scan an export directory and parse every page in it.
///
/// Pages are returned sorted by path. Pages without body text are skipped.
pub fn scan_export(root: &Path) -> Result<Vec<NotionPage>> {
    if !root.is_dir() {
        bail!("Export path is not a directory: {}", root.display());
    }

    let include = build_globset(&["**/*.html", "*.html"])?;
    let exclude = build_globset(&["**/__MACOSX/**", "**/.*", "**/.*/**"])?;
    let export_name = clean_name(
        &root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "default".to_string()),
    );

    let mut pages = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();
        if exclude.is_match(&rel_str) || !include.is_match(&rel_str) {
            continue;
        }

        let html = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let modified_at = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let mut page = parse_page(&html, relative, &export_name)?;
        page.path = path.to_path_buf();
        page.modified_at = modified_at;

        if page.body.trim().is_empty() {
            warn!(path = %rel_str, "skipping page with empty body");
            continue;
        }
        debug!(path = %rel_str, page_id = %page.page_id, "parsed page");
        pages.push(page);
    }

    Ok(pages)
}

/// Parse one exported page. `relative` is the path under the export root.
pub fn parse_page(html: &str, relative: &Path, export_name: &str) -> Result<NotionPage> {
    let doc = Html::parse_document(html);
    let stem = relative
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();

    let title = first_text(&doc, "h1.page-title")?
        .or(first_text(&doc, "title")?)
        .or_else(|| Some(clean_name(&stem)).filter(|s| !s.is_empty()));

    let page_id = notion_id(&stem).unwrap_or_else(|| {
        let mut hasher = Sha256::new();
        hasher.update(relative.to_string_lossy().as_bytes());
        format!("{:x}", hasher.finalize())[..32].to_string()
    });

    Ok(NotionPage {
        page_id,
        title,
        workspace: workspace_for(relative, export_name),
        tags: extract_tags(&doc)?,
        body: extract_body(&doc)?,
        path: relative.to_path_buf(),
        modified_at: 0,
    })
}

/// Nested pages belong to their top-level folder; top-level pages to the export.
fn workspace_for(relative: &Path, export_name: &str) -> String {
    let dirs: Vec<String> = relative
        .parent()
        .map(|p| {
            p.components()
                .filter_map(|c| match c {
                    Component::Normal(s) => Some(s.to_string_lossy().to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    match dirs.first() {
        Some(dir) => clean_name(dir),
        None => export_name.to_string(),
    }
}

fn extract_tags(doc: &Html) -> Result<Vec<String>> {
    let row_sel = selector("table.properties tr")?;
    let header_sel = selector("th")?;
    let value_sel = selector("span.selected-value")?;

    let mut tags = Vec::new();
    for row in doc.select(&row_sel) {
        let header = row
            .select(&header_sel)
            .next()
            .map(|th| collapse_ws(&th.text().collect::<String>()))
            .unwrap_or_default();
        if !header.eq_ignore_ascii_case("tags") {
            continue;
        }
        for value in row.select(&value_sel) {
            let tag = collapse_ws(&value.text().collect::<String>());
            if !tag.is_empty() && !tags.contains(&tag) {
                tags.push(tag);
            }
        }
    }
    Ok(tags)
}

fn extract_body(doc: &Html) -> Result<String> {
    let root_sel = selector("div.page-body")?;
    let body_sel = selector("body")?;
    let block_sel = selector(&BLOCK_TAGS.join(", "))?;

    let root = match doc.select(&root_sel).next() {
        Some(el) => el,
        None => match doc.select(&body_sel).next() {
            Some(el) => el,
            None => return Ok(String::new()),
        },
    };

    let mut paragraphs = Vec::new();
    for block in root.select(&block_sel) {
        if has_block_ancestor(&block) {
            continue;
        }
        let text = if block.value().name() == "pre" {
            block.text().collect::<String>().trim().to_string()
        } else {
            collapse_ws(&block.text().collect::<String>())
        };
        if !text.is_empty() {
            paragraphs.push(text);
        }
    }

    if paragraphs.is_empty() {
        let text = collapse_ws(&root.text().collect::<String>());
        return Ok(text);
    }
    Ok(paragraphs.join("\n\n"))
}

fn has_block_ancestor(el: &ElementRef) -> bool {
    el.ancestors()
        .filter_map(ElementRef::wrap)
        .any(|a| BLOCK_TAGS.contains(&a.value().name()))
}

fn first_text(doc: &Html, css: &str) -> Result<Option<String>> {
    let sel = selector(css)?;
    Ok(doc
        .select(&sel)
        .next()
        .map(|el| collapse_ws(&el.text().collect::<String>()))
        .filter(|s| !s.is_empty()))
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("invalid selector '{}': {:?}", css, e))
}

/// The trailing 32-hex id Notion appends to exported names.
pub fn notion_id(name: &str) -> Option<String> {
    let last = name.rsplit(' ').next()?;
    (last.len() == 32 && last.chars().all(|c| c.is_ascii_hexdigit()))
        .then(|| last.to_ascii_lowercase())
}

/// Strip the trailing Notion id from an exported file or folder name.
pub fn clean_name(name: &str) -> String {
    match notion_id(name) {
        Some(_) => name
            .rsplit_once(' ')
            .map(|(head, _)| head.trim().to_string())
            .unwrap_or_default(),
        None => name.trim().to_string(),
    }
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn build_globset(patterns: &[&str]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
