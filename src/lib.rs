//! # Notion Archive
//!
//! A local, searchable archive of Notion HTML exports, with an optional deep
//! research step that sends the best-matching snippets to a hosted model
//! together with the question.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌───────────┐
//! │ HTML export │──▶│ Parse+Chunk │──▶│  SQLite   │
//! │  (notion)   │   │   +Embed    │   │ FTS5+Vec  │
//! └─────────────┘   └─────────────┘   └─────┬─────┘
//!                                           │ Archive::search
//!                      ┌────────────────────┼──────────────┐
//!                      ▼                    ▼              ▼
//!                 ┌──────────┐       ┌──────────┐   ┌────────────┐
//!                 │   CLI    │       │   HTTP   │   │  research  │
//!                 └──────────┘       └──────────┘   └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! notion-archive build ./Export-2024         # register + index an export
//! notion-archive search "onboarding" --workspace Engineering
//! notion-archive research --query "How do we price enterprise deals?"
//! notion-archive serve                       # start HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`archive`] | `NotionArchive` store and the `Archive` retrieval trait |
//! | [`chunk`] | Paragraph chunking |
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`ingest`] | Export → pages → chunks → vectors |
//! | [`migrate`] | Schema migrations |
//! | [`models`] | Core data types |
//! | [`notion`] | Notion HTML export parsing |
//! | [`research`] | Deep research orchestration |
//! | [`search`] | Keyword, semantic, and hybrid search |
//! | [`server`] | HTTP API |
//! | [`stats`] | Archive statistics |

pub mod archive;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod notion;
pub mod research;
pub mod search;
pub mod server;
pub mod stats;
