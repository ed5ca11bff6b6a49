//! # docsync
//!
//! Incremental vector index synchronization and retrieval.
//!
//! docsync pulls content from documentation directories and git
//! repositories, splits it into chunks, embeds only the chunks whose
//! content changed, and keeps a vector index in sync across repeated runs.
//! The index lives either in a local SQLite file per collection or in a
//! remote Qdrant collection, behind one storage contract.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌────────────────┐
//! │  Providers  │──▶│  SyncEngine  │──▶│   IndexStore   │
//! │  Dir / Git  │   │ hash + embed │   │ SQLite/Qdrant  │
//! └─────────────┘   └──────────────┘   └───────┬────────┘
//!                                              │
//!                          ┌───────────────────┤
//!                          ▼                   ▼
//!                     ┌──────────┐       ┌──────────┐
//!                     │   CLI    │       │   HTTP   │
//!                     │(docsync) │       │ (tools)  │
//!                     └──────────┘       └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docsync init                          # create index schemas
//! docsync sync                          # sync every source
//! docsync sync api-docs --full          # full rescan of one source
//! docsync search "rotate keys" --product acme --product-version 2.0
//! docsync serve                         # start HTTP tool server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`hash`] | Content hashes, chunk ids, metadata keys |
//! | [`models`] | Core data types |
//! | [`chunk`] | Text chunking with heading tracking |
//! | [`embedding`] | Embedding providers, batching and retry |
//! | [`store`] | Storage contract and backends |
//! | [`traits`] | Content and diff provider traits |
//! | [`connector_fs`] | Directory provider |
//! | [`connector_git`] | Git provider |
//! | [`diff`] | Name-status diff reconciliation |
//! | [`ingest`] | Sync engine |
//! | [`query`] | Retrieval |
//! | [`server`] | HTTP tool server |

pub mod chunk;
pub mod config;
pub mod connector_fs;
pub mod connector_git;
pub mod diff;
pub mod embedding;
pub mod error;
pub mod hash;
pub mod ingest;
pub mod models;
pub mod query;
pub mod server;
pub mod store;
pub mod traits;
