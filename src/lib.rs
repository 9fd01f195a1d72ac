//! # Clause Matrix
//!
//! Answers a natural-language question across a corpus of contracts as a
//! document × field matrix, every cell carrying a verbatim quote, page
//! numbers and a deep link back to the source.
//!
//! ## Architecture
//!
//! ```text
//! prompt ──▶ QueryProcessing ──▶ Retriever ──▶ Extractor ──▶ Validator ──▶ Synthesizer
//!                                    ▲                           │
//!                                    └──── relaxed retry ────────┘
//! ```
//!
//! The pure pieces (models, fusion, validation, citation checks, matrix
//! assembly) live in `clause-matrix-core`. This crate adds the runtime:
//! the async [`workflow`] state machine, SQLite stores, HTTP model and
//! embedding providers, the axum server, and the `cmx` CLI.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite chunk and result stores |
//! | [`http`] | Shared JSON-over-HTTP client with retries |
//! | [`embedding`] | Embedding providers |
//! | [`llm`] | Language-model provider (planning and extraction) |
//! | [`retriever`] | Hybrid three-strategy retrieval |
//! | [`extractor`] | Bounded-concurrency field extraction and citation checks |
//! | [`synthesizer`] | Result persistence |
//! | [`workflow`] | The orchestrator state machine |
//! | [`server`] | HTTP API |

pub mod config;
pub mod db;
pub mod embedding;
pub mod extractor;
pub mod http;
pub mod llm;
pub mod migrate;
pub mod retriever;
pub mod server;
pub mod sqlite_store;
pub mod synthesizer;
pub mod workflow;
