//! # Clause Matrix Core
//!
//! Shared, runtime-free logic for Clause Matrix: the analysis data model,
//! the chunk/result store contracts, the language-model capability
//! contract, and every pure algorithm the workflow engine relies on.
//!
//! This crate contains no tokio, sqlx, or HTTP dependencies. The
//! application crate supplies concrete stores and providers and drives
//! the state machine; everything here is deterministic given its inputs.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Requests, field specs, chunks, candidates, records, matrix |
//! | [`error`] | Typed failure taxonomy |
//! | [`store`] | Chunk Store / Result Store traits + in-memory impls |
//! | [`capability`] | Embedding and language-model capability traits |
//! | [`query`] | Prompt validation and field-spec normalization |
//! | [`fusion`] | Multi-strategy rank fusion and retrieval confidence |
//! | [`citation`] | Quote verification, page numbers, deep links |
//! | [`validation`] | Pass verdicts and monotonic parameter relaxation |
//! | [`matrix`] | Document × field matrix assembly |

pub mod capability;
pub mod citation;
pub mod error;
pub mod fusion;
pub mod matrix;
pub mod models;
pub mod query;
pub mod store;
pub mod validation;
