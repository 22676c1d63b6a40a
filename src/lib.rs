//! domainscope — knowledge-management core for a domain-scoped, locally-run,
//! LLM-assisted workspace.
//!
//! Domains are directories of markdown files. The core indexes them with
//! content-hashed sync and stable-identity chunking, embeds chunks for
//! semantic search, scores staleness and cross-domain health, parses the
//! structured fence blocks an LLM emits, and runs the brainstorm session
//! engine with its deterministic synthesizer.

pub mod advisory;
pub mod applier;
pub mod brainstorm;
pub mod briefing;
pub mod budget;
pub mod chunker;
pub mod config;
pub mod error;
pub mod fences;
pub mod hash;
pub mod health;
pub mod indexer;
pub mod providers;
pub mod repo;
pub mod scan;
pub mod staleness;
pub mod store;
pub mod synthesis;
pub mod types;
pub mod vectors;

pub use error::{CoreError, ErrorCode, Result};
pub use store::Store;
