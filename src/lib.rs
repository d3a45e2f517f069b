//! # CI Suggester
//!
//! Suggests configuration items (CIs) for a free-text description of an
//! incident or change, ranking by semantic similarity blended with each CI's
//! change history.
//!
//! The system is a two-stage pipeline: an offline job harvests CIs and their
//! change requests from the asset store's table API, builds a text profile
//! per CI and embeds it into an exact inner-product index; an online service
//! loads that index once and answers `GET /suggest_ci` queries.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌──────────────┐
//! │ Table API   │──▶│   Corpus    │──▶│  Embedding   │
//! │ CIs/changes │   │   Builder   │   │   Indexer    │
//! └─────────────┘   └─────────────┘   └──────┬───────┘
//!                                            │ index.bin + meta.json
//!                      ┌─────────────────────┤
//!                      ▼                     ▼
//!                 ┌──────────┐         ┌──────────┐
//!                 │   CLI    │         │   HTTP   │
//!                 │ (cisug)  │         │ /suggest │
//!                 └──────────┘         └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! cisug check-deps                 # verify asset-store prerequisites
//! cisug build                      # harvest, embed, index
//! cisug suggest "db failover"      # query from the shell
//! cisug serve                      # start the HTTP endpoint
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Record and result types |
//! | [`retry`] | Bounded retry policy |
//! | [`source`] | Paginated table API client |
//! | [`corpus`] | Corpus builder |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Inner-product index and artifacts |
//! | [`ranking`] | Rescoring and the suggester |
//! | [`server`] | HTTP endpoint |
//! | [`pipeline`] | Offline job orchestration |
//! | [`deps`] | Dependency preflight |
//! | [`telemetry`] | Logging and remote log forwarding |

pub mod artifact;
pub mod config;
pub mod corpus;
pub mod deps;
pub mod embedding;
pub mod index;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod ranking;
pub mod retry;
pub mod server;
pub mod source;
pub mod stats;
pub mod telemetry;
