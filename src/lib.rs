//! # ToS Monitor
//!
//! Tracks legal and policy documents (terms of service, privacy policies)
//! over time: fetches them on demand or on a schedule, decides whether a
//! new version changed in substance, keeps a versioned snapshot history and
//! produces natural-language summaries of what changed between two
//! versions.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌──────────┐   ┌──────────────┐
//! │ Fetcher  │──▶│ Normalizer │──▶│ Hashing  │──▶│   Detector   │
//! │ HTTP/file│   │            │   │ 3 tiers  │   │ persist?     │
//! └──────────┘   └────────────┘   └──────────┘   └──────┬───────┘
//!                                                       ▼
//!                 ┌──────────────┐              ┌──────────────┐
//!                 │     Diff     │◀────────────▶│  Snapshot    │
//!                 │ orchestrator │              │  store       │
//!                 └──────┬───────┘              └──────┬───────┘
//!                        ▼                             ▼
//!                 ┌──────────────┐              ┌──────────────┐
//!                 │  Summarizer  │              │  Blob store  │
//!                 │  (LLM chat)  │              │  fs/S3/mem   │
//!                 └──────────────┘              └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! tosmon init --documents documents.json   # seed config/documents.json
//! tosmon fetch                             # fetch every document
//! tosmon list                              # current/last/prev per document
//! tosmon diff acme-tos                     # summarize prev → last
//! tosmon serve                             # start the HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Timestamps, selectors, snapshots, diff records |
//! | [`hashing`] | Content, structural and fingerprint hashes |
//! | [`detector`] | Change classification and persist policy |
//! | [`blob`] | Key → bytes storage backends |
//! | [`snapshot_store`] | Versioned snapshot and diff storage |
//! | [`fetch`] | Page fetching and HTML-to-text extraction |
//! | [`normalize`] | Text cleanup before hashing |
//! | [`summarize`] | LLM summarizer and prompt templates |
//! | [`diff`] | Diff orchestration |
//! | [`monitor`] | Fetch and diff cycles |
//! | [`server`] | HTTP API |
//! | [`logging`] | Tracing subscriber setup |

pub mod blob;
pub mod config;
pub mod detector;
pub mod diff;
pub mod error;
pub mod fetch;
pub mod hashing;
pub mod logging;
pub mod models;
pub mod monitor;
pub mod normalize;
pub mod server;
pub mod snapshot_store;
pub mod summarize;

pub use error::{MonitorError, Result};
pub use monitor::Monitor;
