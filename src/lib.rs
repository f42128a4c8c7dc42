//! Memory Crystal — a sovereign, local-first memory substrate for
//! conversational AI agents.
//!
//! Agents running on one or more user-owned machines deposit text
//! (conversation turns, explicit facts, indexed source files). Memory Crystal
//! deduplicates, embeds, and stores everything in a single SQLite file that
//! supports recency-weighted hybrid retrieval (BM25 keyword + cosine vector)
//! over the union of all captured content. A blind cloud dead drop relays
//! encrypted blobs between machines; the authoritative index lives on one
//! "home" machine and is mirrored read-only to the rest.
//!
//! # Architecture
//!
//! - **Storage**: SQLite with FTS5 (Porter stemming) for keyword search and
//!   [sqlite-vec](https://github.com/asg017/sqlite-vec) for cosine vector search
//! - **Embeddings**: OpenAI, Ollama, or Google — all HTTP, batched where the
//!   provider supports it
//! - **Search**: hybrid vector + BM25 merged via Reciprocal Rank Fusion,
//!   then recency-weighted
//! - **Sync**: AES-256-GCM sealed envelopes over an authenticated dead drop;
//!   full-database mirrors applied atomically on devices
//!
//! # Modules
//!
//! - [`config`] — typed configuration resolved from env and a dotenv file
//! - [`db`] — SQLite initialization, schema, migrations, and health checks
//! - [`crypto`] — sealed-envelope primitives (AEAD + keyed HMAC framing)
//! - [`chunker`] — deterministic text segmentation with boundary snapping
//! - [`embedding`] — text-to-vector clients for the three providers
//! - [`memory`] — ingestion, hybrid search, explicit memories, status
//! - [`sources`] — source-collection indexing with hash change detection
//! - [`relay`] — dead-drop client/server, conversation poller, mirror protocol
//! - [`watermark`] — incremental transcript capture watermarks
//! - [`private`] — the process-wide capture gate
//! - [`backend`] — the capability facade (local store or remote HTTPS)

pub mod backend;
pub mod chunker;
pub mod config;
pub mod crypto;
pub mod db;
pub mod embedding;
pub mod memory;
pub mod private;
pub mod relay;
pub mod sources;
pub mod watermark;
