//! # fleet-rag
//!
//! Retrieval-augmented chat over a bus fleet's vehicles and refueling
//! records stored in Postgres with pgvector. Retrieval fuses a vector
//! similarity ranking and a full-text ranking with Reciprocal Rank Fusion.
//!
//! ## Architecture
//!
//! ```text
//!                     ┌───────────────────────┐
//!                     │  Question + history   │
//!                     └───────────┬───────────┘
//!                                 │
//!                 ┌───────────────┴───────────────┐
//!                 ▼ advanced                      ▼ simple
//!       ┌───────────────────┐                     │
//!       │  Query rewriting  │                     │
//!       │ (LLM tool call →  │                     │
//!       │  query + filters) │                     │
//!       └─────────┬─────────┘                     │
//!                 └───────────────┬───────────────┘
//!                                 ▼
//!                     ┌───────────────────────┐
//!                     │  Embed query (opt.)   │
//!                     └───────────┬───────────┘
//!                                 ▼
//!          ┌─────────────────────────────────────────────┐
//!          │ One ranking statement, filters as $n params │
//!          │  vector_search: ORDER BY emb <=> $1 (top N) │
//!          │  fulltext_search: ts_rank_cd DESC   (top N) │
//!          │  FULL OUTER JOIN → (id, vrank, trank)       │
//!          └──────────────────────┬──────────────────────┘
//!                                 ▼
//!                     ┌───────────────────────┐
//!                     │ RRF: Σ 1/(k + rank)   │
//!                     │ k = 60, keep top K    │
//!                     └───────────┬───────────┘
//!                                 ▼
//!                     ┌───────────────────────┐
//!                     │ WHERE id = ANY($1),   │
//!                     │ re-sorted by rank     │
//!                     └───────────┬───────────┘
//!                                 ▼
//!                     ┌───────────────────────┐
//!                     │ Streamed answer with  │
//!                     │ [docN] citations      │
//!                     └───────────────────────┘
//! ```
//!
//! ## Module Overview
//!
//! - [`config`] - Environment-based configuration for Postgres, LLM, search and chat
//! - [`error`] - Typed failures of a search call
//! - [`models`] - Searchable tables (`Vehicle`, `Refueling`) and chat request/response types
//! - [`search::filter`] - Allow-listed, parameterized filter clauses
//! - [`search::query`] - Query-mode selection and ranking SQL
//! - [`search::fusion`] - Reciprocal Rank Fusion and result re-ordering
//! - [`search::postgres`] - The hybrid searcher over a `PgPool`
//! - [`llm::embeddings`] - Query embeddings via Ollama or OpenAI-compatible APIs
//! - [`llm::query_rewrite`] - LLM tool-call planning of search query and filters
//! - [`llm::chat_stream`] - Streaming chat completions
//! - [`chat`] - Advanced and simple RAG flows
//! - [`state`] - Shared pool, HTTP client and config

pub mod chat;
pub mod config;
pub mod error;
pub mod llm;
pub mod models;
pub mod search;
pub mod state;
