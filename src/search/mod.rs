//! Hybrid retrieval over Postgres: filter rendering, ranking SQL, RRF fusion
//! and the searcher that ties them to a connection pool.

pub mod filter;
pub mod fusion;
pub mod postgres;
pub mod query;
