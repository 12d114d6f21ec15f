use thiserror::Error;

/// Failures of a single hybrid search call. None of them are retried here.
#[derive(Debug, Error)]
pub enum SearchError {
    /// Neither a text query nor a query vector was supplied.
    #[error("both query text and query vector are empty")]
    EmptyQuery,

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("top must be at least 1")]
    InvalidTop,

    #[error("query vector has {actual} dimensions, embedding column expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("unknown embedding column: {0}")]
    UnknownEmbeddingColumn(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("embedding request failed: {0:#}")]
    Embedding(anyhow::Error),
}

impl SearchError {
    pub(crate) fn invalid_filter(msg: impl Into<String>) -> Self {
        Self::InvalidFilter(msg.into())
    }
}

pub type SearchResult<T> = std::result::Result<T, SearchError>;
