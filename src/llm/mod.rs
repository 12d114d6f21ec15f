pub mod chat_stream;
pub mod embeddings;
pub mod query_rewrite;
