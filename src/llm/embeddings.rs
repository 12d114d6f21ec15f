use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;

/// Maximum characters sent per text to the embedding API. Questions are
/// short; this only guards against pasted documents.
const MAX_EMBED_CHARS: usize = 8_000;

/// Turns a query into the vector compared against stored embeddings.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Embedder backed by the configured LLM provider.
#[derive(Clone)]
pub struct EmbeddingClient {
    client: reqwest::Client,
    config: LlmConfig,
}

impl EmbeddingClient {
    pub fn new(client: reqwest::Client, config: LlmConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        embed_single(&self.client, &self.config, text).await
    }
}

/// Truncate `text` to at most `MAX_EMBED_CHARS`, splitting on a UTF-8 char boundary.
fn truncate_for_embedding(text: &str) -> &str {
    if text.len() <= MAX_EMBED_CHARS {
        return text;
    }
    let mut end = MAX_EMBED_CHARS;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Generate the embedding for a single text.
pub async fn embed_single(
    client: &reqwest::Client,
    config: &LlmConfig,
    text: &str,
) -> Result<Vec<f32>> {
    let input = truncate_for_embedding(text).to_string();

    let embeddings = match config.provider.as_str() {
        "ollama" => embed_ollama(client, config, input).await?,
        "openai" => embed_openai(client, config, input).await?,
        other => anyhow::bail!("Unknown LLM provider: {other}"),
    };

    embeddings
        .into_iter()
        .next()
        .context("No embedding returned")
}

// ─── Ollama ──────────────────────────────────────────────

#[derive(Serialize)]
struct OllamaEmbedRequest {
    model: String,
    input: Vec<String>,
    truncate: bool,
}

#[derive(Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

async fn embed_ollama(
    client: &reqwest::Client,
    config: &LlmConfig,
    input: String,
) -> Result<Vec<Vec<f32>>> {
    let url = format!("{}/api/embed", config.base_url);

    let req = OllamaEmbedRequest {
        model: config.embedding_model.clone(),
        input: vec![input],
        truncate: true,
    };

    let resp = client
        .post(&url)
        .json(&req)
        .send()
        .await
        .context("Failed to call Ollama embed API")?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("Ollama embed API returned {status}: {body}");
    }

    let body: OllamaEmbedResponse = resp
        .json()
        .await
        .context("Failed to parse Ollama embed response")?;

    Ok(body.embeddings)
}

// ─── OpenAI-compatible ───────────────────────────────────

#[derive(Serialize)]
struct OpenAiEmbedRequest {
    model: String,
    input: Vec<String>,
    /// Only models that support shortened embeddings accept this.
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct OpenAiEmbedResponse {
    data: Vec<OpenAiEmbedData>,
}

#[derive(Deserialize)]
struct OpenAiEmbedData {
    embedding: Vec<f32>,
}

async fn embed_openai(
    client: &reqwest::Client,
    config: &LlmConfig,
    input: String,
) -> Result<Vec<Vec<f32>>> {
    let url = format!("{}/v1/embeddings", config.base_url);
    let api_key = config.api_key.as_deref().unwrap_or_default();

    let req = OpenAiEmbedRequest {
        model: config.embedding_model.clone(),
        input: vec![input],
        dimensions: config.embedding_dim,
    };

    let resp = client
        .post(&url)
        .header("Authorization", format!("Bearer {api_key}"))
        .json(&req)
        .send()
        .await
        .context("Failed to call OpenAI embed API")?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("OpenAI embed API returned {status}: {body}");
    }

    let body: OpenAiEmbedResponse = resp
        .json()
        .await
        .context("Failed to parse OpenAI embed response")?;

    Ok(body.data.into_iter().map(|d| d.embedding).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn config(provider: &str, base_url: String) -> LlmConfig {
        LlmConfig {
            provider: provider.to_string(),
            base_url,
            embedding_dim: Some(4),
            api_key: Some("sk-test".to_string()),
            ..LlmConfig::default()
        }
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        let text = "é".repeat(MAX_EMBED_CHARS);
        let truncated = truncate_for_embedding(&text);
        assert!(truncated.len() <= MAX_EMBED_CHARS);
        assert!(text.is_char_boundary(truncated.len()));
    }

    #[test]
    fn test_short_text_untouched() {
        assert_eq!(truncate_for_embedding("ônibus urbano"), "ônibus urbano");
    }

    #[test]
    fn test_openai_request_dimensions_are_optional() {
        let with = OpenAiEmbedRequest {
            model: "text-embedding-3-large".into(),
            input: vec!["x".into()],
            dimensions: Some(1024),
        };
        assert_eq!(serde_json::to_value(&with).unwrap()["dimensions"], 1024);

        let without = OpenAiEmbedRequest {
            dimensions: None,
            ..with
        };
        assert!(serde_json::to_value(&without).unwrap().get("dimensions").is_none());
    }

    #[tokio::test]
    async fn test_openai_embedding() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/embeddings")
                    .header("Authorization", "Bearer sk-test");
                then.status(200)
                    .json_body(json!({ "data": [{ "embedding": [0.1, 0.2, 0.3, 0.4] }] }));
            })
            .await;

        let client = EmbeddingClient::new(reqwest::Client::new(), config("openai", server.base_url()));
        let vector = client.embed("ônibus urbano eficiente").await.unwrap();

        mock.assert_async().await;
        assert_eq!(vector, vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[tokio::test]
    async fn test_ollama_embedding() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/embed");
                then.status(200)
                    .json_body(json!({ "embeddings": [[1.0, 0.0, 0.0, 0.0]] }));
            })
            .await;

        let client = EmbeddingClient::new(reqwest::Client::new(), config("ollama", server.base_url()));
        let vector = client.embed("volvo").await.unwrap();

        mock.assert_async().await;
        assert_eq!(vector.len(), 4);
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/embeddings");
                then.status(429).body("rate limited");
            })
            .await;

        let client = EmbeddingClient::new(reqwest::Client::new(), config("openai", server.base_url()));
        let err = client.embed("x").await.unwrap_err();
        assert!(err.to_string().contains("429"));
    }

    #[tokio::test]
    async fn test_empty_response_is_an_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/embeddings");
                then.status(200).json_body(json!({ "data": [] }));
            })
            .await;

        let client = EmbeddingClient::new(reqwest::Client::new(), config("openai", server.base_url()));
        assert!(client.embed("x").await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let client = EmbeddingClient::new(
            reqwest::Client::new(),
            config("bedrock", "http://127.0.0.1:9".to_string()),
        );
        let err = client.embed("x").await.unwrap_err();
        assert!(err.to_string().contains("Unknown LLM provider"));
    }
}
