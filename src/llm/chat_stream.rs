use anyhow::{Context, Result};
use futures_util::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;

use crate::config::LlmConfig;
use crate::models::ChatMessage;

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Sampling knobs for one answer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChatOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    pub seed: Option<u64>,
}

/// Stream chat completions from Ollama or OpenAI.
/// Returns a stream of content delta strings (one per token/chunk).
pub async fn stream_chat(
    client: &reqwest::Client,
    config: &LlmConfig,
    messages: Vec<ChatMessage>,
    options: ChatOptions,
) -> Result<ChatStream> {
    match config.provider.as_str() {
        "ollama" => stream_ollama(client, config, messages, options).await,
        "openai" => stream_openai(client, config, messages, options).await,
        other => anyhow::bail!("Unsupported LLM provider for chat: {other}"),
    }
}

#[derive(Serialize)]
struct StreamMessage {
    role: String,
    content: String,
}

fn to_stream_messages(messages: Vec<ChatMessage>) -> Vec<StreamMessage> {
    messages
        .into_iter()
        .map(|m| StreamMessage {
            role: m.role,
            content: m.content,
        })
        .collect()
}

// ─── Ollama streaming ────────────────────────────────────

#[derive(Serialize)]
struct OllamaStreamRequest {
    model: String,
    messages: Vec<StreamMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

/// One NDJSON record. Ollama reports failures mid-stream as `{"error": ...}`.
#[derive(Deserialize)]
struct OllamaStreamChunk {
    #[serde(default)]
    message: Option<OllamaChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct OllamaChunkMessage {
    #[serde(default)]
    content: String,
}

async fn stream_ollama(
    client: &reqwest::Client,
    config: &LlmConfig,
    messages: Vec<ChatMessage>,
    options: ChatOptions,
) -> Result<ChatStream> {
    let url = format!("{}/api/chat", config.base_url);

    let req = OllamaStreamRequest {
        model: config.chat_model.clone(),
        messages: to_stream_messages(messages),
        stream: true,
        options: OllamaOptions {
            temperature: options.temperature,
            num_predict: options.max_tokens,
            seed: options.seed,
        },
    };

    let resp = client
        .post(&url)
        .timeout(Duration::from_secs(300))
        .json(&req)
        .send()
        .await
        .context("Failed to connect to Ollama for chat streaming")?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("Ollama chat API returned {status}: {body}");
    }

    let stream = split_records(resp.bytes_stream(), b"\n").filter_map(|record| async move {
        match record {
            Ok(line) => parse_ollama_record(&line),
            Err(e) => Some(Err(e)),
        }
    });

    Ok(Box::pin(stream))
}

/// Content of one NDJSON record, `None` when it carries nothing to show.
/// The closing `done` record may still hold the last piece of the answer.
fn parse_ollama_record(line: &str) -> Option<Result<String>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let chunk = match serde_json::from_str::<OllamaStreamChunk>(line) {
        Ok(chunk) => chunk,
        Err(e) => return Some(Err(anyhow::anyhow!("Failed to parse Ollama chunk: {e}"))),
    };
    if let Some(error) = chunk.error {
        return Some(Err(anyhow::anyhow!("Ollama stream failed: {error}")));
    }
    if chunk.done {
        tracing::debug!("Ollama stream finished");
    }
    chunk
        .message
        .map(|m| m.content)
        .filter(|content| !content.is_empty())
        .map(Ok)
}

// ─── OpenAI streaming ────────────────────────────────────

#[derive(Serialize)]
struct OpenAiStreamRequest {
    model: String,
    messages: Vec<StreamMessage>,
    stream: bool,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    error: Option<OpenAiStreamError>,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiStreamDelta,
}

#[derive(Deserialize)]
struct OpenAiStreamDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiStreamError {
    message: String,
}

async fn stream_openai(
    client: &reqwest::Client,
    config: &LlmConfig,
    messages: Vec<ChatMessage>,
    options: ChatOptions,
) -> Result<ChatStream> {
    let url = format!("{}/v1/chat/completions", config.base_url);

    let req = OpenAiStreamRequest {
        model: config.chat_model.clone(),
        messages: to_stream_messages(messages),
        stream: true,
        temperature: options.temperature,
        max_tokens: options.max_tokens,
        seed: options.seed,
    };

    let resp = client
        .post(&url)
        .timeout(Duration::from_secs(300))
        .header(
            "Authorization",
            format!("Bearer {}", config.api_key.as_deref().unwrap_or("")),
        )
        .json(&req)
        .send()
        .await
        .context("Failed to connect to OpenAI for chat streaming")?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("OpenAI chat API returned {status}: {body}");
    }

    // Events end with a blank line and may span several `data:` lines
    let stream = split_records(resp.bytes_stream(), b"\n\n").filter_map(|record| async move {
        match record {
            Ok(event) => parse_sse_event(&event),
            Err(e) => Some(Err(e)),
        }
    });

    Ok(Box::pin(stream))
}

/// Content of one server-sent event. `None` for keep-alive comments,
/// role-only deltas and the `[DONE]` sentinel.
fn parse_sse_event(event: &str) -> Option<Result<String>> {
    let lines: Vec<&str> = event
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|d| d.strip_prefix(' ').unwrap_or(d))
        .collect();
    let data = lines.join("\n");
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }

    let chunk = match serde_json::from_str::<OpenAiStreamChunk>(data) {
        Ok(chunk) => chunk,
        Err(e) => return Some(Err(anyhow::anyhow!("Failed to parse OpenAI chunk: {e}"))),
    };
    if let Some(error) = chunk.error {
        return Some(Err(anyhow::anyhow!("OpenAI stream failed: {}", error.message)));
    }
    chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|content| !content.is_empty())
        .map(Ok)
}

// ─── Record splitting ────────────────────────────────────

/// Split a byte stream into records ending with `delimiter`.
///
/// Bytes are buffered until a record is complete and decoded only then, so a
/// multi-byte character cut across two network chunks stays intact. Carriage
/// returns are dropped on the way in, letting `\r\n` framing match `\n`
/// delimiters. A trailing record without its delimiter is flushed at the end.
fn split_records(
    byte_stream: impl Stream<Item = reqwest::Result<bytes::Bytes>> + Send + 'static,
    delimiter: &'static [u8],
) -> impl Stream<Item = Result<String>> + Send {
    futures_util::stream::unfold(
        (Box::pin(byte_stream), Vec::<u8>::new(), false),
        move |(mut stream, mut buffer, finished)| async move {
            loop {
                if let Some(pos) = find(&buffer, delimiter) {
                    let record: Vec<u8> = buffer.drain(..pos + delimiter.len()).collect();
                    let record = String::from_utf8_lossy(&record[..pos]).into_owned();
                    if record.trim().is_empty() {
                        continue;
                    }
                    return Some((Ok(record), (stream, buffer, finished)));
                }
                if finished {
                    return None;
                }

                match stream.next().await {
                    Some(Ok(bytes)) => buffer.extend(bytes.iter().filter(|b| **b != b'\r')),
                    Some(Err(e)) => {
                        return Some((
                            Err(anyhow::anyhow!("Stream read error: {e}")),
                            (stream, Vec::new(), true),
                        ));
                    }
                    None => {
                        let rest = String::from_utf8_lossy(&buffer).into_owned();
                        if rest.trim().is_empty() {
                            return None;
                        }
                        return Some((Ok(rest), (stream, Vec::new(), true)));
                    }
                }
            }
        },
    )
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
