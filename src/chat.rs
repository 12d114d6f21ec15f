//! Retrieval-augmented answers over the fleet tables.
//!
//! A request runs in two steps. [`RagChat::prepare_context`] finds the rows to
//! answer from, either by letting the chat model plan a filtered search
//! (advanced flow) or by searching the raw question (simple flow).
//! [`RagChat::answer_stream`] then streams the model's answer, preceded by a
//! delta that carries the retrieved data points and the thought steps.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::stream::{self, Stream, StreamExt};
use serde_json::json;

use crate::config::{ChatConfig, LlmConfig};
use crate::llm::chat_stream::{ChatOptions, ChatStream, stream_chat};
use crate::llm::embeddings::Embedder;
use crate::llm::query_rewrite::rewrite_query;
use crate::models::{
    ChatMessage, ChatOverrides, RagContext, RetrievalResponse, RetrievalResponseDelta,
    SearchTarget, ThoughtStep,
};
use crate::search::filter::FilterSpec;
use crate::search::postgres::PostgresSearcher;

const MAX_CHAT_MESSAGE_LEN: usize = 2000;
const MAX_HISTORY_TURNS: usize = 10;
const IDLE_TIMEOUT_SECS: u64 = 30;

/// Control sequences some chat templates treat as turn boundaries.
const CHATML_TOKENS: [&str; 4] = ["<|im_start|>", "<|im_end|>", "<|endoftext|>", "<|im_sep|>"];

pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<RetrievalResponseDelta>> + Send>>;

/// Everything one request needs, resolved from the conversation and overrides.
#[derive(Debug, Clone)]
pub struct ChatParams {
    pub question: String,
    pub past_messages: Vec<ChatMessage>,
    pub top: usize,
    pub temperature: f32,
    pub seed: Option<u64>,
    pub response_token_limit: u32,
    pub enable_text_search: bool,
    pub enable_vector_search: bool,
    pub use_advanced_flow: bool,
}

impl ChatParams {
    /// The last message is the question; everything before it is history.
    pub fn new(
        mut messages: Vec<ChatMessage>,
        overrides: &ChatOverrides,
        chat: &ChatConfig,
    ) -> Result<Self> {
        let last = messages.pop().context("Conversation has no messages")?;
        if last.role != "user" {
            anyhow::bail!("Last message must come from the user, got '{}'", last.role);
        }
        let question = last.content.trim();
        if question.is_empty() {
            anyhow::bail!("Message is required");
        }
        if overrides.top == 0 {
            anyhow::bail!("top must be at least 1");
        }

        Ok(Self {
            question: sanitize_for_prompt(&truncate_to_char_boundary(
                question,
                MAX_CHAT_MESSAGE_LEN,
            )),
            past_messages: validate_and_sanitize_history(messages),
            top: overrides.top,
            temperature: overrides.temperature,
            seed: overrides.seed.or(chat.seed),
            response_token_limit: chat.response_token_limit,
            enable_text_search: overrides.retrieval_mode.text_enabled(),
            enable_vector_search: overrides.retrieval_mode.vectors_enabled(),
            use_advanced_flow: overrides.use_advanced_flow,
        })
    }

    fn chat_options(&self) -> ChatOptions {
        ChatOptions {
            temperature: self.temperature,
            max_tokens: self.response_token_limit,
            seed: self.seed,
        }
    }
}

/// RAG orchestration over a searcher and a chat model.
pub struct RagChat<'a, E> {
    searcher: &'a PostgresSearcher<E>,
    client: &'a reqwest::Client,
    llm: &'a LlmConfig,
}

impl<'a, E: Embedder> RagChat<'a, E> {
    pub fn new(
        searcher: &'a PostgresSearcher<E>,
        client: &'a reqwest::Client,
        llm: &'a LlmConfig,
    ) -> Self {
        Self {
            searcher,
            client,
            llm,
        }
    }

    /// Retrieve the rows to answer from, with the steps taken to find them.
    pub async fn prepare_context<T: SearchTarget>(
        &self,
        params: &ChatParams,
    ) -> Result<(Vec<T>, Vec<ThoughtStep>)> {
        if params.use_advanced_flow {
            self.prepare_advanced::<T>(params).await
        } else {
            self.prepare_simple::<T>(params).await
        }
    }

    async fn prepare_advanced<T: SearchTarget>(
        &self,
        params: &ChatParams,
    ) -> Result<(Vec<T>, Vec<ThoughtStep>)> {
        let plan = rewrite_query(self.client, self.llm, &params.past_messages, &params.question)
            .await?;
        let query = plan
            .query
            .filter(|q| !q.trim().is_empty())
            .context("The model did not produce a search query")?;
        let filters = retain_searchable::<T>(plan.filters);

        let results = self
            .searcher
            .search_and_embed::<T>(
                Some(query.as_str()),
                params.top,
                params.enable_vector_search,
                params.enable_text_search,
                &filters,
            )
            .await?;
        tracing::info!(results = results.len(), "advanced flow retrieved {}", T::TABLE);

        let thoughts = vec![
            ThoughtStep::new("Search query generated", json!(query)),
            ThoughtStep::new("Filters applied", serde_json::to_value(&filters)?),
            ThoughtStep::new("Search results", serde_json::to_value(&results)?),
        ];
        Ok((results, thoughts))
    }

    async fn prepare_simple<T: SearchTarget>(
        &self,
        params: &ChatParams,
    ) -> Result<(Vec<T>, Vec<ThoughtStep>)> {
        let results = self
            .searcher
            .search_and_embed::<T>(
                Some(params.question.as_str()),
                params.top,
                params.enable_vector_search,
                params.enable_text_search,
                &[],
            )
            .await?;
        tracing::info!(results = results.len(), "simple flow retrieved {}", T::TABLE);

        let thoughts = vec![ThoughtStep::new(
            "Search results",
            serde_json::to_value(&results)?,
        )];
        Ok((results, thoughts))
    }

    /// Stream the answer. The first delta carries the context, each later
    /// one a chunk of the model's reply.
    pub async fn answer_stream<T: SearchTarget>(
        &self,
        params: &ChatParams,
        items: &[T],
        thoughts: Vec<ThoughtStep>,
    ) -> Result<DeltaStream> {
        let context = build_rag_context(items, thoughts)?;
        let messages = build_messages(
            build_system_prompt(),
            &params.past_messages,
            &build_sources_block(items),
            &params.question,
        );

        let llm_stream = stream_chat(self.client, self.llm, messages, params.chat_options()).await?;

        let first = RetrievalResponseDelta {
            delta: Some(ChatMessage::new("assistant", "")),
            context: Some(context),
        };
        let deltas = with_idle_timeout(llm_stream, Duration::from_secs(IDLE_TIMEOUT_SECS)).map(
            |chunk| {
                chunk.map(|content| RetrievalResponseDelta {
                    delta: Some(ChatMessage::new("assistant", content)),
                    context: None,
                })
            },
        );

        Ok(Box::pin(stream::once(async move { Ok(first) }).chain(deltas)))
    }

    /// Collect the streamed answer into one response.
    pub async fn answer<T: SearchTarget>(
        &self,
        params: &ChatParams,
        items: &[T],
        thoughts: Vec<ThoughtStep>,
    ) -> Result<RetrievalResponse> {
        let mut deltas = self.answer_stream(params, items, thoughts).await?;
        collect_response(&mut deltas).await
    }
}

/// Fold a delta stream into a [`RetrievalResponse`]. Stops at the first error.
pub async fn collect_response(deltas: &mut DeltaStream) -> Result<RetrievalResponse> {
    let mut content = String::new();
    let mut context = None;

    while let Some(delta) = deltas.next().await {
        let delta = delta?;
        if let Some(ctx) = delta.context {
            context = Some(ctx);
        }
        if let Some(message) = delta.delta {
            content.push_str(&message.content);
        }
    }

    Ok(RetrievalResponse {
        message: ChatMessage::new("assistant", content),
        context: context.context("Answer stream ended without context")?,
    })
}

/// End the stream with an error when the model stalls, and after any error.
fn with_idle_timeout(
    llm_stream: ChatStream,
    idle: Duration,
) -> impl Stream<Item = Result<String>> + Send {
    stream::unfold(Some(llm_stream), move |state| async move {
        let mut llm_stream = state?;
        match tokio::time::timeout(idle, llm_stream.next()).await {
            Ok(Some(Ok(content))) => Some((Ok(content), Some(llm_stream))),
            Ok(Some(Err(e))) => Some((Err(e), None)),
            Ok(None) => None,
            Err(_) => Some((
                Err(anyhow::anyhow!("LLM response timed out (idle)")),
                None,
            )),
        }
    })
}

/// Drop planner filters on columns the target does not have. The planner
/// offers one tool for both tables, so e.g. `ano` means nothing for
/// refueling rows.
fn retain_searchable<T: SearchTarget>(filters: Vec<FilterSpec>) -> Vec<FilterSpec> {
    filters
        .into_iter()
        .filter(|f| {
            let known = T::COLUMNS.iter().any(|c| c.name == f.column);
            if !known {
                tracing::warn!(column = %f.column, "Dropping planner filter not searchable on {}", T::TABLE);
            }
            known
        })
        .collect()
}

fn build_rag_context<T: SearchTarget>(items: &[T], thoughts: Vec<ThoughtStep>) -> Result<RagContext> {
    let mut data_points = BTreeMap::new();
    for item in items {
        data_points.insert(item.data_point_key(), serde_json::to_value(item)?);
    }
    Ok(RagContext {
        data_points,
        thoughts,
    })
}

// ─── Prompt building ─────────────────────────────────────

pub fn sanitize_for_prompt(text: &str) -> String {
    CHATML_TOKENS
        .iter()
        .fold(text.to_string(), |acc, token| acc.replace(token, ""))
}

fn validate_and_sanitize_history(history: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let kept: Vec<ChatMessage> = history
        .into_iter()
        .filter(|m| m.role == "user" || m.role == "assistant")
        .map(|m| ChatMessage {
            role: m.role,
            content: sanitize_for_prompt(&truncate_to_char_boundary(
                &m.content,
                MAX_CHAT_MESSAGE_LEN,
            )),
        })
        .collect();
    let skip = kept.len().saturating_sub(MAX_HISTORY_TURNS);
    kept.into_iter().skip(skip).collect()
}

fn build_system_prompt() -> String {
    String::from(
        "Assistant helps fleet managers with questions about their buses and refueling records.\n\
         Each user message includes the records retrieved for the question.\n\
         Answer ONLY with the facts listed in those sources. If they are not enough, say you don't know.\n\
         Each source starts with a name in square brackets, e.g. [doc1]. \
         Cite the sources you use with that name, e.g. [doc1][doc3].\n\
         Answer in the language of the question.",
    )
}

fn build_sources_block<T: SearchTarget>(items: &[T]) -> String {
    let mut block = String::from("Sources:\n\n");
    if items.is_empty() {
        block.push_str("(No matching records were found.)\n");
    } else {
        for (i, item) in items.iter().enumerate() {
            block.push_str(&format!(
                "[doc{}]: {}\n",
                i + 1,
                sanitize_for_prompt(&item.to_str_for_rag())
            ));
        }
    }
    block
}

fn build_messages(
    system_prompt: String,
    history: &[ChatMessage],
    sources_block: &str,
    question: &str,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::new("system", system_prompt));
    messages.extend(history.iter().cloned());
    // Sources go in the user turn so smaller models attend to them
    messages.push(ChatMessage::new(
        "user",
        format!("{sources_block}\n---\nQuestion: {question}"),
    ));
    messages
}

fn truncate_to_char_boundary(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    s.char_indices()
        .take_while(|(i, c)| i + c.len_utf8() <= max_len)
        .map(|(_, c)| c)
        .collect()
}
