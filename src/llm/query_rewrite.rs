use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::config::LlmConfig;
use crate::models::ChatMessage;
use crate::search::filter::FilterSpec;

const SEARCH_TOOL: &str = "search_database";

const REWRITE_PROMPT: &str = "\
Below is a history of the conversation so far, and a new question asked by the user that \
needs to be answered by searching the fleet database of buses and refueling records. \
Generate a search query based on the conversation and the new question. \
Use the filter parameters of the search_database tool when the question names a vehicle id, \
a license plate, a manufacturer, a bus type, a manufacturing year or a date range. \
Dates use the YYYY-MM-DD format. \
If the question is not in English, write the search query in English.";

/// Search query and structured filters planned from a user question.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchPlan {
    pub query: Option<String>,
    pub filters: Vec<FilterSpec>,
}

/// The `search_database` tool offered to the planning model.
pub fn build_search_function() -> Value {
    json!([{
        "type": "function",
        "function": {
            "name": SEARCH_TOOL,
            "description": "Search the company's vehicle and refueling database.",
            "parameters": {
                "type": "object",
                "properties": {
                    "search_query": {
                        "type": "string",
                        "description": "A semantic search query, e.g. 'efficient urban bus'."
                    },
                    "id_veiculo_filter": {
                        "type": "string",
                        "description": "Filter by the exact vehicle ID (id_veiculo)."
                    },
                    "placa_filter": {
                        "type": "string",
                        "description": "Filter by the exact license plate (placa)."
                    },
                    "fabricante_filter": {
                        "type": "string",
                        "description": "Filter by manufacturer, e.g. 'Volvo', 'Mercedes-Benz'."
                    },
                    "tipo_onibus_filter": {
                        "type": "string",
                        "description": "Filter by bus type, e.g. 'Urbano', 'Rodoviário'."
                    },
                    "ano_filter": {
                        "type": "object",
                        "description": "Filter by the vehicle's manufacturing year.",
                        "properties": {
                            "comparison_operator": {
                                "type": "string",
                                "description": "One of '>', '<', '>=', '<=', '='."
                            },
                            "value": {
                                "type": "number",
                                "description": "The year to compare against, e.g. 2020."
                            }
                        }
                    },
                    "date_filter": {
                        "type": "object",
                        "description": "Filter refueling records by a date range (YYYY-MM-DD).",
                        "properties": {
                            "start_date": { "type": "string", "description": "e.g. '2025-02-01'" },
                            "end_date": { "type": "string", "description": "e.g. '2025-02-28'" }
                        }
                    }
                },
                "required": ["search_query"]
            }
        }
    }])
}

/// Ask the chat model to turn `question` into a [`SearchPlan`].
pub async fn rewrite_query(
    client: &reqwest::Client,
    config: &LlmConfig,
    history: &[ChatMessage],
    question: &str,
) -> Result<SearchPlan> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::new("system", REWRITE_PROMPT));
    messages.extend_from_slice(history);
    messages.push(ChatMessage::new("user", question));

    let message = match config.provider.as_str() {
        "ollama" => call_ollama(client, config, messages).await?,
        "openai" => call_openai(client, config, messages).await?,
        other => anyhow::bail!("Unknown LLM provider: {other}"),
    };

    let plan = extract_search_arguments(question, &message);
    tracing::info!(query = ?plan.query, filters = plan.filters.len(), "planned search");
    Ok(plan)
}

/// A chat completion message that may carry tool calls.
#[derive(Debug, Default, Deserialize)]
pub struct ToolCallMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
pub struct ToolCall {
    /// Ollama omits the type.
    #[serde(rename = "type", default = "function_type")]
    pub kind: String,
    pub function: FunctionCall,
}

#[derive(Debug, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// A JSON-encoded string from OpenAI, an object from Ollama.
    #[serde(default)]
    pub arguments: Value,
}

fn function_type() -> String {
    "function".to_string()
}

/// Read the plan out of the model's reply.
///
/// The first `search_database` call wins. A call without `search_query`
/// falls back to the original question; a reply without tool calls uses its
/// trimmed content as the query.
pub fn extract_search_arguments(original_query: &str, message: &ToolCallMessage) -> SearchPlan {
    let call = message
        .tool_calls
        .iter()
        .flatten()
        .find(|c| c.kind == "function" && c.function.name == SEARCH_TOOL);

    let Some(call) = call else {
        let query = message
            .content
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);
        return SearchPlan {
            query,
            filters: Vec::new(),
        };
    };

    let args = match decode_arguments(&call.function.arguments) {
        Some(args) => args,
        None => {
            tracing::warn!(
                "Unreadable {SEARCH_TOOL} arguments: {}",
                call.function.arguments
            );
            Map::new()
        }
    };

    let query = args
        .get("search_query")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .unwrap_or(original_query)
        .to_string();

    let mut filters = Vec::new();
    for (arg, column) in [
        ("id_veiculo_filter", "id_veiculo"),
        ("placa_filter", "placa"),
        ("fabricante_filter", "fabricante"),
        ("tipo_onibus_filter", "tipo_onibus"),
    ] {
        if let Some(value) = args.get(arg).and_then(Value::as_str).filter(|v| !v.is_empty()) {
            filters.push(FilterSpec::compare(column, "=", value));
        }
    }

    if let Some(ano) = args.get("ano_filter").and_then(Value::as_object) {
        match ano.get("value").filter(|v| !v.is_null()) {
            Some(value) => {
                let operator = ano
                    .get("comparison_operator")
                    .and_then(Value::as_str)
                    .unwrap_or("=");
                filters.push(FilterSpec::compare("ano", operator, value.clone()));
            }
            None => tracing::warn!("Ignoring ano_filter without a value"),
        }
    }

    if let Some(range) = args.get("date_filter").and_then(Value::as_object) {
        if !range.is_empty() {
            filters.push(FilterSpec {
                column: "data".to_string(),
                operator: None,
                value: Value::Object(range.clone()),
            });
        }
    }

    SearchPlan {
        query: Some(query),
        filters,
    }
}

fn decode_arguments(raw: &Value) -> Option<Map<String, Value>> {
    match raw {
        Value::Object(map) => Some(map.clone()),
        Value::String(s) => serde_json::from_str::<Map<String, Value>>(s).ok(),
        Value::Null => Some(Map::new()),
        _ => None,
    }
}

// ─── Ollama ──────────────────────────────────────────────

#[derive(Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    tools: Value,
    stream: bool,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: ToolCallMessage,
}

async fn call_ollama(
    client: &reqwest::Client,
    config: &LlmConfig,
    messages: Vec<ChatMessage>,
) -> Result<ToolCallMessage> {
    let url = format!("{}/api/chat", config.base_url);

    let req = OllamaChatRequest {
        model: config.chat_model.clone(),
        messages,
        tools: build_search_function(),
        stream: false,
    };

    let resp = client
        .post(&url)
        .json(&req)
        .send()
        .await
        .context("Failed to call Ollama chat API for query rewriting")?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("Ollama chat API returned {status}: {body}");
    }

    let body: OllamaChatResponse = resp
        .json()
        .await
        .context("Failed to parse Ollama chat response")?;
    Ok(body.message)
}

// ─── OpenAI-compatible ───────────────────────────────────

#[derive(Serialize)]
struct OpenAiChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    tools: Value,
    tool_choice: &'static str,
    temperature: f32,
}

#[derive(Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: ToolCallMessage,
}

async fn call_openai(
    client: &reqwest::Client,
    config: &LlmConfig,
    messages: Vec<ChatMessage>,
) -> Result<ToolCallMessage> {
    let url = format!("{}/v1/chat/completions", config.base_url);
    let api_key = config.api_key.as_deref().unwrap_or_default();

    let req = OpenAiChatRequest {
        model: config.chat_model.clone(),
        messages,
        tools: build_search_function(),
        tool_choice: "auto",
        temperature: 0.0,
    };

    let resp = client
        .post(&url)
        .header("Authorization", format!("Bearer {api_key}"))
        .json(&req)
        .send()
        .await
        .context("Failed to call OpenAI chat API for query rewriting")?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("OpenAI chat API returned {status}: {body}");
    }

    let body: OpenAiChatResponse = resp
        .json()
        .await
        .context("Failed to parse OpenAI chat response")?;
    Ok(body
        .choices
        .into_iter()
        .next()
        .map(|c| c.message)
        .unwrap_or_default())
}
