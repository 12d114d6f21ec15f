use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::EnvFilter;

use fleet_rag::chat::ChatParams;
use fleet_rag::config::Config;
use fleet_rag::models::{
    ChatMessage, ChatOverrides, Refueling, RetrievalMode, SearchTarget, TargetKind, Vehicle,
};
use fleet_rag::search::filter::FilterSpec;
use fleet_rag::state::AppState;

#[derive(Parser)]
#[command(name = "fleet-rag")]
#[command(about = "Hybrid search and RAG chat over fleet vehicles and refueling records.")]
struct Cli {
    /// Table to search (default: SEARCH_TARGET or abastecimento)
    #[arg(long, global = true)]
    target: Option<TargetKind>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one hybrid search and print the matching records as a JSON array.
    Search(SearchArgs),
    /// Answer a question from retrieved records, printing NDJSON deltas.
    Chat(ChatArgs),
}

#[derive(Args)]
struct SearchArgs {
    query: String,

    /// Number of records to return (default: SEARCH_DEFAULT_TOP)
    #[arg(long)]
    top: Option<usize>,

    /// hybrid, vectors or text
    #[arg(long, default_value = "hybrid")]
    mode: RetrievalMode,

    /// Filter in column<op>value form, e.g. ano>=2020. Repeatable.
    #[arg(long = "filter")]
    filters: Vec<FilterSpec>,

    /// Start of a date range on `data` (YYYY-MM-DD)
    #[arg(long, requires = "to")]
    from: Option<String>,

    /// End of a date range on `data` (YYYY-MM-DD)
    #[arg(long, requires = "from")]
    to: Option<String>,
}

#[derive(Args)]
struct ChatArgs {
    message: String,

    /// JSON file with earlier turns: [{"role": "user", "content": "..."}, ...]
    #[arg(long)]
    history: Option<PathBuf>,

    /// Search the raw question instead of letting the model plan the search
    #[arg(long)]
    simple: bool,

    /// hybrid, vectors or text
    #[arg(long, default_value = "hybrid")]
    mode: RetrievalMode,

    #[arg(long, default_value_t = 3)]
    top: usize,

    /// Sampling temperature (default: CHAT_TEMPERATURE)
    #[arg(long)]
    temperature: Option<f32>,

    #[arg(long)]
    seed: Option<u64>,

    /// Print one complete response instead of streamed deltas
    #[arg(long)]
    no_stream: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries the JSON output
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(target) = cli.target {
        config.search.target = target;
    }
    tracing::info!("LLM provider: {} ({})", config.llm.provider, config.llm.base_url);
    tracing::info!(
        "Searching {:?} on {} (k={}, candidates={})",
        config.search.target,
        config.search.embedding_column,
        config.search.rrf_k,
        config.search.candidate_limit
    );

    let state = AppState::new(config).await?;

    match (cli.command, state.config.search.target) {
        (Command::Search(args), TargetKind::Refueling) => run_search::<Refueling>(&state, args).await,
        (Command::Search(args), TargetKind::Vehicle) => run_search::<Vehicle>(&state, args).await,
        (Command::Chat(args), TargetKind::Refueling) => run_chat::<Refueling>(&state, args).await,
        (Command::Chat(args), TargetKind::Vehicle) => run_chat::<Vehicle>(&state, args).await,
    }
}

async fn run_search<T: SearchTarget>(state: &AppState, args: SearchArgs) -> anyhow::Result<()> {
    let SearchArgs {
        query,
        top,
        mode,
        mut filters,
        from,
        to,
    } = args;

    if let (Some(from), Some(to)) = (from, to) {
        filters.push(FilterSpec::date_range("data", &from, &to));
    }
    let top = top.unwrap_or(state.config.search.default_top);

    let searcher = state.searcher();
    let records: Vec<T> = searcher
        .search_and_embed(
            Some(query.as_str()),
            top,
            mode.vectors_enabled(),
            mode.text_enabled(),
            &filters,
        )
        .await?;

    let json = serde_json::to_string_pretty(&records)?;
    let mut stdout = tokio::io::stdout();
    stdout.write_all(json.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}

async fn run_chat<T: SearchTarget>(state: &AppState, args: ChatArgs) -> anyhow::Result<()> {
    let ChatArgs {
        message,
        history,
        simple,
        mode,
        top,
        temperature,
        seed,
        no_stream,
    } = args;

    let mut messages: Vec<ChatMessage> = match history {
        Some(path) => {
            let raw = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read history file {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("History file {} is not a message array", path.display()))?
        }
        None => Vec::new(),
    };
    messages.push(ChatMessage::new("user", message));

    let overrides = ChatOverrides {
        retrieval_mode: mode,
        top,
        temperature: temperature.unwrap_or(state.config.chat.temperature),
        use_advanced_flow: !simple,
        seed,
    };
    let params = ChatParams::new(messages, &overrides, &state.config.chat)?;

    let searcher = state.searcher();
    let rag = state.rag_chat(&searcher);
    let (items, thoughts) = rag.prepare_context::<T>(&params).await?;

    let mut stdout = tokio::io::stdout();
    if no_stream {
        let response = rag.answer(&params, &items, thoughts).await?;
        let line = serde_json::to_string(&response)?;
        stdout.write_all(line.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
    } else {
        let mut deltas = rag.answer_stream(&params, &items, thoughts).await?;
        while let Some(delta) = deltas.next().await {
            let line = serde_json::to_string(&delta?)?;
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
    }
    stdout.flush().await?;
    Ok(())
}
