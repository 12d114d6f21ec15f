use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgSslMode};

use crate::models::TargetKind;
use crate::search::fusion::DEFAULT_RRF_K;
use crate::search::query::is_valid_text_config;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    /// LLM provider configuration
    pub llm: LlmConfig,
    pub search: SearchConfig,
    pub chat: ChatConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Full connection URL; takes precedence over the individual fields.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub database: String,
    /// `disable`, `prefer` or `require`
    pub ssl_mode: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: None,
            database: "postgres".to_string(),
            ssl_mode: "prefer".to_string(),
            max_connections: 10,
            acquire_timeout_secs: 10,
        }
    }
}

impl DatabaseConfig {
    pub fn connect_options(&self) -> Result<PgConnectOptions, sqlx::Error> {
        if let Some(url) = &self.url {
            return url.parse();
        }

        let ssl_mode = self.ssl_mode.parse::<PgSslMode>().unwrap_or(PgSslMode::Prefer);
        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .database(&self.database)
            .ssl_mode(ssl_mode);
        if let Some(password) = &self.password {
            options = options.password(password);
        }
        Ok(options)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// "ollama" or "openai"
    pub provider: String,
    /// Base URL for the LLM API
    pub base_url: String,
    /// Model used for query rewriting and answers
    pub chat_model: String,
    /// Model name for embeddings
    pub embedding_model: String,
    /// API key (only needed for cloud providers)
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Requested embedding dimension, for models that can shorten vectors
    pub embedding_dim: Option<usize>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            base_url: "https://api.openai.com".to_string(),
            chat_model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-large".to_string(),
            api_key: None,
            embedding_dim: Some(1024),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Table searched by the chat flows and the CLI
    pub target: TargetKind,
    /// Vector column compared against the query embedding
    pub embedding_column: String,
    /// Postgres text search configuration for the full-text branch
    pub text_config: String,
    /// RRF smoothing constant
    pub rrf_k: f64,
    /// Rows kept per retrieval branch before fusion
    pub candidate_limit: usize,
    pub default_top: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            target: TargetKind::Refueling,
            embedding_column: "embedding_main".to_string(),
            text_config: "english".to_string(),
            rrf_k: DEFAULT_RRF_K,
            candidate_limit: 20,
            default_top: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    pub temperature: f32,
    pub response_token_limit: u32,
    pub seed: Option<u64>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            response_token_limit: 1024,
            seed: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // Database
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database.url = Some(url);
        }
        if let Ok(host) = std::env::var("PG_HOST") {
            config.database.host = host;
        }
        if let Some(port) = env_parse("PG_PORT") {
            config.database.port = port;
        }
        if let Ok(user) = std::env::var("PG_USER") {
            config.database.user = user;
        }
        if let Ok(password) = std::env::var("PG_PASSWORD") {
            config.database.password = Some(password);
        }
        if let Ok(name) = std::env::var("PG_DATABASE") {
            config.database.database = name;
        }
        if let Ok(mode) = std::env::var("PG_SSLMODE") {
            config.database.ssl_mode = mode;
        }
        if let Some(v) = env_parse("PG_MAX_CONNECTIONS") {
            config.database.max_connections = v;
        }
        if let Some(v) = env_parse("PG_ACQUIRE_TIMEOUT_SECS") {
            config.database.acquire_timeout_secs = v;
        }

        // LLM
        if let Ok(provider) = std::env::var("LLM_PROVIDER") {
            config.llm.provider = provider;
        }
        if let Ok(url) = std::env::var("LLM_BASE_URL") {
            config.llm.base_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(model) = std::env::var("LLM_CHAT_MODEL") {
            config.llm.chat_model = model;
        }
        if let Ok(model) = std::env::var("LLM_EMBEDDING_MODEL") {
            config.llm.embedding_model = model;
        }
        if let Ok(key) = std::env::var("LLM_API_KEY") {
            config.llm.api_key = Some(key);
        }
        if let Ok(dim) = std::env::var("LLM_EMBEDDING_DIM") {
            // "0" or "none" leaves the dimension to the model
            config.llm.embedding_dim = dim.trim().parse().ok().filter(|d| *d > 0);
        }

        // Search
        if let Ok(target) = std::env::var("SEARCH_TARGET") {
            match target.parse() {
                Ok(t) => config.search.target = t,
                Err(e) => tracing::warn!("{e}, keeping {:?}", config.search.target),
            }
        }
        if let Ok(column) = std::env::var("SEARCH_EMBEDDING_COLUMN") {
            config.search.embedding_column = column;
        }
        if let Ok(text_config) = std::env::var("SEARCH_TEXT_CONFIG") {
            config.search.set_text_config(&text_config);
        }
        if let Some(k) = env_parse::<f64>("SEARCH_RRF_K") {
            if k >= 0.0 {
                config.search.rrf_k = k;
            }
        }
        if let Some(v) = env_parse::<usize>("SEARCH_CANDIDATE_LIMIT") {
            config.search.candidate_limit = v.max(1);
        }
        if let Some(v) = env_parse::<usize>("SEARCH_DEFAULT_TOP") {
            config.search.default_top = v.max(1);
        }

        // Chat
        if let Some(v) = env_parse("CHAT_TEMPERATURE") {
            config.chat.temperature = v;
        }
        if let Some(v) = env_parse("CHAT_RESPONSE_TOKEN_LIMIT") {
            config.chat.response_token_limit = v;
        }
        if let Some(v) = env_parse("CHAT_SEED") {
            config.chat.seed = Some(v);
        }

        config
    }
}

impl SearchConfig {
    /// Accept `name` only if it is safe to splice into SQL.
    pub fn set_text_config(&mut self, name: &str) -> bool {
        let name = name.trim();
        if is_valid_text_config(name) {
            self.text_config = name.to_string();
            true
        } else {
            tracing::warn!(
                "Ignoring invalid text search config {name:?}, keeping {}",
                self.text_config
            );
            false
        }
    }
}
