use std::collections::BTreeMap;
use std::fmt::Display;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;

use crate::search::filter::{Column, ColumnKind};

/// A fixed-dimension vector column declared on a target table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddingColumn {
    pub name: &'static str,
    pub dimensions: usize,
}

const EMBEDDING_COLUMNS: &[EmbeddingColumn] = &[
    EmbeddingColumn {
        name: "embedding_main",
        dimensions: 1024,
    },
    EmbeddingColumn {
        name: "embedding_alt",
        dimensions: 768,
    },
];

/// A table the hybrid searcher can rank and materialize.
///
/// Every target carries a surrogate `id BIGINT` key that correlates the
/// ranking statement with the follow-up fetch.
pub trait SearchTarget:
    for<'r> sqlx::FromRow<'r, PgRow> + Serialize + Send + Unpin + 'static
{
    const TABLE: &'static str;
    /// Projection used when materializing rows. NUMERIC columns are cast to
    /// float8 so they decode into `f64`.
    const SELECT_COLUMNS: &'static str;
    /// Expression fed to `to_tsvector` for the full-text branch.
    const TEXT_EXPR: &'static str;
    /// Filterable columns.
    const COLUMNS: &'static [Column];
    const EMBEDDING_COLUMNS: &'static [EmbeddingColumn];

    fn id(&self) -> i64;

    /// Clean text handed to the answering model as a source.
    fn to_str_for_rag(&self) -> String;

    /// Key under which the row is reported in the chat context.
    fn data_point_key(&self) -> String;

    fn embedding_column(name: &str) -> Option<&'static EmbeddingColumn> {
        Self::EMBEDDING_COLUMNS.iter().find(|c| c.name == name)
    }
}

fn show<T: Display>(value: &Option<T>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "unknown".to_string(),
    }
}

/// A bus in the fleet (`veiculos`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Vehicle {
    pub id: i64,
    pub id_veiculo: String,
    pub garagem: Option<String>,
    pub placa: Option<String>,
    pub ano: Option<i32>,
    pub tipo_onibus: Option<String>,
    pub fabricante: Option<String>,
    pub modelo_chassi: Option<String>,
}

impl SearchTarget for Vehicle {
    const TABLE: &'static str = "veiculos";
    const SELECT_COLUMNS: &'static str =
        "id, id_veiculo, garagem, placa, ano, tipo_onibus, fabricante, modelo_chassi";
    const TEXT_EXPR: &'static str = "concat_ws(' ', tipo_onibus, fabricante, modelo_chassi)";
    const COLUMNS: &'static [Column] = &[
        Column::new("id_veiculo", ColumnKind::Text),
        Column::new("garagem", ColumnKind::Text),
        Column::new("placa", ColumnKind::Text),
        Column::new("ano", ColumnKind::Integer),
        Column::new("tipo_onibus", ColumnKind::Text),
        Column::new("fabricante", ColumnKind::Text),
        Column::new("modelo_chassi", ColumnKind::Text),
    ];
    const EMBEDDING_COLUMNS: &'static [EmbeddingColumn] = EMBEDDING_COLUMNS;

    fn id(&self) -> i64 {
        self.id
    }

    fn to_str_for_rag(&self) -> String {
        format!(
            "Vehicle ID: {}, Plate: {}, Manufacturer: {}, Model: {}, Year: {}, Type: {}, Garage: {}.",
            self.id_veiculo,
            show(&self.placa),
            show(&self.fabricante),
            show(&self.modelo_chassi),
            show(&self.ano),
            show(&self.tipo_onibus),
            show(&self.garagem)
        )
    }

    fn data_point_key(&self) -> String {
        self.id_veiculo.clone()
    }
}

/// A refueling event (`abastecimento`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Refueling {
    pub id: i64,
    pub id_veiculo: String,
    pub placa: Option<String>,
    pub km_percorrido: Option<i32>,
    pub diesel: Option<f64>,
    pub km_diesel: Option<f64>,
    pub data: Option<NaiveDate>,
    pub custo_combustivel: Option<f64>,
    pub preco_combustivel: Option<f64>,
}

impl SearchTarget for Refueling {
    const TABLE: &'static str = "abastecimento";
    const SELECT_COLUMNS: &'static str = "id, id_veiculo, placa, km_percorrido, \
         diesel::float8 AS diesel, km_diesel::float8 AS km_diesel, data, \
         custo_combustivel::float8 AS custo_combustivel, \
         preco_combustivel::float8 AS preco_combustivel";
    const TEXT_EXPR: &'static str = "concat_ws(' ', placa, id_veiculo)";
    const COLUMNS: &'static [Column] = &[
        Column::new("id_veiculo", ColumnKind::Text),
        Column::new("placa", ColumnKind::Text),
        Column::new("km_percorrido", ColumnKind::Integer),
        Column::new("diesel", ColumnKind::Numeric),
        Column::new("km_diesel", ColumnKind::Numeric),
        Column::new("data", ColumnKind::Date),
        Column::new("custo_combustivel", ColumnKind::Numeric),
        Column::new("preco_combustivel", ColumnKind::Numeric),
    ];
    const EMBEDDING_COLUMNS: &'static [EmbeddingColumn] = EMBEDDING_COLUMNS;

    fn id(&self) -> i64 {
        self.id
    }

    fn to_str_for_rag(&self) -> String {
        format!(
            "Record from {} for plate {}: {} liters of diesel cost {}. The efficiency was {} km/l.",
            show(&self.data),
            show(&self.placa),
            show(&self.diesel),
            show(&self.custo_combustivel),
            show(&self.km_diesel)
        )
    }

    fn data_point_key(&self) -> String {
        format!("{}-{}", show(&self.placa), show(&self.data))
    }
}

/// Which table a process searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetKind {
    #[serde(rename = "abastecimento")]
    Refueling,
    #[serde(rename = "veiculos")]
    Vehicle,
}

impl std::str::FromStr for TargetKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abastecimento" | "refueling" => Ok(Self::Refueling),
            "veiculos" | "vehicle" | "vehicles" => Ok(Self::Vehicle),
            other => Err(format!("unknown search target: {other}")),
        }
    }
}

/// Which retrieval branches a chat request enables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    Text,
    Vectors,
    #[default]
    Hybrid,
}

impl RetrievalMode {
    pub fn text_enabled(self) -> bool {
        matches!(self, Self::Text | Self::Hybrid)
    }

    pub fn vectors_enabled(self) -> bool {
        matches!(self, Self::Vectors | Self::Hybrid)
    }
}

impl std::str::FromStr for RetrievalMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "vectors" | "vector" => Ok(Self::Vectors),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(format!("unknown retrieval mode: {other}")),
        }
    }
}

/// A single chat turn (user or assistant)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

/// Per-request knobs of the RAG flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatOverrides {
    #[serde(default)]
    pub retrieval_mode: RetrievalMode,
    #[serde(default = "default_top")]
    pub top: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_true")]
    pub use_advanced_flow: bool,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for ChatOverrides {
    fn default() -> Self {
        Self {
            retrieval_mode: RetrievalMode::default(),
            top: default_top(),
            temperature: default_temperature(),
            use_advanced_flow: true,
            seed: None,
        }
    }
}

fn default_top() -> usize {
    3
}

fn default_temperature() -> f32 {
    0.3
}

fn default_true() -> bool {
    true
}

/// One step of the retrieval process, reported back alongside the answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThoughtStep {
    pub title: String,
    pub description: serde_json::Value,
}

impl ThoughtStep {
    pub fn new(title: &str, description: serde_json::Value) -> Self {
        Self {
            title: title.to_string(),
            description,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagContext {
    pub data_points: BTreeMap<String, serde_json::Value>,
    pub thoughts: Vec<ThoughtStep>,
}

/// Complete (non-streamed) answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResponse {
    pub message: ChatMessage,
    pub context: RagContext,
}

/// One NDJSON line of a streamed answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResponseDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<RagContext>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refueling() -> Refueling {
        Refueling {
            id: 7,
            id_veiculo: "V-100".into(),
            placa: Some("ABC1D23".into()),
            km_percorrido: Some(320),
            diesel: Some(410.0),
            km_diesel: Some(0.78),
            data: NaiveDate::from_ymd_opt(2025, 2, 14),
            custo_combustivel: Some(2460.5),
            preco_combustivel: Some(6.0),
        }
    }

    #[test]
    fn test_refueling_rag_text_and_key() {
        let r = refueling();
        assert_eq!(
            r.to_str_for_rag(),
            "Record from 2025-02-14 for plate ABC1D23: 410 liters of diesel cost 2460.5. The efficiency was 0.78 km/l."
        );
        assert_eq!(r.data_point_key(), "ABC1D23-2025-02-14");
    }

    #[test]
    fn test_vehicle_rag_text_handles_missing_fields() {
        let v = Vehicle {
            id: 1,
            id_veiculo: "V-1".into(),
            garagem: None,
            placa: Some("XYZ9A87".into()),
            ano: Some(2021),
            tipo_onibus: Some("Urbano".into()),
            fabricante: Some("Volvo".into()),
            modelo_chassi: None,
        };
        let text = v.to_str_for_rag();
        assert!(text.contains("Year: 2021"));
        assert!(text.contains("Model: unknown"));
        assert!(text.contains("Garage: unknown."));
        assert_eq!(v.data_point_key(), "V-1");
    }

    #[test]
    fn test_embedding_column_lookup() {
        let col = Vehicle::embedding_column("embedding_main").unwrap();
        assert_eq!(col.dimensions, 1024);
        assert_eq!(Refueling::embedding_column("embedding_alt").unwrap().dimensions, 768);
        assert!(Refueling::embedding_column("embedding_3l").is_none());
    }

    #[test]
    fn test_target_kind_parses_table_names() {
        assert_eq!("abastecimento".parse::<TargetKind>(), Ok(TargetKind::Refueling));
        assert_eq!("Veiculos".parse::<TargetKind>(), Ok(TargetKind::Vehicle));
        assert!("manutencao".parse::<TargetKind>().is_err());
    }

    #[test]
    fn test_retrieval_mode_enables_branches() {
        assert!(RetrievalMode::Hybrid.text_enabled() && RetrievalMode::Hybrid.vectors_enabled());
        assert!(RetrievalMode::Text.text_enabled() && !RetrievalMode::Text.vectors_enabled());
        assert!(!RetrievalMode::Vectors.text_enabled() && RetrievalMode::Vectors.vectors_enabled());
    }

    #[test]
    fn test_overrides_defaults_from_empty_json() {
        let o: ChatOverrides = serde_json::from_str("{}").unwrap();
        assert_eq!(o.retrieval_mode, RetrievalMode::Hybrid);
        assert_eq!(o.top, 3);
        assert!(o.use_advanced_flow);
        assert!(o.seed.is_none());
    }

    #[test]
    fn test_delta_skips_empty_fields() {
        let d = RetrievalResponseDelta {
            delta: Some(ChatMessage::new("assistant", "hi")),
            context: None,
        };
        let json = serde_json::to_value(&d).unwrap();
        assert!(json.get("context").is_none());
        assert_eq!(json["delta"]["content"], "hi");
    }
}
