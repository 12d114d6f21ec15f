use crate::error::{SearchError, SearchResult};
use crate::models::SearchTarget;
use crate::search::filter::{FilterClause, FilterSpec, build_filter_clause};

/// Which retrieval branches a search call runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    Hybrid,
    Vector,
    Text,
}

impl QueryMode {
    /// Pick the mode from the signals present. Blank text counts as absent.
    pub fn select(query_text: Option<&str>, query_vector: &[f32]) -> SearchResult<Self> {
        let has_text = query_text.is_some_and(|t| !t.trim().is_empty());
        let has_vector = !query_vector.is_empty();
        match (has_text, has_vector) {
            (true, true) => Ok(Self::Hybrid),
            (false, true) => Ok(Self::Vector),
            (true, false) => Ok(Self::Text),
            (false, false) => Err(SearchError::EmptyQuery),
        }
    }

    /// Number of placeholders bound ahead of the filter parameters:
    /// `$1` is the embedding (or the text query in text mode), `$2` the text
    /// query in hybrid mode.
    pub fn leading_params(self) -> usize {
        match self {
            Self::Hybrid => 2,
            Self::Vector | Self::Text => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hybrid => "hybrid",
            Self::Vector => "vector",
            Self::Text => "text",
        }
    }
}

/// Knobs of the ranking statement that do not change per request.
#[derive(Debug, Clone)]
pub struct RankingOptions<'a> {
    pub embedding_column: &'a str,
    /// Postgres text search configuration, e.g. `english`.
    pub text_config: &'a str,
    /// Rows kept per branch before fusion.
    pub candidate_limit: usize,
}

/// A ranking statement returning `(id, vector_rank, text_rank)` rows, with
/// the filter parameters that follow the leading placeholders.
#[derive(Debug, Clone)]
pub struct RankingQuery {
    pub mode: QueryMode,
    pub sql: String,
    pub filters: FilterClause,
}

/// Build the single-round-trip ranking statement for `mode` over `T`.
pub fn build_ranking_query<T: SearchTarget>(
    mode: QueryMode,
    filters: &[FilterSpec],
    options: &RankingOptions<'_>,
) -> SearchResult<RankingQuery> {
    let filters = build_filter_clause(T::COLUMNS, filters, mode.leading_params() + 1)?;

    let sql = match mode {
        QueryMode::Hybrid => {
            let vector = vector_branch::<T>(options, 1, &filters.and_clause);
            let text = text_branch::<T>(options, 2, &filters.and_clause);
            format!(
                "WITH vector_search AS ({vector}), \
                 fulltext_search AS ({text}) \
                 SELECT COALESCE(vector_search.id, fulltext_search.id) AS id, \
                 vector_search.rank AS vector_rank, \
                 fulltext_search.rank AS text_rank \
                 FROM vector_search \
                 FULL OUTER JOIN fulltext_search ON vector_search.id = fulltext_search.id"
            )
        }
        QueryMode::Vector => {
            let vector = vector_branch::<T>(options, 1, &filters.and_clause);
            format!(
                "WITH vector_search AS ({vector}) \
                 SELECT id, rank AS vector_rank, NULL::bigint AS text_rank \
                 FROM vector_search ORDER BY rank"
            )
        }
        QueryMode::Text => {
            let text = text_branch::<T>(options, 1, &filters.and_clause);
            format!(
                "WITH fulltext_search AS ({text}) \
                 SELECT id, NULL::bigint AS vector_rank, rank AS text_rank \
                 FROM fulltext_search ORDER BY rank"
            )
        }
    };

    Ok(RankingQuery { mode, sql, filters })
}

/// Rows with an embedding, ordered by cosine distance. `id` breaks ties so
/// ranks form a total order.
fn vector_branch<T: SearchTarget>(options: &RankingOptions<'_>, param: usize, and_clause: &str) -> String {
    let col = options.embedding_column;
    format!(
        "SELECT id, RANK() OVER (ORDER BY {col} <=> ${param}, id) AS rank \
         FROM {table} \
         WHERE {col} IS NOT NULL {and_clause} \
         ORDER BY {col} <=> ${param}, id \
         LIMIT {limit}",
        table = T::TABLE,
        limit = options.candidate_limit,
    )
}

fn text_branch<T: SearchTarget>(options: &RankingOptions<'_>, param: usize, and_clause: &str) -> String {
    let cfg = options.text_config;
    let document = format!("to_tsvector('{cfg}', {})", T::TEXT_EXPR);
    format!(
        "SELECT id, RANK() OVER (ORDER BY ts_rank_cd({document}, query) DESC, id) AS rank \
         FROM {table}, plainto_tsquery('{cfg}', ${param}) query \
         WHERE {document} @@ query {and_clause} \
         ORDER BY ts_rank_cd({document}, query) DESC, id \
         LIMIT {limit}",
        table = T::TABLE,
        limit = options.candidate_limit,
    )
}

/// Text search configurations are spliced into SQL, so only plain
/// lowercase identifiers are accepted.
pub fn is_valid_text_config(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name.starts_with(|c: char| c.is_ascii_lowercase())
        && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Refueling, Vehicle};
    use crate::search::filter::FilterParam;

    fn options() -> RankingOptions<'static> {
        RankingOptions {
            embedding_column: "embedding_main",
            text_config: "english",
            candidate_limit: 20,
        }
    }

    #[test]
    fn test_mode_selection() {
        assert_eq!(QueryMode::select(Some("urbano"), &[0.1, 0.2]).unwrap(), QueryMode::Hybrid);
        assert_eq!(QueryMode::select(None, &[0.1]).unwrap(), QueryMode::Vector);
        assert_eq!(QueryMode::select(Some("urbano"), &[]).unwrap(), QueryMode::Text);
    }

    #[test]
    fn test_empty_query_rejected() {
        assert!(matches!(QueryMode::select(None, &[]), Err(SearchError::EmptyQuery)));
        assert!(matches!(QueryMode::select(Some("   "), &[]), Err(SearchError::EmptyQuery)));
    }

    #[test]
    fn test_blank_text_with_vector_is_vector_only() {
        assert_eq!(QueryMode::select(Some(""), &[0.3]).unwrap(), QueryMode::Vector);
    }

    #[test]
    fn test_hybrid_statement_shape() {
        let q = build_ranking_query::<Vehicle>(
            QueryMode::Hybrid,
            &[FilterSpec::compare("ano", ">=", 2020)],
            &options(),
        )
        .unwrap();
        assert!(q.sql.contains("FULL OUTER JOIN fulltext_search"));
        assert!(q.sql.contains("RANK() OVER (ORDER BY embedding_main <=> $1, id)"));
        assert!(q.sql.contains("plainto_tsquery('english', $2)"));
        assert!(q.sql.contains("WHERE embedding_main IS NOT NULL AND ano >= $3"));
        assert!(q.sql.contains("@@ query AND ano >= $3"));
        assert_eq!(q.sql.matches("LIMIT 20").count(), 2);
        assert_eq!(q.filters.params, vec![FilterParam::Integer(2020)]);
    }

    #[test]
    fn test_vector_statement_numbers_filters_from_two() {
        let q = build_ranking_query::<Vehicle>(
            QueryMode::Vector,
            &[FilterSpec::compare("fabricante", "=", "Volvo")],
            &options(),
        )
        .unwrap();
        assert!(q.sql.contains("embedding_main <=> $1"));
        assert!(q.sql.contains("AND fabricante = $2"));
        assert!(!q.sql.contains("tsquery"));
        assert!(q.sql.contains("NULL::bigint AS text_rank"));
    }

    #[test]
    fn test_text_statement_uses_first_placeholder_for_query() {
        let q = build_ranking_query::<Refueling>(
            QueryMode::Text,
            &[FilterSpec::date_range("data", "2025-02-01", "2025-02-28")],
            &options(),
        )
        .unwrap();
        assert!(q.sql.contains("plainto_tsquery('english', $1)"));
        assert!(q.sql.contains("AND data BETWEEN $2 AND $3"));
        assert!(!q.sql.contains("<=>"));
        assert!(q.sql.contains("FROM abastecimento"));
    }

    #[test]
    fn test_candidate_limit_applies_per_branch() {
        let mut opts = options();
        opts.candidate_limit = 7;
        let q = build_ranking_query::<Vehicle>(QueryMode::Hybrid, &[], &opts).unwrap();
        assert_eq!(q.sql.matches("LIMIT 7").count(), 2);
    }

    #[test]
    fn test_invalid_filter_stops_statement() {
        let err = build_ranking_query::<Refueling>(
            QueryMode::Text,
            &[FilterSpec::compare("ano", ">=", 2020)],
            &options(),
        )
        .unwrap_err();
        assert!(matches!(err, SearchError::InvalidFilter(_)));
    }

    #[test]
    fn test_text_config_validation() {
        assert!(is_valid_text_config("english"));
        assert!(is_valid_text_config("portuguese"));
        assert!(is_valid_text_config("pg_catalog_simple2"));
        assert!(!is_valid_text_config(""));
        assert!(!is_valid_text_config("english'); DROP TABLE x; --"));
        assert!(!is_valid_text_config("English"));
    }
}
