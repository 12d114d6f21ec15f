//! Structured filters and their translation into parameterized SQL.
//!
//! Filters arrive from the query planner as loosely typed JSON
//! (`{column, operator, value}` or `{column, value: {start_date, end_date}}`).
//! They are checked against the target's column allow-list and rendered as
//! `$n` placeholders; values only ever reach the database as bind
//! parameters.

use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SearchError, SearchResult};

/// Value type of a filterable column. Decides how filter values are coerced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Integer,
    Numeric,
    Date,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
}

impl Column {
    pub const fn new(name: &'static str, kind: ColumnKind) -> Self {
        Self { name, kind }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

impl Operator {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Ge => ">=",
            Self::Le => "<=",
        }
    }
}

impl FromStr for Operator {
    type Err = SearchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "=" => Ok(Self::Eq),
            "!=" => Ok(Self::Ne),
            ">" => Ok(Self::Gt),
            "<" => Ok(Self::Lt),
            ">=" => Ok(Self::Ge),
            "<=" => Ok(Self::Le),
            other => Err(SearchError::invalid_filter(format!(
                "unsupported operator '{other}'"
            ))),
        }
    }
}

/// A filter as produced by the query planner or the CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub column: String,
    #[serde(default, alias = "comparison_operator", skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    pub value: Value,
}

impl FilterSpec {
    pub fn compare(column: &str, operator: &str, value: impl Into<Value>) -> Self {
        Self {
            column: column.to_string(),
            operator: Some(operator.to_string()),
            value: value.into(),
        }
    }

    pub fn date_range(column: &str, start_date: &str, end_date: &str) -> Self {
        Self {
            column: column.to_string(),
            operator: None,
            value: serde_json::json!({ "start_date": start_date, "end_date": end_date }),
        }
    }

    fn is_range(&self) -> bool {
        self.value
            .as_object()
            .is_some_and(|o| o.contains_key("start_date") || o.contains_key("end_date"))
    }
}

/// Operators checked longest first so `>=` is not read as `>`.
const COMPACT_OPERATORS: [&str; 6] = [">=", "<=", "!=", "=", ">", "<"];

impl FromStr for FilterSpec {
    type Err = SearchError;

    /// Parses the compact `column<op>value` form, e.g. `ano>=2020`.
    /// The value stays a string; the column type decides its coercion.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (pos, op) = COMPACT_OPERATORS
            .iter()
            .filter_map(|op| s.find(op).map(|pos| (pos, *op)))
            .min_by_key(|(pos, op)| (*pos, std::cmp::Reverse(op.len())))
            .ok_or_else(|| SearchError::invalid_filter(format!("no operator in '{s}'")))?;

        let column = s[..pos].trim();
        let raw = s[pos + op.len()..].trim();
        if column.is_empty() || raw.is_empty() {
            return Err(SearchError::invalid_filter(format!(
                "expected column{op}value, got '{s}'"
            )));
        }

        let value = raw.trim_matches(|c| c == '\'' || c == '"');
        Ok(Self::compare(column, op, value))
    }
}

/// A filter value ready to be bound, typed after its column.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterParam {
    Text(String),
    Integer(i64),
    Numeric(f64),
    Date(NaiveDate),
}

/// Rendered filters: the same predicate in `WHERE` and `AND` form, plus the
/// parameters its placeholders refer to, in placeholder order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterClause {
    pub where_clause: String,
    pub and_clause: String,
    pub params: Vec<FilterParam>,
}

impl FilterClause {
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// Translate `filters` into SQL predicates over `columns`, numbering
/// placeholders from `first_param`.
///
/// Any filter that does not name an allow-listed column, uses an unknown
/// operator, or carries a value that does not fit the column type fails
/// the whole call.
pub fn build_filter_clause(
    columns: &[Column],
    filters: &[FilterSpec],
    first_param: usize,
) -> SearchResult<FilterClause> {
    if filters.is_empty() {
        return Ok(FilterClause::default());
    }

    let mut predicates = Vec::with_capacity(filters.len());
    let mut params = Vec::new();

    for filter in filters {
        let column = columns
            .iter()
            .find(|c| c.name == filter.column)
            .ok_or_else(|| {
                SearchError::invalid_filter(format!("column '{}' is not searchable", filter.column))
            })?;

        let predicate = if filter.is_range() {
            let (start, end) = parse_range(column, &filter.value)?;
            let n = first_param + params.len();
            params.push(FilterParam::Date(start));
            params.push(FilterParam::Date(end));
            format!("{} BETWEEN ${} AND ${}", column.name, n, n + 1)
        } else {
            let operator: Operator = filter
                .operator
                .as_deref()
                .ok_or_else(|| {
                    SearchError::invalid_filter(format!("missing operator for '{}'", column.name))
                })?
                .parse()?;
            let param = coerce(column, &filter.value)?;
            let n = first_param + params.len();
            params.push(param);
            format!("{} {} ${}", column.name, operator.as_sql(), n)
        };
        predicates.push(predicate);
    }

    let joined = predicates.join(" AND ");
    Ok(FilterClause {
        where_clause: format!("WHERE {joined}"),
        and_clause: format!("AND {joined}"),
        params,
    })
}

fn parse_range(column: &Column, value: &Value) -> SearchResult<(NaiveDate, NaiveDate)> {
    if column.kind != ColumnKind::Date {
        return Err(SearchError::invalid_filter(format!(
            "date range on non-date column '{}'",
            column.name
        )));
    }
    let bound = |key: &str| -> SearchResult<NaiveDate> {
        let raw = value.get(key).and_then(Value::as_str).ok_or_else(|| {
            SearchError::invalid_filter(format!("date range on '{}' needs {key}", column.name))
        })?;
        parse_date(column, raw)
    };
    let start = bound("start_date")?;
    let end = bound("end_date")?;
    if start > end {
        return Err(SearchError::invalid_filter(format!(
            "date range on '{}' starts after it ends",
            column.name
        )));
    }
    Ok((start, end))
}

fn parse_date(column: &Column, raw: &str) -> SearchResult<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
        SearchError::invalid_filter(format!("'{raw}' is not a YYYY-MM-DD date for '{}'", column.name))
    })
}

fn coerce(column: &Column, value: &Value) -> SearchResult<FilterParam> {
    let mismatch = || {
        SearchError::invalid_filter(format!(
            "value {value} does not fit column '{}' ({:?})",
            column.name, column.kind
        ))
    };

    match column.kind {
        ColumnKind::Text => match value {
            Value::String(s) => Ok(FilterParam::Text(s.clone())),
            Value::Number(n) => Ok(FilterParam::Text(n.to_string())),
            _ => Err(mismatch()),
        },
        ColumnKind::Integer => match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| fits_i64(*f)).map(|f| f as i64))
                .map(FilterParam::Integer)
                .ok_or_else(mismatch),
            Value::String(s) => s
                .trim()
                .parse()
                .map(FilterParam::Integer)
                .map_err(|_| mismatch()),
            _ => Err(mismatch()),
        },
        ColumnKind::Numeric => match value {
            Value::Number(n) => n.as_f64().map(FilterParam::Numeric).ok_or_else(mismatch),
            Value::String(s) => s
                .trim()
                .parse()
                .map(FilterParam::Numeric)
                .map_err(|_| mismatch()),
            _ => Err(mismatch()),
        },
        ColumnKind::Date => match value {
            Value::String(s) => parse_date(column, s).map(FilterParam::Date),
            _ => Err(mismatch()),
        },
    }
}

/// Whole numbers in `[-2^63, 2^63)`; anything else would saturate on `as i64`.
fn fits_i64(f: f64) -> bool {
    f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64
}
