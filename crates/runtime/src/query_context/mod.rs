//! Query context model.
//!
//! A query context describes one or more queries against a datasource plus the
//! encoding the caller wants back. It is built only through
//! [`validator::validate_query_context`] and is immutable afterwards.

pub mod validator;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use chartdata_error::{ChartDataError, ErrorCode, ErrorContext};

pub use validator::validate_query_context;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryContext {
    pub datasource: Option<DatasourceRef>,
    pub queries: Vec<QueryObject>,
    pub result_format: ResultFormat,
    pub result_type: ResultType,
    /// Bypass cached per-query results.
    #[serde(default)]
    pub force: bool,
    /// Seconds; overrides datasource and system cache timeouts.
    pub custom_cache_timeout: Option<u64>,
}

impl QueryContext {
    /// True when the request may be served through the async job path.
    pub fn is_async_eligible(&self) -> bool {
        self.result_format == ResultFormat::Json && self.result_type == ResultType::Full
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasourceRef {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryObject {
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub groupby: Vec<String>,
    #[serde(default)]
    pub metrics: Vec<Metric>,
    #[serde(default)]
    pub filters: Vec<QueryFilter>,
    #[serde(default)]
    pub orderby: Vec<OrderBy>,
    #[serde(default = "default_order_desc")]
    pub order_desc: bool,
    pub row_limit: Option<usize>,
    #[serde(default)]
    pub row_offset: usize,
}

fn default_order_desc() -> bool {
    true
}

impl QueryObject {
    pub fn is_aggregate(&self) -> bool {
        !self.metrics.is_empty()
    }

    /// Output labels in result order: groupby (or raw columns), then metrics.
    pub fn labels(&self) -> Vec<String> {
        let dims = if self.is_aggregate() || self.columns.is_empty() {
            &self.groupby
        } else {
            &self.columns
        };
        dims.iter()
            .cloned()
            .chain(self.metrics.iter().map(Metric::label))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Aggregate {
    Count,
    CountDistinct,
    Sum,
    Avg,
    Min,
    Max,
}

impl Aggregate {
    pub const ALL: [Aggregate; 6] = [
        Aggregate::Count,
        Aggregate::CountDistinct,
        Aggregate::Sum,
        Aggregate::Avg,
        Aggregate::Min,
        Aggregate::Max,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Count => "COUNT",
            Self::CountDistinct => "COUNT_DISTINCT",
            Self::Sum => "SUM",
            Self::Avg => "AVG",
            Self::Min => "MIN",
            Self::Max => "MAX",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str().eq_ignore_ascii_case(s))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Metric {
    /// `COUNT(*)`, requested as the plain string `count`
    Count,
    /// `<agg>__<column>` shorthand or a simple adhoc metric
    Simple {
        aggregate: Aggregate,
        column: String,
        label: Option<String>,
    },
}

impl Metric {
    pub fn label(&self) -> String {
        match self {
            Metric::Count => "count".to_string(),
            Metric::Simple {
                label: Some(label), ..
            } => label.clone(),
            Metric::Simple {
                aggregate, column, ..
            } => format!("{}({})", aggregate.as_str(), column),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    NotEq,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    GtEq,
    #[serde(rename = "<=")]
    LtEq,
    #[serde(rename = "IN")]
    In,
    #[serde(rename = "NOT IN")]
    NotIn,
    #[serde(rename = "IS NULL")]
    IsNull,
    #[serde(rename = "IS NOT NULL")]
    IsNotNull,
    #[serde(rename = "LIKE")]
    Like,
}

impl FilterOp {
    pub fn parse(s: &str) -> Option<Self> {
        let op = match s.trim().to_ascii_uppercase().as_str() {
            "==" | "=" => Self::Eq,
            "!=" | "<>" => Self::NotEq,
            ">" => Self::Gt,
            "<" => Self::Lt,
            ">=" => Self::GtEq,
            "<=" => Self::LtEq,
            "IN" => Self::In,
            "NOT IN" => Self::NotIn,
            "IS NULL" => Self::IsNull,
            "IS NOT NULL" => Self::IsNotNull,
            "LIKE" => Self::Like,
            _ => return None,
        };
        Some(op)
    }

    pub fn takes_list(&self) -> bool {
        matches!(self, Self::In | Self::NotIn)
    }

    pub fn is_unary(&self) -> bool {
        matches!(self, Self::IsNull | Self::IsNotNull)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryFilter {
    pub col: String,
    pub op: FilterOp,
    #[serde(default)]
    pub val: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
    pub label: String,
    pub ascending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResultFormat {
    #[default]
    Json,
    Csv,
    Xlsx,
}

impl ResultFormat {
    pub const SUPPORTED: [&'static str; 3] = ["json", "csv", "xlsx"];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
            Self::Xlsx => "xlsx",
        }
    }
}

impl fmt::Display for ResultFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResultFormat {
    type Err = ChartDataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            "xlsx" => Ok(Self::Xlsx),
            _ => Err(unsupported_format(s)),
        }
    }
}

pub fn unsupported_format(value: &str) -> ChartDataError {
    ChartDataError::new(
        ErrorCode::UnsupportedFormat,
        format!("Unsupported result_format: {}", value),
    )
    .with_context(ErrorContext::UnsupportedFormat {
        value: value.to_string(),
        supported: ResultFormat::SUPPORTED.iter().map(|s| s.to_string()).collect(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResultType {
    /// Execute and return rows plus metadata
    #[default]
    Full,
    /// Return the generated query without executing it
    Query,
}

impl FromStr for ResultType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "query" => Ok(Self::Query),
            other => Err(format!("Must be one of: full, query. Got '{}'.", other)),
        }
    }
}
