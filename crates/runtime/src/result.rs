use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::engine::{EngineOutput, GenericDataType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Success,
    Failed,
}

/// Result of one query object.
///
/// Lives only as long as it takes to serialize it, either into the cache or
/// into a response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub cache_key: Option<String>,
    /// RFC 3339 time the cached payload was written
    pub cached_dttm: Option<String>,
    pub cache_timeout: u64,
    pub is_cached: bool,
    pub status: QueryStatus,
    pub query: String,
    pub applied_row_limit: Option<usize>,
    pub colnames: Vec<String>,
    pub coltypes: Vec<GenericDataType>,
    pub rowcount: usize,
    pub duration_ms: u64,
    pub data: Vec<Map<String, Value>>,
}

impl QueryResult {
    pub fn from_output(output: EngineOutput, row_limit: Option<usize>, duration_ms: u64) -> Self {
        Self {
            cache_key: None,
            cached_dttm: None,
            cache_timeout: 0,
            is_cached: false,
            status: QueryStatus::Success,
            query: output.query,
            applied_row_limit: row_limit,
            colnames: output.colnames,
            coltypes: output.coltypes,
            rowcount: output.rows.len(),
            duration_ms,
            data: output.rows,
        }
    }

    /// A result that only carries the generated query text.
    pub fn query_only(query: String) -> Self {
        Self {
            cache_key: None,
            cached_dttm: None,
            cache_timeout: 0,
            is_cached: false,
            status: QueryStatus::Success,
            query,
            applied_row_limit: None,
            colnames: vec![],
            coltypes: vec![],
            rowcount: 0,
            duration_ms: 0,
            data: vec![],
        }
    }
}
