//! Query execution backends.
//!
//! The gateway only talks to [`QueryEngine`]; [`DataFusionEngine`] evaluates
//! query objects against CSV files and in-memory Arrow batches.

mod datafusion_engine;

pub use datafusion_engine::DataFusionEngine;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use chartdata_error::Result;

use crate::query_context::QueryObject;

/// Coarse column type reported alongside result rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GenericDataType {
    Numeric,
    String,
    Temporal,
    Boolean,
}

#[derive(Debug, Clone, Default)]
pub struct EngineOutput {
    pub colnames: Vec<String>,
    pub coltypes: Vec<GenericDataType>,
    pub rows: Vec<Map<String, Value>>,
    /// Generated query text
    pub query: String,
}

#[async_trait]
pub trait QueryEngine: Send + Sync {
    fn has_datasource(&self, datasource_id: i64) -> bool;

    /// Render the query a query object would run, without running it.
    async fn query_text(&self, datasource_id: i64, query: &QueryObject) -> Result<String>;

    async fn execute(&self, datasource_id: i64, query: &QueryObject) -> Result<EngineOutput>;
}
