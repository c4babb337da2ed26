//! # Error Contexts
//!
//! Structured metadata attached to errors so API clients can react to them
//! without parsing messages.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorContext {
    /// Every offending field path with its messages (CHART-1002, 3002, 3004)
    Fields {
        errors: BTreeMap<String, Vec<String>>,
    },

    /// Context for CHART-1004
    UnsupportedFormat { value: String, supported: Vec<String> },

    /// Context for CHART-2002/2003
    Cache { cache_key: String },

    /// Context for CHART-2001 when the engine reports an unknown column
    FieldNotFound {
        field: String,
        available_fields: Vec<String>,
    },

    /// Context for CHART-3001/4002
    Resource { resource: String, ids: Vec<i64> },

    /// Generic key-value context for extensibility
    Generic {
        #[serde(flatten)]
        data: std::collections::HashMap<String, serde_json::Value>,
    },
}

impl ErrorContext {
    /// Field errors rendered as a JSON object (`{"field": ["msg"]}`).
    pub fn field_messages(&self) -> Option<serde_json::Value> {
        match self {
            Self::Fields { errors } => serde_json::to_value(errors).ok(),
            _ => None,
        }
    }
}
