//! # chartdata-error
//!
//! Unified error type for the chart data gateway.
//!
//! Every failure carries:
//! - A stable numeric code (CHART-XXXX) that also fixes the HTTP status
//! - Optional structured JSON context (per-field messages, cache keys, ids)
//! - An optional hint for self-correction

mod code;
mod context;
mod convert;

pub use code::{ErrorCategory, ErrorCode};
pub use context::ErrorContext;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The unified error type for all chart data operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartDataError {
    /// Numeric error code (e.g., "CHART-2001")
    pub code: ErrorCode,

    /// Human-readable error message
    pub message: String,

    /// Structured context for programmatic handling
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ErrorContext>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,

    /// Correlation ID (async job id or request id)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl ChartDataError {
    /// Create a new error with code and message
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: None,
            hint: None,
            trace_id: None,
        }
    }

    /// Field validation failure carrying every offending field.
    pub fn fields(
        code: ErrorCode,
        message: impl Into<String>,
        errors: BTreeMap<String, Vec<String>>,
    ) -> Self {
        Self::new(code, message).with_context(ErrorContext::Fields { errors })
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    /// Add structured context
    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Add trace ID for correlation
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// HTTP status code for this error
    pub fn status(&self) -> u16 {
        self.code.http_status()
    }

    /// Serialize to JSON for API responses and job events
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::warn!("Failed to serialize ChartDataError: {}", e);
            format!(
                r#"{{"code":"{}","message":"Serialization failed"}}"#,
                self.code
            )
        })
    }
}

impl fmt::Display for ChartDataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, " (Hint: {})", hint)?;
        }
        Ok(())
    }
}

impl std::error::Error for ChartDataError {}

/// Result type alias for chart data operations
pub type Result<T> = std::result::Result<T, ChartDataError>;
