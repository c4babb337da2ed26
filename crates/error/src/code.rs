use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric error codes following CHART-XXXX format.
///
/// ## Code Ranges
/// - **1000-1999**: Request validation errors
/// - **2000-2999**: Query execution and result cache errors
/// - **3000-3999**: Chart resource (command) errors
/// - **4000-4999**: Authentication/Authorization errors
/// - **5000-5999**: Internal/System errors
///
/// Codes are stable across versions (semver contract).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
#[non_exhaustive]
pub enum ErrorCode {
    // === Request Errors (1000-1999) ===
    /// CHART-1001: Body is not JSON
    RequestNotJson = 1001,
    /// CHART-1002: Payload failed shape validation
    ValidationFailed = 1002,
    /// CHART-1003: Query object is well formed but semantically invalid
    QueryObjectInvalid = 1003,
    /// CHART-1004: Result format not supported
    UnsupportedFormat = 1004,
    /// CHART-1005: Malformed query string argument
    InvalidArgument = 1005,

    // === Query Errors (2000-2999) ===
    /// CHART-2001: Datasource or query engine failure
    QueryFailed = 2001,
    /// CHART-2002: Cached results required but missing
    CacheLoadFailed = 2002,
    /// CHART-2003: No query context cached under the key
    CacheKeyNotFound = 2003,
    /// CHART-2004: Datasource not registered
    DatasourceNotFound = 2004,

    // === Chart Errors (3000-3999) ===
    /// CHART-3001: Chart does not exist
    ChartNotFound = 3001,
    /// CHART-3002: Chart payload failed domain validation
    ChartInvalid = 3002,
    /// CHART-3003: Create/update/delete failed
    CommandFailed = 3003,
    /// CHART-3004: Import bundle failed validation
    CommandInvalid = 3004,
    /// CHART-3005: Screenshot not available
    ScreenshotNotFound = 3005,

    // === Auth Errors (4000-4999) ===
    /// CHART-4001: Request is not authenticated
    Unauthorized = 4001,
    /// CHART-4002: Caller lacks ownership or permission
    Forbidden = 4002,
    /// CHART-4003: Async query token missing or invalid
    AsyncTokenInvalid = 4003,

    // === Internal Errors (5000-5999) ===
    /// CHART-5001: Serialization/deserialization failed
    SerializationFailed = 5001,
    /// CHART-5002: Unexpected internal state
    Internal = 5002,
    /// CHART-5003: Async job could not be enqueued
    JobQueueUnavailable = 5003,

    /// CHART-9999: Unknown/unclassified error
    Unknown = 9999,
}

impl ErrorCode {
    /// Get the numeric code value
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }

    /// Get the formatted code string (e.g., "CHART-2001")
    pub fn as_str(&self) -> String {
        format!("CHART-{:04}", self.as_u16())
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self.as_u16() {
            1000..=1999 => ErrorCategory::Request,
            2000..=2999 => ErrorCategory::Query,
            3000..=3999 => ErrorCategory::Resource,
            4000..=4999 => ErrorCategory::Auth,
            _ => ErrorCategory::Internal,
        }
    }

    /// HTTP status this code surfaces as at the REST boundary.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::RequestNotJson
            | Self::ValidationFailed
            | Self::QueryObjectInvalid
            | Self::UnsupportedFormat
            | Self::InvalidArgument
            | Self::QueryFailed => 400,
            Self::Unauthorized | Self::AsyncTokenInvalid => 401,
            Self::Forbidden => 403,
            Self::CacheKeyNotFound | Self::ChartNotFound | Self::ScreenshotNotFound => 404,
            Self::CacheLoadFailed
            | Self::DatasourceNotFound
            | Self::ChartInvalid
            | Self::CommandFailed
            | Self::CommandInvalid => 422,
            Self::JobQueueUnavailable => 503,
            Self::SerializationFailed | Self::Internal | Self::Unknown => 500,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> String {
        code.as_str()
    }
}

impl TryFrom<String> for ErrorCode {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        let num: u16 = s
            .strip_prefix("CHART-")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| "Invalid format".to_string())?;
        Self::try_from(num).map_err(|_| "Unknown code".to_string())
    }
}

impl TryFrom<u16> for ErrorCode {
    type Error = String;

    fn try_from(n: u16) -> std::result::Result<Self, Self::Error> {
        match n {
            1001 => Ok(Self::RequestNotJson),
            1002 => Ok(Self::ValidationFailed),
            1003 => Ok(Self::QueryObjectInvalid),
            1004 => Ok(Self::UnsupportedFormat),
            1005 => Ok(Self::InvalidArgument),
            2001 => Ok(Self::QueryFailed),
            2002 => Ok(Self::CacheLoadFailed),
            2003 => Ok(Self::CacheKeyNotFound),
            2004 => Ok(Self::DatasourceNotFound),
            3001 => Ok(Self::ChartNotFound),
            3002 => Ok(Self::ChartInvalid),
            3003 => Ok(Self::CommandFailed),
            3004 => Ok(Self::CommandInvalid),
            3005 => Ok(Self::ScreenshotNotFound),
            4001 => Ok(Self::Unauthorized),
            4002 => Ok(Self::Forbidden),
            4003 => Ok(Self::AsyncTokenInvalid),
            5001 => Ok(Self::SerializationFailed),
            5002 => Ok(Self::Internal),
            5003 => Ok(Self::JobQueueUnavailable),
            9999 => Ok(Self::Unknown),
            _ => Err(format!("Unknown error code: {}", n)),
        }
    }
}

/// High-level error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ErrorCategory {
    Request,
    Query,
    Resource,
    Auth,
    Internal,
}
