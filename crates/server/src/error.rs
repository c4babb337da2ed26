use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use chartdata_error::{ChartDataError, ErrorCode};

/// A [`ChartDataError`] on its way out of a handler.
///
/// The body is always `{"message": ...}`. Chart validation failures put the
/// per-field messages object in `message`. Every other error, including a
/// rejected chart data request, carries its message string. Server errors are
/// logged to the `errors` target.
#[derive(Debug)]
pub struct ApiError(pub ChartDataError);

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl From<ChartDataError> for ApiError {
    fn from(err: ChartDataError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self(ChartDataError::new(code, message))
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.0.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn body(&self) -> Value {
        if self.0.code == ErrorCode::ValidationFailed {
            return json!({ "message": self.0.message });
        }
        match self.0.context.as_ref().and_then(|c| c.field_messages()) {
            Some(fields) => json!({ "message": fields }),
            None => json!({ "message": self.0.message }),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(
                target: "errors",
                code = %self.0.code,
                status = status.as_u16(),
                "{}",
                self.0
            );
        }
        (status, Json(self.body())).into_response()
    }
}
