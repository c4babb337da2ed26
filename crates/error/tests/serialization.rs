use chartdata_error::{ChartDataError, ErrorCode, ErrorContext};
use serde_json::Value;

#[test]
fn test_json_serialization() {
    let error = ChartDataError::new(ErrorCode::UnsupportedFormat, "Unsupported result_format: pdf")
        .with_context(ErrorContext::UnsupportedFormat {
            value: "pdf".to_string(),
            supported: vec!["json".to_string(), "csv".to_string(), "xlsx".to_string()],
        })
        .with_hint("Use one of json, csv, xlsx");

    let json = error.to_json();
    let v: Value = serde_json::from_str(&json).expect("valid json");

    assert_eq!(v["code"], "CHART-1004");
    assert_eq!(v["message"], "Unsupported result_format: pdf");
    assert_eq!(v["context"]["type"], "unsupported_format");
    assert_eq!(v["context"]["value"], "pdf");
}

#[test]
fn test_error_roundtrip_keeps_code() {
    let error = ChartDataError::new(ErrorCode::CacheLoadFailed, "Error loading data from cache")
        .with_context(ErrorContext::Cache {
            cache_key: "abc".to_string(),
        });
    let de: ChartDataError = serde_json::from_str(&error.to_json()).unwrap();
    assert_eq!(de.code, ErrorCode::CacheLoadFailed);
    assert_eq!(de.status(), 422);
}

#[test]
fn test_error_code_parsing() {
    let code: ErrorCode = "CHART-4003".to_string().try_into().unwrap();
    assert_eq!(code, ErrorCode::AsyncTokenInvalid);
}
