//! Encoding of query results into response bodies.
//!
//! JSON carries every query result. CSV and XLSX only carry the first one,
//! which is how chart data exports have always behaved.

use chrono::Utc;
use rust_xlsxwriter::{Workbook, XlsxError};
use serde_json::{Map, Value};

use chartdata_error::{ChartDataError, ErrorCode, Result};

use crate::query_context::ResultFormat;
use crate::result::QueryResult;

pub const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";
pub const CSV_CONTENT_TYPE: &str = "text/csv; charset=utf-8";
pub const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

pub const XLSX_SHEET_NAME: &str = "Sheet 1";

/// An encoded response body.
#[derive(Debug, Clone)]
pub struct FormattedResponse {
    pub body: Vec<u8>,
    pub content_type: &'static str,
    /// Set for attachments
    pub filename: Option<String>,
}

pub fn format_results(format: ResultFormat, results: &[QueryResult]) -> Result<FormattedResponse> {
    match format {
        ResultFormat::Json => to_json(results),
        ResultFormat::Csv => Ok(FormattedResponse {
            body: to_csv(first(results)?)?,
            content_type: CSV_CONTENT_TYPE,
            filename: Some(attachment_name("csv")),
        }),
        ResultFormat::Xlsx => Ok(FormattedResponse {
            body: to_xlsx(first(results)?)?,
            content_type: XLSX_CONTENT_TYPE,
            filename: Some(attachment_name("xlsx")),
        }),
    }
}

fn first(results: &[QueryResult]) -> Result<&QueryResult> {
    results
        .first()
        .ok_or_else(|| ChartDataError::internal("No query results to encode"))
}

fn attachment_name(extension: &str) -> String {
    format!("{}.{}", Utc::now().format("%Y%m%d_%H%M%S"), extension)
}

fn to_json(results: &[QueryResult]) -> Result<FormattedResponse> {
    #[derive(serde::Serialize)]
    struct Body<'a> {
        result: &'a [QueryResult],
    }

    Ok(FormattedResponse {
        body: serde_json::to_vec(&Body { result: results })?,
        content_type: JSON_CONTENT_TYPE,
        filename: None,
    })
}

fn cell_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn row_values<'a>(row: &'a Map<String, Value>, colnames: &'a [String]) -> impl Iterator<Item = Option<&'a Value>> {
    colnames.iter().map(move |name| row.get(name))
}

pub fn to_csv(result: &QueryResult) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(&result.colnames).map_err(csv_error)?;
    for row in &result.data {
        writer
            .write_record(row_values(row, &result.colnames).map(cell_text))
            .map_err(csv_error)?;
    }
    writer
        .into_inner()
        .map_err(|e| ChartDataError::new(ErrorCode::SerializationFailed, e.to_string()))
}

fn csv_error(err: csv::Error) -> ChartDataError {
    ChartDataError::new(ErrorCode::SerializationFailed, format!("CSV encoding failed: {}", err))
}

pub fn to_xlsx(result: &QueryResult) -> Result<Vec<u8>> {
    build_workbook(result).map_err(|e| {
        ChartDataError::new(ErrorCode::SerializationFailed, format!("XLSX encoding failed: {}", e))
    })
}

fn build_workbook(result: &QueryResult) -> std::result::Result<Vec<u8>, XlsxError> {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name(XLSX_SHEET_NAME)?;

    for (col, name) in result.colnames.iter().enumerate() {
        sheet.write_string(0, col as u16, name.as_str())?;
    }

    for (i, row) in result.data.iter().enumerate() {
        let r = (i + 1) as u32;
        for (col, value) in row_values(row, &result.colnames).enumerate() {
            let c = col as u16;
            match value {
                None | Some(Value::Null) => {}
                Some(Value::Number(n)) => match n.as_f64() {
                    Some(f) => {
                        sheet.write_number(r, c, f)?;
                    }
                    None => {
                        sheet.write_string(r, c, n.to_string())?;
                    }
                },
                Some(Value::Bool(b)) => {
                    sheet.write_boolean(r, c, *b)?;
                }
                Some(Value::String(s)) => {
                    sheet.write_string(r, c, s.as_str())?;
                }
                Some(other) => {
                    sheet.write_string(r, c, other.to_string())?;
                }
            }
        }
    }

    workbook.save_to_buffer()
}
