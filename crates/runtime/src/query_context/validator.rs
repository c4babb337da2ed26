//! Query context validation.
//!
//! Shape errors are collected for every field before failing, keyed by their
//! dotted path (`queries.0.row_limit`). Semantic rules only run once the shape
//! is valid and fail with [`ErrorCode::QueryObjectInvalid`].

use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};

use chartdata_error::{ChartDataError, ErrorCode, Result};

use super::{
    unsupported_format, Aggregate, DatasourceRef, FilterOp, Metric, OrderBy, QueryContext,
    QueryFilter, QueryObject, ResultFormat, ResultType,
};

const MISSING: &str = "Missing data for required field.";
const NOT_INT: &str = "Not a valid integer.";
const NOT_STR: &str = "Not a valid string.";
const NOT_LIST: &str = "Not a valid list.";
const NOT_BOOL: &str = "Not a valid boolean.";
const NOT_OBJECT: &str = "Invalid input type.";
const NEGATIVE: &str = "Must be greater than or equal to 0.";

#[derive(Default)]
struct FieldErrors {
    errors: BTreeMap<String, Vec<String>>,
}

impl FieldErrors {
    fn add(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.errors
            .entry(path.into())
            .or_default()
            .push(message.into());
    }

    fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

fn join(path: &str, field: &str) -> String {
    if path.is_empty() {
        field.to_string()
    } else {
        format!("{}.{}", path, field)
    }
}

/// Validate a raw payload into a [`QueryContext`].
pub fn validate_query_context(raw: &Value) -> Result<QueryContext> {
    let mut errs = FieldErrors::default();

    let Some(obj) = raw.as_object() else {
        errs.add("_schema", NOT_OBJECT);
        return Err(shape_error(errs));
    };

    let datasource = match obj.get("datasource") {
        None | Some(Value::Null) => None,
        Some(v) => parse_datasource(v, &mut errs),
    };

    let queries = match obj.get("queries") {
        None | Some(Value::Null) => {
            errs.add("queries", MISSING);
            vec![]
        }
        Some(Value::Array(items)) => {
            if items.is_empty() {
                errs.add("queries", "Shorter than minimum length 1.");
            }
            items
                .iter()
                .enumerate()
                .map(|(i, item)| parse_query_object(item, &format!("queries.{}", i), &mut errs))
                .collect()
        }
        Some(_) => {
            errs.add("queries", NOT_LIST);
            vec![]
        }
    };

    let mut unsupported: Option<String> = None;
    let format_value = obj.get("result_format").or_else(|| obj.get("format"));
    let result_format = match format_value {
        None | Some(Value::Null) => ResultFormat::default(),
        Some(Value::String(s)) => match s.parse::<ResultFormat>() {
            Ok(format) => format,
            Err(_) => {
                unsupported = Some(s.clone());
                errs.add(
                    "result_format",
                    format!(
                        "Unsupported result_format: {}. Must be one of: {}.",
                        s,
                        ResultFormat::SUPPORTED.join(", ")
                    ),
                );
                ResultFormat::default()
            }
        },
        Some(_) => {
            errs.add("result_format", NOT_STR);
            ResultFormat::default()
        }
    };

    let result_type = match obj.get("result_type") {
        None | Some(Value::Null) => ResultType::default(),
        Some(Value::String(s)) => s.parse::<ResultType>().unwrap_or_else(|msg| {
            errs.add("result_type", msg);
            ResultType::default()
        }),
        Some(_) => {
            errs.add("result_type", NOT_STR);
            ResultType::default()
        }
    };

    let force = parse_bool(obj, "force", "", false, &mut errs);

    let timeout_value = obj
        .get("custom_cache_timeout")
        .or_else(|| obj.get("cache_timeout"));
    let custom_cache_timeout = match timeout_value {
        None | Some(Value::Null) => None,
        Some(v) => parse_non_negative(v, "custom_cache_timeout", &mut errs).map(|n| n as u64),
    };

    if !errs.is_empty() {
        // A wrong format alone is reported as such, naming the value.
        if let (Some(value), 1) = (&unsupported, errs.errors.len()) {
            return Err(unsupported_format(value));
        }
        return Err(shape_error(errs));
    }

    let context = QueryContext {
        datasource,
        queries,
        result_format,
        result_type,
        force,
        custom_cache_timeout,
    };
    check_semantics(&context)?;
    Ok(context)
}

fn shape_error(errs: FieldErrors) -> ChartDataError {
    let rendered = serde_json::to_string(&errs.errors).unwrap_or_default();
    ChartDataError::fields(
        ErrorCode::ValidationFailed,
        format!("Request is incorrect: {}", rendered),
        errs.errors,
    )
}

fn parse_datasource(value: &Value, errs: &mut FieldErrors) -> Option<DatasourceRef> {
    let Some(obj) = value.as_object() else {
        errs.add("datasource", NOT_OBJECT);
        return None;
    };

    let id = match obj.get("id") {
        None | Some(Value::Null) => {
            errs.add("datasource.id", MISSING);
            None
        }
        Some(Value::String(s)) => s.parse::<i64>().ok().or_else(|| {
            errs.add("datasource.id", NOT_INT);
            None
        }),
        Some(v) => v.as_i64().or_else(|| {
            errs.add("datasource.id", NOT_INT);
            None
        }),
    };

    let kind = match obj.get("type") {
        None | Some(Value::Null) => "table".to_string(),
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(_) => {
            errs.add("datasource.type", NOT_STR);
            String::new()
        }
    };

    id.map(|id| DatasourceRef { id, kind })
}

fn parse_query_object(value: &Value, path: &str, errs: &mut FieldErrors) -> QueryObject {
    let Some(obj) = value.as_object() else {
        errs.add(path, NOT_OBJECT);
        return QueryObject::default();
    };

    let columns = parse_string_list(obj, "columns", path, errs);
    let groupby = parse_string_list(obj, "groupby", path, errs);

    let metrics = match obj.get("metrics") {
        None | Some(Value::Null) => vec![],
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .filter_map(|(i, m)| parse_metric(m, &format!("{}.metrics.{}", path, i), errs))
            .collect(),
        Some(_) => {
            errs.add(join(path, "metrics"), NOT_LIST);
            vec![]
        }
    };

    let filters = match obj.get("filters") {
        None | Some(Value::Null) => vec![],
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .filter_map(|(i, f)| parse_filter(f, &format!("{}.filters.{}", path, i), errs))
            .collect(),
        Some(_) => {
            errs.add(join(path, "filters"), NOT_LIST);
            vec![]
        }
    };

    let orderby = match obj.get("orderby") {
        None | Some(Value::Null) => vec![],
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .filter_map(|(i, o)| parse_orderby(o, &format!("{}.orderby.{}", path, i), errs))
            .collect(),
        Some(_) => {
            errs.add(join(path, "orderby"), NOT_LIST);
            vec![]
        }
    };

    let order_desc = parse_bool(obj, "order_desc", path, true, errs);

    let row_limit = match obj.get("row_limit") {
        None | Some(Value::Null) => None,
        Some(v) => parse_non_negative(v, &join(path, "row_limit"), errs),
    };

    let row_offset = match obj.get("row_offset") {
        None | Some(Value::Null) => 0,
        Some(v) => parse_non_negative(v, &join(path, "row_offset"), errs).unwrap_or(0),
    };

    QueryObject {
        columns,
        groupby,
        metrics,
        filters,
        orderby,
        order_desc,
        row_limit,
        row_offset,
    }
}

fn parse_string_list(
    obj: &Map<String, Value>,
    field: &str,
    path: &str,
    errs: &mut FieldErrors,
) -> Vec<String> {
    match obj.get(field) {
        None | Some(Value::Null) => vec![],
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| match item.as_str() {
                Some(s) if !s.is_empty() => Some(s.to_string()),
                _ => {
                    errs.add(format!("{}.{}", join(path, field), i), NOT_STR);
                    None
                }
            })
            .collect(),
        Some(_) => {
            errs.add(join(path, field), NOT_LIST);
            vec![]
        }
    }
}

fn parse_bool(
    obj: &Map<String, Value>,
    field: &str,
    path: &str,
    default: bool,
    errs: &mut FieldErrors,
) -> bool {
    match obj.get(field) {
        None | Some(Value::Null) => default,
        Some(Value::Bool(b)) => *b,
        Some(_) => {
            errs.add(join(path, field), NOT_BOOL);
            default
        }
    }
}

fn parse_non_negative(value: &Value, path: &str, errs: &mut FieldErrors) -> Option<usize> {
    if let Some(n) = value.as_u64() {
        return Some(n as usize);
    }
    if value.as_i64().is_some() {
        errs.add(path, NEGATIVE);
    } else {
        errs.add(path, NOT_INT);
    }
    None
}

fn parse_metric(value: &Value, path: &str, errs: &mut FieldErrors) -> Option<Metric> {
    match value {
        Value::String(name) => {
            if name.eq_ignore_ascii_case("count") {
                return Some(Metric::Count);
            }
            let parsed = name.split_once("__").and_then(|(agg, column)| {
                let aggregate = Aggregate::parse(agg)?;
                (!column.is_empty()).then(|| Metric::Simple {
                    aggregate,
                    column: column.to_string(),
                    label: Some(name.clone()),
                })
            });
            if parsed.is_none() {
                errs.add(
                    path,
                    format!(
                        "Unknown metric '{}'. Use 'count', '<aggregate>__<column>' or an adhoc metric.",
                        name
                    ),
                );
            }
            parsed
        }
        Value::Object(obj) => {
            let expression_type = obj
                .get("expressionType")
                .and_then(Value::as_str)
                .unwrap_or("SIMPLE");
            if !expression_type.eq_ignore_ascii_case("SIMPLE") {
                errs.add(
                    join(path, "expressionType"),
                    format!("Unsupported expressionType '{}'.", expression_type),
                );
                return None;
            }

            let aggregate = match obj.get("aggregate").and_then(Value::as_str) {
                Some(agg) => Aggregate::parse(agg).or_else(|| {
                    errs.add(
                        join(path, "aggregate"),
                        format!(
                            "Must be one of: {}.",
                            Aggregate::ALL.map(|a| a.as_str()).join(", ")
                        ),
                    );
                    None
                }),
                None => {
                    errs.add(join(path, "aggregate"), MISSING);
                    None
                }
            };

            let column = match obj.get("column") {
                Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
                Some(Value::Object(col)) => match col.get("column_name").and_then(Value::as_str) {
                    Some(name) if !name.is_empty() => Some(name.to_string()),
                    _ => {
                        errs.add(join(path, "column.column_name"), MISSING);
                        None
                    }
                },
                _ => {
                    errs.add(join(path, "column"), MISSING);
                    None
                }
            };

            let label = match obj.get("label") {
                None | Some(Value::Null) => None,
                Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
                Some(_) => {
                    errs.add(join(path, "label"), NOT_STR);
                    None
                }
            };

            Some(Metric::Simple {
                aggregate: aggregate?,
                column: column?,
                label,
            })
        }
        _ => {
            errs.add(path, "Not a valid metric.");
            None
        }
    }
}

fn parse_filter(value: &Value, path: &str, errs: &mut FieldErrors) -> Option<QueryFilter> {
    let Some(obj) = value.as_object() else {
        errs.add(path, NOT_OBJECT);
        return None;
    };

    let col = match obj.get("col").and_then(Value::as_str) {
        Some(c) if !c.is_empty() => Some(c.to_string()),
        _ => {
            errs.add(join(path, "col"), MISSING);
            None
        }
    };

    let op = match obj.get("op").and_then(Value::as_str) {
        Some(op) => FilterOp::parse(op).or_else(|| {
            errs.add(join(path, "op"), format!("Unsupported filter operator '{}'.", op));
            None
        }),
        None => {
            errs.add(join(path, "op"), MISSING);
            None
        }
    };

    let val = obj.get("val").cloned().unwrap_or(Value::Null);
    if let Some(op) = op {
        let val_ok = if op.is_unary() {
            true
        } else if op.takes_list() {
            val.as_array()
                .is_some_and(|items| items.iter().all(is_scalar))
        } else {
            is_scalar(&val)
        };
        if !val_ok {
            let msg = if op.takes_list() {
                "Must be a list of scalar values."
            } else {
                "Must be a scalar value."
            };
            errs.add(join(path, "val"), msg);
        }
    }

    Some(QueryFilter {
        col: col?,
        op: op?,
        val,
    })
}

fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

fn parse_orderby(value: &Value, path: &str, errs: &mut FieldErrors) -> Option<OrderBy> {
    let Some(pair) = value.as_array().filter(|p| p.len() == 2) else {
        errs.add(path, "Must be a [column, ascending] pair.");
        return None;
    };

    let label = match &pair[0] {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        metric @ Value::Object(_) => {
            parse_metric(metric, &format!("{}.0", path), errs).map(|m| m.label())
        }
        _ => {
            errs.add(format!("{}.0", path), NOT_STR);
            None
        }
    };

    let ascending = pair[1].as_bool().or_else(|| {
        errs.add(format!("{}.1", path), NOT_BOOL);
        None
    });

    Some(OrderBy {
        label: label?,
        ascending: ascending?,
    })
}

fn check_semantics(context: &QueryContext) -> Result<()> {
    let mut problems = Vec::new();

    for query in &context.queries {
        if query.columns.is_empty() && query.groupby.is_empty() && query.metrics.is_empty() {
            problems.push("Empty query?".to_string());
            continue;
        }

        if !query.columns.is_empty() && query.is_aggregate() {
            problems.push(
                "Raw columns cannot be combined with metrics, use groupby instead.".to_string(),
            );
        }

        let labels = query.labels();
        let mut seen = HashSet::new();
        let duplicates: BTreeSet<&str> = labels
            .iter()
            .filter(|label| !seen.insert(label.as_str()))
            .map(String::as_str)
            .collect();
        if !duplicates.is_empty() {
            problems.push(format!(
                "Duplicate column/metric labels: {}. Please make sure all columns and metrics have a unique label.",
                duplicates
                    .iter()
                    .map(|d| format!("'{}'", d))
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }

        if query.is_aggregate() {
            for order in &query.orderby {
                if !labels.contains(&order.label) {
                    problems.push(format!(
                        "Order by '{}' is not a groupby column or metric.",
                        order.label
                    ));
                }
            }
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(ChartDataError::new(
            ErrorCode::QueryObjectInvalid,
            problems.join("; "),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chartdata_error::ErrorContext;
    use serde_json::json;

    fn field_errors(err: &ChartDataError) -> BTreeMap<String, Vec<String>> {
        match &err.context {
            Some(ErrorContext::Fields { errors }) => errors.clone(),
            other => panic!("expected field errors, got {:?}", other),
        }
    }

    #[test]
    fn test_minimal_context() {
        let ctx = validate_query_context(&json!({
            "format": "csv",
            "queries": [{"metrics": ["count"], "groupby": ["year"]}]
        }))
        .unwrap();

        assert_eq!(ctx.result_format, ResultFormat::Csv);
        assert_eq!(ctx.result_type, ResultType::Full);
        assert!(ctx.datasource.is_none());
        assert_eq!(ctx.queries[0].metrics, vec![Metric::Count]);
        assert!(ctx.queries[0].order_desc);
    }

    #[test]
    fn test_full_context() {
        let ctx = validate_query_context(&json!({
            "datasource": {"id": "3", "type": "table"},
            "result_format": "json",
            "result_type": "query",
            "force": true,
            "custom_cache_timeout": 30,
            "queries": [{
                "groupby": ["gender"],
                "metrics": [
                    "sum__num",
                    {"expressionType": "SIMPLE", "aggregate": "MAX", "column": {"column_name": "num"}, "label": "max_num"}
                ],
                "filters": [{"col": "year", "op": "IN", "val": [2000, 2001]}],
                "orderby": [["max_num", false]],
                "row_limit": 10
            }]
        }))
        .unwrap();

        assert_eq!(ctx.datasource, Some(DatasourceRef { id: 3, kind: "table".into() }));
        assert_eq!(ctx.result_type, ResultType::Query);
        assert!(ctx.force);
        assert_eq!(ctx.custom_cache_timeout, Some(30));
        let q = &ctx.queries[0];
        assert_eq!(q.labels(), vec!["gender", "sum__num", "max_num"]);
        assert_eq!(q.filters[0].op, FilterOp::In);
        assert_eq!(q.row_limit, Some(10));
    }

    #[test]
    fn test_collects_every_field_error() {
        let err = validate_query_context(&json!({
            "datasource": {"type": 5},
            "result_type": "samples",
            "force": "yes",
            "queries": [
                {"metrics": ["bogus"], "row_limit": -1},
                {"groupby": "year", "filters": [{"col": "x", "op": "IN", "val": 3}]}
            ]
        }))
        .unwrap_err();

        assert_eq!(err.code, ErrorCode::ValidationFailed);
        assert!(err.message.starts_with("Request is incorrect:"));
        let errors = field_errors(&err);
        for path in [
            "datasource.id",
            "datasource.type",
            "result_type",
            "force",
            "queries.0.metrics.0",
            "queries.0.row_limit",
            "queries.1.groupby",
            "queries.1.filters.0.val",
        ] {
            assert!(errors.contains_key(path), "missing error for {}: {:?}", path, errors);
        }
        assert_eq!(errors["queries.0.row_limit"], vec![NEGATIVE.to_string()]);
    }

    #[test]
    fn test_missing_queries() {
        let err = validate_query_context(&json!({"result_format": "json"})).unwrap_err();
        assert_eq!(field_errors(&err)["queries"], vec![MISSING.to_string()]);

        let err = validate_query_context(&json!([1, 2])).unwrap_err();
        assert!(field_errors(&err).contains_key("_schema"));
    }

    #[test]
    fn test_unsupported_format_alone_names_value() {
        let err = validate_query_context(&json!({
            "result_format": "pdf",
            "queries": [{"metrics": ["count"]}]
        }))
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::UnsupportedFormat);
        assert_eq!(err.message, "Unsupported result_format: pdf");
    }

    #[test]
    fn test_unsupported_format_with_other_errors() {
        let err = validate_query_context(&json!({
            "result_format": "pdf",
            "queries": "nope"
        }))
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationFailed);
        let errors = field_errors(&err);
        assert!(errors.contains_key("queries"));
        assert!(errors["result_format"][0].contains("pdf"));
    }

    #[test]
    fn test_unsupported_format_named_beside_query_errors() {
        let err = validate_query_context(&json!({
            "result_format": "pdf",
            "queries": [{"metrics": ["count"], "row_limit": "x"}]
        }))
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationFailed);
        assert_eq!(err.status(), 400);
        assert!(err.message.contains("pdf"));
    }

    #[test]
    fn test_semantic_errors() {
        let err = validate_query_context(&json!({"queries": [{}]})).unwrap_err();
        assert_eq!(err.code, ErrorCode::QueryObjectInvalid);
        assert_eq!(err.message, "Empty query?");

        let err = validate_query_context(&json!({
            "queries": [{"groupby": ["count"], "metrics": ["count"]}]
        }))
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::QueryObjectInvalid);
        assert!(err.message.contains("Duplicate column/metric labels: 'count'"));

        let err = validate_query_context(&json!({
            "queries": [{"groupby": ["count", "count", "count"], "metrics": ["count"]}]
        }))
        .unwrap_err();
        assert!(err.message.contains("labels: 'count'. Please"));

        let err = validate_query_context(&json!({
            "queries": [{"columns": ["name"], "metrics": ["count"]}]
        }))
        .unwrap_err();
        assert!(err.message.contains("Raw columns cannot be combined"));

        let err = validate_query_context(&json!({
            "queries": [{"groupby": ["year"], "metrics": ["count"], "orderby": [["num", true]]}]
        }))
        .unwrap_err();
        assert!(err.message.contains("Order by 'num'"));
    }

    #[test]
    fn test_cache_timeout_alias() {
        let ctx = validate_query_context(&json!({
            "cache_timeout": 5,
            "queries": [{"columns": ["name"], "row_offset": 2}]
        }))
        .unwrap();
        assert_eq!(ctx.custom_cache_timeout, Some(5));
        assert_eq!(ctx.queries[0].row_offset, 2);
    }
}
