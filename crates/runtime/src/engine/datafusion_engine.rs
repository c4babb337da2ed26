use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Instant;

use arrow::datatypes::{DataType, TimeUnit};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use datafusion::dataframe::DataFrame;
use datafusion::functions_aggregate::expr_fn::{avg, count, count_distinct, max, min, sum};
use datafusion::logical_expr::{Expr, LogicalPlan, SortExpr};
use datafusion::prelude::{cast, ident, lit, CsvReadOptions, SessionConfig, SessionContext};
use datafusion::sql::unparser::plan_to_sql;
use serde_json::{Map, Value};
use tracing::{debug, error, info};

use chartdata_common::config::DatasourceConfig;
use chartdata_error::{ChartDataError, ErrorCode, Result};

use super::{EngineOutput, GenericDataType, QueryEngine};
use crate::query_context::{Aggregate, FilterOp, Metric, QueryFilter, QueryObject};

/// Evaluates query objects with DataFusion.
///
/// Every datasource is registered as its own table (`ds_<id>`) in a single
/// session. Temporal columns are returned as epoch milliseconds.
pub struct DataFusionEngine {
    context: SessionContext,
    tables: RwLock<HashMap<i64, String>>,
}

impl Default for DataFusionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DataFusionEngine {
    pub fn new() -> Self {
        let mut session_config = SessionConfig::new();
        // Deterministic partitioning keeps small result sets in one batch.
        session_config.options_mut().execution.target_partitions = 1;

        Self {
            context: SessionContext::new_with_config(session_config),
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// Engine with every configured datasource registered.
    ///
    /// A datasource that fails to register is logged and skipped so the
    /// remaining ones stay queryable.
    pub async fn from_config(datasources: &[DatasourceConfig]) -> Self {
        let engine = Self::new();
        let futures = datasources
            .iter()
            .map(|ds| engine.register_csv(ds.id, &ds.path, ds.has_header));

        let results = futures::future::join_all(futures).await;
        for (ds, res) in datasources.iter().zip(results) {
            match res {
                Ok(()) => info!(datasource_id = ds.id, name = %ds.name, "Registered datasource"),
                Err(e) => error!(
                    datasource_id = ds.id,
                    name = %ds.name,
                    "Failed to register datasource: {}",
                    e
                ),
            }
        }
        engine
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub async fn register_csv(&self, datasource_id: i64, path: &str, has_header: bool) -> Result<()> {
        let table = table_name(datasource_id);
        self.context
            .register_csv(table.as_str(), path, CsvReadOptions::new().has_header(has_header))
            .await?;
        self.remember(datasource_id, table);
        Ok(())
    }

    pub fn register_batch(&self, datasource_id: i64, batch: RecordBatch) -> Result<()> {
        let table = table_name(datasource_id);
        self.context.register_batch(table.as_str(), batch)?;
        self.remember(datasource_id, table);
        Ok(())
    }

    fn remember(&self, datasource_id: i64, table: String) {
        if let Ok(mut tables) = self.tables.write() {
            tables.insert(datasource_id, table);
        }
    }

    fn table_for(&self, datasource_id: i64) -> Result<String> {
        self.tables
            .read()
            .ok()
            .and_then(|tables| tables.get(&datasource_id).cloned())
            .ok_or_else(|| {
                ChartDataError::new(
                    ErrorCode::DatasourceNotFound,
                    format!("Datasource {} does not exist", datasource_id),
                )
            })
    }

    async fn build(&self, datasource_id: i64, query: &QueryObject) -> Result<DataFrame> {
        let table = self.table_for(datasource_id)?;
        let mut df = self.context.table(table.as_str()).await?;

        for filter in &query.filters {
            df = df.filter(filter_expr(filter)?)?;
        }

        if query.is_aggregate() || query.columns.is_empty() {
            let group: Vec<Expr> = query.groupby.iter().map(ident).collect();
            let aggs: Vec<Expr> = query.metrics.iter().map(metric_expr).collect();
            df = df.aggregate(group, aggs)?;
        } else {
            df = df.select(query.columns.iter().map(ident).collect())?;
        }

        let sort = sort_exprs(query);
        if !sort.is_empty() {
            df = df.sort(sort)?;
        }

        if query.row_limit.is_some() || query.row_offset > 0 {
            df = df.limit(query.row_offset, query.row_limit)?;
        }

        Ok(df)
    }
}

fn table_name(datasource_id: i64) -> String {
    format!("ds_{}", datasource_id)
}

fn render_query(plan: &LogicalPlan) -> String {
    match plan_to_sql(plan) {
        Ok(statement) => statement.to_string(),
        Err(e) => {
            debug!("Falling back to plan display for query text: {}", e);
            plan.display_indent().to_string()
        }
    }
}

fn scalar(value: &Value) -> Result<Expr> {
    match value {
        Value::String(s) => Ok(lit(s.clone())),
        Value::Bool(b) => Ok(lit(*b)),
        Value::Number(n) => n
            .as_i64()
            .map(lit)
            .or_else(|| n.as_f64().map(lit))
            .ok_or_else(|| {
                ChartDataError::new(ErrorCode::InvalidArgument, format!("Unsupported number {}", n))
            }),
        other => Err(ChartDataError::new(
            ErrorCode::InvalidArgument,
            format!("Unsupported filter value {}", other),
        )),
    }
}

fn filter_expr(filter: &QueryFilter) -> Result<Expr> {
    let column = ident(&filter.col);
    let expr = match filter.op {
        FilterOp::Eq => column.eq(scalar(&filter.val)?),
        FilterOp::NotEq => column.not_eq(scalar(&filter.val)?),
        FilterOp::Gt => column.gt(scalar(&filter.val)?),
        FilterOp::Lt => column.lt(scalar(&filter.val)?),
        FilterOp::GtEq => column.gt_eq(scalar(&filter.val)?),
        FilterOp::LtEq => column.lt_eq(scalar(&filter.val)?),
        FilterOp::In | FilterOp::NotIn => {
            let values = filter
                .val
                .as_array()
                .map(|items| items.iter().map(scalar).collect::<Result<Vec<_>>>())
                .transpose()?
                .unwrap_or_default();
            column.in_list(values, filter.op == FilterOp::NotIn)
        }
        FilterOp::IsNull => column.is_null(),
        FilterOp::IsNotNull => column.is_not_null(),
        FilterOp::Like => column.like(scalar(&filter.val)?),
    };
    Ok(expr)
}

fn metric_expr(metric: &Metric) -> Expr {
    let expr = match metric {
        Metric::Count => count(lit(1)),
        Metric::Simple {
            aggregate, column, ..
        } => {
            let column = ident(column);
            match aggregate {
                Aggregate::Count => count(column),
                Aggregate::CountDistinct => count_distinct(column),
                Aggregate::Sum => sum(column),
                Aggregate::Avg => avg(column),
                Aggregate::Min => min(column),
                Aggregate::Max => max(column),
            }
        }
    };
    expr.alias(metric.label())
}

fn sort_exprs(query: &QueryObject) -> Vec<SortExpr> {
    if !query.orderby.is_empty() {
        return query
            .orderby
            .iter()
            .map(|o| ident(&o.label).sort(o.ascending, false))
            .collect();
    }
    // Aggregates default to ordering by their first metric.
    match query.metrics.first() {
        Some(metric) => vec![ident(metric.label()).sort(!query.order_desc, false)],
        None => vec![],
    }
}

fn generic_type(data_type: &DataType) -> GenericDataType {
    match data_type {
        DataType::Boolean => GenericDataType::Boolean,
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => GenericDataType::String,
        DataType::Date32 | DataType::Date64 | DataType::Timestamp(_, _) => {
            GenericDataType::Temporal
        }
        dt if dt.is_numeric() => GenericDataType::Numeric,
        _ => GenericDataType::String,
    }
}

/// Project temporal columns to epoch milliseconds, keeping their names.
fn project_temporals(df: DataFrame) -> Result<(DataFrame, Vec<String>, Vec<GenericDataType>)> {
    let mut names = Vec::new();
    let mut types = Vec::new();
    let mut exprs = Vec::new();
    let mut has_temporal = false;

    for field in df.schema().fields() {
        let kind = generic_type(field.data_type());
        let column = ident(field.name());
        let expr = if kind == GenericDataType::Temporal {
            has_temporal = true;
            cast(
                cast(column, DataType::Timestamp(TimeUnit::Millisecond, None)),
                DataType::Int64,
            )
            .alias(field.name())
        } else {
            column
        };
        names.push(field.name().clone());
        types.push(kind);
        exprs.push(expr);
    }

    let df = if has_temporal { df.select(exprs)? } else { df };
    Ok((df, names, types))
}

fn batches_to_rows(batches: &[RecordBatch]) -> Result<Vec<Map<String, Value>>> {
    let mut writer = arrow_json::WriterBuilder::new()
        .with_explicit_nulls(true)
        .build::<_, arrow_json::writer::JsonArray>(Vec::new());
    for batch in batches {
        writer.write(batch)?;
    }
    writer.finish()?;

    let buf = writer.into_inner();
    if buf.is_empty() {
        return Ok(vec![]);
    }
    Ok(serde_json::from_slice(&buf)?)
}

#[async_trait]
impl QueryEngine for DataFusionEngine {
    fn has_datasource(&self, datasource_id: i64) -> bool {
        self.table_for(datasource_id).is_ok()
    }

    async fn query_text(&self, datasource_id: i64, query: &QueryObject) -> Result<String> {
        let df = self.build(datasource_id, query).await?;
        Ok(render_query(df.logical_plan()))
    }

    async fn execute(&self, datasource_id: i64, query: &QueryObject) -> Result<EngineOutput> {
        let start = Instant::now();
        let df = self.build(datasource_id, query).await?;
        let query_text = render_query(df.logical_plan());

        let (df, colnames, coltypes) = project_temporals(df)?;
        let batches: Vec<RecordBatch> = df.collect().await?;
        let rows = batches_to_rows(&batches)?;

        debug!(
            datasource_id,
            rows = rows.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Executed query object"
        );

        Ok(EngineOutput {
            colnames,
            coltypes,
            rows,
            query: query_text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_context::OrderBy;
    use arrow::array::{Float64Array, Int64Array, StringArray, TimestampMillisecondArray};
    use arrow::datatypes::{Field, Schema};
    use serde_json::json;
    use std::sync::Arc;

    fn engine_with_names() -> DataFusionEngine {
        let schema = Arc::new(Schema::new(vec![
            Field::new("name", DataType::Utf8, false),
            Field::new("gender", DataType::Utf8, false),
            Field::new("num", DataType::Int64, false),
            Field::new("ratio", DataType::Float64, true),
            Field::new("ds", DataType::Timestamp(TimeUnit::Millisecond, None), false),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec!["Aaron", "Amy", "Bob", "Cleo"])),
                Arc::new(StringArray::from(vec!["boy", "girl", "boy", "girl"])),
                Arc::new(Int64Array::from(vec![10, 20, 30, 40])),
                Arc::new(Float64Array::from(vec![Some(0.5), Some(f64::NAN), None, Some(1.0)])),
                Arc::new(TimestampMillisecondArray::from(vec![0, 1000, 2000, 3000])),
            ],
        )
        .unwrap();

        let engine = DataFusionEngine::new();
        engine.register_batch(1, batch).unwrap();
        engine
    }

    #[tokio::test]
    async fn test_groupby_metrics() {
        let engine = engine_with_names();
        let query = QueryObject {
            groupby: vec!["gender".into()],
            metrics: vec![
                Metric::Count,
                Metric::Simple {
                    aggregate: Aggregate::Sum,
                    column: "num".into(),
                    label: None,
                },
            ],
            orderby: vec![OrderBy {
                label: "gender".into(),
                ascending: true,
            }],
            ..Default::default()
        };

        let out = engine.execute(1, &query).await.unwrap();
        assert_eq!(out.colnames, vec!["gender", "count", "SUM(num)"]);
        assert_eq!(out.rows.len(), 2);
        assert_eq!(out.rows[0]["gender"], json!("boy"));
        assert_eq!(out.rows[0]["count"], json!(2));
        assert_eq!(out.rows[1]["SUM(num)"], json!(60));
        assert!(!out.query.is_empty());
    }

    #[tokio::test]
    async fn test_raw_columns_filters_and_limit() {
        let engine = engine_with_names();
        let query = QueryObject {
            columns: vec!["name".into(), "num".into()],
            filters: vec![QueryFilter {
                col: "gender".into(),
                op: FilterOp::In,
                val: json!(["girl"]),
            }],
            orderby: vec![OrderBy {
                label: "num".into(),
                ascending: false,
            }],
            row_limit: Some(1),
            ..Default::default()
        };

        let out = engine.execute(1, &query).await.unwrap();
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.rows[0]["name"], json!("Cleo"));
    }

    #[tokio::test]
    async fn test_temporal_and_non_finite_values() {
        let engine = engine_with_names();
        let query = QueryObject {
            columns: vec!["ds".into(), "ratio".into()],
            orderby: vec![OrderBy {
                label: "ds".into(),
                ascending: true,
            }],
            ..Default::default()
        };

        let out = engine.execute(1, &query).await.unwrap();
        assert_eq!(out.coltypes, vec![GenericDataType::Temporal, GenericDataType::Numeric]);
        assert_eq!(out.rows[1]["ds"], json!(1000));
        assert_eq!(out.rows[1]["ratio"], Value::Null);
        assert_eq!(out.rows[2]["ratio"], Value::Null);
    }

    #[tokio::test]
    async fn test_unknown_datasource_and_column() {
        let engine = engine_with_names();
        let query = QueryObject {
            columns: vec!["name".into()],
            ..Default::default()
        };
        let err = engine.execute(9, &query).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::DatasourceNotFound);

        let query = QueryObject {
            columns: vec!["nme".into()],
            ..Default::default()
        };
        let err = engine.execute(1, &query).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::QueryFailed);
    }

    #[tokio::test]
    async fn test_register_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("births.csv");
        std::fs::write(&path, "year,name\n2000,a\n2000,b\n2001,c\n").unwrap();

        let engine = DataFusionEngine::new();
        engine
            .register_csv(7, path.to_str().unwrap(), true)
            .await
            .unwrap();
        assert!(engine.has_datasource(7));

        let query = QueryObject {
            groupby: vec!["year".into()],
            metrics: vec![Metric::Count],
            ..Default::default()
        };
        let text = engine.query_text(7, &query).await.unwrap();
        assert!(text.to_lowercase().contains("count"));
        let out = engine.execute(7, &query).await.unwrap();
        assert_eq!(out.rows.len(), 2);
    }
}
