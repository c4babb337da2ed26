//! Chart commands.
//!
//! Each operation on the chart resource is a value implementing [`Command`]:
//! it validates, checks ownership, then mutates the store. Handlers map the
//! resulting error codes to HTTP statuses.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;
use validator::{Validate, ValidationErrors};

use chartdata_common::auth::AuthenticatedUser;
use chartdata_error::{ChartDataError, ErrorCode, ErrorContext, Result};

use super::model::{Chart, ChartPost, ChartPut, DEFAULT_DATASOURCE_TYPE};
use super::store::ChartStore;
use crate::engine::QueryEngine;

pub const EXPORT_VERSION: &str = "1.0.0";
pub const METADATA_FILE: &str = "metadata.yaml";

/// Everything a command may touch.
#[derive(Clone)]
pub struct CommandContext {
    pub store: Arc<dyn ChartStore>,
    pub engine: Arc<dyn QueryEngine>,
    pub user: AuthenticatedUser,
}

#[async_trait]
pub trait Command: Send {
    type Output;

    async fn run(self, ctx: &CommandContext) -> Result<Self::Output>;
}

fn not_found() -> ChartDataError {
    ChartDataError::new(ErrorCode::ChartNotFound, "Not found")
}

fn not_found_ids(ids: Vec<i64>) -> ChartDataError {
    not_found().with_context(ErrorContext::Resource {
        resource: "chart".to_string(),
        ids,
    })
}

/// Requested ids with no chart, each reported once.
fn missing_ids(ids: &[i64], charts: &[Chart]) -> Vec<i64> {
    let found: HashSet<i64> = charts.iter().map(|c| c.id).collect();
    ids.iter()
        .copied()
        .filter(|id| !found.contains(id))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn forbidden() -> ChartDataError {
    ChartDataError::new(ErrorCode::Forbidden, "Forbidden")
}

fn ensure_owner(chart: &Chart, user: &AuthenticatedUser) -> Result<()> {
    if chart.is_owned_by(&user.id) || user.has_permission("chart:write_all") {
        Ok(())
    } else {
        Err(forbidden())
    }
}

/// Flatten `validator` errors into `field -> messages`.
fn field_messages(errors: &ValidationErrors) -> BTreeMap<String, Vec<String>> {
    errors
        .field_errors()
        .into_iter()
        .map(|(field, errs)| {
            let messages = errs
                .iter()
                .map(|e| {
                    e.message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| e.code.to_string())
                })
                .collect();
            (field.to_string(), messages)
        })
        .collect()
}

fn check_datasource(
    ctx: &CommandContext,
    datasource_id: i64,
    errors: &mut BTreeMap<String, Vec<String>>,
) {
    if !ctx.engine.has_datasource(datasource_id) {
        errors
            .entry("datasource_id".to_string())
            .or_default()
            .push("Datasource does not exist".to_string());
    }
}

fn invalid_chart(errors: BTreeMap<String, Vec<String>>) -> ChartDataError {
    ChartDataError::fields(ErrorCode::ChartInvalid, "Chart parameters are invalid.", errors)
}

pub struct CreateChartCommand {
    pub payload: ChartPost,
}

#[async_trait]
impl Command for CreateChartCommand {
    type Output = Chart;

    async fn run(self, ctx: &CommandContext) -> Result<Chart> {
        let payload = self.payload;
        let mut errors = payload
            .validate()
            .err()
            .map(|e| field_messages(&e))
            .unwrap_or_default();
        check_datasource(ctx, payload.datasource_id, &mut errors);
        if !errors.is_empty() {
            return Err(invalid_chart(errors));
        }

        let owners = payload
            .owners
            .filter(|o| !o.is_empty())
            .unwrap_or_else(|| vec![ctx.user.id.clone()]);
        let chart = ctx
            .store
            .save(Chart {
                id: 0,
                uuid: Uuid::new_v4(),
                slice_name: payload.slice_name,
                description: payload.description,
                viz_type: payload.viz_type,
                params: payload.params,
                datasource_id: payload.datasource_id,
                datasource_type: payload
                    .datasource_type
                    .unwrap_or_else(|| DEFAULT_DATASOURCE_TYPE.to_string()),
                cache_timeout: payload.cache_timeout,
                owners,
                changed_on: Utc::now(),
            })
            .await;

        info!(target: "audit", user_id = %ctx.user.id, chart_id = chart.id, "Chart created");
        Ok(chart)
    }
}

pub struct UpdateChartCommand {
    pub id: i64,
    pub payload: ChartPut,
}

#[async_trait]
impl Command for UpdateChartCommand {
    type Output = Chart;

    async fn run(self, ctx: &CommandContext) -> Result<Chart> {
        let mut chart = ctx.store.get(self.id).await.ok_or_else(not_found)?;
        ensure_owner(&chart, &ctx.user)?;

        let payload = self.payload;
        let mut errors = payload
            .validate()
            .err()
            .map(|e| field_messages(&e))
            .unwrap_or_default();
        if let Some(datasource_id) = payload.datasource_id {
            check_datasource(ctx, datasource_id, &mut errors);
        }
        if !errors.is_empty() {
            return Err(invalid_chart(errors));
        }

        if let Some(v) = payload.slice_name {
            chart.slice_name = v;
        }
        if let Some(v) = payload.description {
            chart.description = Some(v);
        }
        if let Some(v) = payload.viz_type {
            chart.viz_type = v;
        }
        if let Some(v) = payload.params {
            chart.params = Some(v);
        }
        if let Some(v) = payload.datasource_id {
            chart.datasource_id = v;
        }
        if let Some(v) = payload.datasource_type {
            chart.datasource_type = v;
        }
        if let Some(v) = payload.cache_timeout {
            chart.cache_timeout = Some(v);
        }
        if let Some(v) = payload.owners {
            chart.owners = v;
        }
        chart.changed_on = Utc::now();

        let chart = ctx.store.save(chart).await;
        info!(target: "audit", user_id = %ctx.user.id, chart_id = chart.id, "Chart updated");
        Ok(chart)
    }
}

pub struct DeleteChartCommand {
    pub id: i64,
}

#[async_trait]
impl Command for DeleteChartCommand {
    type Output = ();

    async fn run(self, ctx: &CommandContext) -> Result<()> {
        let chart = ctx.store.get(self.id).await.ok_or_else(not_found)?;
        ensure_owner(&chart, &ctx.user)?;
        ctx.store.delete(&[self.id]).await;
        info!(target: "audit", user_id = %ctx.user.id, chart_id = self.id, "Chart deleted");
        Ok(())
    }
}

pub struct BulkDeleteChartCommand {
    pub ids: Vec<i64>,
}

#[async_trait]
impl Command for BulkDeleteChartCommand {
    /// Number of charts deleted
    type Output = usize;

    async fn run(self, ctx: &CommandContext) -> Result<usize> {
        let charts = ctx.store.find_by_ids(&self.ids).await;
        let missing = missing_ids(&self.ids, &charts);
        if !missing.is_empty() {
            return Err(not_found_ids(missing));
        }
        for chart in &charts {
            ensure_owner(chart, &ctx.user)?;
        }

        let deleted = ctx.store.delete(&self.ids).await;
        info!(target: "audit", user_id = %ctx.user.id, ids = ?self.ids, "Charts deleted");
        Ok(deleted)
    }
}

/// Serialized form of one chart inside an export bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartExport {
    pub slice_name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub viz_type: String,
    /// Form data as a structured value rather than JSON text
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    #[serde(default)]
    pub cache_timeout: Option<u64>,
    pub uuid: Uuid,
    pub datasource_id: i64,
    #[serde(default = "default_datasource_type")]
    pub datasource_type: String,
    pub version: String,
}

fn default_datasource_type() -> String {
    DEFAULT_DATASOURCE_TYPE.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportMetadata {
    pub version: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: String,
}

/// File name of a chart inside a bundle.
pub fn export_file_name(chart: &Chart) -> String {
    let safe: String = chart
        .slice_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!("charts/{}_{}.yaml", safe, chart.id)
}

pub struct ExportChartsCommand {
    pub ids: Vec<i64>,
}

#[async_trait]
impl Command for ExportChartsCommand {
    /// `(path, yaml)` pairs, metadata first
    type Output = Vec<(String, String)>;

    async fn run(self, ctx: &CommandContext) -> Result<Vec<(String, String)>> {
        let charts = ctx.store.find_by_ids(&self.ids).await;
        let missing = missing_ids(&self.ids, &charts);
        if !missing.is_empty() {
            return Err(not_found_ids(missing));
        }

        let metadata = ExportMetadata {
            version: EXPORT_VERSION.to_string(),
            kind: "Slice".to_string(),
            timestamp: Utc::now().to_rfc3339(),
        };
        let mut files = vec![(METADATA_FILE.to_string(), serde_yaml::to_string(&metadata)?)];

        for chart in &charts {
            let params = chart
                .params
                .as_deref()
                .and_then(|p| serde_json::from_str(p).ok());
            let export = ChartExport {
                slice_name: chart.slice_name.clone(),
                description: chart.description.clone(),
                viz_type: chart.viz_type.clone(),
                params,
                cache_timeout: chart.cache_timeout,
                uuid: chart.uuid,
                datasource_id: chart.datasource_id,
                datasource_type: chart.datasource_type.clone(),
                version: EXPORT_VERSION.to_string(),
            };
            files.push((export_file_name(chart), serde_yaml::to_string(&export)?));
        }
        Ok(files)
    }
}

pub struct ImportChartsCommand {
    /// Bundle files keyed by path relative to the bundle root
    pub contents: HashMap<String, String>,
    pub overwrite: bool,
}

impl ImportChartsCommand {
    fn validate_metadata(&self, errors: &mut BTreeMap<String, Vec<String>>) {
        let Some(text) = self.contents.get(METADATA_FILE) else {
            errors.insert(
                METADATA_FILE.to_string(),
                vec!["Missing data for required field.".to_string()],
            );
            return;
        };
        match serde_yaml::from_str::<ExportMetadata>(text) {
            Ok(metadata) if metadata.kind == "Slice" => {}
            Ok(_) => {
                errors.insert(
                    METADATA_FILE.to_string(),
                    vec!["Must be equal to Slice.".to_string()],
                );
            }
            Err(e) => {
                errors.insert(METADATA_FILE.to_string(), vec![e.to_string()]);
            }
        }
    }
}

#[async_trait]
impl Command for ImportChartsCommand {
    /// Number of charts imported
    type Output = usize;

    async fn run(self, ctx: &CommandContext) -> Result<usize> {
        let mut errors = BTreeMap::new();
        self.validate_metadata(&mut errors);

        let mut paths: Vec<&String> = self
            .contents
            .keys()
            .filter(|p| p.starts_with("charts/"))
            .collect();
        paths.sort();

        let mut pending: Vec<Chart> = Vec::new();
        for path in paths {
            let export = match serde_yaml::from_str::<ChartExport>(&self.contents[path]) {
                Ok(export) => export,
                Err(e) => {
                    errors.insert(path.clone(), vec![e.to_string()]);
                    continue;
                }
            };

            let mut file_errors = Vec::new();
            if export.slice_name.is_empty() || export.slice_name.chars().count() > 250 {
                file_errors.push("slice_name: Length must be between 1 and 250.".to_string());
            }
            if export.viz_type.trim().is_empty() {
                file_errors.push("viz_type: Field may not be blank.".to_string());
            }
            if !ctx.engine.has_datasource(export.datasource_id) {
                file_errors.push("datasource_id: Datasource does not exist".to_string());
            }

            let existing = ctx.store.find_by_uuid(export.uuid).await;
            if let Some(existing) = &existing {
                if !self.overwrite {
                    file_errors.push(
                        "Chart already exists and `overwrite=true` was not passed".to_string(),
                    );
                } else if ensure_owner(existing, &ctx.user).is_err() {
                    file_errors.push("Only owners can overwrite this chart".to_string());
                }
            }

            if !file_errors.is_empty() {
                errors.insert(path.clone(), file_errors);
                continue;
            }

            pending.push(Chart {
                id: existing.as_ref().map(|c| c.id).unwrap_or(0),
                uuid: export.uuid,
                slice_name: export.slice_name,
                description: export.description,
                viz_type: export.viz_type,
                params: export.params.map(|p| p.to_string()),
                datasource_id: export.datasource_id,
                datasource_type: export.datasource_type,
                cache_timeout: export.cache_timeout,
                owners: existing
                    .map(|c| c.owners)
                    .unwrap_or_else(|| vec![ctx.user.id.clone()]),
                changed_on: Utc::now(),
            });
        }

        if !errors.is_empty() {
            return Err(ChartDataError::fields(
                ErrorCode::CommandInvalid,
                "Error importing chart",
                errors,
            ));
        }

        let count = pending.len();
        for chart in pending {
            ctx.store.save(chart).await;
        }
        info!(target: "audit", user_id = %ctx.user.id, count, "Charts imported");
        Ok(count)
    }
}

/// Favorite flag per requested chart id for the current user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FavoriteStatus {
    pub id: i64,
    pub value: bool,
}

pub struct FavoriteStatusCommand {
    pub ids: Vec<i64>,
}

#[async_trait]
impl Command for FavoriteStatusCommand {
    type Output = Vec<FavoriteStatus>;

    async fn run(self, ctx: &CommandContext) -> Result<Vec<FavoriteStatus>> {
        let charts = ctx.store.find_by_ids(&self.ids).await;
        if charts.is_empty() {
            return Err(not_found());
        }
        let existing: Vec<i64> = charts.iter().map(|c| c.id).collect();
        let favorited = ctx.store.favorited_ids(&existing, &ctx.user.id).await;
        Ok(self
            .ids
            .into_iter()
            .map(|id| FavoriteStatus {
                id,
                value: favorited.contains(&id),
            })
            .collect())
    }
}
