use axum::{
    body::Bytes,
    extract::{FromRequest, Multipart, Path, Query, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Form, Json, Router,
};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use chartdata_common::auth::AuthenticatedUser;
use chartdata_error::{ChartDataError, ErrorCode};
use chartdata_runtime::charts::{
    BulkDeleteChartCommand, Chart, ChartPost, ChartPut, Command, CreateChartCommand,
    DeleteChartCommand, ExportChartsCommand, FavoriteStatusCommand, ImportChartsCommand,
    UpdateChartCommand,
};
use chartdata_runtime::formatter::FormattedResponse;
use chartdata_runtime::screenshots::{
    ChartScreenshot, ScreenshotService, WindowSize, DEFAULT_THUMB_SIZE, DEFAULT_WINDOW_SIZE,
};
use chartdata_runtime::ChartDataOutcome;

use crate::bundle::{read_bundle, write_bundle, EXPORT_ROOT_PREFIX};
use crate::error::{ApiError, ApiResult};
use crate::middleware::{cookie_value, AsyncToken};
use crate::query_args::{parse_size, QArg};
use crate::state::AppState;
use crate::ASYNC_JOBS_ENQUEUED;

pub const DEFAULT_PAGE_SIZE: usize = 25;
pub const MAX_PAGE_SIZE: usize = 100;

pub fn create_api_router(mut state: AppState, prefix: &str) -> Router {
    state.api_prefix = prefix.to_string();
    let chart = |path: &str| format!("{}/chart{}", prefix, path);

    Router::new()
        .route(&chart("/data"), post(chart_data))
        .route(&chart("/data/{cache_key}"), get(chart_data_from_cache))
        .route(
            &chart("/"),
            get(list_charts).post(create_chart).delete(bulk_delete_charts),
        )
        .route(
            &chart("/{pk}"),
            get(get_chart).put(update_chart).delete(delete_chart),
        )
        .route(&chart("/export/"), get(export_charts))
        .route(&chart("/import/"), post(import_charts))
        .route(&chart("/favorite_status/"), get(favorite_status))
        .route(&chart("/{pk}/cache_screenshot/"), get(cache_screenshot))
        .route(&chart("/{pk}/screenshot/{digest}/"), get(screenshot))
        .route(&chart("/{pk}/thumbnail/{digest}/"), get(thumbnail))
        .route(&format!("{}/async_event/", prefix), get(async_events))
        .with_state(state)
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> ApiResult<T> {
    let value: Value = serde_json::from_slice(body).map_err(|_| not_json())?;
    serde_json::from_value(value)
        .map_err(|e| ApiError::new(ErrorCode::ValidationFailed, e.to_string()))
}

fn not_found() -> ApiError {
    ApiError::new(ErrorCode::ChartNotFound, "Not found")
}

fn ok_message() -> Json<Value> {
    Json(json!({ "message": "OK" }))
}

fn attachment(mut response: Response, filename: &str) -> Response {
    match HeaderValue::from_str(&format!("attachment; filename=\"{}\"", filename)) {
        Ok(value) => {
            response.headers_mut().insert(header::CONTENT_DISPOSITION, value);
        }
        Err(e) => tracing::warn!("Unusable attachment name {}: {}", filename, e),
    }
    response
}

fn formatted(response: FormattedResponse) -> Response {
    let FormattedResponse {
        body,
        content_type,
        filename,
    } = response;
    let res = (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], body).into_response();
    match filename {
        Some(name) => attachment(res, &name),
        None => res,
    }
}

fn png(bytes: Vec<u8>) -> Response {
    (StatusCode::OK, [(header::CONTENT_TYPE, "image/png")], bytes).into_response()
}

fn not_json() -> ApiError {
    ApiError::new(ErrorCode::RequestNotJson, "Request is not JSON")
}

/// Form-encoded chart data request, as sent by browser downloads.
#[derive(Debug, Deserialize)]
struct ChartDataForm {
    form_data: String,
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/x-www-form-urlencoded"))
}

/// Query context payload from a JSON body or a form `form_data` field.
async fn read_form_data(req: Request, state: &AppState) -> ApiResult<Value> {
    if is_form(req.headers()) {
        let Form(form) = Form::<ChartDataForm>::from_request(req, state)
            .await
            .map_err(|_| not_json())?;
        return serde_json::from_str(&form.form_data).map_err(|_| not_json());
    }
    let body = Bytes::from_request(req, state).await.map_err(|_| not_json())?;
    serde_json::from_slice(&body).map_err(|_| not_json())
}

async fn chart_data(State(state): State<AppState>, req: Request) -> ApiResult<Response> {
    let async_token = match req.extensions().get::<AsyncToken>() {
        Some(AsyncToken(token)) => token.clone(),
        None => state
            .gateway
            .async_queries()
            .and_then(|m| cookie_value(req.headers(), m.tokens().cookie_name())),
    };
    let form_data = read_form_data(req, &state).await?;

    match state
        .gateway
        .data(&form_data, state.flags(), async_token.as_deref())
        .await?
    {
        ChartDataOutcome::Ready(response) => Ok(formatted(response)),
        ChartDataOutcome::Pending(job) => {
            ASYNC_JOBS_ENQUEUED.inc();
            Ok((StatusCode::ACCEPTED, Json(job)).into_response())
        }
    }
}

async fn chart_data_from_cache(
    State(state): State<AppState>,
    Path(cache_key): Path<String>,
) -> ApiResult<Response> {
    let response = state.gateway.data_from_cache(&cache_key).await?;
    Ok(formatted(response))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    page: Option<usize>,
    page_size: Option<usize>,
}

async fn list_charts(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Json<Value> {
    let page_size = params
        .page_size
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let (count, charts) = state.charts.list(params.page.unwrap_or(0), page_size).await;
    let ids: Vec<i64> = charts.iter().map(|c| c.id).collect();
    Json(json!({ "count": count, "ids": ids, "result": charts }))
}

async fn get_chart(State(state): State<AppState>, Path(pk): Path<i64>) -> ApiResult<Json<Value>> {
    let chart = state.charts.get(pk).await.ok_or_else(not_found)?;
    Ok(Json(json!({ "id": pk, "result": chart })))
}

fn chart_result(chart: &Chart) -> Json<Value> {
    Json(json!({ "id": chart.id, "result": chart }))
}

async fn create_chart(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    body: Bytes,
) -> ApiResult<Response> {
    let payload: ChartPost = parse_body(&body)?;
    let chart = CreateChartCommand { payload }
        .run(&state.command_context(user))
        .await?;
    Ok((StatusCode::CREATED, chart_result(&chart)).into_response())
}

async fn update_chart(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(pk): Path<i64>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let payload: ChartPut = parse_body(&body)?;
    let chart = UpdateChartCommand { id: pk, payload }
        .run(&state.command_context(user))
        .await?;
    Ok(chart_result(&chart))
}

async fn delete_chart(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(pk): Path<i64>,
) -> ApiResult<Json<Value>> {
    DeleteChartCommand { id: pk }
        .run(&state.command_context(user))
        .await?;
    Ok(ok_message())
}

async fn bulk_delete_charts(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Query(q): Query<QArg>,
) -> ApiResult<Json<Value>> {
    let ids = q.ids()?;
    let deleted = BulkDeleteChartCommand { ids }
        .run(&state.command_context(user))
        .await?;
    let message = if deleted == 1 {
        "Deleted 1 chart".to_string()
    } else {
        format!("Deleted {} charts", deleted)
    };
    Ok(Json(json!({ "message": message })))
}

async fn export_charts(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Query(q): Query<QArg>,
) -> ApiResult<Response> {
    let ids = q.ids()?;
    let files = ExportChartsCommand { ids }
        .run(&state.command_context(user))
        .await?;

    let root = format!("{}{}", EXPORT_ROOT_PREFIX, Utc::now().format("%Y%m%dT%H%M%S"));
    let bytes = write_bundle(&root, &files)?;
    let response = (StatusCode::OK, [(header::CONTENT_TYPE, "application/zip")], bytes).into_response();
    Ok(attachment(response, &format!("{}.zip", root)))
}

fn bad_upload(e: axum::extract::multipart::MultipartError) -> ApiError {
    ApiError::new(ErrorCode::InvalidArgument, format!("Invalid upload: {}", e))
}

async fn import_charts(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    mut multipart: Multipart,
) -> ApiResult<Json<Value>> {
    let mut upload: Option<Bytes> = None;
    let mut overwrite = false;

    while let Some(field) = multipart.next_field().await.map_err(bad_upload)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "formData" => upload = Some(field.bytes().await.map_err(bad_upload)?),
            "overwrite" => overwrite = field.text().await.map_err(bad_upload)? == "true",
            _ => {}
        }
    }

    let upload = upload
        .ok_or_else(|| ApiError::new(ErrorCode::InvalidArgument, "Arguments are not correct"))?;
    let contents = read_bundle(&upload)?;
    ImportChartsCommand {
        contents,
        overwrite,
    }
    .run(&state.command_context(user))
    .await?;
    Ok(ok_message())
}

async fn favorite_status(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Query(q): Query<QArg>,
) -> ApiResult<Json<Value>> {
    let ids = q.ids()?;
    let result = FavoriteStatusCommand { ids }
        .run(&state.command_context(user))
        .await?;
    Ok(Json(json!({ "result": result })))
}

/// Screenshot service, present only with the `thumbnails` feature.
fn screenshots(state: &AppState) -> ApiResult<&ScreenshotService> {
    match &state.screenshots {
        Some(service) if state.flags().thumbnails => Ok(service.as_ref()),
        _ => Err(not_found()),
    }
}

#[derive(Debug, Deserialize)]
struct ScreenshotParams {
    window_size: Option<String>,
    thumb_size: Option<String>,
}

fn size_or(value: Option<&str>, default: WindowSize) -> ApiResult<WindowSize> {
    match value {
        Some(v) => Ok(parse_size(v)?.into()),
        None => Ok(default),
    }
}

async fn cache_screenshot(
    State(state): State<AppState>,
    Path(pk): Path<i64>,
    Query(params): Query<ScreenshotParams>,
) -> ApiResult<Response> {
    let service = screenshots(&state)?;
    let chart = state.charts.get(pk).await.ok_or_else(not_found)?;
    let window = size_or(params.window_size.as_deref(), DEFAULT_WINDOW_SIZE)?;
    let thumb = size_or(params.thumb_size.as_deref(), DEFAULT_THUMB_SIZE)?;

    let shot = ChartScreenshot::new(chart.url(), chart.digest());
    let cache_key = service.spawn_render(&shot, window, thumb);
    let image_url = format!("{}/chart/{}/screenshot/{}/", state.api_prefix, pk, cache_key);

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "cache_key": cache_key,
            "chart_url": shot.url,
            "image_url": image_url,
        })),
    )
        .into_response())
}

async fn screenshot(
    State(state): State<AppState>,
    Path((pk, digest)): Path<(i64, String)>,
) -> ApiResult<Response> {
    let service = screenshots(&state)?;
    state.charts.get(pk).await.ok_or_else(not_found)?;
    match service.get(&digest).await {
        Some(bytes) => Ok(png(bytes)),
        None => Err(ApiError::new(ErrorCode::ScreenshotNotFound, "Not found")),
    }
}

#[derive(Debug, Deserialize)]
struct ThumbnailParams {
    #[serde(default)]
    force: bool,
}

async fn thumbnail(
    State(state): State<AppState>,
    Path((pk, digest)): Path<(i64, String)>,
    Query(params): Query<ThumbnailParams>,
) -> ApiResult<Response> {
    let service = screenshots(&state)?;
    let chart = state.charts.get(pk).await.ok_or_else(not_found)?;
    let shot = ChartScreenshot::new(chart.url(), chart.digest());

    let render_async = || {
        service.spawn_render(&shot, DEFAULT_WINDOW_SIZE, DEFAULT_THUMB_SIZE);
        (StatusCode::ACCEPTED, Json(json!({ "message": "OK Async" }))).into_response()
    };

    if params.force {
        return Ok(render_async());
    }
    let Some(bytes) = service.get_thumbnail(&shot).await else {
        return Ok(render_async());
    };

    if shot.digest != digest {
        let location = format!("{}/chart/{}/thumbnail/{}/", state.api_prefix, pk, shot.digest);
        return Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response());
    }
    Ok(png(bytes))
}

#[derive(Debug, Deserialize)]
struct EventParams {
    last_id: Option<String>,
}

async fn async_events(
    State(state): State<AppState>,
    token: Option<Extension<AsyncToken>>,
    Query(params): Query<EventParams>,
) -> ApiResult<Json<Value>> {
    let manager = state.gateway.async_queries().ok_or_else(|| {
        ApiError(ChartDataError::new(
            ErrorCode::JobQueueUnavailable,
            "Async queries are not enabled",
        ))
    })?;
    let token = token.and_then(|Extension(AsyncToken(t))| t);
    let claims = manager.parse_token(token.as_deref())?;
    let events = manager.read_events(&claims.channel, params.last_id.as_deref());
    Ok(Json(json!({ "result": events })))
}
