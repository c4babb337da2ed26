use std::sync::Arc;
use std::time::Duration;

use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHasher};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use secrecy::SecretString;
use serde_json::{json, Value};
use tower::ServiceExt;

use chartdata_common::config::{ApiKeyConfig, AsyncQuerySettings, FeatureSettings};
use chartdata_error::Result;
use chartdata_runtime::async_queries::AsyncQueryManager;
use chartdata_runtime::charts::InMemoryChartStore;
use chartdata_runtime::screenshots::{ScreenshotEngine, ScreenshotService, WindowSize};
use chartdata_runtime::{
    ChartDataCommand, ChartDataGateway, CommandSettings, DataFusionEngine, MokaResultCache,
};
use chartdata_server::bundle::{read_bundle, write_bundle};
use chartdata_server::{create_app, ApiKeyAuthenticator, AppState, Authenticator};

const BIRTHS: &str = "year,name,gender,num\n\
2000,Aaron,boy,10\n\
2000,Amy,girl,20\n\
2001,Bob,boy,30\n\
2002,Cleo,girl,40\n";

struct FakeRenderer;

#[async_trait]
impl ScreenshotEngine for FakeRenderer {
    async fn render(&self, _url: &str, _window: WindowSize, _thumb: WindowSize) -> Result<Vec<u8>> {
        Ok(b"\x89PNG fake".to_vec())
    }
}

struct TestApp {
    router: Router,
    _dir: tempfile::TempDir,
}

#[derive(Default)]
struct Options {
    async_queries: bool,
    thumbnails: bool,
    authenticator: Option<Arc<dyn Authenticator>>,
}

async fn test_app(options: Options) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("births.csv");
    std::fs::write(&path, BIRTHS).unwrap();

    let engine = DataFusionEngine::new();
    engine
        .register_csv(1, path.to_str().unwrap(), true)
        .await
        .unwrap();

    let command = Arc::new(ChartDataCommand::new(
        Arc::new(MokaResultCache::new(16)),
        Arc::new(engine),
        CommandSettings {
            default_datasource: Some(1),
            ..Default::default()
        },
    ));

    let mut gateway = ChartDataGateway::new(command.clone());
    if options.async_queries {
        let settings = AsyncQuerySettings {
            jwt_secret: SecretString::from("0123456789abcdef0123456789abcdef".to_string()),
            ..Default::default()
        };
        gateway = gateway.with_async_queries(Arc::new(AsyncQueryManager::start_local(
            &settings, command, "/api/v1",
        )));
    }

    let features = FeatureSettings {
        global_async_queries: options.async_queries,
        thumbnails: options.thumbnails,
    };
    let mut state = AppState::new(gateway, Arc::new(InMemoryChartStore::new()), features);
    if options.thumbnails {
        state = state.with_screenshots(ScreenshotService::new(
            Arc::new(FakeRenderer),
            Arc::new(MokaResultCache::new(4)),
            Duration::from_secs(60),
        ));
    }

    TestApp {
        router: create_app(state, options.authenticator, "/api/v1", Router::new()),
        _dir: dir,
    }
}

impl TestApp {
    async fn send(&self, request: Request<Body>) -> Response {
        self.router.clone().oneshot(request).await.unwrap()
    }

    async fn get(&self, uri: &str) -> Response {
        self.send(Request::get(uri).body(Body::empty()).unwrap()).await
    }

    async fn json(&self, method: &str, uri: &str, body: Value) -> Response {
        self.send(
            Request::builder()
                .method(method)
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }
}

async fn body_bytes(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

fn set_cookie(response: &Response) -> Option<String> {
    response
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.to_string())
}

#[tokio::test]
async fn test_health_and_metrics() {
    let app = test_app(Options::default()).await;
    assert_eq!(app.get("/health").await.status(), StatusCode::OK);
    assert_eq!(app.get("/ready").await.status(), StatusCode::OK);

    let metrics = app.get("/metrics").await;
    assert_eq!(metrics.status(), StatusCode::OK);
    let text = String::from_utf8(body_bytes(metrics).await).unwrap();
    assert!(text.contains("chartdata_http_requests_total"));
}

#[tokio::test]
async fn test_count_by_year_csv() {
    let app = test_app(Options::default()).await;
    let response = app
        .json(
            "POST",
            "/api/v1/chart/data",
            json!({"format": "csv", "queries": [{"metrics": ["count"], "groupby": ["year"]}]}),
        )
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/csv"));
    let disposition = response.headers()[header::CONTENT_DISPOSITION].to_str().unwrap();
    assert!(disposition.starts_with("attachment; filename=\"") && disposition.ends_with(".csv\""));

    let text = String::from_utf8(body_bytes(response).await).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "year,count");
    assert_eq!(lines.len(), 4);
}

fn form_encode(value: &str) -> String {
    value
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                (b as char).to_string()
            }
            _ => format!("%{:02X}", b),
        })
        .collect()
}

#[tokio::test]
async fn test_form_encoded_csv_download() {
    let app = test_app(Options::default()).await;
    let form_data =
        json!({"result_format": "csv", "queries": [{"metrics": ["count"], "groupby": ["year"]}]});
    let response = app
        .send(
            Request::post("/api/v1/chart/data")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(format!(
                    "form_data={}",
                    form_encode(&form_data.to_string())
                )))
                .unwrap(),
        )
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/csv"));
    let text = String::from_utf8(body_bytes(response).await).unwrap();
    assert_eq!(text.lines().next(), Some("year,count"));
    assert_eq!(text.lines().count(), 4);

    let response = app
        .send(
            Request::post("/api/v1/chart/data")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from("form_data=%7Bnope"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["message"], "Request is not JSON");
}

#[tokio::test]
async fn test_data_errors() {
    let app = test_app(Options::default()).await;

    let response = app
        .json(
            "POST",
            "/api/v1/chart/data",
            json!({"result_format": "pdf", "queries": [{"metrics": ["count"]}]}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_json(response).await["message"]
        .as_str()
        .unwrap()
        .contains("pdf"));

    let response = app
        .send(
            Request::post("/api/v1/chart/data")
                .body(Body::from("not json"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["message"], "Request is not JSON");

    let response = app
        .json("POST", "/api/v1/chart/data", json!({"queries": [{"row_limit": -1}]}))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let message = body_json(response).await["message"].clone();
    assert!(message
        .as_str()
        .unwrap()
        .starts_with("Request is incorrect: {\"queries.0.row_limit\""));

    let response = app.get("/api/v1/chart/data/does-not-exist").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_async_data_flow() {
    let app = test_app(Options {
        async_queries: true,
        ..Default::default()
    })
    .await;
    let payload = json!({"queries": [{"metrics": ["count"], "groupby": ["year"]}]});

    // Without a token the request is rejected, but the session gets one.
    let response = app.json("POST", "/api/v1/chart/data", payload.clone()).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let cookie = set_cookie(&response).expect("async token cookie");
    assert!(cookie.starts_with("async-token="));

    // Sending the issued cookie back queues the job.
    let response = app
        .send(
            Request::post("/api/v1/chart/data")
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::COOKIE, cookie.as_str())
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert!(set_cookie(&response).is_none());
    let job = body_json(response).await;
    assert_eq!(job["status"], "pending");
    let job_id = job["job_id"].as_str().unwrap().to_string();

    // A tampered token is rejected and replaced.
    let response = app
        .send(
            Request::post("/api/v1/chart/data")
                .header(header::COOKIE, "async-token=garbage")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(set_cookie(&response).is_some());

    let mut result_url = None;
    for _ in 0..100 {
        let response = app
            .send(
                Request::get("/api/v1/async_event/")
                    .header(header::COOKIE, cookie.as_str())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let events = body_json(response).await;
        if let Some(done) = events["result"]
            .as_array()
            .unwrap()
            .iter()
            .find(|e| e["job_id"] == job_id.as_str() && e["status"] == "done")
        {
            result_url = done["result_url"].as_str().map(|s| s.to_string());
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let result_url = result_url.expect("job finished");
    let response = app.get(&result_url).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["result"][0]["rowcount"], 3);
    assert_eq!(body["result"][0]["is_cached"], true);
}

async fn create_chart(app: &TestApp, name: &str) -> i64 {
    let response = app
        .json(
            "POST",
            "/api/v1/chart/",
            json!({"slice_name": name, "viz_type": "table", "datasource_id": 1, "params": "{}"}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    body_json(response).await["id"].as_i64().unwrap()
}

#[tokio::test]
async fn test_chart_crud() {
    let app = test_app(Options::default()).await;

    let response = app
        .json("POST", "/api/v1/chart/", json!({"slice_name": "", "viz_type": "table", "datasource_id": 1}))
        .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body_json(response).await["message"]["slice_name"].is_array());

    let id = create_chart(&app, "Births").await;
    let other = create_chart(&app, "Names").await;

    let response = app.get(&format!("/api/v1/chart/{}", id)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["result"]["slice_name"], "Births");

    let response = app
        .json("PUT", &format!("/api/v1/chart/{}", id), json!({"slice_name": "Births by year"}))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let list = body_json(app.get("/api/v1/chart/?page_size=10").await).await;
    assert_eq!(list["count"], 2);

    let favs = body_json(app.get(&format!("/api/v1/chart/favorite_status/?q=!({},{})", id, other)).await).await;
    assert_eq!(favs["result"], json!([{"id": id, "value": false}, {"id": other, "value": false}]));

    assert_eq!(app.get("/api/v1/chart/999").await.status(), StatusCode::NOT_FOUND);

    let response = app
        .send(Request::delete(format!("/api/v1/chart/?q=!({},{})", id, other)).body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["message"], "Deleted 2 charts");

    let response = app
        .send(Request::delete(format!("/api/v1/chart/{}", id)).body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

fn multipart(zip: &[u8], overwrite: bool) -> Request<Body> {
    let boundary = "chartdataboundary";
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"formData\"; filename=\"charts.zip\"\r\nContent-Type: application/zip\r\n\r\n",
            b = boundary
        )
        .as_bytes(),
    );
    body.extend_from_slice(zip);
    body.extend_from_slice(
        format!(
            "\r\n--{b}\r\nContent-Disposition: form-data; name=\"overwrite\"\r\n\r\n{o}\r\n--{b}--\r\n",
            b = boundary,
            o = overwrite
        )
        .as_bytes(),
    );

    Request::post("/api/v1/chart/import/")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", boundary),
        )
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn test_export_then_import() {
    let app = test_app(Options::default()).await;
    let id = create_chart(&app, "Births").await;

    let response = app.get(&format!("/api/v1/chart/export/?q=!({})", id)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/zip");
    let zip = body_bytes(response).await;

    let files = read_bundle(&zip).unwrap();
    assert!(files.contains_key("metadata.yaml"));
    assert!(files.keys().any(|p| p.starts_with("charts/Births_")));

    // Same uuid without overwrite is rejected, with overwrite accepted.
    let response = app.send(multipart(&zip, false)).await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let response = app.send(multipart(&zip, true)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"message": "OK"}));

    let bad = write_bundle("chart_export_x", &[("metadata.yaml".into(), "type: Dashboard\nversion: 1.0.0\ntimestamp: now\n".into())]).unwrap();
    let response = app.send(multipart(&bad, false)).await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    assert_eq!(
        app.get("/api/v1/chart/export/?q=!(999)").await.status(),
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn test_import_without_upload() {
    let app = test_app(Options::default()).await;
    let response = app
        .send(
            Request::post("/api/v1/chart/import/")
                .header(header::CONTENT_TYPE, "multipart/form-data; boundary=x")
                .body(Body::from("--x--\r\n"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

fn key_hash(key: &str) -> String {
    let salt = SaltString::encode_b64(b"chartdata-salt16").unwrap();
    Argon2::default()
        .hash_password(key.as_bytes(), &salt)
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn test_auth_and_ownership() {
    let keys = vec![
        ApiKeyConfig {
            user_id: "u1".into(),
            username: None,
            key_hash: key_hash("key-one"),
            permissions: vec!["chart:read".into(), "chart:write".into()],
        },
        ApiKeyConfig {
            user_id: "u2".into(),
            username: None,
            key_hash: key_hash("key-two"),
            permissions: vec!["chart:read".into(), "chart:write".into()],
        },
    ];
    let app = test_app(Options {
        authenticator: Some(Arc::new(ApiKeyAuthenticator::new(keys, 60, 100))),
        ..Default::default()
    })
    .await;

    assert_eq!(app.get("/api/v1/chart/").await.status(), StatusCode::UNAUTHORIZED);
    // Health stays public.
    assert_eq!(app.get("/health").await.status(), StatusCode::OK);

    let response = app
        .send(
            Request::post("/api/v1/chart/")
                .header(header::AUTHORIZATION, "Bearer key-one")
                .body(Body::from(
                    json!({"slice_name": "Mine", "viz_type": "table", "datasource_id": 1}).to_string(),
                ))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let id = body_json(response).await["id"].as_i64().unwrap();

    let delete = |key: &str| {
        Request::delete(format!("/api/v1/chart/{}", id))
            .header(header::AUTHORIZATION, format!("Bearer {}", key))
            .body(Body::empty())
            .unwrap()
    };
    assert_eq!(app.send(delete("key-two")).await.status(), StatusCode::FORBIDDEN);
    assert_eq!(app.send(delete("key-one")).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_screenshots() {
    let app = test_app(Options {
        thumbnails: true,
        ..Default::default()
    })
    .await;
    let id = create_chart(&app, "Births").await;

    assert_eq!(
        app.get("/api/v1/chart/999/cache_screenshot/").await.status(),
        StatusCode::NOT_FOUND
    );

    let response = app
        .get(&format!("/api/v1/chart/{}/cache_screenshot/?window_size=1024,768", id))
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = body_json(response).await;
    let image_url = body["image_url"].as_str().unwrap().to_string();

    let mut status = StatusCode::NOT_FOUND;
    for _ in 0..50 {
        let response = app.get(&image_url).await;
        status = response.status();
        if status == StatusCode::OK {
            assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, StatusCode::OK);

    // Thumbnail: first a miss that starts a render, then a redirect from a
    // stale digest once the image is cached.
    let stale = format!("/api/v1/chart/{}/thumbnail/stale/", id);
    assert_eq!(app.get(&stale).await.status(), StatusCode::ACCEPTED);

    let mut response = app.get(&stale).await;
    for _ in 0..50 {
        if response.status() != StatusCode::ACCEPTED {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        response = app.get(&stale).await;
    }
    assert_eq!(response.status(), StatusCode::FOUND);
    let location = response.headers()[header::LOCATION].to_str().unwrap().to_string();
    let response = app.get(&location).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_screenshots_disabled() {
    let app = test_app(Options::default()).await;
    let id = create_chart(&app, "Births").await;
    assert_eq!(
        app.get(&format!("/api/v1/chart/{}/cache_screenshot/", id)).await.status(),
        StatusCode::NOT_FOUND
    );
}
