//! End-to-end tests against the full router with in-memory backends

use super::*;
use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{header, HeaderMap, Method, Request, StatusCode},
};
use bissy_common::{
    clock::{ManualClock, SequentialIds},
    executor::{Executor, ExecutorFactory, TestExecutor},
    models::{Datasource, Query},
    Result,
};
use chrono::{TimeDelta, TimeZone, Utc};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use tower::ServiceExt;

/// Echo executor that counts its invocations
struct Counting {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Executor for Counting {
    async fn execute(&self, query: &Query) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        TestExecutor.execute(query).await
    }
}

#[async_trait]
impl ExecutorFactory for Counting {
    async fn executor(&self, _datasource: &Datasource) -> Result<Arc<dyn Executor>> {
        Ok(Arc::new(Counting {
            calls: self.calls.clone(),
        }))
    }
}

struct TestApp {
    router: Router,
    auth: Arc<Authenticator>,
    clock: Arc<ManualClock>,
    cache: Arc<InMemoryCache>,
    executions: Arc<AtomicUsize>,
}

impl TestApp {
    fn new() -> Self {
        Self::with_config(AppConfig::default())
    }

    fn with_config(config: AppConfig) -> Self {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        let datasources: Arc<dyn DatasourceStore> = Arc::new(InMemoryDatasourceStore::new(
            clock.clone(),
            Arc::new(SequentialIds::new("ds")),
        ));
        let queries: Arc<dyn QueryStore> = Arc::new(InMemoryQueryStore::new(
            clock.clone(),
            Arc::new(SequentialIds::new("q")),
        ));
        let api_keys: Arc<dyn ApiKeyStore> = Arc::new(InMemoryApiKeyStore::new(
            clock.clone(),
            Arc::new(SequentialIds::new("key")),
        ));
        let cache = Arc::new(InMemoryCache::new());

        let executions = Arc::new(AtomicUsize::new(0));
        let results = Arc::new(ResultService::new(
            queries.clone(),
            datasources.clone(),
            cache.clone(),
            Arc::new(Counting {
                calls: executions.clone(),
            }),
            clock.clone(),
        ));
        let auth = Arc::new(
            Authenticator::new(&config.auth, "test_secret", api_keys.clone(), clock.clone())
                .unwrap(),
        );

        let state = AppState {
            config: Arc::new(config),
            db: None,
            datasources,
            queries,
            api_keys,
            cache: cache.clone(),
            results,
            auth: auth.clone(),
            metrics: None,
        };

        Self {
            router: create_router(state),
            auth,
            clock,
            cache,
            executions,
        }
    }

    fn token(&self, user_id: &str) -> String {
        self.auth.jwt().generate_token(user_id).unwrap()
    }

    fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, body.to_vec())
    }

    /// Bearer-authenticated JSON request
    async fn call(
        &self,
        user_id: &str,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, HeaderMap, Vec<u8>) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token(user_id)));
        let body = match body {
            Some(value) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        self.send(builder.body(body).unwrap()).await
    }

    async fn json(&self, user_id: &str, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let (status, _, bytes) = self.call(user_id, method, uri, body).await;
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn create_datasource(&self, user_id: &str) -> String {
        let (status, body) = self
            .json(
                user_id,
                Method::POST,
                "/datasources",
                Some(json!({ "name": "warehouse", "type": "test", "options": "" })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        body["id"].as_str().unwrap().to_string()
    }

    async fn create_query(&self, user_id: &str, sql: &str, datasource_id: &str) -> String {
        let (status, body) = self
            .json(
                user_id,
                Method::POST,
                "/queries",
                Some(json!({ "query": sql, "lifetime": "1h", "datasourceId": datasource_id })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        body["id"].as_str().unwrap().to_string()
    }
}

#[tokio::test]
async fn test_cold_read_then_cache_hit() {
    let app = TestApp::new();
    let ds = app.create_datasource("alice").await;
    let q = app.create_query("alice", "SELECT * FROM users", &ds).await;
    let uri = format!("/queries/{}/result", q);

    let (status, headers, body) = app.call("alice", Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/csv"));
    assert_eq!(body, b"Got: SELECT * FROM users");
    assert_eq!(app.executions(), 1);

    let (status, _, again) = app.call("alice", Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again, body);
    assert_eq!(app.executions(), 1);
}

#[tokio::test]
async fn test_update_with_stale_refresh_re_executes() {
    let app = TestApp::new();
    let ds = app.create_datasource("alice").await;
    let q = app.create_query("alice", "SELECT * FROM users", &ds).await;
    let uri = format!("/queries/{}/result", q);
    app.call("alice", Method::GET, &uri, None).await;

    let two_hours_ago = app.clock.now() - TimeDelta::hours(2);
    let (status, updated) = app
        .json(
            "alice",
            Method::PATCH,
            &format!("/queries/{}", q),
            Some(json!({
                "query": "SELECT * FROM orders",
                "lastRefresh": two_hours_ago.to_rfc3339(),
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["query"], "SELECT * FROM orders");
    assert_eq!(updated["lifetime"], "1h0m0s");

    let (status, _, body) = app.call("alice", Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"Got: SELECT * FROM orders");
    assert_eq!(app.executions(), 2);
}

#[tokio::test]
async fn test_future_refresh_rejected() {
    let app = TestApp::new();
    let ds = app.create_datasource("alice").await;
    let q = app.create_query("alice", "SELECT 1", &ds).await;
    let uri = format!("/queries/{}/result", q);
    app.call("alice", Method::GET, &uri, None).await;

    let next_year = app.clock.now() + TimeDelta::days(365);
    let (status, body) = app
        .json(
            "alice",
            Method::PATCH,
            &format!("/queries/{}", q),
            Some(json!({ "lastRefresh": next_year.to_rfc3339() })),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    // The cached artifact still expires on schedule
    app.clock.advance(TimeDelta::hours(2));
    app.call("alice", Method::GET, &uri, None).await;
    assert_eq!(app.executions(), 2);
}

#[tokio::test]
async fn test_lifetime_accepts_nanoseconds() {
    let app = TestApp::new();
    let ds = app.create_datasource("alice").await;

    let (status, body) = app
        .json(
            "alice",
            Method::POST,
            "/queries",
            Some(json!({
                "query": "SELECT 1",
                "lifetime": 3_600_000_000_000i64,
                "datasourceId": ds,
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["lifetime"], "1h0m0s");

    let (status, body) = app
        .json(
            "alice",
            Method::PATCH,
            &format!("/queries/{}", body["id"].as_str().unwrap()),
            Some(json!({ "lifetime": 90_000_000_000i64 })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["lifetime"], "1m30s");
}

#[tokio::test]
async fn test_negative_lifetime_rejected() {
    let app = TestApp::new();
    let ds = app.create_datasource("alice").await;

    let (status, body) = app
        .json(
            "alice",
            Method::POST,
            "/queries",
            Some(json!({ "query": "SELECT 1", "lifetime": "-1m", "datasourceId": ds })),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "INVALID_DURATION");

    let q = app.create_query("alice", "SELECT 1", &ds).await;
    let (status, body) = app
        .json(
            "alice",
            Method::PATCH,
            &format!("/queries/{}", q),
            Some(json!({ "lifetime": -1 })),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "INVALID_DURATION");

    let (_, stored) = app.json("alice", Method::GET, &format!("/queries/{}", q), None).await;
    assert_eq!(stored["lifetime"], "1h0m0s");
}

#[tokio::test]
async fn test_cross_tenant_isolation() {
    let app = TestApp::new();
    let ds = app.create_datasource("alice").await;
    let q = app.create_query("alice", "SELECT 1", &ds).await;

    let (status, body) = app.json("bob", Method::GET, &format!("/queries/{}", q), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");

    let (status, _, _) = app
        .call("bob", Method::GET, &format!("/queries/{}/result", q), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(app.executions(), 0);

    let (status, _) = app
        .json("bob", Method::DELETE, &format!("/datasources/{}", ds), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_query_cannot_reference_foreign_datasource() {
    let app = TestApp::new();
    let ds = app.create_datasource("alice").await;

    let (status, _) = app
        .json(
            "bob",
            Method::POST,
            "/queries",
            Some(json!({ "query": "SELECT 1", "lifetime": "1h", "datasourceId": ds })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_api_key_lifecycle() {
    let app = TestApp::new();

    let (status, created) = app
        .json("alice", Method::POST, "/apikeys", Some(json!({ "name": "ci" })))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let key = created["key"].as_str().unwrap().to_string();
    let key_id = created["id"].as_str().unwrap().to_string();

    let with_key = || {
        Request::builder()
            .uri("/queries")
            .header("x-bissy-apikey", key.as_str())
            .body(Body::empty())
            .unwrap()
    };

    let (status, _, _) = app.send(with_key()).await;
    assert_eq!(status, StatusCode::OK);

    let (status, listed) = app.json("alice", Method::GET, "/apikeys", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(listed[0].get("key").is_none());
    assert!(!listed[0]["lastUsed"].is_null());

    let (status, _) = app
        .json("alice", Method::DELETE, &format!("/apikeys/{}", key_id), None)
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, headers, _) = app.send(with_key()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(headers.contains_key(header::WWW_AUTHENTICATE));
}

#[tokio::test]
async fn test_pagination() {
    let app = TestApp::new();
    let ds = app.create_datasource("alice").await;
    for i in 1..=30 {
        app.create_query("alice", &format!("SELECT {}", i), &ds).await;
        app.clock.advance(TimeDelta::seconds(1));
    }

    let (status, first) = app.json("alice", Method::GET, "/queries", None).await;
    assert_eq!(status, StatusCode::OK);
    let first = first.as_array().unwrap();
    assert_eq!(first.len(), 25);
    assert_eq!(first[0]["query"], "SELECT 1");
    assert_eq!(first[24]["query"], "SELECT 25");

    let (status, page) = app
        .json("alice", Method::GET, "/queries?page=2&per=5", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let sql: Vec<&str> = page
        .as_array()
        .unwrap()
        .iter()
        .map(|q| q["query"].as_str().unwrap())
        .collect();
    assert_eq!(sql, ["SELECT 6", "SELECT 7", "SELECT 8", "SELECT 9", "SELECT 10"]);

    let (status, body) = app.json("alice", Method::GET, "/queries?page=0", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_PAGINATION");

    let (status, _) = app.json("alice", Method::GET, "/queries?per=ten", None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_delete_query_drops_cached_result() {
    let app = TestApp::new();
    let ds = app.create_datasource("alice").await;
    let q = app.create_query("alice", "SELECT 1", &ds).await;
    app.call("alice", Method::GET, &format!("/queries/{}/result", q), None)
        .await;

    let (_, stored) = app.json("alice", Method::GET, &format!("/queries/{}", q), None).await;
    let stored: Query = serde_json::from_value(stored).unwrap();
    assert_eq!(app.cache.get(&stored).await.as_deref(), Some("Got: SELECT 1"));

    let (status, deleted) = app
        .json("alice", Method::DELETE, &format!("/queries/{}", q), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deleted["id"], q.as_str());
    assert_eq!(app.cache.get(&stored).await, None);

    let (status, _) = app.json("alice", Method::GET, &format!("/queries/{}", q), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_deleted_datasource_fails_result() {
    let app = TestApp::new();
    let ds = app.create_datasource("alice").await;
    let q = app.create_query("alice", "SELECT 1", &ds).await;
    app.json("alice", Method::DELETE, &format!("/datasources/{}", ds), None)
        .await;

    let (status, body) = app
        .json("alice", Method::GET, &format!("/queries/{}/result", q), None)
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"]["code"], "DATASOURCE_MISSING");
}

#[tokio::test]
async fn test_body_rejections() {
    let app = TestApp::new();

    let (status, body) = app
        .json(
            "alice",
            Method::POST,
            "/queries",
            Some(json!({ "query": "SELECT 1", "lifetime": "forever" })),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "INVALID_BODY");

    let (status, _) = app
        .json(
            "alice",
            Method::POST,
            "/datasources",
            Some(json!({ "name": "x", "type": "oracle" })),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, body) = app
        .json("alice", Method::POST, "/apikeys", Some(json!({ "name": "" })))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_missing_credentials() {
    let app = TestApp::new();

    let request = Request::builder().uri("/datasources").body(Body::empty()).unwrap();
    let (status, headers, _) = app.send(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(headers[header::WWW_AUTHENTICATE], "Bearer realm=\"bissy\"");

    let request = Request::builder()
        .uri("/datasources")
        .header(header::AUTHORIZATION, "Bearer not-a-jwt")
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = app.send(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_probes() {
    let app = TestApp::new();

    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, _, body) = app.send(request).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["status"], "healthy");

    let request = Request::builder().uri("/ready").body(Body::empty()).unwrap();
    let (status, _, body) = app.send(request).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["checks"]["cache"]["status"], "up");
    assert!(body["checks"].get("database").is_none());

    // Recorder not installed
    let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
    let (status, _, _) = app.send(request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_rate_limit_rejects_excess_requests() {
    let mut config = AppConfig::default();
    config.rate_limit.enabled = true;
    config.rate_limit.requests_per_second = 1;
    config.rate_limit.burst = 1;
    let app = TestApp::with_config(config);

    let (status, _) = app.json("alice", Method::GET, "/queries", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app.json("alice", Method::GET, "/queries", None).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["code"], "RATE_LIMITED");

    // Probes are exempt
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, _, _) = app.send(request).await;
    assert_eq!(status, StatusCode::OK);
}
