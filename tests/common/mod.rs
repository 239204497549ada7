use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::{Body, to_bytes},
    extract::ConnectInfo,
    http::{Request, StatusCode, header},
};
use git_workspace_daemon::{
    admission::{GLOBAL_LIMIT, PAIRING_LIMIT, RateLimiter},
    config::{Config, ConfigStore},
    handlers::router,
    jobs::JobManager,
    pairing::PairingManager,
    state::AppState,
    tokens::TokenStore,
};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

pub const ORIGIN: &str = "http://localhost:5173";
pub const PEER: ([u8; 4], u16) = ([127, 0, 0, 1], 43521);

pub struct TestApp {
    pub app: Router,
    pub state: AppState,
    _config_dir: TempDir,
    pub workspace: TempDir,
}

impl TestApp {
    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self
            .app
            .clone()
            .oneshot(request)
            .await
            .expect("request should execute");
        let status = response.status();
        let body = to_bytes(response.into_body(), 4 * 1024 * 1024)
            .await
            .expect("response body should be readable");
        let parsed = serde_json::from_slice::<Value>(&body).unwrap_or(Value::Null);
        (status, parsed)
    }

    pub async fn send_raw(&self, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, String) {
        let response = self
            .app
            .clone()
            .oneshot(request)
            .await
            .expect("request should execute");
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), 4 * 1024 * 1024)
            .await
            .expect("response body should be readable");
        (status, headers, String::from_utf8_lossy(&body).into_owned())
    }

    /// Mint a bearer for `ORIGIN` without walking the pairing flow.
    pub fn issue_token(&self) -> String {
        let (token, _) = self
            .state
            .tokens
            .issue(ORIGIN, 30)
            .expect("token issue should succeed");
        token
    }
}

pub async fn build_test_app() -> TestApp {
    build_test_app_with(|_config| {}).await
}

pub async fn build_test_app_with<F>(mutate: F) -> TestApp
where
    F: FnOnce(&mut Config),
{
    let config_dir = TempDir::new().expect("config dir should be created");
    let workspace = TempDir::new().expect("workspace dir should be created");

    let config_store = ConfigStore::load(config_dir.path()).expect("config should load");
    let workspace_root = workspace.path().to_path_buf();
    config_store
        .update(|config| {
            config.workspace_root = Some(workspace_root);
            mutate(config);
        })
        .expect("config should persist");
    let config = config_store.get();

    let state = AppState {
        config: Arc::new(config_store),
        tokens: Arc::new(TokenStore::load(config_dir.path()).expect("tokens should load")),
        pairing: Arc::new(PairingManager::new()),
        jobs: JobManager::new(
            config.jobs.max_concurrent,
            Duration::from_secs(config.jobs.timeout_seconds),
        ),
        global_limiter: Arc::new(RateLimiter::new(GLOBAL_LIMIT)),
        pairing_limiter: Arc::new(RateLimiter::new(PAIRING_LIMIT)),
        config_dir: config_dir.path().to_path_buf(),
    };
    let app = router(state.clone());

    TestApp {
        app,
        state,
        _config_dir: config_dir,
        workspace,
    }
}

fn base_request(method: &str, uri: &str) -> axum::http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::HOST, "127.0.0.1:8417")
}

fn with_peer(mut request: Request<Body>) -> Request<Body> {
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from(PEER)));
    request
}

/// A loopback request carrying an allowed Origin.
pub fn get_request(uri: &str, origin: &str) -> Request<Body> {
    with_peer(
        base_request("GET", uri)
            .header(header::ORIGIN, origin)
            .body(Body::empty())
            .expect("request should build"),
    )
}

pub fn json_request(method: &str, uri: &str, origin: &str, body: Value) -> Request<Body> {
    with_peer(
        base_request(method, uri)
            .header(header::ORIGIN, origin)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request should build"),
    )
}

pub fn authed_get(uri: &str, origin: &str, token: &str) -> Request<Body> {
    with_peer(
        base_request("GET", uri)
            .header(header::ORIGIN, origin)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .expect("request should build"),
    )
}

pub fn authed_json(
    method: &str,
    uri: &str,
    origin: &str,
    token: &str,
    body: Value,
) -> Request<Body> {
    with_peer(
        base_request(method, uri)
            .header(header::ORIGIN, origin)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request should build"),
    )
}

/// Same shape but with full control over peer, host, and origin, for
/// admission-filter tests.
pub fn raw_request(
    method: &str,
    uri: &str,
    peer: SocketAddr,
    host: Option<&str>,
    origin: Option<&str>,
) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(host) = host {
        builder = builder.header(header::HOST, host);
    }
    if let Some(origin) = origin {
        builder = builder.header(header::ORIGIN, origin);
    }
    let mut request = builder.body(Body::empty()).expect("request should build");
    request.extensions_mut().insert(ConnectInfo(peer));
    request
}
