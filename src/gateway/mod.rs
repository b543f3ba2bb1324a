//! A thin HTTP proxy in front of the compute host.

mod error;

use std::{env, sync::Arc, time::Duration};

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use log::{debug, warn};
use reqwest::Method;
use serde_json::{json, Value};

pub use error::GatewayError;

/// Environment variable holding the compute host's base URL.
pub const UPSTREAM_ENV: &str = "COMPUTE_SERVER_URL_FL";
const DEFAULT_UPSTREAM: &str = "http://127.0.0.1:8888";

/// Where and how patiently the gateway forwards requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub upstream: String,
    pub start_timeout: Duration,
    pub status_timeout: Duration,
}

impl GatewayConfig {
    pub fn new(upstream: impl Into<String>) -> Self {
        Self {
            upstream: upstream.into(),
            start_timeout: Duration::from_secs(15),
            status_timeout: Duration::from_secs(10),
        }
    }

    /// Reads the upstream from `COMPUTE_SERVER_URL_FL`, falling back to localhost.
    pub fn from_env() -> Self {
        Self::new(env::var(UPSTREAM_ENV).unwrap_or_else(|_| DEFAULT_UPSTREAM.to_string()))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.upstream.trim_end_matches('/'))
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::new(DEFAULT_UPSTREAM)
    }
}

#[derive(Clone)]
struct GatewayState {
    config: Arc<GatewayConfig>,
}

/// The gateway's routes.
pub fn router(config: GatewayConfig) -> Router {
    let state = GatewayState {
        config: Arc::new(config),
    };

    Router::new()
        .route("/api/hello", get(hello))
        .route("/api/start-training", post(start_training))
        .route("/api/get-status", get(get_status))
        .with_state(state)
}

async fn hello(State(state): State<GatewayState>) -> Json<Value> {
    Json(json!({
        "message": format!("Proxy is running and configured for: {}", state.config.upstream)
    }))
}

async fn start_training(State(state): State<GatewayState>) -> Result<Json<Value>, GatewayError> {
    let timeout = state.config.start_timeout;
    forward(&state, Method::POST, "/start-training", timeout).await
}

async fn get_status(State(state): State<GatewayState>) -> Result<Json<Value>, GatewayError> {
    let timeout = state.config.status_timeout;
    forward(&state, Method::GET, "/get-status", timeout).await
}

/// Forwards a bodyless request upstream and relays its JSON answer.
async fn forward(
    state: &GatewayState,
    method: Method,
    path: &str,
    timeout: Duration,
) -> Result<Json<Value>, GatewayError> {
    let url = state.config.url(path);
    debug!("forwarding {method} {url}");

    let result = relay(method, &url, timeout).await;
    if let Err(e) = &result {
        warn!("{url}: {e}");
    }
    result
}

/// Sends one request through a client scoped to it, dropped on every return path.
async fn relay(method: Method, url: &str, timeout: Duration) -> Result<Json<Value>, GatewayError> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    let response = client.request(method, url).send().await?;

    let status = response.status();
    // A body stalled past the timeout is a transport error like any other.
    let body = response.bytes().await?;

    if !status.is_success() {
        return Err(GatewayError::UpstreamHttp {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&body).into_owned(),
        });
    }

    serde_json::from_slice(&body)
        .map(Json)
        .map_err(|e| GatewayError::InternalProxy(e.to_string()))
}
