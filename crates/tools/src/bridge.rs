//! JSON-RPC 2.0 client for the HTTP tool bridge.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use proto::BridgeError;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::ToolBridge;

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(400);
const RETRYABLE_STATUS: &[u16] = &[408, 429, 502, 503, 504];
const SNIPPET_CHARS: usize = 800;

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

/// Bridge reached over `POST {base}/mcp` and `GET {base}/health`.
///
/// Transport failures, invalid JSON bodies and HTTP 408/429/502/503/504 are
/// retried up to three attempts with exponential backoff before the error
/// surfaces.
pub struct HttpBridge {
    client: reqwest::Client,
    base_url: String,
    next_id: AtomicU64,
    backoff: Duration,
}

impl HttpBridge {
    /// Creates a client with the given per-request timeout.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, BridgeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BridgeError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            next_id: AtomicU64::new(1),
            backoff: BACKOFF_BASE,
        })
    }

    /// Overrides the base retry delay.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn rpc(&self, method: &str, params: Option<Value>) -> Result<Value, BridgeError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        let url = format!("{}/mcp", self.base_url);
        debug!(method = %method, id = id, "Sending bridge request");

        let data = self
            .with_retry(method, || self.client.post(&url).json(&payload), |body| {
                serde_json::from_str::<Value>(body).map_err(|_| {
                    BridgeError::InvalidResponse(format!("invalid json response: {}", snippet(body)))
                })
            })
            .await?;

        if let Some(err) = data.get("error").filter(|e| !e.is_null()) {
            let code = err.get("code").and_then(Value::as_i64).unwrap_or_default();
            let detail = err
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string());
            let params = payload
                .params
                .as_ref()
                .map(|p| snippet(&p.to_string()))
                .unwrap_or_else(|| "null".to_string());
            return Err(BridgeError::JsonRpc {
                code,
                message: format!("calling {method}: {detail} (params={params})"),
            });
        }
        Ok(data)
    }

    async fn with_retry<B, P, T>(&self, label: &str, build: B, parse: P) -> Result<T, BridgeError>
    where
        B: Fn() -> reqwest::RequestBuilder,
        P: Fn(&str) -> Result<T, BridgeError>,
    {
        let mut last_err = BridgeError::Transport(format!("{label}: no attempt made"));
        for attempt in 0..MAX_ATTEMPTS {
            match self.attempt(build(), &parse).await {
                Ok(value) => return Ok(value),
                Err((err, retryable)) => {
                    warn!(
                        request = %label,
                        attempt = attempt + 1,
                        retryable = retryable,
                        error = %err,
                        "Bridge request failed"
                    );
                    if !retryable {
                        return Err(err);
                    }
                    last_err = err;
                }
            }
            if attempt + 1 < MAX_ATTEMPTS {
                tokio::time::sleep(self.backoff * 2u32.pow(attempt)).await;
            }
        }
        Err(last_err)
    }

    async fn attempt<P, T>(
        &self,
        request: reqwest::RequestBuilder,
        parse: &P,
    ) -> Result<T, (BridgeError, bool)>
    where
        P: Fn(&str) -> Result<T, BridgeError>,
    {
        let resp = request
            .send()
            .await
            .map_err(|e| (BridgeError::Transport(e.to_string()), true))?;
        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| (BridgeError::Transport(e.to_string()), true))?;
        if !(200..300).contains(&status) {
            let retryable = RETRYABLE_STATUS.contains(&status);
            return Err((
                BridgeError::Http {
                    status,
                    body: snippet(&body),
                },
                retryable,
            ));
        }
        parse(&body).map_err(|e| (e, true))
    }
}

#[async_trait]
impl ToolBridge for HttpBridge {
    async fn list_tools(&self) -> Result<Value, BridgeError> {
        self.rpc("tools/list", None).await
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, BridgeError> {
        self.rpc(
            "tools/call",
            Some(serde_json::json!({"name": name, "arguments": arguments})),
        )
        .await
    }

    async fn health(&self) -> Result<String, BridgeError> {
        let url = format!("{}/health", self.base_url);
        self.with_retry("health", || self.client.get(&url), |body| Ok(body.trim().to_string()))
            .await
    }
}

/// First 800 chars of a trimmed body, marked when cut.
fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= SNIPPET_CHARS {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(SNIPPET_CHARS).collect();
    format!("{cut}...(truncated)")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone)]
    struct Script {
        hits: Arc<AtomicUsize>,
        /// Statuses returned before the first success.
        failures: Vec<u16>,
        /// Body returned on success.
        body: String,
    }

    async fn mcp(State(script): State<Script>, Json(req): Json<Value>) -> Response {
        let n = script.hits.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = script.failures.get(n) {
            let status = StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            return (status, "busy").into_response();
        }
        let body = script.body.replace("\"$ID\"", &req["id"].to_string());
        ([("content-type", "application/json")], body).into_response()
    }

    async fn health(State(script): State<Script>) -> Response {
        script.hits.fetch_add(1, Ordering::SeqCst);
        "  r2 bridge ok\n".into_response()
    }

    async fn serve(failures: Vec<u16>, body: &str) -> (HttpBridge, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let script = Script {
            hits: hits.clone(),
            failures,
            body: body.to_string(),
        };
        let app = Router::new()
            .route("/mcp", post(mcp))
            .route("/health", get(health))
            .with_state(script);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        let bridge = HttpBridge::new(format!("http://{addr}/"), Duration::from_secs(5))
            .expect("client")
            .with_backoff(Duration::from_millis(1));
        (bridge, hits)
    }

    #[tokio::test]
    async fn list_tools_returns_full_response() {
        let (bridge, hits) = serve(
            vec![],
            r#"{"jsonrpc":"2.0","id":"$ID","result":{"tools":[{"name":"r2_open_file","inputSchema":{}}]}}"#,
        )
        .await;
        let resp = bridge.list_tools().await.expect("list");
        assert_eq!(resp["id"], 1);
        assert_eq!(resp["result"]["tools"][0]["name"], "r2_open_file");

        let second = bridge.list_tools().await.expect("list again");
        assert_eq!(second["id"], 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn transient_status_is_retried() {
        let (bridge, hits) = serve(vec![503, 429], r#"{"jsonrpc":"2.0","id":"$ID","result":{"ok":true}}"#).await;
        let resp = bridge
            .call_tool("termux_command", json!({"command": "id"}))
            .await
            .expect("call succeeds on third attempt");
        assert_eq!(resp["result"]["ok"], true);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_three_attempts() {
        let (bridge, hits) = serve(vec![502, 502, 502], "{}").await;
        let err = bridge.list_tools().await.expect_err("exhausted");
        assert!(matches!(err, BridgeError::Http { status: 502, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn other_http_errors_fail_immediately() {
        let (bridge, hits) = serve(vec![404], "{}").await;
        let err = bridge.list_tools().await.expect_err("not found");
        assert!(matches!(err, BridgeError::Http { status: 404, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_json_is_retried_then_reported() {
        let (bridge, hits) = serve(vec![], "<html>gateway</html>").await;
        let err = bridge.list_tools().await.expect_err("not json");
        assert!(matches!(err, BridgeError::InvalidResponse(ref m) if m.contains("<html>")));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn json_rpc_error_is_hard_failure() {
        let (bridge, hits) = serve(
            vec![],
            r#"{"jsonrpc":"2.0","id":"$ID","error":{"code":-32602,"message":"bad params"}}"#,
        )
        .await;
        let err = bridge
            .call_tool("r2_open_file", json!({"file_path": "/a.so"}))
            .await
            .expect_err("rpc error");
        let BridgeError::JsonRpc { code, message } = err else {
            panic!("expected JSON-RPC error");
        };
        assert_eq!(code, -32602);
        assert!(message.contains("tools/call"));
        assert!(message.contains("bad params"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn health_returns_trimmed_text() {
        let (bridge, _) = serve(vec![], "{}").await;
        assert_eq!(bridge.health().await.expect("health"), "r2 bridge ok");
    }

    #[tokio::test]
    async fn unreachable_bridge_is_transport_error() {
        let bridge = HttpBridge::new("http://127.0.0.1:1", Duration::from_millis(200))
            .expect("client")
            .with_backoff(Duration::from_millis(1));
        let err = bridge.health().await.expect_err("refused");
        assert!(matches!(err, BridgeError::Transport(_)));
    }

    #[test]
    fn snippet_truncates_long_bodies() {
        let long = "a".repeat(900);
        let cut = snippet(&long);
        assert!(cut.ends_with("...(truncated)"));
        assert_eq!(cut.chars().count(), 800 + "...(truncated)".len());
    }
}
