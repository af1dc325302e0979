use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tracing::debug;

use crate::config::WorkerApiConfig;
use crate::error::{ControlError, Result};

/// What a worker's status path reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    /// Up and serving this artifact (file name only).
    Loaded(String),
    /// Answered, but not with the "loaded" status.
    Unloaded { status: u16 },
    /// No answer at all: not up yet, or dead.
    Unreachable,
}

impl Health {
    pub fn artifact(&self) -> Option<&str> {
        match self {
            Health::Loaded(name) => Some(name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
}

impl From<HttpMethod> for reqwest::Method {
    fn from(m: HttpMethod) -> Self {
        match m {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapOutcome {
    pub accepted: bool,
    pub detail: String,
}

/// HTTP surface of a model worker, addressed by the slot's port.
#[async_trait]
pub trait WorkerEndpoint: Send + Sync {
    async fn health(&self, port: u16) -> Health;
    async fn swap_artifact(&self, port: u16, artifact: &str) -> SwapOutcome;
    async fn invoke(&self, port: u16, method: HttpMethod, path: &str, payload: Bytes) -> Result<(u16, Bytes)>;
}

pub struct HttpEndpoint {
    host: String,
    api: WorkerApiConfig,
    swap_timeout: Duration,
    client: reqwest::Client,
}

impl HttpEndpoint {
    pub fn new(api: WorkerApiConfig, call_timeout: Duration, swap_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(call_timeout).build()?;
        Ok(Self {
            host: "127.0.0.1".to_string(),
            api,
            swap_timeout,
            client,
        })
    }

    fn url(&self, port: u16, path: &str) -> String {
        format!("http://{}:{port}/{}", self.host, path.trim_start_matches('/'))
    }
}

/// `models/20240101-120000.tar.gz` -> `20240101-120000.tar.gz`
fn artifact_file_name(reference: &str) -> String {
    reference
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(reference)
        .to_string()
}

#[async_trait]
impl WorkerEndpoint for HttpEndpoint {
    async fn health(&self, port: u16) -> Health {
        let resp = match self.client.get(self.url(port, &self.api.status_path)).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(port, "endpoint: health unreachable: {e}");
                return Health::Unreachable;
            }
        };
        let status = resp.status().as_u16();
        if status != self.api.health_ok_status {
            if status != self.api.health_unloaded_status {
                debug!(port, status, "endpoint: unexpected health status");
            }
            return Health::Unloaded { status };
        }
        let body: serde_json::Value = match resp.json().await {
            Ok(v) => v,
            Err(_) => return Health::Unloaded { status },
        };
        match body.get(&self.api.artifact_field).and_then(|v| v.as_str()) {
            Some(reference) if !reference.is_empty() => Health::Loaded(artifact_file_name(reference)),
            _ => Health::Unloaded { status },
        }
    }

    async fn swap_artifact(&self, port: u16, artifact: &str) -> SwapOutcome {
        let mut body = serde_json::Map::new();
        body.insert(
            self.api.artifact_field.clone(),
            serde_json::Value::String(artifact.to_string()),
        );
        let resp = self
            .client
            .put(self.url(port, &self.api.swap_path))
            .timeout(self.swap_timeout)
            .json(&body)
            .send()
            .await;
        match resp {
            Ok(r) if r.status().as_u16() == self.api.swap_success_status => SwapOutcome {
                accepted: true,
                detail: String::new(),
            },
            Ok(r) => {
                let status = r.status();
                let text = r.text().await.unwrap_or_default();
                SwapOutcome {
                    accepted: false,
                    detail: format!("HTTP {status}: {}", text.trim()),
                }
            }
            Err(e) => SwapOutcome {
                accepted: false,
                detail: e.to_string(),
            },
        }
    }

    async fn invoke(&self, port: u16, method: HttpMethod, path: &str, payload: Bytes) -> Result<(u16, Bytes)> {
        let mut req = self.client.request(method.into(), self.url(port, path));
        if method != HttpMethod::Get {
            req = req.header("Content-Type", "application/json").body(payload);
        }
        let resp = req.send().await.map_err(|e| ControlError::EndpointUnreachable {
            port,
            detail: e.to_string(),
        })?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await.map_err(|e| ControlError::EndpointUnreachable {
            port,
            detail: e.to_string(),
        })?;
        Ok((status, body))
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        http::StatusCode,
        routing::{get, post, put},
        Json, Router,
    };

    use super::*;

    async fn serve(app: Router) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        port
    }

    fn endpoint() -> HttpEndpoint {
        HttpEndpoint::new(
            WorkerApiConfig::default(),
            Duration::from_secs(2),
            Duration::from_secs(2),
        )
        .unwrap()
    }

    #[test]
    fn test_artifact_file_name() {
        assert_eq!(artifact_file_name("models/faq-20240101.tar.gz"), "faq-20240101.tar.gz");
        assert_eq!(artifact_file_name("/abs/models/x.tar.gz"), "x.tar.gz");
        assert_eq!(artifact_file_name("plain.tar.gz"), "plain.tar.gz");
    }

    #[test]
    fn test_method_parses_uppercase() {
        let m: HttpMethod = serde_json::from_str("\"PUT\"").unwrap();
        assert_eq!(m, HttpMethod::Put);
        assert!(serde_json::from_str::<HttpMethod>("\"DELETE\"").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_worker() {
        let ep = HttpEndpoint::new(
            WorkerApiConfig::default(),
            Duration::from_millis(300),
            Duration::from_millis(300),
        )
        .unwrap();
        assert_eq!(ep.health(9).await, Health::Unreachable);
        let swap = ep.swap_artifact(9, "x.tar.gz").await;
        assert!(!swap.accepted);
        assert!(!swap.detail.is_empty());
        assert!(matches!(
            ep.invoke(9, HttpMethod::Get, "/version", Bytes::new()).await,
            Err(ControlError::EndpointUnreachable { port: 9, .. })
        ));
    }

    #[tokio::test]
    async fn test_health_status_mapping() {
        let loaded = serve(Router::new().route(
            "/status",
            get(|| async { Json(serde_json::json!({"model_file": "models/faq-2.tar.gz"})) }),
        ))
        .await;
        let unloaded = serve(Router::new().route("/status", get(|| async { StatusCode::CONFLICT }))).await;
        let broken = serve(Router::new().route(
            "/status",
            get(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        ))
        .await;
        let no_field = serve(Router::new().route(
            "/status",
            get(|| async { Json(serde_json::json!({"version": "3.6"})) }),
        ))
        .await;

        let ep = endpoint();
        assert_eq!(ep.health(loaded).await, Health::Loaded("faq-2.tar.gz".into()));
        assert_eq!(ep.health(unloaded).await, Health::Unloaded { status: 409 });
        assert_eq!(ep.health(broken).await, Health::Unloaded { status: 500 });
        assert_eq!(ep.health(no_field).await, Health::Unloaded { status: 200 });
    }

    #[tokio::test]
    async fn test_swap_accepts_only_success_status() {
        let ok = serve(Router::new().route(
            "/model",
            put(|Json(body): Json<serde_json::Value>| async move {
                if body["model_file"] == "models/faq-2.tar.gz" {
                    StatusCode::NO_CONTENT
                } else {
                    StatusCode::BAD_REQUEST
                }
            }),
        ))
        .await;
        let plain_ok = serve(Router::new().route("/model", put(|| async { "loading" }))).await;

        let ep = endpoint();
        let swap = ep.swap_artifact(ok, "models/faq-2.tar.gz").await;
        assert!(swap.accepted, "{}", swap.detail);
        assert!(!ep.swap_artifact(ok, "models/other.tar.gz").await.accepted);

        let swap = ep.swap_artifact(plain_ok, "models/faq-2.tar.gz").await;
        assert!(!swap.accepted);
        assert!(swap.detail.contains("200"), "{}", swap.detail);
        assert!(swap.detail.contains("loading"), "{}", swap.detail);
    }

    #[tokio::test]
    async fn test_invoke_forwards_body_and_status() {
        let port = serve(Router::new().route(
            "/webhooks/rest/webhook",
            post(|body: String| async move { (StatusCode::CREATED, format!("echo:{body}")) }),
        ))
        .await;

        let (code, body) = endpoint()
            .invoke(port, HttpMethod::Post, "webhooks/rest/webhook", Bytes::from_static(b"{\"q\":1}"))
            .await
            .unwrap();
        assert_eq!(code, 201);
        assert_eq!(body, Bytes::from_static(b"echo:{\"q\":1}"));
    }
}
