use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::json;

use testflow_core::config::{ApiMode, HttpConfig};
use testflow_core::error::{FlowError, Result};
use testflow_core::traits::HttpTransport;
use testflow_core::types::{HttpRequest, HttpResponse};

/// Build the transport selected by `api_mode`.
pub fn transport_for(mode: ApiMode, config: &HttpConfig) -> Result<Arc<dyn HttpTransport>> {
    let transport: Arc<dyn HttpTransport> = match mode {
        ApiMode::Live => Arc::new(ReqwestTransport::new(config)?),
        ApiMode::Simulated => Arc::new(SimulatedTransport),
    };
    Ok(transport)
}

/// Real network transport backed by a shared reqwest client.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| FlowError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

impl HttpTransport for ReqwestTransport {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse>> {
        Box::pin(async move {
            let method = reqwest::Method::from_bytes(request.method.as_bytes())
                .map_err(|_| FlowError::Execution(format!("invalid method {}", request.method)))?;

            let mut builder = self.client.request(method, &request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let resp = builder
                .send()
                .await
                .map_err(|e| FlowError::Execution(format!("request to {} failed: {}", request.url, e)))?;

            let status = resp.status();
            let mut headers: BTreeMap<String, String> = BTreeMap::new();
            for (name, value) in resp.headers() {
                let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
                headers
                    .entry(name.as_str().to_string())
                    .and_modify(|v| {
                        v.push_str(", ");
                        v.push_str(&value);
                    })
                    .or_insert(value);
            }
            let body = resp
                .text()
                .await
                .map_err(|e| FlowError::Execution(format!("failed to read response body: {}", e)))?;

            Ok(HttpResponse {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or("").to_string(),
                headers,
                body,
            })
        })
    }

    fn name(&self) -> &str {
        "reqwest"
    }
}

/// Offline transport for demos: every request succeeds with a body that
/// echoes what was sent.
pub struct SimulatedTransport;

impl HttpTransport for SimulatedTransport {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse>> {
        Box::pin(async move {
            let mut body = json!({
                "message": "Simulated response",
                "method": request.method,
                "url": request.url,
            });
            if let Some(raw) = &request.body {
                body["requestBody"] = serde_json::from_str(raw)
                    .unwrap_or_else(|_| serde_json::Value::String(raw.clone()));
            }

            let mut headers = BTreeMap::new();
            headers.insert("content-type".to_string(), "application/json".to_string());

            Ok(HttpResponse {
                status: 200,
                status_text: "OK".to_string(),
                headers,
                body: body.to_string(),
            })
        })
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulated_echoes_request() {
        let resp = SimulatedTransport
            .send(HttpRequest {
                method: "POST".into(),
                url: "https://api.example.test/items".into(),
                headers: BTreeMap::new(),
                body: Some(r#"{"name":"widget"}"#.into()),
            })
            .await
            .unwrap();

        assert_eq!(resp.status, 200);
        let body: serde_json::Value = serde_json::from_str(&resp.body).unwrap();
        assert_eq!(body["method"], "POST");
        assert_eq!(body["url"], "https://api.example.test/items");
        assert_eq!(body["requestBody"]["name"], "widget");
    }

    #[test]
    fn test_transport_for_mode() {
        let http = HttpConfig::default();
        assert_eq!(transport_for(ApiMode::Simulated, &http).unwrap().name(), "simulated");
        assert_eq!(transport_for(ApiMode::Live, &http).unwrap().name(), "reqwest");
    }
}
