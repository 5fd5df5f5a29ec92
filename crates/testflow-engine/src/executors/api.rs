use std::collections::BTreeMap;

use minijinja::{context, Environment};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use testflow_core::error::{FlowError, Result};
use testflow_core::flow::ApiConfig;
use testflow_core::traits::HttpTransport;
use testflow_core::types::{HttpRequest, HttpResponse};

use crate::context::ContextView;

const METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

/// Issue the configured request and shape the response into the node output.
///
/// `url`, header values and `body` may reference earlier outputs through
/// `{{ nodes["<id>"] }}`. A non-2xx status is still a successful step; only
/// an invalid config or a transport error fails the node.
pub async fn execute(
    node_id: &str,
    config: &ApiConfig,
    http: &dyn HttpTransport,
    view: &ContextView,
    cancel: &CancellationToken,
) -> Result<serde_json::Value> {
    let method = config.method.trim().to_ascii_uppercase();
    if method.is_empty() {
        return Err(FlowError::invalid_config(node_id, "method is required"));
    }
    if config.url.trim().is_empty() {
        return Err(FlowError::invalid_config(node_id, "url is required"));
    }
    if !METHODS.contains(&method.as_str()) {
        return Err(FlowError::invalid_config(
            node_id,
            format!("unsupported HTTP method '{}'", config.method),
        ));
    }

    let nodes = view.outputs_json();
    let url = render(node_id, config.url.trim(), &nodes)?;

    let mut headers = BTreeMap::new();
    for (name, value) in &config.headers {
        headers.insert(name.clone(), render(node_id, value, &nodes)?);
    }

    let body = match &config.body {
        Some(b) if !b.is_empty() => Some(render(node_id, b, &nodes)?),
        _ => None,
    };
    if body.is_some() && !headers.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
        headers.insert("Content-Type".to_string(), "application/json".to_string());
    }

    let request = HttpRequest {
        method,
        url,
        headers,
        body,
    };
    debug!(node_id, method = %request.method, url = %request.url, transport = http.name(), "Sending request");

    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(FlowError::Cancelled),
        resp = http.send(request) => resp?,
    };

    Ok(shape_response(response))
}

fn render(node_id: &str, template: &str, nodes: &serde_json::Value) -> Result<String> {
    if !template.contains("{{") && !template.contains("{%") {
        return Ok(template.to_string());
    }
    let env = Environment::new();
    env.render_str(template, context! { nodes => nodes })
        .map_err(|e| FlowError::invalid_config(node_id, format!("template error: {}", e)))
}

fn shape_response(response: HttpResponse) -> serde_json::Value {
    let body = serde_json::from_str::<serde_json::Value>(&response.body)
        .unwrap_or(serde_json::Value::String(response.body));
    json!({
        "status": response.status,
        "statusText": response.status_text,
        "headers": response.headers,
        "body": body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use testflow_test_utils::StubTransport;

    #[tokio::test]
    async fn test_empty_url_is_invalid_config() {
        let stub = StubTransport::new();
        let config = ApiConfig::new("GET", "  ");
        let err = execute("api", &config, &stub, &ContextView::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::InvalidConfig { ref node, .. } if node == "api"));
        assert!(stub.requests().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_unknown_method() {
        let stub = StubTransport::new();
        let config = ApiConfig::new("FETCH", "http://localhost/x");
        let err = execute("api", &config, &stub, &ContextView::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_config");
    }

    #[tokio::test]
    async fn test_shapes_json_response() {
        let stub = StubTransport::new().respond_with(201, r#"{"id": 7}"#);
        let config = ApiConfig::new("post", "http://localhost/users").with_body(r#"{"name":"a"}"#);
        let out = execute("api", &config, &stub, &ContextView::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out["status"], 201);
        assert_eq!(out["body"]["id"], 7);

        let sent = stub.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].method, "POST");
        assert_eq!(sent[0].headers.get("Content-Type").map(String::as_str), Some("application/json"));
    }

    #[tokio::test]
    async fn test_non_success_status_is_not_a_failure() {
        let stub = StubTransport::new().respond_with(500, "boom");
        let config = ApiConfig::new("GET", "http://localhost/fail");
        let out = execute("api", &config, &stub, &ContextView::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out["status"], 500);
        assert_eq!(out["body"], "boom");
    }

    #[tokio::test]
    async fn test_templates_reference_prior_outputs() {
        let mut ctx = ExecutionContext::new();
        ctx.capture("login", json!({"body": {"token": "abc", "user": 42}}));

        let stub = StubTransport::new();
        let config = ApiConfig::new("GET", "http://localhost/users/{{ nodes.login.body.user }}")
            .with_header("Authorization", r#"Bearer {{ nodes["login"].body.token }}"#);
        execute("me", &config, &stub, &ctx.snapshot(), &CancellationToken::new())
            .await
            .unwrap();

        let sent = stub.requests();
        assert_eq!(sent[0].url, "http://localhost/users/42");
        assert_eq!(sent[0].headers["Authorization"], "Bearer abc");
    }

    #[tokio::test]
    async fn test_transport_error_fails_node() {
        let stub = StubTransport::new().fail_with("connection refused");
        let config = ApiConfig::new("GET", "http://localhost:1/");
        let err = execute("api", &config, &stub, &ContextView::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("connection refused"));
    }
}
