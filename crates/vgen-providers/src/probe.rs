//! Liveness probe helpers.

use std::path::Path;

use reqwest::Client;
use serde_json::Value;
use tracing::debug;

/// Result of a single liveness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub available: bool,
    pub reason: Option<String>,
}

impl ProbeOutcome {
    pub fn up() -> Self {
        Self {
            available: true,
            reason: None,
        }
    }

    pub fn down(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            reason: Some(reason.into()),
        }
    }
}

/// Probe a local model server: the endpoint must answer with a JSON body
/// listing at least one installed model.
///
/// `count_models` extracts the model count from the response body.
pub async fn probe_model_server<F>(http: &Client, url: &str, count_models: F) -> ProbeOutcome
where
    F: FnOnce(&Value) -> usize,
{
    let response = match http.get(url).send().await {
        Ok(r) => r,
        Err(e) => {
            debug!("Probe of {} failed: {}", url, e);
            return ProbeOutcome::down(format!("unreachable: {e}"));
        }
    };

    if !response.status().is_success() {
        return ProbeOutcome::down(format!("HTTP {}", response.status().as_u16()));
    }

    let body: Value = match response.json().await {
        Ok(v) => v,
        Err(e) => return ProbeOutcome::down(format!("invalid probe response: {e}")),
    };

    match count_models(&body) {
        0 => ProbeOutcome::down("no models installed"),
        _ => ProbeOutcome::up(),
    }
}

/// Paid APIs are treated as live once a key is configured; real validation
/// happens on first use.
pub fn probe_api_key(key: Option<&str>) -> ProbeOutcome {
    match key {
        Some(k) if !k.trim().is_empty() => ProbeOutcome::up(),
        _ => ProbeOutcome::down("API key not configured"),
    }
}

/// The binary must resolve on PATH (or be an existing path).
pub fn probe_binary(binary: &str) -> ProbeOutcome {
    match which::which(binary) {
        Ok(_) => ProbeOutcome::up(),
        Err(_) => ProbeOutcome::down(format!("{binary} not found in PATH")),
    }
}

/// The file must exist.
pub fn probe_file(path: &Path, what: &str) -> ProbeOutcome {
    if path.is_file() {
        ProbeOutcome::up()
    } else {
        ProbeOutcome::down(format!("{what} not found at {}", path.display()))
    }
}

/// Length of the array at `key`, or of the body itself when it is an array.
pub fn array_len(body: &Value, key: Option<&str>) -> usize {
    let target = match key {
        Some(k) => body.get(k),
        None => Some(body),
    };
    target.and_then(Value::as_array).map(Vec::len).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_model_server_with_models_is_up() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "models": [{"name": "llama3.1"}]
            })))
            .mount(&server)
            .await;

        let url = format!("{}/api/tags", server.uri());
        let outcome = probe_model_server(&Client::new(), &url, |b| array_len(b, Some("models"))).await;
        assert_eq!(outcome, ProbeOutcome::up());
    }

    #[tokio::test]
    async fn test_model_server_without_models_is_down() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "models": [] })))
            .mount(&server)
            .await;

        let url = format!("{}/api/tags", server.uri());
        let outcome = probe_model_server(&Client::new(), &url, |b| array_len(b, Some("models"))).await;
        assert!(!outcome.available);
        assert_eq!(outcome.reason.as_deref(), Some("no models installed"));
    }

    #[tokio::test]
    async fn test_model_server_error_status_is_down() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let url = format!("{}/sdapi/v1/sd-models", server.uri());
        let outcome = probe_model_server(&Client::new(), &url, |b| array_len(b, None)).await;
        assert_eq!(outcome.reason.as_deref(), Some("HTTP 503"));
    }

    #[test]
    fn test_api_key_probe() {
        assert!(probe_api_key(Some("sk-123")).available);
        assert!(!probe_api_key(Some("  ")).available);
        assert!(!probe_api_key(None).available);
    }

    #[test]
    fn test_missing_binary_probe() {
        let outcome = probe_binary("vgen-definitely-not-installed");
        assert!(!outcome.available);
        assert!(outcome.reason.unwrap().contains("not found"));
    }
}
