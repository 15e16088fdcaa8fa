//! HTTP client for the Runforge server.

use anyhow::{Context, Result};
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// HTTP client for the Runforge API.
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(self.request(Method::GET, path)).await
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        self.send(self.request(Method::POST, path).json(body)).await
    }

    pub async fn put<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        self.send(self.request(Method::PUT, path).json(body)).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(self.request(Method::DELETE, path)).await
    }

    /// The whole body, whatever the status (the health check answers 503
    /// with a useful payload).
    pub async fn get_raw(&self, path: &str) -> Result<Value> {
        let url = self.url(path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;
        resp.json()
            .await
            .with_context(|| format!("Failed to parse response from {}", url))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client.request(method, self.url(path))
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let resp = request.send().await.context("Request to the Runforge server failed")?;
        let status = resp.status();
        let url = resp.url().to_string();
        let text = resp.text().await.unwrap_or_default();
        let body: Value = serde_json::from_str(&text)
            .with_context(|| format!("Unexpected response from {} ({}): {}", url, status, text))?;
        unwrap_data(body).with_context(|| format!("{} returned {}", url, status))
    }
}

/// Extract `data` from a success envelope, or the message from either
/// error shape (`error: "..."` or `error: {message}`).
fn unwrap_data<T: DeserializeOwned>(mut body: Value) -> Result<T> {
    if body.get("success").and_then(Value::as_bool) == Some(true) {
        let data = body.get_mut("data").map(Value::take).unwrap_or(Value::Null);
        return serde_json::from_value(data).context("Failed to decode response data");
    }

    let message = match body.get("error") {
        Some(Value::String(s)) => s.clone(),
        Some(obj @ Value::Object(_)) => obj
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Unknown error")
            .to_string(),
        _ => "Unknown error".to_string(),
    };
    match body.pointer("/data/execution_id").filter(|v| !v.is_null()) {
        Some(id) => anyhow::bail!("{} (execution {})", message, id),
        None => anyhow::bail!("{}", message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_envelope() {
        let n: u32 = unwrap_data(json!({"success": true, "data": 5})).unwrap();
        assert_eq!(n, 5);
    }

    #[test]
    fn test_error_shapes() {
        let err = unwrap_data::<Value>(json!({"success": false, "error": {"code": "JOB_NOT_FOUND", "message": "Job 9 not found"}}))
            .unwrap_err();
        assert_eq!(err.to_string(), "Job 9 not found");

        let err = unwrap_data::<Value>(json!({
            "success": false,
            "error": "Job is already running",
            "data": {"execution_id": 12}
        }))
        .unwrap_err();
        assert_eq!(err.to_string(), "Job is already running (execution 12)");
    }
}
