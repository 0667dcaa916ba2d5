use anyhow::{Context, Result};
use serde_json::Value;

/// Thin Bearer-auth adapter for the compute control plane. On platforms
/// without privileged local shutdown, `terminate` is the only way the
/// instance can end itself, so it must work without OS privilege.
#[derive(Clone)]
pub struct ControlPlaneClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl std::fmt::Debug for ControlPlaneClient {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ControlPlaneClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ControlPlaneClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Launches instances; the payload is platform-shaped and passed through.
    pub async fn launch(&self, payload: &Value) -> Result<Value> {
        self.post("/instance-operations/launch", payload).await
    }

    /// Fetches metadata for one instance.
    pub async fn describe(&self, instance_id: &str) -> Result<Value> {
        let url = format!("{}/instances/{instance_id}", self.base_url);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .with_context(|| format!("describe request failed: {url}"))?;
        let response = response
            .error_for_status()
            .with_context(|| format!("describe returned error status: {url}"))?;
        response
            .json::<Value>()
            .await
            .with_context(|| format!("describe response was not JSON: {url}"))
    }

    /// Terminates the given instance through the control plane.
    pub async fn terminate(&self, instance_id: &str) -> Result<Value> {
        self.post(
            "/instance-operations/terminate",
            &serde_json::json!({ "instance_ids": [instance_id] }),
        )
        .await
    }

    async fn post(&self, endpoint: &str, payload: &Value) -> Result<Value> {
        let url = format!("{}{endpoint}", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(payload)
            .send()
            .await
            .with_context(|| format!("request failed: {url}"))?;
        let response = response
            .error_for_status()
            .with_context(|| format!("request returned error status: {url}"))?;
        response
            .json::<Value>()
            .await
            .with_context(|| format!("response was not JSON: {url}"))
    }
}
