use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

use converge::{Application, ApplicationSpec, PolicyOverride, SyncOperation, SyncRequestOutcome};

use crate::api::{
    ApiResponse, DeregisterResponse, Health, RegisterRequest, WebhookRequest, WebhookResponse,
};

/// Client for the control API served by `converge serve`.
pub struct ConvergeClient {
    http: reqwest::Client,
    base_url: String,
}

impl ConvergeClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let resp = request
            .header("Accept", "application/json")
            .send()
            .await
            .context("Failed to connect to server")?;
        handle_response(resp).await
    }

    async fn send_json<B: Serialize, T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &B,
    ) -> Result<T> {
        self.send(self.http.request(method, self.url(path)).json(body))
            .await
    }

    pub async fn health(&self) -> Result<Health> {
        self.send(self.http.get(self.url("healthz"))).await
    }

    pub async fn list(&self) -> Result<Vec<Application>> {
        self.send(self.http.get(self.url("api/applications"))).await
    }

    pub async fn get(&self, name: &str) -> Result<Application> {
        self.send(self.http.get(self.url(&format!("api/applications/{name}"))))
            .await
    }

    pub async fn register(&self, name: &str, spec: ApplicationSpec) -> Result<Application> {
        let body = RegisterRequest {
            name: name.to_string(),
            spec,
        };
        self.send_json(reqwest::Method::POST, "api/applications", &body)
            .await
    }

    pub async fn deregister(&self, name: &str, prune: bool) -> Result<DeregisterResponse> {
        let request = self
            .http
            .delete(self.url(&format!("api/applications/{name}")))
            .query(&[("prune", prune)]);
        self.send(request).await
    }

    pub async fn sync(&self, name: &str) -> Result<SyncRequestOutcome> {
        self.send(
            self.http
                .post(self.url(&format!("api/applications/{name}/sync"))),
        )
        .await
    }

    pub async fn set_policy(&self, name: &str, policy: &PolicyOverride) -> Result<Application> {
        self.send_json(
            reqwest::Method::PUT,
            &format!("api/applications/{name}/policy"),
            policy,
        )
        .await
    }

    pub async fn history(&self, name: &str, limit: usize) -> Result<Vec<SyncOperation>> {
        let request = self
            .http
            .get(self.url(&format!("api/applications/{name}/history")))
            .query(&[("limit", limit)]);
        self.send(request).await
    }

    pub async fn webhook(&self, repo_url: &str, reference: &str) -> Result<WebhookResponse> {
        let body = WebhookRequest {
            repo_url: repo_url.to_string(),
            reference: reference.to_string(),
        };
        self.send_json(reqwest::Method::POST, "api/webhook", &body)
            .await
    }
}

async fn handle_response<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();

    let envelope: ApiResponse<T> = match serde_json::from_str(&body) {
        Ok(envelope) => envelope,
        Err(_) if !status.is_success() => anyhow::bail!("HTTP {status}: {body}"),
        Err(e) => return Err(e).context("Failed to parse response JSON"),
    };

    if !envelope.success || !status.is_success() {
        let message = envelope.error.unwrap_or_else(|| "unknown error".to_string());
        anyhow::bail!("HTTP {status}: {message}");
    }
    envelope
        .data
        .context("Server returned an empty response")
}
