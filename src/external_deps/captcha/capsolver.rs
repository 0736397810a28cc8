use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};

use async_trait::async_trait;

use super::{
    CaptchaConfig, CaptchaError, CaptchaKind, CaptchaProvider, CaptchaResult, CaptchaSolution,
    CaptchaTask, poll_until,
};

const API_BASE: &str = "https://api.capsolver.com";

/// Adapter for the CapSolver task API.
#[derive(Debug, Clone)]
pub struct CapSolverProvider {
    api_key: String,
    config: CaptchaConfig,
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiResponse {
    #[serde(default)]
    error_id: i64,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    solution: Option<Value>,
}

impl ApiResponse {
    fn into_result(self) -> Result<Self, CaptchaError> {
        if self.error_id != 0 {
            return Err(CaptchaError::Provider(
                self.error_description
                    .unwrap_or_else(|| format!("error id {}", self.error_id)),
            ));
        }
        Ok(self)
    }
}

impl CapSolverProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_config(api_key, CaptchaConfig::default())
    }

    pub fn with_config(api_key: impl Into<String>, config: CaptchaConfig) -> Self {
        Self {
            api_key: api_key.into(),
            config,
            client: Client::new(),
            base_url: API_BASE.to_string(),
        }
    }

    /// Point the adapter at another API host.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn task_type(kind: CaptchaKind) -> &'static str {
        match kind {
            CaptchaKind::ReCaptchaV2 => "ReCaptchaV2TaskProxyLess",
            CaptchaKind::HCaptcha => "HCaptchaTaskProxyLess",
            CaptchaKind::Turnstile => "AntiTurnstileTaskProxyLess",
        }
    }

    async fn call(&self, method: &str, body: Value) -> Result<ApiResponse, CaptchaError> {
        let response: ApiResponse = self
            .client
            .post(format!("{}/{}", self.base_url, method))
            .json(&body)
            .send()
            .await?
            .json()
            .await?;
        response.into_result()
    }

    async fn create_task(&self, task: &CaptchaTask) -> Result<String, CaptchaError> {
        let body = json!({
            "clientKey": self.api_key,
            "task": {
                "type": Self::task_type(task.kind),
                "websiteURL": task.page_url.as_str(),
                "websiteKey": task.site_key,
            }
        });
        self.call("createTask", body)
            .await?
            .task_id
            .ok_or_else(|| CaptchaError::Provider("createTask returned no taskId".into()))
    }

    async fn task_result(&self, task_id: &str) -> Result<Option<CaptchaSolution>, CaptchaError> {
        let body = json!({ "clientKey": self.api_key, "taskId": task_id });
        let response = self.call("getTaskResult", body).await?;
        if response.status.as_deref() != Some("ready") {
            return Ok(None);
        }
        let token = response.solution.as_ref().and_then(|solution| {
            ["gRecaptchaResponse", "token"]
                .iter()
                .find_map(|key| solution.get(*key).and_then(Value::as_str))
        });
        match token {
            Some(token) => Ok(Some(
                CaptchaSolution::new(token).insert_metadata("task_id", task_id),
            )),
            None => Err(CaptchaError::Provider("ready task without a token".into())),
        }
    }
}

#[async_trait]
impl CaptchaProvider for CapSolverProvider {
    fn name(&self) -> &'static str {
        "capsolver"
    }

    async fn solve(&self, task: &CaptchaTask) -> CaptchaResult {
        if self.api_key.trim().is_empty() {
            return Err(CaptchaError::Configuration("missing CapSolver api key".into()));
        }
        let task_id = self.create_task(task).await?;
        log::info!("capsolver task {} created for {:?}", task_id, task.kind);
        poll_until(self.config.timeout(), self.config.poll_interval(), || {
            self.task_result(&task_id)
        })
        .await
    }
}
