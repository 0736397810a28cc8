use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{
    CaptchaConfig, CaptchaError, CaptchaKind, CaptchaProvider, CaptchaResult, CaptchaSolution,
    CaptchaTask, poll_until,
};

const API_BASE: &str = "https://2captcha.com";

/// Adapter for the 2Captcha `in.php`/`res.php` API.
#[derive(Debug, Clone)]
pub struct TwoCaptchaProvider {
    api_key: String,
    config: CaptchaConfig,
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: i64,
    request: String,
}

impl TwoCaptchaProvider {
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

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn method(kind: CaptchaKind) -> &'static str {
        match kind {
            CaptchaKind::ReCaptchaV2 => "userrecaptcha",
            CaptchaKind::HCaptcha => "hcaptcha",
            CaptchaKind::Turnstile => "turnstile",
        }
    }

    async fn submit(&self, task: &CaptchaTask) -> Result<String, CaptchaError> {
        let key_field = match task.kind {
            CaptchaKind::ReCaptchaV2 => "googlekey",
            CaptchaKind::HCaptcha | CaptchaKind::Turnstile => "sitekey",
        };
        let response: ApiResponse = self
            .client
            .post(format!("{}/in.php", self.base_url))
            .form(&[
                ("key", self.api_key.as_str()),
                ("method", Self::method(task.kind)),
                (key_field, task.site_key.as_str()),
                ("pageurl", task.page_url.as_str()),
                ("json", "1"),
            ])
            .send()
            .await?
            .json()
            .await?;
        if response.status != 1 {
            return Err(CaptchaError::Provider(response.request));
        }
        Ok(response.request)
    }

    async fn fetch(&self, id: &str) -> Result<Option<CaptchaSolution>, CaptchaError> {
        let response: ApiResponse = self
            .client
            .get(format!("{}/res.php", self.base_url))
            .query(&[
                ("key", self.api_key.as_str()),
                ("action", "get"),
                ("id", id),
                ("json", "1"),
            ])
            .send()
            .await?
            .json()
            .await?;
        interpret(response, id)
    }
}

fn interpret(response: ApiResponse, id: &str) -> Result<Option<CaptchaSolution>, CaptchaError> {
    match (response.status, response.request.as_str()) {
        (1, token) => Ok(Some(CaptchaSolution::new(token).insert_metadata("captcha_id", id))),
        (_, "CAPCHA_NOT_READY") => Ok(None),
        (_, other) => Err(CaptchaError::Provider(other.to_string())),
    }
}

#[async_trait]
impl CaptchaProvider for TwoCaptchaProvider {
    fn name(&self) -> &'static str {
        "2captcha"
    }

    async fn solve(&self, task: &CaptchaTask) -> CaptchaResult {
        if self.api_key.trim().is_empty() {
            return Err(CaptchaError::Configuration("missing 2Captcha api key".into()));
        }
        let id = self.submit(task).await?;
        log::info!("2captcha request {} submitted for {:?}", id, task.kind);
        poll_until(self.config.timeout(), self.config.poll_interval(), || {
            self.fetch(&id)
        })
        .await
    }
}
