//! Captcha provider integrations.
//!
//! A unified interface over third-party solving services. The browser search
//! flow only sees [`CaptchaProvider`]; vendor request formats stay in the
//! adapters.

mod capsolver;
mod twocaptcha;

pub use capsolver::CapSolverProvider;
pub use twocaptcha::TwoCaptchaProvider;

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

/// Solving deadline and poll cadence.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptchaConfig {
    pub timeout_secs: u64,
    pub poll_interval_secs: u64,
}

impl CaptchaConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            poll_interval_secs: 3,
        }
    }
}

/// Challenge widget family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptchaKind {
    ReCaptchaV2,
    HCaptcha,
    Turnstile,
}

impl CaptchaKind {
    /// Hidden form field the page reads the token from.
    pub fn response_field(&self) -> &'static str {
        match self {
            CaptchaKind::ReCaptchaV2 => "g-recaptcha-response",
            CaptchaKind::HCaptcha => "h-captcha-response",
            CaptchaKind::Turnstile => "cf-turnstile-response",
        }
    }
}

/// Details describing the captcha the page issued.
#[derive(Debug, Clone)]
pub struct CaptchaTask {
    pub kind: CaptchaKind,
    pub site_key: String,
    pub page_url: Url,
    pub data: HashMap<String, String>,
}

impl CaptchaTask {
    pub fn new(kind: CaptchaKind, site_key: impl Into<String>, page_url: Url) -> Self {
        Self {
            kind,
            site_key: site_key.into(),
            page_url,
            data: HashMap::new(),
        }
    }

    pub fn insert_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// Resolved captcha token and optional metadata.
#[derive(Debug, Clone)]
pub struct CaptchaSolution {
    pub token: String,
    pub metadata: HashMap<String, String>,
}

impl CaptchaSolution {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn insert_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Common result type returned by captcha providers.
pub type CaptchaResult = Result<CaptchaSolution, CaptchaError>;

/// Shared interface implemented by captcha vendors.
#[async_trait]
pub trait CaptchaProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn solve(&self, task: &CaptchaTask) -> CaptchaResult;
}

/// Errors surfaced by captcha providers.
#[derive(Debug, Error)]
pub enum CaptchaError {
    #[error("captcha provider misconfigured: {0}")]
    Configuration(String),
    #[error("captcha provider request failed: {0}")]
    Provider(String),
    #[error("captcha solving timed out after {0:?}")]
    Timeout(Duration),
    #[error("captcha provider does not support {0:?}")]
    Unsupported(CaptchaKind),
}

impl From<reqwest::Error> for CaptchaError {
    fn from(err: reqwest::Error) -> Self {
        CaptchaError::Provider(err.to_string())
    }
}

/// Poll `check` every `interval` until it yields a token or `timeout` passes.
/// `check` returns `Ok(None)` while the task is still processing.
pub(crate) async fn poll_until<F, Fut>(
    timeout: Duration,
    interval: Duration,
    mut check: F,
) -> CaptchaResult
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<CaptchaSolution>, CaptchaError>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        tokio::time::sleep(interval).await;
        if let Some(solution) = check().await? {
            return Ok(solution);
        }
        if tokio::time::Instant::now() + interval > deadline {
            return Err(CaptchaError::Timeout(timeout));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn polling_returns_first_ready_token() {
        let calls = AtomicUsize::new(0);
        let solution = poll_until(Duration::from_secs(30), Duration::from_secs(3), || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Ok((n >= 2).then(|| CaptchaSolution::new("token")))
        })
        .await
        .unwrap();
        assert_eq!(solution.token, "token");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_gives_up_at_the_deadline() {
        let result = poll_until(Duration::from_secs(10), Duration::from_secs(3), || async {
            Ok(None)
        })
        .await;
        assert!(matches!(result, Err(CaptchaError::Timeout(_))));
    }
}
