//! Browser automation for providers that only answer to a live page.
//!
//! The engine talks to the browser through the [`BrowserDriver`] trait. A
//! single [`BrowserSession`] owns the one driver instance of the process and
//! serializes every user of it. The search protocol itself lives in
//! [`machine`].

pub mod detect;
pub mod machine;
pub mod session;

#[cfg(feature = "chromium")]
pub mod chromium;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::external_deps::captcha::CaptchaKind;

pub use detect::{DetectedCaptcha, detect_captcha};
pub use machine::{SearchMachine, SearchPhase, SearchReport};
pub use session::{BrowserLease, BrowserSession, SessionState};

#[cfg(feature = "chromium")]
pub use chromium::{ChromiumDriver, ChromiumLauncher};

/// Rendered page as seen by the driver.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageSnapshot {
    pub url: String,
    pub html: String,
    /// Visible text; may be empty when the driver cannot compute it.
    pub body_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
}

impl BrowserCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
            path: "/".into(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DriverError {
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("element not found: {0}")]
    ElementMissing(String),
    #[error("browser call '{0}' timed out")]
    Timeout(&'static str),
    #[error("browser unavailable: {0}")]
    Unavailable(String),
    #[error("browser protocol error: {0}")]
    Protocol(String),
}

/// One browser tab under remote control.
#[async_trait]
pub trait BrowserDriver: Send {
    async fn navigate(&mut self, url: &str) -> Result<(), DriverError>;

    /// Click the first matching overlay button (cookie banners). Returns
    /// whether anything was dismissed.
    async fn dismiss_overlays(&mut self, selectors: &[String]) -> Result<bool, DriverError>;

    /// Focus and clear the first matching input.
    async fn focus_input(&mut self, selectors: &[String]) -> Result<(), DriverError>;

    async fn type_char(&mut self, c: char) -> Result<(), DriverError>;

    /// Submit the focused input (Enter).
    async fn submit(&mut self) -> Result<(), DriverError>;

    async fn snapshot(&mut self) -> Result<PageSnapshot, DriverError>;

    async fn inject_captcha_solution(
        &mut self,
        kind: CaptchaKind,
        token: &str,
    ) -> Result<(), DriverError>;

    async fn set_cookies(&mut self, cookies: &[BrowserCookie]) -> Result<(), DriverError>;

    async fn scroll(&mut self, times: u32) -> Result<(), DriverError>;

    async fn shutdown(&mut self) -> Result<(), DriverError>;
}

/// Starts drivers for the session.
#[async_trait]
pub trait DriverLauncher: Send + Sync {
    async fn launch(&self, config: &BrowserConfig) -> Result<Box<dyn BrowserDriver>, DriverError>;
}

/// Browser and search-page settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub home_url: String,
    pub input_selectors: Vec<String>,
    pub overlay_selectors: Vec<String>,
    pub max_retries: u32,
    pub keystroke_delay_ms: u64,
    /// Pause after submitting or scrolling before the page is read.
    pub settle_delay_ms: u64,
    pub attempt_delay_ms: u64,
    pub idle_timeout_secs: u64,
    pub call_timeout_secs: u64,
    pub headless: bool,
    pub user_agent: Option<String>,
    pub chrome_args: Vec<String>,
}

impl BrowserConfig {
    pub fn keystroke_delay(&self) -> Duration {
        Duration::from_millis(self.keystroke_delay_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn attempt_delay(&self) -> Duration {
        Duration::from_millis(self.attempt_delay_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs.max(1))
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            home_url: "https://web.getcontact.com/".into(),
            input_selectors: vec![
                "input[type=\"tel\"]".into(),
                "input[name*=\"phone\"]".into(),
                "input[type=\"search\"]".into(),
                "input[type=\"text\"]".into(),
            ],
            overlay_selectors: vec![
                "#onetrust-accept-btn-handler".into(),
                "button[id*=\"accept\"]".into(),
                "[class*=\"cookie\"] button".into(),
            ],
            max_retries: 3,
            keystroke_delay_ms: 50,
            settle_delay_ms: 3000,
            attempt_delay_ms: 2000,
            idle_timeout_secs: 300,
            call_timeout_secs: 30,
            headless: true,
            user_agent: None,
            chrome_args: Vec::new(),
        }
    }
}

/// Bound a driver call.
pub(crate) async fn timed<T, F>(limit: Duration, label: &'static str, call: F) -> Result<T, DriverError>
where
    F: Future<Output = Result<T, DriverError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| DriverError::Timeout(label))?
}
