//! Chromium driver over the DevTools protocol.

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as CdpConfig};
use chromiumoxide::cdp::browser_protocol::network::{CookieParam, SetUserAgentOverrideParams};
use chromiumoxide::element::Element;
use chromiumoxide::page::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;

use super::{BrowserConfig, BrowserCookie, BrowserDriver, DriverError, DriverLauncher, PageSnapshot};
use crate::external_deps::captcha::CaptchaKind;

const BODY_TEXT_JS: &str = "document.body ? document.body.innerText : ''";

/// Launches a local Chromium per session.
#[derive(Debug, Default, Clone)]
pub struct ChromiumLauncher;

#[async_trait]
impl DriverLauncher for ChromiumLauncher {
    async fn launch(&self, config: &BrowserConfig) -> Result<Box<dyn BrowserDriver>, DriverError> {
        let mut builder = CdpConfig::builder()
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--window-size=1920,1080");
        if !config.headless {
            builder = builder.with_head();
        }
        for arg in &config.chrome_args {
            builder = builder.arg(arg);
        }
        let cdp_config = builder.build().map_err(DriverError::Launch)?;

        let (browser, mut handler) = Browser::launch(cdp_config)
            .await
            .map_err(|err| DriverError::Launch(err.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|err| DriverError::Launch(err.to_string()))?;

        if let Some(user_agent) = &config.user_agent {
            page.set_user_agent(SetUserAgentOverrideParams::new(user_agent.clone()))
                .await
                .map_err(protocol)?;
        }

        Ok(Box::new(ChromiumDriver {
            browser,
            page,
            input: None,
            handler_task,
        }))
    }
}

fn protocol(err: impl std::fmt::Display) -> DriverError {
    DriverError::Protocol(err.to_string())
}

/// One Chromium tab.
pub struct ChromiumDriver {
    browser: Browser,
    page: Page,
    input: Option<Element>,
    handler_task: JoinHandle<()>,
}

impl ChromiumDriver {
    async fn eval<T: serde::de::DeserializeOwned>(&self, script: String) -> Result<T, DriverError> {
        self.page
            .evaluate(script)
            .await
            .map_err(protocol)?
            .into_value::<T>()
            .map_err(protocol)
    }

    fn focused(&mut self) -> Result<&Element, DriverError> {
        self.input
            .as_ref()
            .ok_or_else(|| DriverError::ElementMissing("no input focused".into()))
    }
}

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    async fn navigate(&mut self, url: &str) -> Result<(), DriverError> {
        self.input = None;
        self.page
            .goto(url)
            .await
            .map_err(|err| DriverError::Navigation(err.to_string()))?;
        self.page
            .wait_for_navigation()
            .await
            .map_err(|err| DriverError::Navigation(err.to_string()))?;
        Ok(())
    }

    async fn dismiss_overlays(&mut self, selectors: &[String]) -> Result<bool, DriverError> {
        for selector in selectors {
            if let Ok(button) = self.page.find_element(selector.as_str()).await {
                if button.click().await.is_ok() {
                    log::debug!("dismissed overlay via {selector}");
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    async fn focus_input(&mut self, selectors: &[String]) -> Result<(), DriverError> {
        for selector in selectors {
            if let Ok(input) = self.page.find_element(selector.as_str()).await {
                input.click().await.map_err(protocol)?;
                input
                    .call_js_fn("function() { this.value = ''; }", false)
                    .await
                    .map_err(protocol)?;
                self.input = Some(input);
                return Ok(());
            }
        }
        Err(DriverError::ElementMissing(selectors.join(", ")))
    }

    async fn type_char(&mut self, c: char) -> Result<(), DriverError> {
        let mut buf = [0u8; 4];
        let text: &str = c.encode_utf8(&mut buf);
        self.focused()?.type_str(text).await.map_err(protocol)?;
        Ok(())
    }

    async fn submit(&mut self) -> Result<(), DriverError> {
        match &self.input {
            Some(input) => {
                input.press_key("Enter").await.map_err(protocol)?;
            }
            None => {
                self.eval::<bool>("(() => { const f = document.querySelector('form'); if (f) { f.requestSubmit ? f.requestSubmit() : f.submit(); return true; } return false; })()".into())
                    .await?;
            }
        }
        Ok(())
    }

    async fn snapshot(&mut self) -> Result<PageSnapshot, DriverError> {
        let html = self.page.content().await.map_err(protocol)?;
        let url = self.page.url().await.map_err(protocol)?.unwrap_or_default();
        let body_text = self.eval::<String>(BODY_TEXT_JS.into()).await.unwrap_or_default();
        Ok(PageSnapshot { url, html, body_text })
    }

    async fn inject_captcha_solution(&mut self, kind: CaptchaKind, token: &str) -> Result<(), DriverError> {
        let token = serde_json::to_string(token).map_err(protocol)?;
        let field = kind.response_field();
        let script = format!(
            r#"(() => {{
                const token = {token};
                document.querySelectorAll('[name="{field}"], #{field}').forEach(el => {{
                    el.value = token;
                    el.innerHTML = token;
                }});
                const widget = document.querySelector('[data-callback]');
                const callback = widget && window[widget.getAttribute('data-callback')];
                if (typeof callback === 'function') {{ callback(token); return true; }}
                return false;
            }})()"#
        );
        let called = self.eval::<bool>(script).await?;
        log::debug!("injected {kind:?} token (callback invoked: {called})");
        Ok(())
    }

    async fn set_cookies(&mut self, cookies: &[BrowserCookie]) -> Result<(), DriverError> {
        for cookie in cookies {
            let param = CookieParam::builder()
                .name(cookie.name.clone())
                .value(cookie.value.clone())
                .domain(cookie.domain.clone())
                .path(cookie.path.clone())
                .build()
                .map_err(DriverError::Protocol)?;
            if let Err(err) = self.page.set_cookie(param).await {
                log::warn!("failed to set cookie {}: {}", cookie.name, err);
            }
        }
        Ok(())
    }

    async fn scroll(&mut self, times: u32) -> Result<(), DriverError> {
        for _ in 0..times {
            self.eval::<serde_json::Value>("window.scrollBy(0, window.innerHeight); true".into())
                .await?;
            tokio::time::sleep(std::time::Duration::from_millis(800)).await;
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), DriverError> {
        self.input = None;
        let closed = self.browser.close().await.map_err(protocol);
        self.handler_task.abort();
        closed.map(|_| ())
    }
}
