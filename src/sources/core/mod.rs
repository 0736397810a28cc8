//! Core utilities shared by the source adapters.

pub mod timing;
pub mod types;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use rand::thread_rng;
use reqwest::header::{HeaderMap, HeaderValue, REFERER, USER_AGENT};
use url::Url;

use crate::modules::accounts::{Account, AccountPool};
use crate::modules::cache::ResultCache;
use crate::modules::events::EventDispatcher;
use crate::modules::pool::{DEFAULT_USER_AGENT, HttpSession};

pub use timing::{AttemptFeedback, Pacing};
pub use types::{
    CallerIdPayload, FetchResult, NotFoundKind, ProfilePayload, ProviderId, Query, QueryError,
    QueryKind, RawPayload, SourceError,
};

/// Everything an adapter call may use besides its own state.
#[derive(Debug, Clone)]
pub struct FetchContext {
    pub http: HttpSession,
    /// Account chosen by the orchestrator for this attempt.
    pub account: Option<Account>,
    /// Memo for provider sub-calls (presence checks, contact info).
    pub calls: Arc<ResultCache<serde_json::Value>>,
    pub events: Arc<EventDispatcher>,
    rejection: Arc<Mutex<Option<String>>>,
}

impl FetchContext {
    pub fn new(
        http: HttpSession,
        account: Option<Account>,
        calls: Arc<ResultCache<serde_json::Value>>,
        events: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            http,
            account,
            calls,
            events,
            rejection: Arc::new(Mutex::new(None)),
        }
    }

    /// Record that the provider refused `account` even though the fetch
    /// went on to succeed another way. The orchestrator cools it down
    /// instead of counting a success.
    pub fn reject_account(&self, reason: impl Into<String>) {
        if let Ok(mut slot) = self.rejection.lock() {
            *slot = Some(reason.into());
        }
    }

    pub fn take_rejection(&self) -> Option<String> {
        self.rejection.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Run a JSON sub-call through the memo, caching successes for `ttl`.
    pub async fn memo<F, Fut>(
        &self,
        namespace: &str,
        args: &[&str],
        ttl: Duration,
        call: F,
    ) -> FetchResult<serde_json::Value>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = FetchResult<serde_json::Value>>,
    {
        let key = ResultCache::<serde_json::Value>::key(namespace, args);
        self.calls.try_cached(key, ttl, call).await
    }
}

/// Provider adapter.
///
/// `fetch` performs the provider calls for one normalized query and reports
/// failures through [`SourceError`]; retry and rotation decisions are made by
/// the orchestrator.
#[async_trait]
pub trait LookupSource: Send + Sync {
    fn provider(&self) -> ProviderId;

    fn normalize(&self, raw: &str) -> Result<Query, QueryError> {
        match self.provider().query_kind() {
            QueryKind::Phone => Query::phone(raw),
            QueryKind::Handle => Query::handle(raw),
        }
    }

    async fn fetch(&self, query: &Query, ctx: &FetchContext) -> FetchResult<RawPayload>;

    /// Rotating credentials, if the provider needs any.
    fn accounts(&self) -> Option<&AccountPool> {
        None
    }

    /// Override of the engine-wide transient retry count.
    fn transient_retries(&self) -> Option<u32> {
        None
    }

    /// Whether a photo URL belongs to this provider's CDN.
    fn owns_url(&self, _url: &Url) -> bool {
        false
    }

    /// Headers for downloading one of this provider's photos.
    fn photo_headers(&self, _url: &Url, account: Option<&Account>) -> HeaderMap {
        default_photo_headers(account, None)
    }

    /// Bodies at or below this size are treated as failed downloads.
    fn min_photo_bytes(&self) -> usize {
        0
    }

    /// Release provider resources.
    async fn shutdown(&self) {}
}

static DESKTOP_AGENTS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    ]
});

/// Whether `url` is served from one of `domains` or a subdomain of one.
pub fn host_in(url: &Url, domains: &[&str]) -> bool {
    url.host_str().is_some_and(|host| {
        domains.iter().any(|domain| {
            host == *domain
                || host
                    .strip_suffix(domain)
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    })
}

/// Random desktop user agent.
pub fn rotating_user_agent() -> &'static str {
    DESKTOP_AGENTS
        .choose(&mut thread_rng())
        .copied()
        .unwrap_or(DEFAULT_USER_AGENT)
}

/// User agent of the account, else the pool default; optional referer.
pub fn default_photo_headers(account: Option<&Account>, referer: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let agent = account
        .and_then(|account| account.user_agent.as_deref())
        .unwrap_or(DEFAULT_USER_AGENT);
    if let Ok(value) = HeaderValue::from_str(agent) {
        headers.insert(USER_AGENT, value);
    }
    if let Some(referer) = referer.and_then(|r| HeaderValue::from_str(r).ok()) {
        headers.insert(REFERER, referer);
    }
    headers
}

/// JSON body of a response, mapping decode failures to `Unexpected`.
pub(crate) async fn json_body(response: reqwest::Response) -> FetchResult<serde_json::Value> {
    let text = response.text().await?;
    serde_json::from_str(&text)
        .map_err(|err| SourceError::Unexpected(format!("invalid json from provider: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotating_agents_come_from_the_list() {
        for _ in 0..20 {
            assert!(DESKTOP_AGENTS.contains(&rotating_user_agent()));
        }
    }

    #[test]
    fn host_match_requires_a_label_boundary() {
        let url = |raw: &str| Url::parse(raw).unwrap();
        let domains = ["vk.com", "userapi.com"];
        assert!(host_in(&url("https://vk.com/a.jpg"), &domains));
        assert!(host_in(&url("https://sun9-1.userapi.com/a.jpg"), &domains));
        assert!(!host_in(&url("https://evilvk.com/a.jpg"), &domains));
        assert!(!host_in(&url("https://vk.com.example.org/a.jpg"), &domains));
    }

    #[test]
    fn photo_headers_prefer_the_account_agent() {
        let mut account = Account::token("token-abcdefgh-1234");
        account.user_agent = Some("Custom/1.0".into());
        let headers = default_photo_headers(Some(&account), Some("https://vk.com/"));
        assert_eq!(headers.get(USER_AGENT).unwrap(), "Custom/1.0");
        assert_eq!(headers.get(REFERER).unwrap(), "https://vk.com/");

        let headers = default_photo_headers(None, None);
        assert_eq!(headers.get(USER_AGENT).unwrap(), DEFAULT_USER_AGENT);
        assert!(headers.get(REFERER).is_none());
    }
}
