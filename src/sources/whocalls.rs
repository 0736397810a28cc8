//! Caller-id lookup against the public Who Calls search page.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use scraper::{Html, Selector};
use url::Url;

use super::core::{
    CallerIdPayload, FetchContext, FetchResult, LookupSource, ProviderId, Query, RawPayload,
    SourceError, rotating_user_agent,
};

const SEARCH_URL: &str = "https://whocalls.kaspersky.ru/search";

static NAME: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"[class*="phone-name"]"#).expect("invalid name selector"));
static CATEGORY: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"[class*="category"]"#).expect("invalid category selector"));
static COMPLAINTS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d+)\s*(?:жалоб|отзыв)").expect("invalid complaints regex"));
static REGION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""region"\s*:\s*"([^"]+)""#).expect("invalid region regex"));
static OPERATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""operator"\s*:\s*"([^"]+)""#).expect("invalid operator regex"));

#[derive(Debug, Clone)]
pub struct WhoCallsSource {
    search_url: String,
}

impl WhoCallsSource {
    pub fn new() -> Self {
        Self {
            search_url: SEARCH_URL.to_string(),
        }
    }

    pub fn with_search_url(mut self, search_url: impl Into<String>) -> Self {
        self.search_url = search_url.into();
        self
    }

    fn page_url(&self, phone: &str) -> FetchResult<Url> {
        Url::parse_with_params(&self.search_url, &[("request", format!("+{phone}"))])
            .map_err(|err| SourceError::Unexpected(format!("bad search url: {err}")))
    }
}

impl Default for WhoCallsSource {
    fn default() -> Self {
        Self::new()
    }
}

fn first_text(document: &Html, selector: &Selector) -> Option<String> {
    document
        .select(selector)
        .map(|el| el.text().collect::<String>().trim().to_string())
        .find(|text| !text.is_empty())
}

fn capture(regex: &Regex, html: &str) -> Option<String> {
    regex
        .captures(html)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Fields of a rendered search page.
fn parse_page(html: &str) -> CallerIdPayload {
    let document = Html::parse_document(html);
    CallerIdPayload {
        name: first_text(&document, &NAME),
        category: first_text(&document, &CATEGORY),
        complaints: capture(&COMPLAINTS, html).and_then(|count| count.parse().ok()),
        region: capture(&REGION, html),
        operator: capture(&OPERATOR, html),
    }
}

#[async_trait]
impl LookupSource for WhoCallsSource {
    fn provider(&self) -> ProviderId {
        ProviderId::WhoCalls
    }

    async fn fetch(&self, query: &Query, ctx: &FetchContext) -> FetchResult<RawPayload> {
        let url = self.page_url(query.normalized_id())?;
        let request = ctx
            .http
            .get(url.as_str())
            .header(USER_AGENT, rotating_user_agent())
            .header(ACCEPT, "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8")
            .header(ACCEPT_LANGUAGE, "ru-RU,ru;q=0.9,en;q=0.8");
        let response = ctx.http.send(request).await?;

        let status = response.status();
        match status.as_u16() {
            200 => {}
            404 => return Ok(RawPayload::CallerId(CallerIdPayload::default())),
            429 => return Err(SourceError::RateLimited),
            403 | 500..=599 => return Err(SourceError::Transient(format!("search page: {status}"))),
            _ => return Err(SourceError::Unexpected(format!("search page: {status}"))),
        }

        let html = response.text().await?;
        Ok(RawPayload::CallerId(parse_page(&html)))
    }
}
