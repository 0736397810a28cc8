//! Instagram profiles: JSON endpoint first, page HTML second, browser last.
//!
//! The web profile endpoint answers most lookups without a browser. When it
//! yields no user object the profile page is fetched and scraped. A public
//! profile that still shows no photos is opened in the shared browser
//! session, which renders the post grid.

pub mod html;

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, COOKIE, HeaderMap, HeaderValue, ORIGIN, REFERER, USER_AGENT};
use serde_json::Value;
use url::Url;

use super::core::{
    FetchContext, FetchResult, LookupSource, NotFoundKind, ProfilePayload, ProviderId, Query,
    RawPayload, SourceError, default_photo_headers, host_in, json_body, rotating_user_agent,
};
use crate::browser::{BrowserCookie, BrowserSession, DriverError, PageSnapshot, timed};
use crate::fanout::PhotoGroup;
use crate::modules::accounts::{Account, AccountParseError, AccountPool, DEFAULT_ERROR_COOLDOWN};
use crate::normalizer::ProfileDetails;
use crate::normalizer::extract::unescape_url;

use html::{MAX_PHOTOS, is_login_page, parse_profile_page};

const WEB_BASE: &str = "https://www.instagram.com";
const APP_ID: &str = "936619743392459";
const ASBD_ID: &str = "129477";
const SESSION_COOKIES: [&str; 6] = ["sessionid", "ds_user_id", "ig_did", "mid", "csrftoken", "rur"];
const COOKIE_DOMAIN: &str = ".instagram.com";

/// Profile fields as scraped, before they become a payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileData {
    pub username: String,
    pub full_name: Option<String>,
    pub biography: Option<String>,
    pub followers: Option<u64>,
    pub following: Option<u64>,
    pub posts: Option<u64>,
    pub is_private: bool,
    pub is_verified: bool,
    pub avatar: Option<String>,
    pub photos: Vec<String>,
}

impl ProfileData {
    /// Fill gaps in `self` from a second scrape of the same profile.
    fn absorb(&mut self, other: ProfileData) {
        if self.photos.is_empty() {
            self.photos = other.photos;
        }
        self.avatar = self.avatar.take().or(other.avatar);
        self.full_name = self.full_name.take().or(other.full_name);
        self.biography = self.biography.take().or(other.biography);
        self.followers = self.followers.or(other.followers);
        self.following = self.following.or(other.following);
        self.posts = self.posts.or(other.posts);
    }

    pub fn into_payload(self) -> ProfilePayload {
        let mut groups = Vec::with_capacity(2);
        if let Some(avatar) = self.avatar {
            groups.push(PhotoGroup::current("avatar", vec![avatar]));
        }
        let mut photos = self.photos;
        photos.truncate(MAX_PHOTOS);
        groups.push(PhotoGroup::history("posts", photos));

        ProfilePayload {
            display_name: self.full_name,
            details: ProfileDetails {
                username: Some(self.username),
                biography: self.biography,
                followers: self.followers,
                following: self.following,
                posts: self.posts,
                is_private: Some(self.is_private),
                is_verified: Some(self.is_verified),
                ..Default::default()
            },
            photo_groups: groups,
            ..Default::default()
        }
    }
}

/// `data.user` of the web profile endpoint.
fn parse_api_user(body: &Value) -> Option<ProfileData> {
    let user = body.pointer("/data/user").filter(|user| user.is_object())?;
    let text = |key: &str| {
        user.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let count = |path: &str| user.pointer(path).and_then(Value::as_u64);
    let flag = |key: &str| user.get(key).and_then(Value::as_bool).unwrap_or(false);

    let photos = user
        .pointer("/edge_owner_to_timeline_media/edges")
        .and_then(Value::as_array)
        .map(|edges| {
            edges
                .iter()
                .filter_map(|edge| edge.pointer("/node/display_url").and_then(Value::as_str))
                .map(unescape_url)
                .take(MAX_PHOTOS)
                .collect()
        })
        .unwrap_or_default();

    Some(ProfileData {
        username: text("username").unwrap_or_default(),
        full_name: text("full_name"),
        biography: text("biography"),
        followers: count("/edge_followed_by/count"),
        following: count("/edge_follow/count"),
        posts: count("/edge_owner_to_timeline_media/count"),
        is_private: flag("is_private"),
        is_verified: flag("is_verified"),
        avatar: text("profile_pic_url_hd")
            .or_else(|| text("profile_pic_url"))
            .map(|url| unescape_url(&url)),
        photos,
    })
}

fn session_cookie_header(account: &Account) -> Option<String> {
    let pairs: Vec<String> = SESSION_COOKIES
        .iter()
        .filter_map(|name| account.cookie(name).map(|value| format!("{name}={value}")))
        .collect();
    (!pairs.is_empty()).then(|| pairs.join("; "))
}

fn browser_cookies(account: &Account) -> Vec<BrowserCookie> {
    let mut cookies: Vec<BrowserCookie> = account
        .cookies
        .iter()
        .map(|(name, value)| BrowserCookie::new(name, value, COOKIE_DOMAIN))
        .collect();
    cookies.sort_by(|a, b| a.name.cmp(&b.name));
    cookies
}

fn session_cookies(ctx: &FetchContext) -> Vec<BrowserCookie> {
    ctx.account.as_ref().map(browser_cookies).unwrap_or_default()
}

fn driver_error(err: DriverError) -> SourceError {
    SourceError::Transient(err.to_string())
}

/// Open the profile in the browser and scrape the rendered page.
async fn render_profile(
    session: Arc<BrowserSession>,
    profile_url: String,
    username: String,
    cookies: Vec<BrowserCookie>,
) -> FetchResult<ProfileData> {
    let mut lease = session.lease().await.map_err(driver_error)?;
    let limit = lease.call_timeout();
    let settle = session.config().settle_delay();
    let result: Result<Option<PageSnapshot>, DriverError> = async {
        let driver = lease.driver()?;
        if !cookies.is_empty() {
            timed(limit, "set_cookies", driver.set_cookies(&cookies)).await?;
        }
        timed(limit, "navigate", driver.navigate(&profile_url)).await?;
        let page = timed(limit, "snapshot", driver.snapshot()).await?;
        if is_login_page(&page.url) {
            return Ok(None);
        }
        timed(limit, "scroll", driver.scroll(1)).await?;
        tokio::time::sleep(settle).await;
        timed(limit, "snapshot", driver.snapshot()).await.map(Some)
    }
    .await;

    match result {
        Ok(Some(page)) => Ok(parse_profile_page(&page.html, &username)),
        Ok(None) => Err(SourceError::AuthFailure("instagram redirected the browser to login".into())),
        Err(err) => {
            lease.discard().await;
            Err(driver_error(err))
        }
    }
}

#[derive(Debug)]
pub struct InstagramSource {
    accounts: AccountPool,
    browser: Option<Arc<BrowserSession>>,
    web_base: String,
}

impl InstagramSource {
    pub fn new() -> Self {
        Self {
            accounts: AccountPool::new(DEFAULT_ERROR_COOLDOWN),
            browser: None,
            web_base: WEB_BASE.to_string(),
        }
    }

    /// Accounts from `login:password|user-agent|cookies` lines. Blank lines
    /// and `#` comments are skipped.
    pub fn with_account_lines<'a, I>(self, lines: I) -> Result<Self, AccountParseError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for line in lines {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            self.accounts.add(Account::parse(line)?);
        }
        Ok(self)
    }

    pub fn with_account(self, account: Account) -> Self {
        self.accounts.add(account);
        self
    }

    pub fn with_browser(mut self, session: Arc<BrowserSession>) -> Self {
        self.browser = Some(session);
        self
    }

    pub fn with_web_base(mut self, web_base: impl Into<String>) -> Self {
        self.web_base = web_base.into();
        self
    }

    fn base(&self) -> &str {
        self.web_base.trim_end_matches('/')
    }

    fn profile_url(&self, username: &str) -> String {
        format!("{}/{}/", self.base(), username)
    }

    fn api_headers(&self, username: &str, account: Option<&Account>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let agent = account
            .and_then(|account| account.user_agent.clone())
            .unwrap_or_else(|| rotating_user_agent().to_string());
        let pairs = [
            (USER_AGENT, agent),
            (ACCEPT, "*/*".to_string()),
            (ACCEPT_LANGUAGE, "en-US,en;q=0.9".to_string()),
            (REFERER, self.profile_url(username)),
            (ORIGIN, self.base().to_string()),
        ];
        for (name, value) in pairs {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(name, value);
            }
        }
        headers.insert("X-IG-App-ID", HeaderValue::from_static(APP_ID));
        headers.insert("X-ASBD-ID", HeaderValue::from_static(ASBD_ID));
        headers.insert("X-IG-WWW-Claim", HeaderValue::from_static("0"));
        headers.insert("X-Requested-With", HeaderValue::from_static("XMLHttpRequest"));
        if let Some(cookies) = account
            .and_then(session_cookie_header)
            .and_then(|c| HeaderValue::from_str(&c).ok())
        {
            headers.insert(COOKIE, cookies);
        }
        headers
    }

    /// Web profile endpoint. `Ok(None)` means it gave nothing usable and
    /// the page should be tried.
    async fn fetch_api(&self, username: &str, ctx: &FetchContext) -> FetchResult<Option<ProfileData>> {
        let url = Url::parse_with_params(
            &format!("{}/api/v1/users/web_profile_info/", self.base()),
            &[("username", username)],
        )
        .map_err(|err| SourceError::Unexpected(format!("bad profile api url: {err}")))?;
        let request = ctx
            .http
            .get(url.as_str())
            .headers(self.api_headers(username, ctx.account.as_ref()));
        let response = ctx.http.send(request).await?;

        let status = response.status();
        match status.as_u16() {
            200 => Ok(parse_api_user(&json_body(response).await?)),
            401 | 403 => Err(SourceError::AuthFailure(format!("profile api: {status}"))),
            404 => Err(SourceError::NotFound(NotFoundKind::Missing)),
            429 => Err(SourceError::RateLimited),
            _ => {
                log::debug!("instagram profile api for {username} answered {status}");
                Ok(None)
            }
        }
    }

    async fn fetch_page(&self, username: &str, ctx: &FetchContext) -> FetchResult<ProfileData> {
        let mut request = ctx
            .http
            .get(&self.profile_url(username))
            .header(ACCEPT, "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8")
            .header(ACCEPT_LANGUAGE, "en-US,en;q=0.9");
        let agent = ctx
            .account
            .as_ref()
            .and_then(|account| account.user_agent.clone())
            .unwrap_or_else(|| rotating_user_agent().to_string());
        request = request.header(USER_AGENT, agent);
        if let Some(account) = ctx.account.as_ref().filter(|account| !account.cookies.is_empty()) {
            request = request.header(COOKIE, account.cookie_header());
        }
        let response = ctx.http.send(request).await?;

        let status = response.status();
        match status.as_u16() {
            200 => {}
            404 => return Err(SourceError::NotFound(NotFoundKind::Missing)),
            429 => return Err(SourceError::RateLimited),
            _ => return Err(SourceError::Transient(format!("profile page: {status}"))),
        }
        if is_login_page(response.url().as_str()) {
            return Err(SourceError::AuthFailure("instagram redirected to login".into()));
        }
        let html = response.text().await?;
        Ok(parse_profile_page(&html, username))
    }

    async fn fetch_direct(&self, username: &str, ctx: &FetchContext) -> FetchResult<ProfileData> {
        match self.fetch_api(username, ctx).await? {
            Some(profile) => Ok(profile),
            None => self.fetch_page(username, ctx).await,
        }
    }

    async fn fetch_rendered(
        &self,
        session: &Arc<BrowserSession>,
        username: &str,
        cookies: Vec<BrowserCookie>,
    ) -> FetchResult<ProfileData> {
        let task = tokio::spawn(render_profile(
            Arc::clone(session),
            self.profile_url(username),
            username.to_string(),
            cookies,
        ));
        task.await
            .map_err(|err| SourceError::Unexpected(format!("browser task failed: {err}")))?
    }
}

impl Default for InstagramSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LookupSource for InstagramSource {
    fn provider(&self) -> ProviderId {
        ProviderId::Instagram
    }

    async fn fetch(&self, query: &Query, ctx: &FetchContext) -> FetchResult<RawPayload> {
        let username = query.normalized_id();
        let mut profile = match (self.fetch_direct(username, ctx).await, &self.browser) {
            (Ok(profile), _) => profile,
            (Err(err @ SourceError::NotFound(_)), _) => return Err(err),
            (Err(err), Some(session)) => {
                log::info!("instagram direct fetch for {username} failed ({err}), using browser");
                // A refused session would only hit the login wall again.
                let cookies = match &err {
                    SourceError::AuthFailure(reason) => {
                        ctx.reject_account(reason.clone());
                        Vec::new()
                    }
                    _ => session_cookies(ctx),
                };
                let mut rendered = self.fetch_rendered(session, username, cookies).await?;
                rendered.username = username.to_string();
                return Ok(RawPayload::Profile(rendered.into_payload()));
            }
            (Err(err), None) => return Err(err),
        };

        if profile.photos.is_empty() && !profile.is_private {
            if let Some(session) = &self.browser {
                match self.fetch_rendered(session, username, session_cookies(ctx)).await {
                    Ok(rendered) => profile.absorb(rendered),
                    Err(err) => log::warn!("instagram browser pass for {username} failed: {err}"),
                }
            }
        }
        if profile.username.is_empty() {
            profile.username = username.to_string();
        }
        Ok(RawPayload::Profile(profile.into_payload()))
    }

    fn accounts(&self) -> Option<&AccountPool> {
        (!self.accounts.is_empty()).then_some(&self.accounts)
    }

    fn owns_url(&self, url: &Url) -> bool {
        host_in(url, &["cdninstagram.com", "fbcdn.net", "instagram.com"])
    }

    fn photo_headers(&self, _url: &Url, account: Option<&Account>) -> HeaderMap {
        let mut headers = default_photo_headers(account, Some("https://www.instagram.com/"));
        if let Some(cookies) = account
            .and_then(session_cookie_header)
            .and_then(|c| HeaderValue::from_str(&c).ok())
        {
            headers.insert(COOKIE, cookies);
        }
        headers
    }

    fn min_photo_bytes(&self) -> usize {
        1000
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::fanout::GroupOutcome;

    fn account() -> Account {
        Account::parse("jane:pw|Agent/1.0|sessionid=abc; csrftoken=tok; extra=1").unwrap()
    }

    #[test]
    fn parses_api_user() {
        let body = json!({"data": {"user": {
            "username": "jane",
            "full_name": "Jane Doe",
            "biography": "hello",
            "is_private": false,
            "is_verified": true,
            "profile_pic_url_hd": "https://scontent.cdninstagram.com/a.jpg?x=1\\u0026y=2",
            "edge_followed_by": {"count": 1200},
            "edge_follow": {"count": 30},
            "edge_owner_to_timeline_media": {"count": 2, "edges": [
                {"node": {"display_url": "https://scontent.cdninstagram.com/p1.jpg"}},
                {"node": {"display_url": "https://scontent.cdninstagram.com/p2.jpg"}}
            ]}
        }}});
        let profile = parse_api_user(&body).unwrap();
        assert_eq!(profile.username, "jane");
        assert_eq!(profile.followers, Some(1200));
        assert_eq!(profile.posts, Some(2));
        assert_eq!(
            profile.avatar.as_deref(),
            Some("https://scontent.cdninstagram.com/a.jpg?x=1&y=2")
        );
        assert_eq!(profile.photos.len(), 2);

        assert!(parse_api_user(&json!({"data": {"user": null}})).is_none());
        assert!(parse_api_user(&json!({"status": "fail"})).is_none());
    }

    #[test]
    fn payload_carries_avatar_and_posts() {
        let profile = ProfileData {
            username: "jane".into(),
            full_name: Some("Jane".into()),
            avatar: Some("https://cdn/a.jpg".into()),
            photos: (0..20).map(|i| format!("https://cdn/p{i}.jpg")).collect(),
            ..Default::default()
        };
        let payload = profile.into_payload();
        assert_eq!(payload.display_name.as_deref(), Some("Jane"));
        assert_eq!(payload.details.username.as_deref(), Some("jane"));
        assert_eq!(payload.photo_groups.len(), 2);
        match &payload.photo_groups[1].outcome {
            GroupOutcome::Photos { urls, .. } => assert_eq!(urls.len(), MAX_PHOTOS),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn absorb_keeps_existing_fields() {
        let mut direct = ProfileData {
            username: "jane".into(),
            full_name: Some("Jane".into()),
            ..Default::default()
        };
        direct.absorb(ProfileData {
            full_name: Some("Other".into()),
            avatar: Some("a".into()),
            photos: vec!["p".into()],
            ..Default::default()
        });
        assert_eq!(direct.full_name.as_deref(), Some("Jane"));
        assert_eq!(direct.avatar.as_deref(), Some("a"));
        assert_eq!(direct.photos, vec!["p".to_string()]);
    }

    #[test]
    fn api_headers_carry_session_cookies() {
        let source = InstagramSource::new();
        let account = account();
        let headers = source.api_headers("jane", Some(&account));
        assert_eq!(headers.get("X-IG-App-ID").unwrap(), APP_ID);
        assert_eq!(headers.get(USER_AGENT).unwrap(), "Agent/1.0");
        assert_eq!(headers.get(REFERER).unwrap(), "https://www.instagram.com/jane/");
        assert_eq!(headers.get(COOKIE).unwrap(), "sessionid=abc; csrftoken=tok");
    }

    #[test]
    fn account_lines_skip_comments() {
        let source = InstagramSource::new()
            .with_account_lines(["# accounts", "", "jane:pw||sessionid=abc"])
            .unwrap();
        assert_eq!(source.accounts().map(AccountPool::len), Some(1));
        assert!(InstagramSource::new().with_account_lines(["bob:pw"]).is_err());
        assert!(InstagramSource::new().accounts().is_none());
    }

    #[test]
    fn owns_instagram_hosts() {
        let source = InstagramSource::new();
        let owned = |url: &str| source.owns_url(&Url::parse(url).unwrap());
        assert!(owned("https://scontent-arn2-1.cdninstagram.com/v/p.jpg"));
        assert!(owned("https://scontent.xx.fbcdn.net/p.jpg"));
        assert!(owned("https://instagram.com/p.jpg"));
        assert!(!owned("https://notinstagram.com/p.jpg"));
        assert_eq!(source.min_photo_bytes(), 1000);
    }

    #[test]
    fn browser_cookies_use_instagram_domain() {
        let cookies = browser_cookies(&account());
        assert_eq!(cookies.len(), 3);
        assert!(cookies.iter().all(|c| c.domain == COOKIE_DOMAIN && c.path == "/"));
        assert_eq!(cookies[0].name, "csrftoken");
    }
}
