//! VK REST adapter: one `users.get` call for the profile, then the photo
//! albums fanned out in parallel.

use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use reqwest::header::HeaderMap;
use serde_json::Value;
use url::Url;

use super::core::{
    FetchContext, FetchResult, LookupSource, NotFoundKind, ProfilePayload, ProviderId, Query,
    RawPayload, SourceError, default_photo_headers, host_in, json_body,
};
use crate::fanout::{PhotoGroup, fan_out};
use crate::modules::accounts::{Account, AccountPool, DEFAULT_ERROR_COOLDOWN};
use crate::normalizer::ProfileDetails;

const API_BASE: &str = "https://api.vk.com/method";
const API_VERSION: &str = "5.199";
const USER_FIELDS: &str =
    "photo_max_orig,status,city,country,bdate,online,last_seen,followers_count,verified,sex,screen_name";
const ALBUMS: [&str; 3] = ["profile", "wall", "saved"];
const ALBUM_PAGE: &str = "100";
const SIZE_PRIORITY: [&str; 10] = ["w", "z", "y", "x", "r", "q", "p", "o", "m", "s"];

/// Error codes with a dedicated meaning.
const ERR_AUTH: i64 = 5;
const ERR_PROFILE_CLOSED: i64 = 30;
const ERR_ALBUM_ACCESS: i64 = 200;

/// VK API client rotating over access tokens.
#[derive(Debug)]
pub struct VkSource {
    accounts: AccountPool,
    api_base: String,
    album_timeout: Duration,
}

impl VkSource {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            accounts: AccountPool::with_accounts(
                DEFAULT_ERROR_COOLDOWN,
                tokens.into_iter().map(Account::token),
            ),
            api_base: API_BASE.to_string(),
            album_timeout: Duration::from_secs(15),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    async fn call(
        &self,
        ctx: &FetchContext,
        token: &str,
        method: &str,
        params: &[(&str, &str)],
    ) -> Result<Value, CallError> {
        let url = format!("{}/{}", self.api_base.trim_end_matches('/'), method);
        let request = ctx
            .http
            .get(&url)
            .query(params)
            .query(&[("access_token", token), ("v", API_VERSION)]);
        let body = json_body(ctx.http.send(request).await?).await?;
        unwrap_response(body)
    }

    async fn album(&self, ctx: &FetchContext, token: &str, owner_id: &str, album: &str) -> FetchResult<PhotoGroup> {
        let params = [
            ("owner_id", owner_id),
            ("album_id", album),
            ("count", ALBUM_PAGE),
            ("photo_sizes", "1"),
            ("rev", "1"),
            ("extended", "1"),
        ];
        match self.call(ctx, token, "photos.get", &params).await {
            Ok(response) => Ok(PhotoGroup::history(album, album_urls(&response))),
            Err(CallError::Api { code: ERR_PROFILE_CLOSED, .. }) => {
                Ok(PhotoGroup::restricted(album, "profile closed"))
            }
            Err(CallError::Api { code: ERR_ALBUM_ACCESS, .. }) => {
                log::debug!("vk album {album} of {owner_id} is not accessible");
                Ok(PhotoGroup::history(album, Vec::new()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Failure of one API call, before it is mapped for the orchestrator.
#[derive(Debug)]
enum CallError {
    Api { code: i64, message: String },
    Source(SourceError),
}

impl From<SourceError> for CallError {
    fn from(err: SourceError) -> Self {
        CallError::Source(err)
    }
}

impl From<reqwest::Error> for CallError {
    fn from(err: reqwest::Error) -> Self {
        CallError::Source(err.into())
    }
}

impl From<CallError> for SourceError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::Api { code, message } => map_error(code, &message),
            CallError::Source(err) => err,
        }
    }
}

/// Split a VK envelope into its `response` or the API error.
fn unwrap_response(body: Value) -> Result<Value, CallError> {
    if let Some(error) = body.get("error") {
        let code = error.get("error_code").and_then(Value::as_i64).unwrap_or_default();
        let message = error
            .get("error_msg")
            .and_then(Value::as_str)
            .unwrap_or("VK API error")
            .to_string();
        return Err(CallError::Api { code, message });
    }
    body.get("response")
        .cloned()
        .ok_or_else(|| SourceError::Unexpected("VK response without payload".into()).into())
}

fn map_error(code: i64, message: &str) -> SourceError {
    match code {
        ERR_AUTH => SourceError::AuthFailure(message.to_string()),
        6 | 9 | 29 => SourceError::RateLimited,
        18 | 113 => SourceError::NotFound(NotFoundKind::Missing),
        ERR_PROFILE_CLOSED | ERR_ALBUM_ACCESS => SourceError::NotFound(NotFoundKind::Private),
        10 => SourceError::Transient(message.to_string()),
        _ => SourceError::Unexpected(format!("VK error {code}: {message}")),
    }
}

/// Largest available rendition of one photo item.
fn best_size_url(photo: &Value) -> Option<String> {
    let sizes = photo.get("sizes").and_then(Value::as_array);
    let Some(sizes) = sizes.filter(|sizes| !sizes.is_empty()) else {
        return photo
            .get("photo_max_orig")
            .and_then(Value::as_str)
            .map(str::to_string);
    };
    let url_of = |wanted: &str| {
        sizes
            .iter()
            .find(|size| size.get("type").and_then(Value::as_str) == Some(wanted))
            .and_then(|size| size.get("url").and_then(Value::as_str))
    };
    SIZE_PRIORITY
        .iter()
        .find_map(|kind| url_of(kind))
        .or_else(|| sizes.last().and_then(|size| size.get("url")).and_then(Value::as_str))
        .map(str::to_string)
}

fn album_urls(response: &Value) -> Vec<String> {
    response
        .get("items")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(best_size_url).collect())
        .unwrap_or_default()
}

fn text(user: &Value, key: &str) -> Option<String> {
    user.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn flag(user: &Value, key: &str) -> Option<bool> {
    user.get(key).and_then(Value::as_i64).map(|v| v == 1)
}

/// Profile fields of a `users.get` item; `None` for deactivated users.
fn parse_user(user: &Value) -> Option<ProfilePayload> {
    if user.get("deactivated").is_some() {
        return None;
    }
    let name = [text(user, "first_name"), text(user, "last_name")]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");

    let details = ProfileDetails {
        username: text(user, "screen_name"),
        biography: text(user, "status"),
        followers: user.get("followers_count").and_then(Value::as_u64),
        is_private: user.get("is_closed").and_then(Value::as_bool),
        is_verified: flag(user, "verified"),
        city: user.get("city").and_then(|city| text(city, "title")),
        online: flag(user, "online"),
        last_seen: user
            .get("last_seen")
            .and_then(|seen| seen.get("time"))
            .and_then(Value::as_i64)
            .and_then(|secs| DateTime::from_timestamp(secs, 0)),
        birth_date: text(user, "bdate"),
        ..Default::default()
    };

    let mut photo_groups = Vec::new();
    if let Some(avatar) = text(user, "photo_max_orig").filter(|url| !url.contains("camera_")) {
        photo_groups.push(PhotoGroup::current("avatar", vec![avatar]));
    }

    Some(ProfilePayload {
        display_name: (!name.is_empty()).then_some(name),
        country: user.get("country").and_then(|country| text(country, "title")),
        details,
        photo_groups,
        ..Default::default()
    })
}

#[async_trait]
impl LookupSource for VkSource {
    fn provider(&self) -> ProviderId {
        ProviderId::Vk
    }

    async fn fetch(&self, query: &Query, ctx: &FetchContext) -> FetchResult<RawPayload> {
        let token = ctx
            .account
            .as_ref()
            .and_then(|account| account.secret.as_deref())
            .ok_or_else(|| SourceError::AuthFailure("no VK access token available".into()))?;

        let response = self
            .call(ctx, token, "users.get", &[("user_ids", query.normalized_id()), ("fields", USER_FIELDS)])
            .await
            .map_err(SourceError::from)?;
        let user = response
            .as_array()
            .and_then(|users| users.first())
            .ok_or(SourceError::NotFound(NotFoundKind::Missing))?;
        let mut profile = parse_user(user).ok_or(SourceError::NotFound(NotFoundKind::Missing))?;

        let owner_id = user
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| SourceError::Unexpected("VK user without id".into()))?
            .to_string();

        let groups = fan_out(
            0..ALBUMS.len(),
            |index| self.album(ctx, token, &owner_id, ALBUMS[index]),
            ALBUMS.len(),
            self.album_timeout,
        )
        .await;
        profile.photo_groups.extend(groups);

        Ok(RawPayload::Profile(profile))
    }

    fn accounts(&self) -> Option<&AccountPool> {
        Some(&self.accounts)
    }

    fn owns_url(&self, url: &Url) -> bool {
        host_in(url, &["userapi.com", "vk.com", "vk.me"])
    }

    fn photo_headers(&self, _url: &Url, account: Option<&Account>) -> HeaderMap {
        default_photo_headers(account, Some("https://vk.com/"))
    }
}
