//! WhatsApp presence and avatars through a Green-API instance.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{Value, json};
use url::Url;

use super::core::{
    FetchContext, FetchResult, LookupSource, NotFoundKind, ProfilePayload, ProviderId, Query,
    RawPayload, SourceError, json_body,
};
use crate::fanout::{PhotoGroup, fan_out};
use crate::modules::accounts::{Account, AccountPool, DEFAULT_ERROR_COOLDOWN};
use crate::normalizer::ProfileDetails;

const API_BASE: &str = "https://api.green-api.com";
const CHECK_TTL: Duration = Duration::from_secs(600);
const CONTACT_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy)]
enum AvatarCall {
    Current,
    History,
}

/// Green-API client; each instance id and token pair is one account.
#[derive(Debug)]
pub struct WhatsAppSource {
    accounts: AccountPool,
    api_base: String,
    call_timeout: Duration,
}

impl WhatsAppSource {
    pub fn new(instance_id: impl Into<String>, api_token: impl Into<String>) -> Self {
        let source = Self {
            accounts: AccountPool::new(DEFAULT_ERROR_COOLDOWN),
            api_base: API_BASE.to_string(),
            call_timeout: Duration::from_secs(15),
        };
        source.with_instance(instance_id, api_token)
    }

    /// Add another instance to rotate over.
    pub fn with_instance(self, instance_id: impl Into<String>, api_token: impl Into<String>) -> Self {
        self.accounts.add(Account {
            identifier: instance_id.into(),
            secret: Some(api_token.into()),
            cookies: Default::default(),
            user_agent: None,
        });
        self
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn method_url(&self, account: &Account, method: &str) -> FetchResult<String> {
        let token = account
            .secret
            .as_deref()
            .ok_or_else(|| SourceError::AuthFailure(format!("instance {} has no token", account.identifier)))?;
        Ok(format!(
            "{}/waInstance{}/{}/{}",
            self.api_base.trim_end_matches('/'),
            account.identifier,
            method,
            token
        ))
    }

    async fn call(&self, ctx: &FetchContext, account: &Account, method: &str, body: Value) -> FetchResult<Value> {
        let url = self.method_url(account, method)?;
        let response = ctx.http.send(ctx.http.post(&url).json(&body)).await?;
        check_status(response.status(), method)?;
        json_body(response).await
    }

    async fn avatars(&self, ctx: &FetchContext, account: &Account, chat_id: &str, call: AvatarCall) -> FetchResult<PhotoGroup> {
        let body = json!({ "chatId": chat_id });
        Ok(match call {
            AvatarCall::Current => {
                let response = self.call(ctx, account, "getAvatar", body).await?;
                PhotoGroup::current("avatar", current_avatar(&response).into_iter().collect())
            }
            AvatarCall::History => {
                let response = self.call(ctx, account, "getAvatars", body).await?;
                PhotoGroup::history("avatars", avatar_history(&response))
            }
        })
    }
}

fn check_status(status: StatusCode, method: &str) -> FetchResult<()> {
    match status.as_u16() {
        200..=299 => Ok(()),
        401 | 403 => Err(SourceError::AuthFailure(format!("{method}: {status}"))),
        429 | 466 => Err(SourceError::RateLimited),
        500..=599 => Err(SourceError::Transient(format!("{method}: {status}"))),
        _ => Err(SourceError::Unexpected(format!("{method}: {status}"))),
    }
}

fn current_avatar(response: &Value) -> Option<String> {
    response
        .get("urlAvatar")
        .and_then(Value::as_str)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
}

/// History URLs; the instance answers with one of several list shapes.
fn avatar_history(response: &Value) -> Vec<String> {
    let list = ["avatars", "urlAvatars", "urls"]
        .iter()
        .find_map(|key| response.get(*key).and_then(Value::as_array))
        .or_else(|| response.as_array());
    list.map(|items| {
        items
            .iter()
            .filter_map(|item| match item {
                Value::String(url) => Some(url.clone()),
                other => current_avatar(other),
            })
            .filter(|url| !url.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

fn contact_fields(info: &Value) -> (Option<String>, Option<String>) {
    let field = |key: &str| {
        info.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    (field("name").or_else(|| field("contactName")), field("about"))
}

#[async_trait]
impl LookupSource for WhatsAppSource {
    fn provider(&self) -> ProviderId {
        ProviderId::WhatsApp
    }

    async fn fetch(&self, query: &Query, ctx: &FetchContext) -> FetchResult<RawPayload> {
        let account = ctx
            .account
            .as_ref()
            .ok_or_else(|| SourceError::AuthFailure("no Green-API instance available".into()))?;
        let phone = query.normalized_id();
        let number: u64 = phone
            .parse()
            .map_err(|_| SourceError::Unexpected(format!("'{phone}' is not numeric")))?;

        let memo_args = [account.identifier.as_str(), phone];
        let check = ctx
            .memo("whatsapp.check", &memo_args, CHECK_TTL, || {
                self.call(ctx, account, "checkWhatsapp", json!({ "phoneNumber": number }))
            })
            .await?;
        if !check.get("existsWhatsapp").and_then(Value::as_bool).unwrap_or(false) {
            return Err(SourceError::NotFound(NotFoundKind::Missing));
        }

        let chat_id = format!("{phone}@c.us");
        let contact = ctx.memo("whatsapp.contact", &memo_args, CONTACT_TTL, || {
            self.call(ctx, account, "getContactInfo", json!({ "chatId": chat_id }))
        });
        let photos = fan_out(
            [AvatarCall::Current, AvatarCall::History],
            |call| self.avatars(ctx, account, &chat_id, call),
            2,
            self.call_timeout,
        );
        let (contact, photo_groups) = tokio::join!(contact, photos);

        let (name, about) = match contact {
            Ok(info) => contact_fields(&info),
            Err(err @ SourceError::AuthFailure(_)) => return Err(err),
            Err(err) => {
                log::debug!("whatsapp contact info for {phone} unavailable: {err}");
                (None, None)
            }
        };

        Ok(RawPayload::Profile(ProfilePayload {
            display_name: name,
            details: ProfileDetails {
                biography: about,
                ..Default::default()
            },
            photo_groups,
            ..Default::default()
        }))
    }

    fn accounts(&self) -> Option<&AccountPool> {
        Some(&self.accounts)
    }

    fn owns_url(&self, url: &Url) -> bool {
        url.host_str().is_some_and(|host| host.ends_with("whatsapp.net"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert!(check_status(StatusCode::OK, "getAvatar").is_ok());
        assert!(matches!(
            check_status(StatusCode::UNAUTHORIZED, "getAvatar"),
            Err(SourceError::AuthFailure(_))
        ));
        assert_eq!(
            check_status(StatusCode::from_u16(466).unwrap(), "getAvatar"),
            Err(SourceError::RateLimited)
        );
        assert!(matches!(
            check_status(StatusCode::BAD_GATEWAY, "getAvatar"),
            Err(SourceError::Transient(_))
        ));
    }

    #[test]
    fn avatar_history_shapes() {
        assert_eq!(
            avatar_history(&json!({"avatars": ["a", "b"]})),
            vec!["a".to_string(), "b".to_string()]
        );
        assert_eq!(
            avatar_history(&json!({"urlAvatars": [{"urlAvatar": "c"}, {"urlAvatar": ""}]})),
            vec!["c".to_string()]
        );
        assert_eq!(avatar_history(&json!(["d"])), vec!["d".to_string()]);
        assert!(avatar_history(&json!({"reason": "no avatars"})).is_empty());
    }

    #[test]
    fn contact_name_and_about() {
        let (name, about) = contact_fields(&json!({"name": " Анна ", "about": "Hey there!"}));
        assert_eq!(name.as_deref(), Some("Анна"));
        assert_eq!(about.as_deref(), Some("Hey there!"));

        let (name, _) = contact_fields(&json!({"name": "", "contactName": "Anna K"}));
        assert_eq!(name.as_deref(), Some("Anna K"));
    }

    #[test]
    fn method_urls_embed_instance_and_token() {
        let source = WhatsAppSource::new("1101000001", "secret-token").with_api_base("https://api.example.test/");
        let account = source.accounts.any_account().unwrap();
        assert_eq!(
            source.method_url(&account, "checkWhatsapp").unwrap(),
            "https://api.example.test/waInstance1101000001/checkWhatsapp/secret-token"
        );
    }
}
