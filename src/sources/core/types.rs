//! Core data structures shared by the source adapters, the normalizer and the
//! orchestrator.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::browser::PageSnapshot;
use crate::fanout::PhotoGroup;
use crate::normalizer::ProfileDetails;

/// Providers the engine knows how to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Vk,
    WhatsApp,
    Instagram,
    GetContact,
    WhoCalls,
}

impl ProviderId {
    pub const ALL: [ProviderId; 5] = [
        ProviderId::Vk,
        ProviderId::WhatsApp,
        ProviderId::Instagram,
        ProviderId::GetContact,
        ProviderId::WhoCalls,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Vk => "vk",
            ProviderId::WhatsApp => "whatsapp",
            ProviderId::Instagram => "instagram",
            ProviderId::GetContact => "getcontact",
            ProviderId::WhoCalls => "whocalls",
        }
    }

    /// Identity kind accepted by the provider.
    pub fn query_kind(&self) -> QueryKind {
        match self {
            ProviderId::Vk | ProviderId::Instagram => QueryKind::Handle,
            ProviderId::WhatsApp | ProviderId::GetContact | ProviderId::WhoCalls => {
                QueryKind::Phone
            }
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    Phone,
    Handle,
}

/// Errors raised while building a [`Query`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("empty input")]
    Empty,
    #[error("'{0}' does not contain a phone number")]
    InvalidPhone(String),
    #[error("'{0}' does not contain a usable handle")]
    InvalidHandle(String),
    #[error("provider {provider} does not accept {kind:?} queries")]
    UnsupportedKind { provider: ProviderId, kind: QueryKind },
}

/// Immutable lookup query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Query {
    kind: QueryKind,
    raw_input: String,
    normalized_id: String,
}

impl Query {
    /// Build a phone query: digits only, leading `8` of an 11-digit number
    /// becomes `7`, a bare 10-digit number gets the `7` prefix.
    pub fn phone(raw: impl Into<String>) -> Result<Self, QueryError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(QueryError::Empty);
        }
        let normalized = normalize_phone(&raw).ok_or_else(|| QueryError::InvalidPhone(raw.clone()))?;
        Ok(Self {
            kind: QueryKind::Phone,
            raw_input: raw,
            normalized_id: normalized,
        })
    }

    /// Build a handle query from a bare handle, `@handle` or a profile URL.
    pub fn handle(raw: impl Into<String>) -> Result<Self, QueryError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(QueryError::Empty);
        }
        let normalized =
            normalize_handle(&raw).ok_or_else(|| QueryError::InvalidHandle(raw.clone()))?;
        Ok(Self {
            kind: QueryKind::Handle,
            raw_input: raw,
            normalized_id: normalized,
        })
    }

    pub fn kind(&self) -> QueryKind {
        self.kind
    }

    pub fn raw_input(&self) -> &str {
        &self.raw_input
    }

    pub fn normalized_id(&self) -> &str {
        &self.normalized_id
    }
}

pub fn normalize_phone(raw: &str) -> Option<String> {
    let mut digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    if digits.len() == 11 && digits.starts_with('8') {
        digits.replace_range(0..1, "7");
    } else if digits.len() == 10 {
        digits.insert(0, '7');
    }
    Some(digits)
}

const RESERVED_SEGMENTS: &[&str] = &[
    "p", "tv", "reel", "reels", "stories", "direct", "explore",
];

static HANDLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.]+$").expect("invalid handle regex"));

pub fn normalize_handle(raw: &str) -> Option<String> {
    let mut text = raw.trim().trim_end_matches('/');
    if let Some(idx) = text.find("://") {
        text = &text[idx + 3..];
    }

    // host followed by a path: keep the first path segment
    let candidate = match text.split_once('/') {
        Some((host, path)) if host.contains('.') => path.split(['/', '?', '#']).next()?,
        Some(_) => return None,
        None => text,
    };

    let candidate = candidate.trim_start_matches('@');
    if candidate.is_empty()
        || !HANDLE_RE.is_match(candidate)
        || RESERVED_SEGMENTS.contains(&candidate)
    {
        return None;
    }
    Some(candidate.to_string())
}

/// Why a provider reported that nothing is there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundKind {
    Missing,
    Private,
}

/// Failure taxonomy reported by every adapter call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SourceError {
    #[error("authentication rejected: {0}")]
    AuthFailure(String),
    #[error("not found ({0:?})")]
    NotFound(NotFoundKind),
    #[error("rate limited by provider")]
    RateLimited,
    #[error("transient error: {0}")]
    Transient(String),
    #[error("captcha required but no solver is configured")]
    CaptchaRequired,
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl SourceError {
    /// Hint only; the orchestrator owns the retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Transient(_) | SourceError::RateLimited)
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SourceError::Unexpected(err.to_string())
        } else {
            SourceError::Transient(err.to_string())
        }
    }
}

pub type FetchResult<T> = Result<T, SourceError>;

/// Provider-shaped payloads handed to the normalizer. The shape never leaks
/// past [`crate::normalizer::normalize`].
#[derive(Debug, Clone)]
pub enum RawPayload {
    /// Structured profile from a REST or private API.
    Profile(ProfilePayload),
    /// Identity-wide access restriction signalled by a sub-request.
    Restricted { reason: String },
    /// Rendered search page from the interactive provider.
    SearchPage(PageSnapshot),
    /// Caller-id page from the plain HTTP provider.
    CallerId(CallerIdPayload),
}

#[derive(Debug, Clone, Default)]
pub struct ProfilePayload {
    pub display_name: Option<String>,
    pub carrier: Option<String>,
    pub country: Option<String>,
    pub details: ProfileDetails,
    pub photo_groups: Vec<PhotoGroup>,
}

#[derive(Debug, Clone, Default)]
pub struct CallerIdPayload {
    pub name: Option<String>,
    pub category: Option<String>,
    pub complaints: Option<u32>,
    pub region: Option<String>,
    pub operator: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_with_leading_eight_is_rewritten() {
        let query = Query::phone("89161234567").unwrap();
        assert_eq!(query.normalized_id(), "79161234567");
        assert_eq!(query.raw_input(), "89161234567");
    }

    #[test]
    fn phone_formatting_is_stripped() {
        assert_eq!(normalize_phone("+7 (916) 123-45-67").as_deref(), Some("79161234567"));
        assert_eq!(normalize_phone("916 123 45 67").as_deref(), Some("79161234567"));
        assert_eq!(normalize_phone("380501234567").as_deref(), Some("380501234567"));
        assert!(Query::phone("no digits").is_err());
        assert_eq!(Query::phone("  "), Err(QueryError::Empty));
    }

    #[test]
    fn handles_strip_scheme_and_host() {
        assert_eq!(normalize_handle("https://www.instagram.com/some.user/").as_deref(), Some("some.user"));
        assert_eq!(normalize_handle("instagr.am/other_user?hl=en").as_deref(), Some("other_user"));
        assert_eq!(normalize_handle("vk.com/id12345").as_deref(), Some("id12345"));
        assert_eq!(normalize_handle("@durov").as_deref(), Some("durov"));
        assert_eq!(normalize_handle("https://instagram.com/p/Cxyz"), None);
        assert_eq!(normalize_handle("not a handle"), None);
    }
}
