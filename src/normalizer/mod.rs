//! Result normalization.
//!
//! Turns the provider-shaped [`RawPayload`] variants into one canonical
//! [`LookupResult`]. The functions here are pure: no I/O, no clock.
//!
//! Status classification for rendered pages follows a fixed priority:
//! hidden-profile phrases, then not-found phrases, then the transient
//! "not yet available" placeholder, then a found name, and finally a found
//! result carrying the [`NAME_UNAVAILABLE`] sentinel. A page that loaded is
//! never an error.

pub mod extract;
pub mod mojibake;
pub mod rules;
pub mod spam;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::browser::PageSnapshot;
use crate::fanout::{self, MergedPhotos};
use crate::sources::{CallerIdPayload, ProfilePayload, ProviderId, RawPayload};

pub use mojibake::repair as repair_mojibake;
pub use rules::{CountryKeyword, NormalizerRules, RulesError};
pub use spam::SpamSignals;

/// Name shown when the page loaded but no name could be extracted.
pub const NAME_UNAVAILABLE: &str = "Information unavailable";
pub const NAME_HIDDEN: &str = "Profile hidden";
pub const NAME_NOT_FOUND: &str = "Not found";
pub const NAME_NOT_YET_AVAILABLE: &str = "Not yet available";

/// Longest diagnostic kept on an error result.
pub const MAX_ERROR_LEN: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupStatus {
    Found,
    Hidden,
    NotFound,
    /// Transient provider placeholder; retried by the caller.
    Unavailable,
    Error,
}

impl LookupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LookupStatus::Found => "found",
            LookupStatus::Hidden => "hidden",
            LookupStatus::NotFound => "not_found",
            LookupStatus::Unavailable => "unavailable",
            LookupStatus::Error => "error",
        }
    }

    fn sentinel(&self) -> Option<&'static str> {
        match self {
            LookupStatus::Hidden => Some(NAME_HIDDEN),
            LookupStatus::NotFound => Some(NAME_NOT_FOUND),
            LookupStatus::Unavailable => Some(NAME_NOT_YET_AVAILABLE),
            LookupStatus::Found | LookupStatus::Error => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhotoKind {
    Current,
    History,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhotoRef {
    pub url: String,
    pub kind: PhotoKind,
    pub position: usize,
}

/// Provider-specific profile attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProfileDetails {
    pub username: Option<String>,
    pub biography: Option<String>,
    pub followers: Option<u64>,
    pub following: Option<u64>,
    pub posts: Option<u64>,
    pub is_private: Option<bool>,
    pub is_verified: Option<bool>,
    pub city: Option<String>,
    pub online: Option<bool>,
    pub last_seen: Option<DateTime<Utc>>,
    pub birth_date: Option<String>,
    pub category: Option<String>,
}

impl ProfileDetails {
    fn repaired(mut self) -> Self {
        for field in [&mut self.biography, &mut self.city, &mut self.category] {
            if let Some(text) = field.take() {
                *field = Some(mojibake::repair(&text).into_owned());
            }
        }
        self
    }
}

/// Canonical, provider-agnostic lookup record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LookupResult {
    pub provider: ProviderId,
    /// Normalized identity the lookup ran for.
    pub query: String,
    pub status: LookupStatus,
    pub display_name: Option<String>,
    pub tags: Vec<String>,
    pub carrier: Option<String>,
    pub country: Option<String>,
    pub is_spam: bool,
    pub spam_count: Option<u32>,
    pub photos: Vec<PhotoRef>,
    pub details: ProfileDetails,
    pub error: Option<String>,
}

impl LookupResult {
    fn empty(provider: ProviderId, query: &str, status: LookupStatus) -> Self {
        Self {
            provider,
            query: query.to_string(),
            status,
            display_name: status.sentinel().map(str::to_string),
            tags: Vec::new(),
            carrier: None,
            country: None,
            is_spam: false,
            spam_count: None,
            photos: Vec::new(),
            details: ProfileDetails::default(),
            error: None,
        }
    }

    /// Terminal non-error outcome carrying only the status sentinel.
    pub fn terminal(provider: ProviderId, query: &str, status: LookupStatus) -> Self {
        Self::empty(provider, query, status)
    }

    /// Error outcome with a truncated diagnostic.
    pub fn error(provider: ProviderId, query: &str, message: impl AsRef<str>) -> Self {
        let mut result = Self::empty(provider, query, LookupStatus::Error);
        result.error = Some(truncate(message.as_ref(), MAX_ERROR_LEN));
        result
    }

    pub fn is_found(&self) -> bool {
        self.status == LookupStatus::Found
    }

    pub fn current_photo(&self) -> Option<&PhotoRef> {
        self.photos.first().filter(|photo| photo.kind == PhotoKind::Current)
    }
}

fn truncate(message: &str, max: usize) -> String {
    match message.char_indices().nth(max) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}

/// Normalize one raw payload.
pub fn normalize(
    provider: ProviderId,
    query: &str,
    payload: RawPayload,
    rules: &NormalizerRules,
) -> LookupResult {
    match payload {
        RawPayload::Profile(profile) => normalize_profile(provider, query, profile),
        RawPayload::Restricted { reason } => {
            log::debug!("{provider} {query}: restricted ({reason})");
            LookupResult::terminal(provider, query, LookupStatus::Hidden)
        }
        RawPayload::SearchPage(page) => normalize_page(provider, query, &page, rules),
        RawPayload::CallerId(caller) => normalize_caller(provider, query, caller, rules),
    }
}

fn repaired(field: Option<String>) -> Option<String> {
    field
        .map(|text| mojibake::repair(text.trim()).into_owned())
        .filter(|text| !text.is_empty())
}

fn normalize_profile(provider: ProviderId, query: &str, profile: ProfilePayload) -> LookupResult {
    let photos = match fanout::merge_photo_groups(profile.photo_groups) {
        MergedPhotos::Photos(photos) => photos,
        MergedPhotos::Restricted { reason } => {
            log::debug!("{provider} {query}: photo access restricted ({reason})");
            return LookupResult::terminal(provider, query, LookupStatus::Hidden);
        }
    };

    let mut result = LookupResult::empty(provider, query, LookupStatus::Found);
    result.display_name =
        repaired(profile.display_name).or_else(|| Some(NAME_UNAVAILABLE.to_string()));
    result.carrier = repaired(profile.carrier);
    result.country = repaired(profile.country);
    result.details = profile.details.repaired();
    result.photos = photos;
    result
}

/// Status implied by page text alone, in priority order.
pub fn classify_text(body_text: &str, rules: &NormalizerRules) -> Option<LookupStatus> {
    let lower = body_text.to_lowercase();
    if NormalizerRules::matches_any(&rules.hidden_phrases, &lower) {
        Some(LookupStatus::Hidden)
    } else if NormalizerRules::matches_any(&rules.not_found_phrases, &lower) {
        Some(LookupStatus::NotFound)
    } else if NormalizerRules::matches_any(&rules.unavailable_phrases, &lower) {
        Some(LookupStatus::Unavailable)
    } else {
        None
    }
}

fn normalize_page(
    provider: ProviderId,
    query: &str,
    page: &PageSnapshot,
    rules: &NormalizerRules,
) -> LookupResult {
    let body_text = if page.body_text.trim().is_empty() {
        extract::body_text(&page.html)
    } else {
        page.body_text.clone()
    };

    if let Some(status) = classify_text(&body_text, rules) {
        return LookupResult::terminal(provider, query, status);
    }

    let html = page.html.as_str();
    let signals = SpamSignals::detect(html, &body_text, rules);

    let mut result = LookupResult::empty(provider, query, LookupStatus::Found);
    result.display_name = extract::structured_name(html, rules)
        .or_else(|| extract::dom_name(html, rules))
        .or_else(|| Some(NAME_UNAVAILABLE.to_string()));
    result.carrier = extract::carrier(html, rules);
    result.country = extract::country(html, rules);
    result.tags = extract::tags(html, rules);
    result.is_spam = signals.is_spam();
    result.spam_count = signals.count.filter(|count| *count > 0);
    result
}

fn normalize_caller(
    provider: ProviderId,
    query: &str,
    caller: CallerIdPayload,
    rules: &NormalizerRules,
) -> LookupResult {
    let name = repaired(caller.name).filter(|name| !rules.is_stop_word(name));
    let category = repaired(caller.category);
    if name.is_none() && category.is_none() && caller.complaints.is_none() {
        return LookupResult::terminal(provider, query, LookupStatus::NotFound);
    }

    let signals = SpamSignals::from_caller_category(category.as_deref(), caller.complaints, rules);
    let mut result = LookupResult::empty(provider, query, LookupStatus::Found);
    result.display_name = name.or_else(|| Some(NAME_UNAVAILABLE.to_string()));
    result.carrier = repaired(caller.operator);
    result.country = repaired(caller.region);
    result.tags = category.iter().cloned().collect();
    result.is_spam = signals.is_spam();
    result.spam_count = caller.complaints.filter(|count| *count > 0);
    result.details.category = category;
    result
}
