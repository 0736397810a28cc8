//! Spam determination from independent page signals.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};

use super::rules::NormalizerRules;

static STRUCTURED_FLAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""isSpam"\s*:\s*true"#).expect("invalid spam flag regex"));

static SEVERITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"spamdegree\s*[=:]\s*['"]?([a-z]+)"#).expect("invalid severity regex")
});

static BADGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"badge\s*[=:]\s*['"]([^'"]*)['"]"#).expect("invalid badge regex")
});

static SPAM_COUNT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""spamCount"\s*:\s*(\d+)"#).expect("invalid spam count regex"));

static IMAGES: Lazy<Option<Selector>> = Lazy::new(|| Selector::parse("img").ok());

/// Outcome of every spam signal. The flag is the OR of all of them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpamSignals {
    pub structured_flag: bool,
    pub severity: bool,
    pub badge: bool,
    pub image: bool,
    pub isolated_token: bool,
    pub count: Option<u32>,
}

impl SpamSignals {
    pub fn detect(html: &str, body_text: &str, rules: &NormalizerRules) -> Self {
        let token = rules.spam_token.to_lowercase();
        let html_lower = html.to_lowercase();

        let severity = SEVERITY
            .captures_iter(&html_lower)
            .filter_map(|caps| caps.get(1))
            .any(|value| {
                rules
                    .spam_severities
                    .iter()
                    .any(|sev| sev.eq_ignore_ascii_case(value.as_str()))
            });

        let badge = !token.is_empty()
            && BADGE
                .captures_iter(&html_lower)
                .filter_map(|caps| caps.get(1))
                .any(|value| value.as_str().contains(&token));

        Self {
            structured_flag: STRUCTURED_FLAG.is_match(html),
            severity,
            badge,
            image: !token.is_empty() && image_signal(html, &token),
            isolated_token: isolated_token(html, &rules.spam_token)
                || isolated_token(body_text, &rules.spam_token),
            count: SPAM_COUNT
                .captures(html)
                .and_then(|caps| caps.get(1))
                .and_then(|m| m.as_str().parse().ok()),
        }
    }

    /// Caller-id style signals: category keywords and complaint count.
    pub fn from_caller_category(
        category: Option<&str>,
        complaints: Option<u32>,
        rules: &NormalizerRules,
    ) -> Self {
        let flagged = category
            .map(|cat| {
                let lower = cat.to_lowercase();
                rules
                    .spam_categories
                    .iter()
                    .any(|frag| lower.contains(&frag.to_lowercase()))
            })
            .unwrap_or(false);
        Self {
            badge: flagged,
            count: complaints,
            ..Default::default()
        }
    }

    pub fn is_spam(&self) -> bool {
        self.structured_flag
            || self.severity
            || self.badge
            || self.image
            || self.isolated_token
            || self.count.is_some_and(|count| count > 0)
    }
}

fn image_signal(html: &str, token: &str) -> bool {
    let Some(selector) = IMAGES.as_ref() else {
        return false;
    };
    let document = Html::parse_document(html);
    document.select(selector).any(|img| {
        ["alt", "src"].iter().any(|attr| {
            img.value()
                .attr(attr)
                .is_some_and(|value| value.to_lowercase().contains(token))
        })
    })
}

/// Upper-cased token as a standalone word.
fn isolated_token(text: &str, token: &str) -> bool {
    if token.is_empty() {
        return false;
    }
    let pattern = format!(r"\b{}\b", regex::escape(&token.to_uppercase()));
    Regex::new(&pattern).is_ok_and(|re| re.is_match(text))
}
