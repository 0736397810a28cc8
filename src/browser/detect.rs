//! Captcha detection on rendered pages.
//!
//! Pattern lists per widget family; the first family with a matching pattern
//! wins, and the site key is read from `data-sitekey` or the widget's
//! script URL.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};

use crate::external_deps::captcha::CaptchaKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedCaptcha {
    pub kind: CaptchaKind,
    pub site_key: Option<String>,
}

struct WidgetPattern {
    kind: CaptchaKind,
    patterns: Vec<Regex>,
}

impl WidgetPattern {
    fn new(kind: CaptchaKind, raw_patterns: &[&str]) -> Self {
        Self {
            kind,
            patterns: raw_patterns.iter().map(|pattern| build_regex(pattern)).collect(),
        }
    }

    fn matches(&self, html: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.is_match(html))
    }
}

static WIDGETS: Lazy<Vec<WidgetPattern>> = Lazy::new(|| {
    vec![
        WidgetPattern::new(
            CaptchaKind::Turnstile,
            &[
                r#"class=['"][^'"]*cf-turnstile[^'"]*['"]"#,
                r"challenges\.cloudflare\.com/turnstile",
            ],
        ),
        WidgetPattern::new(
            CaptchaKind::HCaptcha,
            &[
                r#"class=['"][^'"]*h-captcha[^'"]*['"]"#,
                r"hcaptcha\.com/1/api\.js",
                r"<iframe[^>]+hcaptcha\.com",
            ],
        ),
        WidgetPattern::new(
            CaptchaKind::ReCaptchaV2,
            &[
                r#"class=['"][^'"]*g-recaptcha[^'"]*['"]"#,
                r"google\.com/recaptcha/api",
                r"<iframe[^>]+recaptcha",
            ],
        ),
    ]
});

static SITE_KEY: Lazy<Regex> =
    Lazy::new(|| build_regex(r#"data-sitekey=['"]([^'"]+)['"]"#));

static RENDER_KEY: Lazy<Regex> = Lazy::new(|| build_regex(r#"[?&](?:render|k|sitekey)=([0-9A-Za-z_-]{20,})"#));

fn build_regex(pattern: &str) -> Regex {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .unwrap_or_else(|err| panic!("invalid captcha detection regex `{}`: {}", pattern, err))
}

/// Captcha widget present on the page, if any.
pub fn detect_captcha(html: &str) -> Option<DetectedCaptcha> {
    let widget = WIDGETS.iter().find(|widget| widget.matches(html))?;
    let site_key = SITE_KEY
        .captures(html)
        .or_else(|| RENDER_KEY.captures(html))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string());
    Some(DetectedCaptcha {
        kind: widget.kind,
        site_key,
    })
}
