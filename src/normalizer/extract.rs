//! Field extraction heuristics over rendered provider pages.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};

use super::mojibake;
use super::rules::NormalizerRules;

static NAME_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r#""displayName"\s*:\s*"((?:[^"\\]|\\.)+)""#,
        r#""name"\s*:\s*"((?:[^"\\]|\\.)+)""#,
        r#""fullName"\s*:\s*"((?:[^"\\]|\\.)+)""#,
        r#"displayName\s*[=:]\s*['"]([^'"]+)['"]"#,
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("invalid name regex"))
    .collect()
});

static CARRIER_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r#""carrier"\s*:\s*"((?:[^"\\]|\\.)+)""#,
        r#""operator"\s*:\s*"((?:[^"\\]|\\.)+)""#,
        r#""provider"\s*:\s*"((?:[^"\\]|\\.)+)""#,
        r#"carrier["':]\s*["']([^"']+)["']"#,
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("invalid carrier regex"))
    .collect()
});

static COUNTRY_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r#""country"\s*:\s*"((?:[^"\\]|\\.)+)""#,
        r#""countryName"\s*:\s*"((?:[^"\\]|\\.)+)""#,
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("invalid country regex"))
    .collect()
});

static TAG_LISTS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [r#""tags"\s*:\s*\[([^\]]+)\]"#, r#""tagList"\s*:\s*\[([^\]]+)\]"#]
        .iter()
        .map(|pattern| Regex::new(pattern).expect("invalid tag list regex"))
        .collect()
});

static TAG_ITEM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""tag"\s*:\s*"((?:[^"\\]|\\.)+)""#).expect("invalid tag regex"));

static QUOTED_ITEM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""([^"]{2,50})""#).expect("invalid quoted item regex"));

static BODY: Lazy<Option<Selector>> = Lazy::new(|| Selector::parse("body").ok());

static DOM_SELECTORS: Lazy<Vec<Selector>> = Lazy::new(|| {
    [
        "[class*=\"name\"]",
        "[class*=\"title\"]",
        "[class*=\"profile\"]",
        "[class*=\"result\"]",
        "[class*=\"card\"]",
        "h1",
        "h2",
        "h3",
    ]
    .iter()
    .filter_map(|selector| Selector::parse(selector).ok())
    .collect()
});

/// Words that mark page chrome around a challenge rather than a result.
const CHALLENGE_WORDS: &[&str] = &["captcha", "cookie", "robot", "verify"];

const NULLISH: &[&str] = &["null", "undefined", "unknown", "none"];

/// Decode JavaScript string escapes (`\uXXXX`, surrogate pairs, `\n`, `\/`).
pub fn unescape_js(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('u') => {
                let high = take_hex4(&mut chars);
                match high {
                    Some(high @ 0xD800..=0xDBFF) => {
                        let mut lookahead = chars.clone();
                        let low = match (lookahead.next(), lookahead.next()) {
                            (Some('\\'), Some('u')) => take_hex4(&mut lookahead),
                            _ => None,
                        };
                        match low {
                            Some(low @ 0xDC00..=0xDFFF) => {
                                chars = lookahead;
                                let code = 0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00);
                                out.extend(char::from_u32(code));
                            }
                            _ => out.push(char::REPLACEMENT_CHARACTER),
                        }
                    }
                    Some(code) => {
                        out.push(char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER))
                    }
                    None => out.push_str("\\u"),
                }
            }
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

fn take_hex4<I>(chars: &mut std::iter::Peekable<I>) -> Option<u32>
where
    I: Iterator<Item = char> + Clone,
{
    let mut lookahead = chars.clone();
    let digits: String = (0..4).filter_map(|_| lookahead.next()).collect();
    if digits.len() != 4 {
        return None;
    }
    let value = u32::from_str_radix(&digits, 16).ok()?;
    *chars = lookahead;
    Some(value)
}

/// Undo the JSON escaping photo URLs carry when lifted from page sources.
pub fn unescape_url(raw: &str) -> String {
    raw.replace("\\u0026", "&").replace("\\/", "/")
}

/// Unescape, repair and trim a raw captured value. Placeholders yield `None`.
pub fn clean_field(raw: &str) -> Option<String> {
    let unescaped = unescape_js(raw);
    let repaired = mojibake::repair(unescaped.trim());
    let value = repaired.trim();
    if value.is_empty() || NULLISH.contains(&value.to_lowercase().as_str()) {
        return None;
    }
    Some(value.to_string())
}

/// Strings made only of phone punctuation and digits.
pub fn is_phone_like(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.starts_with('+') {
        return true;
    }
    let compact: String = trimmed
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')'))
        .collect();
    !compact.is_empty() && compact.chars().all(|c| c.is_ascii_digit())
}

fn first_capture(patterns: &[Regex], html: &str) -> Vec<String> {
    patterns
        .iter()
        .filter_map(|pattern| pattern.captures(html))
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// Name from embedded structured fields, first acceptable variant wins.
pub fn structured_name(html: &str, rules: &NormalizerRules) -> Option<String> {
    first_capture(&NAME_PATTERNS, html)
        .into_iter()
        .filter_map(|raw| clean_field(&raw))
        .find(|name| name.chars().count() > 1 && !rules.is_stop_word(name))
}

/// Name from visible page elements.
pub fn dom_name(html: &str, rules: &NormalizerRules) -> Option<String> {
    let document = Html::parse_document(html);
    for selector in DOM_SELECTORS.iter() {
        for element in document.select(selector) {
            let text = element.text().collect::<Vec<_>>().join(" ");
            let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
            let text = mojibake::repair(&text).into_owned();
            if acceptable_dom_text(&text, rules) {
                return Some(text);
            }
        }
    }
    None
}

fn acceptable_dom_text(text: &str, rules: &NormalizerRules) -> bool {
    let len = text.chars().count();
    if !(2..=100).contains(&len) {
        return false;
    }
    if rules.is_stop_word(text) || is_phone_like(text) {
        return false;
    }
    let lower = text.to_lowercase();
    if CHALLENGE_WORDS.iter().any(|word| lower.contains(word)) {
        return false;
    }
    text.chars().any(char::is_alphabetic)
}

/// Operator from structured fields, then a known-operator substring scan.
pub fn carrier(html: &str, rules: &NormalizerRules) -> Option<String> {
    if let Some(found) = first_capture(&CARRIER_PATTERNS, html)
        .into_iter()
        .find_map(|raw| clean_field(&raw))
    {
        return Some(found);
    }
    let lower = html.to_lowercase();
    rules
        .known_operators
        .iter()
        .find(|op| lower.contains(&op.to_lowercase()))
        .cloned()
}

pub fn country(html: &str, rules: &NormalizerRules) -> Option<String> {
    if let Some(found) = first_capture(&COUNTRY_PATTERNS, html)
        .into_iter()
        .find_map(|raw| clean_field(&raw))
    {
        return Some(found);
    }
    let lower = html.to_lowercase();
    rules
        .countries
        .iter()
        .find(|entry| entry.keywords.iter().any(|kw| lower.contains(&kw.to_lowercase())))
        .map(|entry| entry.country.clone())
}

/// Tags from the first structured list that yields anything usable.
pub fn tags(html: &str, rules: &NormalizerRules) -> Vec<String> {
    for list in TAG_LISTS.iter() {
        let Some(body) = list.captures(html).and_then(|caps| caps.get(1)) else {
            continue;
        };
        let body = body.as_str();
        let mut items: Vec<String> = TAG_ITEM
            .captures_iter(body)
            .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
            .collect();
        if items.is_empty() {
            items = QUOTED_ITEM
                .captures_iter(body)
                .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
                .collect();
        }

        let mut clean = Vec::new();
        for raw in items {
            let Some(tag) = clean_field(&raw) else {
                continue;
            };
            if tag.chars().count() <= 1
                || rules.is_stop_word(&tag)
                || tag.chars().all(|c| c.is_ascii_digit() || c.is_whitespace())
                || clean.contains(&tag)
            {
                continue;
            }
            clean.push(tag);
            if clean.len() >= rules.max_tags {
                break;
            }
        }
        if !clean.is_empty() {
            return clean;
        }
    }
    Vec::new()
}

/// Visible text of a document, whitespace-collapsed. Script and style
/// contents are skipped.
pub fn body_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let root = BODY
        .as_ref()
        .and_then(|selector| document.select(selector).next())
        .unwrap_or_else(|| document.root_element());

    let mut parts = Vec::new();
    for node in root.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .parent()
            .and_then(|parent| parent.value().as_element().map(|el| el.name()))
            .is_some_and(|name| matches!(name, "script" | "style" | "noscript"));
        if !hidden {
            parts.push(&**text);
        }
    }
    parts.join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}
