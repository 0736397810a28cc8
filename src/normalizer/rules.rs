//! Heuristic word lists used by the normalizer.
//!
//! Provider markup drifts, so every list lives in data and can be replaced
//! from JSON without a rebuild.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("failed to read rules file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid rules json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Country detected from a keyword in the page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryKeyword {
    pub keywords: Vec<String>,
    pub country: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerRules {
    /// UI chrome never accepted as a name or tag.
    pub stop_words: Vec<String>,
    pub hidden_phrases: Vec<String>,
    pub not_found_phrases: Vec<String>,
    /// Placeholder the provider shows right after some queries.
    pub unavailable_phrases: Vec<String>,
    pub known_operators: Vec<String>,
    pub countries: Vec<CountryKeyword>,
    /// Token looked for by the badge, image and isolated-word signals.
    pub spam_token: String,
    /// Severity values that mark a number as spam.
    pub spam_severities: Vec<String>,
    /// Category fragments that mark a caller as spam.
    pub spam_categories: Vec<String>,
    pub max_tags: usize,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for NormalizerRules {
    fn default() -> Self {
        Self {
            stop_words: strings(&[
                "we use cookies",
                "accept all",
                "getcontact",
                "search",
                "поиск",
                "назад",
                "позвонить",
                "блокировать",
                "россия (+7)",
                "главная",
                "premium",
                "войти",
                "sign in",
                "log in",
                "subscribe",
                "подписка",
                "тариф",
                "оплата",
                "download",
                "скачать",
                "app store",
                "google play",
            ]),
            hidden_phrases: strings(&[
                "не можем показать результат",
                "отказался быть видимым",
                "скрыл свой профиль",
                "hidden profile",
                "profile is hidden",
            ]),
            not_found_phrases: strings(&["not found", "не найден", "no results", "no information"]),
            unavailable_phrases: strings(&[
                "ещё не доступен",
                "еще не доступен",
                "not available yet",
            ]),
            known_operators: strings(&[
                "MegaFon",
                "Мегафон",
                "Tele2",
                "Теле2",
                "МТС",
                "MTS",
                "Билайн",
                "Beeline",
                "Yota",
                "Йота",
                "Ростелеком",
                "Rostelecom",
                "МГТС",
                "Мотив",
            ]),
            countries: vec![
                CountryKeyword {
                    keywords: strings(&["россия", "russia"]),
                    country: "Россия".into(),
                },
                CountryKeyword {
                    keywords: strings(&["украина", "ukraine"]),
                    country: "Украина".into(),
                },
                CountryKeyword {
                    keywords: strings(&["беларусь", "belarus"]),
                    country: "Беларусь".into(),
                },
                CountryKeyword {
                    keywords: strings(&["казахстан", "kazakhstan"]),
                    country: "Казахстан".into(),
                },
            ],
            spam_token: "spam".into(),
            spam_severities: strings(&["red", "orange", "yellow"]),
            spam_categories: strings(&["спам", "мошен", "spam", "fraud"]),
            max_tags: 50,
        }
    }
}

impl NormalizerRules {
    pub fn from_json(json: &str) -> Result<Self, RulesError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RulesError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub(crate) fn is_stop_word(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        self.stop_words.iter().any(|word| lower.contains(word.as_str()))
    }

    pub(crate) fn matches_any(phrases: &[String], lower_text: &str) -> bool {
        phrases
            .iter()
            .any(|phrase| lower_text.contains(&phrase.to_lowercase()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let rules = NormalizerRules::from_json(r#"{"max_tags": 5, "spam_token": "scam"}"#).unwrap();
        assert_eq!(rules.max_tags, 5);
        assert_eq!(rules.spam_token, "scam");
        assert_eq!(rules.stop_words, NormalizerRules::default().stop_words);
    }

    #[test]
    fn stop_words_match_case_insensitively() {
        let rules = NormalizerRules::default();
        assert!(rules.is_stop_word("Sign In to continue"));
        assert!(rules.is_stop_word("GetContact Premium"));
        assert!(!rules.is_stop_word("Марина"));
    }
}
