// hospital-messaging-core/src/routing.rs
//! Routing-key vocabulary shared by every participant, and the topic matcher
//! used wherever the exchange has to be modelled in-process.
//!
//! Keys are `.`-separated words. In binding patterns `*` stands for exactly
//! one word and `#` for zero or more words.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::MessagingError;

/// Administrator → every worker.
pub const INFO_KEY: &str = "hosp.info";
/// Worker → administrator.
pub const LOG_KEY: &str = "hosp.log";
/// Matches every routing key; used for sniffing.
pub const SNIFF_ALL: &str = "#";
/// Prefix of the requester → processor dispatch keys.
pub const REQUEST_PREFIX: &str = "specialist";

/// A processor category, always exactly one routing word.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Specialization(String);

impl Specialization {
    pub const KNEE: &'static str = "knee";
    pub const HIP: &'static str = "hip";
    pub const ELBOW: &'static str = "elbow";

    pub fn new(kind: impl Into<String>) -> Result<Self, MessagingError> {
        let kind = kind.into();
        let reason = if kind.is_empty() {
            Some("must not be empty")
        } else if kind.contains('.') {
            Some("must be a single word")
        } else if kind.contains(['*', '#']) {
            Some("must not contain wildcards")
        } else if kind.chars().any(char::is_whitespace) {
            Some("must not contain whitespace")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(MessagingError::InvalidRoutingKey { key: kind, reason }),
            None => Ok(Self(kind)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The kinds accepted by the stock front ends.
    pub fn defaults() -> Vec<Specialization> {
        [Self::KNEE, Self::HIP, Self::ELBOW]
            .into_iter()
            .map(|k| Self(k.to_string()))
            .collect()
    }
}

impl fmt::Display for Specialization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Specialization {
    type Error = MessagingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Specialization> for String {
    fn from(value: Specialization) -> Self {
        value.0
    }
}

/// `specialist.<kind>`
pub fn request_key(kind: &Specialization) -> String {
    format!("{REQUEST_PREFIX}.{kind}")
}

/// Checks that `pattern` is a well-formed binding pattern: no empty words and
/// wildcards only as whole words.
pub fn validate_pattern(pattern: &str) -> Result<(), MessagingError> {
    if pattern.is_empty() {
        return Err(MessagingError::InvalidRoutingKey {
            key: pattern.to_string(),
            reason: "pattern must not be empty",
        });
    }
    for word in pattern.split('.') {
        if word.is_empty() {
            return Err(MessagingError::InvalidRoutingKey {
                key: pattern.to_string(),
                reason: "empty word",
            });
        }
        if word.len() > 1 && word.contains(['*', '#']) {
            return Err(MessagingError::InvalidRoutingKey {
                key: pattern.to_string(),
                reason: "wildcards must stand alone",
            });
        }
    }
    Ok(())
}

/// Topic-exchange match of `key` against a binding `pattern`.
pub fn matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&head, tail)) => (word == "*" || word == head) && matches_words(rest, tail),
            None => false,
        },
    }
}
