//! Topic names and topic subscription filters.
//!
//! Topics are `/`-separated level strings (`"orders/eu/created"`). A
//! [`TopicFilter`] may use two wildcards:
//!
//! - `*` as a whole level matches exactly one level;
//! - `>` as the last level matches one or more remaining levels.
//!
//! A [`TopicName`] is a concrete publish destination and never contains
//! wildcard levels.

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

const SEPARATOR: char = '/';
const SINGLE_LEVEL: &str = "*";
const MULTI_LEVEL: &str = ">";

/// A concrete topic a message is published to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TopicName(String);

impl TopicName {
    /// Parses a publish destination.
    pub fn parse(value: impl Into<String>) -> Result<Self, ConfigError> {
        let value = value.into();
        validate_levels(&value)?;
        if value
            .split(SEPARATOR)
            .any(|level| level == SINGLE_LEVEL || level == MULTI_LEVEL)
        {
            return Err(ConfigError::InvalidTopic {
                topic: value,
                reason: "wildcards are only allowed in subscription filters".to_string(),
            });
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn levels(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEPARATOR)
    }
}

impl TryFrom<String> for TopicName {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<TopicName> for String {
    fn from(value: TopicName) -> Self {
        value.0
    }
}

impl std::fmt::Display for TopicName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------

/// A subscription filter bound to a queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TopicFilter(String);

impl TopicFilter {
    /// Parses a subscription filter, rejecting a `>` anywhere but the last level.
    pub fn parse(value: impl Into<String>) -> Result<Self, ConfigError> {
        let value = value.into();
        validate_levels(&value)?;
        let levels: Vec<&str> = value.split(SEPARATOR).collect();
        if let Some(position) = levels.iter().position(|level| *level == MULTI_LEVEL) {
            if position != levels.len() - 1 {
                return Err(ConfigError::InvalidTopic {
                    topic: value,
                    reason: "'>' must be the last level of a filter".to_string(),
                });
            }
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if a message published to `topic` is routed through this filter.
    pub fn matches(&self, topic: &TopicName) -> bool {
        let mut filter_levels = self.0.split(SEPARATOR);
        let mut topic_levels = topic.levels();

        loop {
            match (filter_levels.next(), topic_levels.next()) {
                // '>' needs at least one level left to swallow.
                (Some(MULTI_LEVEL), Some(_)) => return true,
                (Some(MULTI_LEVEL), None) => return false,
                (Some(SINGLE_LEVEL), Some(_)) => continue,
                (Some(expected), Some(actual)) if expected == actual => continue,
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

impl TryFrom<String> for TopicFilter {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<TopicFilter> for String {
    fn from(value: TopicFilter) -> Self {
        value.0
    }
}

impl std::fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn validate_levels(value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::InvalidTopic {
            topic: value.to_string(),
            reason: "topic must not be empty".to_string(),
        });
    }
    if value.split(SEPARATOR).any(str::is_empty) {
        return Err(ConfigError::InvalidTopic {
            topic: value.to_string(),
            reason: "topic levels must not be empty".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(value: &str) -> TopicName {
        TopicName::parse(value).unwrap()
    }

    fn filter(value: &str) -> TopicFilter {
        TopicFilter::parse(value).unwrap()
    }

    #[test]
    fn exact_filter_matches_only_same_topic() {
        assert!(filter("topic").matches(&topic("topic")));
        assert!(!filter("topic").matches(&topic("topic/sub")));
        assert!(!filter("topic/sub").matches(&topic("topic")));
    }

    #[test]
    fn single_level_wildcard_matches_one_level() {
        let f = filter("orders/*/created");
        assert!(f.matches(&topic("orders/eu/created")));
        assert!(!f.matches(&topic("orders/eu/west/created")));
        assert!(!f.matches(&topic("orders/created")));
    }

    #[test]
    fn multi_level_wildcard_needs_at_least_one_level() {
        let f = filter("orders/>");
        assert!(f.matches(&topic("orders/eu")));
        assert!(f.matches(&topic("orders/eu/west/created")));
        assert!(!f.matches(&topic("orders")));
    }

    #[test]
    fn multi_level_wildcard_must_be_last() {
        assert!(TopicFilter::parse("orders/>/created").is_err());
    }

    #[test]
    fn publish_topics_reject_wildcards_and_empty_levels() {
        assert!(TopicName::parse("orders/*").is_err());
        assert!(TopicName::parse("orders//created").is_err());
        assert!(TopicName::parse("").is_err());
    }
}
