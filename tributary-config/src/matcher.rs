use regex::Regex;
use serde::Deserialize;

/// An error building a matcher from configuration.
#[derive(Debug, thiserror::Error)]
pub enum MatcherError {
    /// The matcher's regex does not compile.
    #[error("invalid matcher regex: {0}")]
    Regex(#[from] regex::Error),
}

/// How a [`NameMatcher`] compares against a metric name.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NameMatcherKind {
    /// Matches every name.
    Any,
    /// Matches the exact name.
    Exact,
    /// Matches names starting with the value.
    Prefix,
    /// Matches names against a regex.
    Regex,
}

/// Matches metric names in sink routing rules.
#[derive(Clone, Debug, Deserialize)]
#[serde(try_from = "NameMatcherConfig")]
pub struct NameMatcher {
    kind: NameMatcherKind,
    value: String,
    regex: Option<Regex>,
}

#[derive(Debug, Deserialize)]
struct NameMatcherConfig {
    kind: NameMatcherKind,
    #[serde(default)]
    value: String,
}

impl TryFrom<NameMatcherConfig> for NameMatcher {
    type Error = MatcherError;

    fn try_from(config: NameMatcherConfig) -> Result<Self, Self::Error> {
        NameMatcher::new(config.kind, config.value)
    }
}

impl NameMatcher {
    /// Creates a matcher, compiling the regex for regex matchers.
    pub fn new(kind: NameMatcherKind, value: impl Into<String>) -> Result<Self, MatcherError> {
        let value = value.into();
        let regex = match kind {
            NameMatcherKind::Regex => Some(Regex::new(&value)?),
            _ => None,
        };

        Ok(Self { kind, value, regex })
    }

    /// A matcher that matches every name.
    pub fn any() -> Self {
        Self {
            kind: NameMatcherKind::Any,
            value: String::new(),
            regex: None,
        }
    }

    /// Returns `true` if the metric name matches.
    pub fn matches(&self, name: &str) -> bool {
        match self.kind {
            NameMatcherKind::Any => true,
            NameMatcherKind::Exact => name == self.value,
            NameMatcherKind::Prefix => name.starts_with(&self.value),
            NameMatcherKind::Regex => match &self.regex {
                Some(regex) => regex.is_match(name),
                None => false,
            },
        }
    }
}

impl PartialEq for NameMatcher {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.value == other.value
    }
}

/// How a [`TagMatcher`] compares against a tag.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TagMatcherKind {
    /// Matches the exact tag.
    Exact,
    /// Matches tags starting with the value.
    Prefix,
    /// Matches tags against a regex.
    Regex,
}

/// Matches tags in sink routing and strip rules.
///
/// A tag matcher is applied to whole tags in their `k:v` form.
#[derive(Clone, Debug, Deserialize)]
#[serde(try_from = "TagMatcherConfig")]
pub struct TagMatcher {
    kind: TagMatcherKind,
    value: String,
    regex: Option<Regex>,
}

#[derive(Debug, Deserialize)]
struct TagMatcherConfig {
    kind: TagMatcherKind,
    #[serde(default)]
    value: String,
}

impl TryFrom<TagMatcherConfig> for TagMatcher {
    type Error = MatcherError;

    fn try_from(config: TagMatcherConfig) -> Result<Self, Self::Error> {
        TagMatcher::new(config.kind, config.value)
    }
}

impl TagMatcher {
    /// Creates a matcher, compiling the regex for regex matchers.
    pub fn new(kind: TagMatcherKind, value: impl Into<String>) -> Result<Self, MatcherError> {
        let value = value.into();
        let regex = match kind {
            TagMatcherKind::Regex => Some(Regex::new(&value)?),
            _ => None,
        };

        Ok(Self { kind, value, regex })
    }

    /// Returns `true` if the tag matches.
    pub fn matches(&self, tag: &str) -> bool {
        match self.kind {
            TagMatcherKind::Exact => tag == self.value,
            TagMatcherKind::Prefix => tag.starts_with(&self.value),
            TagMatcherKind::Regex => match &self.regex {
                Some(regex) => regex.is_match(tag),
                None => false,
            },
        }
    }

    /// Returns `true` if any of the tags matches.
    pub fn matches_any(&self, tags: &[String]) -> bool {
        tags.iter().any(|tag| self.matches(tag))
    }
}

impl PartialEq for TagMatcher {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.value == other.value
    }
}
