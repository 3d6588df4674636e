//! Topic template engine.
//!
//! Patterns are slash-separated labels where each label is either a literal or
//! a `{token}` placeholder, e.g. `vehicles/{vehicleId}/command/{commandName}`.
//! Tokens resolve from two disjoint maps: *constant* values bound at envoy
//! construction and *transient* values bound per call.  Building a publish
//! topic requires every token to resolve; building a subscription filter turns
//! each unresolved token into a single-level `+` wildcard.

use crate::error::{Error, ErrorKind, Result};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Token(String),
}

/// A parsed, validated topic pattern plus its constant token bindings.
#[derive(Debug, Clone)]
pub struct TopicPattern {
    pattern: String,
    segments: Vec<Segment>,
    constants: HashMap<String, String>,
}

fn valid_label_char(c: char) -> bool {
    c.is_ascii_graphic() && !matches!(c, '"' | '+' | '#' | '{' | '}' | '/')
}

fn valid_label(label: &str) -> bool {
    !label.is_empty() && label.chars().all(valid_label_char)
}

/// A token replacement: one valid label or a slash-separated run of them.
pub(crate) fn valid_replacement(value: &str) -> bool {
    !value.is_empty() && value.split('/').all(valid_label)
}

fn invalid_pattern(pattern: &str, detail: &str) -> Error {
    Error::shallow(
        ErrorKind::ConfigurationInvalid,
        format!("invalid topic pattern {pattern:?}: {detail}"),
    )
}

impl TopicPattern {
    /// Parse and validate `pattern`, binding `constants` for the lifetime of
    /// the pattern.
    pub fn new(pattern: &str, constants: HashMap<String, String>) -> Result<Self> {
        if pattern.is_empty() {
            return Err(invalid_pattern(pattern, "empty"));
        }
        if pattern.starts_with('/') || pattern.ends_with('/') {
            return Err(invalid_pattern(pattern, "leading or trailing slash"));
        }

        let mut segments = Vec::new();
        for (position, label) in pattern.split('/').enumerate() {
            if label.is_empty() {
                return Err(invalid_pattern(pattern, "empty label"));
            }
            if position == 0 && label.starts_with('$') {
                return Err(invalid_pattern(pattern, "first label starts with '$'"));
            }
            if let Some(name) = label.strip_prefix('{') {
                let Some(name) = name.strip_suffix('}') else {
                    return Err(invalid_pattern(pattern, "unmatched brace"));
                };
                if !valid_label(name) {
                    return Err(invalid_pattern(pattern, "invalid token name"));
                }
                if segments.iter().any(|s| matches!(s, Segment::Token(n) if n == name)) {
                    return Err(invalid_pattern(pattern, "duplicate token"));
                }
                segments.push(Segment::Token(name.to_owned()));
            } else {
                if !valid_label(label) {
                    return Err(invalid_pattern(pattern, "disallowed character"));
                }
                segments.push(Segment::Literal(label.to_owned()));
            }
        }

        for (name, value) in &constants {
            if !valid_replacement(value) {
                return Err(invalid_pattern(
                    pattern,
                    &format!("constant token {name:?} has invalid replacement {value:?}"),
                ));
            }
        }

        Ok(TopicPattern { pattern: pattern.to_owned(), segments, constants })
    }

    /// The pattern string as given.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Token names in pattern order.
    pub fn token_names(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Token(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    fn lookup<'a>(
        &'a self,
        name: &str,
        transient: &'a HashMap<String, String>,
    ) -> Option<&'a str> {
        transient.get(name).or_else(|| self.constants.get(name)).map(String::as_str)
    }

    /// Resolve the pattern into a concrete publish topic.
    ///
    /// Every token must resolve through the transient map or the constants;
    /// an unresolved token or an invalid replacement value is an error.
    pub fn publish_topic(&self, transient: &HashMap<String, String>) -> Result<String> {
        let mut levels = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(lit) => levels.push(lit.as_str()),
                Segment::Token(name) => {
                    let value = self.lookup(name, transient).ok_or_else(|| {
                        Error::shallow(
                            ErrorKind::ArgumentInvalid,
                            format!("token {name:?} unresolved in pattern {:?}", self.pattern),
                        )
                    })?;
                    if !valid_replacement(value) {
                        return Err(Error::shallow(
                            ErrorKind::ArgumentInvalid,
                            format!("token {name:?} has invalid replacement {value:?}"),
                        ));
                    }
                    levels.push(value);
                }
            }
        }
        Ok(levels.join("/"))
    }

    /// Derive the subscription filter: constants are substituted, every other
    /// token becomes a single-level `+` wildcard.
    pub fn subscribe_filter(&self) -> String {
        let levels: Vec<&str> = self
            .segments
            .iter()
            .map(|segment| match segment {
                Segment::Literal(lit) => lit.as_str(),
                Segment::Token(name) => {
                    self.constants.get(name).map_or("+", String::as_str)
                }
            })
            .collect();
        levels.join("/")
    }

    /// Match a concrete inbound topic against the pattern, extracting the
    /// token values by position.  Constant-bound tokens must match their bound
    /// value; unbound tokens capture exactly one level.
    pub fn match_topic(&self, topic: &str) -> Option<HashMap<String, String>> {
        let levels: Vec<&str> = topic.split('/').collect();
        let mut tokens = HashMap::new();
        let mut at = 0usize;
        for segment in &self.segments {
            match segment {
                Segment::Literal(lit) => {
                    if levels.get(at) != Some(&lit.as_str()) {
                        return None;
                    }
                    at += 1;
                }
                Segment::Token(name) => match self.constants.get(name) {
                    Some(bound) => {
                        // Constant replacements may span multiple levels.
                        let span = bound.split('/').count();
                        if levels.len() < at + span || levels[at..at + span].join("/") != *bound {
                            return None;
                        }
                        tokens.insert(name.clone(), bound.clone());
                        at += span;
                    }
                    None => {
                        let level = levels.get(at)?;
                        if level.is_empty() {
                            return None;
                        }
                        tokens.insert(name.clone(), (*level).to_owned());
                        at += 1;
                    }
                },
            }
        }
        if at != levels.len() {
            return None;
        }
        Some(tokens)
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)
    }
}

// ---------------------------------------------------------------------------
// MQTT filter matching
// ---------------------------------------------------------------------------

/// Standard MQTT topic-filter matching.
///
/// `+` matches one level, a trailing `#` matches the remainder (including
/// zero levels).  Filters beginning with a wildcard never match topics whose
/// first level starts with `$`.
pub fn filter_matches(filter: &str, topic: &str) -> bool {
    if (filter.starts_with('+') || filter.starts_with('#')) && topic.starts_with('$') {
        return false;
    }
    let mut filter_levels = filter.split('/').peekable();
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            // "a/#" also matches "a" itself.
            (Some("#"), _) => return filter_levels.peek().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
