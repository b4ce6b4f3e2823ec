//! Dot-segmented wildcard patterns for grouping metrics.
//!
//! A metric name such as `stats.web1.requests` is split into segments on
//! `.`. A pattern has the same shape, where a `*` segment matches any single
//! name segment. Segment counts must be equal: `stats.*` never matches
//! `stats.web1.requests`.

use std::fmt;

/// The single-segment wildcard.
pub const WILDCARD: &str = "*";

/// Splits a metric name into its dot-separated segments.
///
/// # Examples
///
/// ```rust
/// use almaz::pattern::split_name;
///
/// assert_eq!(split_name("stats.web1.requests"), vec!["stats", "web1", "requests"]);
/// ```
pub fn split_name(name: &str) -> Vec<String> {
    name.split('.').map(str::to_string).collect()
}

/// Checks whether `pattern` matches `name`, segment by segment.
///
/// Both sequences must have the same length. A `*` segment in the pattern
/// matches any name segment; every other segment must be equal.
pub fn matches_segments<P, N>(pattern: &[P], name: &[N]) -> bool
where
    P: AsRef<str>,
    N: AsRef<str>,
{
    pattern.len() == name.len()
        && pattern.iter().zip(name).all(|(p, n)| {
            let p = p.as_ref();
            p == WILDCARD || p == n.as_ref()
        })
}

/// A parsed wildcard pattern.
///
/// # Examples
///
/// ```rust
/// use almaz::pattern::{MetricPattern, split_name};
///
/// let pattern = MetricPattern::parse("stats.*.requests");
/// assert!(pattern.matches(&split_name("stats.web1.requests")));
/// assert!(!pattern.matches(&split_name("stats.web1.errors")));
/// assert!(!pattern.matches(&split_name("stats.web1.requests.total")));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricPattern {
    raw: String,
    segments: Vec<String>,
}

impl MetricPattern {
    /// Parses a pattern string. Every string is a valid pattern.
    pub fn parse(pattern: &str) -> Self {
        Self {
            raw: pattern.to_string(),
            segments: split_name(pattern),
        }
    }

    /// Returns the pattern text as given.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Returns the pattern's segments.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Checks whether a metric's segments match this pattern.
    pub fn matches<N: AsRef<str>>(&self, name_segments: &[N]) -> bool {
        matches_segments(&self.segments, name_segments)
    }
}

impl fmt::Display for MetricPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<&str> for MetricPattern {
    fn from(pattern: &str) -> Self {
        Self::parse(pattern)
    }
}
