//! Server-side filters for `$all` reads and subscriptions.

use regex::Regex;

use crate::error::{ClientError, ClientResult};

/// Which property of an event a filter looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterTarget {
    StreamId,
    EventType,
}

/// How a filter matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FilterExpression {
    /// Matches when the property starts with any of the prefixes.
    Prefix(Vec<String>),
    /// A regular expression evaluated by the server.
    Regex(String),
}

/// Restricts which events a `$all` read or subscription returns.
///
/// Filters are carried to the server as-is. The client only checks that a
/// regular expression compiles.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Filter {
    target: FilterTarget,
    expression: FilterExpression,
}

impl Filter {
    pub fn stream_id_prefix<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::prefix(FilterTarget::StreamId, prefixes)
    }

    pub fn stream_id_regex(pattern: impl Into<String>) -> Self {
        Self::regex(FilterTarget::StreamId, pattern)
    }

    pub fn event_type_prefix<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::prefix(FilterTarget::EventType, prefixes)
    }

    pub fn event_type_regex(pattern: impl Into<String>) -> Self {
        Self::regex(FilterTarget::EventType, pattern)
    }

    /// Skips events whose type starts with `$`.
    pub fn exclude_system_events() -> Self {
        Self::event_type_regex(r"^[^\$].*")
    }

    fn prefix<I, S>(target: FilterTarget, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            target,
            expression: FilterExpression::Prefix(prefixes.into_iter().map(Into::into).collect()),
        }
    }

    fn regex(target: FilterTarget, pattern: impl Into<String>) -> Self {
        Self {
            target,
            expression: FilterExpression::Regex(pattern.into()),
        }
    }

    pub fn target(&self) -> FilterTarget {
        self.target
    }

    pub fn expression(&self) -> &FilterExpression {
        &self.expression
    }

    /// Rejects filters that could never match anything, and patterns that do
    /// not compile.
    pub fn validate(&self) -> ClientResult<()> {
        match &self.expression {
            FilterExpression::Prefix(prefixes) if prefixes.is_empty() => Err(
                ClientError::InvalidArgument("prefix filter needs at least one prefix".to_string()),
            ),
            FilterExpression::Prefix(prefixes) if prefixes.iter().any(String::is_empty) => Err(
                ClientError::InvalidArgument("filter prefixes must not be empty".to_string()),
            ),
            FilterExpression::Regex(pattern) if pattern.is_empty() => Err(
                ClientError::InvalidArgument("filter regex must not be empty".to_string()),
            ),
            FilterExpression::Regex(pattern) => Regex::new(pattern).map(|_| ()).map_err(|e| {
                ClientError::InvalidArgument(format!("invalid filter regex {pattern:?}: {e}"))
            }),
            FilterExpression::Prefix(_) => Ok(()),
        }
    }
}
