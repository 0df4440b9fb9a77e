//! Topic filter matching and validation
//!
//! Filters follow MQTT wildcard rules: `+` stands for exactly one non-empty
//! level and a trailing `#` for the parent level plus any number of children.
//! Matching is always anchored on both ends.

use crate::error::BridgeError;
use once_cell::sync::Lazy;
use regex::Regex;

/// Allowed wildcard placement for subscription filters
static FILTER_GRAMMAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(#$|(\+|[^+#]*)(/(\+|[^+#]*))*(/(\+|#|[^+#]*))?$)")
        .expect("valid filter grammar")
});

#[derive(Debug, Clone)]
enum Pattern {
    Everything,
    Compiled(Regex),
    Exact(String),
}

/// A subscription filter compiled once and matched against many topics
#[derive(Debug, Clone)]
pub struct TopicMatcher {
    filter: String,
    pattern: Pattern,
}

impl TopicMatcher {
    pub fn new(filter: &str) -> Self {
        let pattern = if filter == "#" {
            Pattern::Everything
        } else {
            match Regex::new(&filter_to_pattern(filter)) {
                Ok(regex) => Pattern::Compiled(regex),
                Err(e) => {
                    tracing::warn!(filter, error = %e, "Filter too complex, falling back to exact match");
                    Pattern::Exact(filter.to_string())
                }
            }
        };

        Self {
            filter: filter.to_string(),
            pattern,
        }
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub fn matches(&self, topic: &str) -> bool {
        match &self.pattern {
            Pattern::Everything => true,
            Pattern::Compiled(regex) => regex.is_match(topic),
            Pattern::Exact(filter) => filter == topic,
        }
    }
}

/// One-shot match of `topic` against `filter`
pub fn matches(filter: &str, topic: &str) -> bool {
    TopicMatcher::new(filter).matches(topic)
}

/// Translate a filter into an anchored regular expression (pure function)
fn filter_to_pattern(filter: &str) -> String {
    let (body, multi_level) = match filter.strip_suffix("/#") {
        Some(prefix) => (prefix, true),
        None => (filter, false),
    };

    let levels: Vec<String> = body
        .split('/')
        .map(|level| {
            if level == "+" {
                "[^/]+".to_string()
            } else {
                regex::escape(level)
            }
        })
        .collect();

    let mut pattern = format!("^{}", levels.join("/"));
    if multi_level {
        pattern.push_str("(/.*)?");
    }
    pattern.push('$');
    pattern
}

/// Check wildcard placement of a subscription filter
pub fn validate_filter(filter: &str) -> Result<(), BridgeError> {
    if FILTER_GRAMMAR.is_match(filter) {
        Ok(())
    } else {
        Err(BridgeError::topic_invalid(filter))
    }
}

/// Check that a publish topic is non-empty and wildcard free
pub fn validate_publish_topic(topic: &str) -> Result<(), BridgeError> {
    if topic.is_empty() || topic.contains(['+', '#']) {
        Err(BridgeError::topic_invalid(topic))
    } else {
        Ok(())
    }
}
