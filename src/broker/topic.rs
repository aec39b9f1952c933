//! Topic pattern matching.
//!
//! Patterns are dot-separated segments; `*` matches exactly one segment.
//! Multi-segment wildcards (`#`) are not part of the language and are
//! rejected at subscription time.

use super::BrokerError;

/// Match a concrete topic against a subscription pattern.
pub fn topic_matches(topic: &str, pattern: &str) -> bool {
    let topic_segments: Vec<&str> = topic.split('.').collect();
    let pattern_segments: Vec<&str> = pattern.split('.').collect();

    if topic_segments.len() != pattern_segments.len() {
        return false;
    }

    topic_segments
        .iter()
        .zip(pattern_segments.iter())
        .all(|(t, p)| *p == "*" || t == p)
}

/// Validate a subscription pattern.
pub fn validate_pattern(pattern: &str) -> Result<(), BrokerError> {
    if pattern.is_empty() {
        return Err(BrokerError::InvalidPattern("empty pattern".into()));
    }
    for segment in pattern.split('.') {
        if segment.is_empty() {
            return Err(BrokerError::InvalidPattern(format!(
                "empty segment in pattern '{}'",
                pattern
            )));
        }
        if segment == "#" {
            return Err(BrokerError::InvalidPattern(format!(
                "multi-segment wildcard '#' is not supported in '{}'",
                pattern
            )));
        }
    }
    Ok(())
}
