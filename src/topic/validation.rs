//! Topic name and filter validation, and filter matching
//!
//! Key rules:
//! - Topic names MUST NOT contain wildcards (+ or #)
//! - Topic filters MAY contain wildcards
//! - Multi-level wildcard (#) must occupy the last level
//! - Single-level wildcard (+) must occupy an entire level
//! - Topics starting with $ are not matched by filters starting with a wildcard
//! - Matching is case-sensitive

use serde::{Deserialize, Serialize};

/// How empty levels (from leading, trailing or doubled `/`) take part in matching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentPolicy {
    /// Empty levels are real levels: `a//b` has three levels
    #[default]
    Preserve,
    /// Empty levels are discarded: `/a//b/` matches like `a/b`
    Collapse,
}

impl SegmentPolicy {
    /// Split a topic or filter into the levels this policy matches on
    pub fn levels(self, s: &str) -> impl Iterator<Item = &str> {
        let collapse = self == SegmentPolicy::Collapse;
        s.split('/').filter(move |level| !(collapse && level.is_empty()))
    }
}

/// Validate a topic name (used in PUBLISH)
///
/// Topic names:
/// - Must be at least 1 character
/// - Must not exceed 65535 bytes
/// - Must not contain null character
/// - Must not contain wildcards (+ or #)
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic name cannot be empty");
    }

    if topic.len() > 65535 {
        return Err("topic name exceeds maximum length");
    }

    if topic.contains('\0') {
        return Err("topic name cannot contain null character");
    }

    if topic.contains(['+', '#']) {
        return Err("topic name cannot contain wildcards");
    }

    Ok(())
}

/// Validate a topic filter (used in SUBSCRIBE/UNSUBSCRIBE)
///
/// Topic filters:
/// - Must be at least 1 character
/// - Must not exceed 65535 bytes
/// - Must not contain null character
/// - Multi-level wildcard (#) must be the whole of the last level
/// - Single-level wildcard (+) must occupy an entire level
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("topic filter cannot be empty");
    }

    if filter.len() > 65535 {
        return Err("topic filter exceeds maximum length");
    }

    if filter.contains('\0') {
        return Err("topic filter cannot contain null character");
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') {
            if level != "#" {
                return Err("multi-level wildcard must occupy entire level");
            }
            if levels.peek().is_some() {
                return Err("multi-level wildcard must be last level");
            }
        }

        if level.contains('+') && level != "+" {
            return Err("single-level wildcard must occupy entire level");
        }
    }

    Ok(())
}

/// Check if a topic filter matches a topic name, with empty levels preserved
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    topic_matches_filter_with(topic, filter, SegmentPolicy::Preserve)
}

/// Check if a topic filter matches a topic name
///
/// Matching rules:
/// - / is the level separator
/// - + matches exactly one level
/// - # matches zero or more remaining levels (must be last)
/// - any other level must be equal byte for byte
/// - the topic must not have levels left over once the filter is consumed
/// - $-topics don't match filters starting with + or #
pub fn topic_matches_filter_with(topic: &str, filter: &str, policy: SegmentPolicy) -> bool {
    let mut topic_levels = policy.levels(topic);
    let mut filter_levels = policy.levels(filter).peekable();

    // [MQTT-4.7.2-1]
    if topic.starts_with('$') && matches!(filter_levels.peek(), Some(&"+") | Some(&"#")) {
        return false;
    }

    for filter_level in filter_levels {
        if filter_level == "#" {
            // # matches everything remaining, including nothing
            return true;
        }

        match topic_levels.next() {
            // Filter has more non-# levels than the topic
            None => return false,
            Some(topic_level) => {
                if filter_level != "+" && filter_level != topic_level {
                    return false;
                }
            }
        }
    }

    // Both must be exhausted for a match
    topic_levels.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_validate_topic_name() {
        assert!(validate_topic_name("test").is_ok());
        assert!(validate_topic_name("test/topic").is_ok());
        assert!(validate_topic_name("/test/topic").is_ok());
        assert!(validate_topic_name("test/topic/").is_ok());

        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("test+topic").is_err());
        assert!(validate_topic_name("test#topic").is_err());
        assert!(validate_topic_name("test/+/topic").is_err());
        assert!(validate_topic_name("test/#").is_err());
        assert!(validate_topic_name("a\0b").is_err());
    }

    #[test]
    fn test_validate_topic_filter() {
        assert!(validate_topic_filter("test").is_ok());
        assert!(validate_topic_filter("test/topic").is_ok());
        assert!(validate_topic_filter("+").is_ok());
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("test/+").is_ok());
        assert!(validate_topic_filter("test/#").is_ok());
        assert!(validate_topic_filter("+/test").is_ok());
        assert!(validate_topic_filter("+/+/+").is_ok());
        assert!(validate_topic_filter("test/+/topic").is_ok());
        assert!(validate_topic_filter("/").is_ok());

        assert!(validate_topic_filter("").is_err());
        assert!(validate_topic_filter("test+").is_err());
        assert!(validate_topic_filter("test#").is_err());
        assert!(validate_topic_filter("test/#/more").is_err());
        assert!(validate_topic_filter("#/a").is_err());
        assert!(validate_topic_filter("+test").is_err());
    }

    #[test_case("a/b", "a/b", true ; "exact")]
    #[test_case("a/b", "a/+", true ; "single level wildcard")]
    #[test_case("a/b/c", "a/#", true ; "multi level wildcard")]
    #[test_case("a", "a/#", true ; "hash matches zero levels")]
    #[test_case("a/b/c", "a/+", false ; "plus is one level only")]
    #[test_case("a", "a/+", false ; "plus needs a level")]
    #[test_case("home/temperature", "home/humidity", false ; "different level")]
    #[test_case("A/b", "a/b", false ; "case sensitive")]
    #[test_case("a/b", "a/b/c", false ; "filter longer")]
    #[test_case("a/b/c", "a/b", false ; "topic longer")]
    #[test_case("x", "#", true ; "hash alone")]
    #[test_case("a/b/c", "+/b/+", true ; "plus both ends")]
    #[test_case("$SYS/test", "+/test", false ; "dollar vs plus")]
    #[test_case("$SYS/test", "#", false ; "dollar vs hash")]
    #[test_case("$SYS/test", "$SYS/+", true ; "dollar explicit")]
    #[test_case("$SYS/test", "$SYS/#", true ; "dollar explicit hash")]
    fn test_topic_matches(topic: &str, filter: &str, expected: bool) {
        assert_eq!(topic_matches_filter(topic, filter), expected);
        assert_eq!(
            topic_matches_filter_with(topic, filter, SegmentPolicy::Collapse),
            expected
        );
    }

    #[test]
    fn test_empty_levels_preserved() {
        assert!(topic_matches_filter("a//b", "a/+/b"));
        assert!(!topic_matches_filter("a//b", "a/b"));
        assert!(topic_matches_filter("/a", "+/a"));
        assert!(!topic_matches_filter("/a", "a"));
        assert!(topic_matches_filter("a/", "a/+"));
        assert!(!topic_matches_filter("a/", "a"));
    }

    #[test]
    fn test_empty_levels_collapsed() {
        let c = SegmentPolicy::Collapse;
        assert!(topic_matches_filter_with("a//b", "a/b", c));
        assert!(!topic_matches_filter_with("a//b", "a/+/b", c));
        assert!(topic_matches_filter_with("/a", "a", c));
        assert!(topic_matches_filter_with("a/", "a", c));
        assert!(topic_matches_filter_with("/a/b/", "a/+", c));
    }

    #[test]
    fn test_segment_policy_deserialize() {
        #[derive(Deserialize)]
        struct W {
            p: SegmentPolicy,
        }
        let w: W = toml::from_str("p = \"collapse\"").unwrap();
        assert_eq!(w.p, SegmentPolicy::Collapse);
        let w: W = toml::from_str("p = \"preserve\"").unwrap();
        assert_eq!(w.p, SegmentPolicy::Preserve);
    }
}
