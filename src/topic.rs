//! MQTT topic name and topic filter rules
//!
//! Topic names (publish targets) must be non-empty and wildcard-free.
//! Topic filters (subscriptions) may use `+` for a single level and `#`
//! as the final level only.

use thiserror::Error;

/// Maximum encoded length of an MQTT topic
pub const MAX_TOPIC_LEN: usize = 65_535;

/// Topic validation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("Topic cannot be empty")]
    Empty,
    #[error("Topic exceeds {MAX_TOPIC_LEN} bytes")]
    TooLong,
    #[error("Topic contains a NUL character")]
    NulCharacter,
    #[error("Topic name '{0}' must not contain wildcards")]
    WildcardInName(String),
    #[error("Invalid wildcard placement in filter '{0}'")]
    InvalidWildcard(String),
}

fn validate_common(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(TopicError::TooLong);
    }
    if topic.contains('\0') {
        return Err(TopicError::NulCharacter);
    }
    Ok(())
}

/// Validate a topic used for publishing
pub fn validate_topic_name(topic: &str) -> Result<(), TopicError> {
    validate_common(topic)?;
    if topic.contains(['+', '#']) {
        return Err(TopicError::WildcardInName(topic.to_string()));
    }
    Ok(())
}

/// Validate a topic filter used for (un)subscribing
pub fn validate_topic_filter(filter: &str) -> Result<(), TopicError> {
    validate_common(filter)?;

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (index, level) in levels.iter().enumerate() {
        let bad_multi = level.contains('#') && (*level != "#" || index != last);
        let bad_single = level.contains('+') && *level != "+";
        if bad_multi || bad_single {
            return Err(TopicError::InvalidWildcard(filter.to_string()));
        }
    }
    Ok(())
}

/// Check whether a concrete topic matches a subscription filter
///
/// Topics starting with `$` are not matched by leading wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_topic_name_rules() {
        assert!(validate_topic_name("channels/2643660/publish/fields/field1").is_ok());
        assert_eq!(validate_topic_name(""), Err(TopicError::Empty));
        assert!(matches!(
            validate_topic_name("a/+/b"),
            Err(TopicError::WildcardInName(_))
        ));
        assert!(matches!(
            validate_topic_name("a/#"),
            Err(TopicError::WildcardInName(_))
        ));
        assert_eq!(validate_topic_name("a\0b"), Err(TopicError::NulCharacter));
    }

    #[test]
    fn test_topic_filter_rules() {
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("+").is_ok());
        assert!(validate_topic_filter("a/+/c").is_ok());
        assert!(validate_topic_filter("a/b/#").is_ok());
        assert!(validate_topic_filter("/").is_ok());

        assert!(validate_topic_filter("a/#/c").is_err());
        assert!(validate_topic_filter("a/b#").is_err());
        assert!(validate_topic_filter("a/b+/c").is_err());
        assert_eq!(validate_topic_filter(""), Err(TopicError::Empty));
    }

    #[test]
    fn test_topic_too_long() {
        let long = "a".repeat(MAX_TOPIC_LEN + 1);
        assert_eq!(validate_topic_name(&long), Err(TopicError::TooLong));
    }

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("a/b/c", "a/b/c"));
        assert!(topic_matches("a/+/c", "a/b/c"));
        assert!(topic_matches("a/#", "a/b/c"));
        assert!(topic_matches("a/#", "a"));
        assert!(topic_matches("#", "anything/at/all"));

        assert!(!topic_matches("a/+/c", "a/b/d"));
        assert!(!topic_matches("a/b", "a/b/c"));
        assert!(!topic_matches("a/b/c", "a/b"));
        assert!(!topic_matches("+", "a/b"));
    }

    #[test]
    fn test_system_topics_skip_leading_wildcards() {
        assert!(!topic_matches("#", "$SYS/broker/uptime"));
        assert!(!topic_matches("+/broker/uptime", "$SYS/broker/uptime"));
        assert!(topic_matches("$SYS/#", "$SYS/broker/uptime"));
    }

    proptest! {
        #[test]
        fn valid_names_match_themselves(topic in "[a-z0-9]{1,8}(/[a-z0-9]{1,8}){0,5}") {
            prop_assert!(validate_topic_name(&topic).is_ok());
            prop_assert!(validate_topic_filter(&topic).is_ok());
            prop_assert!(topic_matches(&topic, &topic));
        }

        #[test]
        fn multi_level_wildcard_matches_descendants(
            prefix in "[a-z]{1,6}",
            rest in "[a-z0-9]{1,6}(/[a-z0-9]{1,6}){0,4}",
        ) {
            let filter = format!("{prefix}/#");
            let topic = format!("{prefix}/{rest}");
            prop_assert!(validate_topic_filter(&filter).is_ok());
            prop_assert!(topic_matches(&filter, &topic));
        }

        #[test]
        fn names_with_wildcards_are_rejected(
            head in "[a-z]{0,6}",
            wildcard in prop::sample::select(vec!['+', '#']),
            tail in "[a-z]{0,6}",
        ) {
            let topic = format!("{head}{wildcard}{tail}");
            prop_assert!(validate_topic_name(&topic).is_err());
        }
    }
}
