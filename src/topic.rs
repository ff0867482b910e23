use crate::constants::limits::MAX_STRING_LENGTH;
use crate::error::{MqttError, Result};

fn is_encodable(value: &str) -> bool {
    !value.is_empty() && value.len() <= usize::from(MAX_STRING_LENGTH) && !value.contains('\0')
}

/// Topic names used in PUBLISH: non-empty and free of wildcards
#[must_use]
pub fn is_valid_topic_name(topic: &str) -> bool {
    is_encodable(topic) && !topic.contains(['+', '#'])
}

/// Topic filters used in SUBSCRIBE and UNSUBSCRIBE
///
/// `+` must fill a whole level; `#` must fill the last level.
#[must_use]
pub fn is_valid_topic_filter(filter: &str) -> bool {
    if !is_encodable(filter) {
        return false;
    }
    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        let last = levels.peek().is_none();
        match level {
            "+" => {}
            "#" if last => {}
            _ if level.contains(['+', '#']) => return false,
            _ => {}
        }
    }
    true
}

/// # Errors
///
/// Returns `InvalidTopicName` if `topic` cannot be published to
pub fn validate_topic_name(topic: &str) -> Result<()> {
    if is_valid_topic_name(topic) {
        Ok(())
    } else {
        Err(MqttError::InvalidTopicName(topic.to_string()))
    }
}

/// # Errors
///
/// Returns `InvalidTopicFilter` if `filter` is not a well-formed filter
pub fn validate_topic_filter(filter: &str) -> Result<()> {
    if is_valid_topic_filter(filter) {
        Ok(())
    } else {
        Err(MqttError::InvalidTopicFilter(filter.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names() {
        assert!(is_valid_topic_name("x/demo"));
        assert!(is_valid_topic_name("/"));
        assert!(is_valid_topic_name("sensors/7/temp"));

        assert!(!is_valid_topic_name(""));
        assert!(!is_valid_topic_name("sensors/+/temp"));
        assert!(!is_valid_topic_name("sensors/#"));
        assert!(!is_valid_topic_name("a\0b"));
        assert!(!is_valid_topic_name(&"a".repeat(usize::from(u16::MAX) + 1)));
    }

    #[test]
    fn test_topic_filters() {
        assert!(is_valid_topic_filter("x/demo"));
        assert!(is_valid_topic_filter("#"));
        assert!(is_valid_topic_filter("+"));
        assert!(is_valid_topic_filter("+/+/#"));
        assert!(is_valid_topic_filter("sensors/+/temp"));

        assert!(!is_valid_topic_filter(""));
        assert!(!is_valid_topic_filter("sensors/#/temp"));
        assert!(!is_valid_topic_filter("sensors#"));
        assert!(!is_valid_topic_filter("sensors/te+mp"));
    }

    #[test]
    fn test_validate_errors() {
        assert_eq!(
            validate_topic_name("a/#"),
            Err(MqttError::InvalidTopicName("a/#".to_string()))
        );
        assert_eq!(
            validate_topic_filter("a/#/b"),
            Err(MqttError::InvalidTopicFilter("a/#/b".to_string()))
        );
        assert!(validate_topic_filter("a/#").is_ok());
    }
}
