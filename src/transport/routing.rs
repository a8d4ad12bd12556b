//! Routing-key matching shared by every backend.
//!
//! Keys and patterns are dot-separated words. In topic patterns `*` matches
//! exactly one word and `#` matches zero or more words.

use crate::exchange::ExchangeType;

/// Check if a routing key matches an AMQP-style topic pattern.
///
/// Matching rules:
/// - "#" matches every key, including the empty key
/// - "orders.*" matches "orders.created" but not "orders" or "orders.a.b"
/// - "orders.#" matches "orders", "orders.created" and "orders.a.b"
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}

/// Check if a queue with the given bindings receives a message published with `routing_key`.
///
/// - FANOUT ignores the key and bindings
/// - DIRECT compares the key exactly; a queue with no bindings takes the empty key
/// - TOPIC applies `topic_matches`; a queue with no bindings takes everything
pub fn binding_matches(exchange_type: ExchangeType, bindings: &[String], routing_key: &str) -> bool {
    match exchange_type {
        ExchangeType::Fanout => true,
        ExchangeType::Direct => {
            if bindings.is_empty() {
                routing_key.is_empty()
            } else {
                bindings.iter().any(|b| b == routing_key)
            }
        }
        ExchangeType::Topic => {
            bindings.is_empty() || bindings.iter().any(|b| topic_matches(b, routing_key))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_exact_match() {
        assert!(topic_matches("orders.created", "orders.created"));
        assert!(!topic_matches("orders.created", "orders.updated"));
        assert!(!topic_matches("orders", "orders.created"));
    }

    #[test]
    fn test_topic_star_matches_one_word() {
        assert!(topic_matches("orders.*", "orders.created"));
        assert!(!topic_matches("orders.*", "orders"));
        assert!(!topic_matches("orders.*", "orders.created.eu"));
        assert!(topic_matches("*.created", "orders.created"));
    }

    #[test]
    fn test_topic_hash_matches_zero_or_more() {
        assert!(topic_matches("#", ""));
        assert!(topic_matches("#", "a.b.c"));
        assert!(topic_matches("orders.#", "orders"));
        assert!(topic_matches("orders.#", "orders.created.eu"));
        assert!(topic_matches("orders.#.eu", "orders.created.eu"));
        assert!(topic_matches("orders.#.eu", "orders.eu"));
        assert!(!topic_matches("orders.#.eu", "orders.created.us"));
    }

    #[test]
    fn test_direct_binding() {
        let bindings = vec!["alpha".to_string(), "beta".to_string()];
        assert!(binding_matches(ExchangeType::Direct, &bindings, "beta"));
        assert!(!binding_matches(ExchangeType::Direct, &bindings, "gamma"));
        assert!(binding_matches(ExchangeType::Direct, &[], ""));
        assert!(!binding_matches(ExchangeType::Direct, &[], "alpha"));
    }

    #[test]
    fn test_fanout_and_topic_catch_all() {
        assert!(binding_matches(ExchangeType::Fanout, &["x".to_string()], "anything"));
        assert!(binding_matches(ExchangeType::Topic, &[], "anything.at.all"));
        assert!(binding_matches(
            ExchangeType::Topic,
            &["jobs.*".to_string()],
            "jobs.cleanup"
        ));
    }
}
