// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topic Routing Keys
//!
//! Routing keys are dot-separated words. Binding keys use the same shape and
//! may contain two wildcards: `*` matches exactly one word, `#` matches zero
//! or more words.

use crate::errors::AmqpError;

/// Binding key matching every routing key.
pub const MATCH_ALL: &str = "#";

/// AMQP short strings are length-prefixed with a single octet.
pub const MAX_KEY_LENGTH: usize = 255;

const SINGLE_WORD: &str = "*";
const ANY_WORDS: &str = "#";

/// Checks a routing key before it is used for publishing.
///
/// `*` and `#` have no special meaning in a routing key and are sent as
/// literal words.
pub fn validate_routing_key(key: &str) -> Result<(), AmqpError> {
    if key.len() > MAX_KEY_LENGTH {
        return Err(AmqpError::InvalidRoutingKey(key.to_owned()));
    }

    Ok(())
}

pub fn validate_binding_key(key: &str) -> Result<(), AmqpError> {
    if key.len() > MAX_KEY_LENGTH {
        return Err(AmqpError::InvalidBindingKey(key.to_owned()));
    }

    Ok(())
}

/// Returns true when `routing_key` would be routed to a queue bound with `binding_key`.
pub fn matches(binding_key: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = binding_key.split('.').collect();
    let words: Vec<&str> = routing_key.split('.').collect();

    matches_words(&pattern, &words)
}

fn matches_words(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&ANY_WORDS, rest)) => (0..=words.len()).any(|skip| matches_words(rest, &words[skip..])),
        Some((&SINGLE_WORD, rest)) => !words.is_empty() && matches_words(rest, &words[1..]),
        Some((word, rest)) => words.first() == Some(word) && matches_words(rest, &words[1..]),
    }
}
