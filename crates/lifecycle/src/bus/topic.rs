//! Topic names and subscription patterns
//!
//! Topics are dot-separated tokens (`experiments.exp-1`). Patterns may use
//! `*` for exactly one token and a trailing `>` for one or more tokens.

use super::BusError;
use crate::experiment::ExperimentId;

pub const EXPERIMENTS_PREFIX: &str = "experiments";

/// Pattern matching every experiment topic
pub const ALL_EXPERIMENTS: &str = "experiments.>";

pub fn experiment_topic(experiment_id: &ExperimentId) -> String {
    format!("{EXPERIMENTS_PREFIX}.{experiment_id}")
}

/// Concrete topic: non-empty tokens, no wildcards
pub fn validate_topic(topic: &str) -> Result<(), BusError> {
    for token in topic.split('.') {
        if token.is_empty() || token == "*" || token == ">" || token.contains(char::is_whitespace)
        {
            return Err(BusError::InvalidTopic(topic.to_string()));
        }
    }
    Ok(())
}

pub fn validate_pattern(pattern: &str) -> Result<(), BusError> {
    let tokens: Vec<&str> = pattern.split('.').collect();
    for (i, token) in tokens.iter().enumerate() {
        let misplaced_tail = *token == ">" && i + 1 != tokens.len();
        if token.is_empty() || misplaced_tail || token.contains(char::is_whitespace) {
            return Err(BusError::InvalidTopic(pattern.to_string()));
        }
    }
    Ok(())
}

/// Pattern without wildcards, matching exactly one topic
pub fn is_literal(pattern: &str) -> bool {
    pattern.split('.').all(|token| token != "*" && token != ">")
}

pub fn matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut topic_tokens = topic.split('.');
    loop {
        match (pattern_tokens.next(), topic_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(t)) if p == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// POSIX regex equivalent of a pattern, for server-side filtering
pub fn pattern_regex(pattern: &str) -> String {
    let tokens: Vec<String> = pattern
        .split('.')
        .map(|token| match token {
            "*" => "[^.]+".to_string(),
            ">" => ".+".to_string(),
            literal => literal
                .chars()
                .map(|c| {
                    if "\\.+*?()|[]{}^$".contains(c) {
                        format!("\\{c}")
                    } else {
                        c.to_string()
                    }
                })
                .collect(),
        })
        .collect();
    format!("^{}$", tokens.join("\\."))
}
