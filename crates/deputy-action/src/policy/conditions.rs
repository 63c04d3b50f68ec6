//! Condition evaluation against triggering events.

use std::collections::HashMap;
use std::sync::Mutex;

use regex::Regex;

use deputy_core::policy::{Condition, TriggerEvent};

const MAX_CACHED_PATTERNS: usize = 1024;

/// Compiled `field_matches` patterns, keyed by source text.
///
/// A pattern that fails to compile is cached as `None` so it is not
/// retried on every event.
#[derive(Default)]
pub struct PatternCache {
    compiled: Mutex<HashMap<String, Option<Regex>>>,
}

impl PatternCache {
    pub fn is_match(&self, pattern: &str, text: &str) -> bool {
        let mut compiled = self.compiled.lock().unwrap_or_else(|e| e.into_inner());
        if !compiled.contains_key(pattern) {
            if compiled.len() >= MAX_CACHED_PATTERNS {
                compiled.clear();
            }
            compiled.insert(pattern.to_string(), Regex::new(pattern).ok());
        }
        compiled
            .get(pattern)
            .and_then(Option::as_ref)
            .is_some_and(|re| re.is_match(text))
    }

    pub fn len(&self) -> usize {
        self.compiled.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Whether `event` satisfies `condition`.
///
/// Missing fields never match, and neither does a pattern that fails to
/// compile (patterns are validated when a policy is added).
pub fn matches(condition: &Condition, event: &TriggerEvent, patterns: &PatternCache) -> bool {
    match condition {
        Condition::Always => true,
        Condition::EventType { event_type } => event.event_type == *event_type,
        Condition::FieldEquals { field, value } => {
            event.fields.get(field).is_some_and(|v| v == value)
        }
        Condition::FieldContains { field, value } => event
            .fields
            .get(field)
            .is_some_and(|v| v.to_lowercase().contains(&value.to_lowercase())),
        Condition::FieldMatches { field, pattern } => match event.fields.get(field) {
            Some(v) => patterns.is_match(pattern, v),
            None => false,
        },
        Condition::FieldExists { field } => event.fields.contains_key(field),
        Condition::All { conditions } => conditions.iter().all(|c| matches(c, event, patterns)),
        Condition::Any { conditions } => conditions.iter().any(|c| matches(c, event, patterns)),
        Condition::Not { condition } => !matches(condition, event, patterns),
    }
}

/// Every regex pattern in `condition` that does not compile.
pub fn invalid_patterns(condition: &Condition) -> Vec<String> {
    let mut invalid = Vec::new();
    collect_invalid(condition, &mut invalid);
    invalid
}

fn collect_invalid(condition: &Condition, invalid: &mut Vec<String>) {
    match condition {
        Condition::FieldMatches { pattern, .. } => {
            if let Err(e) = Regex::new(pattern) {
                invalid.push(format!("{}: {}", pattern, e));
            }
        }
        Condition::All { conditions } | Condition::Any { conditions } => {
            for c in conditions {
                collect_invalid(c, invalid);
            }
        }
        Condition::Not { condition } => collect_invalid(condition, invalid),
        _ => {}
    }
}
