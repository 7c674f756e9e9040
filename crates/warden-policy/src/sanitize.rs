//! The sanitation boundary between connector data and the run context.
//!
//! `RuleSanitizer` is the strategy the runner calls on every `collect` and
//! `transform` output before merging it. Its rules come from the policy
//! file's `[sanitizer]` table.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

use warden_core::traits::Sanitizer;

use crate::config::SanitizerRules;

fn script_blocks() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</\s*(script|style)\s*>").expect("script pattern is valid")
    })
}

fn markup_tags() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"</?[A-Za-z!][^<>]*>").expect("tag pattern is valid"))
}

#[derive(Debug, Clone, Default)]
pub struct RuleSanitizer {
    rules: SanitizerRules,
}

impl RuleSanitizer {
    pub fn new(rules: SanitizerRules) -> Self {
        Self { rules }
    }

    fn clean(&self, value: Value, depth: usize) -> Value {
        if depth > self.rules.max_depth {
            return Value::Null;
        }
        match value {
            Value::String(s) => Value::String(self.clean_str(&s)),
            Value::Array(items) => {
                if items.len() > self.rules.max_array_items {
                    debug!(len = items.len(), max = self.rules.max_array_items, "truncating array");
                }
                Value::Array(
                    items
                        .into_iter()
                        .take(self.rules.max_array_items)
                        .map(|item| self.clean(item, depth + 1))
                        .collect(),
                )
            }
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, item) in map {
                    if self.is_dropped(&key) {
                        debug!(key = %key, "dropping key from untrusted data");
                        continue;
                    }
                    out.insert(key, self.clean(item, depth + 1));
                }
                Value::Object(out)
            }
            other => other,
        }
    }

    fn clean_str(&self, s: &str) -> String {
        let mut text = s.to_string();
        if self.rules.strip_markup {
            text = script_blocks().replace_all(&text, "").into_owned();
            text = markup_tags().replace_all(&text, "").into_owned();
        }
        if self.rules.strip_control_chars {
            text.retain(|c| !c.is_control() || c == '\n' || c == '\t');
        }
        if text.chars().count() > self.rules.max_string_len {
            text = text.chars().take(self.rules.max_string_len).collect();
        }
        text
    }

    fn is_dropped(&self, key: &str) -> bool {
        self.rules.drop_keys.iter().any(|k| k.eq_ignore_ascii_case(key))
    }
}

impl Sanitizer for RuleSanitizer {
    fn sanitize(&self, value: Value) -> Value {
        self.clean(value, 0)
    }
}
