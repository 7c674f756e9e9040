//! `{{ dotted.path }}` templates in step params.
//!
//! A string that is exactly one template is replaced by the referenced
//! value itself (arrays and objects included). Templates embedded in a
//! longer string are rendered as text.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use warden_contracts::error::{WardenError, WardenResult};

fn template_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("template pattern is valid"))
}

/// Follow a dotted path through objects and arrays.
///
/// Numeric segments index into arrays; `mail.0.subject` is the subject of
/// the first element of `mail`.
pub fn lookup<'a>(scope: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(scope, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Resolve every template inside `params` against `scope`.
///
/// An unresolvable reference is an error rather than an empty string, so a
/// typo in a playbook fails the step instead of silently sending blanks.
pub fn resolve(params: &Value, scope: &Value) -> WardenResult<Value> {
    match params {
        Value::String(text) => resolve_str(text, scope),
        Value::Array(items) => items.iter().map(|item| resolve(item, scope)).collect::<WardenResult<Vec<_>>>().map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                out.insert(key.clone(), resolve(value, scope)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_str(text: &str, scope: &Value) -> WardenResult<Value> {
    let pattern = template_pattern();
    if !pattern.is_match(text) {
        return Ok(Value::String(text.to_string()));
    }

    let trimmed = text.trim();
    if let Some(caps) = pattern.captures(trimmed) {
        if caps[0].len() == trimmed.len() {
            return fetch(scope, &caps[1]).cloned();
        }
    }

    let mut rendered = String::with_capacity(text.len());
    let mut last = 0;
    for caps in pattern.captures_iter(text) {
        let (Some(m), Some(path)) = (caps.get(0), caps.get(1)) else { continue };
        rendered.push_str(&text[last..m.start()]);
        match fetch(scope, path.as_str())? {
            Value::String(s) => rendered.push_str(s),
            other => rendered.push_str(&other.to_string()),
        }
        last = m.end();
    }
    rendered.push_str(&text[last..]);
    Ok(Value::String(rendered))
}

fn fetch<'a>(scope: &'a Value, path: &str) -> WardenResult<&'a Value> {
    lookup(scope, path.trim()).ok_or_else(|| WardenError::Playbook {
        reason: format!("template reference '{{{{ {} }}}}' does not resolve", path.trim()),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{lookup, resolve};

    fn scope() -> serde_json::Value {
        json!({
            "inputs": { "matter": "M-7", "week": 42 },
            "mail": [{ "subject": "Re: filing" }, { "subject": "Invoice" }],
        })
    }

    #[test]
    fn lookup_walks_objects_and_arrays() {
        let scope = scope();
        assert_eq!(lookup(&scope, "inputs.matter"), Some(&json!("M-7")));
        assert_eq!(lookup(&scope, "mail.1.subject"), Some(&json!("Invoice")));
        assert_eq!(lookup(&scope, "mail.9"), None);
        assert_eq!(lookup(&scope, "inputs.matter.deeper"), None);
    }

    #[test]
    fn whole_string_template_keeps_value_type() {
        let resolved = resolve(&json!({ "rows": "{{ mail }}", "week": "{{inputs.week}}" }), &scope()).unwrap();
        assert_eq!(resolved["rows"].as_array().map(Vec::len), Some(2));
        assert_eq!(resolved["week"], json!(42));
    }

    #[test]
    fn embedded_templates_render_as_text() {
        let resolved = resolve(&json!("matter {{ inputs.matter }} / week {{ inputs.week }}"), &scope()).unwrap();
        assert_eq!(resolved, json!("matter M-7 / week 42"));
    }

    #[test]
    fn plain_values_pass_through() {
        let params = json!({ "limit": 5, "flag": true, "note": "no templates here" });
        assert_eq!(resolve(&params, &scope()).unwrap(), params);
    }

    #[test]
    fn unknown_reference_is_an_error() {
        let err = resolve(&json!("{{ inputs.client }}"), &scope()).unwrap_err();
        assert!(err.to_string().contains("inputs.client"));
    }
}
