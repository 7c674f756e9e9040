//! Pure functions available to `transform` steps.
//!
//! A transform step names its function in `params.function`. Functions see
//! the step's resolved params and the run's template scope; they never
//! perform I/O.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use warden_contracts::error::{WardenError, WardenResult};

use crate::template::lookup;

/// What a transform function is handed.
pub struct TransformInput<'a> {
    pub params: &'a Value,
    /// `{inputs, <step outputs>}`, the same scope templates resolve against.
    pub scope: &'a Value,
}

impl TransformInput<'_> {
    /// Resolve the context entry named by `params[key]`.
    pub fn source(&self, key: &str) -> WardenResult<&Value> {
        let name = self
            .params
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| transform_error(format!("missing string param '{key}'")))?;
        lookup(self.scope, name).ok_or_else(|| transform_error(format!("'{name}' is not in the run context")))
    }
}

pub type TransformFn = Box<dyn Fn(&TransformInput<'_>) -> WardenResult<Value> + Send + Sync>;

/// Named transform functions.
#[derive(Default)]
pub struct TransformRegistry {
    functions: BTreeMap<String, TransformFn>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding `concat`, `pick` and `count`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("concat", Box::new(concat));
        registry.register("pick", Box::new(pick));
        registry.register("count", Box::new(count));
        registry
    }

    /// Add or replace a function.
    pub fn register(&mut self, name: impl Into<String>, function: TransformFn) {
        self.functions.insert(name.into(), function);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    pub fn apply(&self, name: &str, input: &TransformInput<'_>) -> WardenResult<Value> {
        let function = self
            .functions
            .get(name)
            .ok_or_else(|| transform_error(format!("unknown transform function '{name}'")))?;
        function(input)
    }
}

fn transform_error(reason: String) -> WardenError {
    WardenError::Playbook { reason }
}

/// Flatten the values named by `params.sources` into one array.
fn concat(input: &TransformInput<'_>) -> WardenResult<Value> {
    let names = input
        .params
        .get("sources")
        .and_then(Value::as_array)
        .ok_or_else(|| transform_error("concat requires a 'sources' array".to_string()))?;

    let mut out = Vec::new();
    for name in names {
        let name = name
            .as_str()
            .ok_or_else(|| transform_error("concat sources must be strings".to_string()))?;
        match lookup(input.scope, name) {
            Some(Value::Array(items)) => out.extend(items.iter().cloned()),
            Some(Value::Null) => {}
            Some(other) => out.push(other.clone()),
            None => return Err(transform_error(format!("'{name}' is not in the run context"))),
        }
    }
    Ok(Value::Array(out))
}

/// `params.path` inside the value named by `params.source`.
fn pick(input: &TransformInput<'_>) -> WardenResult<Value> {
    let source = input.source("source")?;
    let path = input
        .params
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| transform_error("pick requires a 'path' param".to_string()))?;
    lookup(source, path)
        .cloned()
        .ok_or_else(|| transform_error(format!("path '{path}' not found")))
}

fn count(input: &TransformInput<'_>) -> WardenResult<Value> {
    let n = match input.source("source")? {
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        Value::String(s) => s.chars().count(),
        Value::Null => 0,
        other => return Err(transform_error(format!("cannot count a {}", kind_name(other)))),
    };
    Ok(json!({ "count": n }))
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{TransformInput, TransformRegistry};

    fn run(registry: &TransformRegistry, name: &str, params: Value, scope: &Value) -> warden_contracts::error::WardenResult<Value> {
        registry.apply(name, &TransformInput { params: &params, scope })
    }

    #[test]
    fn concat_flattens_arrays_and_skips_nulls() {
        let registry = TransformRegistry::with_builtins();
        let scope = json!({ "mail": [1, 2], "calendar": [3], "empty": null, "note": "x" });
        let out = run(&registry, "concat", json!({ "sources": ["mail", "calendar", "empty", "note"] }), &scope).unwrap();
        assert_eq!(out, json!([1, 2, 3, "x"]));
    }

    #[test]
    fn pick_and_count_follow_paths() {
        let registry = TransformRegistry::with_builtins();
        let scope = json!({ "draft": { "entries": [{ "hours": 1.5 }, { "hours": 2.0 }] } });

        let first = run(&registry, "pick", json!({ "source": "draft", "path": "entries.0" }), &scope).unwrap();
        assert_eq!(first, json!({ "hours": 1.5 }));

        let counted = run(&registry, "count", json!({ "source": "draft.entries" }), &scope).unwrap();
        assert_eq!(counted, json!({ "count": 2 }));
    }

    #[test]
    fn unknown_function_and_missing_source_fail() {
        let registry = TransformRegistry::with_builtins();
        let scope = json!({});
        assert!(run(&registry, "summarize", json!({}), &scope).unwrap_err().to_string().contains("summarize"));
        assert!(run(&registry, "count", json!({ "source": "mail" }), &scope).is_err());
    }

    #[test]
    fn custom_functions_can_be_registered() {
        let mut registry = TransformRegistry::with_builtins();
        registry.register("constant", Box::new(|_| Ok(json!(7))));
        assert_eq!(run(&registry, "constant", json!({}), &json!({})).unwrap(), json!(7));
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["concat", "constant", "count", "pick"]);
    }
}
