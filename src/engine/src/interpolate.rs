//! Variable interpolation: replaces `var.*` / `item.*` / `env.*` / `task.*`
//! path references inside templated configuration trees with values
//! resolved against a chain's scope, an iteration item, process
//! configuration, or the chain itself.

use crate::env::Environment;
use crate::record::WalkableDict;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static REFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(var|item|env|task)\.[^\s]*").expect("valid reference regex"));

/// Scope available while resolving a single interpolation pass.
pub struct Scope<'a> {
    /// The chain's shared variables.
    pub variables: &'a WalkableDict,
    /// The current iteration item, when the task is one of N iterated
    /// siblings.
    pub item: Option<&'a Value>,
    /// A view of the chain's own state, addressable via `task.*`.
    pub chain_state: Option<&'a WalkableDict>,
    /// The process-wide environment singleton.
    pub environment: &'a Environment,
    /// If true, an unresolved `var.*` reference raises instead of being
    /// left untouched.
    pub fail_on_unassigned: bool,
}

/// Recursively walks a templated JSON tree, running every string leaf
/// through [`replace_references`].
///
/// # Errors
///
/// Propagates an error from [`replace_references`] when `scope.fail_on_unassigned`
/// is set and a referenced variable is not assigned.
pub fn walk_and_replace(obj: &Value, scope: &Scope<'_>) -> Result<Value, String> {
    match obj {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), walk_and_replace(v, scope)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(arr) => {
            let mut out = Vec::with_capacity(arr.len());
            for v in arr {
                out.push(walk_and_replace(v, scope)?);
            }
            Ok(Value::Array(out))
        }
        Value::String(s) => replace_references(s, scope),
        other => Ok(other.clone()),
    }
}

/// Replaces every `var.*`/`item.*`/`env.*`/`task.*` reference found in
/// `original` with its resolved value.
///
/// If the entire string is a single reference, the resolved value is
/// returned with its original type preserved (an object stays an object).
/// Otherwise every reference is stringified and spliced into the text.
///
/// # Errors
///
/// Returns an error if `scope.fail_on_unassigned` is set and a `var.*`
/// reference has no corresponding chain variable, or an `item.*`/`task.*`
/// reference is used without the corresponding scope being available.
pub fn replace_references(original: &str, scope: &Scope<'_>) -> Result<Value, String> {
    if !REFERENCE.is_match(original) {
        return Ok(Value::String(original.to_owned()));
    }

    let matches: Vec<&str> = REFERENCE.find_iter(original).map(|m| m.as_str()).collect();
    let replace_whole_string = matches.len() == 1 && matches[0] == original;

    let mut replacements: Vec<(String, Value)> = Vec::new();

    for reference in &matches {
        let mut parts = reference.splitn(2, '.');
        let prefix = parts.next().unwrap_or_default();
        let tail = parts.next().unwrap_or_default();

        let resolved = match prefix {
            "item" => scope.item.and_then(|item| walk_path_value(item, tail)),
            "task" => scope
                .chain_state
                .and_then(|state| walk_path(state, tail)),
            "env" => scope.environment.walk(tail).cloned(),
            "var" => {
                let value = walk_path(scope.variables, tail);
                if value.is_none() && scope.fail_on_unassigned {
                    return Err(format!(
                        "variable `{}` is not assigned in the chain. Did you remember to \
                         assign it in a previous task with `result_as: var.{}`?",
                        tail, tail
                    ));
                }
                value
            }
            _ => None,
        };

        if let Some(value) = resolved {
            replacements.push(((*reference).to_owned(), value));
        }
        // Unresolved, non-strict: leave the substring untouched (the
        // template is re-materialized repeatedly before the task runs).
    }

    if replace_whole_string {
        return Ok(replacements
            .into_iter()
            .next()
            .map(|(_, v)| v)
            .unwrap_or_else(|| Value::String(original.to_owned())));
    }

    let mut result = original.to_owned();
    for (reference, value) in replacements {
        let stringified = match &value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        result = result.replace(&reference, &stringified);
    }
    Ok(Value::String(result))
}

/// Walks a dotted/bracketed tail path against a `WalkableDict`, applying the
/// trailing reflection segments `keys`/`values`/`value` where they appear.
fn walk_path(root: &WalkableDict, tail: &str) -> Option<Value> {
    if tail == "value" {
        return Some(Value::Object(root.as_map().clone()));
    }
    if let Some(prefix) = tail.strip_suffix(".keys") {
        let inner = if prefix.is_empty() {
            Some(Value::Object(root.as_map().clone()))
        } else {
            root.walk(prefix).cloned()
        };
        return inner.and_then(|v| match v {
            Value::Object(map) => Some(Value::Array(
                map.keys().map(|k| Value::String(k.clone())).collect(),
            )),
            _ => None,
        });
    }
    if let Some(prefix) = tail.strip_suffix(".values") {
        let inner = if prefix.is_empty() {
            Some(Value::Object(root.as_map().clone()))
        } else {
            root.walk(prefix).cloned()
        };
        return inner.and_then(|v| match v {
            Value::Object(map) => Some(Value::Array(map.values().cloned().collect())),
            _ => None,
        });
    }
    if tail.is_empty() {
        return Some(Value::Object(root.as_map().clone()));
    }
    root.walk(tail).cloned()
}

/// Same as [`walk_path`] but over an arbitrary JSON value (used for
/// `item.*`, which may be a list, a scalar, or a mapping).
fn walk_path_value(root: &Value, tail: &str) -> Option<Value> {
    if tail == "value" || tail.is_empty() {
        return Some(root.clone());
    }

    let mut current = root.clone();
    for segment in tail.split(|c| c == '.' ) {
        if segment.is_empty() {
            continue;
        }
        if let Some(idx) = segment
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .and_then(|s| s.parse::<usize>().ok())
        {
            current = current.as_array()?.get(idx)?.clone();
            continue;
        }
        match segment {
            "keys" => {
                current = Value::Array(
                    current
                        .as_object()?
                        .keys()
                        .map(|k| Value::String(k.clone()))
                        .collect(),
                );
            }
            "values" => {
                current = Value::Array(current.as_object()?.values().cloned().collect());
            }
            "upper" => current = Value::String(current.as_str()?.to_uppercase()),
            "lower" => current = Value::String(current.as_str()?.to_lowercase()),
            "len" => {
                let len = match &current {
                    Value::Array(a) => a.len(),
                    Value::String(s) => s.chars().count(),
                    Value::Object(o) => o.len(),
                    _ => return None,
                };
                current = Value::Number(len.into());
            }
            key => current = current.as_object()?.get(key)?.clone(),
        }
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env() -> Environment {
        Environment::new()
    }

    #[test]
    fn whole_string_reference_preserves_object_identity() {
        let mut vars = WalkableDict::new();
        vars.assign("user", json!({ "name": "Ada" }));
        let e = env();
        let scope = Scope {
            variables: &vars,
            item: None,
            chain_state: None,
            environment: &e,
            fail_on_unassigned: false,
        };

        let result = replace_references("var.user", &scope).unwrap();
        assert_eq!(result, json!({ "name": "Ada" }));
    }

    #[test]
    fn partial_reference_is_stringified_and_spliced() {
        let mut vars = WalkableDict::new();
        vars.assign("user.name", json!("Ada"));
        let e = env();
        let scope = Scope {
            variables: &vars,
            item: None,
            chain_state: None,
            environment: &e,
            fail_on_unassigned: false,
        };

        let result = replace_references("hello var.user.name", &scope).unwrap();
        assert_eq!(result, json!("hello Ada"));
    }

    #[test]
    fn unresolved_reference_is_left_untouched_by_default() {
        let vars = WalkableDict::new();
        let e = env();
        let scope = Scope {
            variables: &vars,
            item: None,
            chain_state: None,
            environment: &e,
            fail_on_unassigned: false,
        };

        let result = replace_references("var.missing.path", &scope).unwrap();
        assert_eq!(result, json!("var.missing.path"));
    }

    #[test]
    fn fail_on_unassigned_raises() {
        let vars = WalkableDict::new();
        let e = env();
        let scope = Scope {
            variables: &vars,
            item: None,
            chain_state: None,
            environment: &e,
            fail_on_unassigned: true,
        };

        assert!(replace_references("var.missing", &scope).is_err());
    }

    #[test]
    fn item_reference_resolves_against_iteration_item() {
        let vars = WalkableDict::new();
        let e = env();
        let item = json!({ "id": 7 });
        let scope = Scope {
            variables: &vars,
            item: Some(&item),
            chain_state: None,
            environment: &e,
            fail_on_unassigned: false,
        };

        assert_eq!(replace_references("item.id", &scope).unwrap(), json!(7));
    }
}
