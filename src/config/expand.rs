//! # Variable expansion over the parsed manifest tree.
//!
//! Every string value in the manifest (recursively through objects and
//! arrays, preserving array order) is scanned for `${ key }` occurrences.
//! Keys are case-insensitive and may be padded with whitespace inside the
//! braces. Resolution order:
//!
//! 1. the manifest's `Variables` table,
//! 2. the process environment,
//! 3. otherwise [`ConfigError::MissingVariable`].
//!
//! Variable values may themselves contain `${ ... }` references; those are
//! resolved recursively with a visited set, so reference cycles are
//! detected and rejected instead of looping.
//!
//! Expansion is idempotent on strings without `${ ... }` occurrences. The
//! matcher is stateless per call: a compiled [`Regex`] keeps no cursor
//! between uses, so expansions can never bleed into each other.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::error::ConfigError;

/// Matches `${ key }` with optional whitespace padding around the key.
fn variable_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{\s*([A-Za-z0-9_][A-Za-z0-9_.-]*)\s*\}").expect("valid regex"))
}

/// Expands `${ key }` references in every string of `value`, in place.
///
/// `vars` is the manifest's `Variables` table; lookups against it are
/// case-insensitive. Unresolved keys fall back to the process environment
/// (exact name) before failing.
pub fn expand_tree(value: &mut Value, vars: &BTreeMap<String, String>) -> Result<(), ConfigError> {
    let lowered: BTreeMap<String, &String> = vars
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v))
        .collect();
    walk(value, &lowered)
}

fn walk(value: &mut Value, vars: &BTreeMap<String, &String>) -> Result<(), ConfigError> {
    match value {
        Value::String(s) => {
            let expanded = expand_str(s, vars, &mut Vec::new())?;
            *s = expanded;
            Ok(())
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                walk(item, vars)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                walk(item, vars)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Expands one string. `visiting` holds the (lowercased) variable names on
/// the current resolution path for cycle detection.
fn expand_str(
    input: &str,
    vars: &BTreeMap<String, &String>,
    visiting: &mut Vec<String>,
) -> Result<String, ConfigError> {
    let re = variable_re();
    if !re.is_match(input) {
        return Ok(input.to_string());
    }

    let mut out = String::with_capacity(input.len());
    let mut last = 0usize;
    for caps in re.captures_iter(input) {
        let whole = caps.get(0).expect("capture 0 always present");
        let key = &caps[1];
        out.push_str(&input[last..whole.start()]);
        out.push_str(&resolve(key, vars, visiting)?);
        last = whole.end();
    }
    out.push_str(&input[last..]);
    Ok(out)
}

fn resolve(
    key: &str,
    vars: &BTreeMap<String, &String>,
    visiting: &mut Vec<String>,
) -> Result<String, ConfigError> {
    let lowered = key.to_lowercase();
    if visiting.iter().any(|v| v == &lowered) {
        return Err(ConfigError::CircularVariable {
            name: key.to_string(),
        });
    }

    if let Some(raw) = vars.get(&lowered) {
        visiting.push(lowered);
        let resolved = expand_str(raw, vars, visiting);
        visiting.pop();
        return resolved;
    }

    match std::env::var(key) {
        Ok(v) => Ok(v),
        Err(_) => Err(ConfigError::MissingVariable {
            name: key.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn expands_simple_reference() {
        let mut v = json!({"Image": "${registry}/etcd"});
        expand_tree(&mut v, &vars(&[("registry", "quay.io")])).unwrap();
        assert_eq!(v["Image"], "quay.io/etcd");
    }

    #[test]
    fn key_is_case_insensitive_and_whitespace_tolerant() {
        let mut v = json!("${  RegIstry  }");
        expand_tree(&mut v, &vars(&[("registry", "quay.io")])).unwrap();
        assert_eq!(v, "quay.io");
    }

    #[test]
    fn idempotent_without_references() {
        let plain = "plain $ {not-a-ref} text";
        let mut v = json!(plain);
        expand_tree(&mut v, &vars(&[])).unwrap();
        assert_eq!(v, plain);
    }

    #[test]
    fn arrays_preserve_order() {
        let mut v = json!(["${a}", "middle", "${b}"]);
        expand_tree(&mut v, &vars(&[("a", "first"), ("b", "last")])).unwrap();
        assert_eq!(v, json!(["first", "middle", "last"]));
    }

    #[test]
    fn nested_variables_resolve() {
        let mut v = json!("${image}");
        expand_tree(
            &mut v,
            &vars(&[("image", "${registry}/etcd"), ("registry", "quay.io")]),
        )
        .unwrap();
        assert_eq!(v, "quay.io/etcd");
    }

    #[test]
    fn missing_variable_falls_back_to_env_then_fails() {
        std::env::set_var("KIRUNA_TEST_EXPAND_VAR", "from-env");
        let mut v = json!("${KIRUNA_TEST_EXPAND_VAR}");
        expand_tree(&mut v, &vars(&[])).unwrap();
        assert_eq!(v, "from-env");

        let mut missing = json!("${definitely_not_defined_anywhere_kir}");
        let err = expand_tree(&mut missing, &vars(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVariable { .. }));
    }

    #[test]
    fn circular_reference_is_rejected() {
        let mut v = json!("${a}");
        let err = expand_tree(&mut v, &vars(&[("a", "${b}"), ("b", "${a}")])).unwrap_err();
        assert!(matches!(err, ConfigError::CircularVariable { .. }));
    }

    #[test]
    fn self_reference_is_rejected() {
        let mut v = json!("${a}");
        let err = expand_tree(&mut v, &vars(&[("a", "x${a}x")])).unwrap_err();
        assert!(matches!(err, ConfigError::CircularVariable { .. }));
    }
}
