use std::collections::HashMap;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::CommonError;

/// Walks every string leaf of `value`, replacing `${Name}` tokens with the matching
/// entry in `vars`. Returns the substituted value plus whether any `${...}` token
/// remained unresolved ("Server configuration has unresolved variables").
pub fn substitute_variables(value: &Value, vars: &HashMap<String, String>) -> (Value, bool) {
    let mut unresolved = false;
    let substituted = substitute_value(value, vars, &mut unresolved);
    (substituted, unresolved)
}

fn substitute_value(value: &Value, vars: &HashMap<String, String>, unresolved: &mut bool) -> Value {
    match value {
        Value::String(s) => Value::String(substitute_string(s, vars, unresolved)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| substitute_value(v, vars, unresolved))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_value(v, vars, unresolved)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn substitute_string(input: &str, vars: &HashMap<String, String>, unresolved: &mut bool) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let after_marker = &rest[start + 2..];
        match after_marker.find('}') {
            Some(end) => {
                let name = &after_marker[..end];
                match vars.get(name) {
                    Some(value) => output.push_str(value),
                    None => {
                        *unresolved = true;
                        output.push_str(&rest[start..start + 2 + end + 1]);
                    }
                }
                rest = &after_marker[end + 1..];
            }
            None => {
                // Unterminated `${` — not a variable token, copy through verbatim.
                output.push_str(&rest[start..]);
                rest = "";
                break;
            }
        }
    }

    output.push_str(rest);
    output
}

/// Substitutes `{argName}` placeholders inside a command-executor template string
/// using the caller-supplied tool arguments. Missing required placeholders are a
/// hard error: the executor must not silently run a partially-substituted
/// command.
pub fn substitute_arg_placeholders(
    template: &str,
    args: &serde_json::Map<String, Value>,
) -> Result<String, CommonError> {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        output.push_str(&rest[..start]);
        let after_marker = &rest[start + 1..];
        match after_marker.find('}') {
            Some(end) => {
                let name = &after_marker[..end];
                let value = args.get(name).ok_or_else(|| CommonError::InvalidRequest {
                        msg: format!("missing required argument: {name}"),
                        source: None,
                })?;
                output.push_str(&value_to_plain_string(value));
                rest = &after_marker[end + 1..];
            }
            None => {
                output.push_str(&rest[start..]);
                rest = "";
                break;
            }
        }
    }

    output.push_str(rest);
    Ok(output)
}

fn value_to_plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `config_hash = sha256(JSON(serverDef))`, used by the Subprocess Supervisor and
/// MCP Proxy to deduplicate connections to the same logical server definition.
pub fn config_hash(def: &Value) -> String {
    let canonical = serde_json::to_vec(def).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_variable() {
        let mut vars = HashMap::new();
        vars.insert("TOKEN".to_string(), "abc123".to_string());
        let value = serde_json::json!({"env": {"API_KEY": "${TOKEN}"}});
        let (substituted, unresolved) = substitute_variables(&value, &vars);
        assert!(!unresolved);
        assert_eq!(substituted["env"]["API_KEY"], "abc123");
    }

    #[test]
    fn flags_unresolved_variable() {
        let vars = HashMap::new();
        let value = serde_json::json!({"cmd": "run --token=${MISSING}"});
        let (substituted, unresolved) = substitute_variables(&value, &vars);
        assert!(unresolved);
        assert_eq!(substituted["cmd"], "run --token=${MISSING}");
    }

    #[test]
    fn substitutes_multiple_tokens_in_one_string() {
        let mut vars = HashMap::new();
        vars.insert("A".to_string(), "1".to_string());
        vars.insert("B".to_string(), "2".to_string());
        let value = serde_json::json!("${A}-${B}");
        let (substituted, unresolved) = substitute_variables(&value, &vars);
        assert!(!unresolved);
        assert_eq!(substituted, "1-2");
    }

    #[test]
    fn arg_placeholder_substitution() {
        let mut args = serde_json::Map::new();
        args.insert("name".to_string(), serde_json::json!("world"));
        let result = substitute_arg_placeholders("echo hello {name}", &args).unwrap();
        assert_eq!(result, "echo hello world");
    }

    #[test]
    fn arg_placeholder_missing_is_error() {
        let args = serde_json::Map::new();
        let result = substitute_arg_placeholders("echo {name}", &args);
        assert!(result.is_err());
    }

    #[test]
    fn config_hash_is_stable_for_same_value() {
        let def = serde_json::json!({"cmd": "npx", "args": ["server"]});
        assert_eq!(config_hash(&def), config_hash(&def));
    }

    #[test]
    fn config_hash_differs_for_different_values() {
        let a = serde_json::json!({"cmd": "npx"});
        let b = serde_json::json!({"cmd": "uvx"});
        assert_ne!(config_hash(&a), config_hash(&b));
    }
}
