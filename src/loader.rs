// Server descriptor loading from JSON config files
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use tracing::warn;

use crate::config::McpClientConfig;
use crate::descriptor::ServerDescriptor;
use crate::errors::McpError;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{([A-Za-z0-9_]+)\}").unwrap());

/// Parse a servers JSON file.
/// Supports multiple formats:
/// - Claude Desktop style: {"mcpServers": {"files": {"command": ..., "args": [...], "env": {...}}}}
/// - Array: [{"identifier": "files", "command": ...}, ...]
/// - Single server: {"identifier": "files", "command": ...}
///
/// `${VAR}` placeholders anywhere in the file are resolved through the
/// config's variable chain (inline variables, loaders, then process env).
pub async fn load_servers_from_file(
    path: impl AsRef<Path>,
    config: &McpClientConfig,
) -> Result<Vec<ServerDescriptor>, McpError> {
    let contents = tokio::fs::read_to_string(path.as_ref())
        .await
        .map_err(|err| {
            McpError::Config(format!(
                "cannot read servers file {}: {err}",
                path.as_ref().display()
            ))
        })?;
    let mut json: Value = serde_json::from_str(&contents)
        .map_err(|err| McpError::Config(format!("servers file is not valid JSON: {err}")))?;

    substitute_variables(&mut json, config).await;

    let mut descriptors = Vec::new();
    for (identifier, value) in parse_servers_json(json)? {
        let mut descriptor: ServerDescriptor = serde_json::from_value(value)
            .map_err(|err| McpError::Config(format!("bad server entry: {err}")))?;
        if let Some(identifier) = identifier {
            // The mapping key wins over any inline name.
            descriptor.identifier = identifier;
        }
        descriptor.validate()?;
        descriptors.push(descriptor);
    }
    Ok(descriptors)
}

fn parse_servers_json(json: Value) -> Result<Vec<(Option<String>, Value)>, McpError> {
    match json {
        // Direct array of descriptors
        Value::Array(arr) => Ok(arr.into_iter().map(|value| (None, value)).collect()),

        Value::Object(obj) => {
            if let Some(servers) = obj.get("mcpServers") {
                match servers {
                    // name -> descriptor mapping
                    Value::Object(map) => Ok(map
                        .iter()
                        .map(|(name, value)| (Some(name.clone()), value.clone()))
                        .collect()),
                    _ => Err(McpError::Config(
                        "'mcpServers' field must be an object".to_string(),
                    )),
                }
            } else {
                // Single descriptor object (no "mcpServers" wrapper)
                Ok(vec![(None, Value::Object(obj))])
            }
        }

        _ => Err(McpError::Config(
            "JSON root must be array or object".to_string(),
        )),
    }
}

async fn substitute_variables(value: &mut Value, config: &McpClientConfig) {
    let mut keys = BTreeSet::new();
    collect_placeholder_keys(value, &mut keys);
    if keys.is_empty() {
        return;
    }

    let mut resolved = HashMap::new();
    for key in keys {
        match config.get_variable(&key).await {
            Some(val) => {
                resolved.insert(key, val);
            }
            None => warn!(variable = %key, "no value for placeholder in servers file"),
        }
    }
    apply_substitutions(value, &resolved);
}

fn collect_placeholder_keys(value: &Value, keys: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => {
            for caps in PLACEHOLDER.captures_iter(s) {
                keys.insert(caps[1].to_string());
            }
        }
        Value::Object(obj) => {
            for nested in obj.values() {
                collect_placeholder_keys(nested, keys);
            }
        }
        Value::Array(arr) => {
            for item in arr {
                collect_placeholder_keys(item, keys);
            }
        }
        _ => {}
    }
}

fn apply_substitutions(value: &mut Value, resolved: &HashMap<String, String>) {
    match value {
        Value::String(s) => {
            if !s.contains("${") {
                return;
            }
            let replaced = PLACEHOLDER.replace_all(s, |caps: &Captures<'_>| {
                // Unknown placeholders are left verbatim.
                resolved
                    .get(&caps[1])
                    .cloned()
                    .unwrap_or_else(|| caps[0].to_string())
            });
            *s = replaced.into_owned();
        }
        Value::Object(obj) => {
            for nested in obj.values_mut() {
                apply_substitutions(nested, resolved);
            }
        }
        Value::Array(arr) => {
            for item in arr.iter_mut() {
                apply_substitutions(item, resolved);
            }
        }
        _ => {}
    }
}
