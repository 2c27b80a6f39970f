//! YAML loading with `!secret` and `!env_var` substitution

use crate::error::{ConfigError, ConfigResult};
use serde_yaml::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, trace};

/// Main configuration file inside the config directory
pub const CONFIG_FILE: &str = "configuration.yaml";
/// Secrets file inside the config directory
pub const SECRETS_FILE: &str = "secrets.yaml";

/// Load `configuration.yaml` from `config_dir`.
///
/// A missing configuration file is an empty configuration.
pub fn load_yaml(config_dir: &Path) -> ConfigResult<Value> {
    let path = config_dir.join(CONFIG_FILE);
    if !path.exists() {
        debug!("No {} at {:?}, using empty configuration", CONFIG_FILE, path);
        return Ok(Value::Null);
    }

    let content = fs::read_to_string(&path).map_err(|e| ConfigError::ReadFile {
        path: path.clone(),
        source: e,
    })?;
    let secrets = load_secrets(config_dir)?;

    let value: Value = serde_yaml::from_str(&content)
        .map_err(|e| ConfigError::ParseYaml { path, source: e })?;
    substitute(value, &secrets)
}

/// Parse YAML from a string, substituting `!env_var` tags only
pub fn load_yaml_str(content: &str) -> ConfigResult<Value> {
    let value: Value = serde_yaml::from_str(content).map_err(|e| ConfigError::ParseYaml {
        path: "<string>".into(),
        source: e,
    })?;
    substitute(value, &HashMap::new())
}

fn load_secrets(config_dir: &Path) -> ConfigResult<HashMap<String, String>> {
    let path = config_dir.join(SECRETS_FILE);
    if !path.exists() {
        return Ok(HashMap::new());
    }

    let content = fs::read_to_string(&path).map_err(|e| ConfigError::ReadFile {
        path: path.clone(),
        source: e,
    })?;
    let raw: HashMap<String, Value> =
        serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseYaml {
            path: path.clone(),
            source: e,
        })?;

    let secrets: HashMap<String, String> = raw
        .into_iter()
        .filter_map(|(k, v)| scalar_to_string(&v).map(|s| (k, s)))
        .collect();
    debug!("Loaded {} secrets from {:?}", secrets.len(), path);
    Ok(secrets)
}

/// Render a scalar YAML value as a string
pub(crate) fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn substitute(value: Value, secrets: &HashMap<String, String>) -> ConfigResult<Value> {
    match value {
        Value::Tagged(tagged) => {
            let tag = tagged.tag.to_string();
            trace!("Processing tag '{}'", tag);
            match tag.as_str() {
                "!secret" => {
                    let key = tag_argument(&tag, tagged.value)?;
                    secrets
                        .get(&key)
                        .map(|s| Value::String(s.clone()))
                        .ok_or(ConfigError::SecretNotFound { key })
                }
                "!env_var" => {
                    let var = tag_argument(&tag, tagged.value)?;
                    std::env::var(&var)
                        .map(Value::String)
                        .map_err(|_| ConfigError::EnvVarNotFound { var })
                }
                _ => Ok(Value::Tagged(Box::new(serde_yaml::value::TaggedValue {
                    tag: tagged.tag,
                    value: substitute(tagged.value, secrets)?,
                }))),
            }
        }
        Value::Mapping(map) => {
            let mut result = serde_yaml::Mapping::new();
            for (k, v) in map {
                result.insert(k, substitute(v, secrets)?);
            }
            Ok(Value::Mapping(result))
        }
        Value::Sequence(seq) => seq
            .into_iter()
            .map(|v| substitute(v, secrets))
            .collect::<ConfigResult<Vec<_>>>()
            .map(Value::Sequence),
        other => Ok(other),
    }
}

fn tag_argument(tag: &str, value: Value) -> ConfigResult<String> {
    match value {
        Value::String(s) => Ok(s),
        _ => Err(ConfigError::InvalidValue {
            key: tag.to_string(),
            reason: "argument must be a string".to_string(),
        }),
    }
}
