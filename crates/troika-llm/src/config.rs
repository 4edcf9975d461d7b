//! LLM configuration catalog and call-time resolution.
//!
//! Configs are self-describing JSON objects. Two indirection forms are
//! resolved when a config is materialized:
//!
//! - `{"_type": "from_env", "var": "...", "default": ..., "required": bool}`
//! - `{"_type": "json_from_file", "path": "...", "key": "..."}`
//!
//! Configs may chain through `inherits_from`; child keys override parent
//! keys, and the chain is resolved before indirections so a child can
//! override a parent's env binding.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::errors::LlmError;

/// A fully resolved call configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Model name passed to the provider.
    pub model: String,
    /// API key, if the endpoint needs one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Endpoint base URL override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Completion token cap.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Application-level retry count for empty-response recovery.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Base wait between application-level retries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_seconds_on_retry: Option<u64>,
    /// Model to use for token counting when it differs from `model`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_counter_model: Option<String>,
    /// Provider params passed through verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Named catalog of raw (unresolved) configs.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LlmConfigCatalog {
    /// Raw configs by name.
    #[serde(default)]
    pub configs: BTreeMap<String, Value>,
}

impl LlmConfigCatalog {
    /// Build a catalog from raw JSON configs.
    pub fn new(configs: BTreeMap<String, Value>) -> Self {
        Self { configs }
    }

    /// Resolve a named config: follow the `inherits_from` chain, merge
    /// child-over-parent, then resolve indirections.
    pub fn resolve(&self, config_ref: &str) -> Result<LlmConfig, LlmError> {
        let merged = self.merged_raw(config_ref)?;
        let resolved = resolve_indirections(&merged)?;
        debug!(config_ref, "llm config resolved");
        serde_json::from_value(resolved).map_err(LlmError::Json)
    }

    fn merged_raw(&self, config_ref: &str) -> Result<Value, LlmError> {
        let mut chain = Vec::new();
        let mut cursor = Some(config_ref.to_string());
        while let Some(name) = cursor {
            if chain.iter().any(|(n, _)| n == &name) {
                return Err(LlmError::Config(format!(
                    "inheritance cycle through llm config '{name}'"
                )));
            }
            let raw = self
                .configs
                .get(&name)
                .ok_or_else(|| LlmError::Config(format!("llm config '{name}' not found")))?;
            cursor = raw
                .get("inherits_from")
                .and_then(Value::as_str)
                .map(String::from);
            chain.push((name, raw.clone()));
        }

        // Apply base first, then each child over it
        let mut merged = Map::new();
        for (_, raw) in chain.into_iter().rev() {
            if let Value::Object(map) = raw {
                for (k, v) in map {
                    if k != "inherits_from" {
                        let _ = merged.insert(k, v);
                    }
                }
            }
        }
        Ok(Value::Object(merged))
    }
}

/// Recursively resolve `_type` indirections in a raw config value.
pub fn resolve_indirections(value: &Value) -> Result<Value, LlmError> {
    match value {
        Value::Object(map) => {
            if let Some(kind) = map.get("_type").and_then(Value::as_str) {
                return resolve_indirection_node(kind, map);
            }
            let mut out = Map::new();
            for (k, v) in map {
                let _ = out.insert(k.clone(), resolve_indirections(v)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(resolve_indirections)
                .collect::<Result<_, _>>()?,
        )),
        other => Ok(other.clone()),
    }
}

fn resolve_indirection_node(kind: &str, map: &Map<String, Value>) -> Result<Value, LlmError> {
    match kind {
        "from_env" => {
            let var = map
                .get("var")
                .and_then(Value::as_str)
                .ok_or_else(|| LlmError::Config("from_env indirection missing 'var'".into()))?;
            match std::env::var(var) {
                Ok(v) => Ok(Value::String(v)),
                Err(_) => {
                    if let Some(default) = map.get("default") {
                        Ok(default.clone())
                    } else if map.get("required").and_then(Value::as_bool).unwrap_or(false) {
                        Err(LlmError::Config(format!(
                            "required environment variable '{var}' is not set"
                        )))
                    } else {
                        Ok(Value::Null)
                    }
                }
            }
        }
        "json_from_file" => {
            let path = map
                .get("path")
                .and_then(Value::as_str)
                .ok_or_else(|| LlmError::Config("json_from_file indirection missing 'path'".into()))?;
            let text = std::fs::read_to_string(path)
                .map_err(|e| LlmError::Config(format!("cannot read '{path}': {e}")))?;
            let parsed: Value = serde_json::from_str(&text)?;
            match map.get("key").and_then(Value::as_str) {
                Some(key) => Ok(parsed.get(key).cloned().unwrap_or(Value::Null)),
                None => Ok(parsed),
            }
        }
        other => Err(LlmError::Config(format!("unknown indirection '_type': '{other}'"))),
    }
}
