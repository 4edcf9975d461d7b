//! The handover service: declarative assembly of a sub-agent's briefing
//! payload from its parent's context.
//!
//! A protocol contributes two things: direct parameters lifted off the
//! triggering tool call (per the protocol's `context_parameters` schema)
//! and inherited data resolved from the parent context by path rules. The
//! result is `{source, payload: {data, schema_for_rendering}}`, placed in
//! the child's inbox and rendered by the `protocol_aware` ingestor.

use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use troika_core::expr;
use troika_core::paths::ContextPaths;
use troika_profiles::types::FromSource;
use troika_profiles::HandoverProtocol;

use crate::errors::RuntimeError;

/// A briefing ready to become an inbox item.
#[derive(Clone, Debug, PartialEq)]
pub struct Briefing {
    /// Inbox source name (e.g. `AGENT_STARTUP_BRIEFING`).
    pub source: String,
    /// `{data, schema_for_rendering}` payload.
    pub payload: Value,
}

/// Execute a handover protocol against the parent context.
///
/// `tool_params` are the parameters of the triggering tool call (for
/// array-based fan-out tools, the single assignment object).
pub fn execute_protocol(
    protocol: &HandoverProtocol,
    parent: &dyn ContextPaths,
    tool_params: &Value,
) -> Result<Briefing, RuntimeError> {
    let mut data = Map::new();
    let mut schema_props = Map::new();

    // Step 1: direct parameters named by the protocol schema
    if let Some(props) = protocol
        .context_parameters
        .get("properties")
        .and_then(Value::as_object)
    {
        for (prop_name, prop_schema) in props {
            if let Some(value) = tool_params.get(prop_name) {
                let _ = data.insert(prop_name.clone(), value.clone());
                let _ = schema_props.insert(prop_name.clone(), prop_schema.clone());
            }
        }
    }

    // Step 2: inheritance rules
    for rule in &protocol.inheritance {
        let applies = match rule.condition.as_deref() {
            None | Some("True") | Some("true") => true,
            Some(condition) => match expr::evaluate_bool(condition, parent) {
                Ok(v) => v,
                Err(e) => {
                    warn!(condition, error = %e, "inheritance condition failed to evaluate");
                    continue;
                }
            },
        };
        if !applies {
            continue;
        }

        let inherited = match &rule.from_source {
            FromSource::Single { path, replace } => {
                resolve_templated_path(path, replace, parent).and_then(|p| parent.lookup(&p))
            }
            FromSource::Iterate {
                path_to_iterate,
                iterate_on,
            } => {
                let mut aggregated: Vec<Value> = Vec::new();
                for (placeholder, list_path) in iterate_on {
                    let Some(Value::Array(values)) = parent.lookup(list_path) else {
                        continue;
                    };
                    for value in values {
                        let resolved_path = path_to_iterate.replace(
                            &format!("{{{{ {placeholder} }}}}"),
                            &troika_core::paths::display_value(&value),
                        );
                        if let Some(part) = parent.lookup(&resolved_path) {
                            match part {
                                Value::Array(items) => aggregated.extend(items),
                                other => aggregated.push(other),
                            }
                        }
                    }
                }
                if aggregated.is_empty() {
                    None
                } else {
                    Some(Value::Array(aggregated))
                }
            }
        };

        let Some(inherited) = inherited else {
            debug!(payload_key = %rule.as_payload_key, "inheritance rule produced no data");
            continue;
        };

        let mut entry_schema = Map::new();
        let _ = entry_schema.insert(
            "x-handover-title".into(),
            Value::String(
                rule.title
                    .clone()
                    .unwrap_or_else(|| rule.as_payload_key.clone()),
            ),
        );
        if let Some(Value::Object(extra)) = &rule.schema {
            for (k, v) in extra {
                let _ = entry_schema.insert(k.clone(), v.clone());
            }
        }
        let _ = data.insert(rule.as_payload_key.clone(), inherited);
        let _ = schema_props.insert(rule.as_payload_key.clone(), Value::Object(entry_schema));
    }

    Ok(Briefing {
        source: protocol.target_inbox_item.source.clone(),
        payload: json!({
            "data": data,
            "schema_for_rendering": {
                "type": "object",
                "properties": schema_props,
            },
        }),
    })
}

/// Substitute every `{{ placeholder }}` in a path template with the value
/// at its mapped source path. Any unresolvable placeholder invalidates the
/// whole path.
fn resolve_templated_path(
    template: &str,
    replacements: &std::collections::BTreeMap<String, String>,
    parent: &dyn ContextPaths,
) -> Option<String> {
    let mut resolved = template.to_string();
    for (placeholder, value_path) in replacements {
        let value = parent.lookup(value_path)?;
        resolved = resolved.replace(
            &format!("{{{{ {placeholder} }}}}"),
            &troika_core::paths::display_value(&value),
        );
    }
    if resolved.contains("{{") {
        return None;
    }
    Some(resolved)
}
