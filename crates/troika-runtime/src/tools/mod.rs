//! The tool layer: invocation trait, process-wide registry, schema
//! merging, and access-policy resolution.
//!
//! ## Submodules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `proxy` | External-tool proxy and pooled sessions |
//! | `builtin` | Built-in orchestration tools (finish, work modules, status, directives) |

pub mod builtin;
pub mod proxy;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use troika_core::tools::{ToolResponse, ToolSpec};
use troika_profiles::{AgentProfile, ProfileStore};

use crate::context::{RunContext, SubContext};

/// A tool callable by an agent. Implementations receive the parsed
/// parameters, the invoking agent's contexts, and a cancellation token
/// they are expected to honor for long-running work.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The registry-facing spec (pre-merge).
    fn spec(&self) -> ToolSpec;

    /// Execute the tool. Failures are data: return an error envelope.
    async fn execute(
        &self,
        params: Value,
        run: &Arc<RunContext>,
        sub: &Arc<SubContext>,
        cancel: &CancellationToken,
    ) -> ToolResponse;
}

/// A registered tool: its post-merge spec plus the implementation.
#[derive(Clone)]
pub struct RegisteredTool {
    /// Spec with handover parameters merged in.
    pub spec: ToolSpec,
    /// The implementation.
    pub tool: Arc<dyn Tool>,
}

/// Process-wide tool registry keyed by tool name.
pub struct ToolRegistry {
    tools: RwLock<BTreeMap<String, RegisteredTool>>,
}

impl ToolRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a tool, merging its handover protocol's parameters into
    /// the published schema. For array-typed parameters carrying a
    /// single-object `items` schema, the merge lands on the items schema
    /// so fan-out tools get per-item inheritance.
    pub fn register(&self, tool: Arc<dyn Tool>, profiles: &ProfileStore) {
        let mut spec = tool.spec();
        if let Some(protocol_name) = spec.handover_protocol.clone() {
            match profiles.protocol(&protocol_name) {
                Some(protocol) => {
                    merge_handover_schema(&mut spec.parameters, &protocol.context_parameters);
                    debug!(tool_name = %spec.name, protocol_name, "handover parameters merged");
                }
                None => {
                    warn!(tool_name = %spec.name, protocol_name, "handover protocol not found; parameters not merged");
                }
            }
        }
        let mut tools = self.tools.write();
        if tools.contains_key(&spec.name) {
            warn!(tool_name = %spec.name, "tool overwritten in registry");
        }
        let _ = tools.insert(spec.name.clone(), RegisteredTool { spec, tool });
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<RegisteredTool> {
        self.tools.read().get(name).cloned()
    }

    /// The post-merge spec for a tool.
    pub fn spec(&self, name: &str) -> Option<ToolSpec> {
        self.tools.read().get(name).map(|t| t.spec.clone())
    }

    /// Whether a registered tool ends the flow.
    pub fn ends_flow(&self, name: &str) -> bool {
        self.tools.read().get(name).is_some_and(|t| t.spec.ends_flow)
    }

    /// The effective tool set for an agent this turn: tools whose toolset
    /// the profile allows, plus individually allowed tools. An Associate's
    /// `allowed_toolsets` state override replaces the profile's toolset
    /// list when present.
    pub fn effective_specs_for(&self, profile: &AgentProfile, sub: &SubContext) -> Vec<ToolSpec> {
        let override_toolsets = sub.state.lock().allowed_toolsets.clone();
        let toolsets: BTreeSet<String> = match override_toolsets {
            Some(list) => list.into_iter().collect(),
            None => profile
                .tool_access_policy
                .allowed_toolsets
                .iter()
                .cloned()
                .collect(),
        };
        let individual: BTreeSet<&String> =
            profile.tool_access_policy.allowed_individual_tools.iter().collect();

        self.tools
            .read()
            .values()
            .filter(|t| toolsets.contains(&t.spec.toolset_name) || individual.contains(&t.spec.name))
            .map(|t| t.spec.clone())
            .collect()
    }

    /// API-shaped definitions for the effective tool set.
    pub fn api_tools_for(&self, profile: &AgentProfile, sub: &SubContext) -> Vec<Value> {
        self.effective_specs_for(profile, sub)
            .iter()
            .map(ToolSpec::api_definition)
            .collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Merge a handover protocol's `context_parameters` into a tool schema.
fn merge_handover_schema(tool_schema: &mut Value, protocol_params: &Value) {
    let Some(proto_props) = protocol_params.get("properties").and_then(Value::as_object) else {
        return;
    };
    let proto_required: Vec<String> = protocol_params
        .get("required")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).map(String::from).collect())
        .unwrap_or_default();

    // Find the merge target: an array property with a single-object items
    // schema wins, else the top level.
    let target = find_merge_target(tool_schema);
    let Some(target_obj) = target.as_object_mut() else {
        return;
    };

    let props = target_obj
        .entry("properties".to_string())
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    if let Some(props) = props.as_object_mut() {
        for (k, v) in proto_props {
            let _ = props.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    let required = target_obj
        .entry("required".to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Some(required) = required.as_array_mut() {
        let mut merged: BTreeSet<String> = required
            .iter()
            .filter_map(Value::as_str)
            .map(String::from)
            .collect();
        merged.extend(proto_required);
        *required = merged.into_iter().map(Value::String).collect();
    }
}

fn find_merge_target(tool_schema: &mut Value) -> &mut Value {
    let has_array_items_target = tool_schema
        .get("properties")
        .and_then(Value::as_object)
        .and_then(|props| {
            props.iter().find(|(_, v)| {
                v.get("type").and_then(Value::as_str) == Some("array")
                    && v.get("items").and_then(|i| i.get("type")).and_then(Value::as_str)
                        == Some("object")
            })
        })
        .map(|(k, _)| k.clone());

    match has_array_items_target {
        Some(key) => tool_schema
            .get_mut("properties")
            .and_then(|p| p.get_mut(&key))
            .and_then(|v| v.get_mut("items"))
            .expect("array items target just observed"),
        None => tool_schema,
    }
}

/// Render the effective tool catalog for a system prompt, grouped by
/// toolset.
pub fn format_tools_for_prompt(specs: &[ToolSpec]) -> String {
    if specs.is_empty() {
        return "No tools are currently available.".to_string();
    }
    let mut by_toolset: BTreeMap<&str, Vec<&ToolSpec>> = BTreeMap::new();
    for spec in specs {
        by_toolset.entry(&spec.toolset_name).or_default().push(spec);
    }

    let mut lines = vec!["### Available Tools".to_string()];
    for (toolset, tools) in by_toolset {
        lines.push(format!("\n#### Toolset: `{toolset}`"));
        for spec in tools {
            lines.push(format!("- **{}**: {}", spec.name, spec.description.trim()));
            if let Some(required) = spec.parameters.get("required").and_then(Value::as_array) {
                let names: Vec<&str> = required.iter().filter_map(Value::as_str).collect();
                if !names.is_empty() {
                    lines.push(format!("  - Required parameters: {}", names.join(", ")));
                }
            }
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use serde_json::json;

    #[test]
    fn register_and_lookup() {
        let (run, _partner) = testutil::partner_run("q");
        let registry = &run.runtime.tools;
        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
        assert!(registry.ends_flow("finish_flow"));
        assert!(!registry.ends_flow("echo"));
    }

    #[test]
    fn handover_merge_into_array_items() {
        let profiles = testutil::profile_store();
        let registry = ToolRegistry::new();
        registry.register(Arc::new(crate::dispatcher::DispatchTool), &profiles);

        let spec = registry.spec("dispatch_submodules").unwrap();
        let items = &spec.parameters["properties"]["assignments"]["items"];
        // Protocol-contributed parameter landed inside the items schema
        assert!(items["properties"].get("module_id_to_assign").is_some());
        let required: Vec<&str> = items["required"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert!(required.contains(&"module_id_to_assign"));
        assert!(required.contains(&"agent_profile_logical_name"));
    }

    #[test]
    fn api_definition_strips_x_fields_after_merge() {
        let profiles = testutil::profile_store();
        let registry = ToolRegistry::new();
        registry.register(Arc::new(crate::dispatcher::DispatchTool), &profiles);

        let spec = registry.spec("dispatch_submodules").unwrap();
        let api = spec.api_definition();
        let rendered = api.to_string();
        assert!(!rendered.contains("x-handover-title"));
        // But the registry copy keeps them
        assert!(spec.parameters.to_string().contains("x-handover-title"));
    }

    #[test]
    fn effective_specs_honor_policy_union() {
        let (run, partner) = testutil::partner_run("q");
        let mut profile = (*testutil::partner_profile()).clone();
        profile.tool_access_policy.allowed_toolsets = vec!["echo".into()];
        profile.tool_access_policy.allowed_individual_tools = vec!["finish_flow".into()];

        let specs = run.runtime.tools.effective_specs_for(&profile, &partner);
        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        assert!(names.contains(&"echo"));
        assert!(names.contains(&"finish_flow"));
        assert!(!names.contains(&"dispatch_submodules"));
    }

    #[test]
    fn associate_toolset_override_replaces_profile_list() {
        let (run, partner) = testutil::partner_run("q");
        let mut profile = (*testutil::partner_profile()).clone();
        profile.tool_access_policy.allowed_toolsets = vec!["echo".into()];

        partner.state.lock().allowed_toolsets = Some(vec!["flow_control".into()]);
        let specs = run.runtime.tools.effective_specs_for(&profile, &partner);
        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        assert!(!names.contains(&"echo"));
        assert!(names.contains(&"finish_flow"));
    }

    #[test]
    fn prompt_formatting_groups_by_toolset() {
        let specs = vec![
            ToolSpec::new("a_tool", "Does A.", json!({"type": "object", "required": ["x"]}))
                .with_toolset("alpha"),
            ToolSpec::new("b_tool", "Does B.", json!({"type": "object"})).with_toolset("beta"),
        ];
        let rendered = format_tools_for_prompt(&specs);
        assert!(rendered.contains("#### Toolset: `alpha`"));
        assert!(rendered.contains("- **a_tool**: Does A."));
        assert!(rendered.contains("Required parameters: x"));
        assert!(rendered.contains("#### Toolset: `beta`"));
    }

    #[test]
    fn empty_specs_render_placeholder() {
        assert_eq!(format_tools_for_prompt(&[]), "No tools are currently available.");
    }
}
