//! The tool contract: registry-facing specs and the uniform response
//! envelope every tool returns.
//!
//! Custom `x-*` schema fields (e.g. `x-handover-title`) stay on the registry
//! entry for internal use and are stripped from the copy published to LLMs.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// How a tool is implemented.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolImplementation {
    /// In-process Rust implementation.
    #[default]
    Internal,
    /// Routed to a remote server through the external proxy.
    ExternalProxy,
}

/// Registry-facing description of a tool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Unique tool name (`server.tool` composite for external tools).
    pub name: String,
    /// Description shown to the LLM.
    pub description: String,
    /// JSON-schema parameters.
    pub parameters: Value,
    /// If true, the flow terminates after this tool's post-processing.
    #[serde(default)]
    pub ends_flow: bool,
    /// Toolset grouping for access policies.
    pub toolset_name: String,
    /// Implementation kind.
    #[serde(default)]
    pub implementation: ToolImplementation,
    /// Handover protocol whose parameters are merged into the schema.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handover_protocol: Option<String>,
    /// Default KB item type for knowledge contributed by this tool.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_knowledge_item_type: Option<String>,
}

impl ToolSpec {
    /// A minimal internal tool spec; the toolset defaults to the tool name.
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        let name = name.into();
        Self {
            toolset_name: name.clone(),
            name,
            description: description.into(),
            parameters,
            ends_flow: false,
            implementation: ToolImplementation::Internal,
            handover_protocol: None,
            default_knowledge_item_type: None,
        }
    }

    /// Set the toolset grouping.
    pub fn with_toolset(mut self, toolset: impl Into<String>) -> Self {
        self.toolset_name = toolset.into();
        self
    }

    /// Mark the tool flow-ending.
    pub fn ends_flow(mut self) -> Self {
        self.ends_flow = true;
        self
    }

    /// Bind a handover protocol.
    pub fn with_handover(mut self, protocol: impl Into<String>) -> Self {
        self.handover_protocol = Some(protocol.into());
        self
    }

    /// The schema as published to LLMs: `x-*` fields removed.
    pub fn api_parameters(&self) -> Value {
        sanitize_schema_for_api(&self.parameters)
    }

    /// The full function-call definition published to LLMs.
    pub fn api_definition(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.api_parameters(),
            }
        })
    }
}

/// Recursively remove keys starting with `x-` from a JSON-schema value.
pub fn sanitize_schema_for_api(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !k.starts_with("x-"))
                .map(|(k, v)| (k.clone(), sanitize_schema_for_api(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_schema_for_api).collect()),
        other => other.clone(),
    }
}

/// Tool outcome discriminator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    /// The tool produced a usable payload.
    Success,
    /// The tool failed; payload carries `error_message`.
    Error,
}

/// A knowledge item contributed by a tool alongside its result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeContribution {
    /// KB item type.
    pub item_type: String,
    /// Content to store.
    pub content: Value,
    /// Canonical source URI for deduplication.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_uri: Option<String>,
    /// Extra metadata merged into the KB item.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// The standard envelope every tool returns. The surrounding framework
/// converts it to a TOOL_RESULT inbox item and commits the KB items.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    /// Outcome.
    pub status: ToolStatus,
    /// Result payload, or `{"error_message": ...}` on error.
    pub payload: Value,
    /// Knowledge items to commit.
    #[serde(
        rename = "_knowledge_items_to_add",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub knowledge_items: Vec<KnowledgeContribution>,
}

impl ToolResponse {
    /// A success envelope.
    pub fn success(payload: Value) -> Self {
        Self {
            status: ToolStatus::Success,
            payload,
            knowledge_items: Vec::new(),
        }
    }

    /// An error envelope with a message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Error,
            payload: json!({"error_message": message.into()}),
            knowledge_items: Vec::new(),
        }
    }

    /// Attach a knowledge contribution.
    pub fn with_knowledge(mut self, item: KnowledgeContribution) -> Self {
        self.knowledge_items.push(item);
        self
    }

    /// Whether this envelope reports an error.
    pub fn is_error(&self) -> bool {
        self.status == ToolStatus::Error
    }
}
