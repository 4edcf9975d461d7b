//! The turn ledger model — one record per agent activity on the causal DAG.
//!
//! Turns are append-only: once in `TeamState.turns`, only status and
//! end-time style updates are applied, and only by the turn manager.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::messages::ToolCall;

/// What kind of activity a turn records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnType {
    /// A full prepare → LLM → post cycle of one agent.
    AgentTurn,
    /// A user prompt entering the ledger.
    UserTurn,
    /// Fan-in of N parallel sub-flows after a dispatch.
    AggregationTurn,
    /// System marker separating a force-restarted flow.
    RestartDelimiterTurn,
}

/// Turn lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    /// In flight.
    Running,
    /// Finished normally.
    Completed,
    /// Failed.
    Error,
    /// Cancelled by a flow-level cancel signal.
    Cancelled,
    /// Cut short by a forced restart or a crash-restore.
    Interrupted,
}

/// Identity of the agent that produced a turn.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Runtime agent id (e.g. `Partner`, `Assoc_WebSearcher_3`).
    pub agent_id: String,
    /// Logical profile name the agent was built from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_logical_name: Option<String>,
    /// Profile instance id (catalog revision binding).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_instance_id: Option<String>,
    /// Role name assigned at dispatch time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_role_name: Option<String>,
}

/// Per-stream LLM attempt status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// Stream opened, outcome not yet known.
    Pending,
    /// Aggregated successfully.
    Success,
    /// Failed or force-retried.
    Failed,
}

/// One LLM stream attempt inside a turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LlmAttempt {
    /// Stream id tagged onto every chunk event.
    pub stream_id: String,
    /// Attempt outcome.
    pub status: AttemptStatus,
    /// Error detail for failed attempts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// LLM interaction lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmInteractionStatus {
    /// Call in flight.
    Running,
    /// Final response recorded.
    Completed,
    /// Failed terminally.
    Error,
    /// Cancelled mid-stream.
    Cancelled,
}

/// Token counts attached to a turn, either predicted or provider-reported.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageNumbers {
    /// Prompt-side tokens.
    #[serde(default)]
    pub prompt_tokens: u64,
    /// Completion-side tokens.
    #[serde(default)]
    pub completion_tokens: u64,
    /// Combined total.
    #[serde(default)]
    pub total_tokens: u64,
}

/// The model's final aggregated response for a turn.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalResponse {
    /// Text content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Tool calls (at most one survives post-processing).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Reasoning text, if streamed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// Model id the provider reported serving the call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id_used: Option<String>,
}

/// Audit record of the LLM call inside a turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LlmInteraction {
    /// Interaction status.
    pub status: LlmInteractionStatus,
    /// Every stream attempt, in order.
    pub attempts: Vec<LlmAttempt>,
    /// Full request payload, captured only when audit capture is enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_request: Option<Value>,
    /// Final aggregated response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_response: Option<FinalResponse>,
    /// Tokens predicted before the call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predicted_usage: Option<UsageNumbers>,
    /// Tokens reported by the provider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_usage: Option<UsageNumbers>,
}

impl LlmInteraction {
    /// A fresh running interaction with one pending stream attempt.
    pub fn started(stream_id: impl Into<String>) -> Self {
        Self {
            status: LlmInteractionStatus::Running,
            attempts: vec![LlmAttempt {
                stream_id: stream_id.into(),
                status: AttemptStatus::Pending,
                error: None,
            }],
            final_request: None,
            final_response: None,
            predicted_usage: None,
            actual_usage: None,
        }
    }
}

/// Tool interaction lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolInteractionStatus {
    /// Tool launched, result not yet ingested.
    Running,
    /// Result ingested successfully.
    Completed,
    /// Result ingested with an error flag.
    Error,
    /// Closed by flow cancellation.
    Cancelled,
    /// Closed by a forced restart or crash-restore.
    Interrupted,
}

/// Record of a single tool call within a turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolInteraction {
    /// Provider-assigned tool call id.
    pub tool_call_id: String,
    /// Tool name.
    pub tool_name: String,
    /// Launch time.
    pub start_time: String,
    /// Close time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    /// Interaction status.
    pub status: ToolInteractionStatus,
    /// Parsed call arguments.
    pub input_params: Value,
    /// Result payload once the TOOL_RESULT is ingested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_payload: Option<Value>,
    /// Error detail for failed interactions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
}

/// Where the handling strategy for an inbox item came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategySource {
    /// Profile-level `inbox_handling_strategies` override.
    Profile,
    /// Global strategy registry.
    Global,
    /// Markdown-formatter fallback.
    Fallback,
}

/// Log entry for one processed inbox item.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessedItemLog {
    /// Inbox item id.
    pub item_id: String,
    /// Inbox source name.
    pub source: String,
    /// Observer that produced the item, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggering_observer_id: Option<String>,
    /// Strategy lookup tier that handled the item.
    pub handling_strategy_source: StrategySource,
    /// Ingestor name used.
    pub ingestor_used: String,
    /// Injection mode applied.
    pub injection_mode: String,
    /// The rendered text that was injected.
    pub injected_content: String,
    /// Predicted token count of the rendered text.
    #[serde(default)]
    pub predicted_token_count: u64,
    /// For TOOL_RESULT items: the responding tool call id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

/// Log entry for one system-prompt segment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentLog {
    /// Segment id from the profile.
    pub segment_id: String,
    /// Ordering key.
    pub order: i64,
    /// Segment type name.
    pub segment_type: String,
    /// Whether the condition evaluated true.
    pub condition_met: bool,
    /// What was rendered (empty when skipped).
    pub rendered_content: String,
}

/// System prompt construction log: segment-by-segment plus the final text.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemPromptLog {
    /// Per-segment evaluations.
    pub log: Vec<SegmentLog>,
    /// Assembled prompt.
    pub final_prompt: String,
}

/// Structured inputs of a turn for traceability.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnInputs {
    /// Every inbox item touched this turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub processed_inbox_items: Vec<ProcessedItemLog>,
    /// System prompt construction log.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt_construction: Option<SystemPromptLog>,
    /// For user turns: the raw prompt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// For delimiter turns: why the marker exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// For aggregation turns: how many sub-flows were gathered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_turn_count: Option<usize>,
}

/// One activity on the causal DAG.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Unique turn id.
    pub turn_id: String,
    /// Owning run.
    pub run_id: String,
    /// Groups sibling turns in a continuous execution stream.
    pub flow_id: String,
    /// Who produced the turn.
    pub agent_info: AgentInfo,
    /// Activity kind.
    pub turn_type: TurnType,
    /// Lifecycle status.
    pub status: TurnStatus,
    /// Start time.
    pub start_time: String,
    /// End time, set on finalization.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    /// Parents in the DAG (length 1 normally, N for aggregation turns).
    #[serde(default)]
    pub source_turn_ids: Vec<String>,
    /// The tool call whose result caused this turn, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_tool_call_id: Option<String>,
    /// Processed inputs.
    #[serde(default)]
    pub inputs: TurnInputs,
    /// Decision outputs (e.g. `{"next_action": "end"}`).
    #[serde(default)]
    pub outputs: Map<String, Value>,
    /// LLM call audit, absent for non-agent turns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_interaction: Option<LlmInteraction>,
    /// Tool calls issued in this turn.
    #[serde(default)]
    pub tool_interactions: Vec<ToolInteraction>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Error detail for failed turns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
}

impl Turn {
    /// Whether every tool interaction on this turn has been closed.
    pub fn tool_interactions_closed(&self) -> bool {
        self.tool_interactions
            .iter()
            .all(|ti| ti.status != ToolInteractionStatus::Running)
    }
}
