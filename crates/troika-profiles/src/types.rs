//! Declarative profile and protocol types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use troika_core::inbox::ConsumptionPolicy;

/// The three cooperating agent roles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileType {
    /// Long-running, user-facing supervisor.
    Partner,
    /// Top-level planner/executor per run.
    Principal,
    /// Tool-focused worker spawned per work module.
    Associate,
}

/// System-prompt segment kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    /// Text from `text_definitions` (or inline `content`).
    StaticText,
    /// A context value, optionally rendered through an ingestor.
    StateValue,
    /// The agent's effective tool catalog, grouped by toolset.
    ToolDescription,
}

/// One declared system-prompt segment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PromptSegment {
    /// Segment id, used in construction logs.
    pub id: String,
    /// Ordering key (ascending).
    #[serde(default = "default_order")]
    pub order: i64,
    /// Segment kind.
    #[serde(rename = "type")]
    pub kind: SegmentKind,
    /// Render condition; absent means always.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Key into `text_definitions` for static text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_key: Option<String>,
    /// Inline fallback text for static segments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// V-model path for state-value segments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_state_path: Option<String>,
    /// Ingestor rendering a state value, when one is declared.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingestor_id: Option<String>,
    /// Parameters for that ingestor.
    #[serde(default)]
    pub ingestor_params: Map<String, Value>,
}

fn default_order() -> i64 {
    99
}

/// Profile-level override for how an inbox source is ingested.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StrategyOverride {
    /// Inbox source this override applies to.
    pub source: String,
    /// Ingestor name; defaults to the markdown formatter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingestor: Option<String>,
    /// Injection mode; defaults to appending a new message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub injection_mode: Option<InjectionMode>,
    /// Extra ingestor params (role, titles, renames...).
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// How rendered text enters the message list.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionMode {
    /// Append a new `{role, content}` message.
    #[default]
    AppendAsNewMessage,
    /// Prepend to the first existing message of the role, else append.
    PrependToRole,
}

/// Declarative observer rule, run pre- or post-turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObserverRule {
    /// Rule id, reported on failures.
    pub id: String,
    /// Trigger condition; absent means always.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// What to do when the condition holds.
    pub action: ObserverAction,
}

/// Observer actions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObserverAction {
    /// Create an inbox item on the agent itself.
    AddToInbox {
        /// Item template; payload may be a `{{ path }}` reference.
        inbox_item: InboxItemTemplate,
    },
    /// Apply ordered state updates.
    UpdateState {
        /// Updates, applied in order.
        updates: Vec<StateUpdateOp>,
    },
}

/// Template for an observer-created inbox item.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InboxItemTemplate {
    /// Inbox source name.
    pub source: String,
    /// Literal payload, or a single `{{ path }}` reference resolved at
    /// fire time.
    #[serde(default)]
    pub payload: Value,
    /// Consumption policy; defaults to consume-on-read.
    #[serde(default)]
    pub consumption_policy: ConsumptionPolicy,
    /// TTL bound for persistent items.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_turns_in_inbox: Option<u32>,
}

/// One state update inside an `update_state` observer action.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateUpdateOp {
    /// Operation kind.
    pub operation: UpdateOp,
    /// Dot path into agent state.
    pub path: String,
    /// Value for `set`; ignored for `increment`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// State update operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOp {
    /// Set the path to `value`.
    Set,
    /// Numeric increment (missing treated as 0).
    Increment,
}

/// One flow-decider rule; rules are evaluated top-down, first match wins.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeciderRule {
    /// Rule id for logs.
    pub id: String,
    /// Match condition.
    pub condition: String,
    /// Action when matched.
    pub action: DeciderAction,
}

/// Flow-decider actions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeciderAction {
    /// Route the next iteration to the chosen tool, then loop back.
    ContinueWithTool,
    /// Terminate the flow with an outcome.
    EndAgentTurn {
        /// Outcome label (`success`, `error`, ...).
        #[serde(default = "default_outcome")]
        outcome: String,
        /// Error detail for failed outcomes.
        #[serde(skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    /// Inject a SELF_REFLECTION_PROMPT item then loop.
    LoopWithInboxItem {
        /// Payload for the reflection item (usually `{content_key: ...}`).
        payload: Value,
    },
    /// Park until new user input arrives. Partner-only.
    AwaitUserInput,
}

fn default_outcome() -> String {
    "success".to_string()
}

/// Toolsets and individual tools an agent may use.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolAccessPolicy {
    /// Allowed toolset names.
    #[serde(default)]
    pub allowed_toolsets: Vec<String>,
    /// Individually allowed tool names.
    #[serde(default)]
    pub allowed_individual_tools: Vec<String>,
}

/// System-prompt construction block.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemPromptConstruction {
    /// Declared segments, sorted by `order` at build time.
    #[serde(default)]
    pub system_prompt_segments: Vec<PromptSegment>,
}

/// A complete agent profile. Flat and immutable once loaded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    /// Profile instance id (catalog key).
    pub profile_id: String,
    /// Logical name (`Partner`, `Associate_WebSearcher`, ...).
    pub name: String,
    /// Role this profile drives.
    #[serde(rename = "type")]
    pub profile_type: ProfileType,
    /// Named LLM config this profile calls with.
    pub llm_config_ref: String,
    /// Human-oriented description used in staffing lists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description_for_human: Option<String>,
    /// System prompt declaration.
    #[serde(default)]
    pub system_prompt_construction: SystemPromptConstruction,
    /// Named text templates referenced by segments and ingestors.
    #[serde(default)]
    pub text_definitions: BTreeMap<String, String>,
    /// Tool access policy.
    #[serde(default)]
    pub tool_access_policy: ToolAccessPolicy,
    /// Inbox strategy overrides.
    #[serde(default)]
    pub inbox_handling_strategies: Vec<StrategyOverride>,
    /// Observers run before prompt construction.
    #[serde(default)]
    pub pre_turn_observers: Vec<ObserverRule>,
    /// Observers run after post-processing.
    #[serde(default)]
    pub post_turn_observers: Vec<ObserverRule>,
    /// The flow decider rule list.
    #[serde(default)]
    pub flow_decider: Vec<DeciderRule>,
    /// Whether this profile may be staffed onto runs.
    #[serde(default)]
    pub available_for_staffing: bool,
    /// Active flag.
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Tombstone flag.
    #[serde(default)]
    pub is_deleted: bool,
    /// Revision counter.
    #[serde(default)]
    pub rev: u32,
}

fn default_true() -> bool {
    true
}

/// Source half of a handover inheritance rule.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FromSource {
    /// Resolve a single templated path.
    Single {
        /// Path template with `{{ placeholder }}` slots.
        path: String,
        /// Placeholder → source-path substitutions.
        replace: BTreeMap<String, String>,
    },
    /// Iterate a list-valued path, aggregating results.
    Iterate {
        /// Path template iterated per element.
        path_to_iterate: String,
        /// Placeholder → list-path producing the iteration values.
        iterate_on: BTreeMap<String, String>,
    },
}

/// One inheritance rule in a handover protocol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InheritanceRule {
    /// Evaluation condition against the parent context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Where the data comes from.
    pub from_source: FromSource,
    /// Key under which resolved data lands in the briefing payload.
    pub as_payload_key: String,
    /// Rendering title for the key.
    #[serde(rename = "x-handover-title", skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Extra rendering schema merged into the companion schema.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

/// Target item declaration for a handover protocol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetInboxItem {
    /// Inbox source name for the generated briefing item.
    pub source: String,
}

/// A named parent→child context transfer protocol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HandoverProtocol {
    /// Protocol name tools reference.
    pub protocol_name: String,
    /// JSON-schema fragment of direct tool parameters.
    #[serde(default)]
    pub context_parameters: Value,
    /// Ordered inheritance rules.
    #[serde(default)]
    pub inheritance: Vec<InheritanceRule>,
    /// Inbox item declaration for the generated briefing.
    pub target_inbox_item: TargetInboxItem,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn minimal_profile_deserializes_with_defaults() {
        let profile: AgentProfile = serde_json::from_value(json!({
            "profile_id": "p-1",
            "name": "Partner",
            "type": "partner",
            "llm_config_ref": "main"
        }))
        .unwrap();
        assert!(profile.is_active);
        assert!(!profile.is_deleted);
        assert!(profile.flow_decider.is_empty());
        assert_eq!(profile.profile_type, ProfileType::Partner);
    }

    #[test]
    fn decider_action_tags() {
        let action: DeciderAction = serde_json::from_value(json!({
            "type": "end_agent_turn",
            "outcome": "success"
        }))
        .unwrap();
        assert_matches(&action);

        fn assert_matches(a: &DeciderAction) {
            match a {
                DeciderAction::EndAgentTurn { outcome, .. } => assert_eq!(outcome, "success"),
                other => panic!("wrong action: {other:?}"),
            }
        }
    }

    #[test]
    fn observer_action_roundtrip() {
        let rule: ObserverRule = serde_json::from_value(json!({
            "id": "track_turns",
            "condition": "True",
            "action": {
                "type": "update_state",
                "updates": [{"operation": "increment", "path": "counters.turns"}]
            }
        }))
        .unwrap();
        match &rule.action {
            ObserverAction::UpdateState { updates } => {
                assert_eq!(updates[0].operation, UpdateOp::Increment);
            }
            other => panic!("wrong action: {other:?}"),
        }
    }

    #[test]
    fn from_source_untagged_variants() {
        let single: FromSource = serde_json::from_value(json!({
            "path": "team.work_modules.{{ module_id }}",
            "replace": {"module_id": "state.current_action.module_id_to_assign"}
        }))
        .unwrap();
        match single {
            FromSource::Single { .. } => {}
            other => panic!("expected single: {other:?}"),
        }

        let iterate: FromSource = serde_json::from_value(json!({
            "path_to_iterate": "team.work_modules.{{ id }}.context_archive",
            "iterate_on": {"id": "state.current_action.inherit_from_modules"}
        }))
        .unwrap();
        match iterate {
            FromSource::Iterate { .. } => {}
            other => panic!("expected iterate: {other:?}"),
        }
    }

    #[test]
    fn segment_order_defaults_to_99() {
        let seg: PromptSegment = serde_json::from_value(json!({
            "id": "intro",
            "type": "static_text",
            "content_key": "intro_text"
        }))
        .unwrap();
        assert_eq!(seg.order, 99);
        assert_eq!(seg.kind, SegmentKind::StaticText);
    }
}
