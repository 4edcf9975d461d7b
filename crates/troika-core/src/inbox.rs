//! The inbox model: typed events awaiting ingestion into an agent's prompt.
//!
//! Sources are plain strings drawn from a registered vocabulary so profiles
//! can introduce new ones without a code change; the well-known names live
//! in [`source`]. Priorities guarantee tool results are always fed before
//! new user input, preserving tool-call symmetry.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids;

/// Well-known inbox source names.
pub mod source {
    /// Result of a tool invocation.
    pub const TOOL_RESULT: &str = "TOOL_RESULT";
    /// A declared observer failed; surfaced in-band.
    pub const OBSERVER_FAILURE: &str = "OBSERVER_FAILURE";
    /// Briefing payload handed to a freshly spawned agent.
    pub const AGENT_STARTUP_BRIEFING: &str = "AGENT_STARTUP_BRIEFING";
    /// Directive from the Partner to a running Principal.
    pub const PARTNER_DIRECTIVE: &str = "PARTNER_DIRECTIVE";
    /// The Principal flow finished; notifies the Partner.
    pub const PRINCIPAL_COMPLETED: &str = "PRINCIPAL_COMPLETED";
    /// Internal control directive.
    pub const INTERNAL_DIRECTIVE: &str = "INTERNAL_DIRECTIVE";
    /// Self-prompt injected by the flow decider.
    pub const SELF_REFLECTION_PROMPT: &str = "SELF_REFLECTION_PROMPT";
    /// Background rollup of work-module statuses.
    pub const WORK_MODULES_STATUS_UPDATE: &str = "WORK_MODULES_STATUS_UPDATE";
    /// Background summary of recent Principal activity.
    pub const PRINCIPAL_ACTIVITY_UPDATE: &str = "PRINCIPAL_ACTIVITY_UPDATE";
    /// New end-user input.
    pub const USER_PROMPT: &str = "USER_PROMPT";
}

/// Ingestion priority for a source; lower is fed to the prompt first.
/// Unknown sources land just below USER_PROMPT.
pub fn priority_for(src: &str) -> u8 {
    match src {
        source::TOOL_RESULT => 0,
        source::OBSERVER_FAILURE => 5,
        source::AGENT_STARTUP_BRIEFING => 8,
        source::PARTNER_DIRECTIVE | source::PRINCIPAL_COMPLETED => 10,
        source::INTERNAL_DIRECTIVE => 15,
        source::SELF_REFLECTION_PROMPT => 20,
        source::WORK_MODULES_STATUS_UPDATE | source::PRINCIPAL_ACTIVITY_UPDATE => 90,
        source::USER_PROMPT => 100,
        _ => 99,
    }
}

/// What happens to an item after ingestion.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumptionPolicy {
    /// Removed after its first ingestion.
    #[default]
    ConsumeOnRead,
    /// Re-ingested every turn until its TTL expires.
    PersistentUntilConsumed,
}

/// Bookkeeping attached to an inbox item.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InboxMetadata {
    /// Creation time.
    #[serde(default)]
    pub created_at: String,
    /// TTL in turns for persistent items.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_turns_in_inbox: Option<u32>,
    /// How many turns the item has already survived.
    #[serde(default)]
    pub turn_count_in_inbox: u32,
    /// Observer that created the item, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggering_observer_id: Option<String>,
}

/// A typed event awaiting ingestion into the agent's next prompt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InboxItem {
    /// Unique item id.
    pub item_id: String,
    /// Source name from the registered vocabulary.
    pub source: String,
    /// Arbitrary structured payload.
    pub payload: Value,
    /// Consumption policy.
    #[serde(default)]
    pub consumption_policy: ConsumptionPolicy,
    /// Bookkeeping.
    #[serde(default)]
    pub metadata: InboxMetadata,
}

impl InboxItem {
    /// A consume-on-read item with a fresh id and timestamp.
    pub fn new(src: impl Into<String>, payload: Value) -> Self {
        Self {
            item_id: ids::inbox_item_id(),
            source: src.into(),
            payload,
            consumption_policy: ConsumptionPolicy::ConsumeOnRead,
            metadata: InboxMetadata {
                created_at: ids::now_iso(),
                ..InboxMetadata::default()
            },
        }
    }

    /// Same, but persistent with a TTL bound.
    pub fn persistent(src: impl Into<String>, payload: Value, max_turns: u32) -> Self {
        let mut item = Self::new(src, payload);
        item.consumption_policy = ConsumptionPolicy::PersistentUntilConsumed;
        item.metadata.max_turns_in_inbox = Some(max_turns);
        item
    }

    /// Tag the item with the observer that produced it.
    pub fn from_observer(mut self, observer_id: impl Into<String>) -> Self {
        self.metadata.triggering_observer_id = Some(observer_id.into());
        self
    }

    /// A TOOL_RESULT item carrying the standard result payload shape.
    pub fn tool_result(tool_name: &str, tool_call_id: &str, content: Value, is_error: bool) -> Self {
        Self::new(
            source::TOOL_RESULT,
            serde_json::json!({
                "tool_name": tool_name,
                "tool_call_id": tool_call_id,
                "is_error": is_error,
                "content": content,
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn priorities_order_tool_results_first() {
        assert!(priority_for(source::TOOL_RESULT) < priority_for(source::OBSERVER_FAILURE));
        assert!(priority_for(source::AGENT_STARTUP_BRIEFING) < priority_for(source::USER_PROMPT));
        assert!(priority_for(source::SELF_REFLECTION_PROMPT) < priority_for(source::WORK_MODULES_STATUS_UPDATE));
        // Unknown sources sort below everything except USER_PROMPT
        assert!(priority_for("SOMETHING_ELSE") < priority_for(source::USER_PROMPT));
        assert_eq!(priority_for("SOMETHING_ELSE"), 99);
    }

    #[test]
    fn new_item_defaults_to_consume_on_read() {
        let item = InboxItem::new(source::USER_PROMPT, json!({"prompt": "hi"}));
        assert_eq!(item.consumption_policy, ConsumptionPolicy::ConsumeOnRead);
        assert!(item.item_id.starts_with("inbox_"));
        assert!(!item.metadata.created_at.is_empty());
    }

    #[test]
    fn persistent_item_carries_ttl() {
        let item = InboxItem::persistent("WORK_MODULES_STATUS_UPDATE", json!({}), 3);
        assert_eq!(item.consumption_policy, ConsumptionPolicy::PersistentUntilConsumed);
        assert_eq!(item.metadata.max_turns_in_inbox, Some(3));
        assert_eq!(item.metadata.turn_count_in_inbox, 0);
    }

    #[test]
    fn tool_result_payload_shape() {
        let item = InboxItem::tool_result("echo", "c1", json!({"echoed": "x"}), false);
        assert_eq!(item.source, source::TOOL_RESULT);
        assert_eq!(item.payload["tool_call_id"], "c1");
        assert_eq!(item.payload["is_error"], false);
        assert_eq!(item.payload["content"]["echoed"], "x");
    }

    #[test]
    fn observer_tagging() {
        let item = InboxItem::new(source::OBSERVER_FAILURE, json!({})).from_observer("obs_1");
        assert_eq!(item.metadata.triggering_observer_id.as_deref(), Some("obs_1"));
    }
}
