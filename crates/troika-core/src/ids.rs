//! Id constructors and timestamps.
//!
//! All runtime ids are short hex fragments with a type-revealing prefix so a
//! raw ledger dump stays readable (`turn_Partner_3fa9c1d2`,
//! `flow_root_9b01aa7c`, `agg_call_17`). Aggregation turns reuse the
//! dispatch tool-call id so one dispatch maps to exactly one aggregation.

use chrono::{SecondsFormat, Utc};
use uuid::Uuid;

/// A lowercase hex fragment of the given length (max 32).
pub fn short_hex(len: usize) -> String {
    let mut s = Uuid::new_v4().simple().to_string();
    s.truncate(len.min(32));
    s
}

/// Current UTC time as RFC 3339 with microsecond precision.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Id for a new run.
pub fn run_id() -> String {
    format!("run_{}", short_hex(12))
}

/// Id for an agent turn, embedding the owning agent id.
pub fn turn_id(agent_id: &str) -> String {
    format!("turn_{agent_id}_{}", short_hex(8))
}

/// Id for a user turn.
pub fn user_turn_id() -> String {
    format!("turn_user_{}", short_hex(8))
}

/// Id for a new root flow.
pub fn flow_id() -> String {
    format!("flow_root_{}", short_hex(8))
}

/// Id for a flow rooted at a user turn with no prior baton.
pub fn user_flow_id() -> String {
    format!("flow_user_root_{}", short_hex(8))
}

/// Id for a restart delimiter turn.
pub fn delimiter_turn_id() -> String {
    format!("delimiter_{}", short_hex(8))
}

/// Id for an aggregation turn, derived from the dispatch tool-call id.
pub fn aggregation_turn_id(dispatch_tool_call_id: &str) -> String {
    format!("agg_{dispatch_tool_call_id}")
}

/// Id for an inbox item.
pub fn inbox_item_id() -> String {
    format!("inbox_{}", short_hex(8))
}

/// Id for an LLM stream attempt, embedding the agent id.
pub fn stream_id(agent_id: &str) -> String {
    format!("stream_{agent_id}_{}", short_hex(8))
}

/// Id for the placeholder assistant message tied to a stream.
pub fn placeholder_message_id(stream_id: &str) -> String {
    format!("msg_{stream_id}")
}

/// Id for a knowledge-base item.
pub fn kb_item_id() -> String {
    format!("kb_{}", short_hex(32))
}
