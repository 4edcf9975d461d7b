//! Chat messages in chat-completion wire shape.
//!
//! [`ChatMessage`] carries a few internal-only fields (`id`, `turn_id`,
//! `timestamp`) used by the runtime for placeholder patching and ledger
//! cross-referencing. [`ChatMessage::clean_for_llm`] strips them back down
//! to the wire fields before a request leaves the process.

use serde::{Deserialize, Serialize};

use crate::ids;

/// Message role.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// End-user input.
    User,
    /// Model output.
    Assistant,
    /// Tool result addressed to a prior tool call.
    Tool,
}

/// The function half of a tool call: name plus raw JSON argument string.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolFunction {
    /// Tool name.
    pub name: String,
    /// Raw JSON arguments as streamed by the model.
    pub arguments: String,
}

/// A tool call emitted by an assistant message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call id; tool responses must echo it.
    pub id: String,
    /// Always `"function"` for the providers we speak to.
    #[serde(rename = "type", default = "default_call_kind")]
    pub kind: String,
    /// Name and arguments.
    pub function: ToolFunction,
}

fn default_call_kind() -> String {
    "function".to_string()
}

impl ToolCall {
    /// Construct a function call with the given id, name, and raw arguments.
    pub fn function(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: default_call_kind(),
            function: ToolFunction {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// A single chat message.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role of the speaker.
    pub role: Role,
    /// Text content. Always present on the wire (may be empty).
    pub content: String,
    /// Model reasoning text, when the provider streams it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    /// Tool calls emitted by an assistant message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// For `role == tool`: the call this message responds to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// For `role == tool`: the tool name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Internal: placeholder message id for in-place stream patching.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Internal: the ledger turn that produced this message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    /// Internal: creation timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl Default for Role {
    fn default() -> Self {
        Role::User
    }
}

impl ChatMessage {
    /// A user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: Some(ids::now_iso()),
            ..Self::default()
        }
    }

    /// A system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            timestamp: Some(ids::now_iso()),
            ..Self::default()
        }
    }

    /// An assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Some(ids::now_iso()),
            ..Self::default()
        }
    }

    /// A tool-result message responding to `tool_call_id`.
    pub fn tool(content: impl Into<String>, tool_call_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
            timestamp: Some(ids::now_iso()),
            ..Self::default()
        }
    }

    /// Strip internal bookkeeping fields, keeping only what the LLM API
    /// accepts: role, content, tool_calls, tool_call_id, name.
    pub fn clean_for_llm(&self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            content: self.content.clone(),
            reasoning_content: None,
            tool_calls: self.tool_calls.clone(),
            tool_call_id: self.tool_call_id.clone(),
            name: self.name.clone(),
            id: None,
            turn_id: None,
            timestamp: None,
        }
    }

    /// Tool-call ids emitted by this message (empty for non-assistant roles).
    pub fn tool_call_ids(&self) -> Vec<&str> {
        self.tool_calls
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|tc| tc.id.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_without_internal_fields_when_unset() {
        let msg = ChatMessage {
            role: Role::User,
            content: "hi".into(),
            ..ChatMessage::default()
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v, json!({"role": "user", "content": "hi"}));
    }

    #[test]
    fn tool_message_carries_call_id_and_name() {
        let msg = ChatMessage::tool("done", "call_1", "echo");
        let v = serde_json::to_value(msg.clean_for_llm()).unwrap();
        assert_eq!(v["role"], "tool");
        assert_eq!(v["tool_call_id"], "call_1");
        assert_eq!(v["name"], "echo");
    }

    #[test]
    fn clean_for_llm_strips_bookkeeping() {
        let mut msg = ChatMessage::assistant("x");
        msg.id = Some("msg_s1".into());
        msg.turn_id = Some("turn_a_1".into());
        msg.reasoning_content = Some("thinking".into());

        let cleaned = msg.clean_for_llm();
        assert!(cleaned.id.is_none());
        assert!(cleaned.turn_id.is_none());
        assert!(cleaned.reasoning_content.is_none());
        assert!(cleaned.timestamp.is_none());
        assert_eq!(cleaned.content, "x");
    }

    #[test]
    fn tool_call_roundtrips_with_type_field() {
        let tc = ToolCall::function("call_9", "search", r#"{"q":"x"}"#);
        let v = serde_json::to_value(&tc).unwrap();
        assert_eq!(v["type"], "function");
        let back: ToolCall = serde_json::from_value(v).unwrap();
        assert_eq!(back, tc);
    }

    #[test]
    fn tool_call_ids_lists_all_calls() {
        let mut msg = ChatMessage::assistant("");
        msg.tool_calls = Some(vec![
            ToolCall::function("c1", "a", "{}"),
            ToolCall::function("c2", "b", "{}"),
        ]);
        assert_eq!(msg.tool_call_ids(), vec!["c1", "c2"]);
        assert!(ChatMessage::user("x").tool_call_ids().is_empty());
    }
}
