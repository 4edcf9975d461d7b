//! Request, stream-delta, and outcome types for the transport.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use troika_core::messages::{ChatMessage, ToolCall};
use troika_core::turn::{LlmAttempt, UsageNumbers};

/// One chat-completion request as the agent loop hands it over.
#[derive(Clone, Debug, Default)]
pub struct ChatRequest {
    /// Wire-cleaned conversation messages.
    pub messages: Vec<ChatMessage>,
    /// System prompt; replaces or prepends the leading system message.
    pub system_prompt: Option<String>,
    /// Tool definitions in API shape.
    pub tools: Vec<Value>,
    /// Tool choice directive, if forced.
    pub tool_choice: Option<String>,
}

/// Incremental tool-call fragment inside one stream chunk.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    /// Parallel-call slot index.
    #[serde(default)]
    pub index: usize,
    /// Call id, present on the first fragment of a slot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Tool name fragment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Raw JSON arguments fragment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// One parsed streaming delta, provider-agnostic.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamDelta {
    /// Assistant text fragment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Reasoning text fragment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    /// Tool-call fragments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallDelta>,
    /// Usage summary, typically on the final chunk.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageNumbers>,
    /// Model id serving the stream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl StreamDelta {
    /// A pure text delta.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }
}

/// What the agent loop receives from a call. Application-level failures
/// are data (`error` set), never an `Err`, so the loop can fail the turn
/// without exception-driven control flow.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmOutcome {
    /// Aggregated assistant text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Aggregated reasoning text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// Aggregated tool calls (arguments JSON-repaired).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Model id the provider reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id_used: Option<String>,
    /// Provider-reported usage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_usage: Option<UsageNumbers>,
    /// Every stream attempt made for this call, in order.
    #[serde(default)]
    pub attempts: Vec<LlmAttempt>,
    /// The stream id of the attempt that produced the result.
    #[serde(default)]
    pub final_stream_id: String,
    /// Error message, when the call failed terminally.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Error type tag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

impl LlmOutcome {
    /// Whether the call failed terminally.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_error_flag() {
        let ok = LlmOutcome {
            content: Some("hi".into()),
            ..LlmOutcome::default()
        };
        assert!(!ok.is_error());

        let bad = LlmOutcome {
            error: Some("boom".into()),
            error_type: Some("Auth".into()),
            ..LlmOutcome::default()
        };
        assert!(bad.is_error());
    }

    #[test]
    fn delta_text_helper() {
        let d = StreamDelta::text("abc");
        assert_eq!(d.content.as_deref(), Some("abc"));
        assert!(d.tool_calls.is_empty());
    }
}
