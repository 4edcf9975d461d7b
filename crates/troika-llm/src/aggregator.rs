//! Streaming aggregation: accumulate content, reasoning, and per-index
//! tool-call deltas into one response.
//!
//! Two aggregation-level signals exist:
//!
//! - **Injection guard**: `<tool_call>` / `<tool_code>` literals in content
//!   mean the model is faking tool calls in text instead of using the
//!   native channel — the stream is abandoned and retried.
//! - **Empty response**: zero content and zero tool calls at stream end
//!   raise the force-retry signal handled by the client.
//!
//! Both are typed results, never panics.

use std::collections::BTreeMap;

use troika_core::messages::ToolCall;
use troika_core::turn::UsageNumbers;

use crate::repair::repair_json;
use crate::types::{StreamDelta, ToolCallDelta};

/// Markers that mean the model is emitting pseudo tool calls as text.
const INJECTION_MARKERS: [&str; 2] = ["<tool_call>", "<tool_code>"];

/// Signal that the current stream must be abandoned and retried at the
/// application level.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForcedRetry {
    /// Why the retry was forced.
    pub reason: String,
}

#[derive(Clone, Debug, Default)]
struct PendingCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// The aggregated result of one completed stream.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AggregatedResponse {
    /// Full assistant text.
    pub content: String,
    /// Full reasoning text.
    pub reasoning: String,
    /// Assembled tool calls with repaired argument JSON.
    pub tool_calls: Vec<ToolCall>,
    /// Model id seen on the stream.
    pub model_id_used: Option<String>,
    /// Usage summary, if the provider sent one.
    pub actual_usage: Option<UsageNumbers>,
}

impl AggregatedResponse {
    /// Zero content and zero tool calls: the empty response the client
    /// must never hand to the agent loop.
    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty() && self.tool_calls.is_empty()
    }
}

/// Accumulates [`StreamDelta`]s into an [`AggregatedResponse`].
#[derive(Clone, Debug, Default)]
pub struct StreamAggregator {
    content: String,
    reasoning: String,
    calls: BTreeMap<usize, PendingCall>,
    model_id: Option<String>,
    usage: Option<UsageNumbers>,
}

impl StreamAggregator {
    /// Fresh aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb one delta. Fails with [`ForcedRetry`] when the injection
    /// guard trips.
    pub fn absorb(&mut self, delta: &StreamDelta) -> Result<(), ForcedRetry> {
        if let Some(model) = &delta.model {
            if self.model_id.is_none() {
                self.model_id = Some(model.clone());
            }
        }
        if let Some(usage) = delta.usage {
            self.usage = Some(usage);
        }
        if let Some(reasoning) = &delta.reasoning_content {
            self.reasoning.push_str(reasoning);
        }
        if let Some(content) = &delta.content {
            self.content.push_str(content);
            for marker in INJECTION_MARKERS {
                if self.content.contains(marker) {
                    return Err(ForcedRetry {
                        reason: format!("detected '{marker}' in stream, forcing retry"),
                    });
                }
            }
        }
        for tc in &delta.tool_calls {
            self.absorb_call_delta(tc);
        }
        Ok(())
    }

    fn absorb_call_delta(&mut self, tc: &ToolCallDelta) {
        let slot = self.calls.entry(tc.index).or_default();
        if let Some(id) = &tc.id {
            slot.id = Some(id.clone());
        }
        if let Some(name) = &tc.name {
            slot.name.push_str(name);
        }
        if let Some(args) = &tc.arguments {
            slot.arguments.push_str(args);
        }
    }

    /// Finish the stream: assemble tool calls in index order, repairing
    /// argument JSON where possible. Unrepairable arguments are kept
    /// verbatim so post-processing can report the parse error in-band.
    pub fn finish(self) -> AggregatedResponse {
        let tool_calls = self
            .calls
            .into_values()
            .map(|pending| {
                let arguments = match repair_json(&pending.arguments) {
                    Some(v) => v.to_string(),
                    None => pending.arguments,
                };
                ToolCall::function(
                    pending.id.unwrap_or_else(|| troika_core::ids::short_hex(12)),
                    pending.name,
                    arguments,
                )
            })
            .collect();

        AggregatedResponse {
            content: self.content,
            reasoning: self.reasoning,
            tool_calls,
            model_id_used: self.model_id,
            actual_usage: self.usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_text_and_reasoning() {
        let mut agg = StreamAggregator::new();
        agg.absorb(&StreamDelta {
            reasoning_content: Some("thinking ".into()),
            ..StreamDelta::default()
        })
        .unwrap();
        agg.absorb(&StreamDelta::text("Hello, ")).unwrap();
        agg.absorb(&StreamDelta::text("world")).unwrap();

        let resp = agg.finish();
        assert_eq!(resp.content, "Hello, world");
        assert_eq!(resp.reasoning, "thinking ");
        assert!(!resp.is_empty());
    }

    #[test]
    fn assembles_tool_call_from_fragments() {
        let mut agg = StreamAggregator::new();
        agg.absorb(&StreamDelta {
            tool_calls: vec![ToolCallDelta {
                index: 0,
                id: Some("c1".into()),
                name: Some("ec".into()),
                arguments: None,
            }],
            ..StreamDelta::default()
        })
        .unwrap();
        agg.absorb(&StreamDelta {
            tool_calls: vec![ToolCallDelta {
                index: 0,
                id: None,
                name: Some("ho".into()),
                arguments: Some(r#"{"s":"#.into()),
            }],
            ..StreamDelta::default()
        })
        .unwrap();
        agg.absorb(&StreamDelta {
            tool_calls: vec![ToolCallDelta {
                index: 0,
                id: None,
                name: None,
                arguments: Some(r#""hi"}"#.into()),
            }],
            ..StreamDelta::default()
        })
        .unwrap();

        let resp = agg.finish();
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].id, "c1");
        assert_eq!(resp.tool_calls[0].function.name, "echo");
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&resp.tool_calls[0].function.arguments)
                .unwrap(),
            serde_json::json!({"s": "hi"})
        );
    }

    #[test]
    fn parallel_indices_become_separate_calls() {
        let mut agg = StreamAggregator::new();
        for (idx, name) in [(0usize, "alpha"), (1usize, "beta")] {
            agg.absorb(&StreamDelta {
                tool_calls: vec![ToolCallDelta {
                    index: idx,
                    id: Some(format!("c{idx}")),
                    name: Some(name.into()),
                    arguments: Some("{}".into()),
                }],
                ..StreamDelta::default()
            })
            .unwrap();
        }
        let resp = agg.finish();
        assert_eq!(resp.tool_calls.len(), 2);
        assert_eq!(resp.tool_calls[0].function.name, "alpha");
        assert_eq!(resp.tool_calls[1].function.name, "beta");
    }

    #[test]
    fn injection_guard_trips_across_chunk_boundary() {
        let mut agg = StreamAggregator::new();
        agg.absorb(&StreamDelta::text("prefix <tool_")).unwrap();
        let err = agg.absorb(&StreamDelta::text("call>...")).unwrap_err();
        assert!(err.reason.contains("<tool_call>"));
    }

    #[test]
    fn truncated_arguments_are_repaired() {
        let mut agg = StreamAggregator::new();
        agg.absorb(&StreamDelta {
            tool_calls: vec![ToolCallDelta {
                index: 0,
                id: Some("c1".into()),
                name: Some("search".into()),
                arguments: Some(r#"{"q": "rust"#.into()),
            }],
            ..StreamDelta::default()
        })
        .unwrap();
        let resp = agg.finish();
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&resp.tool_calls[0].function.arguments)
                .unwrap(),
            serde_json::json!({"q": "rust"})
        );
    }

    #[test]
    fn empty_stream_is_empty() {
        let resp = StreamAggregator::new().finish();
        assert!(resp.is_empty());

        let mut agg = StreamAggregator::new();
        agg.absorb(&StreamDelta::text("   ")).unwrap();
        assert!(agg.finish().is_empty());
    }

    #[test]
    fn usage_and_model_are_captured_once() {
        let mut agg = StreamAggregator::new();
        agg.absorb(&StreamDelta {
            model: Some("m-1".into()),
            ..StreamDelta::default()
        })
        .unwrap();
        agg.absorb(&StreamDelta {
            model: Some("m-2".into()),
            usage: Some(UsageNumbers {
                prompt_tokens: 10,
                completion_tokens: 2,
                total_tokens: 12,
            }),
            ..StreamDelta::default()
        })
        .unwrap();

        let resp = agg.finish();
        assert_eq!(resp.model_id_used.as_deref(), Some("m-1"));
        assert_eq!(resp.actual_usage.unwrap().total_tokens, 12);
    }
}
