//! Run events streamed to downstream consumers.
//!
//! One event family, [`RunEvent`], covers LLM streaming progress, turn
//! lifecycle, view-model refreshes, token accounting, and work-module
//! updates. Events are transient: persistence subscribes to
//! `turn_completed` but events themselves are never stored.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::team::WorkModule;
use crate::turn::Turn;

/// Chunk kinds inside an LLM stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    /// Assistant text delta.
    Content,
    /// Reasoning text delta.
    ReasoningContent,
    /// Tool name fragment.
    ToolName,
    /// Tool arguments fragment.
    ToolArgs,
}

/// UI view names derivable from the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewName {
    /// Turn DAG as nodes and edges.
    FlowView,
    /// Per-agent lanes ordered by start time.
    TimelineView,
    /// Work modules grouped by status.
    KanbanView,
}

/// Run-level token accounting counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsageStats {
    /// Prompt tokens across all successful calls.
    pub total_prompt_tokens: u64,
    /// Completion tokens across all successful calls.
    pub total_completion_tokens: u64,
    /// Successful LLM calls.
    pub total_successful_calls: u64,
    /// Failed LLM calls (including force-retry attempts).
    pub total_failed_calls: u64,
    /// Largest single-call prompt+completion total seen.
    pub max_context_window: u64,
}

/// Typed events emitted to downstream consumers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// An LLM stream attempt opened.
    LlmStreamStarted {
        /// Owning run.
        run_id: String,
        /// Emitting agent.
        agent_id: String,
        /// Parent agent, if spawned.
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_agent_id: Option<String>,
        /// Stream id tagged onto chunks.
        stream_id: String,
        /// Model id, if known.
        #[serde(skip_serializing_if = "Option::is_none")]
        llm_id: Option<String>,
    },
    /// An incremental stream fragment.
    LlmChunk {
        /// Owning run.
        run_id: String,
        /// Emitting agent.
        agent_id: String,
        /// Stream id.
        stream_id: String,
        /// Fragment kind.
        chunk_type: ChunkType,
        /// Fragment text.
        content: String,
    },
    /// A stream attempt completed successfully.
    LlmStreamEnded {
        /// Owning run.
        run_id: String,
        /// Emitting agent.
        agent_id: String,
        /// Stream id.
        stream_id: String,
    },
    /// A stream attempt failed or was force-retried.
    LlmStreamFailed {
        /// Owning run.
        run_id: String,
        /// Emitting agent.
        agent_id: String,
        /// Stream id.
        stream_id: String,
        /// Failure reason.
        reason: String,
    },
    /// A turn finished post-processing. Triggers the persistence hook.
    TurnCompleted {
        /// Owning run.
        run_id: String,
        /// Emitting agent.
        agent_id: String,
        /// The completed turn.
        turn_id: String,
    },
    /// Full-ledger resync for consumers that fell behind.
    TurnsSync {
        /// Owning run.
        run_id: String,
        /// Current turn ledger snapshot.
        turns: Vec<Turn>,
    },
    /// A derived view model was regenerated.
    ViewModelUpdate {
        /// Owning run.
        run_id: String,
        /// Which view.
        view_name: ViewName,
        /// View payload.
        payload: Value,
    },
    /// Token counters changed.
    TokenUsageUpdate {
        /// Owning run.
        run_id: String,
        /// Current counters.
        stats: TokenUsageStats,
    },
    /// A work module changed state.
    WorkModuleUpdated {
        /// Owning run.
        run_id: String,
        /// The module after the change.
        module: WorkModule,
    },
    /// An agent-scope error surfaced to observers.
    Error {
        /// Owning run.
        run_id: String,
        /// Agent that hit the error.
        agent_id: String,
        /// Error message.
        error_message: String,
    },
}

impl RunEvent {
    /// The run this event belongs to.
    pub fn run_id(&self) -> &str {
        match self {
            RunEvent::LlmStreamStarted { run_id, .. }
            | RunEvent::LlmChunk { run_id, .. }
            | RunEvent::LlmStreamEnded { run_id, .. }
            | RunEvent::LlmStreamFailed { run_id, .. }
            | RunEvent::TurnCompleted { run_id, .. }
            | RunEvent::TurnsSync { run_id, .. }
            | RunEvent::ViewModelUpdate { run_id, .. }
            | RunEvent::TokenUsageUpdate { run_id, .. }
            | RunEvent::WorkModuleUpdated { run_id, .. }
            | RunEvent::Error { run_id, .. } => run_id,
        }
    }

    /// Snake-case event type tag.
    pub fn event_type(&self) -> &'static str {
        match self {
            RunEvent::LlmStreamStarted { .. } => "llm_stream_started",
            RunEvent::LlmChunk { .. } => "llm_chunk",
            RunEvent::LlmStreamEnded { .. } => "llm_stream_ended",
            RunEvent::LlmStreamFailed { .. } => "llm_stream_failed",
            RunEvent::TurnCompleted { .. } => "turn_completed",
            RunEvent::TurnsSync { .. } => "turns_sync",
            RunEvent::ViewModelUpdate { .. } => "view_model_update",
            RunEvent::TokenUsageUpdate { .. } => "token_usage_update",
            RunEvent::WorkModuleUpdated { .. } => "work_module_updated",
            RunEvent::Error { .. } => "error",
        }
    }
}

/// Anything that can receive run events. The runtime's broadcast emitter
/// implements this; lower layers (the LLM client, the persistence hook)
/// depend only on the trait.
pub trait EventSink: Send + Sync {
    /// Deliver one event. Must not block.
    fn emit_event(&self, event: RunEvent);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_tag_with_snake_case_type() {
        let ev = RunEvent::TurnCompleted {
            run_id: "run_1".into(),
            agent_id: "Partner".into(),
            turn_id: "turn_1".into(),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "turn_completed");
        assert_eq!(ev.event_type(), "turn_completed");
        assert_eq!(ev.run_id(), "run_1");
    }

    #[test]
    fn chunk_event_shape() {
        let ev = RunEvent::LlmChunk {
            run_id: "run_1".into(),
            agent_id: "Principal".into(),
            stream_id: "stream_1".into(),
            chunk_type: ChunkType::ToolArgs,
            content: "{\"s\":".into(),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["chunk_type"], "tool_args");
    }

    #[test]
    fn view_names_serialize() {
        assert_eq!(serde_json::to_value(ViewName::FlowView).unwrap(), json!("flow_view"));
        assert_eq!(serde_json::to_value(ViewName::KanbanView).unwrap(), json!("kanban_view"));
    }

    #[test]
    fn usage_stats_roundtrip() {
        let stats = TokenUsageStats {
            total_prompt_tokens: 10,
            total_completion_tokens: 5,
            total_successful_calls: 1,
            total_failed_calls: 0,
            max_context_window: 15,
        };
        let ev = RunEvent::TokenUsageUpdate {
            run_id: "run_1".into(),
            stats,
        };
        let v = serde_json::to_value(&ev).unwrap();
        let back: RunEvent = serde_json::from_value(v).unwrap();
        assert_eq!(back, ev);
    }
}
