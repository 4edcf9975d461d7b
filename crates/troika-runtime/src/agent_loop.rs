//! The agent loop: a profile-driven prepare → invoke → post state machine
//! bound to exactly one `SubContext` for its lifetime.
//!
//! Per iteration:
//!
//! 1. pre-turn observers → dangling-call resolution → inbox processing
//! 2. new ledger turn, system prompt, hydration, safenet, token estimate
//! 3. streaming LLM call (cancellable)
//! 4. tool-call post-processing, post-turn observers, flow decision
//! 5. finalization, baton pass, `turn_completed` + view events
//!
//! Agent-scope failures become structured inbox items fed back to the LLM;
//! only unrecoverable transport errors and cancellation end a session.

use std::collections::HashSet;
use std::sync::Arc;

use metrics::{counter, histogram};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use troika_core::events::{EventSink, RunEvent};
use troika_core::ids;
use troika_core::inbox::{InboxItem, source};
use troika_core::messages::{ChatMessage, Role};
use troika_core::tools::{KnowledgeContribution, ToolResponse};
use troika_kb::{KnowledgeItemMetadata, NewItem};
use troika_llm::{CallOptions, ChatRequest, LlmOutcome};
use troika_profiles::AgentProfile;

use crate::context::{CurrentAction, RunContext, SubContext};
use crate::decider::{NextAction, decide_next_action};
use crate::errors::RuntimeError;
use crate::inbox::process_inbox;
use crate::observers::{ObserverPhase, run_observers};
use crate::prompt::construct_system_prompt;
use crate::safenet::tool_call_safenet;
use crate::turn_manager::TurnManager;
use crate::views;

/// How a session ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// The flow terminated (decider END_FLOW or a flow-ending tool).
    Completed,
    /// Partner parked awaiting user input.
    AwaitUserInput,
    /// An unrecoverable error ended the flow.
    Error(String),
    /// A cancel signal ended the flow.
    Cancelled,
}

enum TurnEnd {
    Next(NextAction),
    Error(String),
    Cancelled,
}

/// One agent's execution loop.
pub struct AgentLoop {
    run: Arc<RunContext>,
    sub: Arc<SubContext>,
    profile: Arc<AgentProfile>,
    turn_manager: TurnManager,
}

impl AgentLoop {
    /// Bind a loop to an agent, resolving its profile from the run's
    /// catalog: instance-id binding first, then active-by-logical-name.
    pub fn new(run: Arc<RunContext>, sub: Arc<SubContext>) -> Result<Self, RuntimeError> {
        let profiles = &run.config.profiles;
        let profile = sub
            .meta
            .profile_instance_id
            .as_deref()
            .and_then(|id| profiles.by_instance_id(id))
            .or_else(|| {
                let name = sub
                    .meta
                    .profile_logical_name
                    .as_deref()
                    .unwrap_or(&sub.meta.agent_id);
                profiles.active_by_name(name)
            })
            .ok_or_else(|| {
                RuntimeError::ProfileNotFound(
                    sub.meta
                        .profile_logical_name
                        .clone()
                        .unwrap_or_else(|| sub.meta.agent_id.clone()),
                )
            })?;
        info!(
            agent_id = %sub.meta.agent_id,
            profile_name = %profile.name,
            profile_instance_id = %profile.profile_id,
            "agent loop bound"
        );
        Ok(Self {
            run,
            sub,
            profile,
            turn_manager: TurnManager,
        })
    }

    /// The bound profile.
    pub fn profile(&self) -> &Arc<AgentProfile> {
        &self.profile
    }

    /// Run prepare → invoke → post cycles until a terminal action.
    #[instrument(skip_all, fields(agent_id = %self.sub.meta.agent_id))]
    pub async fn run_session(&self, cancel: &CancellationToken) -> SessionEnd {
        loop {
            if cancel.is_cancelled() {
                self.handle_cancellation();
                return SessionEnd::Cancelled;
            }

            match self.run_turn(cancel).await {
                TurnEnd::Cancelled => {
                    return SessionEnd::Cancelled;
                }
                TurnEnd::Error(message) => {
                    return SessionEnd::Error(message);
                }
                TurnEnd::Next(NextAction::Loop) => {}
                TurnEnd::Next(NextAction::AwaitUserInput) => {
                    return SessionEnd::AwaitUserInput;
                }
                TurnEnd::Next(NextAction::EndFlow) => {
                    return SessionEnd::Completed;
                }
                TurnEnd::Next(NextAction::Tool(tool_name)) => {
                    let flow_ends = self.execute_action(cancel, &tool_name).await;
                    if cancel.is_cancelled() {
                        self.handle_cancellation();
                        return SessionEnd::Cancelled;
                    }
                    if flow_ends {
                        return SessionEnd::Completed;
                    }
                }
            }
        }
    }

    async fn run_turn(&self, cancel: &CancellationToken) -> TurnEnd {
        let start = std::time::Instant::now();
        let run = &self.run;
        let sub = &self.sub;
        let agent_id = sub.meta.agent_id.clone();

        // ── prep ────────────────────────────────────────────────────────
        run_observers(ObserverPhase::PreTurn, sub, &self.profile);
        self.resolve_dangling_tool_calls();

        let processing = process_inbox(run, sub, &self.profile);

        let stream_id = ids::stream_id(&agent_id);
        let turn_id = self.turn_manager.start_new_turn(run, sub, &stream_id);
        debug!(turn_id, "turn started");

        let prompt_log = construct_system_prompt(run, sub, &self.profile, &run.runtime.ingestors);
        let system_prompt = prompt_log.final_prompt.clone();

        // Hydrate KB tokens, clean internal fields, then run the safenet
        let hydrated: Vec<ChatMessage> = {
            let mut kb = run.runtime.kb.lock();
            processing
                .messages_for_llm
                .iter()
                .map(|msg| {
                    let mut hydrated_msg = msg.clone();
                    if let Value::String(content) =
                        kb.hydrate(&Value::String(msg.content.clone()))
                    {
                        hydrated_msg.content = content;
                    }
                    hydrated_msg
                })
                .collect()
        };
        let cleaned: Vec<ChatMessage> = hydrated.iter().map(ChatMessage::clean_for_llm).collect();
        let final_messages = tool_call_safenet(&cleaned, &agent_id);
        if final_messages.len() != cleaned.len() {
            warn!(
                original = cleaned.len(),
                repaired = final_messages.len(),
                "safenet modified the message stream"
            );
        }

        let predicted_tokens =
            troika_llm::tokens::estimate_prompt_tokens(&final_messages, Some(&system_prompt));
        self.turn_manager.enrich_turn_inputs(
            run,
            &turn_id,
            processing.processing_log,
            prompt_log,
            predicted_tokens,
        );

        let api_tools = run.runtime.tools.api_tools_for(&self.profile, sub);

        // ── invoke ──────────────────────────────────────────────────────
        let placeholder_id = ids::placeholder_message_id(&stream_id);
        {
            let mut state = sub.state.lock();
            let mut placeholder = ChatMessage::assistant("");
            placeholder.id = Some(placeholder_id.clone());
            state.messages.push(placeholder);
        }
        views::emit_view_update(run, troika_core::events::ViewName::FlowView);
        views::emit_turns_sync(run);

        let llm_config = match run.config.llm_configs.resolve(&self.profile.llm_config_ref) {
            Ok(config) => config,
            Err(e) => {
                let message = format!("llm config resolution failed: {e}");
                return self.close_turn_with_error(&placeholder_id, &message);
            }
        };
        let request = ChatRequest {
            messages: final_messages,
            system_prompt: Some(system_prompt),
            tools: api_tools,
            tool_choice: None,
        };
        let opts = CallOptions {
            run_id: run.meta.run_id.clone(),
            agent_id: agent_id.clone(),
            parent_agent_id: sub.meta.parent_agent_id.clone(),
            stream_id,
            sink: Some(Arc::clone(&run.runtime.emitter) as Arc<dyn EventSink>),
            usage: Some(Arc::clone(&run.runtime.usage)),
        };

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                self.handle_cancellation();
                return TurnEnd::Cancelled;
            }
            outcome = run.runtime.llm.call(&llm_config, &request, &opts) => outcome,
        };

        // ── post ────────────────────────────────────────────────────────
        if outcome.is_error() {
            let message = outcome.error.clone().unwrap_or_else(|| "unknown llm error".into());
            self.turn_manager.update_llm_interaction_end(run, sub, &outcome);
            return self.close_turn_with_error(&placeholder_id, &message);
        }

        self.turn_manager.update_llm_interaction_end(run, sub, &outcome);
        if run.config.app.capture_llm_request_body {
            let captured = serde_json::json!({
                "messages": request.messages,
                "system": request.system_prompt,
                "tools": request.tools,
            });
            let mut team = run.team.lock();
            if let Some(turn) = team.find_turn_mut(&turn_id) {
                if let Some(llm) = &mut turn.llm_interaction {
                    llm.final_request = Some(captured);
                }
            }
        }
        let mut outcome = outcome;
        if outcome.tool_calls.len() > 1 {
            warn!(
                total_calls = outcome.tool_calls.len(),
                "multiple tool calls in response; keeping only the first"
            );
            outcome.tool_calls.truncate(1);
        }
        self.process_tool_calls(&outcome);
        self.update_placeholder_message(&placeholder_id, &outcome);

        run_observers(ObserverPhase::PostTurn, sub, &self.profile);

        let next = decide_next_action(sub, &self.profile);
        info!(turn_id, next_action = next.as_str(), "turn completed");

        let ends_via_tool = match &next {
            NextAction::Tool(name) => run.runtime.tools.ends_flow(name),
            _ => false,
        };
        if matches!(next, NextAction::EndFlow) || ends_via_tool {
            self.turn_manager.finalize_dangling_tool_in_turn(run, sub);
        }
        self.turn_manager.finalize_current_turn(run, sub, next.as_str());
        self.emit_turn_closed(&turn_id);

        counter!("agent_turns_total", "agent" => agent_id.clone()).increment(1);
        histogram!("agent_turn_duration_seconds").record(start.elapsed().as_secs_f64());

        TurnEnd::Next(next)
    }

    /// Shared error epilogue: fail the turn, patch the placeholder, emit
    /// the error event, finalize with `error`, and emit closure events.
    fn close_turn_with_error(&self, placeholder_id: &str, message: &str) -> TurnEnd {
        let run = &self.run;
        let sub = &self.sub;
        error!(agent_id = %sub.meta.agent_id, message, "turn failed");

        self.turn_manager.fail_current_turn(run, sub, message);
        self.update_placeholder_message(placeholder_id, &LlmOutcome::default());
        let _ = run.runtime.emitter.emit(RunEvent::Error {
            run_id: run.meta.run_id.clone(),
            agent_id: sub.meta.agent_id.clone(),
            error_message: format!(
                "Agent '{}' encountered a critical error: {message}",
                sub.meta.agent_id
            ),
        });
        self.turn_manager.finalize_dangling_tool_in_turn(run, sub);
        self.turn_manager.finalize_current_turn(run, sub, "error");
        let turn_id = sub.state.lock().last_turn_id.clone().unwrap_or_default();
        self.emit_turn_closed(&turn_id);
        TurnEnd::Error(message.to_string())
    }

    fn emit_turn_closed(&self, turn_id: &str) {
        let run = &self.run;
        let _ = run.runtime.emitter.emit(RunEvent::TurnCompleted {
            run_id: run.meta.run_id.clone(),
            agent_id: self.sub.meta.agent_id.clone(),
            turn_id: turn_id.to_string(),
        });
        views::emit_view_update(run, troika_core::events::ViewName::FlowView);
        views::emit_view_update(run, troika_core::events::ViewName::TimelineView);
        views::emit_view_update(run, troika_core::events::ViewName::KanbanView);
        views::emit_turns_sync(run);
    }

    fn handle_cancellation(&self) {
        info!(agent_id = %self.sub.meta.agent_id, "flow cancelled");
        self.turn_manager.cancel_current_turn(&self.run);
        views::emit_turns_sync(&self.run);
    }

    /// The symmetry invariant: every tool call the last assistant message
    /// emitted must have a response in history or in the inbox before the
    /// next LLM call. Unmatched calls get synthetic error results.
    fn resolve_dangling_tool_calls(&self) {
        let sub = &self.sub;
        let (expected, responded_in_history, inbox_responses) = {
            let state = sub.state.lock();
            let Some(last_assistant_idx) = state
                .messages
                .iter()
                .rposition(|m| m.role == Role::Assistant)
            else {
                return;
            };
            let last_assistant = &state.messages[last_assistant_idx];
            let expected: Vec<(String, String)> = last_assistant
                .tool_calls
                .as_deref()
                .unwrap_or_default()
                .iter()
                .map(|tc| (tc.id.clone(), tc.function.name.clone()))
                .collect();
            if expected.is_empty() {
                return;
            }

            let mut responded: HashSet<String> = HashSet::new();
            for msg in &state.messages[last_assistant_idx + 1..] {
                if msg.role == Role::Assistant {
                    break;
                }
                if msg.role == Role::Tool {
                    if let Some(id) = &msg.tool_call_id {
                        let _ = responded.insert(id.clone());
                    }
                }
            }
            let inbox_responses: HashSet<String> = state
                .inbox
                .iter()
                .filter(|item| item.source == source::TOOL_RESULT)
                .filter_map(|item| {
                    item.payload
                        .get("tool_call_id")
                        .and_then(Value::as_str)
                        .map(String::from)
                })
                .collect();
            (expected, responded, inbox_responses)
        };

        let unresponded: Vec<(String, String)> = expected
            .into_iter()
            .filter(|(id, _)| !responded_in_history.contains(id) && !inbox_responses.contains(id))
            .collect();
        if unresponded.is_empty() {
            debug!(agent_id = %sub.meta.agent_id, "symmetry check passed");
            return;
        }
        warn!(
            agent_id = %sub.meta.agent_id,
            dangling = unresponded.len(),
            "dangling tool calls, synthesizing error results"
        );

        let mut state = sub.state.lock();
        for (tool_call_id, tool_name) in unresponded {
            let item = InboxItem::tool_result(
                &tool_name,
                &tool_call_id,
                serde_json::json!({
                    "error": "tool_call_failed",
                    "message": "The tool did not produce a response, or its execution was \
                                interrupted before a result could be processed. If you called \
                                more than one tool, the extra calls were dropped: this agent \
                                supports one tool call per turn.",
                }),
                true,
            );
            state.inbox.insert(0, item);
        }
    }

    /// Validate and record the chosen tool call: arguments are parsed
    /// (with JSON repair), the tool must be registered, and a running
    /// tool interaction is added to the turn. Invalid calls become error
    /// TOOL_RESULT items and the action is cleared.
    fn process_tool_calls(&self, outcome: &LlmOutcome) {
        let run = &self.run;
        let sub = &self.sub;

        let Some(tool_call) = outcome.tool_calls.first() else {
            sub.state.lock().current_action = None;
            info!(agent_id = %sub.meta.agent_id, "no tool call in response");
            return;
        };
        let tool_name = tool_call.function.name.clone();
        let tool_call_id = tool_call.id.clone();

        let arguments: Option<Map<String, Value>> =
            match serde_json::from_str::<Value>(&tool_call.function.arguments) {
                Ok(Value::Object(map)) => Some(map),
                Ok(_) => None,
                Err(_) => troika_llm::repair::repair_json(&tool_call.function.arguments)
                    .and_then(|v| v.as_object().cloned()),
            };
        let Some(arguments) = arguments else {
            let message = format!(
                "LLM provided invalid JSON arguments for tool '{tool_name}': arguments string: \
                 '{}'",
                tool_call.function.arguments
            );
            error!(agent_id = %sub.meta.agent_id, tool_name, "tool arguments invalid");
            let mut state = sub.state.lock();
            state.inbox.push(InboxItem::tool_result(
                &tool_name,
                &tool_call_id,
                Value::String(message),
                true,
            ));
            state.current_action = None;
            return;
        };

        self.turn_manager.add_tool_interaction(
            run,
            sub,
            tool_call,
            Value::Object(arguments.clone()),
        );

        let Some(registered) = run.runtime.tools.get(&tool_name) else {
            let message = format!("LLM called an unregistered tool: '{tool_name}'.");
            error!(agent_id = %sub.meta.agent_id, tool_name, "tool not registered");
            let mut state = sub.state.lock();
            state.inbox.push(InboxItem::tool_result(
                &tool_name,
                &tool_call_id,
                Value::String(message),
                true,
            ));
            state.current_action = None;
            return;
        };

        let mut state = sub.state.lock();
        state.current_action = Some(CurrentAction {
            tool_name: tool_name.clone(),
            tool_call_id: tool_call_id.clone(),
            arguments,
            implementation: registered.spec.implementation,
        });
        state.current_tool_call_id = Some(tool_call_id);
        info!(agent_id = %sub.meta.agent_id, tool_name, "tool call decision made");
    }

    /// Patch the placeholder assistant message in place with the final
    /// response. If the placeholder is gone, append a fresh message.
    fn update_placeholder_message(&self, placeholder_id: &str, outcome: &LlmOutcome) {
        let mut state = self.sub.state.lock();
        let turn_id = state.current_turn_id.clone();

        let patch = |msg: &mut ChatMessage| {
            msg.content = outcome.content.clone().unwrap_or_default();
            if let Some(reasoning) = outcome.reasoning.clone().filter(|r| !r.is_empty()) {
                msg.reasoning_content = Some(reasoning);
            }
            if !outcome.tool_calls.is_empty() {
                msg.tool_calls = Some(outcome.tool_calls.clone());
            }
            msg.turn_id = turn_id.clone();
            msg.timestamp = Some(ids::now_iso());
        };

        match state
            .messages
            .iter_mut()
            .rev()
            .find(|m| m.id.as_deref() == Some(placeholder_id))
        {
            Some(placeholder) => patch(placeholder),
            None => {
                warn!(placeholder_id, "placeholder message not found, appending");
                let mut msg = ChatMessage::assistant("");
                patch(&mut msg);
                state.messages.push(msg);
            }
        }
    }

    /// Execute the chosen tool, convert its envelope to a TOOL_RESULT
    /// inbox item, and commit contributed knowledge. Returns whether the
    /// tool ends the flow.
    async fn execute_action(&self, cancel: &CancellationToken, tool_name: &str) -> bool {
        let run = &self.run;
        let sub = &self.sub;
        let action = {
            let mut state = sub.state.lock();
            state.current_action.take()
        };
        let Some(action) = action else {
            warn!(tool_name, "no current action to execute");
            return false;
        };

        let Some(registered) = run.runtime.tools.get(tool_name) else {
            sub.push_inbox(InboxItem::tool_result(
                tool_name,
                &action.tool_call_id,
                Value::String(format!("tool '{tool_name}' disappeared from the registry")),
                true,
            ));
            return false;
        };

        let start = std::time::Instant::now();
        debug!(tool_name, tool_call_id = %action.tool_call_id, "tool execution started");
        let response = registered
            .tool
            .execute(Value::Object(action.arguments.clone()), run, sub, cancel)
            .await;
        counter!("tool_executions_total", "tool" => tool_name.to_string()).increment(1);
        histogram!("tool_execution_duration_seconds", "tool" => tool_name.to_string())
            .record(start.elapsed().as_secs_f64());

        self.commit_knowledge(&registered.spec.default_knowledge_item_type, &action, &response);

        let is_error = response.is_error();
        sub.push_inbox(InboxItem::tool_result(
            tool_name,
            &action.tool_call_id,
            response.payload,
            is_error,
        ));

        registered.spec.ends_flow
    }

    fn commit_knowledge(
        &self,
        default_item_type: &Option<String>,
        action: &CurrentAction,
        response: &ToolResponse,
    ) {
        if response.knowledge_items.is_empty() {
            return;
        }
        let mut kb = self.run.runtime.kb.lock();
        for contribution in &response.knowledge_items {
            let KnowledgeContribution {
                item_type,
                content,
                source_uri,
                metadata,
            } = contribution;
            let item_type = if item_type.is_empty() {
                default_item_type.clone().unwrap_or_else(|| "GENERIC_TOOL_OUTPUT".into())
            } else {
                item_type.clone()
            };
            let mut item_metadata = KnowledgeItemMetadata {
                source_tool_name: Some(action.tool_name.clone()),
                tool_call_id: Some(action.tool_call_id.clone()),
                ..KnowledgeItemMetadata::default()
            };
            if let Some(Value::Object(extra)) = metadata {
                for (k, v) in extra {
                    let _ = item_metadata.extra.insert(k.clone(), v.clone());
                }
            }
            match kb.add_item(NewItem {
                item_type,
                content: content.clone(),
                source_uri: source_uri.clone(),
                metadata: item_metadata,
                id: None,
            }) {
                Ok(outcome) => {
                    debug!(item_id = %outcome.item_id, status = ?outcome.status, "knowledge committed");
                }
                Err(e) => {
                    warn!(error = %e, "knowledge contribution rejected");
                }
            }
        }
    }
}
