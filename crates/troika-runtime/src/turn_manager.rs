//! The turn manager — sole mutator of `TeamState.turns`.
//!
//! Every ledger mutation (new turns, interaction updates, finalization,
//! delimiter and aggregation injection) goes through here; agent code
//! never edits the turn list directly. A missing turn is logged and
//! skipped, never a panic.

use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use troika_core::ids;
use troika_core::inbox::InboxItem;
use troika_core::messages::ToolCall;
use troika_core::team::TeamState;
use troika_core::turn::{
    AgentInfo, AttemptStatus, LlmInteraction, LlmInteractionStatus, ProcessedItemLog,
    SystemPromptLog, ToolInteraction, ToolInteractionStatus, Turn, TurnInputs, TurnStatus,
    TurnType, UsageNumbers,
};
use troika_llm::LlmOutcome;

use crate::context::{RunContext, SubContext};

/// Stateless service owning all turn-ledger mutations.
#[derive(Clone, Copy, Debug, Default)]
pub struct TurnManager;

impl TurnManager {
    /// Append a pre-constructed turn.
    pub fn add_turn(team: &mut TeamState, turn: Turn) {
        debug!(turn_id = %turn.turn_id, turn_type = ?turn.turn_type, "turn added");
        team.turns.push(turn);
    }

    /// Start a new running agent turn parented on the agent's baton.
    /// Derives the flow id from the parent turn, minting a new root flow
    /// when there is none. Returns the new turn id.
    pub fn start_new_turn(&self, run: &RunContext, sub: &SubContext, stream_id: &str) -> String {
        let agent_id = sub.meta.agent_id.clone();
        let turn_id = ids::turn_id(&agent_id);

        let last_turn_id = {
            let mut state = sub.state.lock();
            state.current_turn_id = Some(turn_id.clone());
            state.last_turn_id.clone()
        };
        let source_turn_ids: Vec<String> = last_turn_id.into_iter().collect();

        let mut team = run.team.lock();
        // A restart delimiter parent starts a fresh flow: the delimiter
        // stays in the old stream, the restarted work gets its own.
        let flow_id = source_turn_ids
            .first()
            .and_then(|id| team.find_turn(id))
            .filter(|t| t.turn_type != TurnType::RestartDelimiterTurn)
            .map(|t| t.flow_id.clone())
            .unwrap_or_else(|| {
                let flow_id = ids::flow_id();
                warn!(agent_id, flow_id, "minting new root flow");
                flow_id
            });

        let turn = Turn {
            turn_id: turn_id.clone(),
            run_id: run.meta.run_id.clone(),
            flow_id,
            agent_info: AgentInfo {
                agent_id,
                profile_logical_name: sub.meta.profile_logical_name.clone(),
                profile_instance_id: sub.meta.profile_instance_id.clone(),
                assigned_role_name: sub.meta.assigned_role_name.clone(),
            },
            turn_type: TurnType::AgentTurn,
            status: TurnStatus::Running,
            start_time: ids::now_iso(),
            end_time: None,
            source_turn_ids,
            source_tool_call_id: None,
            inputs: TurnInputs::default(),
            outputs: Map::new(),
            llm_interaction: Some(LlmInteraction::started(stream_id)),
            tool_interactions: Vec::new(),
            metadata: Map::new(),
            error_details: None,
        };
        Self::add_turn(&mut team, turn);
        turn_id
    }

    /// Create a completed user turn from a USER_PROMPT inbox item, linked
    /// to the agent's baton so subsequent agent turns chain correctly.
    /// Returns the user turn id.
    pub fn create_user_turn(&self, run: &RunContext, sub: &SubContext, item: &InboxItem) -> Option<String> {
        let prompt = item.payload.get("prompt")?;
        let prompt_text = prompt.as_str().map(String::from)?;
        if prompt_text.is_empty() {
            return None;
        }

        let last_turn_id = sub.state.lock().last_turn_id.clone();
        let user_turn_id = ids::user_turn_id();

        let mut team = run.team.lock();
        let flow_id = last_turn_id
            .as_deref()
            .and_then(|id| team.find_turn(id))
            .map(|t| t.flow_id.clone())
            .unwrap_or_else(ids::user_flow_id);

        let created_at = if item.metadata.created_at.is_empty() {
            ids::now_iso()
        } else {
            item.metadata.created_at.clone()
        };

        let turn = Turn {
            turn_id: user_turn_id.clone(),
            run_id: run.meta.run_id.clone(),
            flow_id,
            agent_info: AgentInfo {
                agent_id: "User".into(),
                profile_logical_name: Some("user_input".into()),
                profile_instance_id: None,
                assigned_role_name: None,
            },
            turn_type: TurnType::UserTurn,
            status: TurnStatus::Completed,
            start_time: created_at.clone(),
            end_time: Some(created_at),
            source_turn_ids: last_turn_id.into_iter().collect(),
            source_tool_call_id: None,
            inputs: TurnInputs {
                prompt: Some(prompt_text),
                ..TurnInputs::default()
            },
            outputs: Map::new(),
            llm_interaction: None,
            tool_interactions: Vec::new(),
            metadata: Map::new(),
            error_details: None,
        };
        Self::add_turn(&mut team, turn);
        debug!(user_turn_id, "user turn created");
        Some(user_turn_id)
    }

    /// Fill the turn's inputs: processed inbox log, prompt construction
    /// log, predicted usage, and the derived `source_tool_call_id`.
    pub fn enrich_turn_inputs(
        &self,
        run: &RunContext,
        turn_id: &str,
        processing_log: Vec<ProcessedItemLog>,
        prompt_log: SystemPromptLog,
        predicted_tokens: u64,
    ) {
        let mut team = run.team.lock();
        let Some(turn) = team.find_turn_mut(turn_id) else {
            error!(turn_id, "turn not found for enrichment");
            return;
        };

        turn.source_tool_call_id = processing_log
            .iter()
            .find(|log| log.source == troika_core::inbox::source::TOOL_RESULT)
            .and_then(|log| log.tool_call_id.clone());
        turn.inputs.processed_inbox_items = processing_log;
        turn.inputs.system_prompt_construction = Some(prompt_log);

        if let Some(llm) = &mut turn.llm_interaction {
            llm.predicted_usage = Some(UsageNumbers {
                prompt_tokens: predicted_tokens,
                completion_tokens: 0,
                total_tokens: predicted_tokens,
            });
        }
    }

    /// Record a new running tool interaction on the current turn.
    pub fn add_tool_interaction(
        &self,
        run: &RunContext,
        sub: &SubContext,
        tool_call: &ToolCall,
        parsed_params: Value,
    ) {
        let turn_id = sub.state.lock().current_turn_id.clone();
        let Some(turn_id) = turn_id else {
            error!("no current turn for tool interaction");
            return;
        };
        let mut team = run.team.lock();
        let Some(turn) = team.find_turn_mut(&turn_id) else {
            error!(turn_id, "turn not found for tool interaction");
            return;
        };
        turn.tool_interactions.push(ToolInteraction {
            tool_call_id: tool_call.id.clone(),
            tool_name: tool_call.function.name.clone(),
            start_time: ids::now_iso(),
            end_time: None,
            status: ToolInteractionStatus::Running,
            input_params: parsed_params,
            result_payload: None,
            error_details: None,
        });
        debug!(turn_id, tool_name = %tool_call.function.name, "tool interaction added");
    }

    /// Close the most recent matching running tool interaction with its
    /// result, searching the ledger backwards.
    pub fn update_tool_interaction_result(
        &self,
        run: &RunContext,
        tool_call_id: &str,
        result_payload: Value,
        is_error: bool,
    ) {
        let mut team = run.team.lock();
        for turn in team.turns.iter_mut().rev() {
            for ti in &mut turn.tool_interactions {
                if ti.tool_call_id == tool_call_id && ti.status == ToolInteractionStatus::Running {
                    ti.status = if is_error {
                        ToolInteractionStatus::Error
                    } else {
                        ToolInteractionStatus::Completed
                    };
                    ti.end_time = Some(ids::now_iso());
                    if is_error {
                        ti.error_details = Some(result_payload.to_string());
                    }
                    ti.result_payload = Some(result_payload);
                    debug!(turn_id = %turn.turn_id, tool_call_id, status = ?ti.status, "tool interaction closed");
                    return;
                }
            }
        }
        warn!(tool_call_id, "no running tool interaction found for result");
    }

    /// Record the final LLM response, actual usage, and attempt outcomes
    /// on the current turn.
    pub fn update_llm_interaction_end(&self, run: &RunContext, sub: &SubContext, outcome: &LlmOutcome) {
        let turn_id = sub.state.lock().current_turn_id.clone();
        let Some(turn_id) = turn_id else { return };
        let mut team = run.team.lock();
        let Some(turn) = team.find_turn_mut(&turn_id) else {
            return;
        };
        let Some(llm) = &mut turn.llm_interaction else {
            return;
        };

        llm.status = LlmInteractionStatus::Completed;
        if let Some(usage) = outcome.actual_usage {
            llm.actual_usage = Some(usage);
            debug!(turn_id, total_tokens = usage.total_tokens, "actual token usage recorded");
        }
        llm.final_response = Some(troika_core::turn::FinalResponse {
            content: outcome.content.clone(),
            tool_calls: outcome.tool_calls.clone(),
            reasoning: outcome.reasoning.clone(),
            model_id_used: outcome.model_id_used.clone(),
        });
        if !outcome.attempts.is_empty() {
            llm.attempts = outcome.attempts.clone();
        } else if let Some(last) = llm.attempts.last_mut() {
            if last.status == AttemptStatus::Pending {
                last.status = if outcome.is_error() {
                    AttemptStatus::Failed
                } else {
                    AttemptStatus::Success
                };
                last.error = outcome.error.clone();
            }
        }
    }

    /// Transition the current turn (and its LLM attempt) to error.
    pub fn fail_current_turn(&self, run: &RunContext, sub: &SubContext, error_message: &str) {
        let turn_id = sub.state.lock().current_turn_id.clone();
        let Some(turn_id) = turn_id else { return };
        let mut team = run.team.lock();
        let Some(turn) = team.find_turn_mut(&turn_id) else {
            return;
        };
        if turn.status == TurnStatus::Error {
            return;
        }
        turn.status = TurnStatus::Error;
        turn.end_time = Some(ids::now_iso());
        turn.error_details = Some(error_message.to_string());
        error!(turn_id, error_message, "turn failed");

        if let Some(llm) = &mut turn.llm_interaction {
            llm.status = LlmInteractionStatus::Error;
            if let Some(last) = llm.attempts.last_mut() {
                last.status = AttemptStatus::Failed;
                last.error = Some(error_message.to_string());
            }
        }
    }

    /// Mark the most recent running turn cancelled, cascading to its LLM
    /// interaction.
    pub fn cancel_current_turn(&self, run: &RunContext) {
        let mut team = run.team.lock();
        let Some(turn) = team
            .turns
            .iter_mut()
            .rev()
            .find(|t| t.status == TurnStatus::Running)
        else {
            return;
        };
        turn.status = TurnStatus::Cancelled;
        turn.end_time = Some(ids::now_iso());
        if turn.error_details.is_none() {
            turn.error_details = Some("Flow was cancelled.".to_string());
        }
        if let Some(llm) = &mut turn.llm_interaction {
            if llm.status == LlmInteractionStatus::Running {
                llm.status = LlmInteractionStatus::Cancelled;
            }
        }
        info!(turn_id = %turn.turn_id, "turn cancelled");
    }

    /// Complete the current turn if still running, record the decision,
    /// and pass the baton regardless of final status.
    pub fn finalize_current_turn(&self, run: &RunContext, sub: &SubContext, next_action: &str) {
        let turn_id = sub.state.lock().current_turn_id.clone();
        let Some(turn_id) = turn_id else { return };
        {
            let mut team = run.team.lock();
            if let Some(turn) = team.find_turn_mut(&turn_id) {
                if turn.status == TurnStatus::Running {
                    turn.status = TurnStatus::Completed;
                    turn.end_time = Some(ids::now_iso());
                    let _ = turn
                        .outputs
                        .insert("next_action".into(), Value::String(next_action.to_string()));
                    debug!(turn_id, "turn finalized as completed");
                }
            }
        }
        let mut state = sub.state.lock();
        state.last_turn_id = Some(turn_id.clone());
        debug!(last_turn_id = turn_id, "baton passed");
    }

    /// Inject a restart delimiter turn inheriting the terminated flow's id
    /// so the UI can visually separate a forced restart. Returns its id,
    /// which becomes the new flow's baton.
    pub fn create_restart_delimiter_turn(
        &self,
        team: &mut TeamState,
        run_id: &str,
        old_flow_id: &str,
        source_turn_id: &str,
    ) -> String {
        let delimiter_turn_id = ids::delimiter_turn_id();
        let now = ids::now_iso();
        let turn = Turn {
            turn_id: delimiter_turn_id.clone(),
            run_id: run_id.to_string(),
            flow_id: old_flow_id.to_string(),
            agent_info: AgentInfo {
                agent_id: "System".into(),
                profile_logical_name: Some("FlowControl".into()),
                profile_instance_id: None,
                assigned_role_name: Some("System".into()),
            },
            turn_type: TurnType::RestartDelimiterTurn,
            status: TurnStatus::Completed,
            start_time: now.clone(),
            end_time: Some(now),
            source_turn_ids: vec![source_turn_id.to_string()],
            source_tool_call_id: None,
            inputs: TurnInputs {
                reason: Some("Principal flow was forcefully restarted by the Partner agent.".into()),
                ..TurnInputs::default()
            },
            outputs: Map::new(),
            llm_interaction: None,
            tool_interactions: Vec::new(),
            metadata: Map::new(),
            error_details: None,
        };
        Self::add_turn(team, turn);
        info!(delimiter_turn_id, source_turn_id, "restart delimiter injected");
        delimiter_turn_id
    }

    /// Inject an aggregation turn fanning in N parallel sub-flows after a
    /// dispatch. Returns its id, the dispatching agent's new baton.
    pub fn create_aggregation_turn(
        &self,
        team: &mut TeamState,
        run_id: &str,
        dispatch_turn_id: &str,
        subflow_last_turn_ids: Vec<String>,
        dispatch_tool_call_id: &str,
        aggregation_summary: &str,
    ) -> Option<String> {
        let (flow_id, agent_info) = {
            let dispatch_turn = team.find_turn(dispatch_turn_id)?;
            (dispatch_turn.flow_id.clone(), dispatch_turn.agent_info.clone())
        };

        let aggregation_turn_id = ids::aggregation_turn_id(dispatch_tool_call_id);
        let now = ids::now_iso();
        let mut outputs = Map::new();
        let _ = outputs.insert(
            "aggregated_results_summary".into(),
            Value::String(aggregation_summary.to_string()),
        );
        let mut metadata = Map::new();
        let _ = metadata.insert(
            "dispatch_tool_call_id".into(),
            Value::String(dispatch_tool_call_id.to_string()),
        );

        let turn = Turn {
            turn_id: aggregation_turn_id.clone(),
            run_id: run_id.to_string(),
            flow_id,
            agent_info,
            turn_type: TurnType::AggregationTurn,
            status: TurnStatus::Completed,
            start_time: now.clone(),
            end_time: Some(now),
            inputs: TurnInputs {
                source_turn_count: Some(subflow_last_turn_ids.len()),
                ..TurnInputs::default()
            },
            source_turn_ids: subflow_last_turn_ids,
            source_tool_call_id: Some(dispatch_tool_call_id.to_string()),
            outputs,
            llm_interaction: None,
            tool_interactions: Vec::new(),
            metadata,
            error_details: None,
        };
        Self::add_turn(team, turn);
        info!(aggregation_turn_id, dispatch_tool_call_id, "aggregation turn created");
        Some(aggregation_turn_id)
    }

    /// Flow-ending fallback: close any still-running tool interaction on
    /// the agent's current turn as completed.
    pub fn finalize_dangling_tool_in_turn(&self, run: &RunContext, sub: &SubContext) {
        let (turn_id, tool_call_id) = {
            let state = sub.state.lock();
            (state.current_turn_id.clone(), state.current_tool_call_id.clone())
        };
        let (Some(turn_id), Some(tool_call_id)) = (turn_id, tool_call_id) else {
            return;
        };
        let mut team = run.team.lock();
        let Some(turn) = team.find_turn_mut(&turn_id) else {
            return;
        };
        if let Some(ti) = turn
            .tool_interactions
            .iter_mut()
            .find(|ti| ti.tool_call_id == tool_call_id && ti.status == ToolInteractionStatus::Running)
        {
            ti.status = ToolInteractionStatus::Completed;
            ti.end_time = Some(ids::now_iso());
            ti.result_payload = Some(serde_json::json!({
                "status": "finalized",
                "reason": "Flow is ending.",
            }));
            info!(tool_call_id, "running tool interaction finalized at flow end");
        }
    }
}
