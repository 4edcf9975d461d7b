//! The Partner's `launch_principal` tool: start, relaunch, or forcibly
//! restart the Principal flow.
//!
//! Modes:
//!
//! - `start_fresh` — new Principal context briefed through the
//!   `partner_to_principal_initial_briefing` handover protocol.
//! - `continue_from_previous` — archive the current message history,
//!   bump the iteration counter, optionally inject a PARTNER_DIRECTIVE,
//!   and relaunch with memory intact.
//! - `force_terminate_and_relaunch` — cancel a running Principal first:
//!   its running turns become `interrupted`, a restart delimiter turn is
//!   injected (inheriting the old flow id), and the new Principal's first
//!   turn attaches to the delimiter on a new flow.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use troika_core::ids;
use troika_core::inbox::{InboxItem, source};
use troika_core::tools::{ToolResponse, ToolSpec};
use troika_core::turn::TurnStatus;

use crate::context::{RunContext, SubContext};
use crate::orchestrator::{create_principal_context, spawn_principal_flow};
use crate::tools::Tool;
use crate::turn_manager::TurnManager;

/// The handover protocol used for fresh Principal briefings.
pub const INITIAL_BRIEFING_PROTOCOL: &str = "partner_to_principal_initial_briefing";

/// How long a forced termination waits for the old task to wind down.
const FORCE_CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

/// `launch_principal` — Partner-side Principal lifecycle control.
pub struct LaunchPrincipalTool;

#[async_trait]
impl Tool for LaunchPrincipalTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "launch_principal",
            "Start or restart the Principal execution flow. Use 'start_fresh' for a new plan, \
             'continue_from_previous' to resume with accumulated context, and set \
             'force_terminate_and_relaunch' to replace a running Principal.",
            json!({
                "type": "object",
                "properties": {
                    "iteration_mode": {
                        "type": "string",
                        "enum": ["start_fresh", "continue_from_previous"],
                    },
                    "confirmed_associate_profiles_details_list": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Logical names of Associate profiles staffed for this run."
                    },
                    "directive_for_principal": {
                        "type": "string",
                        "description": "Optional directive injected when continuing."
                    },
                    "force_terminate_and_relaunch": {"type": "boolean"}
                },
                "required": ["iteration_mode"]
            }),
        )
        .with_toolset("principal_control")
        .with_handover(INITIAL_BRIEFING_PROTOCOL)
    }

    async fn execute(
        &self,
        params: Value,
        run: &Arc<RunContext>,
        sub: &Arc<SubContext>,
        _cancel: &CancellationToken,
    ) -> ToolResponse {
        let iteration_mode = params
            .get("iteration_mode")
            .and_then(Value::as_str)
            .unwrap_or("start_fresh")
            .to_string();
        let force = params
            .get("force_terminate_and_relaunch")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        // Reconcile the authoritative flag with the actual task handle
        let task_active = run
            .runtime
            .principal_task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished());
        {
            let mut team = run.team.lock();
            if team.is_principal_flow_running != task_active {
                warn!(
                    team_state_running = team.is_principal_flow_running,
                    task_active, "principal running-status mismatch, reconciling"
                );
                team.is_principal_flow_running = task_active;
            }
        }

        let mut baton_for_new_flow: Option<String> = None;
        if task_active {
            if !force {
                let status_summary = run
                    .principal()
                    .map(|p| {
                        let state = p.state.lock();
                        format!(
                            "Principal is active. Iteration: {}.",
                            state.current_iteration_count
                        )
                    })
                    .unwrap_or_else(|| "Principal is currently active.".to_string());
                return ToolResponse::success(json!({
                    "status": "ignored_principal_running",
                    "message": "Principal is already running. Launch command ignored.",
                    "current_principal_status": status_summary,
                }));
            }
            baton_for_new_flow = self.force_terminate(run).await;
        }

        match iteration_mode.as_str() {
            "start_fresh" => self.start_fresh(run, sub, &params, baton_for_new_flow),
            "continue_from_previous" => self.continue_previous(run, &params, baton_for_new_flow),
            other => ToolResponse::error(format!("unknown iteration_mode '{other}'")),
        }
    }
}

impl LaunchPrincipalTool {
    /// Cancel the running Principal: archive its messages, mark its
    /// running turns interrupted, and inject the restart delimiter.
    /// Returns the delimiter turn id, the new flow's baton.
    async fn force_terminate(&self, run: &Arc<RunContext>) -> Option<String> {
        info!("force-terminating running principal");
        let mut delimiter_id = None;

        if let Some(principal) = run.principal() {
            let last_turn_id = {
                let mut state = principal.state.lock();
                let archived = json!({
                    "iteration": state.current_iteration_count,
                    "timestamp": ids::now_iso(),
                    "messages": state.messages.clone(),
                    "reason_for_archival": "Forced termination by Partner",
                });
                state.archived_messages_history.push(archived);
                state.last_turn_id.clone()
            };

            if let Some(last_turn_id) = last_turn_id {
                let mut team = run.team.lock();
                if let Some(old_flow_id) = team.find_turn(&last_turn_id).map(|t| t.flow_id.clone()) {
                    let now = ids::now_iso();
                    for turn in &mut team.turns {
                        if turn.flow_id == old_flow_id && turn.status == TurnStatus::Running {
                            turn.status = TurnStatus::Interrupted;
                            turn.end_time = Some(now.clone());
                            turn.error_details =
                                Some("Flow was terminated and restarted by the user.".to_string());
                        }
                    }
                    delimiter_id = Some(TurnManager.create_restart_delimiter_turn(
                        &mut team,
                        &run.meta.run_id,
                        &old_flow_id,
                        &last_turn_id,
                    ));
                }
            }
        }

        // Cancel the task and wait briefly for its teardown
        let cancel = run.runtime.principal_cancel.lock().take();
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        let handle = run.runtime.principal_task.lock().take();
        if let Some(handle) = handle {
            match tokio::time::timeout(FORCE_CANCEL_TIMEOUT, handle).await {
                Ok(_) => info!("principal task wound down"),
                Err(_) => warn!("principal task did not stop within the cancel timeout"),
            }
        }
        run.team.lock().is_principal_flow_running = false;
        delimiter_id
    }

    fn start_fresh(
        &self,
        run: &Arc<RunContext>,
        partner: &Arc<SubContext>,
        params: &Value,
        baton: Option<String>,
    ) -> ToolResponse {
        // Resolve confirmed profile names to active instance ids
        let requested: Vec<String> = params
            .get("confirmed_associate_profiles_details_list")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).map(String::from).collect())
            .unwrap_or_default();
        let mut staffed = Vec::new();
        for name in &requested {
            match run.config.profiles.active_by_name(name) {
                Some(profile) => staffed.push(profile.profile_id.clone()),
                None => warn!(profile_name = %name, "confirmed associate profile not found"),
            }
        }
        if staffed.is_empty() {
            staffed = run.config.profiles.staffable_associate_ids();
        }

        let principal = create_principal_context(run, staffed.clone(), baton);

        // Brief the new Principal through the initial-briefing protocol
        if let Some(protocol) = run.config.profiles.protocol(INITIAL_BRIEFING_PROTOCOL) {
            let view = crate::context::ContextView::new(partner);
            match crate::handover::execute_protocol(&protocol, &view, params) {
                Ok(briefing) => {
                    principal.push_inbox(InboxItem::new(briefing.source, briefing.payload));
                }
                Err(e) => {
                    warn!(error = %e, "initial briefing protocol failed; starting unbriefed");
                }
            }
        } else {
            // Minimal briefing: the originating question
            let question = run.team.lock().question.clone().unwrap_or_default();
            principal.push_inbox(InboxItem::new(
                source::AGENT_STARTUP_BRIEFING,
                json!({
                    "data": {"original_question": question},
                    "schema_for_rendering": {
                        "type": "object",
                        "x-handover-title": "Execution Briefing",
                        "properties": {
                            "original_question": {"x-handover-title": "Original Question"}
                        }
                    }
                }),
            ));
        }

        let _ = spawn_principal_flow(run, &principal);
        info!(staffed_count = staffed.len(), "fresh principal launched");
        ToolResponse::success(json!({
            "status": "launched",
            "iteration_mode": "start_fresh",
            "staffed_profile_instance_ids": staffed,
        }))
    }

    fn continue_previous(
        &self,
        run: &Arc<RunContext>,
        params: &Value,
        baton: Option<String>,
    ) -> ToolResponse {
        let Some(principal) = run.principal() else {
            return ToolResponse::error(
                "no previous Principal context exists; use iteration_mode 'start_fresh'",
            );
        };

        {
            let mut state = principal.state.lock();
            let iteration = state.current_iteration_count;
            let archived = json!({
                "iteration": iteration,
                "timestamp": ids::now_iso(),
                "messages": state.messages.clone(),
                "reason_for_archival": "Continuation launch",
            });
            state.archived_messages_history.push(archived);
            state.current_iteration_count = iteration + 1;
            state.current_action = None;
            state.current_turn_id = None;
            state.current_tool_call_id = None;
            state.flow_outcome = None;
            state.final_result_package = None;
            state.error_message = None;
            if let Some(baton) = baton {
                state.last_turn_id = Some(baton);
            }
        }

        if let Some(directive) = params.get("directive_for_principal").and_then(Value::as_str) {
            principal.push_inbox(InboxItem::new(
                source::PARTNER_DIRECTIVE,
                json!({"content": directive}),
            ));
        }

        let _ = spawn_principal_flow(run, &principal);
        info!("principal relaunched from previous context");
        ToolResponse::success(json!({
            "status": "launched",
            "iteration_mode": "continue_from_previous",
        }))
    }
}
