//! The dispatcher: validates work-module assignments, fans out Associate
//! sub-flows in parallel, and synthesizes a single aggregation turn from
//! the N sub-flows.
//!
//! Invoked as the `dispatch_submodules` tool by a Principal. Assignments
//! failing preflight (duplicate module, wrong status, unknown profile)
//! accumulate in `failed_preparation_details` and never launch; the rest
//! run concurrently, each with full teardown even on failure or
//! cancellation.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use troika_core::events::RunEvent;
use troika_core::ids;
use troika_core::inbox::InboxItem;
use troika_core::messages::ChatMessage;
use troika_core::paths::ContextPaths;
use troika_core::team::{
    AssigneeEntry, AssigneeOutcome, ContextArchiveEntry, DispatchRecord, DispatchStatus,
    ModuleStatus, ReviewInfo, WorkModule,
};
use troika_core::tools::{ToolResponse, ToolSpec};
use troika_profiles::AgentProfile;

use crate::agent_loop::SessionEnd;
use crate::context::{ContextView, RunContext, SubContext, fresh_agent_state};
use crate::handover::execute_protocol;
use crate::orchestrator;
use crate::tools::Tool;
use crate::turn_manager::TurnManager;
use crate::views;

/// The handover protocol every dispatch uses to brief its Associates.
pub const BRIEFING_PROTOCOL: &str = "principal_to_associate_briefing";

/// One validated assignment ready to launch.
struct AssignmentPackage {
    assignment: Value,
    module_id: String,
    associate_id: String,
    profile: Arc<AgentProfile>,
    assigned_role_name: Option<String>,
    dispatch_tool_call_id: String,
}

/// Per-assignment outcome collected after the sub-flow finishes.
#[derive(Clone, Debug)]
struct AssignmentResult {
    module_id: String,
    associate_id: String,
    execution_status: String,
    deliverables: Value,
    error_details: Option<String>,
    last_turn_id: Option<String>,
    new_messages: Vec<ChatMessage>,
}

/// `dispatch_submodules` — parallel Associate fan-out.
pub struct DispatchTool;

#[async_trait]
impl Tool for DispatchTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "dispatch_submodules",
            "Validate and assign Work Modules to Associate agents for execution. Each \
             assignment targets one module in 'pending' or 'pending_review' status; a module \
             can only be assigned to one Associate at a time.",
            json!({
                "type": "object",
                "properties": {
                    "assignments": {
                        "type": "array",
                        "description": "List of work module assignments.",
                        "items": {
                            "type": "object",
                            "properties": {
                                "agent_profile_logical_name": {
                                    "type": "string",
                                    "description": "Logical name of the Associate profile to use."
                                },
                                "assigned_role_name": {
                                    "type": "string",
                                    "description": "Role name for this execution, e.g. 'Market_Researcher'."
                                }
                            },
                            "required": ["agent_profile_logical_name", "assigned_role_name"]
                        }
                    }
                },
                "required": ["assignments"]
            }),
        )
        .with_toolset("dispatch")
        .with_handover(BRIEFING_PROTOCOL)
    }

    async fn execute(
        &self,
        params: Value,
        run: &Arc<RunContext>,
        sub: &Arc<SubContext>,
        cancel: &CancellationToken,
    ) -> ToolResponse {
        let dispatch_tool_call_id = sub
            .state
            .lock()
            .current_tool_call_id
            .clone()
            .unwrap_or_else(|| format!("dtcid_unknown_{}", ids::short_hex(4)));

        let assignments: Vec<Value> = params
            .get("assignments")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let (packages, failed_preparation) =
            prepare_assignments(run, &assignments, &dispatch_tool_call_id);
        info!(
            valid = packages.len(),
            failed_prep = failed_preparation.len(),
            "dispatch preparation complete"
        );

        let results = execute_assignments(run, sub, packages, cancel).await;
        aggregate(run, sub, &dispatch_tool_call_id, results, failed_preparation)
    }
}

fn prepare_assignments(
    run: &Arc<RunContext>,
    assignments: &[Value],
    dispatch_tool_call_id: &str,
) -> (Vec<AssignmentPackage>, Vec<Value>) {
    let mut packages = Vec::new();
    let mut failures = Vec::new();
    let mut seen_modules: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();

    for assignment in assignments {
        let module_id = assignment
            .get("module_id_to_assign")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let profile_name = assignment
            .get("agent_profile_logical_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if !seen_modules.insert(module_id.clone()) {
            warn!(module_id, "duplicate assignment in a single dispatch");
            failures.push(json!({
                "input": assignment,
                "reason": format!("Duplicate assignment for module_id '{module_id}' in a single call."),
            }));
            continue;
        }

        let module_status = run
            .team
            .lock()
            .work_modules
            .get(&module_id)
            .map(|m| m.status);
        let Some(status) = module_status else {
            failures.push(json!({
                "input": assignment,
                "reason": format!("Work Module ID '{module_id}' not found."),
            }));
            continue;
        };
        if !status.is_dispatchable() {
            failures.push(json!({
                "input": assignment,
                "reason": format!(
                    "Work Module '{module_id}' has status '{}', but must be 'pending' or \
                     'pending_review' to be dispatched.",
                    serde_json::to_value(status).ok().and_then(|v| v.as_str().map(String::from)).unwrap_or_default()
                ),
            }));
            continue;
        }

        let Some(profile) = run.config.profiles.active_by_name(&profile_name) else {
            failures.push(json!({
                "input": assignment,
                "reason": format!("Profile '{profile_name}' not found or inactive."),
            }));
            continue;
        };

        let associate_id = format!(
            "Assoc_{}_{}",
            profile_name
                .trim_start_matches("Associate_")
                .chars()
                .take(10)
                .collect::<String>(),
            module_id.trim_start_matches("WM_")
        );
        packages.push(AssignmentPackage {
            assignment: assignment.clone(),
            module_id,
            associate_id,
            profile,
            assigned_role_name: assignment
                .get("assigned_role_name")
                .and_then(Value::as_str)
                .map(String::from),
            dispatch_tool_call_id: dispatch_tool_call_id.to_string(),
        });
    }
    (packages, failures)
}

async fn execute_assignments(
    run: &Arc<RunContext>,
    principal: &Arc<SubContext>,
    packages: Vec<AssignmentPackage>,
    cancel: &CancellationToken,
) -> Vec<AssignmentResult> {
    let mut join_set = JoinSet::new();
    let count = packages.len();
    for (index, package) in packages.into_iter().enumerate() {
        let run = Arc::clone(run);
        let principal = Arc::clone(principal);
        let child_cancel = cancel.child_token();
        let _ = join_set.spawn(async move {
            let result = run_one_assignment(&run, &principal, package, &child_cancel).await;
            (index, result)
        });
    }

    let mut results: Vec<Option<AssignmentResult>> = vec![None; count];
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((index, result)) => results[index] = Some(result),
            Err(e) => error!(error = %e, "assignment task panicked"),
        }
    }
    results.into_iter().flatten().collect()
}

async fn run_one_assignment(
    run: &Arc<RunContext>,
    principal: &Arc<SubContext>,
    package: AssignmentPackage,
    cancel: &CancellationToken,
) -> AssignmentResult {
    let module_id = package.module_id.clone();
    let associate_id = package.associate_id.clone();
    info!(module_id, associate_id, "assignment execution started");

    // Transition the module to ongoing with a running assignee entry
    let started_at = ids::now_iso();
    let module_event = {
        let mut team = run.team.lock();
        let Some(module) = team.work_modules.get_mut(&module_id) else {
            return AssignmentResult {
                module_id,
                associate_id,
                execution_status: "error".into(),
                deliverables: json!({}),
                error_details: Some("module disappeared before execution".into()),
                last_turn_id: None,
                new_messages: Vec::new(),
            };
        };
        module.status = ModuleStatus::Ongoing;
        module.updated_at = started_at.clone();
        module.assignee_history.push(AssigneeEntry {
            dispatch_id: associate_id.clone(),
            agent_id: associate_id.clone(),
            started_at: started_at.clone(),
            ended_at: None,
            outcome: AssigneeOutcome::Running,
        });
        let module_clone = module.clone();
        team.dispatch_history.push(DispatchRecord {
            dispatch_id: associate_id.clone(),
            dispatch_tool_call_id_ref: package.dispatch_tool_call_id.clone(),
            module_id: module_id.clone(),
            profile_logical_name: package.profile.name.clone(),
            start_timestamp: None,
            end_timestamp: None,
            status: DispatchStatus::Launching,
            final_summary: None,
            error_details: None,
        });
        module_clone
    };
    let _ = run.runtime.emitter.emit(RunEvent::WorkModuleUpdated {
        run_id: run.meta.run_id.clone(),
        module: module_event,
    });
    views::emit_view_update(run, troika_core::events::ViewName::KanbanView);

    // Build the briefing through the handover service
    let briefing = match run.config.profiles.protocol(BRIEFING_PROTOCOL) {
        Some(protocol) => {
            let source = DispatchHandoverSource {
                base: ContextView::new(principal),
                assignment: package.assignment.clone(),
            };
            execute_protocol(&protocol, &source, &package.assignment)
        }
        None => Err(crate::errors::RuntimeError::ProtocolNotFound(
            BRIEFING_PROTOCOL.to_string(),
        )),
    };
    let briefing = match briefing {
        Ok(briefing) => briefing,
        Err(e) => {
            error!(associate_id, error = %e, "handover failed");
            return close_assignment(
                run,
                &module_id,
                &associate_id,
                "error",
                json!({}),
                Some(format!("Failed to prepare context handover: {e}")),
                None,
                Vec::new(),
            );
        }
    };

    // Fresh Associate sub-context; its first turn attaches to the
    // Principal's dispatch turn via the inherited baton
    let mut state = fresh_agent_state();
    state.inbox.push(InboxItem::new(briefing.source, briefing.payload));
    state.last_turn_id = principal.state.lock().last_turn_id.clone();
    let _ = state.initial_parameters.insert("module_id".into(), json!(module_id));
    let _ = state
        .initial_parameters
        .insert("executing_associate_id".into(), json!(associate_id));
    if let Some(instructions) = package.assignment.get("assignment_specific_instructions") {
        let _ = state
            .initial_parameters
            .insert("assignment_specific_instructions".into(), instructions.clone());
    }

    let associate = Arc::new(SubContext {
        meta: crate::context::SubMeta {
            run_id: run.meta.run_id.clone(),
            agent_id: associate_id.clone(),
            parent_agent_id: Some(principal.meta.agent_id.clone()),
            assigned_role_name: package.assigned_role_name.clone(),
            profile_logical_name: Some(package.profile.name.clone()),
            profile_instance_id: Some(package.profile.profile_id.clone()),
            module_id: Some(module_id.clone()),
            dispatch_tool_call_id_ref: Some(package.dispatch_tool_call_id.clone()),
        },
        state: parking_lot::Mutex::new(state),
        runtime: crate::context::SubRuntime::default(),
        run: Arc::downgrade(run),
    });
    {
        let mut refs = run.subcontexts.lock();
        let _ = refs
            .ongoing_associates
            .insert(associate_id.clone(), Arc::clone(&associate));
    }
    info!(associate_id, "associate task registered");

    let session_end = orchestrator::run_associate_flow(run, &associate, cancel).await;

    // Teardown: archive, close records, transition the module for review
    let (messages, deliverables, error_message) = {
        let state = associate.state.lock();
        (
            state.messages.clone(),
            Value::Object(state.deliverables.clone()),
            state.error_message.clone(),
        )
    };
    let last_turn_id = associate.state.lock().last_turn_id.clone();
    let execution_status = match (&session_end, &error_message) {
        (SessionEnd::Completed, None) => "success",
        _ => "error",
    };

    {
        let mut refs = run.subcontexts.lock();
        let _ = refs.ongoing_associates.remove(&associate_id);
    }
    info!(associate_id, execution_status, "associate task deregistered");

    close_assignment(
        run,
        &module_id,
        &associate_id,
        execution_status,
        deliverables,
        error_message,
        last_turn_id,
        messages,
    )
}

/// Close out one assignment: update dispatch history, the assignee entry,
/// the context archive, and the module's review transition.
#[allow(clippy::too_many_arguments)]
fn close_assignment(
    run: &Arc<RunContext>,
    module_id: &str,
    associate_id: &str,
    execution_status: &str,
    deliverables: Value,
    error_details: Option<String>,
    last_turn_id: Option<String>,
    messages: Vec<ChatMessage>,
) -> AssignmentResult {
    let ended_at = ids::now_iso();
    let success = execution_status == "success";

    let module_event: Option<WorkModule> = {
        let mut team = run.team.lock();

        if let Some(record) = team
            .dispatch_history
            .iter_mut()
            .rev()
            .find(|r| r.dispatch_id == associate_id)
        {
            record.status = if success {
                DispatchStatus::CompletedSuccess
            } else {
                DispatchStatus::CompletedError
            };
            record.end_timestamp = Some(ended_at.clone());
            record.error_details = error_details.clone();
            if let Some(obj) = deliverables.as_object().filter(|o| !o.is_empty()) {
                let keys: Vec<&str> = obj.keys().map(String::as_str).collect();
                record.final_summary = Some(format!("Deliverables: {}", keys.join(", ")));
            }
        }

        team.work_modules.get_mut(module_id).map(|module| {
            if let Some(entry) = module
                .assignee_history
                .iter_mut()
                .rev()
                .find(|e| e.dispatch_id == associate_id && e.outcome == AssigneeOutcome::Running)
            {
                entry.ended_at = Some(ended_at.clone());
                entry.outcome = if success {
                    AssigneeOutcome::CompletedSuccess
                } else {
                    AssigneeOutcome::CompletedError
                };
            }
            module.context_archive.push(ContextArchiveEntry {
                dispatch_id: associate_id.to_string(),
                archived_at: ended_at.clone(),
                messages: messages.clone(),
                deliverables: deliverables.clone(),
            });
            module.status = ModuleStatus::PendingReview;
            module.review_info = Some(ReviewInfo {
                trigger: if success {
                    "associate_completed".into()
                } else {
                    "associate_failed".into()
                },
                message: if success {
                    "Associate completed its work.".into()
                } else {
                    "Associate failed with an error.".into()
                },
                error_details: error_details.clone(),
            });
            module.updated_at = ended_at.clone();
            module.clone()
        })
    };
    if let Some(module) = module_event {
        let _ = run.runtime.emitter.emit(RunEvent::WorkModuleUpdated {
            run_id: run.meta.run_id.clone(),
            module,
        });
    }

    AssignmentResult {
        module_id: module_id.to_string(),
        associate_id: associate_id.to_string(),
        execution_status: execution_status.to_string(),
        deliverables,
        error_details,
        last_turn_id,
        new_messages: messages,
    }
}

fn aggregate(
    run: &Arc<RunContext>,
    principal: &Arc<SubContext>,
    dispatch_tool_call_id: &str,
    results: Vec<AssignmentResult>,
    failed_preparation: Vec<Value>,
) -> ToolResponse {
    let n_launched = results.len();
    let n_success = results.iter().filter(|r| r.execution_status == "success").count();
    let n_failed = n_launched - n_success;
    let n_prep_failed = failed_preparation.len();
    let n_requested = n_launched + n_prep_failed;

    let overall = if n_requested == 0 {
        "NO_ASSIGNMENTS_REQUESTED"
    } else if n_launched > 0 {
        if n_success == n_launched {
            if n_prep_failed == 0 {
                "SUCCESS"
            } else {
                "PARTIAL_SUCCESS_SOME_PREP_FAILED"
            }
        } else if n_success > 0 {
            if n_prep_failed == 0 {
                "PARTIAL_SUCCESS_ASSOCIATES_SOME_FAILED"
            } else {
                "PARTIAL_SUCCESS_MIXED_RESULTS"
            }
        } else if n_prep_failed == 0 {
            "TOTAL_FAILURE_ASSOCIATES_ALL_FAILED"
        } else {
            "TOTAL_FAILURE_PREP_AND_ASSOC_FAILED"
        }
    } else {
        "TOTAL_FAILURE_ALL_PREP_FAILED"
    };

    let message = format!(
        "Dispatch operation concluded for {n_requested} requested assignment(s). {n_launched} \
         module(s) were dispatched. Of those, {n_success} completed successfully and are now \
         'pending_review'. {n_failed} failed and are also 'pending_review' for analysis. \
         {n_prep_failed} assignment(s) failed pre-check and were not dispatched."
    );

    // Aggregation turn: one fan-in node whose parents are each sub-flow's
    // last turn. With nothing executed the baton stays on the dispatch
    // turn and no aggregation turn exists.
    if n_launched > 0 {
        let dispatch_turn_id = principal.state.lock().current_turn_id.clone();
        if let Some(dispatch_turn_id) = dispatch_turn_id {
            let subflow_turn_ids: Vec<String> =
                results.iter().filter_map(|r| r.last_turn_id.clone()).collect();
            let mut team = run.team.lock();
            let aggregation_id = TurnManager.create_aggregation_turn(
                &mut team,
                &run.meta.run_id,
                &dispatch_turn_id,
                subflow_turn_ids,
                dispatch_tool_call_id,
                &format!("{n_success}/{n_launched} successful."),
            );
            drop(team);
            match aggregation_id {
                Some(aggregation_id) => {
                    principal.state.lock().last_turn_id = Some(aggregation_id.clone());
                    info!(aggregation_id, "dispatch baton passed to aggregation turn");
                }
                None => {
                    error!(dispatch_tool_call_id, "dispatch turn not found; no aggregation turn");
                }
            }
        }
    } else {
        info!(dispatch_tool_call_id, "no sub-flows executed; aggregation turn skipped");
    }

    let assignment_results: Vec<Value> = results
        .iter()
        .map(|r| {
            json!({
                "module_id": r.module_id,
                "associate_id": r.associate_id,
                "execution_status": r.execution_status,
                "deliverables": r.deliverables,
                "error_details": r.error_details,
                "new_messages_from_associate": r.new_messages,
            })
        })
        .collect();

    let content = json!({
        "status": overall,
        "message": message,
        "assignment_execution_results": assignment_results,
        "failed_preparation_details": failed_preparation,
    });
    info!(overall, "dispatch aggregation complete");

    if overall.starts_with("TOTAL_FAILURE") {
        ToolResponse {
            status: troika_core::tools::ToolStatus::Error,
            payload: content,
            knowledge_items: Vec::new(),
        }
    } else {
        ToolResponse::success(content)
    }
}

/// A [`ContextPaths`] view over the Principal that exposes the current
/// assignment's parameters under `state.current_action`, so protocol
/// inheritance paths resolve per-assignment.
struct DispatchHandoverSource {
    base: ContextView,
    assignment: Value,
}

impl ContextPaths for DispatchHandoverSource {
    fn namespace(&self, prefix: &str) -> Option<Value> {
        let mut value = self.base.namespace(prefix)?;
        if prefix == "state" {
            if let Some(obj) = value.as_object_mut() {
                let mut current_action = Map::new();
                let _ = current_action.insert("parameters".into(), self.assignment.clone());
                if let Some(fields) = self.assignment.as_object() {
                    for (k, v) in fields {
                        let _ = current_action.insert(k.clone(), v.clone());
                    }
                }
                let _ = obj.insert("current_action".into(), Value::Object(current_action));
            }
        }
        Some(value)
    }
}
