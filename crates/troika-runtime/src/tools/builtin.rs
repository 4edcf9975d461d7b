//! Built-in orchestration tools: flow termination, work-module
//! management, Principal status reads, and Partner→Principal directives.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use troika_core::events::RunEvent;
use troika_core::ids;
use troika_core::inbox::{InboxItem, source};
use troika_core::team::{ModuleStatus, WorkModule};
use troika_core::tools::{ToolResponse, ToolSpec};

use crate::context::{RunContext, SubContext};
use crate::tools::Tool;
use crate::views;

/// `finish_flow` — the flow-ending tool every Principal and Associate
/// profile allows. Writes the final result package and deliverables into
/// agent state; the loop terminates after its post-processing.
pub struct FinishFlowTool;

#[async_trait]
impl Tool for FinishFlowTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "finish_flow",
            "Conclude the current flow. Call this exactly once, when your work is complete \
             or cannot proceed further.",
            json!({
                "type": "object",
                "properties": {
                    "status": {
                        "type": "string",
                        "enum": ["success", "partial_success", "failure"],
                        "description": "Final status of the flow."
                    },
                    "final_summary": {
                        "type": "string",
                        "description": "Concise summary of what was accomplished."
                    },
                    "deliverables": {
                        "type": "object",
                        "description": "Structured deliverables to hand back to the supervisor."
                    }
                },
                "required": ["status", "final_summary"]
            }),
        )
        .with_toolset("flow_control")
        .ends_flow()
    }

    async fn execute(
        &self,
        params: Value,
        _run: &Arc<RunContext>,
        sub: &Arc<SubContext>,
        _cancel: &CancellationToken,
    ) -> ToolResponse {
        let status = params
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("success")
            .to_string();
        let summary = params
            .get("final_summary")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let deliverables = params
            .get("deliverables")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        {
            let mut state = sub.state.lock();
            for (k, v) in &deliverables {
                let _ = state.deliverables.insert(k.clone(), v.clone());
            }
            state.final_result_package = Some(json!({
                "status": status,
                "final_summary": summary,
                "terminating_tool": "finish_flow",
                "deliverables": deliverables,
            }));
        }
        info!(agent_id = %sub.meta.agent_id, status, "flow finishing");
        ToolResponse::success(json!({
            "status": "flow_concluded",
            "final_status": status,
        }))
    }
}

/// `manage_work_modules` — create, update, and deprecate work modules on
/// the shared plan. Module ids are allocated from the team's monotonic
/// counter.
pub struct ManageWorkModulesTool;

#[async_trait]
impl Tool for ManageWorkModulesTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "manage_work_modules",
            "Create, update, or deprecate work modules in the shared plan. Each module is a \
             delegatable unit of work an Associate can execute.",
            json!({
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": ["add", "update", "deprecate"],
                    },
                    "modules_to_add": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "name": {"type": "string"},
                                "description": {"type": "string"},
                            },
                            "required": ["name", "description"]
                        }
                    },
                    "module_id": {"type": "string"},
                    "updates": {
                        "type": "object",
                        "properties": {
                            "name": {"type": "string"},
                            "description": {"type": "string"},
                            "notes": {"type": "string"},
                            "status": {"type": "string"},
                        }
                    }
                },
                "required": ["action"]
            }),
        )
        .with_toolset("planning")
    }

    async fn execute(
        &self,
        params: Value,
        run: &Arc<RunContext>,
        _sub: &Arc<SubContext>,
        _cancel: &CancellationToken,
    ) -> ToolResponse {
        let action = params.get("action").and_then(Value::as_str).unwrap_or("");
        let response = match action {
            "add" => self.add_modules(&params, run),
            "update" => self.update_module(&params, run),
            "deprecate" => self.deprecate_module(&params, run),
            other => ToolResponse::error(format!("unknown action '{other}'")),
        };
        views::emit_view_update(run, troika_core::events::ViewName::KanbanView);
        response
    }
}

impl ManageWorkModulesTool {
    fn add_modules(&self, params: &Value, run: &Arc<RunContext>) -> ToolResponse {
        let Some(to_add) = params.get("modules_to_add").and_then(Value::as_array) else {
            return ToolResponse::error("action 'add' requires 'modules_to_add'");
        };
        let mut created = Vec::new();
        {
            let mut team = run.team.lock();
            for module_spec in to_add {
                let name = module_spec.get("name").and_then(Value::as_str).unwrap_or("Unnamed");
                let description = module_spec
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let module_id = team.next_module_id();
                let module = WorkModule::new(module_id.clone(), name, description);
                let _ = team.work_modules.insert(module_id.clone(), module.clone());
                created.push(module_id.clone());
                let _ = run.runtime.emitter.emit(RunEvent::WorkModuleUpdated {
                    run_id: run.meta.run_id.clone(),
                    module,
                });
            }
        }
        info!(module_count = created.len(), "work modules created");
        ToolResponse::success(json!({"created_module_ids": created}))
    }

    fn update_module(&self, params: &Value, run: &Arc<RunContext>) -> ToolResponse {
        let Some(module_id) = params.get("module_id").and_then(Value::as_str) else {
            return ToolResponse::error("action 'update' requires 'module_id'");
        };
        let updates = params
            .get("updates")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let updated = {
            let mut team = run.team.lock();
            let Some(module) = team.work_modules.get_mut(module_id) else {
                return ToolResponse::error(format!("work module '{module_id}' not found"));
            };
            if let Some(name) = updates.get("name").and_then(Value::as_str) {
                module.name = name.to_string();
            }
            if let Some(description) = updates.get("description").and_then(Value::as_str) {
                module.description = description.to_string();
            }
            if let Some(notes) = updates.get("notes").and_then(Value::as_str) {
                module.notes = notes.to_string();
            }
            if let Some(status) = updates.get("status") {
                match serde_json::from_value::<ModuleStatus>(status.clone()) {
                    Ok(status) => module.status = status,
                    Err(_) => {
                        warn!(module_id, ?status, "ignoring invalid module status");
                    }
                }
            }
            module.updated_at = ids::now_iso();
            module.clone()
        };
        let _ = run.runtime.emitter.emit(RunEvent::WorkModuleUpdated {
            run_id: run.meta.run_id.clone(),
            module: updated.clone(),
        });
        ToolResponse::success(json!({"module_id": module_id, "status": updated.status}))
    }

    fn deprecate_module(&self, params: &Value, run: &Arc<RunContext>) -> ToolResponse {
        let Some(module_id) = params.get("module_id").and_then(Value::as_str) else {
            return ToolResponse::error("action 'deprecate' requires 'module_id'");
        };
        let deprecated = {
            let mut team = run.team.lock();
            let Some(module) = team.work_modules.get_mut(module_id) else {
                return ToolResponse::error(format!("work module '{module_id}' not found"));
            };
            module.status = ModuleStatus::Deprecated;
            module.updated_at = ids::now_iso();
            module.clone()
        };
        let _ = run.runtime.emitter.emit(RunEvent::WorkModuleUpdated {
            run_id: run.meta.run_id.clone(),
            module: deprecated,
        });
        ToolResponse::success(json!({"module_id": module_id, "status": "deprecated"}))
    }
}

/// `get_principal_status` — the Partner's read-only window into a running
/// Principal: status summary, iteration count, and a module rollup.
pub struct GetPrincipalStatusTool;

#[async_trait]
impl Tool for GetPrincipalStatusTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "get_principal_status",
            "Read the current status of the Principal flow: whether it is running, its status \
             summary, and a rollup of work module states.",
            json!({"type": "object", "properties": {}}),
        )
        .with_toolset("principal_control")
    }

    async fn execute(
        &self,
        _params: Value,
        run: &Arc<RunContext>,
        _sub: &Arc<SubContext>,
        _cancel: &CancellationToken,
    ) -> ToolResponse {
        let (is_running, module_rollup) = {
            let team = run.team.lock();
            let mut rollup: Map<String, Value> = Map::new();
            for module in team.work_modules.values() {
                let key = serde_json::to_value(module.status)
                    .ok()
                    .and_then(|v| v.as_str().map(String::from))
                    .unwrap_or_else(|| "unknown".to_string());
                let count = rollup.get(&key).and_then(Value::as_u64).unwrap_or(0);
                let _ = rollup.insert(key, Value::from(count + 1));
            }
            (team.is_principal_flow_running, rollup)
        };

        let principal_summary = run.principal().map(|principal| {
            let state = principal.state.lock();
            json!({
                "status_summary": state.status_summary_for_partner,
                "iteration_count": state.current_iteration_count,
                "message_count": state.messages.len(),
            })
        });

        ToolResponse::success(json!({
            "is_principal_flow_running": is_running,
            "principal": principal_summary,
            "work_module_rollup": module_rollup,
        }))
    }
}

/// `send_directive_to_principal` — the Partner injects a directive into a
/// running Principal's inbox; it is ingested on the Principal's next turn.
pub struct SendDirectiveToPrincipalTool;

#[async_trait]
impl Tool for SendDirectiveToPrincipalTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "send_directive_to_principal",
            "Send a mid-flight instruction to the running Principal. The Principal sees it at \
             the start of its next turn.",
            json!({
                "type": "object",
                "properties": {
                    "directive_content": {
                        "type": "string",
                        "description": "The instruction to deliver."
                    }
                },
                "required": ["directive_content"]
            }),
        )
        .with_toolset("principal_control")
    }

    async fn execute(
        &self,
        params: Value,
        run: &Arc<RunContext>,
        _sub: &Arc<SubContext>,
        _cancel: &CancellationToken,
    ) -> ToolResponse {
        let Some(content) = params.get("directive_content").and_then(Value::as_str) else {
            return ToolResponse::error("missing required parameter 'directive_content'");
        };
        let Some(principal) = run.principal() else {
            return ToolResponse::error("no Principal context exists for this run");
        };
        if !run.team.lock().is_principal_flow_running {
            return ToolResponse::error(
                "the Principal flow is not running; use the launch tool instead",
            );
        }

        principal.push_inbox(InboxItem::new(
            source::PARTNER_DIRECTIVE,
            json!({"content": content}),
        ));
        info!("partner directive queued for principal");
        ToolResponse::success(json!({"status": "directive_delivered"}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn finish_flow_writes_result_package() {
        let (run, partner) = testutil::partner_run("q");
        let resp = FinishFlowTool
            .execute(
                json!({
                    "status": "success",
                    "final_summary": "all done",
                    "deliverables": {"report": "text"}
                }),
                &run,
                &partner,
                &cancel(),
            )
            .await;
        assert!(!resp.is_error());

        let state = partner.state.lock();
        let package = state.final_result_package.as_ref().unwrap();
        assert_eq!(package["status"], "success");
        assert_eq!(package["final_summary"], "all done");
        assert_eq!(state.deliverables["report"], "text");
    }

    #[tokio::test]
    async fn manage_modules_add_allocates_monotonic_ids() {
        let (run, partner) = testutil::partner_run("q");
        let resp = ManageWorkModulesTool
            .execute(
                json!({
                    "action": "add",
                    "modules_to_add": [
                        {"name": "Research", "description": "dig"},
                        {"name": "Write", "description": "draft"}
                    ]
                }),
                &run,
                &partner,
                &cancel(),
            )
            .await;
        assert_eq!(resp.payload["created_module_ids"], json!(["WM_1", "WM_2"]));

        let team = run.team.lock();
        assert_eq!(team.work_modules["WM_1"].status, ModuleStatus::Pending);
        assert_eq!(team.work_modules["WM_2"].name, "Write");
    }

    #[tokio::test]
    async fn manage_modules_update_and_deprecate() {
        let (run, partner) = testutil::partner_run("q");
        let _ = ManageWorkModulesTool
            .execute(
                json!({"action": "add", "modules_to_add": [{"name": "A", "description": "d"}]}),
                &run,
                &partner,
                &cancel(),
            )
            .await;

        let resp = ManageWorkModulesTool
            .execute(
                json!({"action": "update", "module_id": "WM_1", "updates": {"notes": "refined"}}),
                &run,
                &partner,
                &cancel(),
            )
            .await;
        assert!(!resp.is_error());
        assert_eq!(run.team.lock().work_modules["WM_1"].notes, "refined");

        let resp = ManageWorkModulesTool
            .execute(
                json!({"action": "deprecate", "module_id": "WM_1"}),
                &run,
                &partner,
                &cancel(),
            )
            .await;
        assert!(!resp.is_error());
        assert_eq!(
            run.team.lock().work_modules["WM_1"].status,
            ModuleStatus::Deprecated
        );
    }

    #[tokio::test]
    async fn manage_modules_unknown_id_errors() {
        let (run, partner) = testutil::partner_run("q");
        let resp = ManageWorkModulesTool
            .execute(
                json!({"action": "update", "module_id": "WM_99", "updates": {}}),
                &run,
                &partner,
                &cancel(),
            )
            .await;
        assert!(resp.is_error());
    }

    #[tokio::test]
    async fn principal_status_reports_rollup() {
        let (run, partner) = testutil::partner_run("q");
        let _ = ManageWorkModulesTool
            .execute(
                json!({"action": "add", "modules_to_add": [
                    {"name": "A", "description": "d"},
                    {"name": "B", "description": "d"}
                ]}),
                &run,
                &partner,
                &cancel(),
            )
            .await;

        let resp = GetPrincipalStatusTool
            .execute(json!({}), &run, &partner, &cancel())
            .await;
        assert_eq!(resp.payload["is_principal_flow_running"], false);
        assert_eq!(resp.payload["work_module_rollup"]["pending"], 2);
    }

    #[tokio::test]
    async fn directive_requires_running_principal() {
        let (run, partner) = testutil::partner_run("q");
        let resp = SendDirectiveToPrincipalTool
            .execute(json!({"directive_content": "hurry"}), &run, &partner, &cancel())
            .await;
        assert!(resp.is_error());

        let principal = testutil::attach_principal(&run);
        run.team.lock().is_principal_flow_running = true;
        let resp = SendDirectiveToPrincipalTool
            .execute(json!({"directive_content": "hurry"}), &run, &partner, &cancel())
            .await;
        assert!(!resp.is_error());
        let state = principal.state.lock();
        assert_eq!(state.inbox.len(), 1);
        assert_eq!(state.inbox[0].source, source::PARTNER_DIRECTIVE);
        assert_eq!(state.inbox[0].payload["content"], "hurry");
    }
}
