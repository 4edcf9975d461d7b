//! View-model generation: UI-facing projections of the turn ledger and
//! work modules, streamed as `view_model_update` events.
//!
//! Three views exist. The flow view is the causal DAG (nodes + edges),
//! the timeline view groups turns into per-agent lanes ordered by start
//! time, and the kanban view groups work modules by status.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value, json};

use troika_core::events::{RunEvent, ViewName};
use troika_core::turn::{Turn, TurnType};

use crate::context::RunContext;

/// Generate one view model from the current ledger.
pub fn generate_view(run: &Arc<RunContext>, view: ViewName) -> Value {
    let team = run.team.lock();
    match view {
        ViewName::FlowView => flow_view(&team.turns),
        ViewName::TimelineView => timeline_view(&team.turns),
        ViewName::KanbanView => {
            let modules: Vec<_> = team.work_modules.values().cloned().collect();
            drop(team);
            kanban_view(&modules)
        }
    }
}

/// Generate and emit one view model.
pub fn emit_view_update(run: &Arc<RunContext>, view: ViewName) {
    let payload = generate_view(run, view);
    let _ = run.runtime.emitter.emit(RunEvent::ViewModelUpdate {
        run_id: run.meta.run_id.clone(),
        view_name: view,
        payload,
    });
}

/// Emit a full-ledger resync event.
pub fn emit_turns_sync(run: &Arc<RunContext>) {
    let turns = run.team.lock().turns.clone();
    let _ = run.runtime.emitter.emit(RunEvent::TurnsSync {
        run_id: run.meta.run_id.clone(),
        turns,
    });
}

fn flow_view(turns: &[Turn]) -> Value {
    let nodes: Vec<Value> = turns
        .iter()
        .map(|turn| {
            json!({
                "id": turn.turn_id,
                "turn_type": turn.turn_type,
                "status": turn.status,
                "flow_id": turn.flow_id,
                "agent_id": turn.agent_info.agent_id,
                "start_time": turn.start_time,
                "is_milestone": matches!(
                    turn.turn_type,
                    TurnType::AggregationTurn | TurnType::RestartDelimiterTurn
                ),
            })
        })
        .collect();

    let mut edges: Vec<Value> = Vec::new();
    for turn in turns {
        for source in &turn.source_turn_ids {
            edges.push(json!({
                "source": source,
                "target": turn.turn_id,
                "tool_call_id": turn.source_tool_call_id,
            }));
        }
    }

    json!({"nodes": nodes, "edges": edges})
}

fn timeline_view(turns: &[Turn]) -> Value {
    let mut lanes: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for turn in turns {
        lanes
            .entry(turn.agent_info.agent_id.clone())
            .or_default()
            .push(json!({
                "turn_id": turn.turn_id,
                "turn_type": turn.turn_type,
                "status": turn.status,
                "start_time": turn.start_time,
                "end_time": turn.end_time,
            }));
    }
    for entries in lanes.values_mut() {
        entries.sort_by(|a, b| {
            a["start_time"]
                .as_str()
                .unwrap_or_default()
                .cmp(b["start_time"].as_str().unwrap_or_default())
        });
    }
    json!({"lanes": lanes})
}

fn kanban_view(modules: &[troika_core::team::WorkModule]) -> Value {
    let mut columns: Map<String, Value> = Map::new();
    for module in modules {
        let status_key = serde_json::to_value(module.status)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| "unknown".to_string());
        let card = json!({
            "module_id": module.module_id,
            "name": module.name,
            "description": module.description,
            "updated_at": module.updated_at,
            "assignee_count": module.assignee_history.len(),
            "review_trigger": module.review_info.as_ref().map(|r| r.trigger.clone()),
        });
        match columns.get_mut(&status_key) {
            Some(Value::Array(cards)) => cards.push(card),
            _ => {
                let _ = columns.insert(status_key, json!([card]));
            }
        }
    }
    json!({"columns": columns})
}
