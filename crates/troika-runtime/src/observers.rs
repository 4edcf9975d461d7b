//! Declarative observers, run pre- and post-turn by the agent loop.
//!
//! A failing observer never aborts the turn: the error becomes an
//! OBSERVER_FAILURE inbox item destined for the next prompt, and the chain
//! continues.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use troika_core::expr;
use troika_core::inbox::{ConsumptionPolicy, InboxItem};
use troika_core::paths::{ContextPaths, split_segments};
use troika_profiles::types::{ObserverAction, ObserverRule, UpdateOp};
use troika_profiles::AgentProfile;

use crate::context::{AgentState, ContextView, SubContext};

/// Which observer list to run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObserverPhase {
    /// Before inbox processing and prompt construction.
    PreTurn,
    /// After post-processing, before the flow decider.
    PostTurn,
}

/// Run one observer phase for an agent. Failures are converted to
/// OBSERVER_FAILURE inbox items.
pub fn run_observers(phase: ObserverPhase, sub: &Arc<SubContext>, profile: &AgentProfile) {
    let rules = match phase {
        ObserverPhase::PreTurn => &profile.pre_turn_observers,
        ObserverPhase::PostTurn => &profile.post_turn_observers,
    };
    if rules.is_empty() {
        return;
    }
    debug!(
        agent_id = %sub.meta.agent_id,
        observer_count = rules.len(),
        phase = ?phase,
        "processing observers"
    );

    for rule in rules {
        if let Err(message) = run_one(sub, rule) {
            warn!(observer_id = %rule.id, message, "observer failed");
            sub.push_inbox(
                InboxItem::new(
                    troika_core::inbox::source::OBSERVER_FAILURE,
                    json!({
                        "failed_observer_id": rule.id,
                        "error_message": message,
                    }),
                )
                .from_observer(rule.id.clone()),
            );
        }
    }
}

fn run_one(sub: &Arc<SubContext>, rule: &ObserverRule) -> Result<(), String> {
    let view = ContextView::new(sub);
    let should_run = match rule.condition.as_deref() {
        None | Some("True") | Some("true") => true,
        Some(condition) => expr::evaluate_bool(condition, &view).map_err(|e| e.to_string())?,
    };
    if !should_run {
        return Ok(());
    }
    info!(observer_id = %rule.id, "observer condition met");

    match &rule.action {
        ObserverAction::AddToInbox { inbox_item } => {
            let payload = resolve_payload_template(&inbox_item.payload, &view);
            let mut item = InboxItem::new(inbox_item.source.clone(), payload)
                .from_observer(rule.id.clone());
            item.consumption_policy = inbox_item.consumption_policy;
            if item.consumption_policy == ConsumptionPolicy::PersistentUntilConsumed {
                item.metadata.max_turns_in_inbox = inbox_item.max_turns_in_inbox;
            }
            sub.push_inbox(item);
            Ok(())
        }
        ObserverAction::UpdateState { updates } => {
            // Apply over a JSON image of the state so dotted paths can
            // create keys the struct doesn't name; flatten catches them.
            let mut image = {
                let state = sub.state.lock();
                serde_json::to_value(&*state).map_err(|e| e.to_string())?
            };
            for update in updates {
                let new_value = match update.operation {
                    UpdateOp::Set => update.value.clone().unwrap_or(Value::Null),
                    UpdateOp::Increment => {
                        let current = get_path(&image, &update.path)
                            .and_then(|v| v.as_i64())
                            .unwrap_or(0);
                        Value::from(current + 1)
                    }
                };
                set_path(&mut image, &update.path, new_value)?;
                debug!(path = %update.path, operation = ?update.operation, "observer state update");
            }
            let new_state: AgentState = serde_json::from_value(image).map_err(|e| e.to_string())?;
            *sub.state.lock() = new_state;
            Ok(())
        }
    }
}

/// A payload that is exactly one `{{ path }}` reference resolves to the
/// referenced value; anything else is taken literally.
fn resolve_payload_template(payload: &Value, view: &ContextView) -> Value {
    if let Value::String(s) = payload {
        let trimmed = s.trim();
        if trimmed.starts_with("{{") && trimmed.ends_with("}}") {
            let path = trimmed.trim_start_matches("{{").trim_end_matches("}}").trim();
            return match view.lookup(path) {
                Some(value) => value,
                None => {
                    warn!(path, "observer payload template did not resolve");
                    Value::Null
                }
            };
        }
    }
    payload.clone()
}

fn get_path(image: &Value, path: &str) -> Option<Value> {
    troika_core::paths::traverse(image, &split_segments(path))
}

fn set_path(image: &mut Value, path: &str, new_value: Value) -> Result<(), String> {
    let segments = split_segments(path);
    let mut cursor = image;
    for (idx, key) in segments.iter().enumerate() {
        let map = cursor
            .as_object_mut()
            .ok_or_else(|| format!("path '{path}' traverses a non-object"))?;
        if idx == segments.len() - 1 {
            let _ = map.insert(key.clone(), new_value);
            return Ok(());
        }
        cursor = map
            .entry(key.clone())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
    Err(format!("empty path '{path}'"))
}
