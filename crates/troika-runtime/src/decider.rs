//! The flow decider: the profile's ordered rule list deciding what the
//! agent does after each turn.
//!
//! Rules are evaluated top-down; the first whose condition holds wins.
//! Rule errors are logged and skipped. No match defaults to looping.

use std::sync::Arc;

use tracing::{debug, error, warn};

use troika_core::expr;
use troika_core::inbox::{InboxItem, source};
use troika_profiles::types::{DeciderAction, DeciderRule};
use troika_profiles::AgentProfile;

use crate::context::{ContextView, FlowOutcome, SubContext};

/// What the agent loop does next.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NextAction {
    /// Execute the chosen tool, then loop back to the same agent.
    Tool(String),
    /// Terminate the flow; the outcome is recorded on agent state.
    EndFlow,
    /// Park until new user input. Partner-only.
    AwaitUserInput,
    /// Loop without a tool.
    Loop,
}

impl NextAction {
    /// The action string recorded on the turn's outputs.
    pub fn as_str(&self) -> &str {
        match self {
            NextAction::Tool(name) => name,
            NextAction::EndFlow => "END_FLOW",
            NextAction::AwaitUserInput => "await_user_input",
            NextAction::Loop => "default",
        }
    }
}

/// Consult the profile's flow decider. Mutates agent state only for
/// `end_agent_turn` (records the outcome) and `loop_with_inbox_item`
/// (injects the reflection prompt).
pub fn decide_next_action(sub: &Arc<SubContext>, profile: &AgentProfile) -> NextAction {
    if profile.flow_decider.is_empty() {
        warn!(agent_id = %sub.meta.agent_id, "profile has no flow decider, defaulting to loop");
        return fallback_decision(sub);
    }

    for rule in &profile.flow_decider {
        match evaluate_rule(sub, rule) {
            Ok(Some(action)) => return action,
            Ok(None) => {}
            Err(message) => {
                error!(rule_id = %rule.id, message, "flow decider rule error");
            }
        }
    }

    warn!(agent_id = %sub.meta.agent_id, "no flow decider rule matched");
    NextAction::Loop
}

fn evaluate_rule(sub: &Arc<SubContext>, rule: &DeciderRule) -> Result<Option<NextAction>, String> {
    let view = ContextView::new(sub);
    let matched = expr::evaluate_bool(&rule.condition, &view).map_err(|e| e.to_string())?;
    if !matched {
        return Ok(None);
    }
    debug!(rule_id = %rule.id, "flow decider rule matched");

    match &rule.action {
        DeciderAction::ContinueWithTool => {
            let tool_name = sub
                .state
                .lock()
                .current_action
                .as_ref()
                .map(|a| a.tool_name.clone());
            match tool_name {
                Some(name) => Ok(Some(NextAction::Tool(name))),
                None => {
                    // The rule matched but no tool was chosen; let later
                    // rules decide.
                    warn!(rule_id = %rule.id, "continue_with_tool matched without a chosen tool");
                    Ok(None)
                }
            }
        }
        DeciderAction::EndAgentTurn {
            outcome,
            error_message,
        } => {
            let mut state = sub.state.lock();
            state.flow_outcome = Some(FlowOutcome {
                outcome: outcome.clone(),
                message: error_message.clone(),
            });
            Ok(Some(NextAction::EndFlow))
        }
        DeciderAction::LoopWithInboxItem { payload } => {
            if payload.get("content_key").is_none() {
                return Err("loop_with_inbox_item payload missing 'content_key'".to_string());
            }
            let mut item = InboxItem::new(source::SELF_REFLECTION_PROMPT, payload.clone());
            let _ = item.metadata.triggering_observer_id.insert(rule.id.clone());
            sub.push_inbox(item);
            Ok(Some(NextAction::Loop))
        }
        DeciderAction::AwaitUserInput => Ok(Some(NextAction::AwaitUserInput)),
    }
}

/// No decider declared: continue with a chosen tool if there is one, else
/// loop.
fn fallback_decision(sub: &Arc<SubContext>) -> NextAction {
    let tool_name = sub
        .state
        .lock()
        .current_action
        .as_ref()
        .map(|a| a.tool_name.clone());
    match tool_name {
        Some(name) => NextAction::Tool(name),
        None => NextAction::Loop,
    }
}

/// A standard decider fragment used by tests and default profiles:
/// continue with any chosen tool, otherwise end successfully.
pub fn default_rules() -> Vec<DeciderRule> {
    vec![
        DeciderRule {
            id: "tool_chosen".into(),
            condition: "state.current_action.tool_name".into(),
            action: DeciderAction::ContinueWithTool,
        },
        DeciderRule {
            id: "no_tool_end".into(),
            condition: "True".into(),
            action: DeciderAction::EndAgentTurn {
                outcome: "success".into(),
                error_message: None,
            },
        },
    ]
}

/// Partner-style decider: tools continue, otherwise wait for the user.
pub fn partner_rules() -> Vec<DeciderRule> {
    vec![
        DeciderRule {
            id: "tool_chosen".into(),
            condition: "state.current_action.tool_name".into(),
            action: DeciderAction::ContinueWithTool,
        },
        DeciderRule {
            id: "await_user".into(),
            condition: "True".into(),
            action: DeciderAction::AwaitUserInput,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CurrentAction;
    use crate::testutil;
    use serde_json::{Map, json};
    use troika_core::tools::ToolImplementation;

    fn choose_tool(sub: &Arc<SubContext>, name: &str) {
        sub.state.lock().current_action = Some(CurrentAction {
            tool_name: name.into(),
            tool_call_id: "c1".into(),
            arguments: Map::new(),
            implementation: ToolImplementation::Internal,
        });
    }

    fn profile_with(rules: Vec<DeciderRule>) -> AgentProfile {
        let mut profile = (*testutil::partner_profile()).clone();
        profile.flow_decider = rules;
        profile
    }

    #[test]
    fn tool_routes_to_tool_action() {
        let (_run, partner) = testutil::partner_run("q");
        choose_tool(&partner, "echo");
        let profile = profile_with(default_rules());
        assert_eq!(decide_next_action(&partner, &profile), NextAction::Tool("echo".into()));
    }

    #[test]
    fn no_tool_ends_flow_with_outcome() {
        let (_run, partner) = testutil::partner_run("q");
        let profile = profile_with(default_rules());
        assert_eq!(decide_next_action(&partner, &profile), NextAction::EndFlow);
        let state = partner.state.lock();
        assert_eq!(state.flow_outcome.as_ref().unwrap().outcome, "success");
    }

    #[test]
    fn first_matching_rule_wins() {
        let (_run, partner) = testutil::partner_run("q");
        choose_tool(&partner, "echo");
        let profile = profile_with(vec![
            DeciderRule {
                id: "force_end".into(),
                condition: "True".into(),
                action: DeciderAction::EndAgentTurn {
                    outcome: "early".into(),
                    error_message: None,
                },
            },
            DeciderRule {
                id: "tool".into(),
                condition: "state.current_action.tool_name".into(),
                action: DeciderAction::ContinueWithTool,
            },
        ]);
        assert_eq!(decide_next_action(&partner, &profile), NextAction::EndFlow);
    }

    #[test]
    fn loop_with_inbox_item_injects_reflection() {
        let (_run, partner) = testutil::partner_run("q");
        let profile = profile_with(vec![DeciderRule {
            id: "reflect".into(),
            condition: "True".into(),
            action: DeciderAction::LoopWithInboxItem {
                payload: json!({"content_key": "reflect"}),
            },
        }]);
        assert_eq!(decide_next_action(&partner, &profile), NextAction::Loop);

        let state = partner.state.lock();
        assert_eq!(state.inbox.len(), 1);
        assert_eq!(state.inbox[0].source, source::SELF_REFLECTION_PROMPT);
    }

    #[test]
    fn broken_rule_is_skipped() {
        let (_run, partner) = testutil::partner_run("q");
        let profile = profile_with(vec![
            DeciderRule {
                id: "broken".into(),
                condition: "(((".into(),
                action: DeciderAction::AwaitUserInput,
            },
            DeciderRule {
                id: "end".into(),
                condition: "True".into(),
                action: DeciderAction::EndAgentTurn {
                    outcome: "success".into(),
                    error_message: None,
                },
            },
        ]);
        assert_eq!(decide_next_action(&partner, &profile), NextAction::EndFlow);
    }

    #[test]
    fn no_match_defaults_to_loop() {
        let (_run, partner) = testutil::partner_run("q");
        let profile = profile_with(vec![DeciderRule {
            id: "never".into(),
            condition: "1 == 2".into(),
            action: DeciderAction::AwaitUserInput,
        }]);
        assert_eq!(decide_next_action(&partner, &profile), NextAction::Loop);
    }

    #[test]
    fn partner_rules_await_user() {
        let (_run, partner) = testutil::partner_run("q");
        let profile = profile_with(partner_rules());
        assert_eq!(decide_next_action(&partner, &profile), NextAction::AwaitUserInput);
    }
}
