//! The inbox processor: turns pending inbox items into messages ready for
//! the LLM.
//!
//! Processing order is strict-priority (tool results first, new user input
//! last), TTL garbage collection runs before ingestion, and every touched
//! item is logged onto the turn. Ingestor failures inject an in-band
//! system error message instead of aborting; the item is kept for the next
//! turn.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use troika_core::inbox::{ConsumptionPolicy, InboxItem, priority_for, source};
use troika_core::messages::{ChatMessage, Role};
use troika_core::turn::{ProcessedItemLog, StrategySource};
use troika_profiles::{AgentProfile, InjectionMode};

use crate::context::{RunContext, SubContext};
use crate::ingestors::{
    EventStrategy, IngestorCtx, fallback_strategy, global_strategy_for, system_error_block,
};
use crate::turn_manager::TurnManager;

/// What one inbox pass produced.
#[derive(Clone, Debug, Default)]
pub struct ProcessingResult {
    /// The message list to feed the LLM (history + injected items).
    pub messages_for_llm: Vec<ChatMessage>,
    /// Per-item processing log for the turn's inputs.
    pub processing_log: Vec<ProcessedItemLog>,
    /// Ids of items ingested this pass.
    pub processed_item_ids: Vec<String>,
}

/// Process the agent's inbox. An empty inbox returns the current message
/// history unchanged.
pub fn process_inbox(
    run: &Arc<RunContext>,
    sub: &Arc<SubContext>,
    profile: &Arc<AgentProfile>,
) -> ProcessingResult {
    let (mut inbox, mut messages) = {
        let mut state = sub.state.lock();
        let inbox = std::mem::take(&mut state.inbox);
        (inbox, state.messages.clone())
    };
    if inbox.is_empty() {
        return ProcessingResult {
            messages_for_llm: messages,
            ..ProcessingResult::default()
        };
    }
    debug!(agent_id = %sub.meta.agent_id, item_count = inbox.len(), "inbox processing started");

    // Priority sort (stable, so same-priority items keep arrival order)
    inbox.sort_by_key(|item| priority_for(&item.source));

    // TTL garbage collection for persistent items
    let mut survivors: Vec<InboxItem> = Vec::with_capacity(inbox.len());
    for mut item in inbox {
        let persistent = item.consumption_policy == ConsumptionPolicy::PersistentUntilConsumed;
        if persistent {
            if let Some(max_turns) = item.metadata.max_turns_in_inbox {
                item.metadata.turn_count_in_inbox += 1;
                if item.metadata.turn_count_in_inbox > max_turns {
                    warn!(
                        item_id = %item.item_id,
                        source = %item.source,
                        turn_count = item.metadata.turn_count_in_inbox - 1,
                        "inbox item expired"
                    );
                    continue;
                }
            }
        }
        survivors.push(item);
    }

    let turn_manager = TurnManager;
    let mut result = ProcessingResult::default();
    let mut items_to_keep: Vec<InboxItem> = Vec::new();

    for item in survivors {
        // USER_PROMPT items become user turns on the ledger first, so the
        // following agent turn chains through them.
        if item.source == source::USER_PROMPT {
            if let Some(user_turn_id) = turn_manager.create_user_turn(run, sub, &item) {
                sub.state.lock().last_turn_id = Some(user_turn_id);
            }
        }

        let (strategy, strategy_source) = resolve_strategy(profile, &item.source);
        let ingestor_name = strategy.ingestor.clone();
        let injection_mode = strategy.injection_mode;

        let ctx = IngestorCtx {
            run,
            sub,
            profile,
        };
        let rendered = match run.runtime.ingestors.get(&ingestor_name) {
            Some(ingestor) => ingestor.ingest(&item.payload, &strategy.params, &ctx),
            None => Err(crate::ingestors::IngestorError(format!(
                "no ingestor '{ingestor_name}' registered for source '{}'",
                item.source
            ))),
        };

        let injected_content = match rendered {
            Ok(text) => text,
            Err(e) => {
                warn!(
                    agent_id = %sub.meta.agent_id,
                    item_id = %item.item_id,
                    ingestor = %ingestor_name,
                    error = %e,
                    "inbox ingestor failed"
                );
                messages.push(ChatMessage::system(system_error_block(
                    "internal_event_processor",
                    &format!(
                        "A critical internal error occurred while I was processing information to \
                         prepare for my response. A piece of context (from an event '{}') could \
                         not be prepared.",
                        item.source
                    ),
                    &e.to_string(),
                )));
                items_to_keep.push(item);
                continue;
            }
        };

        let role = strategy.role();
        let mut new_message = ChatMessage {
            role,
            content: injected_content.clone(),
            timestamp: Some(troika_core::ids::now_iso()),
            ..ChatMessage::default()
        };
        let result_tool_call_id = item
            .payload
            .get("tool_call_id")
            .and_then(Value::as_str)
            .map(String::from);
        if role == Role::Tool {
            new_message.tool_call_id = result_tool_call_id.clone();
            new_message.name = item
                .payload
                .get("tool_name")
                .and_then(Value::as_str)
                .map(String::from);
        }

        // Close the matching tool interaction on the ledger
        if item.source == source::TOOL_RESULT {
            if let Some(call_id) = &result_tool_call_id {
                let payload_content = item.payload.get("content").cloned().unwrap_or(Value::Null);
                let is_error = item
                    .payload
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                turn_manager.update_tool_interaction_result(run, call_id, payload_content, is_error);
            }
        }

        match injection_mode {
            InjectionMode::AppendAsNewMessage => messages.push(new_message.clone()),
            InjectionMode::PrependToRole => {
                match messages.iter_mut().find(|m| m.role == role) {
                    Some(existing) => {
                        existing.content =
                            format!("{injected_content}\n\n---\n\n{}", existing.content);
                    }
                    None => messages.push(new_message.clone()),
                }
            }
        }

        if item.source == source::AGENT_STARTUP_BRIEFING {
            let mut state = sub.state.lock();
            let _ = state
                .flags
                .insert("initial_briefing_delivered".into(), Value::Bool(true));
            info!(agent_id = %sub.meta.agent_id, "startup briefing processed");
        }

        if strategy.persistent() {
            sub.state.lock().messages.push(new_message);
        }

        let predicted_tokens = troika_llm::tokens::estimate_text_tokens(&injected_content);

        result.processing_log.push(ProcessedItemLog {
            item_id: item.item_id.clone(),
            source: item.source.clone(),
            triggering_observer_id: item.metadata.triggering_observer_id.clone(),
            handling_strategy_source: strategy_source,
            ingestor_used: ingestor_name,
            injection_mode: match injection_mode {
                InjectionMode::AppendAsNewMessage => "append_as_new_message".into(),
                InjectionMode::PrependToRole => "prepend_to_role".into(),
            },
            injected_content,
            predicted_token_count: predicted_tokens,
            tool_call_id: result_tool_call_id,
        });
        result.processed_item_ids.push(item.item_id.clone());

        if item.consumption_policy != ConsumptionPolicy::ConsumeOnRead {
            items_to_keep.push(item);
        }
    }

    {
        // Items may have arrived while processing (observer fire, decider
        // injection); they stay ahead of the kept survivors.
        let mut state = sub.state.lock();
        state.inbox.extend(items_to_keep);
    }
    debug!(
        agent_id = %sub.meta.agent_id,
        consumed = result.processed_item_ids.len(),
        "inbox processing complete"
    );

    result.messages_for_llm = messages;
    result
}

fn resolve_strategy(profile: &AgentProfile, src: &str) -> (EventStrategy, StrategySource) {
    if let Some(override_) = profile
        .inbox_handling_strategies
        .iter()
        .find(|s| s.source == src)
    {
        let base = EventStrategy {
            ingestor: override_
                .ingestor
                .clone()
                .unwrap_or_else(|| "markdown_formatter".to_string()),
            injection_mode: override_.injection_mode.unwrap_or_default(),
            params: override_.params.clone(),
        };
        return (base, StrategySource::Profile);
    }
    match global_strategy_for(src) {
        Some(strategy) => (strategy, StrategySource::Global),
        None => (fallback_strategy(), StrategySource::Fallback),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use serde_json::json;

    #[test]
    fn empty_inbox_returns_history_unchanged() {
        let (run, partner) = testutil::partner_run("q");
        {
            let mut state = partner.state.lock();
            state.messages.push(ChatMessage::user("earlier"));
        }
        let profile = testutil::partner_profile();
        let result = process_inbox(&run, &partner, &profile);
        assert_eq!(result.messages_for_llm.len(), 1);
        assert!(result.processing_log.is_empty());
        assert!(result.processed_item_ids.is_empty());
    }

    #[test]
    fn priority_feeds_tool_results_before_user_prompts() {
        let (run, partner) = testutil::partner_run("q");
        let profile = testutil::partner_profile();
        {
            let mut state = partner.state.lock();
            state.inbox.push(InboxItem::new(
                source::USER_PROMPT,
                json!({"prompt": "new question"}),
            ));
            state.inbox.push(InboxItem::tool_result(
                "echo",
                "c1",
                json!({"echoed": "x"}),
                false,
            ));
        }

        let result = process_inbox(&run, &partner, &profile);
        assert_eq!(result.processing_log.len(), 2);
        assert_eq!(result.processing_log[0].source, source::TOOL_RESULT);
        assert_eq!(result.processing_log[1].source, source::USER_PROMPT);
    }

    #[test]
    fn consume_on_read_items_are_dropped_persistent_kept() {
        let (run, partner) = testutil::partner_run("q");
        let profile = testutil::partner_profile();
        {
            let mut state = partner.state.lock();
            state
                .inbox
                .push(InboxItem::new(source::USER_PROMPT, json!({"prompt": "hi"})));
            state.inbox.push(InboxItem::persistent(
                source::WORK_MODULES_STATUS_UPDATE,
                json!({}),
                5,
            ));
        }

        let _ = process_inbox(&run, &partner, &profile);
        let state = partner.state.lock();
        assert_eq!(state.inbox.len(), 1);
        assert_eq!(state.inbox[0].source, source::WORK_MODULES_STATUS_UPDATE);
        assert_eq!(state.inbox[0].metadata.turn_count_in_inbox, 1);
    }

    #[test]
    fn ttl_expiry_drops_item_at_bound_plus_one() {
        let (run, partner) = testutil::partner_run("q");
        let profile = testutil::partner_profile();
        {
            let mut state = partner.state.lock();
            state.inbox.push(InboxItem::persistent(
                source::WORK_MODULES_STATUS_UPDATE,
                json!({}),
                2,
            ));
        }

        // Turn 1 and 2: survives
        let r1 = process_inbox(&run, &partner, &profile);
        assert_eq!(r1.processed_item_ids.len(), 1);
        let r2 = process_inbox(&run, &partner, &profile);
        assert_eq!(r2.processed_item_ids.len(), 1);
        // Turn 3: counter exceeds the bound, dropped before ingestion
        let r3 = process_inbox(&run, &partner, &profile);
        assert!(r3.processed_item_ids.is_empty());
        assert!(partner.state.lock().inbox.is_empty());
    }

    #[test]
    fn user_prompt_creates_user_turn_and_updates_baton() {
        let (run, partner) = testutil::partner_run("q");
        let profile = testutil::partner_profile();
        partner.push_inbox(InboxItem::new(
            source::USER_PROMPT,
            json!({"prompt": "echo hello"}),
        ));

        let _ = process_inbox(&run, &partner, &profile);

        let baton = partner.state.lock().last_turn_id.clone().unwrap();
        assert!(baton.starts_with("turn_user_"));
        let team = run.team.lock();
        assert_eq!(
            team.find_turn(&baton).unwrap().turn_type,
            troika_core::turn::TurnType::UserTurn
        );
    }

    #[test]
    fn tool_result_closes_ledger_interaction() {
        let (run, partner) = testutil::partner_run("q");
        let profile = testutil::partner_profile();
        let tm = TurnManager;
        let turn_id = tm.start_new_turn(&run, &partner, "s1");
        let call = troika_core::messages::ToolCall::function("c1", "echo", r#"{"s":"x"}"#);
        tm.add_tool_interaction(&run, &partner, &call, json!({"s": "x"}));

        partner.push_inbox(InboxItem::tool_result("echo", "c1", json!({"echoed": "x"}), false));
        let result = process_inbox(&run, &partner, &profile);

        // The tool message carries the call id and name
        let tool_msg = result.messages_for_llm.last().unwrap();
        assert_eq!(tool_msg.role, Role::Tool);
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("c1"));
        assert_eq!(tool_msg.name.as_deref(), Some("echo"));
        assert_eq!(result.processing_log[0].tool_call_id.as_deref(), Some("c1"));

        let team = run.team.lock();
        let ti = &team.find_turn(&turn_id).unwrap().tool_interactions[0];
        assert_eq!(ti.status, troika_core::turn::ToolInteractionStatus::Completed);
    }

    #[test]
    fn persistent_strategy_appends_to_history() {
        let (run, partner) = testutil::partner_run("q");
        let profile = testutil::partner_profile();
        partner.push_inbox(InboxItem::new(source::USER_PROMPT, json!({"prompt": "hello"})));

        let _ = process_inbox(&run, &partner, &profile);
        // USER_PROMPT strategy is persistent
        let state = partner.state.lock();
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.messages[0].content, "hello");
    }

    #[test]
    fn briefing_sets_flag() {
        let (run, partner) = testutil::partner_run("q");
        let profile = testutil::partner_profile();
        partner.push_inbox(InboxItem::new(
            source::AGENT_STARTUP_BRIEFING,
            json!({
                "data": {"instructions": "do"},
                "schema_for_rendering": {"type": "object", "properties": {}}
            }),
        ));

        let _ = process_inbox(&run, &partner, &profile);
        let state = partner.state.lock();
        assert_eq!(state.flags["initial_briefing_delivered"], true);
    }

    #[test]
    fn ingestor_failure_injects_system_error_and_keeps_item() {
        let (run, partner) = testutil::partner_run("q");
        let profile = testutil::partner_profile();
        // templated_content with a missing key fails
        partner.push_inbox(InboxItem::new(
            source::SELF_REFLECTION_PROMPT,
            json!({"content_key": "no_such_template"}),
        ));

        let result = process_inbox(&run, &partner, &profile);
        let system_msg = result
            .messages_for_llm
            .iter()
            .find(|m| m.role == Role::System)
            .unwrap();
        assert!(system_msg.content.contains("system_error"));
        assert!(system_msg.content.contains("SELF_REFLECTION_PROMPT"));
        // Item kept for the next turn
        assert_eq!(partner.state.lock().inbox.len(), 1);
    }

    #[test]
    fn prepend_to_role_merges_into_first_match() {
        let (run, partner) = testutil::partner_run("q");
        let profile = testutil::partner_profile();
        {
            let mut state = partner.state.lock();
            state.messages.push(ChatMessage::user("original question"));
        }
        // SELF_REFLECTION_PROMPT uses prepend_to_role with the partner's
        // reflect template
        partner.push_inbox(InboxItem::new(
            source::SELF_REFLECTION_PROMPT,
            json!({"content_key": "reflect"}),
        ));

        let result = process_inbox(&run, &partner, &profile);
        assert_eq!(result.messages_for_llm.len(), 1);
        let merged = &result.messages_for_llm[0];
        assert!(merged.content.starts_with("Reflect on q"));
        assert!(merged.content.contains("---"));
        assert!(merged.content.ends_with("original question"));
    }

    #[test]
    fn profile_override_beats_global_strategy() {
        let (run, partner) = testutil::partner_run("q");
        let mut profile = (*testutil::partner_profile()).clone();
        profile.inbox_handling_strategies = vec![serde_json::from_value(json!({
            "source": "USER_PROMPT",
            "ingestor": "tagged_content",
            "injection_mode": "append_as_new_message",
            "params": {"role": "user", "wrapper_tags": ["<ask>", "</ask>"]}
        }))
        .unwrap()];
        let profile = Arc::new(profile);

        partner.push_inbox(InboxItem::new(source::USER_PROMPT, json!("raw prompt")));
        let result = process_inbox(&run, &partner, &profile);

        assert_eq!(result.processing_log[0].handling_strategy_source, StrategySource::Profile);
        assert_eq!(result.messages_for_llm.last().unwrap().content, "<ask>raw prompt</ask>");
    }

    #[test]
    fn unknown_source_uses_fallback_markdown() {
        let (run, partner) = testutil::partner_run("q");
        let profile = testutil::partner_profile();
        partner.push_inbox(InboxItem::new("CUSTOM_EVENT", json!({"detail": "thing"})));

        let result = process_inbox(&run, &partner, &profile);
        assert_eq!(result.processing_log[0].handling_strategy_source, StrategySource::Fallback);
        assert!(result.messages_for_llm.last().unwrap().content.contains("**Detail**: thing"));
    }
}
