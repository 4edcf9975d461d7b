//! The tool-call safenet: last-mile repair of the message stream before it
//! reaches an LLM.
//!
//! Scans left-to-right. Each assistant message with tool calls opens a
//! block; the tool responses that follow (contiguously, modulo interlopers)
//! are collected and two invariants enforced:
//!
//! - **Proximity**: non-tool messages sitting between the calls and their
//!   responses are moved after the responses, with an advisory prepended.
//! - **Symmetry**: missing responses are synthesized as error tool
//!   messages; responses without a matching call are demoted to assistant
//!   messages with an advisory.
//!
//! The safenet never aborts and is idempotent: a compliant sequence passes
//! through untouched.

use std::collections::HashSet;

use tracing::error;

use troika_core::messages::{ChatMessage, Role};

/// Repair proximity and symmetry violations in a message list.
pub fn tool_call_safenet(messages: &[ChatMessage], agent_id: &str) -> Vec<ChatMessage> {
    let mut corrected: Vec<ChatMessage> = Vec::with_capacity(messages.len());
    let mut i = 0;

    while i < messages.len() {
        let current = &messages[i];
        let has_calls = current.role == Role::Assistant
            && current.tool_calls.as_ref().is_some_and(|c| !c.is_empty());
        if !has_calls {
            corrected.push(current.clone());
            i += 1;
            continue;
        }

        let assistant = current.clone();
        let expected_ids: HashSet<String> =
            assistant.tool_call_ids().iter().map(|s| (*s).to_string()).collect();
        corrected.push(assistant.clone());

        // Scan ahead for the response block, tolerating interlopers while
        // responses are still owed.
        let mut tool_block: Vec<ChatMessage> = Vec::new();
        let mut interlopers: Vec<ChatMessage> = Vec::new();
        let mut j = i + 1;
        while j < messages.len() {
            match messages[j].role {
                Role::Tool => {
                    tool_block.push(messages[j].clone());
                    j += 1;
                }
                Role::Assistant => break,
                _ => {
                    let found: HashSet<String> = tool_block
                        .iter()
                        .filter_map(|m| m.tool_call_id.clone())
                        .collect();
                    if expected_ids.difference(&found).next().is_some() {
                        interlopers.push(messages[j].clone());
                        j += 1;
                    } else {
                        break;
                    }
                }
            }
        }

        // Proximity correction
        if !interlopers.is_empty() {
            let advisory = format!(
                "[SAFENET ERROR] Proximity violation detected for agent '{agent_id}'. \
                 Found {} message(s) between tool call and tool response. Reordering.",
                interlopers.len()
            );
            error!(agent_id, interloper_count = interlopers.len(), "proximity violation");
            for msg in &mut interlopers {
                msg.content = format!("{advisory}\n\n{}", msg.content);
            }
        }

        let found_ids: HashSet<String> = tool_block
            .iter()
            .filter_map(|m| m.tool_call_id.clone())
            .collect();

        // Symmetry: synthesize missing responses
        let mut missing: Vec<&String> = expected_ids.difference(&found_ids).collect();
        missing.sort();
        for missing_id in missing {
            error!(agent_id, tool_call_id = %missing_id, "missing tool response, synthesizing");
            let tool_name = assistant
                .tool_calls
                .as_deref()
                .unwrap_or_default()
                .iter()
                .find(|tc| &tc.id == missing_id)
                .map(|tc| tc.function.name.clone())
                .unwrap_or_else(|| "unknown_tool".to_string());
            tool_block.push(ChatMessage::tool(
                format!(
                    "{{\"error\": \"no_response_from_tool\", \"message\": \
                     \"[SAFENET ERROR] Symmetry violation detected for agent '{agent_id}'. \
                     No response was recorded for this tool call.\"}}"
                ),
                missing_id.clone(),
                tool_name,
            ));
        }

        // Symmetry: demote responses without a matching call. Demoted
        // messages are appended after the tool block so the repaired
        // sequence stays contiguous (and a second pass is a no-op).
        let mut repaired_block = Vec::with_capacity(tool_block.len());
        let mut demoted_block = Vec::new();
        for msg in tool_block {
            let orphaned = msg
                .tool_call_id
                .as_ref()
                .is_some_and(|id| !expected_ids.contains(id));
            if orphaned {
                error!(
                    agent_id,
                    tool_call_id = msg.tool_call_id.as_deref().unwrap_or(""),
                    "extra tool response, neutralizing"
                );
                let mut demoted = msg.clone();
                demoted.role = Role::Assistant;
                demoted.content = format!(
                    "[SAFENET ERROR] Symmetry violation detected for agent '{agent_id}'. \
                     This tool response matched no outstanding call.\n\n\
                     Original tool response content:\n{}",
                    msg.content
                );
                demoted.tool_call_id = None;
                demoted.name = None;
                demoted_block.push(demoted);
            } else {
                repaired_block.push(msg);
            }
        }

        corrected.extend(repaired_block);
        corrected.extend(demoted_block);
        corrected.extend(interlopers);
        i = j;
    }

    corrected
}

#[cfg(test)]
mod tests {
    use super::*;
    use troika_core::messages::ToolCall;

    fn assistant_with_calls(ids: &[(&str, &str)]) -> ChatMessage {
        let mut msg = ChatMessage::assistant("");
        msg.tool_calls = Some(
            ids.iter()
                .map(|(id, name)| ToolCall::function(*id, *name, "{}"))
                .collect(),
        );
        msg
    }

    #[test]
    fn compliant_sequence_is_untouched() {
        let messages = vec![
            ChatMessage::user("search news"),
            assistant_with_calls(&[("c1", "search")]),
            ChatMessage::tool("results", "c1", "search"),
            ChatMessage::user("thanks"),
        ];
        let out = tool_call_safenet(&messages, "agent");
        assert_eq!(out, messages);
    }

    #[test]
    fn missing_response_is_synthesized() {
        let messages = vec![
            ChatMessage::user("run two tools"),
            assistant_with_calls(&[("c1", "tool1"), ("c2", "tool2")]),
            ChatMessage::tool("tool 1 response", "c1", "tool1"),
        ];
        let out = tool_call_safenet(&messages, "agent");
        assert_eq!(out.len(), 4);

        // Exactly two tool messages directly after the assistant
        assert_eq!(out[2].role, Role::Tool);
        assert_eq!(out[3].role, Role::Tool);
        let synthesized = out
            .iter()
            .find(|m| m.tool_call_id.as_deref() == Some("c2"))
            .unwrap();
        assert!(synthesized.content.starts_with("{\"error\": \"no_response_from_tool\""));
        assert_eq!(synthesized.name.as_deref(), Some("tool2"));
    }

    #[test]
    fn interloper_is_reordered_after_responses() {
        let messages = vec![
            ChatMessage::user("search"),
            assistant_with_calls(&[("c1", "search")]),
            ChatMessage::user("wait, another question"),
            ChatMessage::tool("results", "c1", "search"),
        ];
        let out = tool_call_safenet(&messages, "agent");
        assert_eq!(out.len(), 4);
        assert_eq!(out[1].role, Role::Assistant);
        assert_eq!(out[2].role, Role::Tool);
        assert_eq!(out[3].role, Role::User);
        assert!(out[3].content.contains("[SAFENET ERROR]"));
        assert!(out[3].content.contains("another question"));
    }

    #[test]
    fn extra_response_is_demoted_to_assistant() {
        let messages = vec![
            ChatMessage::user("one call"),
            assistant_with_calls(&[("c1", "tool1")]),
            ChatMessage::tool("correct", "c1", "tool1"),
            ChatMessage::tool("extra", "c_ghost", "unknown_tool"),
        ];
        let out = tool_call_safenet(&messages, "agent");
        assert_eq!(out.len(), 4);
        let demoted = &out[3];
        assert_eq!(demoted.role, Role::Assistant);
        assert!(demoted.tool_call_id.is_none());
        assert!(demoted.name.is_none());
        assert!(demoted.content.contains("extra"));
        assert!(demoted.content.contains("[SAFENET ERROR]"));
    }

    #[test]
    fn multiple_blocks_processed_independently() {
        let messages = vec![
            ChatMessage::user("go"),
            assistant_with_calls(&[("c1", "manage_work_modules")]),
            ChatMessage::tool("failed", "c1", "manage_work_modules"),
            assistant_with_calls(&[("c2", "manage_work_modules")]),
            ChatMessage::tool("ok", "c2", "manage_work_modules"),
            ChatMessage::user("### status"),
        ];
        let out = tool_call_safenet(&messages, "agent");
        assert_eq!(out, messages);
    }

    #[test]
    fn response_missing_call_id_counts_as_nothing() {
        let mut orphan = ChatMessage::tool("response", "x", "tool1");
        orphan.tool_call_id = None;
        let messages = vec![
            ChatMessage::user("call"),
            assistant_with_calls(&[("c1", "tool1")]),
            orphan,
        ];
        let out = tool_call_safenet(&messages, "agent");
        // The id-less response passes through; a synthesized response for
        // c1 is appended
        assert!(out.iter().any(|m| m.tool_call_id.as_deref() == Some("c1")
            && m.content.contains("no_response_from_tool")));
    }

    #[test]
    fn assistant_without_calls_is_plain() {
        let messages = vec![
            ChatMessage::assistant("just text"),
            ChatMessage::user("ok"),
        ];
        let out = tool_call_safenet(&messages, "agent");
        assert_eq!(out, messages);
    }

    #[test]
    fn empty_input_is_empty() {
        assert!(tool_call_safenet(&[], "agent").is_empty());
    }

    #[test]
    fn safenet_is_idempotent() {
        let messages = vec![
            ChatMessage::user("run two tools"),
            assistant_with_calls(&[("c1", "tool1"), ("c2", "tool2")]),
            ChatMessage::user("interloper"),
            ChatMessage::tool("tool 1 response", "c1", "tool1"),
            ChatMessage::tool("ghost", "c9", "ghost_tool"),
        ];
        let once = tool_call_safenet(&messages, "agent");
        let twice = tool_call_safenet(&once, "agent");
        assert_eq!(once, twice);
    }
}
