//! Prompt-token estimation.
//!
//! A heuristic over CJK character count plus 1.3 tokens per remaining
//! whitespace-delimited word. Real counting is deferred to the provider's
//! usage report; this feeds the per-turn `predicted_usage` field only.

use troika_core::messages::ChatMessage;

/// Estimate tokens for a text fragment.
pub fn estimate_text_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    let cjk = text
        .chars()
        .filter(|c| {
            let cp = *c as u32;
            (0x4E00..=0x9FFF).contains(&cp)
                || (0x3400..=0x4DBF).contains(&cp)
                || (0x3040..=0x30FF).contains(&cp)
        })
        .count() as u64;
    let words = text
        .split_whitespace()
        .filter(|w| w.chars().any(|c| (c as u32) < 0x3000))
        .count() as f64;
    cjk + (words * 1.3).ceil() as u64
}

/// Estimate prompt tokens for a message list plus optional system prompt.
pub fn estimate_prompt_tokens(messages: &[ChatMessage], system_prompt: Option<&str>) -> u64 {
    let mut total = system_prompt.map(estimate_text_tokens).unwrap_or(0);
    for msg in messages {
        total += estimate_text_tokens(&msg.content);
        if let Some(calls) = &msg.tool_calls {
            for call in calls {
                total += estimate_text_tokens(&call.function.name);
                total += estimate_text_tokens(&call.function.arguments);
            }
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_zero() {
        assert_eq!(estimate_text_tokens(""), 0);
    }

    #[test]
    fn english_words_scale() {
        let est = estimate_text_tokens("one two three four");
        assert_eq!(est, (4.0f64 * 1.3).ceil() as u64);
    }

    #[test]
    fn cjk_counts_per_char() {
        assert_eq!(estimate_text_tokens("你好世界"), 4);
    }

    #[test]
    fn mixed_content_sums() {
        let est = estimate_text_tokens("hello 世界");
        assert_eq!(est, 2 + 2); // 2 CJK chars + ceil(1 word * 1.3)
    }

    #[test]
    fn message_list_includes_system_and_tool_calls() {
        let mut msg = ChatMessage::assistant("done now");
        msg.tool_calls = Some(vec![troika_core::messages::ToolCall::function(
            "c1",
            "echo",
            r#"{"s":"x"}"#,
        )]);
        let est = estimate_prompt_tokens(&[msg], Some("be brief"));
        assert!(est > 0);
    }
}
