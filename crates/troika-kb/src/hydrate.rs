//! Token hydration and cooperative dehydration.
//!
//! Hydration scans strings for `<#CGKB-NNNNN>` tokens and splices the
//! stored content back in. Token chains are followed recursively with a
//! depth bound and a seen-set cycle guard; container nesting does not
//! consume depth, so a dehydrated payload always round-trips regardless of
//! how deeply it sits inside a tool result.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::warn;

use troika_core::turn::Turn;

use crate::{KnowledgeBase, KnowledgeItemMetadata};

/// Default recursion bound for token chains.
pub const MAX_HYDRATION_DEPTH: usize = 5;

/// Default dehydration threshold in bytes (1 KB).
pub const DEHYDRATION_THRESHOLD: usize = 1024;

fn token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<#CGKB-\d{5}>").expect("static regex"))
}

/// Whether any string inside `content` carries a KB token.
pub fn contains_tokens(content: &Value) -> bool {
    match content {
        Value::String(s) => token_regex().is_match(s),
        Value::Object(map) => map.values().any(contains_tokens),
        Value::Array(items) => items.iter().any(contains_tokens),
        _ => false,
    }
}

impl KnowledgeBase {
    /// Hydrate all tokens in `content` with the default depth bound.
    /// Content without tokens is returned unchanged.
    pub fn hydrate(&mut self, content: &Value) -> Value {
        if !contains_tokens(content) {
            return content.clone();
        }
        let mut seen = HashSet::new();
        self.hydrate_value(content, &mut seen, MAX_HYDRATION_DEPTH)
    }

    fn hydrate_value(&mut self, content: &Value, seen: &mut HashSet<String>, depth: usize) -> Value {
        match content {
            Value::String(s) => Value::String(self.hydrate_string(s, seen, depth)),
            Value::Object(map) => {
                let mut out = Map::new();
                for (k, v) in map {
                    let _ = out.insert(k.clone(), self.hydrate_value(v, seen, depth));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.hydrate_value(v, seen, depth))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn hydrate_string(&mut self, s: &str, seen: &mut HashSet<String>, depth: usize) -> String {
        if depth == 0 {
            return s.to_string();
        }
        let tokens: Vec<String> = token_regex()
            .find_iter(s)
            .map(|m| m.as_str().to_string())
            .collect();
        let mut out = s.to_string();
        for token in tokens {
            if seen.contains(&token) {
                warn!(token, "circular token reference, stopping hydration on this path");
                continue;
            }
            let Some(item_id) = self.items_by_token.get(&token).cloned() else {
                warn!(token, "token found in content but no matching knowledge item");
                continue;
            };
            let Some(content) = self.items_by_id.get(&item_id).map(|i| i.content.clone()) else {
                continue;
            };
            if let Some(item) = self.items_by_id.get_mut(&item_id) {
                item.metadata.access_count += 1;
            }
            let _ = seen.insert(token.clone());
            let hydrated = self.hydrate_value(&content, seen, depth - 1);
            let _ = seen.remove(&token);
            let replacement = troika_core::paths::display_value(&hydrated);
            out = out.replace(&token, &replacement);
        }
        out
    }

    /// Deep-copy a turn list and hydrate every tool interaction's
    /// `result_payload`.
    pub fn hydrate_turn_tool_results(&mut self, turns: &[Turn]) -> Vec<Turn> {
        let mut hydrated = turns.to_vec();
        for turn in &mut hydrated {
            for interaction in &mut turn.tool_interactions {
                if let Some(payload) = interaction.result_payload.take() {
                    interaction.result_payload = Some(self.hydrate(&payload));
                }
            }
        }
        hydrated
    }

    /// Cooperative dehydration over a payload: strings whose byte length
    /// exceeds `threshold` are stored and replaced wholesale with a token;
    /// objects and arrays are recursed into item-wise.
    pub fn dehydrate_payload(
        &mut self,
        payload: &Value,
        threshold: usize,
        base_metadata: &KnowledgeItemMetadata,
    ) -> Value {
        match payload {
            Value::String(s) if s.len() > threshold => {
                let mut metadata = base_metadata.clone();
                let _ = metadata
                    .extra
                    .insert("dehydration_reason".into(), Value::String("size_threshold".into()));
                let _ = metadata
                    .extra
                    .insert("size_bytes".into(), Value::Number(s.len().into()));
                let token = self.store_with_token(payload.clone(), metadata);
                Value::String(token)
            }
            Value::Object(map) => {
                let mut out = Map::new();
                for (k, v) in map {
                    let _ = out.insert(k.clone(), self.dehydrate_payload(v, threshold, base_metadata));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.dehydrate_payload(v, threshold, base_metadata))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NewItem;
    use serde_json::json;

    fn kb_with(content: Value) -> (KnowledgeBase, String) {
        let mut kb = KnowledgeBase::new("run_h");
        let token = kb.store_with_token(content, KnowledgeItemMetadata::default());
        (kb, token)
    }

    #[test]
    fn hydrate_without_tokens_is_identity() {
        let mut kb = KnowledgeBase::new("run_h");
        let content = json!({"a": [1, "two", {"b": null}]});
        assert_eq!(kb.hydrate(&content), content);
    }

    #[test]
    fn token_round_trips_bytes() {
        let original = "line one\nline two with unicode: 你好\n".repeat(40);
        let (mut kb, token) = kb_with(json!(original));
        let hydrated = kb.hydrate(&json!(token));
        assert_eq!(hydrated, json!(original));
    }

    #[test]
    fn hydration_increments_access_count() {
        let (mut kb, token) = kb_with(json!("payload"));
        let item_id = kb.items_by_token[&token].clone();
        assert_eq!(kb.items_by_id[&item_id].metadata.access_count, 0);

        let _ = kb.hydrate(&json!(token));
        assert_eq!(kb.items_by_id[&item_id].metadata.access_count, 1);

        let _ = kb.hydrate(&json!(format!("before {token} after")));
        assert_eq!(kb.items_by_id[&item_id].metadata.access_count, 2);
    }

    #[test]
    fn token_inside_larger_string_is_spliced() {
        let (mut kb, token) = kb_with(json!("CONTENT"));
        let hydrated = kb.hydrate(&json!(format!("result: {token}!")));
        assert_eq!(hydrated, json!("result: CONTENT!"));
    }

    #[test]
    fn nested_containers_are_hydrated() {
        let (mut kb, token) = kb_with(json!("deep"));
        let payload = json!({"outer": [{"inner": token}]});
        let hydrated = kb.hydrate(&payload);
        assert_eq!(hydrated["outer"][0]["inner"], "deep");
    }

    #[test]
    fn token_chains_hydrate_recursively() {
        let mut kb = KnowledgeBase::new("run_h");
        let inner_token = kb.store_with_token(json!("INNER"), KnowledgeItemMetadata::default());
        let outer_token = kb.store_with_token(
            json!(format!("outer wraps {inner_token}")),
            KnowledgeItemMetadata::default(),
        );
        let hydrated = kb.hydrate(&json!(outer_token));
        assert_eq!(hydrated, json!("outer wraps INNER"));
    }

    #[test]
    fn circular_references_stop_cleanly() {
        let mut kb = KnowledgeBase::new("run_h");
        // Two items that reference each other
        let token_a = kb.generate_next_token();
        let token_b = kb.generate_next_token();
        let _ = kb.add_item(NewItem {
            item_type: "T".into(),
            content: json!(format!("a sees {token_b}")),
            ..NewItem::default()
        });
        let _ = kb.add_item(NewItem {
            item_type: "T".into(),
            content: json!(format!("b sees {token_a}")),
            ..NewItem::default()
        });
        // Rebind tokens to the right items
        let ids: Vec<String> = kb.items_by_id.keys().cloned().collect();
        let _ = kb.items_by_token.insert(token_a.clone(), ids[0].clone());
        let _ = kb.items_by_token.insert(token_b.clone(), ids[1].clone());

        let hydrated = kb.hydrate(&json!(token_a));
        // Terminates; the cycle leaves the repeated token in place
        let text = hydrated.as_str().unwrap();
        assert!(text.contains("a sees") || text.contains("b sees"));
    }

    #[test]
    fn unknown_token_left_in_place() {
        let mut kb = KnowledgeBase::new("run_h");
        let content = json!("see <#CGKB-09999> here");
        assert_eq!(kb.hydrate(&content), content);
    }

    #[test]
    fn dehydrate_replaces_only_oversize_strings() {
        let mut kb = KnowledgeBase::new("run_h");
        let big = "x".repeat(2048);
        let payload = json!({
            "small": "keep me",
            "big": big,
            "list": [big, "tiny"],
        });
        let out = kb.dehydrate_payload(&payload, DEHYDRATION_THRESHOLD, &KnowledgeItemMetadata::default());

        assert_eq!(out["small"], "keep me");
        assert!(out["big"].as_str().unwrap().starts_with("<#CGKB-"));
        assert!(out["list"][0].as_str().unwrap().starts_with("<#CGKB-"));
        assert_eq!(out["list"][1], "tiny");
        // Both oversize strings were identical, but store_with_token does
        // not dedupe; two items exist
        assert_eq!(kb.items_by_id.len(), 2);
    }

    #[test]
    fn dehydrate_then_hydrate_round_trips() {
        let mut kb = KnowledgeBase::new("run_h");
        let big = "payload body ".repeat(200);
        let payload = json!({"content": big, "kept": 7});
        let dehydrated =
            kb.dehydrate_payload(&payload, DEHYDRATION_THRESHOLD, &KnowledgeItemMetadata::default());
        assert_ne!(dehydrated, payload);

        let hydrated = kb.hydrate(&dehydrated);
        assert_eq!(hydrated, payload);
    }

    proptest::proptest! {
        #[test]
        fn hydrate_is_identity_without_tokens(s in "[a-zA-Z0-9 .,!?]{0,200}") {
            let mut kb = KnowledgeBase::new("run_p");
            let content = json!(s);
            proptest::prop_assert_eq!(kb.hydrate(&content), content);
        }
    }

    #[test]
    fn hydrate_turn_tool_results_deep_copies() {
        let (mut kb, token) = kb_with(json!("tool output"));
        let mut turn = troika_core::turn::Turn {
            turn_id: "t1".into(),
            run_id: "r".into(),
            flow_id: "f".into(),
            agent_info: troika_core::turn::AgentInfo::default(),
            turn_type: troika_core::turn::TurnType::AgentTurn,
            status: troika_core::turn::TurnStatus::Completed,
            start_time: troika_core::ids::now_iso(),
            end_time: None,
            source_turn_ids: vec![],
            source_tool_call_id: None,
            inputs: troika_core::turn::TurnInputs::default(),
            outputs: serde_json::Map::new(),
            llm_interaction: None,
            tool_interactions: vec![troika_core::turn::ToolInteraction {
                tool_call_id: "c1".into(),
                tool_name: "echo".into(),
                start_time: troika_core::ids::now_iso(),
                end_time: None,
                status: troika_core::turn::ToolInteractionStatus::Completed,
                input_params: json!({}),
                result_payload: Some(json!(token)),
                error_details: None,
            }],
            metadata: serde_json::Map::new(),
            error_details: None,
        };

        let hydrated = kb.hydrate_turn_tool_results(std::slice::from_ref(&turn));
        assert_eq!(
            hydrated[0].tool_interactions[0].result_payload,
            Some(json!("tool output"))
        );
        // Original untouched
        turn.tool_interactions[0]
            .result_payload
            .as_ref()
            .map(|p| assert_eq!(p, &json!(token)))
            .unwrap();
    }
}
