//! # troika-kb
//!
//! Run-scoped, in-memory, content-addressed knowledge store.
//!
//! Oversize tool payloads are *dehydrated*: stored here and replaced in the
//! message stream with a token of the form `<#CGKB-00001>`. Before every
//! LLM feed the runtime *hydrates* tokens back to their content
//! (recursively, depth-limited, cycle-guarded — see [`hydrate`]).
//!
//! Deduplication on [`KnowledgeBase::add_item`] is deterministic:
//!
//! 1. URI matches and hash matches → merge metadata, return existing.
//! 2. URI matches and hash differs → update content in place, reindex.
//! 3. Hash alone matches → attach the new URI, or dedupe outright.
//! 4. Otherwise insert as a new item with the next sequence token.

#![deny(unsafe_code)]

pub mod hydrate;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use troika_core::ids;

/// Metadata attached to a knowledge item.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeItemMetadata {
    /// First-added timestamp.
    #[serde(default)]
    pub timestamp_added: String,
    /// Last-updated timestamp.
    #[serde(default)]
    pub timestamp_last_updated: String,
    /// The item's dehydration token, once allocated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Every tool call that contributed to or updated this item.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contributing_tool_call_ids: Vec<String>,
    /// How many times this item has been hydrated.
    #[serde(default)]
    pub access_count: u64,
    /// Tool that produced the content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_tool_name: Option<String>,
    /// The specific tool call that produced the content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Anything else tools attach (titles, tags, dehydration reasons).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A content-addressed entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeItem {
    /// Unique item id (`kb_<hex>`).
    pub id: String,
    /// Item type (e.g. `WEB_PAGE_CONTENT`, `TOKEN_DEHYDRATED_CONTENT`).
    pub item_type: String,
    /// Canonical source URI, primary deduplication key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_uri: Option<String>,
    /// The stored content.
    pub content: Value,
    /// SHA-256 over the normalized content.
    pub content_hash: String,
    /// Metadata.
    pub metadata: KnowledgeItemMetadata,
    /// Owning run.
    pub run_id: String,
}

/// Input to [`KnowledgeBase::add_item`].
#[derive(Clone, Debug, Default)]
pub struct NewItem {
    /// Item type. Required.
    pub item_type: String,
    /// Content. Required (non-null).
    pub content: Value,
    /// Optional canonical URI.
    pub source_uri: Option<String>,
    /// Metadata seed (tool name, call id, titles, ...).
    pub metadata: KnowledgeItemMetadata,
    /// Caller-provided id override.
    pub id: Option<String>,
}

/// How an `add_item` call resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddStatus {
    /// Inserted as a new item.
    NewItemAdded,
    /// Same URI, same content: metadata merged.
    DeduplicatedUriHashMatch,
    /// Same URI, new content: updated in place.
    UpdatedUriMatch,
    /// Same content found under another (or no) URI: URI attached.
    EnrichedHashMatchWithUri,
    /// Same content, no URI given: deduped outright.
    DeduplicatedHashMatchNoUri,
}

/// Result of an `add_item` call.
#[derive(Clone, Debug, PartialEq)]
pub struct AddOutcome {
    /// How the call resolved.
    pub status: AddStatus,
    /// The surviving item id.
    pub item_id: String,
    /// The item's token.
    pub token: String,
}

/// Errors raised by the knowledge base.
#[derive(Debug, thiserror::Error)]
pub enum KbError {
    /// `item_type` or `content` missing.
    #[error("item_type and content are required to add a knowledge item")]
    MissingFields,
}

/// The run-scoped store. Serializable in full so snapshots round-trip the
/// indices and the token sequence.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KnowledgeBase {
    /// Owning run.
    pub run_id: String,
    /// Primary store.
    #[serde(default)]
    pub items_by_id: BTreeMap<String, KnowledgeItem>,
    /// URI → item id.
    #[serde(default)]
    pub items_by_uri: BTreeMap<String, String>,
    /// Content hash → item ids (same content may carry several URIs).
    #[serde(default)]
    pub items_by_hash: BTreeMap<String, Vec<String>>,
    /// Tool call id → item id.
    #[serde(default)]
    pub items_by_tool_call_id: BTreeMap<String, String>,
    /// Token → item id.
    #[serde(default)]
    pub items_by_token: BTreeMap<String, String>,
    /// Global token sequence, starts at 1.
    #[serde(rename = "_next_sequence", default = "first_sequence")]
    pub next_sequence: u64,
}

fn first_sequence() -> u64 {
    1
}

/// Canonical JSON: objects with sorted keys, compact separators. Strings
/// hash as their raw bytes so a string and its JSON quoting never collide
/// with each other across add calls.
pub fn canonical_content_string(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        other => canonical_json(other),
    }
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<(&String, &Value)> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let inner: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

/// SHA-256 hex digest over the normalized content.
pub fn content_hash(content: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_content_string(content).as_bytes());
    format!("{:x}", hasher.finalize())
}

impl KnowledgeBase {
    /// A fresh store for one run.
    pub fn new(run_id: impl Into<String>) -> Self {
        let run_id = run_id.into();
        info!(run_id, "knowledge base created");
        Self {
            run_id,
            next_sequence: 1,
            ..Self::default()
        }
    }

    /// Allocate the next token: `<#CGKB-` + 5-digit sequence + `>`.
    pub fn generate_next_token(&mut self) -> String {
        let token = format!("<#CGKB-{:05}>", self.next_sequence);
        self.next_sequence += 1;
        token
    }

    fn ensure_token(&mut self, item_id: &str) -> String {
        if let Some(existing) = self
            .items_by_id
            .get(item_id)
            .and_then(|i| i.metadata.token.clone())
        {
            return existing;
        }
        let token = self.generate_next_token();
        if let Some(item) = self.items_by_id.get_mut(item_id) {
            item.metadata.token = Some(token.clone());
        }
        let _ = self.items_by_token.insert(token.clone(), item_id.to_string());
        token
    }

    fn record_contribution(&mut self, item_id: &str, tool_call_id: Option<&str>) {
        let Some(call_id) = tool_call_id else { return };
        if let Some(item) = self.items_by_id.get_mut(item_id) {
            if !item
                .metadata
                .contributing_tool_call_ids
                .iter()
                .any(|c| c == call_id)
            {
                item.metadata.contributing_tool_call_ids.push(call_id.to_string());
                item.metadata.timestamp_last_updated = ids::now_iso();
            }
        }
    }

    /// Add an item per the deterministic deduplication algorithm.
    pub fn add_item(&mut self, new: NewItem) -> Result<AddOutcome, KbError> {
        if new.item_type.is_empty() || new.content.is_null() {
            return Err(KbError::MissingFields);
        }

        let hash = content_hash(&new.content);
        let call_id = new.metadata.tool_call_id.clone();

        // 1. URI match
        if let Some(uri) = &new.source_uri {
            if let Some(existing_id) = self.items_by_uri.get(uri).cloned() {
                if self.items_by_id.contains_key(&existing_id) {
                    let existing_hash = self.items_by_id[&existing_id].content_hash.clone();
                    if existing_hash == hash {
                        debug!(uri, item_id = %existing_id, "uri+hash match, merging metadata");
                        self.record_contribution(&existing_id, call_id.as_deref());
                        let token = self.ensure_token(&existing_id);
                        return Ok(AddOutcome {
                            status: AddStatus::DeduplicatedUriHashMatch,
                            item_id: existing_id,
                            token,
                        });
                    }
                    // URI matches, content differs: overwrite and reindex
                    info!(uri, item_id = %existing_id, "uri match with new content, updating item");
                    if let Some(ids) = self.items_by_hash.get_mut(&existing_hash) {
                        ids.retain(|i| i != &existing_id);
                        if ids.is_empty() {
                            let _ = self.items_by_hash.remove(&existing_hash);
                        }
                    }
                    if let Some(item) = self.items_by_id.get_mut(&existing_id) {
                        item.content = new.content;
                        item.content_hash = hash.clone();
                        item.item_type = new.item_type;
                        item.metadata.timestamp_last_updated = ids::now_iso();
                        merge_metadata(&mut item.metadata, new.metadata);
                    }
                    self.record_contribution(&existing_id, call_id.as_deref());
                    self.items_by_hash.entry(hash).or_default().push(existing_id.clone());
                    let token = self.ensure_token(&existing_id);
                    return Ok(AddOutcome {
                        status: AddStatus::UpdatedUriMatch,
                        item_id: existing_id,
                        token,
                    });
                }
            }
        }

        // 2. Hash match
        if let Some(candidate_ids) = self.items_by_hash.get(&hash).cloned() {
            for existing_id in candidate_ids {
                if !self.items_by_id.contains_key(&existing_id) {
                    continue;
                }
                if let Some(uri) = &new.source_uri {
                    let already_bound = self.items_by_uri.get(uri) == Some(&existing_id);
                    if !already_bound {
                        info!(uri, item_id = %existing_id, "hash match, associating new uri");
                        if let Some(item) = self.items_by_id.get_mut(&existing_id) {
                            item.source_uri = Some(uri.clone());
                        }
                        let _ = self.items_by_uri.insert(uri.clone(), existing_id.clone());
                        self.record_contribution(&existing_id, call_id.as_deref());
                        let token = self.ensure_token(&existing_id);
                        return Ok(AddOutcome {
                            status: AddStatus::EnrichedHashMatchWithUri,
                            item_id: existing_id,
                            token,
                        });
                    }
                } else {
                    debug!(item_id = %existing_id, "hash match without uri, deduplicating");
                    self.record_contribution(&existing_id, call_id.as_deref());
                    let token = self.ensure_token(&existing_id);
                    return Ok(AddOutcome {
                        status: AddStatus::DeduplicatedHashMatchNoUri,
                        item_id: existing_id,
                        token,
                    });
                }
            }
        }

        // 3. New item
        let item_id = new.id.unwrap_or_else(ids::kb_item_id);
        let token = self.generate_next_token();
        let now = ids::now_iso();

        let mut metadata = new.metadata;
        metadata.timestamp_added = now.clone();
        metadata.timestamp_last_updated = now;
        metadata.token = Some(token.clone());
        if let Some(call_id) = &call_id {
            if !metadata.contributing_tool_call_ids.iter().any(|c| c == call_id) {
                metadata.contributing_tool_call_ids.push(call_id.clone());
            }
        }

        let item = KnowledgeItem {
            id: item_id.clone(),
            item_type: new.item_type,
            source_uri: new.source_uri.clone(),
            content: new.content,
            content_hash: hash.clone(),
            metadata,
            run_id: self.run_id.clone(),
        };

        let _ = self.items_by_id.insert(item_id.clone(), item);
        let _ = self.items_by_token.insert(token.clone(), item_id.clone());
        if let Some(uri) = new.source_uri {
            let _ = self.items_by_uri.insert(uri, item_id.clone());
        }
        if let Some(call_id) = call_id {
            let _ = self.items_by_tool_call_id.insert(call_id, item_id.clone());
        }
        let bucket = self.items_by_hash.entry(hash).or_default();
        bucket.push(item_id.clone());
        bucket.sort();
        bucket.dedup();

        info!(item_id, token, "knowledge item added");
        Ok(AddOutcome {
            status: AddStatus::NewItemAdded,
            item_id,
            token,
        })
    }

    /// Store content directly and return its token. The cooperative
    /// dehydration entry point tools opt into.
    pub fn store_with_token(&mut self, content: Value, metadata: KnowledgeItemMetadata) -> String {
        let item_id = ids::kb_item_id();
        let token = self.generate_next_token();
        let now = ids::now_iso();

        let mut metadata = metadata;
        let item_type = metadata
            .extra
            .remove("item_type")
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| "TOKEN_DEHYDRATED_CONTENT".to_string());
        metadata.token = Some(token.clone());
        metadata.timestamp_added = now.clone();
        metadata.timestamp_last_updated = now;

        let hash = content_hash(&content);
        let item = KnowledgeItem {
            id: item_id.clone(),
            item_type,
            source_uri: None,
            content,
            content_hash: hash.clone(),
            metadata,
            run_id: self.run_id.clone(),
        };

        let _ = self.items_by_id.insert(item_id.clone(), item);
        let _ = self.items_by_token.insert(token.clone(), item_id.clone());
        self.items_by_hash.entry(hash).or_default().push(item_id.clone());

        info!(token, item_id, "content stored with token");
        token
    }

    /// Look up an item by URI.
    pub fn item_by_uri(&self, source_uri: &str) -> Option<&KnowledgeItem> {
        self.items_by_uri
            .get(source_uri)
            .and_then(|id| self.items_by_id.get(id))
    }

    /// Look up an item by token.
    pub fn item_by_token(&self, token: &str) -> Option<&KnowledgeItem> {
        self.items_by_token
            .get(token)
            .and_then(|id| self.items_by_id.get(id))
    }

    /// Store statistics for monitoring.
    pub fn stats(&self) -> Map<String, Value> {
        let total_size: usize = self
            .items_by_id
            .values()
            .map(|i| canonical_content_string(&i.content).len())
            .sum();
        let mut by_type: BTreeMap<String, u64> = BTreeMap::new();
        for item in self.items_by_id.values() {
            *by_type.entry(item.item_type.clone()).or_default() += 1;
        }
        let total_accesses: u64 = self.items_by_id.values().map(|i| i.metadata.access_count).sum();
        let mut out = Map::new();
        let _ = out.insert("total_items".into(), self.items_by_id.len().into());
        let _ = out.insert("total_size_bytes".into(), total_size.into());
        let _ = out.insert(
            "items_by_type".into(),
            serde_json::to_value(by_type).unwrap_or(Value::Null),
        );
        let _ = out.insert("total_accesses".into(), total_accesses.into());
        out
    }
}

fn merge_metadata(target: &mut KnowledgeItemMetadata, incoming: KnowledgeItemMetadata) {
    if incoming.source_tool_name.is_some() {
        target.source_tool_name = incoming.source_tool_name;
    }
    if incoming.tool_call_id.is_some() {
        target.tool_call_id = incoming.tool_call_id;
    }
    for (k, v) in incoming.extra {
        let _ = target.extra.insert(k, v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kb() -> KnowledgeBase {
        KnowledgeBase::new("run_test")
    }

    fn page(uri: &str, body: &str) -> NewItem {
        NewItem {
            item_type: "WEB_PAGE_CONTENT".into(),
            content: json!(body),
            source_uri: Some(uri.into()),
            metadata: KnowledgeItemMetadata {
                tool_call_id: Some("call_1".into()),
                ..KnowledgeItemMetadata::default()
            },
            id: None,
        }
    }

    #[test]
    fn tokens_are_monotonic_five_digit() {
        let mut kb = kb();
        assert_eq!(kb.generate_next_token(), "<#CGKB-00001>");
        assert_eq!(kb.generate_next_token(), "<#CGKB-00002>");
        assert_eq!(kb.next_sequence, 3);
    }

    #[test]
    fn add_then_add_same_is_idempotent_on_id() {
        let mut kb = kb();
        let first = kb.add_item(page("https://a", "body")).unwrap();
        assert_eq!(first.status, AddStatus::NewItemAdded);

        let mut second_input = page("https://a", "body");
        second_input.metadata.tool_call_id = Some("call_2".into());
        let second = kb.add_item(second_input).unwrap();
        assert_eq!(second.status, AddStatus::DeduplicatedUriHashMatch);
        assert_eq!(second.item_id, first.item_id);
        assert_eq!(second.token, first.token);

        let item = &kb.items_by_id[&first.item_id];
        assert_eq!(
            item.metadata.contributing_tool_call_ids,
            vec!["call_1".to_string(), "call_2".to_string()]
        );
    }

    #[test]
    fn uri_match_with_new_content_updates_in_place() {
        let mut kb = kb();
        let first = kb.add_item(page("https://a", "v1")).unwrap();
        let old_hash = kb.items_by_id[&first.item_id].content_hash.clone();

        let second = kb.add_item(page("https://a", "v2")).unwrap();
        assert_eq!(second.status, AddStatus::UpdatedUriMatch);
        assert_eq!(second.item_id, first.item_id);

        let item = &kb.items_by_id[&first.item_id];
        assert_eq!(item.content, json!("v2"));
        assert_ne!(item.content_hash, old_hash);
        assert!(!kb.items_by_hash.contains_key(&old_hash));
        assert!(kb.items_by_hash[&item.content_hash].contains(&first.item_id));
    }

    #[test]
    fn hash_match_attaches_new_uri() {
        let mut kb = kb();
        let first = kb.add_item(page("https://a", "same")).unwrap();
        let second = kb.add_item(page("https://b", "same")).unwrap();
        assert_eq!(second.status, AddStatus::EnrichedHashMatchWithUri);
        assert_eq!(second.item_id, first.item_id);
        assert_eq!(kb.items_by_uri["https://b"], first.item_id);
    }

    #[test]
    fn hash_match_without_uri_dedupes() {
        let mut kb = kb();
        let mut no_uri = page("https://a", "same");
        no_uri.source_uri = None;
        let first = kb.add_item(no_uri.clone()).unwrap();
        let second = kb.add_item(no_uri).unwrap();
        assert_eq!(second.status, AddStatus::DeduplicatedHashMatchNoUri);
        assert_eq!(second.item_id, first.item_id);
        assert_eq!(kb.items_by_id.len(), 1);
    }

    #[test]
    fn missing_fields_rejected() {
        let mut kb = kb();
        let bad = NewItem {
            item_type: String::new(),
            content: json!("x"),
            ..NewItem::default()
        };
        assert!(kb.add_item(bad).is_err());

        let bad = NewItem {
            item_type: "T".into(),
            content: Value::Null,
            ..NewItem::default()
        };
        assert!(kb.add_item(bad).is_err());
    }

    #[test]
    fn content_hash_invariant_holds() {
        let mut kb = kb();
        let _ = kb.add_item(page("https://a", "alpha")).unwrap();
        let _ = kb
            .add_item(NewItem {
                item_type: "T".into(),
                content: json!({"b": 2, "a": 1}),
                ..NewItem::default()
            })
            .unwrap();
        for item in kb.items_by_id.values() {
            assert_eq!(item.content_hash, content_hash(&item.content));
        }
    }

    #[test]
    fn canonical_json_sorts_keys() {
        let a = json!({"b": 2, "a": 1});
        let b = json!({"a": 1, "b": 2});
        assert_eq!(content_hash(&a), content_hash(&b));
        assert_eq!(canonical_content_string(&a), r#"{"a":1,"b":2}"#);
    }

    #[test]
    fn serde_roundtrip_preserves_indices_and_sequence() {
        let mut kb = kb();
        let _ = kb.add_item(page("https://a", "one")).unwrap();
        let _ = kb.store_with_token(json!("big payload"), KnowledgeItemMetadata::default());

        let v = serde_json::to_value(&kb).unwrap();
        assert_eq!(v["_next_sequence"], 3);
        let back: KnowledgeBase = serde_json::from_value(v).unwrap();
        assert_eq!(back.items_by_id, kb.items_by_id);
        assert_eq!(back.items_by_uri, kb.items_by_uri);
        assert_eq!(back.items_by_hash, kb.items_by_hash);
        assert_eq!(back.items_by_token, kb.items_by_token);
        assert_eq!(back.next_sequence, kb.next_sequence);
    }

    #[test]
    fn stats_counts_items_and_types() {
        let mut kb = kb();
        let _ = kb.add_item(page("https://a", "one")).unwrap();
        let _ = kb.add_item(page("https://b", "two")).unwrap();
        let stats = kb.stats();
        assert_eq!(stats["total_items"], json!(2));
        assert_eq!(stats["items_by_type"]["WEB_PAGE_CONTENT"], json!(2));
    }
}
