//! V-model path resolution: dotted lookups over namespaced JSON views of
//! the context.
//!
//! A path like `team.work_modules.WM_1.status` starts from a namespace
//! prefix (`state`, `meta`, `team`, `run`, `config`, `initial_params`,
//! `flags`, `principal`, `partner`) supplied by a [`ContextPaths`]
//! implementation, then traverses dot segments, numeric list indices
//! (negative allowed), and `[n]` suffixes. Matching is greedy: a key that
//! itself contains dots wins over segment-wise descent.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// The namespace used when a path carries no known prefix.
pub const DEFAULT_NAMESPACE: &str = "state";

/// Supplier of namespace roots for path resolution.
///
/// Implementations snapshot the relevant context subtree as a
/// `serde_json::Value`; resolution itself is pure.
pub trait ContextPaths {
    /// The root value for a namespace prefix, or `None` if the prefix is
    /// not part of this context's vocabulary.
    fn namespace(&self, prefix: &str) -> Option<Value>;

    /// Resolve a full dotted path. Unknown prefixes fall back to the
    /// default namespace with the whole path treated as relative.
    fn lookup(&self, path: &str) -> Option<Value> {
        if path.is_empty() {
            return None;
        }
        let (prefix, rest) = match path.split_once('.') {
            Some((p, r)) => (p, r),
            None => (path, ""),
        };
        if let Some(base) = self.namespace(prefix) {
            if rest.is_empty() {
                return Some(base);
            }
            return traverse(&base, &split_segments(rest));
        }
        let base = self.namespace(DEFAULT_NAMESPACE)?;
        traverse(&base, &split_segments(path))
    }
}

/// Split a path on dots, keeping `key[idx]` fragments together.
pub fn split_segments(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    for ch in path.chars() {
        match ch {
            '[' => {
                depth += 1;
                current.push(ch);
            }
            ']' => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            '.' if depth == 0 => {
                segments.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    segments.push(current);
    segments
}

fn index_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.*)\[(-?\d+)\]$").expect("static regex"))
}

fn array_index(list: &[Value], idx: i64) -> Option<&Value> {
    let len = list.len() as i64;
    let resolved = if idx < 0 { len + idx } else { idx };
    if resolved < 0 || resolved >= len {
        return None;
    }
    list.get(resolved as usize)
}

/// Traverse `keys` starting from `base`. Greedy: at each position, the
/// longest dotted join of remaining keys that exists as a literal map key
/// is consumed first.
pub fn traverse(base: &Value, keys: &[String]) -> Option<Value> {
    let mut value = base.clone();
    let mut i = 0;
    while i < keys.len() {
        if value.is_null() {
            return None;
        }

        // Greedy compound-key match, longest first
        let mut matched = false;
        if let Value::Object(map) = &value {
            for j in (i + 1..=keys.len()).rev() {
                let candidate = keys[i..j].join(".");
                if let Some(v) = map.get(&candidate) {
                    value = v.clone();
                    i = j;
                    matched = true;
                    break;
                }
            }
        }
        if matched {
            continue;
        }

        let key = &keys[i];
        if let Some(caps) = index_regex().captures(key) {
            let key_part = caps.get(1).map_or("", |m| m.as_str());
            let idx: i64 = caps[2].parse().ok()?;
            let list_value = if key_part.is_empty() {
                value.clone()
            } else {
                value.get(key_part)?.clone()
            };
            let list = list_value.as_array()?;
            value = array_index(list, idx)?.clone();
        } else {
            match &value {
                Value::Object(map) => {
                    value = map.get(key)?.clone();
                }
                Value::Array(list) => {
                    let idx: i64 = key.parse().ok()?;
                    value = array_index(list, idx)?.clone();
                }
                _ => return None,
            }
        }
        i += 1;
    }
    Some(value)
}

fn template_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_\.\[\]\-]+)\s*\}\}").expect("static regex"))
}

/// Render a resolved value for text interpolation: strings raw, null empty,
/// everything else compact JSON.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Interpolate `{{ path }}` placeholders against a context. Unresolvable
/// placeholders are left as-is so the gap stays visible downstream.
pub fn interpolate(text: &str, ctx: &dyn ContextPaths) -> String {
    if !text.contains("{{") {
        return text.to_string();
    }
    template_regex()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let path = &caps[1];
            match ctx.lookup(path) {
                Some(value) => display_value(&value),
                None => {
                    tracing::debug!(path, "template placeholder did not resolve");
                    caps[0].to_string()
                }
            }
        })
        .into_owned()
}

/// A [`ContextPaths`] over a flat map of namespace → value. Used by tests
/// and by the handover service's synthetic source contexts.
#[derive(Clone, Debug, Default)]
pub struct MapPaths {
    namespaces: serde_json::Map<String, Value>,
}

impl MapPaths {
    /// Empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a namespace root.
    pub fn with(mut self, prefix: impl Into<String>, value: Value) -> Self {
        let _ = self.namespaces.insert(prefix.into(), value);
        self
    }
}

impl ContextPaths for MapPaths {
    fn namespace(&self, prefix: &str) -> Option<Value> {
        self.namespaces.get(prefix).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> MapPaths {
        MapPaths::new()
            .with(
                "state",
                json!({
                    "flags": {"ready": true},
                    "items": [10, 20, 30],
                    "dotted.key": {"inner": "found"},
                    "current_action": {"tool_name": "echo"},
                }),
            )
            .with("team", json!({"question": "why?", "turns": [{"turn_id": "t1"}, {"turn_id": "t2"}]}))
    }

    #[test]
    fn prefixed_lookup() {
        assert_eq!(ctx().lookup("team.question").unwrap(), json!("why?"));
    }

    #[test]
    fn default_namespace_fallback() {
        // No known prefix: resolves against state
        assert_eq!(ctx().lookup("flags.ready").unwrap(), json!(true));
        assert_eq!(ctx().lookup("current_action.tool_name").unwrap(), json!("echo"));
    }

    #[test]
    fn bare_prefix_returns_namespace_root() {
        let v = ctx().lookup("team").unwrap();
        assert_eq!(v["question"], "why?");
    }

    #[test]
    fn numeric_and_bracket_indices() {
        let c = ctx();
        assert_eq!(c.lookup("state.items.1").unwrap(), json!(20));
        assert_eq!(c.lookup("state.items[-1]").unwrap(), json!(30));
        assert_eq!(c.lookup("team.turns[0].turn_id").unwrap(), json!("t1"));
        assert_eq!(c.lookup("team.turns[-1].turn_id").unwrap(), json!("t2"));
    }

    #[test]
    fn out_of_bounds_is_none() {
        let c = ctx();
        assert!(c.lookup("state.items[3]").is_none());
        assert!(c.lookup("state.items[-4]").is_none());
    }

    #[test]
    fn greedy_dotted_key_match() {
        assert_eq!(ctx().lookup("state.dotted.key.inner").unwrap(), json!("found"));
    }

    #[test]
    fn missing_path_is_none() {
        assert!(ctx().lookup("state.nope.deeper").is_none());
        assert!(ctx().lookup("").is_none());
    }

    #[test]
    fn split_keeps_bracketed_dots_together() {
        assert_eq!(split_segments("a.b[0].c"), vec!["a", "b[0]", "c"]);
        assert_eq!(split_segments("a"), vec!["a"]);
    }

    #[test]
    fn interpolation_renders_and_preserves_unresolved() {
        let c = ctx();
        let out = interpolate("q={{ team.question }}, missing={{ team.nope }}", &c);
        assert_eq!(out, "q=why?, missing={{ team.nope }}");
    }

    #[test]
    fn interpolation_renders_non_strings_as_json() {
        let c = ctx();
        assert_eq!(interpolate("n={{ state.items[0] }}", &c), "n=10");
        assert_eq!(interpolate("b={{ state.flags.ready }}", &c), "b=true");
    }

    #[test]
    fn no_braces_short_circuits() {
        let c = ctx();
        assert_eq!(interpolate("plain text", &c), "plain text");
    }

    proptest::proptest! {
        #[test]
        fn split_segments_rejoins_bracket_free_paths(parts in proptest::collection::vec("[a-z_][a-z0-9_]{0,8}", 1..6)) {
            let path = parts.join(".");
            proptest::prop_assert_eq!(split_segments(&path), parts);
        }
    }
}
