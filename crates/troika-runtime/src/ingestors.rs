//! Ingestors: pure renderers turning inbox payloads into prompt text.
//!
//! Lookup is two-level: a profile's `inbox_handling_strategies` override
//! first, then the global strategy table, else the markdown formatter
//! fallback. Each strategy names an ingestor, an injection mode, a target
//! role, and whether the rendered message persists into history.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use troika_core::inbox::source;
use troika_core::messages::Role;
use troika_core::paths::{display_value, interpolate};
use troika_profiles::{AgentProfile, InjectionMode};

use crate::context::{ContextView, RunContext, SubContext};

/// Ingestor failure; converted to an in-band system error message by the
/// inbox processor, never fatal.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct IngestorError(pub String);

/// Rendering context handed to every ingestor.
pub struct IngestorCtx<'a> {
    /// The owning run.
    pub run: &'a Arc<RunContext>,
    /// The ingesting agent.
    pub sub: &'a Arc<SubContext>,
    /// The agent's profile (for text definitions).
    pub profile: &'a Arc<AgentProfile>,
}

impl IngestorCtx<'_> {
    /// A path view over the agent's context.
    pub fn paths(&self) -> ContextView {
        ContextView::new(self.sub)
    }
}

/// A pure payload renderer.
pub trait Ingestor: Send + Sync {
    /// Registry name.
    fn name(&self) -> &'static str;
    /// Render the payload to prompt text.
    fn ingest(&self, payload: &Value, params: &Map<String, Value>, ctx: &IngestorCtx<'_>)
    -> Result<String, IngestorError>;
}

/// How a source is handled: which ingestor, how the text is injected,
/// which role speaks it, and whether it persists into history.
#[derive(Clone, Debug)]
pub struct EventStrategy {
    /// Ingestor name.
    pub ingestor: String,
    /// Injection mode.
    pub injection_mode: InjectionMode,
    /// Extra params (role, titles, renames, wrapper tags...).
    pub params: Map<String, Value>,
}

impl EventStrategy {
    fn new(ingestor: &str, injection_mode: InjectionMode, params: Value) -> Self {
        Self {
            ingestor: ingestor.to_string(),
            injection_mode,
            params: params.as_object().cloned().unwrap_or_default(),
        }
    }

    /// The role the rendered message speaks as (default user).
    pub fn role(&self) -> Role {
        match self.params.get("role").and_then(Value::as_str) {
            Some("system") => Role::System,
            Some("assistant") => Role::Assistant,
            Some("tool") => Role::Tool,
            _ => Role::User,
        }
    }

    /// Whether the rendered message is appended to persistent history.
    pub fn persistent(&self) -> bool {
        self.params
            .get("is_persistent_in_memory")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// The global strategy for a source, if one is registered.
pub fn global_strategy_for(src: &str) -> Option<EventStrategy> {
    use serde_json::json;
    let strategy = match src {
        source::TOOL_RESULT => EventStrategy::new(
            "tool_result",
            InjectionMode::AppendAsNewMessage,
            json!({"role": "tool", "is_persistent_in_memory": true}),
        ),
        source::AGENT_STARTUP_BRIEFING => EventStrategy::new(
            "protocol_aware",
            InjectionMode::AppendAsNewMessage,
            json!({"role": "user", "is_persistent_in_memory": true}),
        ),
        source::SELF_REFLECTION_PROMPT => EventStrategy::new(
            "templated_content",
            InjectionMode::PrependToRole,
            json!({"role": "user"}),
        ),
        source::INTERNAL_DIRECTIVE => EventStrategy::new(
            "templated_content",
            InjectionMode::AppendAsNewMessage,
            json!({"role": "user", "is_persistent_in_memory": true}),
        ),
        source::PARTNER_DIRECTIVE => EventStrategy::new(
            "markdown_formatter",
            InjectionMode::AppendAsNewMessage,
            json!({
                "role": "user",
                "is_persistent_in_memory": true,
                "title": "### Directive from Partner",
                "key_renames": {"content": "Instruction"},
            }),
        ),
        source::PRINCIPAL_COMPLETED => EventStrategy::new(
            "generic_message",
            InjectionMode::AppendAsNewMessage,
            json!({"role": "user", "is_persistent_in_memory": true}),
        ),
        source::WORK_MODULES_STATUS_UPDATE => EventStrategy::new(
            "work_modules",
            InjectionMode::AppendAsNewMessage,
            json!({"role": "user", "is_persistent_in_memory": false}),
        ),
        source::PRINCIPAL_ACTIVITY_UPDATE => EventStrategy::new(
            "principal_history_summary",
            InjectionMode::AppendAsNewMessage,
            json!({"role": "user", "is_persistent_in_memory": false}),
        ),
        source::OBSERVER_FAILURE => EventStrategy::new(
            "observer_failure",
            InjectionMode::AppendAsNewMessage,
            json!({"role": "system", "is_persistent_in_memory": false}),
        ),
        source::USER_PROMPT => EventStrategy::new(
            "user_prompt",
            InjectionMode::AppendAsNewMessage,
            json!({"role": "user", "is_persistent_in_memory": true}),
        ),
        _ => return None,
    };
    Some(strategy)
}

/// The fallback strategy for unregistered sources.
pub fn fallback_strategy() -> EventStrategy {
    EventStrategy::new(
        "markdown_formatter",
        InjectionMode::AppendAsNewMessage,
        serde_json::json!({"role": "user"}),
    )
}

/// String-keyed registry of ingestors.
pub struct IngestorRegistry {
    map: BTreeMap<&'static str, Arc<dyn Ingestor>>,
}

impl IngestorRegistry {
    /// Registry with the full built-in set.
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            map: BTreeMap::new(),
        };
        registry.register(Arc::new(TemplatedContent));
        registry.register(Arc::new(GenericMessage));
        registry.register(Arc::new(ToolResultIngestor));
        registry.register(Arc::new(MarkdownFormatter));
        registry.register(Arc::new(WorkModules));
        registry.register(Arc::new(AvailableAssociates));
        registry.register(Arc::new(PrincipalHistorySummary));
        registry.register(Arc::new(JsonHistory));
        registry.register(Arc::new(TaggedContent));
        registry.register(Arc::new(ObserverFailure));
        registry.register(Arc::new(UserPrompt));
        registry.register(Arc::new(DispatchResult));
        registry.register(Arc::new(ProtocolAware));
        registry
    }

    /// Register (or replace) an ingestor.
    pub fn register(&mut self, ingestor: Arc<dyn Ingestor>) {
        if self.map.insert(ingestor.name(), ingestor).is_some() {
            warn!("ingestor overridden in registry");
        }
    }

    /// Look up by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Ingestor>> {
        self.map.get(name).cloned()
    }
}

impl Default for IngestorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Built-in ingestors
// ─────────────────────────────────────────────────────────────────────────────

struct TemplatedContent;

impl Ingestor for TemplatedContent {
    fn name(&self) -> &'static str {
        "templated_content"
    }

    fn ingest(
        &self,
        payload: &Value,
        params: &Map<String, Value>,
        ctx: &IngestorCtx<'_>,
    ) -> Result<String, IngestorError> {
        let content_key = payload
            .get("content_key")
            .and_then(Value::as_str)
            .ok_or_else(|| IngestorError("templated_content payload missing 'content_key'".into()))?;
        let template = ctx
            .profile
            .text_definitions
            .get(content_key)
            .ok_or_else(|| IngestorError(format!("template '{content_key}' not found in profile")))?;
        let rendered = interpolate(template, &ctx.paths());
        Ok(apply_wrapper_tags(rendered, params))
    }
}

struct GenericMessage;

impl Ingestor for GenericMessage {
    fn name(&self) -> &'static str {
        "generic_message"
    }

    fn ingest(
        &self,
        payload: &Value,
        params: &Map<String, Value>,
        _ctx: &IngestorCtx<'_>,
    ) -> Result<String, IngestorError> {
        let mut template = params
            .get("content_template")
            .and_then(Value::as_str)
            .unwrap_or("{{ payload }}")
            .to_string();
        if let Value::Object(map) = payload {
            for (key, value) in map {
                template = template.replace(&format!("{{{{ payload.{key} }}}}"), &display_value(value));
            }
        }
        Ok(template.replace("{{ payload }}", &display_value(payload)))
    }
}

struct ToolResultIngestor;

impl Ingestor for ToolResultIngestor {
    fn name(&self) -> &'static str {
        "tool_result"
    }

    fn ingest(
        &self,
        payload: &Value,
        params: &Map<String, Value>,
        ctx: &IngestorCtx<'_>,
    ) -> Result<String, IngestorError> {
        let Some(map) = payload.as_object() else {
            return Ok(display_value(payload));
        };
        let tool_name = map.get("tool_name").and_then(Value::as_str).unwrap_or("");
        let content = map.get("content").cloned().unwrap_or(Value::Null);
        let is_error = map.get("is_error").and_then(Value::as_bool).unwrap_or(false);

        // A string content is a dehydrated token (or plain text): return
        // it verbatim for the hydration pass.
        if let Value::String(s) = &content {
            return Ok(s.clone());
        }

        if is_error {
            let report = serde_json::json!({
                "tool_execution_failed": true,
                "tool_name": tool_name,
                "error_payload": content,
            });
            return Ok(serde_json::to_string_pretty(&report).unwrap_or_else(|_| report.to_string()));
        }

        if tool_name == "dispatch_submodules" {
            return DispatchResult.ingest(payload, params, ctx);
        }

        match &content {
            Value::Object(obj) if obj.contains_key("main_content_for_llm") => {
                let main = &obj["main_content_for_llm"];
                Ok(serde_json::to_string_pretty(main).unwrap_or_else(|_| main.to_string()))
            }
            Value::Object(_) | Value::Array(_) => {
                Ok(serde_json::to_string_pretty(&content).unwrap_or_else(|_| content.to_string()))
            }
            other => Ok(display_value(other)),
        }
    }
}

struct MarkdownFormatter;

impl Ingestor for MarkdownFormatter {
    fn name(&self) -> &'static str {
        "markdown_formatter"
    }

    fn ingest(
        &self,
        payload: &Value,
        params: &Map<String, Value>,
        _ctx: &IngestorCtx<'_>,
    ) -> Result<String, IngestorError> {
        let Some(map) = payload.as_object() else {
            return Ok(display_value(payload));
        };
        let title = params
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("### Contextual Information");
        let renames = params.get("key_renames").and_then(Value::as_object);
        let excluded: Vec<&str> = params
            .get("exclude_keys")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let mut lines = vec![title.to_string()];
        for (key, value) in map {
            if excluded.contains(&key.as_str()) {
                continue;
            }
            let display_key = renames
                .and_then(|r| r.get(key))
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| title_case(key));
            lines.push(format!("*   **{display_key}**: {}", display_value(value)));
        }
        Ok(lines.join("\n"))
    }
}

struct WorkModules;

impl Ingestor for WorkModules {
    fn name(&self) -> &'static str {
        "work_modules"
    }

    fn ingest(
        &self,
        payload: &Value,
        params: &Map<String, Value>,
        _ctx: &IngestorCtx<'_>,
    ) -> Result<String, IngestorError> {
        let Some(modules) = payload.as_object() else {
            return Ok("Work modules data is not in the expected format.".to_string());
        };
        let title = params
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("### Current Work Modules Status");
        let mut lines = vec![title.to_string()];
        if modules.is_empty() {
            lines.push("No work modules are currently defined.".to_string());
            return Ok(lines.join("\n"));
        }
        for (module_id, module) in modules {
            let name = module.get("name").and_then(Value::as_str).unwrap_or("Unnamed Module");
            let status = module.get("status").and_then(Value::as_str).unwrap_or("unknown");
            let description = module
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("No description provided.");
            lines.push(format!("- **{name}** (ID: `{module_id}`, Status: `{status}`)"));
            lines.push(format!("  - **Description**: {description}"));
        }
        Ok(lines.join("\n"))
    }
}

struct AvailableAssociates;

impl Ingestor for AvailableAssociates {
    fn name(&self) -> &'static str {
        "available_associates"
    }

    fn ingest(
        &self,
        payload: &Value,
        params: &Map<String, Value>,
        ctx: &IngestorCtx<'_>,
    ) -> Result<String, IngestorError> {
        let Some(instance_ids) = payload.as_array() else {
            return Ok("Available associates list is not in the expected format.".to_string());
        };
        let title = params
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("### Available Associate Agent Profiles for Team Configuration");
        let mut lines = vec![title.to_string()];

        let mut found: Vec<_> = instance_ids
            .iter()
            .filter_map(Value::as_str)
            .filter_map(|id| ctx.run.config.profiles.by_instance_id(id))
            .filter(|p| {
                p.is_active && p.profile_type == troika_profiles::ProfileType::Associate
            })
            .collect();
        if found.is_empty() {
            lines.push("No 'associate' type profiles are currently available.".to_string());
            return Ok(lines.join("\n"));
        }
        found.sort_by(|a, b| a.name.cmp(&b.name));

        for profile in found {
            lines.push(format!("\n#### Profile Name: `{}`", profile.name));
            lines.push(format!(
                "   Description: {}",
                profile
                    .description_for_human
                    .as_deref()
                    .unwrap_or("No description available.")
            ));
            let toolsets = &profile.tool_access_policy.allowed_toolsets;
            if toolsets.is_empty() {
                lines.push("   **Key Toolsets**: None specified.".to_string());
            } else {
                let list: Vec<String> = toolsets.iter().map(|t| format!("`{t}`")).collect();
                lines.push(format!("   **Key Toolsets**: {}", list.join(", ")));
            }
        }
        Ok(lines.join("\n"))
    }
}

struct PrincipalHistorySummary;

impl Ingestor for PrincipalHistorySummary {
    fn name(&self) -> &'static str {
        "principal_history_summary"
    }

    fn ingest(
        &self,
        payload: &Value,
        params: &Map<String, Value>,
        _ctx: &IngestorCtx<'_>,
    ) -> Result<String, IngestorError> {
        let Some(messages) = payload.as_array().filter(|a| !a.is_empty()) else {
            return Ok(
                "<principal_activity_log>\nPrincipal has no recorded activity yet.\n</principal_activity_log>"
                    .to_string(),
            );
        };
        let max_messages = params
            .get("max_messages")
            .and_then(Value::as_u64)
            .unwrap_or(10) as usize;
        let start = messages.len().saturating_sub(max_messages);

        let mut parts = vec!["<principal_activity_log>".to_string()];
        for msg in &messages[start..] {
            let role = msg
                .get("role")
                .and_then(Value::as_str)
                .unwrap_or("unknown_role")
                .to_uppercase();
            let content = msg.get("content").map(display_value).unwrap_or_default();
            let summary: String = content.chars().take(200).collect();
            let ellipsis = if content.chars().count() > 200 { "..." } else { "" };
            let mut entry = format!("\n- **[{role}]**: {summary}{ellipsis}");

            if let Some(calls) = msg.get("tool_calls").and_then(Value::as_array) {
                let rendered: Vec<String> = calls
                    .iter()
                    .map(|tc| {
                        let name = tc
                            .pointer("/function/name")
                            .and_then(Value::as_str)
                            .unwrap_or("N/A");
                        let args = tc
                            .pointer("/function/arguments")
                            .and_then(Value::as_str)
                            .unwrap_or("{}");
                        let args_summary: String = args.chars().take(70).collect();
                        let more = if args.chars().count() > 70 { "..." } else { "" };
                        format!("{name}({args_summary}{more})")
                    })
                    .collect();
                if !rendered.is_empty() {
                    entry.push_str(&format!(" -> Calls: [{}]", rendered.join(", ")));
                }
            }
            parts.push(entry);
        }
        if messages.len() > max_messages {
            parts.push(format!(
                "\n... (omitting {} older messages)",
                messages.len() - max_messages
            ));
        }
        parts.push("\n</principal_activity_log>".to_string());
        Ok(parts.join("\n"))
    }
}

struct JsonHistory;

impl Ingestor for JsonHistory {
    fn name(&self) -> &'static str {
        "json_history"
    }

    fn ingest(
        &self,
        payload: &Value,
        _params: &Map<String, Value>,
        _ctx: &IngestorCtx<'_>,
    ) -> Result<String, IngestorError> {
        if !payload.is_array() {
            return Err(IngestorError("message history for JSON ingestion was not a list".into()));
        }
        let rendered = serde_json::to_string_pretty(payload)
            .map_err(|e| IngestorError(format!("failed to serialize message history: {e}")))?;
        Ok(format!("<message_history_json>\n{rendered}\n</message_history_json>"))
    }
}

struct TaggedContent;

impl Ingestor for TaggedContent {
    fn name(&self) -> &'static str {
        "tagged_content"
    }

    fn ingest(
        &self,
        payload: &Value,
        params: &Map<String, Value>,
        _ctx: &IngestorCtx<'_>,
    ) -> Result<String, IngestorError> {
        let content = display_value(payload);
        let wrapped = apply_wrapper_tags(content, params);
        Ok(wrapped)
    }
}

struct ObserverFailure;

impl Ingestor for ObserverFailure {
    fn name(&self) -> &'static str {
        "observer_failure"
    }

    fn ingest(
        &self,
        payload: &Value,
        _params: &Map<String, Value>,
        _ctx: &IngestorCtx<'_>,
    ) -> Result<String, IngestorError> {
        let observer_id = payload
            .get("failed_observer_id")
            .and_then(Value::as_str)
            .unwrap_or("unknown_observer");
        let error_message = payload
            .get("error_message")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error");
        Ok(system_error_block(
            "internal_observer",
            &format!(
                "A critical internal error occurred while I was observing the state to generate \
                 context. My internal rule (Observer ID: '{observer_id}') failed to execute."
            ),
            error_message,
        ))
    }
}

struct UserPrompt;

impl Ingestor for UserPrompt {
    fn name(&self) -> &'static str {
        "user_prompt"
    }

    fn ingest(
        &self,
        payload: &Value,
        _params: &Map<String, Value>,
        _ctx: &IngestorCtx<'_>,
    ) -> Result<String, IngestorError> {
        match payload.get("prompt") {
            Some(prompt) => Ok(display_value(prompt)),
            None => Ok(display_value(payload)),
        }
    }
}

struct DispatchResult;

impl Ingestor for DispatchResult {
    fn name(&self) -> &'static str {
        "dispatch_result"
    }

    fn ingest(
        &self,
        payload: &Value,
        _params: &Map<String, Value>,
        _ctx: &IngestorCtx<'_>,
    ) -> Result<String, IngestorError> {
        let Some(content) = payload.get("content").and_then(Value::as_object) else {
            return Err(IngestorError("dispatch result format is invalid or content missing".into()));
        };

        let status = content.get("status").and_then(Value::as_str).unwrap_or("UNKNOWN");
        let message = content.get("message").and_then(Value::as_str).unwrap_or("No message.");
        let mut parts = vec![
            "**Dispatch Operation Summary**".to_string(),
            format!("- **Overall Status**: `{status}`"),
            format!("- **Details**: {message}"),
        ];

        if let Some(failed) = content
            .get("failed_preparation_details")
            .and_then(Value::as_array)
            .filter(|a| !a.is_empty())
        {
            parts.push("\n**Assignments Failed Before Execution:**".to_string());
            for failure in failed {
                let module_id = failure
                    .pointer("/input/module_id_to_assign")
                    .and_then(Value::as_str)
                    .unwrap_or("N/A");
                let reason = failure
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown reason.");
                parts.push(format!("- **Module `{module_id}`**: Failed pre-check. Reason: {reason}"));
            }
        }

        if let Some(results) = content
            .get("assignment_execution_results")
            .and_then(Value::as_array)
            .filter(|a| !a.is_empty())
        {
            parts.push("\n**Executed Modules - Detailed Work Records:**".to_string());
            for result in results {
                let module_id = result.get("module_id").and_then(Value::as_str).unwrap_or("N/A");
                let exec_status = result
                    .get("execution_status")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                parts.push(format!(
                    "\n--- Start of Record for Module `{module_id}` (Status: `{exec_status}`) ---"
                ));

                let deliverables = result.get("deliverables");
                match deliverables {
                    Some(d) if d.get("primary_summary").is_some() => {
                        parts.push("#### Final Deliverable (Summary from Associate):".to_string());
                        parts.push(format!(
                            "```json\n{}\n```",
                            serde_json::to_string_pretty(d).unwrap_or_else(|_| d.to_string())
                        ));
                    }
                    _ => parts.push("#### Final Deliverable: None provided.".to_string()),
                }

                if let Some(messages) = result
                    .get("new_messages_from_associate")
                    .and_then(Value::as_array)
                    .filter(|a| !a.is_empty())
                {
                    parts.push("\n#### Full Work Log from Associate:".to_string());
                    for msg in messages {
                        let role = msg
                            .get("role")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown")
                            .to_uppercase();
                        if let Some(calls) = msg.get("tool_calls").filter(|c| !c.is_null()) {
                            parts.push(format!("**[{role} -> TOOL_CALL]**:"));
                            parts.push(format!(
                                "```json\n{}\n```",
                                serde_json::to_string_pretty(calls).unwrap_or_else(|_| calls.to_string())
                            ));
                        } else if let Some(text) =
                            msg.get("content").and_then(Value::as_str).filter(|s| !s.trim().is_empty())
                        {
                            parts.push(format!("**[{role}]**: {}", text.trim()));
                        }
                    }
                }
                parts.push(format!("--- End of Record for Module `{module_id}` ---\n"));
            }
        }
        Ok(parts.join("\n"))
    }
}

struct ProtocolAware;

impl Ingestor for ProtocolAware {
    fn name(&self) -> &'static str {
        "protocol_aware"
    }

    fn ingest(
        &self,
        payload: &Value,
        _params: &Map<String, Value>,
        _ctx: &IngestorCtx<'_>,
    ) -> Result<String, IngestorError> {
        let (Some(data), Some(schema)) = (payload.get("data"), payload.get("schema_for_rendering"))
        else {
            return Err(IngestorError("malformed handover payload".into()));
        };
        let title = schema
            .get("x-handover-title")
            .and_then(Value::as_str)
            .unwrap_or("Agent Briefing");
        let mut lines = vec![format!("## {title}")];
        lines.extend(recursive_markdown(data, schema, 0));
        Ok(lines.join("\n"))
    }
}

/// Schema-guided recursive markdown rendering; falls back to data-driven
/// rendering where the schema runs out.
fn recursive_markdown(data: &Value, schema: &Value, level: usize) -> Vec<String> {
    let indent = "  ".repeat(level);
    let mut lines = Vec::new();

    if let (Some(props), Some(obj)) = (
        schema.get("properties").and_then(Value::as_object),
        data.as_object(),
    ) {
        for (prop_name, prop_schema) in props {
            if let Some(value) = obj.get(prop_name) {
                let title = prop_schema
                    .get("x-handover-title")
                    .and_then(Value::as_str)
                    .map(String::from)
                    .unwrap_or_else(|| title_case(prop_name));
                lines.push(format!("{indent}* **{title}:**"));
                lines.extend(recursive_markdown(value, prop_schema, level + 1));
            }
        }
        return lines;
    }

    match data {
        Value::Object(map) => {
            for (key, value) in map {
                lines.push(format!("{indent}* **{}:**", title_case(key)));
                lines.extend(recursive_markdown(value, &Value::Null, level + 1));
            }
        }
        Value::Array(items) => {
            let item_schema = schema.get("items").cloned().unwrap_or(Value::Null);
            for item in items {
                lines.extend(recursive_markdown(item, &item_schema, level));
            }
        }
        Value::String(s) => {
            for line in s.trim().split('\n') {
                lines.push(format!("{indent}  {line}"));
            }
        }
        other => lines.push(format!("{indent}  {}", display_value(other))),
    }
    lines
}

/// The in-band system error advisory: tells the agent to warn the user
/// and continue, never to stop.
pub fn system_error_block(context_source: &str, summary: &str, reason: &str) -> String {
    format!(
        "<system_error context_source='{context_source}'>\n\
         \x20 <error_details>\n\
         \x20   <summary>{summary}</summary>\n\
         \x20   <reason>{reason}</reason>\n\
         \x20 </error_details>\n\
         \x20 <instruction>\n\
         \x20   **Action Required: You MUST inform the user about this internal error.**\n\
         \x20   1.  First, formulate your primary response to the user based on the rest of the available, uncorrupted context.\n\
         \x20   2.  Then, at the end of your response, you MUST append a notification to the user about this issue.\n\
         \x20   3.  You MUST NOT stop your work. Continue the task to the best of your ability with the remaining information.\n\
         \x20 </instruction>\n\
         </system_error>"
    )
}

fn title_case(key: &str) -> String {
    key.split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn apply_wrapper_tags(content: String, params: &Map<String, Value>) -> String {
    if let Some(tags) = params.get("wrapper_tags").and_then(Value::as_array) {
        if tags.len() == 2 {
            if let (Some(open), Some(close)) = (tags[0].as_str(), tags[1].as_str()) {
                return format!("{open}{content}{close}");
            }
        }
    }
    content
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use serde_json::json;

    fn with_ctx<F: FnOnce(&IngestorCtx<'_>)>(f: F) {
        let (run, partner) = testutil::partner_run("q");
        let profile = testutil::partner_profile();
        let ctx = IngestorCtx {
            run: &run,
            sub: &partner,
            profile: &profile,
        };
        f(&ctx);
    }

    #[test]
    fn strategy_lookup_covers_known_sources() {
        let s = global_strategy_for(source::TOOL_RESULT).unwrap();
        assert_eq!(s.ingestor, "tool_result");
        assert_eq!(s.role(), Role::Tool);
        assert!(s.persistent());

        let s = global_strategy_for(source::OBSERVER_FAILURE).unwrap();
        assert_eq!(s.role(), Role::System);
        assert!(!s.persistent());

        assert!(global_strategy_for("NOT_A_SOURCE").is_none());
        assert_eq!(fallback_strategy().ingestor, "markdown_formatter");
    }

    #[test]
    fn tool_result_renders_error_report() {
        with_ctx(|ctx| {
            let rendered = ToolResultIngestor
                .ingest(
                    &json!({
                        "tool_name": "web_search",
                        "is_error": true,
                        "content": {"error_message": "rate limited"},
                    }),
                    &Map::new(),
                    ctx,
                )
                .unwrap();
            assert!(rendered.contains("tool_execution_failed"));
            assert!(rendered.contains("rate limited"));
        });
    }

    #[test]
    fn tool_result_passes_tokens_through() {
        with_ctx(|ctx| {
            let rendered = ToolResultIngestor
                .ingest(
                    &json!({"tool_name": "web_search", "content": "<#CGKB-00001>"}),
                    &Map::new(),
                    ctx,
                )
                .unwrap();
            assert_eq!(rendered, "<#CGKB-00001>");
        });
    }

    #[test]
    fn tool_result_prefers_main_content() {
        with_ctx(|ctx| {
            let rendered = ToolResultIngestor
                .ingest(
                    &json!({
                        "tool_name": "t",
                        "content": {"main_content_for_llm": {"answer": 42}, "raw": "huge"},
                    }),
                    &Map::new(),
                    ctx,
                )
                .unwrap();
            assert!(rendered.contains("42"));
            assert!(!rendered.contains("huge"));
        });
    }

    #[test]
    fn markdown_formatter_applies_renames_and_excludes() {
        with_ctx(|ctx| {
            let mut params = Map::new();
            let _ = params.insert("title".into(), json!("### Directive"));
            let _ = params.insert("key_renames".into(), json!({"content": "Instruction"}));
            let _ = params.insert("exclude_keys".into(), json!(["internal"]));

            let rendered = MarkdownFormatter
                .ingest(
                    &json!({"content": "do the thing", "internal": "hidden"}),
                    &params,
                    ctx,
                )
                .unwrap();
            assert!(rendered.starts_with("### Directive"));
            assert!(rendered.contains("**Instruction**: do the thing"));
            assert!(!rendered.contains("hidden"));
        });
    }

    #[test]
    fn work_modules_renders_status_lines() {
        with_ctx(|ctx| {
            let rendered = WorkModules
                .ingest(
                    &json!({
                        "WM_1": {"name": "Research", "status": "pending", "description": "dig in"},
                    }),
                    &Map::new(),
                    ctx,
                )
                .unwrap();
            assert!(rendered.contains("**Research** (ID: `WM_1`, Status: `pending`)"));
        });
    }

    #[test]
    fn templated_content_interpolates_paths() {
        with_ctx(|ctx| {
            let rendered = TemplatedContent
                .ingest(&json!({"content_key": "reflect"}), &Map::new(), ctx)
                .unwrap();
            // The partner test profile defines: "Reflect on {{ team.question }}"
            assert_eq!(rendered, "Reflect on q");
        });
    }

    #[test]
    fn templated_content_missing_key_errors() {
        with_ctx(|ctx| {
            let err = TemplatedContent
                .ingest(&json!({"content_key": "missing"}), &Map::new(), ctx)
                .unwrap_err();
            assert!(err.0.contains("missing"));
        });
    }

    #[test]
    fn protocol_aware_renders_schema_titles() {
        with_ctx(|ctx| {
            let rendered = ProtocolAware
                .ingest(
                    &json!({
                        "data": {"module": {"name": "Research"}, "instructions": "go deep"},
                        "schema_for_rendering": {
                            "type": "object",
                            "x-handover-title": "Your Assignment",
                            "properties": {
                                "module": {"x-handover-title": "Work Module"},
                                "instructions": {"x-handover-title": "Instructions"},
                            }
                        }
                    }),
                    &Map::new(),
                    ctx,
                )
                .unwrap();
            assert!(rendered.starts_with("## Your Assignment"));
            assert!(rendered.contains("* **Work Module:**"));
            assert!(rendered.contains("* **Instructions:**"));
            assert!(rendered.contains("go deep"));
        });
    }

    #[test]
    fn generic_message_substitutes_payload_fields() {
        with_ctx(|ctx| {
            let mut params = Map::new();
            let _ = params.insert(
                "content_template".into(),
                json!("Principal finished with status {{ payload.status }}"),
            );
            let rendered = GenericMessage
                .ingest(&json!({"status": "COMPLETED"}), &params, ctx)
                .unwrap();
            assert_eq!(rendered, "Principal finished with status COMPLETED");
        });
    }

    #[test]
    fn user_prompt_extracts_prompt_field() {
        with_ctx(|ctx| {
            let rendered = UserPrompt
                .ingest(&json!({"prompt": "echo hello"}), &Map::new(), ctx)
                .unwrap();
            assert_eq!(rendered, "echo hello");
        });
    }

    #[test]
    fn dispatch_result_summarizes_mixed_outcomes() {
        with_ctx(|ctx| {
            let rendered = DispatchResult
                .ingest(
                    &json!({
                        "tool_name": "dispatch_submodules",
                        "content": {
                            "status": "PARTIAL_SUCCESS_MIXED_RESULTS",
                            "message": "1 of 2 done",
                            "failed_preparation_details": [
                                {"input": {"module_id_to_assign": "WM_2"}, "reason": "bad status"}
                            ],
                            "assignment_execution_results": [
                                {
                                    "module_id": "WM_1",
                                    "execution_status": "success",
                                    "deliverables": {"primary_summary": "found it"},
                                    "new_messages_from_associate": [
                                        {"role": "assistant", "content": "working"}
                                    ]
                                }
                            ]
                        }
                    }),
                    &Map::new(),
                    ctx,
                )
                .unwrap();
            assert!(rendered.contains("PARTIAL_SUCCESS_MIXED_RESULTS"));
            assert!(rendered.contains("Module `WM_2`"));
            assert!(rendered.contains("Record for Module `WM_1`"));
            assert!(rendered.contains("found it"));
        });
    }

    #[test]
    fn observer_failure_block_instructs_continuation() {
        with_ctx(|ctx| {
            let rendered = ObserverFailure
                .ingest(
                    &json!({"failed_observer_id": "obs_1", "error_message": "path missing"}),
                    &Map::new(),
                    ctx,
                )
                .unwrap();
            assert!(rendered.contains("obs_1"));
            assert!(rendered.contains("path missing"));
            assert!(rendered.contains("MUST NOT stop"));
        });
    }

    #[test]
    fn json_history_wraps_and_rejects_non_lists() {
        with_ctx(|ctx| {
            let ok = JsonHistory
                .ingest(&json!([{"role": "user", "content": "x"}]), &Map::new(), ctx)
                .unwrap();
            assert!(ok.starts_with("<message_history_json>"));
            assert!(ok.ends_with("</message_history_json>"));

            assert!(JsonHistory.ingest(&json!({"not": "a list"}), &Map::new(), ctx).is_err());
        });
    }

    #[test]
    fn tagged_content_wraps() {
        with_ctx(|ctx| {
            let mut params = Map::new();
            let _ = params.insert("wrapper_tags".into(), json!(["<q>", "</q>"]));
            let rendered = TaggedContent
                .ingest(&json!("the question"), &params, ctx)
                .unwrap();
            assert_eq!(rendered, "<q>the question</q>");
        });
    }
}
