//! Segment-driven system prompt construction.
//!
//! Segments are sorted by `order` and rendered per kind: static text from
//! the profile's text definitions, state values through optional
//! ingestors, and the effective tool catalog grouped by toolset. A failing
//! segment is replaced with an in-band advisory instructing the agent to
//! warn the user once and continue; the prompt is never aborted.

use std::sync::Arc;

use serde_json::Value;
use tracing::{error, warn};

use troika_core::expr;
use troika_core::paths::{ContextPaths, display_value, interpolate};
use troika_core::turn::{SegmentLog, SystemPromptLog};
use troika_profiles::types::SegmentKind;
use troika_profiles::AgentProfile;

use crate::context::{ContextView, RunContext, SubContext};
use crate::ingestors::{IngestorCtx, IngestorRegistry};

/// Build the system prompt for one turn, returning the assembled text and
/// a segment-by-segment construction log.
pub fn construct_system_prompt(
    run: &Arc<RunContext>,
    sub: &Arc<SubContext>,
    profile: &Arc<AgentProfile>,
    ingestors: &IngestorRegistry,
) -> SystemPromptLog {
    let mut segments = profile.system_prompt_construction.system_prompt_segments.clone();
    segments.sort_by_key(|s| s.order);

    let mut parts: Vec<String> = Vec::new();
    let mut log: Vec<SegmentLog> = Vec::new();

    for segment in &segments {
        let view = ContextView::new(sub);
        let condition_met = match segment.condition.as_deref() {
            None | Some("True") | Some("true") => true,
            Some(condition) => match expr::evaluate_bool(condition, &view) {
                Ok(met) => met,
                Err(e) => {
                    warn!(segment_id = %segment.id, error = %e, "segment condition failed");
                    false
                }
            },
        };

        let rendered = if condition_met {
            match render_segment(run, sub, profile, ingestors, segment) {
                Ok(text) => text,
                Err(message) => {
                    error!(segment_id = %segment.id, message, "system prompt segment error");
                    segment_failure_advisory(&segment.id, &message)
                }
            }
        } else {
            String::new()
        };

        parts.push(rendered.clone());
        let segment_type = serde_json::to_value(segment.kind)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_default();
        log.push(SegmentLog {
            segment_id: segment.id.clone(),
            order: segment.order,
            segment_type,
            condition_met,
            rendered_content: rendered,
        });
    }

    let final_prompt = parts
        .iter()
        .filter(|p| !p.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join("\n\n");

    SystemPromptLog { log, final_prompt }
}

fn render_segment(
    run: &Arc<RunContext>,
    sub: &Arc<SubContext>,
    profile: &Arc<AgentProfile>,
    ingestors: &IngestorRegistry,
    segment: &troika_profiles::PromptSegment,
) -> Result<String, String> {
    let view = ContextView::new(sub);
    let rendered = match segment.kind {
        SegmentKind::StaticText => {
            let text = segment
                .content_key
                .as_ref()
                .and_then(|key| profile.text_definitions.get(key).cloned())
                .or_else(|| segment.content.clone())
                .unwrap_or_default();
            text
        }
        SegmentKind::StateValue => {
            let Some(path) = &segment.source_state_path else {
                warn!(segment_id = %segment.id, "state_value segment missing source_state_path");
                return Ok(String::new());
            };
            let raw = view.lookup(path);
            match (&segment.ingestor_id, raw) {
                (Some(ingestor_id), raw) => {
                    let ingestor = ingestors
                        .get(ingestor_id)
                        .ok_or_else(|| format!("ingestor '{ingestor_id}' not registered"))?;
                    let ctx = IngestorCtx {
                        run,
                        sub,
                        profile,
                    };
                    ingestor
                        .ingest(&raw.unwrap_or(Value::Null), &segment.ingestor_params, &ctx)
                        .map_err(|e| e.to_string())?
                }
                (None, Some(value)) => display_value(&value),
                (None, None) => String::new(),
            }
        }
        SegmentKind::ToolDescription => {
            let specs = run.runtime.tools.effective_specs_for(profile, sub);
            crate::tools::format_tools_for_prompt(&specs)
        }
    };
    Ok(interpolate(&rendered, &view))
}

/// The advisory injected when a segment fails to render.
fn segment_failure_advisory(segment_id: &str, error: &str) -> String {
    format!(
        "\n\n---\n\
         **[[CRITICAL SYSTEM PROMPT FAILURE]]**\n\
         **Alert:** A core part of your instructions (System Prompt Segment ID: '{segment_id}') \
         failed to generate due to an internal error: {error}\n\
         **Your operational context is now incomplete and potentially unreliable.**\n\
         **Mandatory Action:**\n\
         1.  In your very next response to the user, you MUST start your message by stating: \
         'Warning: A critical internal error has occurred, and my operational instructions may \
         be incomplete. I will proceed with caution, but my response might not be fully accurate.'\n\
         2.  After this warning, proceed with the user's request to the best of your ability \
         using the remaining instructions.\n\
         3.  Do not refer to this error message again unless directly asked by the user.\n\
         ---\n\n"
    )
}
