//! The transport client: layered retries around a [`ChatProvider`].
//!
//! Two independent retry layers:
//!
//! - **Transport retries**: exponential backoff with jitter on transient
//!   errors (rate limits, timeouts, connection drops, 5xx). Unrecoverable
//!   errors (auth, bad request, context window) fail the attempt
//!   immediately.
//! - **Application retries**: if a stream ends with zero content and zero
//!   tool calls, or the injection guard trips, the message list is mutated
//!   with an escalating corrective prompt and the call is retried. On
//!   exhaustion the client returns an error *outcome*, not an error type —
//!   the agent loop never sees a truly empty response.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use tracing::{error, info, instrument, warn};

use troika_core::events::{ChunkType, EventSink, RunEvent, TokenUsageStats};
use troika_core::ids;
use troika_core::messages::ChatMessage;
use troika_core::retry::RetryConfig;
use troika_core::turn::{AttemptStatus, LlmAttempt};

use crate::aggregator::{AggregatedResponse, StreamAggregator};
use crate::config::LlmConfig;
use crate::errors::LlmError;
use crate::provider::ChatProvider;
use crate::types::{ChatRequest, LlmOutcome};
use futures::StreamExt;

/// Default application-level retry budget for empty-response recovery.
pub const DEFAULT_APP_RETRIES: u32 = 2;

/// Per-call context: identity for events plus shared usage counters.
#[derive(Clone, Default)]
pub struct CallOptions {
    /// Owning run.
    pub run_id: String,
    /// Calling agent.
    pub agent_id: String,
    /// Parent agent, if spawned.
    pub parent_agent_id: Option<String>,
    /// Stream id allocated by the turn manager for the first attempt.
    pub stream_id: String,
    /// Event sink for stream progress events.
    pub sink: Option<Arc<dyn EventSink>>,
    /// Run-level token counters, updated on success and failure.
    pub usage: Option<Arc<Mutex<TokenUsageStats>>>,
}

impl CallOptions {
    fn emit(&self, event: RunEvent) {
        if let Some(sink) = &self.sink {
            sink.emit_event(event);
        }
    }
}

/// The streaming client used by every agent loop.
pub struct LlmClient {
    provider: Arc<dyn ChatProvider>,
    transport_retry: RetryConfig,
}

impl LlmClient {
    /// Client over a provider with the default transport retry policy.
    pub fn new(provider: Arc<dyn ChatProvider>) -> Self {
        Self {
            provider,
            transport_retry: RetryConfig::default(),
        }
    }

    /// Override the transport retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.transport_retry = retry;
        self
    }

    /// Make one logical call: transport retries inside, application-level
    /// empty-response recovery outside. Always returns an outcome.
    #[instrument(skip_all, fields(agent_id = %opts.agent_id, model = %config.model))]
    pub async fn call(&self, config: &LlmConfig, request: &ChatRequest, opts: &CallOptions) -> LlmOutcome {
        let app_retries = config.max_retries.unwrap_or(DEFAULT_APP_RETRIES);
        let wait_base = config.wait_seconds_on_retry.unwrap_or(3);

        let mut messages = request.messages.clone();
        let mut attempts: Vec<LlmAttempt> = Vec::new();
        let mut last_failure: Option<String> = None;

        for attempt in 0..=app_retries {
            let stream_id = if attempt == 0 {
                opts.stream_id.clone()
            } else {
                ids::stream_id(&opts.agent_id)
            };

            opts.emit(RunEvent::LlmStreamStarted {
                run_id: opts.run_id.clone(),
                agent_id: opts.agent_id.clone(),
                parent_agent_id: opts.parent_agent_id.clone(),
                stream_id: stream_id.clone(),
                llm_id: Some(config.model.clone()),
            });
            info!(attempt = attempt + 1, max = app_retries + 1, stream_id, "llm call attempt");

            let attempt_request = ChatRequest {
                messages: messages.clone(),
                system_prompt: request.system_prompt.clone(),
                tools: request.tools.clone(),
                tool_choice: request.tool_choice.clone(),
            };

            match self.run_attempt(config, &attempt_request, opts, &stream_id).await {
                AttemptOutcome::Success(resp) => {
                    counter!("llm_calls_total", "outcome" => "success").increment(1);
                    attempts.push(LlmAttempt {
                        stream_id: stream_id.clone(),
                        status: AttemptStatus::Success,
                        error: None,
                    });
                    self.record_success_usage(&resp, opts);
                    opts.emit(RunEvent::LlmStreamEnded {
                        run_id: opts.run_id.clone(),
                        agent_id: opts.agent_id.clone(),
                        stream_id: stream_id.clone(),
                    });
                    return LlmOutcome {
                        content: Some(resp.content),
                        reasoning: Some(resp.reasoning),
                        tool_calls: resp.tool_calls,
                        model_id_used: resp.model_id_used,
                        actual_usage: resp.actual_usage,
                        attempts,
                        final_stream_id: stream_id,
                        error: None,
                        error_type: None,
                    };
                }
                AttemptOutcome::ForceRetry(reason) => {
                    counter!("llm_calls_total", "outcome" => "force_retry").increment(1);
                    warn!(stream_id, reason, attempt = attempt + 1, "application-level retry");
                    attempts.push(LlmAttempt {
                        stream_id: stream_id.clone(),
                        status: AttemptStatus::Failed,
                        error: Some(reason.clone()),
                    });
                    last_failure = Some(reason.clone());
                    self.record_failed_call(opts);
                    opts.emit(RunEvent::LlmStreamFailed {
                        run_id: opts.run_id.clone(),
                        agent_id: opts.agent_id.clone(),
                        stream_id,
                        reason: format!("forcing retry due to: {reason}"),
                    });
                    if attempt >= app_retries {
                        break;
                    }
                    escalate_recovery_prompt(&mut messages, attempt);
                    tokio::time::sleep(Duration::from_secs(wait_base * u64::from(attempt + 1))).await;
                }
                AttemptOutcome::Unrecoverable(err) => {
                    counter!("llm_calls_total", "outcome" => "error").increment(1);
                    error!(stream_id, error = %err, "llm call failed terminally");
                    let message = err.to_string();
                    attempts.push(LlmAttempt {
                        stream_id: stream_id.clone(),
                        status: AttemptStatus::Failed,
                        error: Some(message.clone()),
                    });
                    self.record_failed_call(opts);
                    opts.emit(RunEvent::LlmStreamFailed {
                        run_id: opts.run_id.clone(),
                        agent_id: opts.agent_id.clone(),
                        stream_id: stream_id.clone(),
                        reason: format!("unrecoverable error: {message}"),
                    });
                    return LlmOutcome {
                        attempts,
                        final_stream_id: stream_id,
                        error: Some(message),
                        error_type: Some(err.error_type().to_string()),
                        ..LlmOutcome::default()
                    };
                }
            }
        }

        let reason = last_failure.unwrap_or_else(|| "unknown".to_string());
        error!(reason, "application-level retries exhausted");
        LlmOutcome {
            attempts,
            final_stream_id: opts.stream_id.clone(),
            error: Some(format!(
                "LLM call failed after all application-level retries. Last reason: {reason}"
            )),
            error_type: Some("ForceRetryExhausted".to_string()),
            ..LlmOutcome::default()
        }
    }

    async fn run_attempt(
        &self,
        config: &LlmConfig,
        request: &ChatRequest,
        opts: &CallOptions,
        stream_id: &str,
    ) -> AttemptOutcome {
        // Transport layer: open the stream with backoff on transient errors
        let mut stream = {
            let mut transport_attempt = 0u32;
            loop {
                match self.provider.stream_chat(config, request).await {
                    Ok(stream) => break stream,
                    Err(e) if e.is_transient() && transport_attempt < self.transport_retry.max_retries => {
                        let delay = self.transport_retry.delay_for_attempt(transport_attempt);
                        warn!(
                            error = %e,
                            transport_attempt = transport_attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            "transient transport error, backing off"
                        );
                        tokio::time::sleep(delay).await;
                        transport_attempt += 1;
                    }
                    Err(e) => return AttemptOutcome::Unrecoverable(e),
                }
            }
        };

        // Consume the stream through the aggregator, emitting chunk events
        let mut agg = StreamAggregator::new();
        while let Some(item) = stream.next().await {
            let delta = match item {
                Ok(delta) => delta,
                Err(e) => return AttemptOutcome::Unrecoverable(e),
            };
            self.emit_chunks(&delta, opts, stream_id);
            if let Err(forced) = agg.absorb(&delta) {
                return AttemptOutcome::ForceRetry(forced.reason);
            }
        }

        let resp = agg.finish();
        if resp.is_empty() {
            return AttemptOutcome::ForceRetry(
                "received completely empty response from LLM".to_string(),
            );
        }
        AttemptOutcome::Success(resp)
    }

    fn emit_chunks(&self, delta: &crate::types::StreamDelta, opts: &CallOptions, stream_id: &str) {
        let mut chunk = |chunk_type: ChunkType, content: &str| {
            opts.emit(RunEvent::LlmChunk {
                run_id: opts.run_id.clone(),
                agent_id: opts.agent_id.clone(),
                stream_id: stream_id.to_string(),
                chunk_type,
                content: content.to_string(),
            });
        };
        if let Some(c) = &delta.reasoning_content {
            chunk(ChunkType::ReasoningContent, c);
        }
        if let Some(c) = &delta.content {
            chunk(ChunkType::Content, c);
        }
        for tc in &delta.tool_calls {
            if let Some(name) = &tc.name {
                chunk(ChunkType::ToolName, name);
            }
            if let Some(args) = &tc.arguments {
                chunk(ChunkType::ToolArgs, args);
            }
        }
    }

    fn record_success_usage(&self, resp: &AggregatedResponse, opts: &CallOptions) {
        let Some(usage_cell) = &opts.usage else { return };
        let Some(usage) = resp.actual_usage else {
            let mut stats = usage_cell.lock();
            stats.total_successful_calls += 1;
            return;
        };
        let snapshot = {
            let mut stats = usage_cell.lock();
            stats.total_prompt_tokens += usage.prompt_tokens;
            stats.total_completion_tokens += usage.completion_tokens;
            stats.total_successful_calls += 1;
            let call_total = usage.prompt_tokens + usage.completion_tokens;
            if call_total > stats.max_context_window {
                stats.max_context_window = call_total;
            }
            *stats
        };
        opts.emit(RunEvent::TokenUsageUpdate {
            run_id: opts.run_id.clone(),
            stats: snapshot,
        });
    }

    fn record_failed_call(&self, opts: &CallOptions) {
        let Some(usage_cell) = &opts.usage else { return };
        let snapshot = {
            let mut stats = usage_cell.lock();
            stats.total_failed_calls += 1;
            *stats
        };
        opts.emit(RunEvent::TokenUsageUpdate {
            run_id: opts.run_id.clone(),
            stats: snapshot,
        });
    }
}

enum AttemptOutcome {
    Success(AggregatedResponse),
    ForceRetry(String),
    Unrecoverable(LlmError),
}

/// Mutate the message list with the escalating corrective prompts. The
/// first retry appends an empty assistant message plus a direct user
/// correction; the second a sterner user message; later retries a
/// self-directed assistant note reviewers can act on.
fn escalate_recovery_prompt(messages: &mut Vec<ChatMessage>, failed_attempt: u32) {
    match failed_attempt {
        0 => {
            let last = messages
                .last()
                .map(|m| serde_json::to_string(&m.clean_for_llm()).unwrap_or_default())
                .unwrap_or_default();
            messages.push(ChatMessage::assistant(""));
            messages.push(ChatMessage::user(format!(
                "You just made an empty response, which is not acceptable. \
                 Not making any response is not an option. DO NOT apologize, just continue \
                 from where you left off. Directly address the last message: '{last}'. \
                 DO NOT GIVE ANY EXPLANATION, JUST CONTINUE THE TASK FROM WHERE YOU LEFT OFF. \
                 START YOUR RESPONSE WITH 'OK,' or equivalent in the user's language, and then \
                 continue with your response, preferably with a tool call at the end."
            )));
        }
        1 => {
            messages.push(ChatMessage::user(
                "You must ensure that you make a tool call or say something, regardless of \
                 the situation. Not making any response is not an option."
                    .to_string(),
            ));
        }
        _ => {
            messages.push(ChatMessage::assistant(
                "It appears that I am unable to make further progress. For this final attempt, \
                 I will say something or call a tool to conclude this flow. [To my supervisor: \
                 if you see this message, please review my reasoning and content to assess my \
                 progress. If there has been no meaningful advancement, consider restarting \
                 this workflow with revised requirements.]"
                    .to_string(),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StreamDelta;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Provider that replays scripted delta batches, one batch per call.
    struct ScriptedProvider {
        batches: Mutex<Vec<Vec<StreamDelta>>>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(batches: Vec<Vec<StreamDelta>>) -> Self {
            Self {
                batches: Mutex::new(batches),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ChatProvider for ScriptedProvider {
        async fn stream_chat(
            &self,
            _config: &LlmConfig,
            _request: &ChatRequest,
        ) -> Result<crate::provider::DeltaStream, LlmError> {
            let _ = self.calls.fetch_add(1, Ordering::SeqCst);
            let mut batches = self.batches.lock();
            let batch = if batches.is_empty() {
                Vec::new()
            } else {
                batches.remove(0)
            };
            Ok(Box::pin(futures::stream::iter(
                batch.into_iter().map(Ok::<StreamDelta, LlmError>),
            )) as crate::provider::DeltaStream)
        }
    }

    /// Provider that always fails the same way.
    struct FailingProvider;

    #[async_trait]
    impl ChatProvider for FailingProvider {
        async fn stream_chat(
            &self,
            _config: &LlmConfig,
            _request: &ChatRequest,
        ) -> Result<crate::provider::DeltaStream, LlmError> {
            Err(LlmError::Auth("nope".into()))
        }
    }

    fn fast_config() -> LlmConfig {
        LlmConfig {
            model: "scripted".into(),
            max_retries: Some(3),
            wait_seconds_on_retry: Some(0),
            ..LlmConfig::default()
        }
    }

    fn opts() -> CallOptions {
        CallOptions {
            run_id: "run_1".into(),
            agent_id: "Partner".into(),
            stream_id: "stream_0".into(),
            ..CallOptions::default()
        }
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let provider = Arc::new(ScriptedProvider::new(vec![vec![StreamDelta::text("done")]]));
        let client = LlmClient::new(provider);
        let out = client
            .call(&fast_config(), &ChatRequest::default(), &opts())
            .await;
        assert!(!out.is_error());
        assert_eq!(out.content.as_deref(), Some("done"));
        assert_eq!(out.attempts.len(), 1);
        assert_eq!(out.attempts[0].status, AttemptStatus::Success);
        assert_eq!(out.final_stream_id, "stream_0");
    }

    #[tokio::test]
    async fn empty_streams_retry_until_content_arrives() {
        // Three empty streams then a short content — S5 shape
        let provider = Arc::new(ScriptedProvider::new(vec![
            vec![],
            vec![],
            vec![],
            vec![StreamDelta::text("OK, done")],
        ]));
        let client = LlmClient::new(Arc::clone(&provider) as Arc<dyn ChatProvider>);
        let out = client
            .call(&fast_config(), &ChatRequest::default(), &opts())
            .await;

        assert!(!out.is_error());
        assert_eq!(out.content.as_deref(), Some("OK, done"));
        assert_eq!(out.attempts.len(), 4);
        assert!(out.attempts[..3]
            .iter()
            .all(|a| a.status == AttemptStatus::Failed));
        assert_eq!(out.attempts[3].status, AttemptStatus::Success);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 4);
        // Retries allocate fresh stream ids
        assert_ne!(out.final_stream_id, "stream_0");
    }

    #[tokio::test]
    async fn exhausted_retries_return_error_outcome() {
        let provider = Arc::new(ScriptedProvider::new(vec![vec![], vec![], vec![], vec![]]));
        let mut config = fast_config();
        config.max_retries = Some(2);
        let client = LlmClient::new(provider);
        let out = client.call(&config, &ChatRequest::default(), &opts()).await;

        assert!(out.is_error());
        assert_eq!(out.error_type.as_deref(), Some("ForceRetryExhausted"));
        assert_eq!(out.attempts.len(), 3);
    }

    #[tokio::test]
    async fn unrecoverable_error_fails_immediately() {
        let client = LlmClient::new(Arc::new(FailingProvider));
        let out = client
            .call(&fast_config(), &ChatRequest::default(), &opts())
            .await;
        assert!(out.is_error());
        assert_eq!(out.error_type.as_deref(), Some("Auth"));
        assert_eq!(out.attempts.len(), 1);
    }

    #[tokio::test]
    async fn injection_guard_forces_retry() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            vec![StreamDelta::text("<tool_call>fake</tool_call>")],
            vec![StreamDelta::text("real answer")],
        ]));
        let client = LlmClient::new(provider);
        let out = client
            .call(&fast_config(), &ChatRequest::default(), &opts())
            .await;
        assert!(!out.is_error());
        assert_eq!(out.content.as_deref(), Some("real answer"));
        assert_eq!(out.attempts.len(), 2);
    }

    #[tokio::test]
    async fn usage_counters_update_on_success_and_failure() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            vec![],
            vec![StreamDelta {
                content: Some("x".into()),
                usage: Some(troika_core::turn::UsageNumbers {
                    prompt_tokens: 100,
                    completion_tokens: 20,
                    total_tokens: 120,
                }),
                ..StreamDelta::default()
            }],
        ]));
        let client = LlmClient::new(provider);
        let usage = Arc::new(Mutex::new(TokenUsageStats::default()));
        let mut o = opts();
        o.usage = Some(Arc::clone(&usage));

        let _ = client.call(&fast_config(), &ChatRequest::default(), &o).await;

        let stats = *usage.lock();
        assert_eq!(stats.total_failed_calls, 1);
        assert_eq!(stats.total_successful_calls, 1);
        assert_eq!(stats.total_prompt_tokens, 100);
        assert_eq!(stats.max_context_window, 120);
    }

    #[test]
    fn escalation_shapes() {
        let mut messages = vec![ChatMessage::user("original")];
        escalate_recovery_prompt(&mut messages, 0);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].role, troika_core::messages::Role::Assistant);
        assert!(messages[2].content.contains("empty response"));

        escalate_recovery_prompt(&mut messages, 1);
        assert!(messages.last().unwrap().content.contains("tool call"));

        escalate_recovery_prompt(&mut messages, 2);
        assert_eq!(
            messages.last().unwrap().role,
            troika_core::messages::Role::Assistant
        );
    }
}
