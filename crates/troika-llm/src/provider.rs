//! The provider trait and the OpenAI-compatible SSE implementation.
//!
//! Providers turn a resolved config plus request into a stream of parsed
//! [`StreamDelta`]s. Scripted providers in tests implement the same trait,
//! which is what keeps the client's retry policy testable without a
//! network.

use std::pin::Pin;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, error, instrument};

use troika_core::messages::{ChatMessage, Role};
use troika_core::turn::UsageNumbers;

use crate::config::LlmConfig;
use crate::errors::LlmError;
use crate::types::{ChatRequest, StreamDelta, ToolCallDelta};

/// A pinned, sendable stream of parsed deltas.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<StreamDelta, LlmError>> + Send>>;

/// A streaming chat-completion backend.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Open a streaming completion for the request.
    async fn stream_chat(
        &self,
        config: &LlmConfig,
        request: &ChatRequest,
    ) -> Result<DeltaStream, LlmError>;
}

/// Default endpoint when the config does not carry one.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI-compatible streaming provider (chat completions + SSE).
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
}

impl Default for OpenAiCompatProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenAiCompatProvider {
    /// Provider with a fresh HTTP client.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Provider sharing an existing HTTP client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn build_body(config: &LlmConfig, request: &ChatRequest) -> Value {
        let mut messages: Vec<ChatMessage> =
            request.messages.iter().map(ChatMessage::clean_for_llm).collect();
        if let Some(system) = &request.system_prompt {
            match messages.first_mut() {
                Some(first) if first.role == Role::System => {
                    first.content = system.clone();
                }
                _ => messages.insert(0, ChatMessage::system(system.clone())),
            }
        }

        let mut body = Map::new();
        let _ = body.insert("model".into(), json!(config.model));
        let _ = body.insert("messages".into(), serde_json::to_value(&messages).unwrap_or_default());
        let _ = body.insert("stream".into(), json!(true));
        let _ = body.insert("stream_options".into(), json!({"include_usage": true}));
        if !request.tools.is_empty() {
            let _ = body.insert("tools".into(), Value::Array(request.tools.clone()));
            if let Some(choice) = &request.tool_choice {
                let _ = body.insert("tool_choice".into(), json!(choice));
            }
        }
        if let Some(t) = config.temperature {
            let _ = body.insert("temperature".into(), json!(t));
        }
        if let Some(m) = config.max_tokens {
            let _ = body.insert("max_tokens".into(), json!(m));
        }
        for (k, v) in &config.extra {
            let _ = body.entry(k.clone()).or_insert_with(|| v.clone());
        }
        Value::Object(body)
    }
}

#[async_trait]
impl ChatProvider for OpenAiCompatProvider {
    #[instrument(skip_all, fields(model = %config.model))]
    async fn stream_chat(
        &self,
        config: &LlmConfig,
        request: &ChatRequest,
    ) -> Result<DeltaStream, LlmError> {
        let base_url = config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        let url = format!("{base_url}/chat/completions");
        let body = Self::build_body(config, request);

        debug!(
            url,
            message_count = request.messages.len(),
            has_tools = !request.tools.is_empty(),
            "sending chat completion request"
        );

        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = &config.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(LlmError::Http)?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000);
            let body_text = response.text().await.unwrap_or_default();
            let message = parse_api_error(&body_text);
            error!(status = status.as_u16(), message, "chat completion request failed");
            return Err(LlmError::from_status(status.as_u16(), message, retry_after));
        }

        let mut events = response.bytes_stream().eventsource();
        let stream = async_stream::stream! {
            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => {
                        if event.data.trim() == "[DONE]" {
                            break;
                        }
                        match serde_json::from_str::<ChunkWire>(&event.data) {
                            Ok(chunk) => yield Ok(chunk.into_delta()),
                            Err(e) => {
                                debug!(error = %e, "skipping unparseable sse chunk");
                            }
                        }
                    }
                    Err(e) => {
                        yield Err(LlmError::Connection(format!("sse stream error: {e}")));
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

/// Extract a human-oriented message from an error body, tolerating both
/// `{"error": {"message": ...}}` and plain-text bodies.
pub fn parse_api_error(body: &str) -> String {
    if let Ok(v) = serde_json::from_str::<Value>(body) {
        if let Some(msg) = v
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
        {
            return msg.to_string();
        }
        if let Some(msg) = v.get("message").and_then(Value::as_str) {
            return msg.to_string();
        }
    }
    if body.is_empty() {
        "request failed with empty body".to_string()
    } else {
        body.chars().take(500).collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChunkWire {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChoiceWire>,
    #[serde(default)]
    usage: Option<UsageWire>,
}

#[derive(Debug, Default, Deserialize)]
struct ChoiceWire {
    #[serde(default)]
    delta: DeltaWire,
}

#[derive(Debug, Default, Deserialize)]
struct DeltaWire {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallChunkWire>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallChunkWire {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionWire>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionWire {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageWire {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

impl ChunkWire {
    fn into_delta(self) -> StreamDelta {
        let mut delta = StreamDelta {
            model: self.model,
            usage: self.usage.map(|u| UsageNumbers {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
            ..StreamDelta::default()
        };
        if let Some(choice) = self.choices.into_iter().next() {
            delta.content = choice.delta.content;
            delta.reasoning_content = choice.delta.reasoning_content;
            delta.tool_calls = choice
                .delta
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|tc| ToolCallDelta {
                    index: tc.index,
                    id: tc.id,
                    name: tc.function.as_ref().and_then(|f| f.name.clone()),
                    arguments: tc.function.and_then(|f| f.arguments),
                })
                .collect();
        }
        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::StreamAggregator;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> LlmConfig {
        LlmConfig {
            model: "test-model".into(),
            api_key: Some("test-key".into()),
            base_url: Some(server.uri()),
            ..LlmConfig::default()
        }
    }

    fn sse_body(lines: &[&str]) -> String {
        let mut body = String::new();
        for line in lines {
            body.push_str("data: ");
            body.push_str(line);
            body.push_str("\n\n");
        }
        body.push_str("data: [DONE]\n\n");
        body
    }

    #[tokio::test]
    async fn happy_path_stream_aggregates() {
        let server = MockServer::start().await;
        let body = sse_body(&[
            r#"{"model":"test-model","choices":[{"delta":{"content":"Hel"}}]}"#,
            r#"{"choices":[{"delta":{"content":"lo"}}]}"#,
            r#"{"choices":[],"usage":{"prompt_tokens":7,"completion_tokens":2,"total_tokens":9}}"#,
        ]);
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let provider = OpenAiCompatProvider::new();
        let request = ChatRequest {
            messages: vec![ChatMessage::user("hi")],
            ..ChatRequest::default()
        };
        let mut stream = provider
            .stream_chat(&config_for(&server), &request)
            .await
            .unwrap();

        let mut agg = StreamAggregator::new();
        while let Some(delta) = stream.next().await {
            agg.absorb(&delta.unwrap()).unwrap();
        }
        let resp = agg.finish();
        assert_eq!(resp.content, "Hello");
        assert_eq!(resp.model_id_used.as_deref(), Some("test-model"));
        assert_eq!(resp.actual_usage.unwrap().total_tokens, 9);
    }

    #[tokio::test]
    async fn tool_call_fragments_parse() {
        let server = MockServer::start().await;
        let body = sse_body(&[
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"echo","arguments":""}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"s\":\"hello\"}"}}]}}]}"#,
        ]);
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let provider = OpenAiCompatProvider::new();
        let request = ChatRequest {
            messages: vec![ChatMessage::user("echo hello")],
            tools: vec![serde_json::json!({"type": "function", "function": {"name": "echo"}})],
            ..ChatRequest::default()
        };
        let mut stream = provider
            .stream_chat(&config_for(&server), &request)
            .await
            .unwrap();

        let mut agg = StreamAggregator::new();
        while let Some(delta) = stream.next().await {
            agg.absorb(&delta.unwrap()).unwrap();
        }
        let resp = agg.finish();
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].id, "c1");
        assert_eq!(resp.tool_calls[0].function.name, "echo");
    }

    #[tokio::test]
    async fn auth_failure_is_unrecoverable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_string(r#"{"error":{"message":"bad api key"}}"#),
            )
            .mount(&server)
            .await;

        let provider = OpenAiCompatProvider::new();
        let request = ChatRequest {
            messages: vec![ChatMessage::user("hi")],
            ..ChatRequest::default()
        };
        let err = match provider.stream_chat(&config_for(&server), &request).await {
            Ok(_) => panic!("expected an error"),
            Err(e) => e,
        };
        assert_matches::assert_matches!(err, LlmError::Auth(m) if m == "bad api key");
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "2")
                    .set_body_string(r#"{"error":{"message":"slow down"}}"#),
            )
            .mount(&server)
            .await;

        let provider = OpenAiCompatProvider::new();
        let request = ChatRequest {
            messages: vec![ChatMessage::user("hi")],
            ..ChatRequest::default()
        };
        let err = match provider.stream_chat(&config_for(&server), &request).await {
            Ok(_) => panic!("expected an error"),
            Err(e) => e,
        };
        assert_matches::assert_matches!(
            err,
            LlmError::RateLimited { retry_after_ms: 2000, .. }
        );
        assert!(err.is_transient());
    }

    #[test]
    fn system_prompt_replaces_leading_system_message() {
        let config = LlmConfig {
            model: "m".into(),
            ..LlmConfig::default()
        };
        let request = ChatRequest {
            messages: vec![ChatMessage::system("old"), ChatMessage::user("q")],
            system_prompt: Some("new".into()),
            ..ChatRequest::default()
        };
        let body = OpenAiCompatProvider::build_body(&config, &request);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[0]["content"], "new");
    }

    #[test]
    fn system_prompt_inserts_when_absent() {
        let config = LlmConfig {
            model: "m".into(),
            ..LlmConfig::default()
        };
        let request = ChatRequest {
            messages: vec![ChatMessage::user("q")],
            system_prompt: Some("sys".into()),
            ..ChatRequest::default()
        };
        let body = OpenAiCompatProvider::build_body(&config, &request);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
    }

    #[test]
    fn extra_params_do_not_override_core_fields() {
        let mut config = LlmConfig {
            model: "m".into(),
            ..LlmConfig::default()
        };
        let _ = config.extra.insert("stream".into(), serde_json::json!(false));
        let _ = config.extra.insert("top_p".into(), serde_json::json!(0.5));
        let request = ChatRequest::default();
        let body = OpenAiCompatProvider::build_body(&config, &request);
        assert_eq!(body["stream"], true);
        assert_eq!(body["top_p"], 0.5);
    }

    #[test]
    fn parse_api_error_shapes() {
        assert_eq!(parse_api_error(r#"{"error":{"message":"m1"}}"#), "m1");
        assert_eq!(parse_api_error(r#"{"message":"m2"}"#), "m2");
        assert_eq!(parse_api_error("plain failure"), "plain failure");
        assert_eq!(parse_api_error(""), "request failed with empty body");
    }
}
