//! External-tool sessions and the proxy tool that routes calls to them.
//!
//! Sessions are pooled: a flow acquires one before it starts and releases
//! it in teardown. Reused sessions are health-checked with a lightweight
//! ping; unhealthy ones are discarded and replaced. A lost session
//! surfaces as a structured `CRITICAL_CONNECTION_FAILURE` tool error that
//! instructs the LLM to stop calling that server's tools and terminate
//! the flow.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use troika_core::tools::{ToolImplementation, ToolResponse, ToolSpec};

use crate::context::{RunContext, SubContext};
use crate::tools::Tool;

/// A live connection to an external tool server.
#[async_trait]
pub trait ExternalSession: Send + Sync {
    /// Lightweight health check.
    async fn ping(&self) -> bool;

    /// Invoke a remote tool.
    async fn call_tool(&self, server: &str, tool: &str, params: &Value) -> Result<Value, String>;
}

/// Creates fresh sessions for the pool.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Open a new session, or `None` when the backend is unreachable.
    async fn create(&self) -> Option<Arc<dyn ExternalSession>>;
}

/// A pool of reusable external-tool sessions.
#[derive(Default)]
pub struct SessionPool {
    idle: Mutex<Vec<Arc<dyn ExternalSession>>>,
    factory: Option<Arc<dyn SessionFactory>>,
}

impl SessionPool {
    /// A pool that can mint new sessions through the factory.
    pub fn with_factory(factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            factory: Some(factory),
        }
    }

    /// Borrow a session: reuse an idle one if it still responds to ping,
    /// else create a new one. `None` when no backend is configured or
    /// reachable.
    pub async fn acquire(&self) -> Option<Arc<dyn ExternalSession>> {
        loop {
            let candidate = self.idle.lock().pop();
            match candidate {
                Some(session) => {
                    if session.ping().await {
                        return Some(session);
                    }
                    warn!("discarding unhealthy pooled session");
                }
                None => break,
            }
        }
        match &self.factory {
            Some(factory) => factory.create().await,
            None => None,
        }
    }

    /// Return a session to the pool.
    pub fn release(&self, session: Arc<dyn ExternalSession>) {
        self.idle.lock().push(session);
    }

    /// Idle session count.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}

/// The payload telling the LLM a server connection is gone for good this
/// flow.
pub fn critical_connection_failure(server_name: &str, detail: &str) -> Value {
    json!({
        "error_type": "CRITICAL_CONNECTION_FAILURE",
        "server_name": server_name,
        "details": detail,
        "instruction_for_llm": format!(
            "The connection to tool server '{server_name}' has been lost and cannot be recovered \
             in this flow. You MUST NOT call any more tools from this server. Conclude your work \
             with the information you already have and call the flow-ending tool."
        ),
    })
}

/// Proxy routing one remote tool through the flow's borrowed session.
/// Registered under the composite `server_name.tool_name`.
pub struct ExternalProxyTool {
    /// Remote server name.
    pub server_name: String,
    /// Remote tool name.
    pub tool_name: String,
    /// Description from discovery.
    pub description: String,
    /// Parameter schema from discovery.
    pub parameters: Value,
}

impl ExternalProxyTool {
    fn composite_name(&self) -> String {
        format!("{}.{}", self.server_name, self.tool_name)
    }
}

#[async_trait]
impl Tool for ExternalProxyTool {
    fn spec(&self) -> ToolSpec {
        let mut spec = ToolSpec::new(
            self.composite_name(),
            self.description.clone(),
            self.parameters.clone(),
        )
        .with_toolset(self.server_name.clone());
        spec.implementation = ToolImplementation::ExternalProxy;
        spec
    }

    async fn execute(
        &self,
        params: Value,
        _run: &Arc<RunContext>,
        sub: &Arc<SubContext>,
        _cancel: &CancellationToken,
    ) -> ToolResponse {
        let session = sub.runtime.external_session.lock().clone();
        let Some(session) = session else {
            warn!(server = %self.server_name, "no external session bound to flow");
            return ToolResponse {
                status: troika_core::tools::ToolStatus::Error,
                payload: critical_connection_failure(
                    &self.server_name,
                    "no session was available for this flow",
                ),
                knowledge_items: Vec::new(),
            };
        };

        match session
            .call_tool(&self.server_name, &self.tool_name, &params)
            .await
        {
            Ok(payload) => {
                info!(tool = %self.composite_name(), "external tool call succeeded");
                ToolResponse::success(payload)
            }
            Err(detail) => {
                warn!(tool = %self.composite_name(), detail, "external tool call failed");
                ToolResponse {
                    status: troika_core::tools::ToolStatus::Error,
                    payload: critical_connection_failure(&self.server_name, &detail),
                    knowledge_items: Vec::new(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeSession {
        healthy: AtomicBool,
        calls: AtomicUsize,
    }

    impl FakeSession {
        fn new(healthy: bool) -> Arc<Self> {
            Arc::new(Self {
                healthy: AtomicBool::new(healthy),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ExternalSession for FakeSession {
        async fn ping(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }

        async fn call_tool(&self, _server: &str, _tool: &str, _params: &Value) -> Result<Value, String> {
            let _ = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"ok": true}))
        }
    }

    struct CountingFactory {
        created: AtomicUsize,
    }

    #[async_trait]
    impl SessionFactory for CountingFactory {
        async fn create(&self) -> Option<Arc<dyn ExternalSession>> {
            let _ = self.created.fetch_add(1, Ordering::SeqCst);
            Some(FakeSession::new(true))
        }
    }

    #[tokio::test]
    async fn pool_reuses_healthy_sessions() {
        let pool = SessionPool::default();
        let session = FakeSession::new(true);
        pool.release(session.clone());

        let acquired = pool.acquire().await.unwrap();
        assert_eq!(pool.idle_count(), 0);
        pool.release(acquired);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn pool_discards_unhealthy_and_creates_fresh() {
        let factory = Arc::new(CountingFactory {
            created: AtomicUsize::new(0),
        });
        let pool = SessionPool::with_factory(factory.clone());
        pool.release(FakeSession::new(false));

        let acquired = pool.acquire().await;
        assert!(acquired.is_some());
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn pool_without_factory_returns_none() {
        let pool = SessionPool::default();
        assert!(pool.acquire().await.is_none());
    }

    #[test]
    fn connection_failure_payload_instructs_termination() {
        let payload = critical_connection_failure("search_server", "socket closed");
        assert_eq!(payload["error_type"], "CRITICAL_CONNECTION_FAILURE");
        assert!(payload["instruction_for_llm"]
            .as_str()
            .unwrap()
            .contains("MUST NOT call any more tools"));
    }

    #[test]
    fn proxy_spec_uses_composite_name() {
        let proxy = ExternalProxyTool {
            server_name: "search_server".into(),
            tool_name: "web_search".into(),
            description: "Search the web.".into(),
            parameters: json!({"type": "object"}),
        };
        let spec = proxy.spec();
        assert_eq!(spec.name, "search_server.web_search");
        assert_eq!(spec.toolset_name, "search_server");
        assert_eq!(spec.implementation, ToolImplementation::ExternalProxy);
    }
}
