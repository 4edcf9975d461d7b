//! The context model: one `RunContext` per business run, one `SubContext`
//! per agent.
//!
//! Ownership is explicit so serialization never recurses: the run owns the
//! team ledger, knowledge base, emitter, and counters; sub-contexts hold
//! `Weak` back-references. Each agent task owns writes to its own
//! `AgentState`; other tasks only read it (the Partner reading Principal
//! status, the dispatcher collecting deliverables).

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use troika_core::events::TokenUsageStats;
use troika_core::ids;
use troika_core::inbox::InboxItem;
use troika_core::messages::ChatMessage;
use troika_core::paths::ContextPaths;
use troika_core::team::TeamState;
use troika_core::tools::ToolImplementation;
use troika_kb::KnowledgeBase;
use troika_llm::{LlmClient, LlmConfigCatalog};
use troika_profiles::{AppConfig, ProfileStore};

use crate::emitter::EventEmitter;
use crate::ingestors::IngestorRegistry;
use crate::tools::proxy::SessionPool;
use crate::tools::ToolRegistry;

/// What kind of business run this is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    /// User-facing Partner supervising Principals.
    PartnerInteraction,
    /// A Principal driven directly by a caller.
    PrincipalDirect,
    /// Headless service run.
    Service,
}

/// Run lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Created, no flow started yet.
    Created,
    /// At least one flow running.
    Running,
    /// Parked awaiting user input.
    AwaitingInput,
    /// Finished.
    Completed,
    /// Failed.
    Failed,
    /// Cancelled.
    Cancelled,
}

/// Immutable identity of a run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunMeta {
    /// Unique run id.
    pub run_id: String,
    /// Run kind.
    pub run_type: RunType,
    /// Creation timestamp.
    pub creation_timestamp: String,
}

/// Configuration snapshot frozen at run creation.
pub struct RunConfig {
    /// Agent profile + protocol catalog.
    pub profiles: ProfileStore,
    /// Named LLM configs.
    pub llm_configs: LlmConfigCatalog,
    /// Process settings.
    pub app: AppConfig,
}

/// Non-serializable, run-scoped singletons.
pub struct RunRuntime {
    /// Event emitter all components publish through.
    pub emitter: Arc<EventEmitter>,
    /// Content-addressed store.
    pub kb: Arc<Mutex<KnowledgeBase>>,
    /// Token accounting counters.
    pub usage: Arc<Mutex<TokenUsageStats>>,
    /// LLM transport client.
    pub llm: Arc<LlmClient>,
    /// Tool registry.
    pub tools: Arc<ToolRegistry>,
    /// Inbox ingestor registry.
    pub ingestors: Arc<IngestorRegistry>,
    /// Pool of external-tool sessions.
    pub sessions: Arc<SessionPool>,
    /// Fired when a Principal flow finishes.
    pub principal_completion: Arc<Notify>,
    /// Handle of the running Principal task, if any.
    pub principal_task: Mutex<Option<JoinHandle<()>>>,
    /// Cancel token of the running Principal task, if any.
    pub principal_cancel: Mutex<Option<CancellationToken>>,
}

/// References to the active sub-contexts of a run.
#[derive(Default)]
pub struct SubContextRefs {
    /// The Partner, for partner-interaction runs.
    pub partner: Option<Arc<SubContext>>,
    /// The current Principal.
    pub principal: Option<Arc<SubContext>>,
    /// Running Associates keyed by associate id.
    pub ongoing_associates: BTreeMap<String, Arc<SubContext>>,
}

/// The root, process-wide object for one business run.
pub struct RunContext {
    /// Immutable identity.
    pub meta: RunMeta,
    /// Mutable lifecycle status.
    pub status: Mutex<RunStatus>,
    /// Frozen configuration.
    pub config: RunConfig,
    /// The shared team ledger.
    pub team: Mutex<TeamState>,
    /// Run-scoped singletons.
    pub runtime: RunRuntime,
    /// Active sub-context references.
    pub subcontexts: Mutex<SubContextRefs>,
    /// Persistence partition.
    pub project_id: String,
}

/// The tool call an agent has chosen to make this iteration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CurrentAction {
    /// Tool name.
    pub tool_name: String,
    /// Provider-assigned call id.
    pub tool_call_id: String,
    /// Parsed arguments.
    pub arguments: Map<String, Value>,
    /// Implementation kind from the registry.
    pub implementation: ToolImplementation,
}

/// Terminal outcome recorded by the flow decider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowOutcome {
    /// Outcome label.
    pub outcome: String,
    /// Optional message/error detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Private, serializable per-agent state.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AgentState {
    /// Persistent LLM message history.
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    /// Pending inbox items.
    #[serde(default)]
    pub inbox: Vec<InboxItem>,
    /// Boolean-ish agent flags (`initial_briefing_delivered`, ...).
    #[serde(default)]
    pub flags: Map<String, Value>,
    /// The currently chosen tool call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_action: Option<CurrentAction>,
    /// Id of the in-flight turn.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_turn_id: Option<String>,
    /// Tool call id of the in-flight action.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_tool_call_id: Option<String>,
    /// The baton: the last turn this agent's next turn chains to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_turn_id: Option<String>,
    /// Deliverables written by flow-ending tools.
    #[serde(default)]
    pub deliverables: Map<String, Value>,
    /// Parameters the agent was started with (module id, instructions...).
    #[serde(default)]
    pub initial_parameters: Map<String, Value>,
    /// Principal relaunch iteration counter.
    #[serde(default)]
    pub current_iteration_count: u32,
    /// Consecutive empty LLM responses seen.
    #[serde(default)]
    pub consecutive_empty_llm_responses: u32,
    /// Message histories archived on relaunch / forced termination.
    #[serde(default)]
    pub archived_messages_history: Vec<Value>,
    /// Status summary the Partner reads.
    #[serde(default)]
    pub status_summary_for_partner: Map<String, Value>,
    /// When the agent started.
    #[serde(default)]
    pub agent_start_utc_timestamp: String,
    /// Associate-only: toolset override for this dispatch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_toolsets: Option<Vec<String>>,
    /// Terminal error message, when the flow failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Final result package written by `finish_flow`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_result_package: Option<Value>,
    /// Outcome recorded by the flow decider's `end_agent_turn`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_outcome: Option<FlowOutcome>,
    /// Open keys written by `update_state` observers.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Fresh agent state with the start timestamp set.
pub fn fresh_agent_state() -> AgentState {
    AgentState {
        agent_start_utc_timestamp: ids::now_iso(),
        ..AgentState::default()
    }
}

/// Identity and bindings of one agent.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SubMeta {
    /// Owning run.
    pub run_id: String,
    /// Agent id (`Partner`, `Principal`, `Assoc_...`).
    pub agent_id: String,
    /// Spawning agent, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_agent_id: Option<String>,
    /// Role name assigned at dispatch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_role_name: Option<String>,
    /// Logical profile name driving this agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_logical_name: Option<String>,
    /// Bound profile instance id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_instance_id: Option<String>,
    /// Associate-only: the work module being executed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module_id: Option<String>,
    /// Associate-only: the dispatch tool call that launched it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatch_tool_call_id_ref: Option<String>,
}

/// Non-serializable per-agent signals.
#[derive(Default)]
pub struct SubRuntime {
    /// Partner: fired when new user input lands in the inbox.
    pub new_user_input: Notify,
    /// External-tool session borrowed for the current flow.
    pub external_session: Mutex<Option<Arc<dyn crate::tools::proxy::ExternalSession>>>,
}

/// Per-agent context: private state plus non-owning run references.
pub struct SubContext {
    /// Identity and bindings.
    pub meta: SubMeta,
    /// Private state, owned by the agent's task.
    pub state: Mutex<AgentState>,
    /// Per-agent runtime signals.
    pub runtime: SubRuntime,
    /// Non-owning pointer back to the run.
    pub run: Weak<RunContext>,
}

impl SubContext {
    /// Upgrade the back-reference. Fails only during teardown.
    pub fn run_ctx(&self) -> Option<Arc<RunContext>> {
        self.run.upgrade()
    }

    /// Push an inbox item onto this agent's inbox.
    pub fn push_inbox(&self, item: InboxItem) {
        self.state.lock().inbox.push(item);
    }
}

impl RunContext {
    /// The active Principal sub-context, if any.
    pub fn principal(&self) -> Option<Arc<SubContext>> {
        self.subcontexts.lock().principal.clone()
    }

    /// The Partner sub-context, if any.
    pub fn partner(&self) -> Option<Arc<SubContext>> {
        self.subcontexts.lock().partner.clone()
    }
}

/// A point-in-time [`ContextPaths`] view over one agent's context.
///
/// Namespace roots are serialized on demand; never construct one while
/// holding the state or team lock.
pub struct ContextView {
    sub: Arc<SubContext>,
}

impl ContextView {
    /// View for an agent.
    pub fn new(sub: &Arc<SubContext>) -> Self {
        Self {
            sub: Arc::clone(sub),
        }
    }
}

impl ContextPaths for ContextView {
    fn namespace(&self, prefix: &str) -> Option<Value> {
        let state_value = || serde_json::to_value(&*self.sub.state.lock()).ok();
        match prefix {
            "state" => state_value(),
            "meta" => serde_json::to_value(&self.sub.meta).ok(),
            "initial_params" => state_value().and_then(|v| v.get("initial_parameters").cloned()),
            "flags" => state_value().and_then(|v| v.get("flags").cloned()),
            "team" => {
                let run = self.sub.run_ctx()?;
                let team = run.team.lock();
                serde_json::to_value(&*team).ok()
            }
            "run" => {
                let run = self.sub.run_ctx()?;
                let status = *run.status.lock();
                Some(json!({
                    "run_id": run.meta.run_id,
                    "run_type": run.meta.run_type,
                    "creation_timestamp": run.meta.creation_timestamp,
                    "status": status,
                }))
            }
            "config" => {
                let run = self.sub.run_ctx()?;
                let profiles: Map<String, Value> = run
                    .config
                    .profiles
                    .all_profiles()
                    .map(|p| {
                        (
                            p.profile_id.clone(),
                            json!({
                                "name": p.name,
                                "type": p.profile_type,
                                "is_active": p.is_active,
                                "available_for_staffing": p.available_for_staffing,
                            }),
                        )
                    })
                    .collect();
                Some(json!({ "agent_profiles": profiles }))
            }
            "principal" => {
                let run = self.sub.run_ctx()?;
                let principal = run.principal()?;
                let state = principal.state.lock();
                serde_json::to_value(&*state).ok()
            }
            "partner" => {
                let run = self.sub.run_ctx()?;
                let partner = run.partner()?;
                let state = partner.state.lock();
                serde_json::to_value(&*state).ok()
            }
            _ => None,
        }
    }
}
