//! Shared fixtures for runtime tests: a scripted LLM provider, canned
//! profiles, and run-context builders.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use troika_core::tools::{ToolResponse, ToolSpec};
use troika_llm::provider::DeltaStream;
use troika_llm::types::{StreamDelta, ToolCallDelta};
use troika_llm::{ChatProvider, ChatRequest, LlmClient, LlmConfig, LlmConfigCatalog, LlmError};
use troika_profiles::{AgentProfile, HandoverProtocol, ProfileStore};

use crate::context::{RunContext, SubContext};
use crate::dispatcher::DispatchTool;
use crate::ingestors::IngestorRegistry;
use crate::launch_principal::LaunchPrincipalTool;
use crate::orchestrator::{RunOrchestrator, create_principal_context};
use crate::tools::builtin::{
    FinishFlowTool, GetPrincipalStatusTool, ManageWorkModulesTool, SendDirectiveToPrincipalTool,
};
use crate::tools::proxy::SessionPool;
use crate::tools::{Tool, ToolRegistry};

/// One scripted LLM response.
#[derive(Clone, Debug, Default)]
pub struct ScriptedResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<(String, String, String)>,
}

impl ScriptedResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, args: impl Into<String>) -> Self {
        Self {
            content: None,
            tool_calls: vec![(id.into(), name.into(), args.into())],
        }
    }

    fn into_deltas(self) -> Vec<StreamDelta> {
        let mut deltas = Vec::new();
        if let Some(content) = self.content {
            deltas.push(StreamDelta::text(content));
        }
        for (index, (id, name, args)) in self.tool_calls.into_iter().enumerate() {
            deltas.push(StreamDelta {
                tool_calls: vec![ToolCallDelta {
                    index,
                    id: Some(id),
                    name: Some(name),
                    arguments: Some(args),
                }],
                ..StreamDelta::default()
            });
        }
        deltas
    }
}

/// A provider replaying scripted responses in order. Agents asking past
/// the end of the script receive plain text, which ends a default-decider
/// session cleanly. Every request is captured for assertions, and a
/// failure marker can force an unrecoverable error for requests whose
/// serialized messages contain it.
pub struct ScriptedProvider {
    script: Mutex<Vec<ScriptedResponse>>,
    pub calls: AtomicUsize,
    pub requests: Mutex<Vec<ChatRequest>>,
    pub fail_when_contains: Mutex<Option<String>>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<ScriptedResponse>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            fail_when_contains: Mutex::new(None),
        })
    }

    pub fn empty() -> Arc<Self> {
        Self::new(Vec::new())
    }

    pub fn push(&self, response: ScriptedResponse) {
        self.script.lock().push(response);
    }

    pub fn fail_when_contains(&self, marker: impl Into<String>) {
        *self.fail_when_contains.lock() = Some(marker.into());
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    async fn stream_chat(
        &self,
        _config: &LlmConfig,
        request: &ChatRequest,
    ) -> Result<DeltaStream, LlmError> {
        let _ = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        if let Some(marker) = self.fail_when_contains.lock().clone() {
            let serialized = serde_json::to_string(&request.messages).unwrap_or_default();
            if serialized.contains(&marker) {
                return Err(LlmError::Auth(format!("scripted failure on marker '{marker}'")));
            }
        }

        let next = {
            let mut script = self.script.lock();
            if script.is_empty() {
                ScriptedResponse::text("done")
            } else {
                script.remove(0)
            }
        };
        let deltas = next.into_deltas();
        Ok(Box::pin(futures::stream::iter(
            deltas.into_iter().map(Ok::<StreamDelta, LlmError>),
        )) as DeltaStream)
    }
}

/// `echo` — the minimal internal tool used throughout the tests.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "echo",
            "Echo a string back.",
            json!({
                "type": "object",
                "properties": {"s": {"type": "string"}},
                "required": ["s"]
            }),
        )
    }

    async fn execute(
        &self,
        params: Value,
        _run: &Arc<RunContext>,
        _sub: &Arc<SubContext>,
        _cancel: &CancellationToken,
    ) -> ToolResponse {
        let s = params.get("s").and_then(Value::as_str).unwrap_or_default();
        ToolResponse::success(json!({"echoed": s}))
    }
}

fn base_profile(id: &str, name: &str, kind: &str) -> AgentProfile {
    let mut profile: AgentProfile = serde_json::from_value(json!({
        "profile_id": id,
        "name": name,
        "type": kind,
        "llm_config_ref": "main",
        "available_for_staffing": kind == "associate",
    }))
    .expect("static profile json");
    let _ = profile
        .text_definitions
        .insert("reflect".into(), "Reflect on {{ team.question }}".into());
    profile.tool_access_policy.allowed_toolsets = vec![
        "echo".into(),
        "flow_control".into(),
        "planning".into(),
        "dispatch".into(),
        "principal_control".into(),
    ];
    profile.flow_decider = crate::decider::default_rules();
    profile
}

pub fn partner_profile() -> Arc<AgentProfile> {
    Arc::new(base_profile("profile-partner", "Partner", "partner"))
}

pub fn principal_profile() -> Arc<AgentProfile> {
    Arc::new(base_profile("profile-principal", "Principal", "principal"))
}

pub fn associate_profile() -> Arc<AgentProfile> {
    Arc::new(base_profile(
        "profile-assoc-generic",
        "Associate_Generic",
        "associate",
    ))
}

fn briefing_protocol() -> HandoverProtocol {
    serde_json::from_value(json!({
        "protocol_name": "principal_to_associate_briefing",
        "context_parameters": {
            "type": "object",
            "properties": {
                "module_id_to_assign": {
                    "type": "string",
                    "description": "Id of the work module to execute.",
                    "x-handover-title": "Module Id"
                },
                "assignment_specific_instructions": {
                    "type": "string",
                    "description": "Instructions for this assignment.",
                    "x-handover-title": "Instructions"
                }
            },
            "required": ["module_id_to_assign"]
        },
        "inheritance": [{
            "from_source": {
                "path": "team.work_modules.{{ module_id }}",
                "replace": {"module_id": "state.current_action.module_id_to_assign"}
            },
            "as_payload_key": "module_details",
            "x-handover-title": "Your Work Module"
        }],
        "target_inbox_item": {"source": "AGENT_STARTUP_BRIEFING"}
    }))
    .expect("static protocol json")
}

fn initial_briefing_protocol() -> HandoverProtocol {
    serde_json::from_value(json!({
        "protocol_name": "partner_to_principal_initial_briefing",
        "context_parameters": {"type": "object", "properties": {}},
        "inheritance": [{
            "from_source": {"path": "team.question", "replace": {}},
            "as_payload_key": "original_question",
            "x-handover-title": "Original Question"
        }],
        "target_inbox_item": {"source": "AGENT_STARTUP_BRIEFING"}
    }))
    .expect("static protocol json")
}

pub fn profile_store() -> ProfileStore {
    ProfileStore::new(
        vec![
            (*partner_profile()).clone(),
            (*principal_profile()).clone(),
            (*associate_profile()).clone(),
        ],
        vec![briefing_protocol(), initial_briefing_protocol()],
    )
}

pub fn llm_catalog() -> LlmConfigCatalog {
    LlmConfigCatalog::new(
        [(
            "main".to_string(),
            json!({"model": "scripted", "max_retries": 1, "wait_seconds_on_retry": 0}),
        )]
        .into_iter()
        .collect(),
    )
}

pub fn orchestrator_with(provider: Arc<dyn ChatProvider>) -> RunOrchestrator {
    let profiles = profile_store();
    let tools = Arc::new(ToolRegistry::new());
    tools.register(Arc::new(EchoTool), &profiles);
    tools.register(Arc::new(FinishFlowTool), &profiles);
    tools.register(Arc::new(ManageWorkModulesTool), &profiles);
    tools.register(Arc::new(GetPrincipalStatusTool), &profiles);
    tools.register(Arc::new(SendDirectiveToPrincipalTool), &profiles);
    tools.register(Arc::new(DispatchTool), &profiles);
    tools.register(Arc::new(LaunchPrincipalTool), &profiles);

    RunOrchestrator {
        llm: Arc::new(LlmClient::new(provider)),
        tools,
        ingestors: Arc::new(IngestorRegistry::with_builtins()),
        sessions: Arc::new(SessionPool::default()),
        app: troika_profiles::AppConfig::default(),
    }
}

/// A partner-interaction run over an empty script. The question lands on
/// team state only — the inbox starts clean so tests can assert on
/// exactly the items they enqueue. Use [`scripted_run`] for the seeded
/// end-to-end shape.
pub fn partner_run(question: &str) -> (Arc<RunContext>, Arc<SubContext>) {
    let orchestrator = orchestrator_with(ScriptedProvider::empty());
    let run = orchestrator.create_run(
        crate::context::RunType::PartnerInteraction,
        None,
        "project_test",
        profile_store(),
        llm_catalog(),
    );
    run.team.lock().question = Some(question.to_string());
    let partner = run.partner().expect("partner pre-created");
    (run, partner)
}

/// A partner-interaction run driven by the given script; returns the
/// provider so tests can inspect call counts or extend the script.
pub fn scripted_run(
    question: &str,
    script: Vec<ScriptedResponse>,
) -> (Arc<RunContext>, Arc<SubContext>, Arc<ScriptedProvider>) {
    let provider = ScriptedProvider::new(script);
    let orchestrator = orchestrator_with(Arc::clone(&provider) as Arc<dyn ChatProvider>);
    let run = orchestrator.create_run(
        crate::context::RunType::PartnerInteraction,
        Some(question.to_string()),
        "project_test",
        profile_store(),
        llm_catalog(),
    );
    let partner = run.partner().expect("partner pre-created");
    (run, partner, provider)
}

/// Attach a Principal sub-context to an existing run.
pub fn attach_principal(run: &Arc<RunContext>) -> Arc<SubContext> {
    create_principal_context(run, vec![], None)
}
