//! Run orchestration: context creation and the three agent flows.
//!
//! - **Partner flow**: loops forever, waking on new user input or
//!   Principal completion, running one agent-loop session per wake.
//! - **Principal flow**: one session to termination, bracketed by a
//!   session record and a pooled external-tool session; its completion
//!   callback briefs the Partner and resets the running flag.
//! - **Associate flow**: one session to termination on behalf of the
//!   dispatcher, which collects deliverables afterwards.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use troika_core::events::{RunEvent, TokenUsageStats};
use troika_core::ids;
use troika_core::inbox::{InboxItem, source};
use troika_core::team::{DispatchStatus, PrincipalSession, TeamState};
use troika_kb::KnowledgeBase;
use troika_llm::{LlmClient, LlmConfigCatalog};
use troika_profiles::{AppConfig, ProfileStore};

use crate::agent_loop::{AgentLoop, SessionEnd};
use crate::context::{
    RunConfig, RunContext, RunMeta, RunRuntime, RunStatus, RunType, SubContext, SubContextRefs,
    SubMeta, SubRuntime, fresh_agent_state,
};
use crate::emitter::EventEmitter;
use crate::errors::RuntimeError;
use crate::ingestors::IngestorRegistry;
use crate::tools::ToolRegistry;
use crate::tools::proxy::SessionPool;
use crate::turn_manager::TurnManager;
use crate::views;

/// Process-wide handles shared by every run this orchestrator creates.
pub struct RunOrchestrator {
    /// LLM transport client.
    pub llm: Arc<LlmClient>,
    /// Tool registry.
    pub tools: Arc<ToolRegistry>,
    /// Ingestor registry.
    pub ingestors: Arc<IngestorRegistry>,
    /// External-session pool.
    pub sessions: Arc<SessionPool>,
    /// Process settings.
    pub app: AppConfig,
}

impl RunOrchestrator {
    /// Create a run context and pre-create the initial sub-context for
    /// its run type.
    pub fn create_run(
        &self,
        run_type: RunType,
        question: Option<String>,
        project_id: impl Into<String>,
        profiles: ProfileStore,
        llm_configs: LlmConfigCatalog,
    ) -> Arc<RunContext> {
        let run_id = ids::run_id();
        info!(run_id, ?run_type, "run context created");

        let mut team = TeamState::default();
        team.question.clone_from(&question);
        if run_type == RunType::PartnerInteraction {
            team.profiles_list_instance_ids = profiles.staffable_associate_ids();
        }

        let run = Arc::new(RunContext {
            meta: RunMeta {
                run_id: run_id.clone(),
                run_type,
                creation_timestamp: ids::now_iso(),
            },
            status: Mutex::new(RunStatus::Created),
            config: RunConfig {
                profiles,
                llm_configs,
                app: self.app.clone(),
            },
            team: Mutex::new(team),
            runtime: RunRuntime {
                emitter: Arc::new(EventEmitter::new()),
                kb: Arc::new(Mutex::new(KnowledgeBase::new(run_id))),
                usage: Arc::new(Mutex::new(TokenUsageStats::default())),
                llm: Arc::clone(&self.llm),
                tools: Arc::clone(&self.tools),
                ingestors: Arc::clone(&self.ingestors),
                sessions: Arc::clone(&self.sessions),
                principal_completion: Arc::new(tokio::sync::Notify::new()),
                principal_task: Mutex::new(None),
                principal_cancel: Mutex::new(None),
            },
            subcontexts: Mutex::new(SubContextRefs::default()),
            project_id: project_id.into(),
        });

        match run_type {
            RunType::PartnerInteraction => {
                let _ = create_partner_context(&run, question.as_deref());
            }
            RunType::PrincipalDirect => {
                // Direct runs staff every available associate unless the
                // caller re-creates the context with an explicit list.
                let staffed = run.config.profiles.staffable_associate_ids();
                let _ = create_principal_context(&run, staffed, None);
            }
            RunType::Service => {}
        }
        run
    }

    /// Deliver a new user message to the Partner: inbox item plus wakeup.
    pub fn submit_user_message(&self, run: &Arc<RunContext>, text: &str) {
        {
            let mut team = run.team.lock();
            if team.question.is_none() {
                team.question = Some(text.to_string());
            }
        }
        if let Some(partner) = run.partner() {
            partner.push_inbox(InboxItem::new(source::USER_PROMPT, json!({"prompt": text})));
            partner.runtime.new_user_input.notify_one();
            info!(run_id = %run.meta.run_id, "user message delivered to partner");
        } else {
            warn!(run_id = %run.meta.run_id, "no partner context; user message dropped");
        }
    }
}

/// Create and register the Partner sub-context. The initial question, if
/// present, is seeded as a USER_PROMPT with the wakeup already armed.
pub fn create_partner_context(run: &Arc<RunContext>, question: Option<&str>) -> Arc<SubContext> {
    let mut state = fresh_agent_state();
    if let Some(question) = question {
        state
            .inbox
            .push(InboxItem::new(source::USER_PROMPT, json!({"prompt": question})));
    }
    let partner = Arc::new(SubContext {
        meta: SubMeta {
            run_id: run.meta.run_id.clone(),
            agent_id: "Partner".into(),
            profile_logical_name: Some("Partner".into()),
            ..SubMeta::default()
        },
        state: Mutex::new(state),
        runtime: SubRuntime::default(),
        run: Arc::downgrade(run),
    });
    if question.is_some() {
        partner.runtime.new_user_input.notify_one();
    }
    run.subcontexts.lock().partner = Some(Arc::clone(&partner));
    partner
}

/// Create and register a fresh Principal sub-context. `baton` chains the
/// Principal's first turn (used after a forced restart, where it is the
/// delimiter turn id).
pub fn create_principal_context(
    run: &Arc<RunContext>,
    staffed_profile_ids: Vec<String>,
    baton: Option<String>,
) -> Arc<SubContext> {
    {
        let mut team = run.team.lock();
        team.profiles_list_instance_ids = staffed_profile_ids;
    }
    let mut state = fresh_agent_state();
    state.last_turn_id = baton;
    let principal = Arc::new(SubContext {
        meta: SubMeta {
            run_id: run.meta.run_id.clone(),
            agent_id: "Principal".into(),
            parent_agent_id: run.partner().map(|p| p.meta.agent_id.clone()),
            profile_logical_name: Some("Principal".into()),
            ..SubMeta::default()
        },
        state: Mutex::new(state),
        runtime: SubRuntime::default(),
        run: Arc::downgrade(run),
    });
    run.subcontexts.lock().principal = Some(Arc::clone(&principal));
    principal
}

/// The Partner flow: wait for user input or Principal completion, run one
/// session pass, re-await. Runs until cancelled.
#[instrument(skip_all, fields(run_id = %run.meta.run_id))]
pub async fn run_partner_flow(
    run: &Arc<RunContext>,
    partner: &Arc<SubContext>,
    cancel: &CancellationToken,
) -> Result<(), RuntimeError> {
    let agent_loop = AgentLoop::new(Arc::clone(run), Arc::clone(partner))?;
    *run.status.lock() = RunStatus::Running;

    loop {
        info!("partner waiting for events");
        *run.status.lock() = RunStatus::AwaitingInput;
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                info!("partner flow cancelled");
                TurnManager.cancel_current_turn(run);
                views::emit_turns_sync(run);
                *run.status.lock() = RunStatus::Cancelled;
                return Ok(());
            }
            () = partner.runtime.new_user_input.notified() => {
                info!("partner reactivated by user input");
            }
            () = run.runtime.principal_completion.notified() => {
                info!("partner reactivated by principal completion");
            }
        }
        *run.status.lock() = RunStatus::Running;

        match agent_loop.run_session(cancel).await {
            SessionEnd::AwaitUserInput | SessionEnd::Completed => {}
            SessionEnd::Cancelled => {
                *run.status.lock() = RunStatus::Cancelled;
                return Ok(());
            }
            SessionEnd::Error(message) => {
                error!(message, "partner flow error");
                *run.status.lock() = RunStatus::Failed;
                return Err(RuntimeError::Flow(message));
            }
        }
    }
}

/// The Principal flow: one session to termination, with session-record
/// bookkeeping, pooled external-tool bracketing, and the completion
/// callback that wakes the Partner.
#[instrument(skip_all, fields(run_id = %run.meta.run_id))]
pub async fn run_principal_flow(
    run: &Arc<RunContext>,
    principal: &Arc<SubContext>,
    cancel: &CancellationToken,
) -> SessionEnd {
    {
        let mut team = run.team.lock();
        let session_id = format!(
            "principal_session_{}",
            team.principal_execution_sessions.len() + 1
        );
        team.principal_execution_sessions.push(PrincipalSession {
            session_id,
            start_time: ids::now_iso(),
            end_time: None,
            termination_reason: None,
        });
        team.is_principal_flow_running = true;
    }
    info!("principal flow session started");

    let external_session = run.runtime.sessions.acquire().await;
    if let Some(session) = &external_session {
        *principal.runtime.external_session.lock() = Some(Arc::clone(session));
    } else {
        warn!("no external-tool session available for principal flow");
    }

    let end = match AgentLoop::new(Arc::clone(run), Arc::clone(principal)) {
        Ok(agent_loop) => agent_loop.run_session(cancel).await,
        Err(e) => {
            error!(error = %e, "principal loop could not be bound");
            SessionEnd::Error(e.to_string())
        }
    };

    // Teardown, in order: release the session, close the session record,
    // reset the running flag, brief the Partner, wake it.
    if let Some(session) = principal.runtime.external_session.lock().take() {
        run.runtime.sessions.release(session);
    }

    let termination_reason = match &end {
        SessionEnd::Completed => "completed".to_string(),
        SessionEnd::Cancelled => "cancelled".to_string(),
        SessionEnd::Error(message) => format!("error: {message}"),
        SessionEnd::AwaitUserInput => "unexpected_await_user_input".to_string(),
    };
    {
        let mut team = run.team.lock();
        if let Some(record) = team.principal_execution_sessions.last_mut() {
            record.end_time = Some(ids::now_iso());
            record.termination_reason = Some(termination_reason.clone());
        }
        team.is_principal_flow_running = false;
    }

    let completion_payload = {
        let state = principal.state.lock();
        state.final_result_package.clone().unwrap_or_else(|| {
            json!({
                "status": match &end {
                    SessionEnd::Completed => "COMPLETED",
                    SessionEnd::Cancelled => "CANCELLED",
                    _ => "COMPLETED_WITH_ERROR",
                },
                "final_summary": state
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "Principal flow concluded.".to_string()),
                "deliverables": state.deliverables,
            })
        })
    };
    if let Some(partner) = run.partner() {
        partner.push_inbox(InboxItem::new(source::PRINCIPAL_COMPLETED, completion_payload));
    }
    run.runtime.principal_completion.notify_one();
    info!(termination_reason, "principal completion signalled");

    views::emit_view_update(run, troika_core::events::ViewName::FlowView);
    views::emit_view_update(run, troika_core::events::ViewName::KanbanView);
    views::emit_turns_sync(run);
    end
}

/// Spawn the Principal flow as a task, recording its handle and cancel
/// token on the run so a forced restart can terminate it.
pub fn spawn_principal_flow(run: &Arc<RunContext>, principal: &Arc<SubContext>) -> CancellationToken {
    let token = CancellationToken::new();
    let task_run = Arc::clone(run);
    let task_principal = Arc::clone(principal);
    let task_token = token.clone();
    let handle = tokio::spawn(async move {
        let _ = run_principal_flow(&task_run, &task_principal, &task_token).await;
    });
    *run.runtime.principal_task.lock() = Some(handle);
    *run.runtime.principal_cancel.lock() = Some(token.clone());
    token
}

/// The Associate flow: one session to termination on behalf of the
/// dispatcher. The dispatch record transitions LAUNCHING → RUNNING here.
#[instrument(skip_all, fields(associate_id = %associate.meta.agent_id))]
pub async fn run_associate_flow(
    run: &Arc<RunContext>,
    associate: &Arc<SubContext>,
    cancel: &CancellationToken,
) -> SessionEnd {
    {
        let mut team = run.team.lock();
        match team
            .dispatch_history
            .iter_mut()
            .rev()
            .find(|r| r.dispatch_id == associate.meta.agent_id && r.status == DispatchStatus::Launching)
        {
            Some(record) => {
                record.status = DispatchStatus::Running;
                record.start_timestamp = Some(ids::now_iso());
            }
            None => {
                error!("dispatch record in LAUNCHING state not found");
            }
        }
    }

    let external_session = run.runtime.sessions.acquire().await;
    if let Some(session) = &external_session {
        *associate.runtime.external_session.lock() = Some(Arc::clone(session));
    }

    let end = match AgentLoop::new(Arc::clone(run), Arc::clone(associate)) {
        Ok(agent_loop) => agent_loop.run_session(cancel).await,
        Err(e) => {
            error!(error = %e, "associate loop could not be bound");
            SessionEnd::Error(e.to_string())
        }
    };

    {
        let mut state = associate.state.lock();
        match &end {
            SessionEnd::Cancelled => {
                state.error_message = Some("Associate flow was cancelled.".to_string());
                let _ = state
                    .deliverables
                    .insert("error".into(), json!("Flow was cancelled."));
            }
            SessionEnd::Error(message) => {
                state.error_message = Some(message.clone());
                let _ = state
                    .deliverables
                    .insert("error".into(), json!(format!("Flow execution failed: {message}")));
            }
            _ => {}
        }
    }

    if let Some(session) = associate.runtime.external_session.lock().take() {
        run.runtime.sessions.release(session);
    }
    let _ = run.runtime.emitter.emit(RunEvent::TurnsSync {
        run_id: run.meta.run_id.clone(),
        turns: run.team.lock().turns.clone(),
    });
    end
}
