//! # troika-persist
//!
//! Run persistence: JSON snapshots of the serializable `RunContext` slice,
//! written on every `turn_completed` event under a per-run lock, plus a
//! per-project index and restoration with post-restore cleanup.
//!
//! Layout per project, per run:
//!
//! - `<run_id>.run.json` — the full serializable snapshot (team state,
//!   per-agent states, knowledge base)
//! - `<run_id>.meta.json` — minimal metadata
//! - `index.json` — run_id → canonical filename + display slug
//!
//! All writes go through a temp file and an atomic rename; index writes
//! are serialized by a per-project lock. Persistence failures are logged
//! and retried on the next turn, never fatal.

#![deny(unsafe_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use troika_core::events::RunEvent;
use troika_core::team::TeamState;
use troika_core::turn::{LlmInteractionStatus, TurnStatus};
use troika_kb::KnowledgeBase;
use troika_runtime::context::{AgentState, RunContext, RunType, SubContext, SubMeta, SubRuntime};

/// Persistence errors.
#[derive(Debug, Error)]
pub enum PersistError {
    /// Filesystem failure.
    #[error("io error at '{path}': {source}")]
    Io {
        /// Offending path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Snapshot (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Minimal metadata written alongside the snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Run id.
    pub run_id: String,
    /// Persistence partition.
    pub project_id: String,
    /// Run kind.
    pub run_type: RunType,
    /// Creation timestamp.
    pub created_ts: String,
}

/// The full serializable slice of a run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSnapshot {
    /// Metadata.
    pub meta: RunMetadata,
    /// Shared team ledger.
    pub team_state: TeamState,
    /// Per-agent private states keyed by agent id.
    pub sub_states: BTreeMap<String, AgentState>,
    /// Per-agent metas keyed by agent id (for envelope synthesis on
    /// restore).
    pub sub_metas: BTreeMap<String, SubMeta>,
    /// The knowledge base with its indices and token sequence.
    pub knowledge_base: KnowledgeBase,
}

/// One entry in the project index.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Canonical snapshot filename.
    pub file: String,
    /// Display slug proposed by the namer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
}

/// Proposes a human-readable slug for a run, typically via a fast utility
/// LLM. The default implementation derives one from the question text.
#[async_trait::async_trait]
pub trait RunNamer: Send + Sync {
    /// Suggest a slug for the run.
    async fn suggest_slug(&self, question: &str) -> Option<String>;
}

/// Derive a filesystem-safe slug from free text.
pub fn slugify(text: &str) -> String {
    let slug: String = text
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .take(6)
        .collect::<Vec<_>>()
        .join("-");
    if slug.is_empty() {
        "untitled-run".to_string()
    } else {
        slug
    }
}

/// Capture the serializable slice of a run.
pub fn snapshot_run(run: &Arc<RunContext>) -> RunSnapshot {
    let team_state = run.team.lock().clone();
    let knowledge_base = run.runtime.kb.lock().clone();

    let mut sub_states = BTreeMap::new();
    let mut sub_metas = BTreeMap::new();
    let mut capture = |sub: &Arc<SubContext>| {
        let _ = sub_states.insert(sub.meta.agent_id.clone(), sub.state.lock().clone());
        let _ = sub_metas.insert(sub.meta.agent_id.clone(), sub.meta.clone());
    };
    {
        let refs = run.subcontexts.lock();
        if let Some(partner) = &refs.partner {
            capture(partner);
        }
        if let Some(principal) = &refs.principal {
            capture(principal);
        }
        for associate in refs.ongoing_associates.values() {
            capture(associate);
        }
    }

    RunSnapshot {
        meta: RunMetadata {
            run_id: run.meta.run_id.clone(),
            project_id: run.project_id.clone(),
            run_type: run.meta.run_type,
            created_ts: run.meta.creation_timestamp.clone(),
        },
        team_state,
        sub_states,
        sub_metas,
        knowledge_base,
    }
}

/// Inject a snapshot into a freshly created run context: team state, the
/// rebuilt knowledge base, and per-agent states (attached to pre-created
/// sub-contexts where they exist, synthesized envelopes otherwise).
///
/// Post-restore cleanup: running turns become `interrupted`, running LLM
/// interactions become `error`, and the principal-flow flag resets.
pub fn apply_snapshot(run: &Arc<RunContext>, snapshot: RunSnapshot) {
    {
        let mut team = run.team.lock();
        *team = snapshot.team_state;
        let now = troika_core::ids::now_iso();
        for turn in &mut team.turns {
            if turn.status == TurnStatus::Running {
                turn.status = TurnStatus::Interrupted;
                turn.end_time = Some(now.clone());
                turn.error_details
                    .get_or_insert_with(|| "Run was restored from a snapshot.".to_string());
            }
            if let Some(llm) = &mut turn.llm_interaction {
                if llm.status == LlmInteractionStatus::Running {
                    llm.status = LlmInteractionStatus::Error;
                }
            }
        }
        team.is_principal_flow_running = false;
    }
    *run.runtime.kb.lock() = snapshot.knowledge_base;

    for (agent_id, state) in snapshot.sub_states {
        let existing = {
            let refs = run.subcontexts.lock();
            refs.partner
                .iter()
                .chain(refs.principal.iter())
                .chain(refs.ongoing_associates.values())
                .find(|s| s.meta.agent_id == agent_id)
                .cloned()
        };
        match existing {
            Some(sub) => {
                *sub.state.lock() = state;
            }
            None => {
                // Synthesize an envelope pointing back at the new run
                let meta = snapshot
                    .sub_metas
                    .get(&agent_id)
                    .cloned()
                    .unwrap_or_else(|| SubMeta {
                        run_id: run.meta.run_id.clone(),
                        agent_id: agent_id.clone(),
                        ..SubMeta::default()
                    });
                let sub = Arc::new(SubContext {
                    meta,
                    state: parking_lot::Mutex::new(state),
                    runtime: SubRuntime::default(),
                    run: Arc::downgrade(run),
                });
                let mut refs = run.subcontexts.lock();
                if agent_id == "Partner" {
                    refs.partner = Some(sub);
                } else if agent_id == "Principal" {
                    refs.principal = Some(sub);
                } else {
                    let _ = refs.ongoing_associates.insert(agent_id, sub);
                }
            }
        }
    }
    info!(run_id = %run.meta.run_id, "snapshot applied with post-restore cleanup");
}

/// The persistence hook: subscribes to a run's events and snapshots on
/// every completed turn.
pub struct PersistenceHook {
    root: PathBuf,
    run_locks: DashMap<String, Arc<Mutex<()>>>,
    project_locks: DashMap<String, Arc<Mutex<()>>>,
    namer: Option<Arc<dyn RunNamer>>,
}

impl PersistenceHook {
    /// Hook writing under the given project root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            run_locks: DashMap::new(),
            project_locks: DashMap::new(),
            namer: None,
        }
    }

    /// Attach an intelligent namer.
    pub fn with_namer(mut self, namer: Arc<dyn RunNamer>) -> Self {
        self.namer = Some(namer);
        self
    }

    fn project_dir(&self, project_id: &str) -> PathBuf {
        self.root.join(project_id)
    }

    fn run_lock(&self, run_id: &str) -> Arc<Mutex<()>> {
        self.run_locks
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn project_lock(&self, project_id: &str) -> Arc<Mutex<()>> {
        self.project_locks
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Subscribe to the run's event stream and snapshot on every
    /// `turn_completed`. Returns the listener task handle; the task ends
    /// when the run (and its emitter) is dropped.
    pub fn attach(self: &Arc<Self>, run: &Arc<RunContext>) -> tokio::task::JoinHandle<()> {
        let mut rx = run.runtime.emitter.subscribe();
        let hook = Arc::clone(self);
        let weak_run: Weak<RunContext> = Arc::downgrade(run);
        tokio::spawn(async move {
            let mut initialized = false;
            loop {
                match rx.recv().await {
                    Ok(RunEvent::TurnCompleted { .. }) => {
                        let Some(run) = weak_run.upgrade() else { break };
                        if !initialized {
                            initialized = true;
                            hook.initialize_run(&run).await;
                        }
                        if let Err(e) = hook.save(&run).await {
                            error!(error = %e, "snapshot write failed; will retry next turn");
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "persistence listener lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("persistence listener ended");
        })
    }

    /// First-snapshot initialization: create paths and schedule the
    /// intelligent-naming pass that records a slug in the index.
    async fn initialize_run(self: &Arc<Self>, run: &Arc<RunContext>) {
        let dir = self.project_dir(&run.project_id);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            error!(error = %e, path = %dir.display(), "could not create project directory");
            return;
        }

        let question = run.team.lock().question.clone().unwrap_or_default();
        let hook = Arc::clone(self);
        let run_id = run.meta.run_id.clone();
        let project_id = run.project_id.clone();
        let namer = self.namer.clone();
        let _ = tokio::spawn(async move {
            let slug = match &namer {
                Some(namer) => namer.suggest_slug(&question).await,
                None => None,
            }
            .unwrap_or_else(|| slugify(&question));
            if let Err(e) = hook.record_slug(&project_id, &run_id, &slug).await {
                warn!(error = %e, "slug could not be recorded in the index");
            }
        });
    }

    /// Snapshot the run: `<run_id>.run.json` + `<run_id>.meta.json`,
    /// atomically, under the per-run lock, then reconcile the index.
    pub async fn save(&self, run: &Arc<RunContext>) -> Result<(), PersistError> {
        let lock = self.run_lock(&run.meta.run_id);
        let _guard = lock.lock().await;

        let snapshot = snapshot_run(run);
        let dir = self.project_dir(&run.project_id);
        ensure_dir(&dir)?;

        let snapshot_name = format!("{}.run.json", snapshot.meta.run_id);
        write_json_atomic(&dir.join(&snapshot_name), &serde_json::to_value(&snapshot)?)?;
        write_json_atomic(
            &dir.join(format!("{}.meta.json", snapshot.meta.run_id)),
            &serde_json::to_value(&snapshot.meta)?,
        )?;

        self.update_index(&run.project_id, &run.meta.run_id, |entry| {
            entry.file = snapshot_name.clone();
        })
        .await?;
        debug!(run_id = %run.meta.run_id, "snapshot written");
        Ok(())
    }

    /// Load a snapshot back from disk.
    pub fn load(&self, project_id: &str, run_id: &str) -> Result<RunSnapshot, PersistError> {
        let path = self.project_dir(project_id).join(format!("{run_id}.run.json"));
        let text = std::fs::read_to_string(&path).map_err(|source| PersistError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// The current project index.
    pub fn read_index(&self, project_id: &str) -> BTreeMap<String, IndexEntry> {
        let path = self.project_dir(project_id).join("index.json");
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default()
    }

    async fn record_slug(&self, project_id: &str, run_id: &str, slug: &str) -> Result<(), PersistError> {
        self.update_index(project_id, run_id, |entry| {
            entry.slug = Some(slug.to_string());
        })
        .await
    }

    async fn update_index<F: FnOnce(&mut IndexEntry)>(
        &self,
        project_id: &str,
        run_id: &str,
        mutate: F,
    ) -> Result<(), PersistError> {
        let lock = self.project_lock(project_id);
        let _guard = lock.lock().await;

        let dir = self.project_dir(project_id);
        ensure_dir(&dir)?;
        let mut index = self.read_index(project_id);
        let entry = index.entry(run_id.to_string()).or_default();
        mutate(entry);

        let as_value: Map<String, Value> = index
            .into_iter()
            .map(|(k, v)| (k, serde_json::to_value(v).unwrap_or(Value::Null)))
            .collect();
        write_json_atomic(&dir.join("index.json"), &Value::Object(as_value))?;
        Ok(())
    }
}

fn ensure_dir(dir: &Path) -> Result<(), PersistError> {
    std::fs::create_dir_all(dir).map_err(|source| PersistError::Io {
        path: dir.display().to_string(),
        source,
    })
}

/// Write JSON through a temp file in the same directory plus an atomic
/// rename.
fn write_json_atomic(path: &Path, value: &Value) -> Result<(), PersistError> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|source| PersistError::Io {
        path: dir.display().to_string(),
        source,
    })?;
    use std::io::Write as _;
    tmp.write_all(serde_json::to_string_pretty(value)?.as_bytes())
        .map_err(|source| PersistError::Io {
            path: path.display().to_string(),
            source,
        })?;
    let _ = tmp.persist(path).map_err(|e| PersistError::Io {
        path: path.display().to_string(),
        source: e.error,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use troika_core::events::RunEvent;
    use troika_runtime::testutil;
    use troika_runtime::turn_manager::TurnManager;

    fn hook_in_tempdir() -> (Arc<PersistenceHook>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (Arc::new(PersistenceHook::new(dir.path())), dir)
    }

    #[test]
    fn slugify_samples() {
        assert_eq!(slugify("What is Rust?"), "what-is-rust");
        assert_eq!(slugify("  !!  "), "untitled-run");
        assert_eq!(
            slugify("one two three four five six seven eight"),
            "one-two-three-four-five-six"
        );
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let (hook, _dir) = hook_in_tempdir();
        let (run, partner) = testutil::partner_run("persist me");
        let tm = TurnManager;
        let _ = tm.start_new_turn(&run, &partner, "s1");
        tm.finalize_current_turn(&run, &partner, "default");
        {
            let mut kb = run.runtime.kb.lock();
            let _ = kb.store_with_token(serde_json::json!("payload"), Default::default());
        }

        hook.save(&run).await.unwrap();
        let snapshot = hook.load("project_test", &run.meta.run_id).unwrap();

        assert_eq!(snapshot.meta.run_id, run.meta.run_id);
        assert_eq!(snapshot.team_state.turns.len(), 1);
        assert!(snapshot.sub_states.contains_key("Partner"));
        assert_eq!(snapshot.knowledge_base.next_sequence, 2);

        let index = hook.read_index("project_test");
        assert_eq!(
            index[&run.meta.run_id].file,
            format!("{}.run.json", run.meta.run_id)
        );
    }

    #[tokio::test]
    async fn apply_snapshot_cleans_running_state() {
        let (hook, _dir) = hook_in_tempdir();
        let (run, partner) = testutil::partner_run("restore me");
        let tm = TurnManager;
        // Leave a running turn behind
        let turn_id = tm.start_new_turn(&run, &partner, "s1");
        run.team.lock().is_principal_flow_running = true;

        hook.save(&run).await.unwrap();
        let snapshot = hook.load("project_test", &run.meta.run_id).unwrap();

        let (fresh_run, _fresh_partner) = testutil::partner_run("placeholder");
        apply_snapshot(&fresh_run, snapshot);

        let team = fresh_run.team.lock();
        let restored = team.find_turn(&turn_id).unwrap();
        assert_eq!(restored.status, TurnStatus::Interrupted);
        assert_eq!(
            restored.llm_interaction.as_ref().unwrap().status,
            LlmInteractionStatus::Error
        );
        assert!(!team.is_principal_flow_running);
    }

    #[tokio::test]
    async fn apply_snapshot_synthesizes_missing_subcontexts() {
        let (hook, _dir) = hook_in_tempdir();
        let (run, _partner) = testutil::partner_run("q");
        let _principal = testutil::attach_principal(&run);
        hook.save(&run).await.unwrap();
        let snapshot = hook.load("project_test", &run.meta.run_id).unwrap();

        // A fresh run without a principal
        let (fresh_run, _) = testutil::partner_run("q");
        assert!(fresh_run.principal().is_none());
        apply_snapshot(&fresh_run, snapshot);
        assert!(fresh_run.principal().is_some());
    }

    #[tokio::test]
    async fn attached_hook_snapshots_on_turn_completed() {
        let (hook, _dir) = hook_in_tempdir();
        let (run, partner) = testutil::partner_run("watch me");
        let handle = hook.attach(&run);

        let tm = TurnManager;
        let turn_id = tm.start_new_turn(&run, &partner, "s1");
        tm.finalize_current_turn(&run, &partner, "default");
        let _ = run.runtime.emitter.emit(RunEvent::TurnCompleted {
            run_id: run.meta.run_id.clone(),
            agent_id: "Partner".into(),
            turn_id,
        });

        // Give the listener a few cycles to write
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if hook.load("project_test", &run.meta.run_id).is_ok() {
                break;
            }
        }
        let snapshot = hook.load("project_test", &run.meta.run_id).unwrap();
        assert_eq!(snapshot.team_state.turns.len(), 1);

        // Slug eventually lands in the index
        for _ in 0..50 {
            let index = hook.read_index("project_test");
            if index
                .get(&run.meta.run_id)
                .and_then(|e| e.slug.clone())
                .is_some()
            {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let index = hook.read_index("project_test");
        assert_eq!(index[&run.meta.run_id].slug.as_deref(), Some("watch-me"));

        drop(run);
        drop(partner);
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), handle).await;
    }
}
