//! Team state — the shared, serializable ledger visible to every agent in a
//! run: the originating question, work modules, the turn ledger, dispatch
//! history, and the staffed profile list.
//!
//! Mutations are confined to the turn manager, the dispatcher, and specific
//! tool nodes; agent code never edits `turns` directly.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids;
use crate::messages::ChatMessage;
use crate::turn::Turn;

/// Work module lifecycle status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleStatus {
    /// Defined, not yet dispatched.
    #[default]
    Pending,
    /// Being refined by the Principal.
    InProgress,
    /// An Associate is executing it right now.
    Ongoing,
    /// An Associate finished; awaiting Principal review.
    PendingReview,
    /// Reviewed and accepted.
    Completed,
    /// Abandoned.
    Deprecated,
}

impl ModuleStatus {
    /// Whether a module in this status may be handed to an Associate.
    pub fn is_dispatchable(self) -> bool {
        matches!(self, ModuleStatus::Pending | ModuleStatus::PendingReview)
    }
}

/// Outcome of one assignee stint on a module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssigneeOutcome {
    /// Still executing.
    Running,
    /// Finished successfully.
    CompletedSuccess,
    /// Finished with an error.
    CompletedError,
}

/// One entry in a module's assignee history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssigneeEntry {
    /// Dispatch id (also the Associate's agent id).
    pub dispatch_id: String,
    /// Agent id of the assignee.
    pub agent_id: String,
    /// Start time.
    pub started_at: String,
    /// End time, set on close.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
    /// Stint outcome.
    pub outcome: AssigneeOutcome,
}

/// Archived context from one dispatch stint: the Associate's full message
/// history plus its deliverables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextArchiveEntry {
    /// Dispatch id the archive belongs to.
    pub dispatch_id: String,
    /// Archive time.
    pub archived_at: String,
    /// Full message history.
    pub messages: Vec<ChatMessage>,
    /// Deliverables recorded by the Associate.
    pub deliverables: Value,
}

/// Review metadata populated when an Associate finishes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReviewInfo {
    /// What triggered the review (`associate_completed` / `associate_failed`).
    pub trigger: String,
    /// Human-oriented summary line.
    pub message: String,
    /// Error detail for failed stints.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
}

/// A delegatable unit of work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkModule {
    /// Module id of form `WM_<n>`.
    pub module_id: String,
    /// Short name.
    pub name: String,
    /// What needs doing.
    pub description: String,
    /// Free-form notes maintained by the Principal.
    #[serde(default)]
    pub notes: String,
    /// Lifecycle status.
    pub status: ModuleStatus,
    /// Creation time.
    pub created_at: String,
    /// Last update time.
    pub updated_at: String,
    /// Every assignee stint, in order.
    #[serde(default)]
    pub assignee_history: Vec<AssigneeEntry>,
    /// Archived message histories per dispatch.
    #[serde(default)]
    pub context_archive: Vec<ContextArchiveEntry>,
    /// Review info from the latest stint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_info: Option<ReviewInfo>,
}

impl WorkModule {
    /// A fresh pending module.
    pub fn new(module_id: impl Into<String>, name: impl Into<String>, description: impl Into<String>) -> Self {
        let now = ids::now_iso();
        Self {
            module_id: module_id.into(),
            name: name.into(),
            description: description.into(),
            notes: String::new(),
            status: ModuleStatus::Pending,
            created_at: now.clone(),
            updated_at: now,
            assignee_history: Vec::new(),
            context_archive: Vec::new(),
            review_info: None,
        }
    }

    /// The running assignee entry, if one exists. The module invariant
    /// permits at most one at a time.
    pub fn running_assignee(&self) -> Option<&AssigneeEntry> {
        self.assignee_history
            .iter()
            .find(|e| e.outcome == AssigneeOutcome::Running)
    }
}

/// Dispatch record status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchStatus {
    /// Assignment accepted, Associate not yet started.
    Launching,
    /// Associate flow running.
    Running,
    /// Associate finished successfully.
    CompletedSuccess,
    /// Associate finished with an error.
    CompletedError,
}

/// Audit entry for one Associate launch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DispatchRecord {
    /// Dispatch id (the Associate's agent id).
    pub dispatch_id: String,
    /// The dispatch tool call that caused the launch.
    pub dispatch_tool_call_id_ref: String,
    /// Target module.
    pub module_id: String,
    /// Profile the Associate was built from.
    pub profile_logical_name: String,
    /// When the Associate flow actually started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<String>,
    /// When it ended.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<String>,
    /// Launch status.
    pub status: DispatchStatus,
    /// One-line outcome summary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_summary: Option<String>,
    /// Error detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
}

/// One Principal execution session (start → termination).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrincipalSession {
    /// Session id, sequential within the run.
    pub session_id: String,
    /// Start time.
    pub start_time: String,
    /// End time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    /// Why the session ended.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<String>,
}

/// The shared, serializable ledger for one run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TeamState {
    /// The originating user query.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    /// Work modules keyed by module id.
    #[serde(default)]
    pub work_modules: BTreeMap<String, WorkModule>,
    /// Monotonic counter backing module id generation.
    #[serde(rename = "_work_module_next_id", default = "default_next_id")]
    pub work_module_next_id: u64,
    /// Ordered turn ledger. Append-only.
    #[serde(default)]
    pub turns: Vec<Turn>,
    /// Every Associate launch, in order.
    #[serde(default)]
    pub dispatch_history: Vec<DispatchRecord>,
    /// Associate profile instance ids staffed for this run.
    #[serde(default)]
    pub profiles_list_instance_ids: Vec<String>,
    /// Authoritative runtime-status signal for the Principal flow.
    #[serde(default)]
    pub is_principal_flow_running: bool,
    /// Principal execution sessions, in order.
    #[serde(default)]
    pub principal_execution_sessions: Vec<PrincipalSession>,
}

fn default_next_id() -> u64 {
    1
}

impl TeamState {
    /// Allocate the next `WM_<n>` module id. Strictly monotonic for the
    /// lifetime of a run.
    pub fn next_module_id(&mut self) -> String {
        let id = format!("WM_{}", self.work_module_next_id);
        self.work_module_next_id += 1;
        id
    }

    /// Find a turn by id, searching from the most recent.
    pub fn find_turn(&self, turn_id: &str) -> Option<&Turn> {
        self.turns.iter().rev().find(|t| t.turn_id == turn_id)
    }

    /// Mutable variant of [`TeamState::find_turn`].
    pub fn find_turn_mut(&mut self, turn_id: &str) -> Option<&mut Turn> {
        self.turns.iter_mut().rev().find(|t| t.turn_id == turn_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_ids_are_monotonic() {
        let mut team = TeamState::default();
        assert_eq!(team.next_module_id(), "WM_1");
        assert_eq!(team.next_module_id(), "WM_2");
        assert_eq!(team.next_module_id(), "WM_3");
        assert_eq!(team.work_module_next_id, 4);
    }

    #[test]
    fn dispatchable_statuses() {
        assert!(ModuleStatus::Pending.is_dispatchable());
        assert!(ModuleStatus::PendingReview.is_dispatchable());
        assert!(!ModuleStatus::Ongoing.is_dispatchable());
        assert!(!ModuleStatus::Completed.is_dispatchable());
        assert!(!ModuleStatus::Deprecated.is_dispatchable());
    }

    #[test]
    fn running_assignee_finds_open_stint() {
        let mut module = WorkModule::new("WM_1", "research", "look things up");
        assert!(module.running_assignee().is_none());

        module.assignee_history.push(AssigneeEntry {
            dispatch_id: "d1".into(),
            agent_id: "Assoc_1".into(),
            started_at: ids::now_iso(),
            ended_at: None,
            outcome: AssigneeOutcome::Running,
        });
        assert_eq!(module.running_assignee().unwrap().dispatch_id, "d1");
    }

    #[test]
    fn dispatch_status_screams_on_the_wire() {
        assert_eq!(
            serde_json::to_value(DispatchStatus::Launching).unwrap(),
            serde_json::json!("LAUNCHING")
        );
        assert_eq!(
            serde_json::to_value(DispatchStatus::CompletedSuccess).unwrap(),
            serde_json::json!("COMPLETED_SUCCESS")
        );
    }

    #[test]
    fn team_state_roundtrips_counter_field() {
        let mut team = TeamState::default();
        let _ = team.next_module_id();
        let v = serde_json::to_value(&team).unwrap();
        assert_eq!(v["_work_module_next_id"], 2);
        let back: TeamState = serde_json::from_value(v).unwrap();
        assert_eq!(back.work_module_next_id, 2);
    }

    #[test]
    fn find_turn_searches_backwards() {
        let mut team = TeamState::default();
        assert!(team.find_turn("missing").is_none());
        assert!(team.turns.is_empty());
    }
}
