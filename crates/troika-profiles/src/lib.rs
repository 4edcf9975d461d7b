//! # troika-profiles
//!
//! The configuration surface of the orchestration core:
//!
//! - **Agent profiles** ([`types::AgentProfile`]): system-prompt segments,
//!   text definitions, tool access policies, inbox handling strategies,
//!   observers, and the flow decider — everything that makes an agent's
//!   behavior declarative.
//! - **Handover protocols** ([`types::HandoverProtocol`]): declarative
//!   parent→child context transfer rules.
//! - **Profile store** ([`store::ProfileStore`]): instance-id and
//!   logical-name lookups with active/deleted/rev filtering.
//! - **App config** ([`config::AppConfig`]): environment-driven process
//!   settings and tracing initialization.
//!
//! Profiles are resolved into flat, immutable values at load time and
//! shared as `Arc`s; nothing here is process-global — a catalog snapshot
//! is frozen into each `RunContext` at run creation.

#![deny(unsafe_code)]

pub mod config;
pub mod store;
pub mod types;

pub use config::AppConfig;
pub use store::ProfileStore;
pub use types::{
    AgentProfile, DeciderAction, DeciderRule, HandoverProtocol, InjectionMode, ObserverAction,
    ObserverRule, ProfileType, PromptSegment, SegmentKind, StrategyOverride, ToolAccessPolicy,
};

/// Errors raised while loading or resolving configuration.
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    /// Filesystem failure while reading a catalog.
    #[error("io error reading '{path}': {source}")]
    Io {
        /// Offending path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Malformed catalog JSON.
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// A referenced profile does not exist or is inactive.
    #[error("profile not found: {0}")]
    NotFound(String),
}
