//! Process configuration from environment variables, plus catalog loading
//! and tracing initialization.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::info;

use crate::types::{AgentProfile, HandoverProtocol};
use crate::{ProfileError, ProfileStore};

/// Environment-driven process settings. All variables are optional and
/// carry the `TROIKA_` prefix.
#[derive(Clone, Debug, PartialEq)]
pub struct AppConfig {
    /// Log filter (`TROIKA_LOG`, default `info`).
    pub log_level: String,
    /// Optional log file path (`TROIKA_LOG_FILE`).
    pub log_file: Option<PathBuf>,
    /// Capture full LLM request bodies onto turns (`TROIKA_CAPTURE_LLM_REQUEST_BODY`).
    pub capture_llm_request_body: bool,
    /// Dump run state to disk after flows finish (`TROIKA_STATE_DUMP`).
    pub state_dump: bool,
    /// Root directory for persisted projects (`TROIKA_PROJECT_ROOT`).
    pub project_root: PathBuf,
    /// Application-level empty-response retry budget
    /// (`TROIKA_EMPTY_RESPONSE_RETRIES`).
    pub empty_response_retries: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
            capture_llm_request_body: false,
            state_dump: false,
            project_root: PathBuf::from("projects"),
            empty_response_retries: 2,
        }
    }
}

impl AppConfig {
    /// Read configuration from the environment over compiled defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let bool_var = |name: &str, fallback: bool| {
            std::env::var(name)
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .unwrap_or(fallback)
        };
        Self {
            log_level: std::env::var("TROIKA_LOG").unwrap_or(defaults.log_level),
            log_file: std::env::var("TROIKA_LOG_FILE").ok().map(PathBuf::from),
            capture_llm_request_body: bool_var(
                "TROIKA_CAPTURE_LLM_REQUEST_BODY",
                defaults.capture_llm_request_body,
            ),
            state_dump: bool_var("TROIKA_STATE_DUMP", defaults.state_dump),
            project_root: std::env::var("TROIKA_PROJECT_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.project_root),
            empty_response_retries: std::env::var("TROIKA_EMPTY_RESPONSE_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.empty_response_retries),
        }
    }

    /// Install the global tracing subscriber with an env-filter over the
    /// configured level. Embedders that want file or JSON output can
    /// install their own subscriber before calling this; an existing
    /// subscriber is left in place.
    pub fn init_tracing(&self) {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(self.log_level.clone()));
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true);
        if subscriber.try_init().is_err() {
            // Already installed (tests, embedders); keep the existing one.
        }
    }
}

/// Load a profile catalog file: a JSON document with `profiles` and
/// `handover_protocols` arrays.
pub fn load_catalog(path: &Path) -> Result<ProfileStore, ProfileError> {
    let text = std::fs::read_to_string(path).map_err(|source| ProfileError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let value: Value = serde_json::from_str(&text)?;

    let profiles: Vec<AgentProfile> = match value.get("profiles") {
        Some(v) => serde_json::from_value(v.clone())?,
        None => Vec::new(),
    };
    let protocols: Vec<HandoverProtocol> = match value.get("handover_protocols") {
        Some(v) => serde_json::from_value(v.clone())?,
        None => Vec::new(),
    };

    info!(
        path = %path.display(),
        profile_count = profiles.len(),
        protocol_count = protocols.len(),
        "profile catalog loaded"
    );
    Ok(ProfileStore::new(profiles, protocols))
}

/// Load raw LLM configs from a JSON document mapping name → config.
pub fn load_llm_configs(path: &Path) -> Result<BTreeMap<String, Value>, ProfileError> {
    let text = std::fs::read_to_string(path).map_err(|source| ProfileError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(serde_json::from_str(&text)?)
}
