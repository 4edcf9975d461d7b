//! The profile store: instance-id and logical-name lookups.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{AgentProfile, HandoverProtocol, ProfileType};

/// An immutable catalog of profiles and handover protocols, frozen into a
/// run at creation time.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProfileStore {
    /// Profiles by instance id.
    #[serde(default)]
    profiles: BTreeMap<String, Arc<AgentProfile>>,
    /// Handover protocols by name.
    #[serde(default)]
    protocols: BTreeMap<String, Arc<HandoverProtocol>>,
}

impl ProfileStore {
    /// Build a store from profile and protocol lists.
    pub fn new(profiles: Vec<AgentProfile>, protocols: Vec<HandoverProtocol>) -> Self {
        let mut store = Self::default();
        for profile in profiles {
            let _ = store
                .profiles
                .insert(profile.profile_id.clone(), Arc::new(profile));
        }
        for protocol in protocols {
            let _ = store
                .protocols
                .insert(protocol.protocol_name.clone(), Arc::new(protocol));
        }
        store
    }

    /// Look up a profile by instance id, filtering tombstones.
    pub fn by_instance_id(&self, instance_id: &str) -> Option<Arc<AgentProfile>> {
        self.profiles
            .get(instance_id)
            .filter(|p| !p.is_deleted)
            .cloned()
    }

    /// The active profile for a logical name. When several revisions are
    /// active under the same name, the highest `rev` wins.
    pub fn active_by_name(&self, name: &str) -> Option<Arc<AgentProfile>> {
        let mut best: Option<Arc<AgentProfile>> = None;
        for profile in self.profiles.values() {
            if profile.name != name || !profile.is_active || profile.is_deleted {
                continue;
            }
            match &best {
                Some(current) if current.rev >= profile.rev => {}
                _ => best = Some(Arc::clone(profile)),
            }
        }
        if best.is_none() {
            warn!(name, "no active profile for logical name");
        }
        best
    }

    /// Instance ids of every active, staffable associate profile.
    pub fn staffable_associate_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .profiles
            .values()
            .filter(|p| {
                p.profile_type == ProfileType::Associate
                    && p.available_for_staffing
                    && p.is_active
                    && !p.is_deleted
            })
            .map(|p| p.profile_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// A handover protocol by name.
    pub fn protocol(&self, name: &str) -> Option<Arc<HandoverProtocol>> {
        self.protocols.get(name).cloned()
    }

    /// All profiles (used by staffing-list rendering).
    pub fn all_profiles(&self) -> impl Iterator<Item = &Arc<AgentProfile>> {
        self.profiles.values()
    }
}
