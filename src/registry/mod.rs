//! `Registry`: owns all ProcessGroups keyed by group id, plus the
//! model-id-to-group-id index and the cross-group exclusivity gate.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, Semaphore};

use crate::config::ConfigSnapshot;
use crate::error::ProxyError;
use crate::event::EventBus;
use crate::group::{GroupConfig, ProcessGroup};
use crate::process::{Process, ProcessConfig};

/// Result of a successful `Resolve`.
pub struct Resolution {
    pub group_id: String,
    pub canonical_id: String,
    /// The name the body's `model` field should be rewritten to, if the
    /// model config declares `useModelName` and the client used an alias.
    pub rewrite_to: Option<String>,
}

struct Snapshot {
    groups: HashMap<String, Arc<ProcessGroup>>,
    model_index: HashMap<String, String>,
    /// model id -> the useModelName substitution configured for it, if any.
    use_model_name: HashMap<String, String>,
    /// Resource tags held by at least one `exclusive` group. Any group
    /// sharing one of these tags must be gated on activation, even if that
    /// particular group is not itself marked `exclusive` (§4.2/§4.5).
    exclusive_tags: std::collections::HashSet<String>,
}

/// Exclusivity gates are keyed by resource tag and live outside any single
/// `Snapshot` so they survive a reload without momentarily admitting two
/// exclusive activations across the swap.
pub struct Registry {
    snapshot: RwLock<Arc<Snapshot>>,
    exclusivity_gates: RwLock<HashMap<String, Arc<Semaphore>>>,
    events: Arc<EventBus>,
}

impl Registry {
    pub fn new(events: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            snapshot: RwLock::new(Arc::new(Snapshot {
                groups: HashMap::new(),
                model_index: HashMap::new(),
                use_model_name: HashMap::new(),
                exclusive_tags: std::collections::HashSet::new(),
            })),
            exclusivity_gates: RwLock::new(HashMap::new()),
            events,
        })
    }

    pub fn build_from(config: &ConfigSnapshot, events: Arc<EventBus>) -> Arc<Self> {
        let snapshot = build_snapshot(config, &events);
        Arc::new(Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
            exclusivity_gates: RwLock::new(HashMap::new()),
            events,
        })
    }

    /// `Resolve(name) -> (groupId, canonicalId, useModelName) | notFound`.
    pub async fn resolve(&self, name: &str) -> Result<Resolution, ProxyError> {
        let snapshot = self.snapshot.read().await.clone();
        let group_id = snapshot
            .model_index
            .get(name)
            .cloned()
            .ok_or_else(|| ProxyError::NotFound { model_name: name.to_string() })?;
        let group = &snapshot.groups[&group_id];
        let canonical_id = group.canonical_id(name).unwrap_or(name).to_string();
        let rewrite_to = snapshot.use_model_name.get(&canonical_id).cloned();
        Ok(Resolution { group_id, canonical_id, rewrite_to })
    }

    /// `Group(groupId) -> ProcessGroup`.
    pub async fn group(&self, group_id: &str) -> Option<Arc<ProcessGroup>> {
        self.snapshot.read().await.groups.get(group_id).cloned()
    }

    /// Whether activating a member of `group_id` must go through the
    /// exclusivity gate: true both for groups marked `exclusive` themselves
    /// and for any group sharing a `resourceTag` with an exclusive group.
    pub async fn exclusivity_gate_for(&self, group_id: &str) -> Option<String> {
        let snapshot = self.snapshot.read().await;
        let group = snapshot.groups.get(group_id)?;
        let tag = group.config.resource_tag.as_ref()?;
        if snapshot.exclusive_tags.contains(tag) {
            Some(tag.clone())
        } else {
            None
        }
    }

    /// `Iter()`: a snapshot of all group ids at the moment of the call.
    pub async fn iter_group_ids(&self) -> Vec<String> {
        self.snapshot.read().await.groups.keys().cloned().collect()
    }

    /// Acquire the exclusivity gate for `resource_tag`, if the group carries
    /// one. Returns `None` (no gate needed) when the group has no tag.
    pub async fn acquire_exclusivity(&self, resource_tag: &str) -> tokio::sync::OwnedSemaphorePermit {
        let gate = {
            let gates = self.exclusivity_gates.read().await;
            gates.get(resource_tag).cloned()
        };
        let gate = match gate {
            Some(gate) => gate,
            None => {
                let mut gates = self.exclusivity_gates.write().await;
                gates
                    .entry(resource_tag.to_string())
                    .or_insert_with(|| Arc::new(Semaphore::new(1)))
                    .clone()
            }
        };
        gate.acquire_owned().await.expect("exclusivity semaphore is never closed")
    }

    /// Reload algorithm (§4.5): build a new snapshot, swap it in, then shut
    /// down every group that was removed or changed in the old snapshot.
    /// Readers that already took a reference to the old snapshot finish
    /// their in-flight request against it; new requests see only the new
    /// groups.
    pub async fn reload_from(&self, config: &ConfigSnapshot) -> Result<(), ProxyError> {
        let new_snapshot = Arc::new(build_snapshot(config, &self.events));

        let old_snapshot = {
            let mut guard = self.snapshot.write().await;
            std::mem::replace(&mut *guard, new_snapshot)
        };

        for (group_id, old_group) in &old_snapshot.groups {
            let changed_or_removed = match self.snapshot.read().await.groups.get(group_id) {
                None => true,
                Some(new_group) => !Arc::ptr_eq(old_group, new_group),
            };
            if changed_or_removed {
                old_group.shutdown().await;
            }
        }

        self.events.publish(crate::event::Event::ConfigChanged { at: chrono::Utc::now() });
        Ok(())
    }
}

fn build_snapshot(config: &ConfigSnapshot, events: &Arc<EventBus>) -> Snapshot {
    let mut groups = HashMap::new();
    let mut model_index = HashMap::new();
    let mut use_model_name = HashMap::new();
    let mut exclusive_tags = std::collections::HashSet::new();

    for group_config in config.groups.values() {
        if group_config.exclusive {
            if let Some(tag) = &group_config.resource_tag {
                exclusive_tags.insert(tag.clone());
            }
        }
    }

    for (group_id, group_config) in &config.groups {
        let mut members = HashMap::new();
        let mut aliases = HashMap::new();

        for model_id in &group_config.members {
            let Some(model_config) = config.models.get(model_id) else { continue };

            model_index.insert(model_id.clone(), group_id.clone());
            for alias in &model_config.aliases {
                model_index.insert(alias.clone(), group_id.clone());
                aliases.insert(alias.clone(), model_id.clone());
            }
            if let Some(rewrite) = &model_config.use_model_name {
                use_model_name.insert(model_id.clone(), rewrite.clone());
            }

            let process_config = ProcessConfig {
                model_id: model_id.clone(),
                model: model_config.clone(),
                health_check_timeout: std::time::Duration::from_secs(config.health_check_timeout_secs),
                graceful_stop_timeout: std::time::Duration::from_secs(config.graceful_stop_timeout_secs),
                persistent: group_config.persistent,
                sensitive_headers: config.sensitive_headers.clone(),
            };
            members.insert(model_id.clone(), Process::new(process_config, events.clone()));
        }

        let group = ProcessGroup::new(
            GroupConfig {
                id: group_id.clone(),
                swap: group_config.swap,
                exclusive: group_config.exclusive,
                persistent: group_config.persistent,
                resource_tag: group_config.resource_tag.clone(),
            },
            members,
            aliases,
        );
        groups.insert(group_id.clone(), Arc::new(group));
    }

    Snapshot { groups, model_index, use_model_name, exclusive_tags }
}
