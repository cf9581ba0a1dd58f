//! Per-agent mirror of the state the server has been told.

use std::sync::Mutex;

use opamp_protocol::messages::{
    AgentDescription, AgentToServer, AvailableComponents, ComponentHealth, CustomCapabilities,
    InstanceUid, PackageStatuses, RemoteConfigStatus,
};

use crate::error::ClientError;

/// Access to the local state of downloadable packages.
///
/// Package-sync operations across all agents are serialized by the client's
/// shared package-sync mutex, so implementations see at most one sync at a
/// time.
pub trait PackagesStateProvider: Send + Sync + 'static {
    /// Hash of the full package set last offered by the server.
    fn all_packages_hash(&self) -> Vec<u8>;

    fn set_all_packages_hash(&self, hash: &[u8]);

    /// Package statuses last reported to the server, if any.
    fn last_reported_statuses(&self) -> Option<PackageStatuses>;

    fn set_last_reported_statuses(&self, statuses: &PackageStatuses);
}

#[derive(Default)]
struct SyncedData {
    agent_description: Option<AgentDescription>,
    health: Option<ComponentHealth>,
    remote_config_status: Option<RemoteConfigStatus>,
    package_statuses: Option<PackageStatuses>,
    custom_capabilities: Option<CustomCapabilities>,
    available_components: Option<AvailableComponents>,
    effective_config_hash: Vec<u8>,
    flags: u64,
}

/// What the server has been told about one agent.
///
/// Mutated under a per-agent lock; every setter reports whether the value
/// actually changed so the caller can schedule an outbound update only when
/// it did.
#[derive(Default)]
pub struct ClientSyncedState {
    data: Mutex<SyncedData>,
}

impl ClientSyncedState {
    fn lock(&self) -> std::sync::MutexGuard<'_, SyncedData> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn agent_description(&self) -> Option<AgentDescription> {
        self.lock().agent_description.clone()
    }

    /// Replaces the agent description. An empty description is invalid.
    pub fn set_agent_description(
        &self,
        description: &AgentDescription,
    ) -> Result<bool, ClientError> {
        if description.is_empty() {
            return Err(ClientError::InvalidArgument(
                "agent description must have at least one attribute".into(),
            ));
        }
        let mut data = self.lock();
        let changed = data.agent_description.as_ref() != Some(description);
        data.agent_description = Some(description.clone());
        Ok(changed)
    }

    pub fn health(&self) -> Option<ComponentHealth> {
        self.lock().health.clone()
    }

    pub fn set_health(&self, health: &ComponentHealth) -> bool {
        let mut data = self.lock();
        let changed = data.health.as_ref() != Some(health);
        data.health = Some(health.clone());
        changed
    }

    pub fn remote_config_status(&self) -> Option<RemoteConfigStatus> {
        self.lock().remote_config_status.clone()
    }

    pub fn set_remote_config_status(&self, status: &RemoteConfigStatus) -> bool {
        let mut data = self.lock();
        let changed = data.remote_config_status.as_ref() != Some(status);
        data.remote_config_status = Some(status.clone());
        changed
    }

    pub fn package_statuses(&self) -> Option<PackageStatuses> {
        self.lock().package_statuses.clone()
    }

    pub fn set_package_statuses(&self, statuses: &PackageStatuses) -> bool {
        let mut data = self.lock();
        let changed = data.package_statuses.as_ref() != Some(statuses);
        data.package_statuses = Some(statuses.clone());
        changed
    }

    pub fn custom_capabilities(&self) -> Option<CustomCapabilities> {
        self.lock().custom_capabilities.clone()
    }

    pub fn set_custom_capabilities(&self, capabilities: &CustomCapabilities) -> bool {
        let mut data = self.lock();
        let changed = data.custom_capabilities.as_ref() != Some(capabilities);
        data.custom_capabilities = Some(capabilities.clone());
        changed
    }

    /// Checks that `capability` was declared via custom capabilities.
    pub fn has_custom_capability(&self, capability: &str) -> bool {
        self.lock()
            .custom_capabilities
            .as_ref()
            .is_some_and(|c| c.capabilities.iter().any(|v| v == capability))
    }

    pub fn available_components(&self) -> Option<AvailableComponents> {
        self.lock().available_components.clone()
    }

    pub fn set_available_components(&self, components: &AvailableComponents) -> bool {
        let mut data = self.lock();
        let changed = data.available_components.as_ref() != Some(components);
        data.available_components = Some(components.clone());
        changed
    }

    pub fn effective_config_hash(&self) -> Vec<u8> {
        self.lock().effective_config_hash.clone()
    }

    pub fn set_effective_config_hash(&self, hash: &[u8]) -> bool {
        let mut data = self.lock();
        let changed = data.effective_config_hash != hash;
        data.effective_config_hash = hash.to_vec();
        changed
    }

    pub fn flags(&self) -> u64 {
        self.lock().flags
    }

    pub fn set_flags(&self, flags: u64) -> bool {
        let mut data = self.lock();
        let changed = data.flags != flags;
        data.flags = flags;
        changed
    }

    /// Builds a full status report from the current state. Scheduled status
    /// messages are always complete snapshots, so coalescing them in the
    /// outbound queue cannot drop an update.
    pub(crate) fn status_report(&self, instance_uid: InstanceUid, capabilities: u64) -> AgentToServer {
        let data = self.lock();
        AgentToServer {
            instance_uid: Some(instance_uid),
            capabilities,
            flags: data.flags,
            agent_description: data.agent_description.clone(),
            health: data.health.clone(),
            remote_config_status: data.remote_config_status.clone(),
            package_statuses: data.package_statuses.clone(),
            custom_capabilities: data.custom_capabilities.clone(),
            available_components: data.available_components.clone(),
            effective_config_hash: data.effective_config_hash.clone(),
            ..Default::default()
        }
    }
}
