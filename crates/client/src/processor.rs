//! Interpretation of server-to-agent messages.

use std::sync::Arc;

use opamp_protocol::constants::{capabilities, server_flags};
use opamp_protocol::messages::{
    InstanceUid, PackageStatus, PackageStatusEnum, PackageStatuses, PackagesAvailable,
    ServerToAgent,
};
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::callbacks::Callbacks;
use crate::sender::WsSender;
use crate::state::{ClientSyncedState, PackagesStateProvider};

/// Dispatches decoded server messages to user callbacks, updates synced
/// state, and schedules replies via the agent's sender.
///
/// Every inspected field that is absent causes no action at all.
pub(crate) struct ReceivedProcessor {
    instance_uid: InstanceUid,
    capabilities: u64,
    callbacks: Arc<dyn Callbacks>,
    sender: Arc<WsSender>,
    synced_state: Arc<ClientSyncedState>,
    packages_state: Option<Arc<dyn PackagesStateProvider>>,
    package_sync_mutex: Arc<Mutex<()>>,
}

impl ReceivedProcessor {
    pub(crate) fn new(
        instance_uid: InstanceUid,
        capabilities: u64,
        callbacks: Arc<dyn Callbacks>,
        sender: Arc<WsSender>,
        synced_state: Arc<ClientSyncedState>,
        packages_state: Option<Arc<dyn PackagesStateProvider>>,
        package_sync_mutex: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            instance_uid,
            capabilities,
            callbacks,
            sender,
            synced_state,
            packages_state,
            package_sync_mutex,
        }
    }

    pub(crate) async fn process_received_message(&self, msg: &ServerToAgent) {
        if let Some(response) = &msg.error_response {
            error!(
                agent = %self.instance_uid,
                error_type = ?response.error_type,
                "server returned an error response: {}",
                response.error_message
            );
        }

        if msg.flags & server_flags::REQUEST_RESTART != 0 {
            if let Err(err) = self.callbacks.on_restart_requested() {
                error!(agent = %self.instance_uid, "restart requested callback failed: {err}");
            }
        }

        if let Some(config) = &msg.remote_config {
            if self.capabilities & capabilities::ACCEPTS_REMOTE_CONFIG != 0 {
                self.callbacks.on_remote_config(self.instance_uid, config);
            } else {
                debug!(
                    agent = %self.instance_uid,
                    "ignoring remote config, AcceptsRemoteConfig capability is not set"
                );
            }
        }

        if let Some(offers) = &msg.connection_settings {
            self.callbacks
                .on_connection_settings_offer(self.instance_uid, offers);
            if let Some(opamp) = &offers.opamp {
                if self.capabilities & capabilities::ACCEPTS_OPAMP_CONNECTION_SETTINGS != 0 {
                    self.callbacks
                        .on_opamp_connection_settings(self.instance_uid, opamp);
                } else {
                    debug!(
                        agent = %self.instance_uid,
                        "ignoring OpAMP connection settings, capability is not set"
                    );
                }
            }
        }

        if let Some(packages) = &msg.packages_available {
            self.process_packages_available(packages).await;
        }

        if let Some(message) = &msg.custom_message {
            self.callbacks.on_custom_message(self.instance_uid, message);
        }

        if msg.heartbeat_ack.is_some() {
            self.callbacks.on_heartbeat_ack(self.instance_uid);
        }

        if msg.flags & server_flags::REPORT_FULL_STATE != 0 {
            self.schedule_status_report();
        }
    }

    /// Package sync runs under the shared mutex so that two agents never
    /// touch package state concurrently.
    async fn process_packages_available(&self, packages: &PackagesAvailable) {
        if self.capabilities & capabilities::ACCEPTS_PACKAGES == 0 {
            debug!(
                agent = %self.instance_uid,
                "ignoring available packages, AcceptsPackages capability is not set"
            );
            return;
        }
        let Some(provider) = &self.packages_state else {
            debug!(
                agent = %self.instance_uid,
                "ignoring available packages, no packages state provider"
            );
            return;
        };

        let _guard = self.package_sync_mutex.lock().await;

        if let Err(err) = self
            .callbacks
            .on_packages_available(self.instance_uid, packages)
        {
            error!(agent = %self.instance_uid, "packages available callback failed: {err}");
            return;
        }

        provider.set_all_packages_hash(&packages.all_packages_hash);

        let statuses = PackageStatuses {
            packages: packages
                .packages
                .iter()
                .map(|(name, available)| {
                    (
                        name.clone(),
                        PackageStatus {
                            server_offered_version: available.version.clone(),
                            server_offered_hash: available.hash.clone(),
                            status: PackageStatusEnum::InstallPending,
                            ..Default::default()
                        },
                    )
                })
                .collect(),
            server_provided_all_packages_hash: packages.all_packages_hash.clone(),
            error_message: String::new(),
        };
        provider.set_last_reported_statuses(&statuses);
        self.synced_state.set_package_statuses(&statuses);
        self.schedule_status_report();
    }

    fn schedule_status_report(&self) {
        self.sender.schedule_status(
            self.synced_state
                .status_report(self.instance_uid, self.capabilities),
        );
    }
}
