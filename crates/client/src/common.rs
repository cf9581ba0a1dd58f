//! State and lifecycle plumbing shared between the public client API and
//! the connection supervisor.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};

use opamp_protocol::messages::{AgentToServer, CustomMessage, InstanceUid};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::callbacks::Callbacks;
use crate::error::ClientError;
use crate::sender::WsSender;
use crate::state::{ClientSyncedState, PackagesStateProvider};

/// Per-instance record, created at prepare time and frozen afterwards.
pub(crate) struct Agent {
    pub capabilities: u64,
    pub sender: Arc<WsSender>,
    pub synced_state: Arc<ClientSyncedState>,
    pub packages_state: Option<Arc<dyn PackagesStateProvider>>,
}

/// Shared collaborator of the supervisor: callbacks, the frozen agent map,
/// the stop signal, and the handle of the running supervisor task.
pub(crate) struct ClientCommon {
    pub callbacks: Arc<dyn Callbacks>,
    pub agents: HashMap<InstanceUid, Agent>,
    /// Serializes package-sync operations across all receivers.
    pub package_sync_mutex: Arc<Mutex<()>>,
    last_connection_settings_hash: Vec<u8>,
    stopping: AtomicBool,
    stop_token: CancellationToken,
    run_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl ClientCommon {
    pub(crate) fn new(
        callbacks: Arc<dyn Callbacks>,
        agents: HashMap<InstanceUid, Agent>,
        last_connection_settings_hash: Vec<u8>,
    ) -> Self {
        Self {
            callbacks,
            agents,
            package_sync_mutex: Arc::new(Mutex::new(())),
            last_connection_settings_hash,
            stopping: AtomicBool::new(false),
            stop_token: CancellationToken::new(),
            run_handle: StdMutex::new(None),
        }
    }

    pub(crate) fn agent(&self, instance_uid: InstanceUid) -> Result<&Agent, ClientError> {
        self.agents
            .get(&instance_uid)
            .ok_or(ClientError::UnknownAgent(instance_uid))
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Token cancelled when `stop` is called. The supervisor and everything
    /// derived from the cycle context hang off it.
    pub(crate) fn stop_token(&self) -> CancellationToken {
        self.stop_token.clone()
    }

    /// Launches the supervisor task.
    pub(crate) fn start_connect_and_run(
        &self,
        fut: impl Future<Output = ()> + Send + 'static,
    ) {
        let mut handle = self.run_handle.lock().unwrap_or_else(|e| e.into_inner());
        *handle = Some(tokio::spawn(fut));
    }

    /// Sets the stopping flag, cancels the stop token, and joins the
    /// supervisor. Safe to call more than once.
    pub(crate) async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.stop_token.cancel();
        let handle = self
            .run_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Queues the first status report of a cycle on every agent's sender.
    pub(crate) fn prepare_first_message(&self) {
        for (uid, agent) in &self.agents {
            let mut report = agent
                .synced_state
                .status_report(*uid, agent.capabilities);
            report.last_connection_settings_hash = self.last_connection_settings_hash.clone();
            agent.sender.schedule_status(report);
        }
    }

    /// Schedules a custom message; the returned signal fires when it has
    /// been written to the socket.
    pub(crate) fn send_custom_message(
        &self,
        instance_uid: InstanceUid,
        message: CustomMessage,
    ) -> Result<oneshot::Receiver<()>, ClientError> {
        let agent = self.agent(instance_uid)?;
        if !agent.synced_state.has_custom_capability(&message.capability) {
            return Err(ClientError::InvalidArgument(format!(
                "custom capability {} is not declared",
                message.capability
            )));
        }
        agent.sender.schedule_custom(AgentToServer {
            instance_uid: Some(instance_uid),
            custom_message: Some(message),
            ..Default::default()
        })
    }
}
