//! Host-provided callbacks invoked by the client.

use opamp_protocol::messages::{
    AgentRemoteConfig, ConnectionSettingsOffers, CustomMessage, InstanceUid,
    OpAmpConnectionSettings, PackagesAvailable,
};
use url::Url;

use crate::error::{CallbackError, ConnectError};

/// One response observed while chasing redirects, snapshotted for
/// [`Callbacks::check_redirect`]. The live chain stays private to the
/// supervisor; callbacks only ever see copies.
#[derive(Debug, Clone)]
pub struct RedirectResponse {
    /// Status the server answered with.
    pub status: http::StatusCode,
    /// URL the redirected request was sent to.
    pub url: Url,
}

/// Callbacks the client invokes on connection and protocol events.
///
/// All methods have no-op defaults; implement the ones you care about.
/// Callbacks run on the client's tasks and should not block.
pub trait Callbacks: Send + Sync + 'static {
    /// Fired after a WebSocket connection is established, before the first
    /// status report is written.
    fn on_connect(&self) {}

    /// Fired on every failed connection attempt, unless the client is
    /// already stopping.
    fn on_connect_failed(&self, _err: &ConnectError) {}

    /// Consulted before following a 3xx redirect. `via` holds the responses
    /// observed so far in this redirect chain, oldest first, including the
    /// one being followed. Returning an error terminates the attempt.
    fn check_redirect(
        &self,
        _next: &Url,
        _via: &[RedirectResponse],
    ) -> Result<(), CallbackError> {
        Ok(())
    }

    /// The server set the restart flag. An error is logged but does not
    /// terminate the connection.
    fn on_restart_requested(&self) -> Result<(), CallbackError> {
        Ok(())
    }

    /// The server pushed a remote configuration for `agent`.
    fn on_remote_config(&self, _agent: InstanceUid, _config: &AgentRemoteConfig) {}

    /// The server offered packages. An error skips the package-status sync.
    fn on_packages_available(
        &self,
        _agent: InstanceUid,
        _packages: &PackagesAvailable,
    ) -> Result<(), CallbackError> {
        Ok(())
    }

    /// The server offered new connection settings.
    fn on_connection_settings_offer(
        &self,
        _agent: InstanceUid,
        _offers: &ConnectionSettingsOffers,
    ) {
    }

    /// The server offered settings for the OpAMP connection itself.
    fn on_opamp_connection_settings(
        &self,
        _agent: InstanceUid,
        _settings: &OpAmpConnectionSettings,
    ) {
    }

    /// The server sent an application-defined message.
    fn on_custom_message(&self, _agent: InstanceUid, _message: &CustomMessage) {}

    /// The server acknowledged a heartbeat.
    fn on_heartbeat_ack(&self, _agent: InstanceUid) {}
}

/// Callbacks implementation that ignores every event.
pub struct NoopCallbacks;

impl Callbacks for NoopCallbacks {}
