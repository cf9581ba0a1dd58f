//! OpAMP client over WebSocket transport: public API and the connection
//! supervisor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use http::HeaderMap;
use opamp_protocol::constants::capabilities;
use opamp_protocol::messages::{
    AgentDescription, AvailableComponents, ComponentHealth, CustomCapabilities, CustomMessage,
    InstanceUid, PackageStatuses, RemoteConfigStatus,
};
use tokio::sync::{RwLock, oneshot};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{Connector, connect_async_tls_with_config};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use url::Url;

use crate::callbacks::RedirectResponse;
use crate::common::{Agent, ClientCommon};
use crate::connection::Connection;
use crate::error::{ClientError, ConnectError, ConnectFailure};
use crate::processor::ReceivedProcessor;
use crate::receiver::WsReceiver;
use crate::retry::ExponentialBackoff;
use crate::sender::WsSender;
use crate::settings::{DEFAULT_HEARTBEAT_INTERVAL, StartSettings};
use crate::state::ClientSyncedState;

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// OpAMP client communicating over a WebSocket connection.
///
/// Lifecycle: [`prepare_start`](Self::prepare_start), then
/// [`start`](Self::start), eventually [`stop`](Self::stop). After `start`
/// returns the client connects, reconnects and processes messages on its
/// own tasks; errors inside a connection cycle are logged and retried, not
/// surfaced to the caller.
pub struct WsClient {
    common: OnceLock<Arc<ClientCommon>>,
    shared: Arc<ClientShared>,
    started: AtomicBool,
}

/// State shared between the public API and the supervisor task.
struct ClientShared {
    /// The connection of the current cycle. The supervisor takes the write
    /// lock on connect and on cycle teardown; callers inspecting the handle
    /// take the read lock. At most one socket is open at any moment.
    conn: RwLock<Option<Arc<Connection>>>,
    /// Bounds the wait for the server's half of the close handshake.
    conn_shutdown_timeout: StdMutex<Duration>,
    /// Last connect-loop error, kept for test observation.
    last_internal_err: StdMutex<Option<ConnectError>>,
}

impl Default for ClientShared {
    fn default() -> Self {
        Self {
            conn: RwLock::new(None),
            conn_shutdown_timeout: StdMutex::new(DEFAULT_SHUTDOWN_TIMEOUT),
            last_internal_err: StdMutex::new(None),
        }
    }
}

impl WsClient {
    pub fn new() -> Self {
        Self {
            common: OnceLock::new(),
            shared: Arc::new(ClientShared::default()),
            started: AtomicBool::new(false),
        }
    }

    /// Creates the per-agent state: one sender, one synced-state mirror per
    /// agent. The agent set is frozen after this call.
    pub fn prepare_start(&self, settings: &StartSettings) -> Result<(), ClientError> {
        if settings.agents.is_empty() {
            return Err(ClientError::InvalidConfig(
                "at least one agent is required".into(),
            ));
        }

        let mut agents = HashMap::new();
        for agent in &settings.agents {
            if agents.contains_key(&agent.instance_uid) {
                return Err(ClientError::InvalidConfig(format!(
                    "duplicate agent instance uid {}",
                    agent.instance_uid
                )));
            }
            let synced_state = Arc::new(ClientSyncedState::default());
            if let Some(description) = &agent.agent_description {
                synced_state.set_agent_description(description)?;
            }
            synced_state.set_health(&ComponentHealth {
                healthy: false,
                ..Default::default()
            });
            if let Some(status) = &agent.remote_config_status {
                synced_state.set_remote_config_status(status);
            }
            agents.insert(
                agent.instance_uid,
                Agent {
                    capabilities: agent.capabilities | capabilities::REPORTS_STATUS,
                    sender: Arc::new(WsSender::new(agent.instance_uid)),
                    synced_state,
                    packages_state: agent.packages_state_provider.clone(),
                },
            );
        }

        let common = Arc::new(ClientCommon::new(
            settings.callbacks.clone(),
            agents,
            settings.last_connection_settings_hash.clone(),
        ));
        self.common
            .set(common)
            .map_err(|_| ClientError::AlreadyPrepared)
    }

    /// Validates the connection settings and launches the supervisor.
    pub fn start(&self, settings: StartSettings) -> Result<(), ClientError> {
        let common = self.common()?.clone();

        let mut url = Url::parse(&settings.server_url)?;
        if settings.tls_config.is_some() && url.set_scheme("wss").is_err() {
            return Err(ClientError::InvalidConfig(format!(
                "cannot use TLS with scheme {}",
                url.scheme()
            )));
        }

        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ClientError::AlreadyStarted);
        }

        if settings.enable_compression {
            warn!("compression was requested but the transport cannot negotiate it; continuing uncompressed");
        }

        let heartbeat = match settings.heartbeat_interval {
            None => Some(DEFAULT_HEARTBEAT_INTERVAL),
            Some(interval) if interval.is_zero() => None,
            Some(interval) => Some(interval),
        };

        let base_headers = settings.headers.clone().unwrap_or_default();
        let header_func = settings.header_func.clone();
        let get_header: Box<dyn Fn() -> HeaderMap + Send + Sync> =
            Box::new(move || match &header_func {
                Some(func) => func(base_headers.clone()),
                None => base_headers.clone(),
            });

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(MAX_MESSAGE_SIZE);

        let supervisor = Supervisor {
            common: common.clone(),
            shared: self.shared.clone(),
            cfg: ConnectConfig {
                url,
                get_header,
                tls_config: settings.tls_config.clone(),
                ws_config,
                heartbeat,
            },
            chain: Vec::new(),
        };

        let stop = common.stop_token();
        common.start_connect_and_run(supervisor.run_until_stopped(stop));
        Ok(())
    }

    /// Stops the client: no further connection attempts are made and no
    /// callbacks fire after this returns. Safe to call more than once.
    pub async fn stop(&self) -> Result<(), ClientError> {
        self.common()?.stop().await;
        Ok(())
    }

    /// Whether a connection cycle is currently holding an open socket.
    pub async fn is_connected(&self) -> bool {
        self.shared.conn.read().await.is_some()
    }

    pub fn agent_description(
        &self,
        agent_id: InstanceUid,
    ) -> Result<Option<AgentDescription>, ClientError> {
        Ok(self.common()?.agent(agent_id)?.synced_state.agent_description())
    }

    pub fn set_agent_description(
        &self,
        agent_id: InstanceUid,
        description: &AgentDescription,
    ) -> Result<(), ClientError> {
        let agent = self.agent(agent_id)?;
        if agent.synced_state.set_agent_description(description)? {
            schedule_report(agent, agent_id);
        }
        Ok(())
    }

    pub fn set_health(
        &self,
        agent_id: InstanceUid,
        health: &ComponentHealth,
    ) -> Result<(), ClientError> {
        let agent = self.agent(agent_id)?;
        if agent.synced_state.set_health(health) {
            schedule_report(agent, agent_id);
        }
        Ok(())
    }

    pub fn set_remote_config_status(
        &self,
        agent_id: InstanceUid,
        status: &RemoteConfigStatus,
    ) -> Result<(), ClientError> {
        let agent = self.agent(agent_id)?;
        if agent.capabilities & capabilities::ACCEPTS_REMOTE_CONFIG == 0 {
            return Err(ClientError::CapabilityNotSet("AcceptsRemoteConfig"));
        }
        if agent.synced_state.set_remote_config_status(status) {
            schedule_report(agent, agent_id);
        }
        Ok(())
    }

    pub fn set_package_statuses(
        &self,
        agent_id: InstanceUid,
        statuses: &PackageStatuses,
    ) -> Result<(), ClientError> {
        let agent = self.agent(agent_id)?;
        if agent.capabilities & capabilities::REPORTS_PACKAGE_STATUSES == 0 {
            return Err(ClientError::CapabilityNotSet("ReportsPackageStatuses"));
        }
        if agent.synced_state.set_package_statuses(statuses) {
            schedule_report(agent, agent_id);
        }
        Ok(())
    }

    pub fn set_custom_capabilities(
        &self,
        agent_id: InstanceUid,
        capabilities: &CustomCapabilities,
    ) -> Result<(), ClientError> {
        let agent = self.agent(agent_id)?;
        if agent.synced_state.set_custom_capabilities(capabilities) {
            schedule_report(agent, agent_id);
        }
        Ok(())
    }

    pub fn set_available_components(
        &self,
        agent_id: InstanceUid,
        components: &AvailableComponents,
    ) -> Result<(), ClientError> {
        let agent = self.agent(agent_id)?;
        if agent.capabilities & capabilities::REPORTS_AVAILABLE_COMPONENTS == 0 {
            return Err(ClientError::CapabilityNotSet("ReportsAvailableComponents"));
        }
        if agent.synced_state.set_available_components(components) {
            schedule_report(agent, agent_id);
        }
        Ok(())
    }

    pub fn set_effective_config_hash(
        &self,
        agent_id: InstanceUid,
        hash: &[u8],
    ) -> Result<(), ClientError> {
        let agent = self.agent(agent_id)?;
        if agent.capabilities & capabilities::REPORTS_EFFECTIVE_CONFIG == 0 {
            return Err(ClientError::CapabilityNotSet("ReportsEffectiveConfig"));
        }
        if agent.synced_state.set_effective_config_hash(hash) {
            schedule_report(agent, agent_id);
        }
        Ok(())
    }

    pub fn set_flags(&self, agent_id: InstanceUid, flags: u64) -> Result<(), ClientError> {
        let agent = self.agent(agent_id)?;
        if agent.synced_state.set_flags(flags) {
            schedule_report(agent, agent_id);
        }
        Ok(())
    }

    /// Schedules a custom message; the returned signal fires when it has
    /// been written to the socket.
    pub fn send_custom_message(
        &self,
        agent_id: InstanceUid,
        message: CustomMessage,
    ) -> Result<oneshot::Receiver<()>, ClientError> {
        self.common()?.send_custom_message(agent_id, message)
    }

    fn common(&self) -> Result<&Arc<ClientCommon>, ClientError> {
        self.common.get().ok_or(ClientError::NotPrepared)
    }

    fn agent(&self, agent_id: InstanceUid) -> Result<&Agent, ClientError> {
        self.common()?.agent(agent_id)
    }
}

impl Default for WsClient {
    fn default() -> Self {
        Self::new()
    }
}

fn schedule_report(agent: &Agent, agent_id: InstanceUid) {
    agent
        .sender
        .schedule_status(agent.synced_state.status_report(agent_id, agent.capabilities));
}

/// Connection parameters owned by the supervisor. `url` is replaced when a
/// redirect is followed.
struct ConnectConfig {
    url: Url,
    get_header: Box<dyn Fn() -> HeaderMap + Send + Sync>,
    tls_config: Option<Arc<rustls::ClientConfig>>,
    ws_config: WebSocketConfig,
    heartbeat: Option<Duration>,
}

/// The connection supervisor: connects with backoff, binds sender and
/// receiver tasks to the connection for one cycle, coordinates shutdown,
/// and loops until the client is stopped.
struct Supervisor {
    common: Arc<ClientCommon>,
    shared: Arc<ClientShared>,
    cfg: ConnectConfig,
    /// Responses observed while chasing redirects. Exclusive to this task;
    /// cleared on a successful connect and on a non-redirect failure.
    chain: Vec<RedirectResponse>,
}

impl Supervisor {
    async fn run_until_stopped(mut self, stop: CancellationToken) {
        loop {
            if self.common.is_stopping() {
                return;
            }
            self.run_one_cycle(&stop).await;
        }
    }

    /// One cycle: connect (retrying until it works), run the session on the
    /// connection, close the socket.
    async fn run_one_cycle(&mut self, stop: &CancellationToken) {
        let Some(conn) = self.ensure_connected(stop).await else {
            // Cannot connect only when we are being stopped.
            return;
        };
        self.run_cycle_on(stop, &conn).await;
        conn.close().await;
        *self.shared.conn.write().await = None;
    }

    /// Retries `try_connect_once` under exponential backoff until one
    /// attempt connects. The server's retry-after hint can only lengthen
    /// the wait, never shorten it. Returns `None` only when stopped.
    async fn ensure_connected(&mut self, stop: &CancellationToken) -> Option<Arc<Connection>> {
        let mut backoff = ExponentialBackoff::default();
        let mut interval = Duration::ZERO;

        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    debug!("client is stopping, will not try anymore");
                    return None;
                }
                _ = tokio::time::sleep(interval) => {}
            }

            let mut next = backoff.next_interval();
            match self.try_connect_once().await {
                Ok(conn) => return Some(conn),
                Err(failure) => {
                    *self
                        .shared
                        .last_internal_err
                        .lock()
                        .unwrap_or_else(|e| e.into_inner()) = Some(failure.error.clone());
                    if stop.is_cancelled() {
                        debug!("client is stopping, will not try anymore");
                        return None;
                    }
                    error!(error = %failure.error, "connection failed, will retry");
                    if let Some(retry_after) = failure.retry_after
                        && retry_after > next
                    {
                        next = retry_after;
                    }
                    interval = next;
                }
            }
        }
    }

    async fn try_connect_once(&mut self) -> Result<Arc<Connection>, ConnectFailure> {
        let headers = (self.cfg.get_header)();
        let request = match client_request(&self.cfg.url, &headers) {
            Ok(request) => request,
            Err(err) => {
                let failure = ConnectFailure {
                    retry_after: None,
                    error: ConnectError::Transport(err.to_string()),
                };
                self.report_connect_failed(&failure.error);
                return Err(failure);
            }
        };

        let connector = self.cfg.tls_config.clone().map(Connector::Rustls);
        match connect_async_tls_with_config(request, Some(self.cfg.ws_config), false, connector)
            .await
        {
            Ok((ws, _response)) => {
                let conn = Arc::new(Connection::new(ws));
                *self.shared.conn.write().await = Some(conn.clone());
                self.chain.clear();
                self.common.callbacks.on_connect();
                Ok(conn)
            }
            Err(err) => {
                let failure = self.classify_dial_error(err);
                self.report_connect_failed(&failure.error);
                Err(failure)
            }
        }
    }

    fn report_connect_failed(&self, error: &ConnectError) {
        if !self.common.is_stopping() {
            self.common.callbacks.on_connect_failed(error);
        }
    }

    fn classify_dial_error(&mut self, err: tungstenite::Error) -> ConnectFailure {
        match err {
            tungstenite::Error::Http(response) => {
                let retry_after = extract_retry_after(&response);
                let status = response.status();
                if status.is_redirection() {
                    // The chain survives the attempt while it is still
                    // redirecting; the redirect itself still counts as a
                    // failure for backoff.
                    match self.handle_redirect(&response) {
                        Ok(()) => ConnectFailure {
                            retry_after,
                            error: ConnectError::Status { status },
                        },
                        Err(error) => ConnectFailure { retry_after, error },
                    }
                } else {
                    error!(status = %status, "server responded with an unexpected status");
                    self.chain.clear();
                    ConnectFailure {
                        retry_after,
                        error: ConnectError::Status { status },
                    }
                }
            }
            err => {
                self.chain.clear();
                ConnectFailure {
                    retry_after: None,
                    error: ConnectError::Transport(err.to_string()),
                }
            }
        }
    }

    /// Follows a 3xx response: records it on the chain, consults the
    /// user's redirect check, rewrites `http`/`https` to `ws`/`wss`, and
    /// points the supervisor at the new URL for the next attempt.
    fn handle_redirect(
        &mut self,
        response: &tungstenite::handshake::client::Response,
    ) -> Result<(), ConnectError> {
        let status = response.status();
        // Appended before the check so the callback sees the full history.
        self.chain.push(RedirectResponse {
            status,
            url: self.cfg.url.clone(),
        });

        let target = response
            .headers()
            .get(http::header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|location| self.cfg.url.join(location).ok());
        let Some(mut target) = target else {
            error!(status = %status, "redirect without a valid location");
            return Err(ConnectError::NoLocation { status });
        };

        if let Err(err) = self.common.callbacks.check_redirect(&target, &self.chain) {
            return Err(ConnectError::RedirectRejected {
                url: target.to_string(),
                reason: err.to_string(),
            });
        }

        let scheme = match target.scheme() {
            "http" => Some("ws"),
            "https" => Some("wss"),
            _ => None,
        };
        if let Some(scheme) = scheme {
            let _ = target.set_scheme(scheme);
        }
        debug!(status = %status, url = %target, "following redirect");
        self.cfg.url = target;
        Ok(())
    }

    /// Runs the session on a live connection: first status report, sender
    /// and receiver tasks per agent, one shutdown coordinator per pair.
    async fn run_cycle_on(&self, stop: &CancellationToken, conn: &Arc<Connection>) {
        if self.common.is_stopping() {
            return;
        }

        self.common.prepare_first_message();

        let sender_cancel = stop.child_token();
        let mut started: Vec<Arc<WsSender>> = Vec::new();
        for (uid, agent) in &self.common.agents {
            let heartbeat = (agent.capabilities & capabilities::REPORTS_HEARTBEAT != 0)
                .then_some(self.cfg.heartbeat)
                .flatten();
            if let Err(err) = agent
                .sender
                .start(sender_cancel.clone(), conn.sink(), heartbeat)
                .await
            {
                error!(agent = %uid, error = %err, "failed to send first status report");
                sender_cancel.cancel();
                for sender in &started {
                    sender.stopped().cancelled().await;
                }
                return;
            }
            started.push(agent.sender.clone());
        }

        // The receivers' context is rooted outside the cycle so they can
        // keep draining frames, including the server's close frame, after
        // cycle cancellation.
        let receiver_cancel = CancellationToken::new();
        let shutdown_timeout = *self
            .shared
            .conn_shutdown_timeout
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        let mut coordinators = Vec::new();
        for (uid, agent) in &self.common.agents {
            let processor = ReceivedProcessor::new(
                *uid,
                agent.capabilities,
                self.common.callbacks.clone(),
                agent.sender.clone(),
                agent.synced_state.clone(),
                agent.packages_state.clone(),
                self.common.package_sync_mutex.clone(),
            );
            let receiver = WsReceiver::new(processor);
            let receiver_stopped = receiver.stopped();
            receiver.start(receiver_cancel.clone(), conn.stream());
            coordinators.push(tokio::spawn(coordinate_shutdown(
                agent.sender.clone(),
                receiver_stopped,
                sender_cancel.clone(),
                receiver_cancel.clone(),
                shutdown_timeout,
            )));
        }

        for coordinator in coordinators {
            let _ = coordinator.await;
        }
    }
}

/// Waits for either side of a (sender, receiver) pair to stop and winds
/// down the other.
///
/// The two branches encode the asymmetry of the close handshake: when the
/// sender initiated the close, the receiver gets up to `shutdown_timeout`
/// to observe the server's close frame; when the receiver died first the
/// connection is unusable and the sender is torn down immediately.
async fn coordinate_shutdown(
    sender: Arc<WsSender>,
    receiver_stopped: CancellationToken,
    sender_cancel: CancellationToken,
    receiver_cancel: CancellationToken,
    shutdown_timeout: Duration,
) {
    let sender_stopped = sender.stopped();
    tokio::select! {
        _ = sender_stopped.cancelled() => {
            if let Some(err) = sender.stopping_err() {
                debug!(error = %err, "error stopping the sender");
                receiver_cancel.cancel();
                receiver_stopped.cancelled().await;
            } else {
                debug!("waiting for receiver to stop");
                tokio::select! {
                    _ = receiver_stopped.cancelled() => debug!("receiver stopped"),
                    _ = tokio::time::sleep(shutdown_timeout) => {
                        debug!("timeout waiting for receiver to stop");
                        receiver_cancel.cancel();
                        receiver_stopped.cancelled().await;
                    }
                }
            }
        }
        _ = receiver_stopped.cancelled() => {
            // Reading failed, so the cycle is over; tear down the writer
            // and let the supervisor reconnect.
            sender_cancel.cancel();
            sender.stopped().cancelled().await;
        }
    }
}

fn client_request(
    url: &Url,
    headers: &HeaderMap,
) -> Result<tungstenite::handshake::client::Request, tungstenite::Error> {
    let mut request = url.as_str().into_client_request()?;
    for (name, value) in headers {
        request.headers_mut().append(name, value.clone());
    }
    Ok(request)
}

/// Extracts a delta-seconds `Retry-After` hint from a failed upgrade
/// response.
fn extract_retry_after(response: &tungstenite::handshake::client::Response) -> Option<Duration> {
    response
        .headers()
        .get(http::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::Message;

    use crate::callbacks::{Callbacks, NoopCallbacks};
    use crate::error::CallbackError;
    use crate::settings::AgentSettings;

    #[derive(Default)]
    struct TestCallbacks {
        connects: AtomicUsize,
        connect_failures: AtomicUsize,
        /// (next URL, prior responses seen) per check_redirect call.
        redirect_checks: StdMutex<Vec<(String, usize)>>,
        reject_redirects: bool,
    }

    impl Callbacks for TestCallbacks {
        fn on_connect(&self) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }

        fn on_connect_failed(&self, _err: &ConnectError) {
            self.connect_failures.fetch_add(1, Ordering::SeqCst);
        }

        fn check_redirect(
            &self,
            next: &Url,
            via: &[RedirectResponse],
        ) -> Result<(), CallbackError> {
            self.redirect_checks
                .lock()
                .unwrap()
                .push((next.to_string(), via.len()));
            if self.reject_redirects {
                return Err("redirects are not allowed".into());
            }
            Ok(())
        }
    }

    struct WsServer {
        url: String,
        accepts: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    /// Loopback WebSocket server. With `drop_first`, the first connection
    /// is dropped abruptly after one frame to simulate a connection reset.
    async fn ws_server(drop_first: bool) -> WsServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));

        let accepts_task = accepts.clone();
        let closes_task = closes.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let n = accepts_task.fetch_add(1, Ordering::SeqCst) + 1;
                let closes = closes_task.clone();
                tokio::spawn(async move {
                    use futures_util::StreamExt;
                    let Ok(mut ws) = accept_async(stream).await else {
                        return;
                    };
                    if drop_first && n == 1 {
                        let _ = ws.next().await;
                        return; // reset without close handshake
                    }
                    while let Some(msg) = ws.next().await {
                        match msg {
                            Ok(Message::Close(_)) => {
                                closes.fetch_add(1, Ordering::SeqCst);
                            }
                            Ok(_) => {}
                            Err(_) => break,
                        }
                    }
                });
            }
        });

        WsServer {
            url: format!("ws://{addr}/v1/opamp"),
            accepts,
            closes,
        }
    }

    /// Loopback server answering every connection with a fixed raw HTTP
    /// response, recording accept times.
    async fn raw_http_server(response: String) -> (String, Arc<AtomicUsize>, Arc<StdMutex<Vec<Instant>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(AtomicUsize::new(0));
        let times = Arc::new(StdMutex::new(Vec::new()));

        let accepts_task = accepts.clone();
        let times_task = times.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                accepts_task.fetch_add(1, Ordering::SeqCst);
                times_task.lock().unwrap().push(Instant::now());
                let response = response.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 2048];
                    let _ = stream.read(&mut buf).await;
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        (format!("ws://{addr}/"), accepts, times)
    }

    fn redirect_response(status: u16, location: &str) -> String {
        format!(
            "HTTP/1.1 {status} Redirect\r\nLocation: {location}\r\nContent-Length: 0\r\n\r\n"
        )
    }

    fn test_settings(url: &str, callbacks: Arc<dyn Callbacks>) -> StartSettings {
        let mut settings = StartSettings::new(url, callbacks);
        settings
            .agents
            .push(AgentSettings::new(InstanceUid::generate(), 0));
        settings
    }

    async fn wait_for(what: &str, condition: impl Fn() -> bool) {
        let result = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if condition() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(result.is_ok(), "timed out waiting for {what}");
    }

    fn test_supervisor(callbacks: Arc<dyn Callbacks>, url: &str) -> Supervisor {
        Supervisor {
            common: Arc::new(ClientCommon::new(callbacks, HashMap::new(), Vec::new())),
            shared: Arc::new(ClientShared::default()),
            cfg: ConnectConfig {
                url: Url::parse(url).unwrap(),
                get_header: Box::new(HeaderMap::new),
                tls_config: None,
                ws_config: WebSocketConfig::default(),
                heartbeat: None,
            },
            chain: Vec::new(),
        }
    }

    fn http_response(status: u16, location: Option<&str>) -> tungstenite::handshake::client::Response {
        let mut builder = http::Response::builder().status(status);
        if let Some(location) = location {
            builder = builder.header(http::header::LOCATION, location);
        }
        builder.body(None).unwrap()
    }

    #[test]
    fn redirect_rewrites_http_schemes_to_ws() {
        let mut sup = test_supervisor(Arc::new(NoopCallbacks), "ws://host1/");
        sup.handle_redirect(&http_response(307, Some("http://host2/a")))
            .unwrap();
        assert_eq!(sup.cfg.url.as_str(), "ws://host2/a");

        sup.handle_redirect(&http_response(308, Some("https://host3/b")))
            .unwrap();
        assert_eq!(sup.cfg.url.as_str(), "wss://host3/b");
        assert_eq!(sup.chain.len(), 2);
    }

    #[test]
    fn redirect_without_location_is_an_error() {
        let mut sup = test_supervisor(Arc::new(NoopCallbacks), "ws://host1/");
        let err = sup.handle_redirect(&http_response(302, None)).unwrap_err();
        assert!(matches!(err, ConnectError::NoLocation { .. }));
        // The response is still recorded on the chain.
        assert_eq!(sup.chain.len(), 1);
    }

    #[test]
    fn rejected_redirect_terminates_the_attempt() {
        let callbacks = Arc::new(TestCallbacks {
            reject_redirects: true,
            ..Default::default()
        });
        let mut sup = test_supervisor(callbacks.clone(), "ws://host1/");
        let err = sup
            .handle_redirect(&http_response(307, Some("http://host2/a")))
            .unwrap_err();
        assert!(matches!(err, ConnectError::RedirectRejected { .. }));
        // URL unchanged; the chain keeps the rejected response until the
        // next successful dial clears it.
        assert_eq!(sup.cfg.url.as_str(), "ws://host1/");
        assert_eq!(sup.chain.len(), 1);
    }

    #[test]
    fn retry_after_parses_delta_seconds() {
        let mut response = http_response(503, None);
        response
            .headers_mut()
            .insert(http::header::RETRY_AFTER, "10".parse().unwrap());
        assert_eq!(extract_retry_after(&response), Some(Duration::from_secs(10)));

        assert_eq!(extract_retry_after(&http_response(503, None)), None);
    }

    #[test]
    fn client_request_carries_extra_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer secret".parse().unwrap());
        let url = Url::parse("ws://example.com/v1/opamp").unwrap();
        let request = client_request(&url, &headers).unwrap();
        assert_eq!(
            request.headers().get("authorization").unwrap(),
            "Bearer secret"
        );
        // The upgrade headers are still in place.
        assert!(request.headers().get("sec-websocket-key").is_some());
    }

    #[test]
    fn lifecycle_misuse_is_rejected() {
        let client = WsClient::new();
        let settings = test_settings("ws://127.0.0.1:1/", Arc::new(NoopCallbacks));

        // Start before prepare.
        assert!(matches!(
            client.start(settings.clone()),
            Err(ClientError::NotPrepared)
        ));

        // Empty agent list.
        let empty = StartSettings::new("ws://127.0.0.1:1/", Arc::new(NoopCallbacks));
        assert!(matches!(
            client.prepare_start(&empty),
            Err(ClientError::InvalidConfig(_))
        ));

        client.prepare_start(&settings).unwrap();
        assert!(matches!(
            client.prepare_start(&settings),
            Err(ClientError::AlreadyPrepared)
        ));

        // Bad URL.
        let mut bad = settings.clone();
        bad.server_url = "not a url".into();
        assert!(matches!(client.start(bad), Err(ClientError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let client = WsClient::new();
        // Discard port: the supervisor just retries until stop.
        let settings = test_settings("ws://127.0.0.1:9/", Arc::new(NoopCallbacks));
        client.prepare_start(&settings).unwrap();
        client.start(settings.clone()).unwrap();

        assert!(matches!(
            client.start(settings),
            Err(ClientError::AlreadyStarted)
        ));
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn two_hop_redirect_reaches_the_final_server() {
        let final_srv = ws_server(false).await;
        let final_http = final_srv.url.replace("ws://", "http://");
        let (hop2_url, _, _) = raw_http_server(redirect_response(308, &final_http)).await;
        let hop2_http = hop2_url.replace("ws://", "http://");
        let (hop1_url, _, _) = raw_http_server(redirect_response(307, &hop2_http)).await;

        let callbacks = Arc::new(TestCallbacks::default());
        let client = WsClient::new();
        let settings = test_settings(&hop1_url, callbacks.clone());
        client.prepare_start(&settings).unwrap();
        client.start(settings).unwrap();

        wait_for("connection through both redirects", || {
            callbacks.connects.load(Ordering::SeqCst) == 1
        })
        .await;
        client.stop().await.unwrap();

        assert_eq!(final_srv.accepts.load(Ordering::SeqCst), 1);
        let checks = callbacks.redirect_checks.lock().unwrap().clone();
        assert_eq!(checks.len(), 2);
        // First check: one prior response, pointing at hop 2 (pre-rewrite).
        assert_eq!(checks[0].1, 1);
        assert!(checks[0].0.starts_with("http://"));
        // Second check: full two-response history, pointing at the final
        // server.
        assert_eq!(checks[1].1, 2);
        assert_eq!(checks[1].0, final_http);
    }

    #[tokio::test]
    async fn retry_after_delays_the_next_attempt() {
        let response =
            "HTTP/1.1 503 Service Unavailable\r\nRetry-After: 1\r\nContent-Length: 0\r\n\r\n";
        let (url, accepts, times) = raw_http_server(response.to_string()).await;

        let callbacks = Arc::new(TestCallbacks::default());
        let client = WsClient::new();
        let settings = test_settings(&url, callbacks.clone());
        client.prepare_start(&settings).unwrap();
        client.start(settings).unwrap();

        wait_for("two connection attempts", || {
            accepts.load(Ordering::SeqCst) >= 2
        })
        .await;
        client.stop().await.unwrap();

        let times = times.lock().unwrap();
        let gap = times[1].duration_since(times[0]);
        // Backoff alone would retry after ~500ms; the server asked for 1s.
        assert!(gap >= Duration::from_millis(950), "retried after {gap:?}");
        assert!(callbacks.connect_failures.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn clean_stop_performs_the_close_handshake() {
        let srv = ws_server(false).await;
        let callbacks = Arc::new(TestCallbacks::default());
        let client = WsClient::new();
        let settings = test_settings(&srv.url, callbacks.clone());
        client.prepare_start(&settings).unwrap();
        client.start(settings).unwrap();

        wait_for("connection", || callbacks.connects.load(Ordering::SeqCst) == 1).await;
        assert!(client.is_connected().await);

        tokio::time::timeout(Duration::from_secs(5), client.stop())
            .await
            .expect("stop timed out")
            .unwrap();

        // The sender initiated the close handshake and the server saw it.
        wait_for("close frame at the server", || {
            srv.closes.load(Ordering::SeqCst) >= 1
        })
        .await;
        // Cancellation is not a connection failure, and the socket is gone.
        assert_eq!(callbacks.connect_failures.load(Ordering::SeqCst), 0);
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn receiver_failure_triggers_reconnect_and_stop_is_final() {
        let srv = ws_server(true).await;
        let callbacks = Arc::new(TestCallbacks::default());
        let client = WsClient::new();
        let settings = test_settings(&srv.url, callbacks.clone());
        client.prepare_start(&settings).unwrap();
        client.start(settings).unwrap();

        // First connection is reset by the server; the supervisor starts a
        // fresh cycle on its own.
        wait_for("reconnect after reset", || {
            callbacks.connects.load(Ordering::SeqCst) >= 2
        })
        .await;

        tokio::time::timeout(Duration::from_secs(5), client.stop())
            .await
            .expect("stop timed out")
            .unwrap();

        // No further attempts or callbacks after stop.
        let accepts_after_stop = srv.accepts.load(Ordering::SeqCst);
        let connects_after_stop = callbacks.connects.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(srv.accepts.load(Ordering::SeqCst), accepts_after_stop);
        assert_eq!(callbacks.connects.load(Ordering::SeqCst), connects_after_stop);

        // Stop is idempotent.
        client.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn clean_sender_stop_bounds_the_receiver_wait() {
        let sender = Arc::new(WsSender::new(InstanceUid::generate()));
        let sender_stopped = sender.stopped();
        let receiver_stopped = CancellationToken::new();
        let sender_cancel = CancellationToken::new();
        let receiver_cancel = CancellationToken::new();

        // This receiver never observes a close frame; it only reacts to a
        // forced cancel.
        {
            let cancel = receiver_cancel.clone();
            let stopped = receiver_stopped.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                stopped.cancel();
            });
        }

        let coordinator = tokio::spawn(coordinate_shutdown(
            sender.clone(),
            receiver_stopped.clone(),
            sender_cancel,
            receiver_cancel.clone(),
            Duration::from_secs(5),
        ));

        // Sender finished cleanly; the receiver gets the shutdown window,
        // then is cancelled.
        sender_stopped.cancel();
        coordinator.await.unwrap();
        assert!(receiver_cancel.is_cancelled());
    }

    #[tokio::test]
    async fn receiver_failure_cancels_the_sender() {
        let sender = Arc::new(WsSender::new(InstanceUid::generate()));
        let sender_stopped = sender.stopped();
        let receiver_stopped = CancellationToken::new();
        let sender_cancel = CancellationToken::new();
        let receiver_cancel = CancellationToken::new();

        {
            let cancel = sender_cancel.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                sender_stopped.cancel();
            });
        }

        receiver_stopped.cancel();
        coordinate_shutdown(
            sender,
            receiver_stopped,
            sender_cancel.clone(),
            receiver_cancel,
            Duration::from_secs(5),
        )
        .await;
        assert!(sender_cancel.is_cancelled());
    }
}
