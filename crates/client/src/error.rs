//! Error types for the OpAMP client.

use std::time::Duration;

use opamp_protocol::messages::InstanceUid;

/// Errors surfaced synchronously from the public client API.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid server URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("client is already prepared")]
    AlreadyPrepared,

    #[error("client is already started")]
    AlreadyStarted,

    #[error("client has not been prepared")]
    NotPrepared,

    #[error("unknown agent: {0}")]
    UnknownAgent(InstanceUid),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("capability is not set: {0}")]
    CapabilityNotSet(&'static str),

    #[error("outbound queue is full")]
    QueueFull,
}

/// Failure of one connection attempt. Delivered to
/// [`Callbacks::on_connect_failed`](crate::Callbacks::on_connect_failed)
/// and retried by the supervisor.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectError {
    #[error("WebSocket connect failed: {0}")]
    Transport(String),

    #[error("server responded with status {status}")]
    Status { status: http::StatusCode },

    #[error("{status} redirect with no valid location")]
    NoLocation { status: http::StatusCode },

    #[error("redirect to {url} rejected: {reason}")]
    RedirectRejected { url: String, reason: String },
}

/// One failed connection attempt together with the server's retry hint.
#[derive(Debug)]
pub(crate) struct ConnectFailure {
    pub retry_after: Option<Duration>,
    pub error: ConnectError,
}

/// Terminal error of a sender's writer loop.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SenderError {
    #[error("failed to send message: {0}")]
    SendFailed(String),
}

/// Error returned by a user callback. Logged by the client, never fatal.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct CallbackError(pub String);

impl From<&str> for CallbackError {
    fn from(msg: &str) -> Self {
        Self(msg.to_string())
    }
}

impl From<String> for CallbackError {
    fn from(msg: String) -> Self {
        Self(msg)
    }
}
