//! OpAMP wire messages and the envelope codec used by the WebSocket client.

pub mod constants;
pub mod envelope;
pub mod messages;

pub use envelope::{EnvelopeError, decode_message, encode_message};
pub use messages::{AgentToServer, InstanceUid, ServerToAgent};
