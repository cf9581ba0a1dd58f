//! OpAMP message types exchanged over the WebSocket transport.
//!
//! Only the fields the client inspects or reports are modelled. Every
//! payload field is optional: an absent field means "no change, no action"
//! on the receiving side, so all of them serialize as omitted and
//! deserialize from missing keys.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier of one managed agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceUid(Uuid);

impl InstanceUid {
    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl From<Uuid> for InstanceUid {
    fn from(uid: Uuid) -> Self {
        Self(uid)
    }
}

impl std::fmt::Display for InstanceUid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Status report sent from an agent to the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentToServer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_uid: Option<InstanceUid>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub sequence_num: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub capabilities: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub flags: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_description: Option<AgentDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<ComponentHealth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_config_status: Option<RemoteConfigStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_statuses: Option<PackageStatuses>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_capabilities: Option<CustomCapabilities>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_message: Option<CustomMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_components: Option<AvailableComponents>,
    /// Hash of the effective configuration currently in use.
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub effective_config_hash: Vec<u8>,
    /// Hash of the last connection settings the agent accepted. Reported in
    /// the first status message after connecting, then omitted.
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub last_connection_settings_hash: Vec<u8>,
}

/// Directive message sent from the server to one agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerToAgent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_uid: Option<InstanceUid>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub flags: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_response: Option<ServerErrorResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_config: Option<AgentRemoteConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_settings: Option<ConnectionSettingsOffers>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packages_available: Option<PackagesAvailable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_message: Option<CustomMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_ack: Option<HeartbeatAck>,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

/// One key/value attribute of an agent description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// Attributes identifying and describing an agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDescription {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identifying_attributes: Vec<KeyValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub non_identifying_attributes: Vec<KeyValue>,
}

impl AgentDescription {
    pub fn is_empty(&self) -> bool {
        self.identifying_attributes.is_empty() && self.non_identifying_attributes.is_empty()
    }
}

/// Health of the agent or one of its components.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentHealth {
    #[serde(default)]
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub start_time_unix_nano: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub status_time_unix_nano: u64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub component_health_map: HashMap<String, ComponentHealth>,
}

/// Outcome of applying a remote configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteConfigStatuses {
    #[default]
    Unset,
    Applied,
    Applying,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfigStatus {
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub last_remote_config_hash: Vec<u8>,
    #[serde(default)]
    pub status: RemoteConfigStatuses,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
}

/// One named configuration file offered by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfigFile {
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<u8>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfigMap {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub config_map: HashMap<String, AgentConfigFile>,
}

/// Remote configuration pushed by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRemoteConfig {
    #[serde(default)]
    pub config: AgentConfigMap,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub config_hash: Vec<u8>,
}

/// A package version the server offers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageAvailable {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub hash: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackagesAvailable {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub packages: HashMap<String, PackageAvailable>,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub all_packages_hash: Vec<u8>,
}

/// Installation state of one package on the agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageStatusEnum {
    #[default]
    Installed,
    InstallPending,
    Installing,
    InstallFailed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_has_version: String,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub agent_has_hash: Vec<u8>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server_offered_version: String,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub server_offered_hash: Vec<u8>,
    #[serde(default)]
    pub status: PackageStatusEnum,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageStatuses {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub packages: HashMap<String, PackageStatus>,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub server_provided_all_packages_hash: Vec<u8>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
}

/// Settings for connecting to an (alternative) OpAMP endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpAmpConnectionSettings {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub destination_endpoint: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<KeyValue>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub heartbeat_interval_seconds: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSettingsOffers {
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub hash: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opamp: Option<OpAmpConnectionSettings>,
}

/// Non-standard capabilities announced by either side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomCapabilities {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
}

/// An application-defined message routed through the protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomMessage {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub capability: String,
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub message_type: String,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,
}

/// Inventory of components the agent can run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableComponents {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub components: HashMap<String, ComponentDetails>,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub hash: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentDetails {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<KeyValue>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerErrorResponseType {
    #[default]
    Unknown,
    BadRequest,
    Unavailable,
}

/// Error the server reports back instead of processing a status message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerErrorResponse {
    #[serde(default, rename = "type")]
    pub error_type: ServerErrorResponseType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
}

/// Acknowledgement of an agent heartbeat. Carries no payload; its presence
/// is the signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatAck {}

/// Serializes `Vec<u8>` as base64, matching Go's `[]byte` JSON encoding.
mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(data).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_to_agent_empty_omits_all_fields() {
        let msg = ServerToAgent::default();
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, "{}");
    }

    #[test]
    fn server_to_agent_absent_fields_deserialize_as_none() {
        let msg: ServerToAgent = serde_json::from_str("{}").unwrap();
        assert_eq!(msg.flags, 0);
        assert!(msg.remote_config.is_none());
        assert!(msg.connection_settings.is_none());
        assert!(msg.packages_available.is_none());
        assert!(msg.custom_message.is_none());
        assert!(msg.heartbeat_ack.is_none());
        assert!(msg.error_response.is_none());
    }

    #[test]
    fn agent_to_server_roundtrip() {
        let msg = AgentToServer {
            instance_uid: Some(InstanceUid::generate()),
            sequence_num: 3,
            capabilities: crate::constants::capabilities::REPORTS_STATUS,
            agent_description: Some(AgentDescription {
                identifying_attributes: vec![KeyValue {
                    key: "service.name".into(),
                    value: "io.opamp.test".into(),
                }],
                non_identifying_attributes: vec![],
            }),
            health: Some(ComponentHealth {
                healthy: true,
                ..Default::default()
            }),
            last_connection_settings_hash: vec![0xAB, 0xCD],
            ..Default::default()
        };
        let json = serde_json::to_vec(&msg).unwrap();
        let parsed: AgentToServer = serde_json::from_slice(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn byte_fields_encode_as_base64() {
        let status = RemoteConfigStatus {
            last_remote_config_hash: vec![0xDE, 0xAD],
            status: RemoteConfigStatuses::Applied,
            error_message: String::new(),
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"3q0=\""), "expected base64 hash in {json}");
    }

    #[test]
    fn custom_message_type_field_rename() {
        let msg = CustomMessage {
            capability: "io.opamp.custom".into(),
            message_type: "probe".into(),
            data: vec![1, 2],
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"probe\""));
    }
}
