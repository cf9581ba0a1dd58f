//! Capability and flag bits carried in OpAMP status messages.

/// Agent capability bits reported in `AgentToServer::capabilities`.
///
/// `REPORTS_STATUS` is required by the protocol; the client forces it on.
pub mod capabilities {
    pub const REPORTS_STATUS: u64 = 1;
    pub const ACCEPTS_REMOTE_CONFIG: u64 = 1 << 1;
    pub const REPORTS_EFFECTIVE_CONFIG: u64 = 1 << 2;
    pub const REPORTS_PACKAGE_STATUSES: u64 = 1 << 3;
    pub const ACCEPTS_PACKAGES: u64 = 1 << 4;
    pub const ACCEPTS_OPAMP_CONNECTION_SETTINGS: u64 = 1 << 8;
    pub const ACCEPTS_RESTART_COMMAND: u64 = 1 << 10;
    pub const REPORTS_HEALTH: u64 = 1 << 11;
    pub const REPORTS_REMOTE_CONFIG: u64 = 1 << 12;
    pub const REPORTS_HEARTBEAT: u64 = 1 << 13;
    pub const REPORTS_AVAILABLE_COMPONENTS: u64 = 1 << 14;
}

/// Flag bits in `ServerToAgent::flags`.
pub mod server_flags {
    /// The server lost state and wants a full status report.
    pub const REPORT_FULL_STATE: u64 = 1;
    /// The server asks the agent to restart itself.
    pub const REQUEST_RESTART: u64 = 1 << 1;
}

/// Flag bits in `AgentToServer::flags`.
pub mod agent_flags {
    /// The agent asks the server to generate a new instance uid.
    pub const REQUEST_INSTANCE_UID: u64 = 1;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_bits_are_distinct() {
        assert_ne!(server_flags::REPORT_FULL_STATE, server_flags::REQUEST_RESTART);
        assert_eq!(
            server_flags::REPORT_FULL_STATE & server_flags::REQUEST_RESTART,
            0
        );
    }
}
