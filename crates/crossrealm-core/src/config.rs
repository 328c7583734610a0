//! Centralized configuration for crossrealm.
//!
//! Protocol constants and limits shared by every realm. Anything a deployment
//! may want to change per realm is exposed through
//! [`RealmBuilder`](crate::realm::RealmBuilder) instead.

use std::time::Duration;

/// Messaging-level configuration.
pub struct MessagingConfig;

impl MessagingConfig {
    /// Declared purpose of channels accepted by default.
    pub const DEFAULT_PURPOSE: &'static str = "crossrealm";
    /// How long `Realm::connect` waits for the acknowledgement frame.
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
    /// Upper bound on outstanding calls tracked by one realm.
    pub const MAX_PENDING_CALLS: usize = 8192;
    /// Upper bound on handlers one realm runs at once for its callers.
    pub const MAX_INBOUND_CALLS: usize = 1024;
    /// Deepest `cause` chain carried by an encoded error.
    pub const MAX_ERROR_CAUSE_DEPTH: usize = 8;
    /// Reserved envelope type for the connection acknowledgement.
    pub const ACK_TYPE: &'static str = "__CROSSREALM_ACK__";
}

/// Transport-level configuration.
pub struct TransportConfig;

impl TransportConfig {
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const MAX_CONNECTIONS: usize = 256;
}
