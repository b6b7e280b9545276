//! Datapath configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Process-wide options the datapath consults on every packet
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatapathConfig {
    /// Name of the local node (diagnostics)
    pub name: String,

    /// Mirror each frame's TOS value onto the outgoing IPv4 socket
    pub priority_inheritance: bool,

    /// Do not relay broadcasts: the spanning tree is not trusted here
    pub tunnel_server: bool,

    /// Force TCP for all traffic to and from this node
    pub tcp_only: bool,

    /// Overwrite the MAC field of locally delivered frames with this address
    pub overwrite_mac: Option<[u8; 6]>,

    /// How long session keys may be used before regeneration, in seconds
    pub key_lifetime_secs: u64,
}

impl Default for DatapathConfig {
    fn default() -> Self {
        Self {
            name: "weft".into(),
            priority_inheritance: false,
            tunnel_server: false,
            tcp_only: false,
            overwrite_mac: None,
            key_lifetime_secs: 3600,
        }
    }
}

impl DatapathConfig {
    /// Key lifetime as a duration
    pub fn key_lifetime(&self) -> Duration {
        Duration::from_secs(self.key_lifetime_secs)
    }
}
