//! Weft Core Datapath
//!
//! The packet engine of the weft mesh VPN daemon:
//! - Peer, edge and connection tables with stable handles
//! - Anti-replay sliding window
//! - Payload compression (zlib and LZO)
//! - Path-MTU discovery
//! - UDP egress/ingress pipelines, TCP fallback, dispatch and broadcast
//!
//! Peer discovery, the authentication handshake, key exchange, graph
//! computation and routing proper are collaborators reached through the
//! `DatapathHooks` seam.

pub mod codec;
pub mod config;
pub mod datapath;
pub mod error;
pub mod mtu;
pub mod node;
pub mod replay;

#[cfg(test)]
pub(crate) mod testutil;

pub use codec::{Codec, MAX_COMPRESSION_LEVEL};
pub use config::DatapathConfig;
pub use datapath::{Datapath, DatapathHooks};
pub use error::{CoreError, CoreResult};
pub use mtu::{MTU_PROBE_INTERVAL, MTU_PROBE_MAX_NO_REPLY, MTU_PROBE_MAX_TOTAL};
pub use node::{
    ConnHandle, Connection, ConnectionTable, Edge, EdgeTable, Node, NodeHandle, NodeTable,
    PeerSession,
};
pub use replay::{ReplayVerdict, ReplayWindow, MAX_SEQNO};
