//! Weft Network Layer
//!
//! I/O plumbing consumed by the datapath:
//! - Packet buffer type and size constants
//! - UDP listen socket set with per-socket TOS state
//! - Length-prefixed packet framing for the TCP control channel
//! - TAP device access

pub mod error;
pub mod packet;
pub mod tcp;
pub mod transport;
pub mod tun;

pub use error::{NetworkError, NetworkResult};
pub use packet::{VpnPacket, ETH_ALEN, ETH_HEADER_LEN, MAXSIZE, MTU, PRIORITY_TCP_ONLY};
pub use tcp::{ControlChannel, FrameDecoder};
pub use transport::{Datagram, DatagramSink, ListenSocketSet, SendOutcome};
pub use tun::{OsTap, TapConfig, TapDevice};
