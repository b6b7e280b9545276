//! Test doubles for the packet pipelines.
//!
//! A `MockSink` records outgoing datagrams (and can refuse anything above a
//! fake path MTU); `RecordingHooks` records every collaborator call. Tests
//! drive the real pipelines against these seams.

use std::net::SocketAddr;

use weft_network::{DatagramSink, SendOutcome, VpnPacket};

use crate::config::DatapathConfig;
use crate::datapath::{Datapath, DatapathHooks};
use crate::node::{ConnHandle, Node, NodeHandle, PeerSession};

/// Records every datagram the egress pipeline emits
#[derive(Default)]
pub struct MockSink {
    pub sent: Vec<(Vec<u8>, SocketAddr, i32)>,
    /// Datagrams larger than this report `MessageTooBig`
    pub mtu_limit: Option<usize>,
}

impl DatagramSink for MockSink {
    fn send_datagram(&mut self, datagram: &[u8], to: SocketAddr, priority: i32) -> SendOutcome {
        if let Some(limit) = self.mtu_limit {
            if datagram.len() > limit {
                return SendOutcome::MessageTooBig;
            }
        }
        self.sent.push((datagram.to_vec(), to, priority));
        SendOutcome::Sent
    }
}

/// Records every collaborator call the datapath makes
#[derive(Default)]
pub struct RecordingHooks {
    pub routed: Vec<(NodeHandle, VpnPacket)>,
    pub written: Vec<VpnPacket>,
    pub req_key: Vec<NodeHandle>,
    pub regenerated: usize,
    pub terminated: Vec<ConnHandle>,
}

impl DatapathHooks for RecordingHooks {
    fn route(&mut self, from: NodeHandle, packet: &VpnPacket) {
        self.routed.push((from, packet.clone()));
    }

    fn regenerate_key(&mut self) {
        self.regenerated += 1;
    }

    fn send_req_key(&mut self, node: NodeHandle) {
        self.req_key.push(node);
    }

    fn terminate_connection(&mut self, conn: ConnHandle) {
        self.terminated.push(conn);
    }

    fn write_packet(&mut self, packet: &VpnPacket) {
        self.written.push(packet.clone());
    }
}

pub type TestDatapath = Datapath<MockSink, RecordingHooks>;

/// Datapath with default configuration and recording seams
pub fn test_datapath() -> TestDatapath {
    test_datapath_with(DatapathConfig::default())
}

/// Datapath with the given configuration and recording seams
pub fn test_datapath_with(config: DatapathConfig) -> TestDatapath {
    Datapath::new(config, MockSink::default(), RecordingHooks::default()).unwrap()
}

/// Add a reachable direct peer with a null session and an indexed address
pub fn add_peer(dp: &mut TestDatapath, name: &str, addr: &str) -> NodeHandle {
    let addr: SocketAddr = addr.parse().unwrap();
    let mut node = Node::new(name.into(), addr.ip().to_string());
    node.address = Some(addr);
    node.reachable = true;
    let handle = dp.nodes.add(node);
    dp.nodes[handle].nexthop = Some(handle);
    dp.nodes[handle].via = Some(handle);
    dp.nodes[handle]
        .install_session(PeerSession::null())
        .unwrap();
    handle
}
