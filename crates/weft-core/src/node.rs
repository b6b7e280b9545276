//! Peer, Edge and Connection Tables
//!
//! The graph layer creates peers, edges and control connections; the
//! datapath reads and mutates them through stable integer handles into
//! arena tables. Records are never removed while the daemon runs, so a
//! handle stays valid for the lifetime of the process.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::{Index, IndexMut};
use std::time::Instant;

use weft_crypto::{PacketDigest, SessionCipher};
use weft_network::{ControlChannel, MTU};

use crate::codec::MAX_COMPRESSION_LEVEL;
use crate::error::{CoreError, CoreResult};
use crate::replay::ReplayWindow;

/// Stable handle to a peer record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle(pub u32);

/// Stable handle to a control connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnHandle(pub u32);

/// Freshly negotiated keying material and codec levels for one peer
pub struct PeerSession {
    /// Cipher for packets we receive
    pub incipher: SessionCipher,
    /// Cipher for packets we send
    pub outcipher: SessionCipher,
    /// MAC on packets we receive, if negotiated
    pub indigest: Option<PacketDigest>,
    /// MAC on packets we send, if negotiated
    pub outdigest: Option<PacketDigest>,
    /// Compression level on packets we receive (0..=11)
    pub incompression: u8,
    /// Compression level on packets we send (0..=11)
    pub outcompression: u8,
}

impl PeerSession {
    /// Session with null ciphers, no MAC and no compression (a negotiated
    /// "none" suite)
    pub fn null() -> Self {
        Self {
            incipher: SessionCipher::Null,
            outcipher: SessionCipher::Null,
            indigest: None,
            outdigest: None,
            incompression: 0,
            outcompression: 0,
        }
    }
}

/// A remote peer as seen by the datapath.
///
/// The record is created by the graph layer; the datapath owns the session,
/// sequence and MTU state within it.
pub struct Node {
    /// Peer name (diagnostics only)
    pub name: String,
    /// Peer hostname (diagnostics only)
    pub hostname: String,

    /// Cipher for packets this peer sends us; `None` until keys exist
    pub incipher: Option<SessionCipher>,
    /// Cipher for packets we send this peer
    pub outcipher: Option<SessionCipher>,
    /// MAC on packets this peer sends us
    pub indigest: Option<PacketDigest>,
    /// MAC on packets we send this peer
    pub outdigest: Option<PacketDigest>,
    /// Inbound compression level
    pub incompression: u8,
    /// Outbound compression level
    pub outcompression: u8,
    /// The peer holds a usable copy of our key
    pub validkey: bool,
    /// A key request is already in flight
    pub waitingforkey: bool,

    /// Outbound sequence counter; wraps only across a key rotation
    pub sent_seqno: u32,
    /// Inbound sequence window
    pub replay: ReplayWindow,

    /// Current UDP endpoint
    pub address: Option<SocketAddr>,

    /// Peer used to forward towards this one
    pub nexthop: Option<NodeHandle>,
    /// Peer at which packets are re-encrypted
    pub via: Option<NodeHandle>,
    /// Bound control connection, if any
    pub connection: Option<ConnHandle>,

    /// Working path MTU towards this peer
    pub mtu: u16,
    /// Largest probe size confirmed by a reply
    pub minmtu: u16,
    /// Smallest size known to be undeliverable, minus one
    pub maxmtu: u16,
    /// Probe rounds attempted since discovery started
    pub mtuprobes: u32,
    /// Next probe round, while discovery is active
    pub mtu_deadline: Option<Instant>,

    /// The graph layer found a path to this peer
    pub reachable: bool,
    /// Force TCP for traffic to this peer
    pub tcp_only: bool,
    /// Hold UDP traffic until a usable MTU is known
    pub pmtu_discovery: bool,
}

impl Node {
    /// Fresh peer record with no session and default MTU bounds
    pub fn new(name: String, hostname: String) -> Self {
        Self {
            name,
            hostname,
            incipher: None,
            outcipher: None,
            indigest: None,
            outdigest: None,
            incompression: 0,
            outcompression: 0,
            validkey: false,
            waitingforkey: false,
            sent_seqno: 0,
            replay: ReplayWindow::new(),
            address: None,
            nexthop: None,
            via: None,
            connection: None,
            mtu: MTU as u16,
            minmtu: 0,
            maxmtu: MTU as u16,
            mtuprobes: 0,
            mtu_deadline: None,
            reachable: false,
            tcp_only: false,
            pmtu_discovery: false,
        }
    }

    /// Install a new session and reset all sequencing state
    pub fn install_session(&mut self, session: PeerSession) -> CoreResult<()> {
        if session.incompression > MAX_COMPRESSION_LEVEL {
            return Err(CoreError::InvalidCompressionLevel(session.incompression));
        }
        if session.outcompression > MAX_COMPRESSION_LEVEL {
            return Err(CoreError::InvalidCompressionLevel(session.outcompression));
        }

        self.incipher = Some(session.incipher);
        self.outcipher = Some(session.outcipher);
        self.indigest = session.indigest;
        self.outdigest = session.outdigest;
        self.incompression = session.incompression;
        self.outcompression = session.outcompression;
        self.validkey = true;
        self.waitingforkey = false;
        self.sent_seqno = 0;
        self.replay.reset();
        Ok(())
    }

    /// MAC bytes expected on each inbound packet
    pub fn digest_len(&self) -> usize {
        self.indigest.as_ref().map_or(0, |d| d.length())
    }

    /// Reset MTU discovery state (the peer just became reachable)
    pub fn reset_mtu(&mut self) {
        self.mtu = MTU as u16;
        self.minmtu = 0;
        self.maxmtu = MTU as u16;
        self.mtuprobes = 0;
        self.mtu_deadline = None;
    }
}

/// Arena of peer records plus the UDP address index
#[derive(Default)]
pub struct NodeTable {
    nodes: Vec<Node>,
    by_udp: HashMap<SocketAddr, NodeHandle>,
}

impl NodeTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a peer; its address, if any, joins the UDP index
    pub fn add(&mut self, node: Node) -> NodeHandle {
        let handle = NodeHandle(self.nodes.len() as u32);
        if let Some(addr) = node.address {
            self.by_udp.insert(addr, handle);
        }
        self.nodes.push(node);
        handle
    }

    /// Number of peers
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when no peers exist
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterate all handles
    pub fn handles(&self) -> impl Iterator<Item = NodeHandle> {
        (0..self.nodes.len() as u32).map(NodeHandle)
    }

    /// Address-index lookup for an incoming datagram source
    pub fn lookup_udp(&self, addr: &SocketAddr) -> Option<NodeHandle> {
        self.by_udp.get(addr).copied()
    }

    /// Move a peer to a newly confirmed UDP endpoint
    pub fn update_udp(&mut self, handle: NodeHandle, addr: SocketAddr) {
        if let Some(old) = self.nodes[handle.0 as usize].address {
            self.by_udp.remove(&old);
        }
        self.nodes[handle.0 as usize].address = Some(addr);
        self.by_udp.insert(addr, handle);
    }
}

impl Index<NodeHandle> for NodeTable {
    type Output = Node;

    fn index(&self, handle: NodeHandle) -> &Node {
        &self.nodes[handle.0 as usize]
    }
}

impl IndexMut<NodeHandle> for NodeTable {
    fn index_mut(&mut self, handle: NodeHandle) -> &mut Node {
        &mut self.nodes[handle.0 as usize]
    }
}

/// A directed edge in the peer graph, as the datapath sees it
pub struct Edge {
    /// Peer this edge leads to
    pub to: NodeHandle,
    /// Endpoint address recorded for the edge
    pub address: SocketAddr,
}

/// Edge list, kept in graph-weight order by the graph layer; the datapath
/// only iterates it during fuzzy source lookup
#[derive(Default)]
pub struct EdgeTable {
    edges: Vec<Edge>,
}

impl EdgeTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an edge
    pub fn add(&mut self, edge: Edge) {
        self.edges.push(edge);
    }

    /// Iterate edges in weight order
    pub fn iter(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter()
    }
}

/// A control connection bound to a peer
pub struct Connection {
    /// The peer on the far side
    pub node: NodeHandle,
    /// Connection is established and carries traffic
    pub active: bool,
    /// Connection is an edge of the broadcast spanning tree
    pub mst: bool,
    /// The connection was negotiated as TCP-only
    pub tcp_only: bool,
    /// Outbound packet queue towards the connection's writer task
    pub channel: ControlChannel,
}

/// Arena of control connections
#[derive(Default)]
pub struct ConnectionTable {
    conns: Vec<Connection>,
}

impl ConnectionTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection
    pub fn add(&mut self, conn: Connection) -> ConnHandle {
        let handle = ConnHandle(self.conns.len() as u32);
        self.conns.push(conn);
        handle
    }

    /// Number of connections
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// True when no connections exist
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Iterate all handles
    pub fn handles(&self) -> impl Iterator<Item = ConnHandle> {
        (0..self.conns.len() as u32).map(ConnHandle)
    }
}

impl Index<ConnHandle> for ConnectionTable {
    type Output = Connection;

    fn index(&self, handle: ConnHandle) -> &Connection {
        &self.conns[handle.0 as usize]
    }
}

impl IndexMut<ConnHandle> for ConnectionTable {
    fn index_mut(&mut self, handle: ConnHandle) -> &mut Connection {
        &mut self.conns[handle.0 as usize]
    }
}
