//! VPN Packet Datapath
//!
//! The pipelines that carry Ethernet frames between the local device and
//! remote peers:
//! - UDP egress: compress, sequence, encrypt, MAC, send
//! - UDP ingress: identify peer, verify MAC, decrypt, replay-check,
//!   decompress, dispatch
//! - TCP fallback over the peer control channel
//! - Transport chooser and spanning-tree broadcast
//!
//! Every failure is local to its packet: the pipelines log and drop, and
//! nothing here aborts the daemon. The whole datapath runs on one
//! cooperative task, so no packet holds state across an I/O suspension.

use std::mem;
use std::net::SocketAddr;
use std::time::Instant;

use tracing::{debug, error, warn};

use weft_network::packet::PRIORITY_TCP_ONLY;
use weft_network::{DatagramSink, SendOutcome, VpnPacket, ETH_ALEN, MTU};

use crate::codec::Codec;
use crate::config::DatapathConfig;
use crate::error::CoreResult;
use crate::node::{ConnHandle, ConnectionTable, EdgeTable, Node, NodeHandle, NodeTable};
use crate::replay::ReplayVerdict;

/// Size of the wire sequence number field
pub(crate) const SEQNO_LEN: usize = 4;

/// Rough per-packet compression overhead, used only to estimate the
/// original length of a decompressed probe. A heuristic, not a contract.
const COMPRESSION_OVERHEAD: usize = MTU / 64 + 20;

/// Collaborators the datapath drives.
///
/// Routing, key exchange, connection teardown and the device writer live
/// outside the packet pipelines. The daemon wires them to the real world;
/// tests record them.
pub trait DatapathHooks {
    /// Deliver a verified frame to the routing layer
    fn route(&mut self, from: NodeHandle, packet: &VpnPacket);

    /// Ask the handshake layer to regenerate the session keys
    fn regenerate_key(&mut self);

    /// Ask the handshake layer to start a key exchange with one peer
    fn send_req_key(&mut self, node: NodeHandle);

    /// A control connection failed a write and must be torn down
    fn terminate_connection(&mut self, conn: ConnHandle);

    /// Hand a frame to the local device
    fn write_packet(&mut self, packet: &VpnPacket);
}

/// Scratch buffer pair reused across pipeline stages
#[derive(Default)]
struct Scratch {
    a: Vec<u8>,
    b: Vec<u8>,
}

/// The packet datapath: peer tables, pipelines and per-process state
pub struct Datapath<S: DatagramSink, H: DatapathHooks> {
    /// Peer records plus the UDP address index
    pub nodes: NodeTable,
    /// Control connections
    pub conns: ConnectionTable,
    /// Graph edges, iterated during fuzzy source lookup
    pub edges: EdgeTable,

    myself: NodeHandle,
    config: DatapathConfig,
    codec: Codec,
    sockets: S,
    hooks: H,
    scratch: Scratch,
    key_expires: Option<Instant>,
}

impl<S: DatagramSink, H: DatapathHooks> Datapath<S, H> {
    /// Build a datapath around its collaborator seams
    pub fn new(config: DatapathConfig, sockets: S, hooks: H) -> CoreResult<Self> {
        let mut nodes = NodeTable::new();
        let mut local = Node::new(config.name.clone(), config.name.clone());
        local.reachable = true;
        local.tcp_only = config.tcp_only;
        let myself = nodes.add(local);

        Ok(Self {
            nodes,
            conns: ConnectionTable::new(),
            edges: EdgeTable::new(),
            myself,
            config,
            codec: Codec::new()?,
            sockets,
            hooks,
            scratch: Scratch::default(),
            key_expires: None,
        })
    }

    /// Handle of the local node
    pub fn myself(&self) -> NodeHandle {
        self.myself
    }

    /// Datapath configuration
    pub fn config(&self) -> &DatapathConfig {
        &self.config
    }

    /// Collaborator seam (read side)
    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// Collaborator seam (write side)
    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }

    /// Datagram sink (read side)
    pub fn sockets(&self) -> &S {
        &self.sockets
    }

    /// Datagram sink (write side)
    pub fn sockets_mut(&mut self) -> &mut S {
        &mut self.sockets
    }

    // =====================
    // Lifecycle
    // =====================

    /// Mark a peer (un)reachable. Becoming reachable resets MTU discovery
    /// and starts probing when the peer asked for it.
    pub fn set_reachable(&mut self, n: NodeHandle, reachable: bool, now: Instant) {
        let node = &mut self.nodes[n];
        node.reachable = reachable;
        node.reset_mtu();
        if reachable && node.pmtu_discovery {
            self.send_mtu_probe(n, now);
        }
    }

    /// Restart the key-lifetime clock (keys were just regenerated)
    pub fn reset_key_timer(&mut self, now: Instant) {
        self.key_expires = Some(now + self.config.key_lifetime());
    }

    /// True once the session keys outlived their configured lifetime
    pub fn key_expired(&self, now: Instant) -> bool {
        self.key_expires.is_some_and(|at| now >= at)
    }

    /// When the current keys expire, if a timer is armed
    pub fn key_expires(&self) -> Option<Instant> {
        self.key_expires
    }

    // =====================
    // Ingress
    // =====================

    /// A device readability event produced one frame: hand it to routing
    pub fn handle_device_packet(&mut self, packet: VpnPacket) {
        self.hooks.route(self.myself, &packet);
    }

    /// Ingress entry point for one raw UDP datagram
    pub fn handle_incoming_datagram(&mut self, from: SocketAddr, datagram: &[u8]) {
        let from = unmap_v4(from);

        let n = match self.nodes.lookup_udp(&from) {
            Some(n) => n,
            None => match self.try_harder(&from, datagram) {
                Some(n) => {
                    self.nodes.update_udp(n, from);
                    n
                }
                None => {
                    debug!("Received UDP packet from unknown source {}", from);
                    return;
                }
            },
        };

        self.receive_udppacket(n, datagram);
    }

    /// A framed packet arrived on a control connection
    pub fn receive_tcp_packet(&mut self, conn: ConnHandle, buffer: &[u8]) {
        let c = &self.conns[conn];
        // A packet that arrived over TCP by necessity must not leave TCP
        // before delivery; TCP-only connections carry ordinary traffic.
        let priority = if c.tcp_only { 0 } else { PRIORITY_TCP_ONLY };
        let node = c.node;

        let packet = VpnPacket::with_priority(buffer.to_vec(), priority);
        self.receive_packet(node, &packet);
    }

    fn receive_packet(&mut self, n: NodeHandle, packet: &VpnPacket) {
        let node = &self.nodes[n];
        debug!(
            "Received packet of {} bytes from {} ({})",
            packet.len(),
            node.name,
            node.hostname
        );
        self.hooks.route(n, packet);
    }

    /// True when `n`'s inbound digest authenticates this datagram
    fn try_mac(&self, n: NodeHandle, datagram: &[u8]) -> bool {
        let node = &self.nodes[n];
        let Some(digest) = node.indigest.as_ref() else {
            return false;
        };
        if datagram.len() < SEQNO_LEN + digest.length() {
            return false;
        }
        let (body, tag) = datagram.split_at(datagram.len() - digest.length());
        digest.verify(body, tag)
    }

    /// Fuzzy source lookup: the first edge matching `from` by address
    /// (ignoring the port) whose peer authenticates the datagram wins.
    fn try_harder(&self, from: &SocketAddr, datagram: &[u8]) -> Option<NodeHandle> {
        for edge in self.edges.iter() {
            if edge.address.ip() != from.ip() {
                continue;
            }
            if self.try_mac(edge.to, datagram) {
                return Some(edge.to);
            }
        }
        None
    }

    /// UDP ingress pipeline: verify MAC, decrypt, replay-check, decompress,
    /// dispatch
    fn receive_udppacket(&mut self, n: NodeHandle, datagram: &[u8]) {
        {
            let node = &self.nodes[n];

            if node.incipher.is_none() {
                debug!(
                    "Got packet from {} ({}) but there is no session key yet",
                    node.name, node.hostname
                );
                return;
            }

            if datagram.len() < SEQNO_LEN + node.digest_len() {
                debug!(
                    "Got too short packet from {} ({})",
                    node.name, node.hostname
                );
                return;
            }
        }

        // The MAC covers seqno || ciphertext and is checked before any
        // decryption happens.
        let body = match self.nodes[n].indigest.as_ref() {
            Some(digest) => {
                let (body, tag) = datagram.split_at(datagram.len() - digest.length());
                if !digest.verify(body, tag) {
                    let node = &self.nodes[n];
                    debug!(
                        "Got unauthenticated packet from {} ({})",
                        node.name, node.hostname
                    );
                    return;
                }
                body
            }
            None => datagram,
        };

        // The sequence number sits inside the encrypted range.
        let plaintext = {
            let node = &self.nodes[n];
            let Some(cipher) = node.incipher.as_ref() else {
                return;
            };
            match cipher.decrypt(body) {
                Ok(plaintext) => plaintext,
                Err(_) => {
                    debug!(
                        "Error decrypting packet from {} ({})",
                        node.name, node.hostname
                    );
                    return;
                }
            }
        };

        if plaintext.len() < SEQNO_LEN {
            let node = &self.nodes[n];
            debug!(
                "Got too short packet from {} ({})",
                node.name, node.hostname
            );
            return;
        }

        let seqno = u32::from_be_bytes([plaintext[0], plaintext[1], plaintext[2], plaintext[3]]);
        let payload = &plaintext[SEQNO_LEN..];

        match self.nodes[n].replay.check(seqno) {
            ReplayVerdict::Reject => {
                let node = &self.nodes[n];
                debug!(
                    "Got late or replayed packet from {} ({}), seqno {}, last received {}",
                    node.name,
                    node.hostname,
                    seqno,
                    node.replay.received_seqno()
                );
                return;
            }
            ReplayVerdict::AcceptWithLoss { lost } => {
                let node = &self.nodes[n];
                warn!(
                    "Lost {} packets from {} ({})",
                    lost, node.name, node.hostname
                );
            }
            ReplayVerdict::Accept => {}
        }

        if self.nodes[n].replay.needs_rekey() {
            self.hooks.regenerate_key();
        }

        let mut origlen = payload.len();
        let level = self.nodes[n].incompression;
        let data = if level > 0 {
            let mut out = Vec::new();
            if self.codec.decompress(&mut out, payload, level).is_err() {
                let node = &self.nodes[n];
                error!(
                    "Error while uncompressing packet from {} ({})",
                    node.name, node.hostname
                );
                return;
            }
            origlen = origlen.saturating_sub(COMPRESSION_OVERHEAD);
            out
        } else {
            payload.to_vec()
        };

        let packet = VpnPacket::new(data);
        if packet.is_probe() {
            self.handle_mtu_probe(n, packet, origlen);
        } else {
            self.receive_packet(n, &packet);
        }
    }

    // =====================
    // Egress
    // =====================

    /// Transport chooser: deliver locally, or send towards `n` over UDP or
    /// the TCP control channel
    pub fn send_packet(&mut self, n: NodeHandle, packet: &VpnPacket) {
        if n == self.myself {
            if let Some(mac) = self.config.overwrite_mac {
                let mut local = packet.clone();
                if local.data.len() >= ETH_ALEN {
                    local.data[..ETH_ALEN].copy_from_slice(&mac);
                }
                self.hooks.write_packet(&local);
            } else {
                self.hooks.write_packet(packet);
            }
            return;
        }

        {
            let node = &self.nodes[n];
            debug!(
                "Sending packet of {} bytes to {} ({})",
                packet.len(),
                node.name,
                node.hostname
            );

            if !node.reachable {
                debug!("Node {} ({}) is not reachable", node.name, node.hostname);
                return;
            }
        }

        // A TCP-pinned packet follows the plain forwarding path; otherwise
        // packets head for the hop that re-encrypts them.
        let via = if packet.priority == PRIORITY_TCP_ONLY
            || self.nodes[n].via == Some(self.myself)
        {
            self.nodes[n].nexthop
        } else {
            self.nodes[n].via
        };
        let Some(via) = via else {
            let node = &self.nodes[n];
            debug!("No route to {} ({})", node.name, node.hostname);
            return;
        };

        if via != n {
            debug!(
                "Sending packet to {} via {} ({})",
                self.nodes[n].name,
                self.nodes[via].name,
                self.nodes[via].hostname
            );
        }

        let tcp_only = self.nodes[self.myself].tcp_only || self.nodes[via].tcp_only;
        if packet.priority == PRIORITY_TCP_ONLY || tcp_only {
            let Some(conn) = self.nodes[via].connection else {
                let node = &self.nodes[via];
                debug!(
                    "No control connection to {} ({})",
                    node.name, node.hostname
                );
                return;
            };
            self.send_tcppacket(conn, packet);
        } else {
            self.send_udppacket(via, packet);
        }
    }

    /// Flood a packet along the spanning tree
    pub fn broadcast_packet(&mut self, from: NodeHandle, packet: &VpnPacket) {
        {
            let node = &self.nodes[from];
            debug!(
                "Broadcasting packet of {} bytes from {} ({})",
                packet.len(),
                node.name,
                node.hostname
            );
        }

        if from != self.myself {
            self.send_packet(self.myself, packet);

            // The spanning tree is not trusted in tunnel-server mode; do
            // not relay and risk loops.
            if self.config.tunnel_server {
                return;
            }
        }

        let from_conn = self.nodes[from]
            .nexthop
            .and_then(|nexthop| self.nodes[nexthop].connection);

        let targets: Vec<NodeHandle> = self
            .conns
            .handles()
            .filter(|&c| {
                let conn = &self.conns[c];
                conn.active && conn.mst && Some(c) != from_conn
            })
            .map(|c| self.conns[c].node)
            .collect();

        for target in targets {
            self.send_packet(target, packet);
        }
    }

    /// Push a frame over the nexthop's control connection when UDP cannot
    /// carry it yet
    fn forward_via_tcp(&mut self, n: NodeHandle, packet: &VpnPacket) {
        let Some(nexthop) = self.nodes[n].nexthop else {
            let node = &self.nodes[n];
            debug!("No nexthop towards {} ({})", node.name, node.hostname);
            return;
        };
        let Some(conn) = self.nodes[nexthop].connection else {
            let node = &self.nodes[nexthop];
            debug!(
                "No control connection to {} ({})",
                node.name, node.hostname
            );
            return;
        };
        self.send_tcppacket(conn, packet);
    }

    /// Send over a control connection; a failed write terminates it
    fn send_tcppacket(&mut self, conn: ConnHandle, packet: &VpnPacket) {
        if !self.conns[conn].channel.send_packet(&packet.data) {
            self.conns[conn].active = false;
            self.hooks.terminate_connection(conn);
        }
    }

    /// UDP egress pipeline: compress, sequence, encrypt, MAC, send
    pub(crate) fn send_udppacket(&mut self, n: NodeHandle, packet: &VpnPacket) {
        let origlen = packet.len();

        // Key gate: without a valid key the frame rides the control channel
        // while a key exchange gets under way.
        if !self.nodes[n].validkey {
            {
                let node = &self.nodes[n];
                debug!(
                    "No valid key known yet for {} ({}), forwarding via TCP",
                    node.name, node.hostname
                );
            }
            if !self.nodes[n].waitingforkey {
                self.nodes[n].waitingforkey = true;
                self.hooks.send_req_key(n);
            }
            self.forward_via_tcp(n, packet);
            return;
        }

        // MTU gate: IP traffic waits until a usable UDP size is confirmed.
        if self.nodes[n].pmtu_discovery && self.nodes[n].minmtu == 0 && !packet.is_probe() {
            {
                let node = &self.nodes[n];
                debug!(
                    "No minimum MTU established yet for {} ({}), forwarding via TCP",
                    node.name, node.hostname
                );
            }
            self.forward_via_tcp(n, packet);
            return;
        }

        let Self {
            nodes,
            codec,
            scratch,
            sockets,
            ..
        } = self;
        let node = &mut nodes[n];

        let mut payload: &[u8] = &packet.data;
        if node.outcompression > 0 {
            if codec
                .compress(&mut scratch.a, payload, node.outcompression)
                .is_err()
            {
                error!(
                    "Error while compressing packet to {} ({})",
                    node.name, node.hostname
                );
                return;
            }
            payload = &scratch.a;
        }

        // Sequence number in network byte order; cipher and MAC both cover
        // it together with the payload.
        node.sent_seqno = node.sent_seqno.wrapping_add(1);
        scratch.b.clear();
        scratch.b.extend_from_slice(&node.sent_seqno.to_be_bytes());
        scratch.b.extend_from_slice(payload);

        if let Some(cipher) = node.outcipher.as_ref() {
            scratch.a = cipher.encrypt(&scratch.b);
            mem::swap(&mut scratch.a, &mut scratch.b);
        }

        if let Some(digest) = node.outdigest.as_ref() {
            let tag = digest.tag(&scratch.b);
            scratch.b.extend_from_slice(&tag);
        }

        let Some(address) = node.address else {
            debug!("No known address for {} ({})", node.name, node.hostname);
            return;
        };

        match sockets.send_datagram(&scratch.b, address, packet.priority) {
            SendOutcome::Sent => {}
            SendOutcome::MessageTooBig => {
                // The kernel just taught us an upper bound for this path.
                let limit = origlen as u16;
                if node.maxmtu >= limit {
                    node.maxmtu = limit.saturating_sub(1);
                }
                if node.mtu >= limit {
                    node.mtu = limit.saturating_sub(1);
                }
            }
            SendOutcome::Failed => {
                debug!(
                    "Error sending packet to {} ({})",
                    node.name, node.hostname
                );
            }
        }
    }
}

/// Normalize IPv4-mapped IPv6 sources to plain IPv4 before the index lookup
fn unmap_v4(addr: SocketAddr) -> SocketAddr {
    if let std::net::IpAddr::V6(v6) = addr.ip() {
        if let Some(v4) = v6.to_ipv4_mapped() {
            return SocketAddr::new(v4.into(), addr.port());
        }
    }
    addr
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Connection, Edge, PeerSession};
    use crate::testutil::{add_peer, test_datapath, test_datapath_with};
    use weft_crypto::{CipherKey, DigestKey, PacketCipher, PacketDigest, SessionCipher};
    use weft_network::ControlChannel;

    fn ip_frame(len: usize) -> Vec<u8> {
        let mut frame = vec![0u8; len];
        frame[12] = 0x08; // IPv4 EtherType, so the frame is not a probe
        for (i, byte) in frame.iter_mut().enumerate().skip(14) {
            *byte = i as u8;
        }
        frame
    }

    fn aes_session(levels: (u8, u8)) -> PeerSession {
        let cipher_key = CipherKey::generate();
        let digest_key = DigestKey::generate();
        PeerSession {
            incipher: SessionCipher::Aes256(PacketCipher::new(cipher_key.clone())),
            outcipher: SessionCipher::Aes256(PacketCipher::new(cipher_key)),
            indigest: Some(PacketDigest::new(&digest_key, 16).unwrap()),
            outdigest: Some(PacketDigest::new(&digest_key, 16).unwrap()),
            incompression: levels.0,
            outcompression: levels.1,
        }
    }

    #[test]
    fn test_happy_path_wire_image() {
        let mut dp = test_datapath();
        let a = add_peer(&mut dp, "a", "10.0.0.2:655");
        let frame: Vec<u8> = (1..=64).collect();

        dp.send_packet(a, &VpnPacket::new(frame.clone()));

        // Null cipher and no digest: the wire is exactly seqno || frame.
        let sent = &dp.sockets().sent;
        assert_eq!(sent.len(), 1);
        let mut expected = vec![0, 0, 0, 1];
        expected.extend_from_slice(&frame);
        assert_eq!(sent[0].0, expected);
        assert_eq!(sent[0].1, "10.0.0.2:655".parse().unwrap());
        assert_eq!(dp.nodes[a].sent_seqno, 1);
    }

    #[test]
    fn test_happy_path_ingress_delivers_to_route() {
        let mut dp = test_datapath();
        let a = add_peer(&mut dp, "a", "10.0.0.2:655");
        let frame: Vec<u8> = (1..=64).collect();

        let mut wire = vec![0, 0, 0, 1];
        wire.extend_from_slice(&frame);
        dp.handle_incoming_datagram("10.0.0.2:655".parse().unwrap(), &wire);

        let routed = &dp.hooks().routed;
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].0, a);
        assert_eq!(routed[0].1.data, frame);
        assert_eq!(routed[0].1.priority, 0);
        assert_eq!(dp.nodes[a].replay.received_seqno(), 1);
    }

    #[test]
    fn test_replayed_datagram_dropped() {
        let mut dp = test_datapath();
        let a = add_peer(&mut dp, "a", "10.0.0.2:655");

        let mut wire = vec![0, 0, 0, 1];
        wire.extend_from_slice(&ip_frame(64));
        let from: SocketAddr = "10.0.0.2:655".parse().unwrap();

        dp.handle_incoming_datagram(from, &wire);
        dp.handle_incoming_datagram(from, &wire);

        assert_eq!(dp.hooks().routed.len(), 1);
        assert_eq!(dp.nodes[a].replay.received_seqno(), 1);
    }

    #[test]
    fn test_no_valid_key_falls_back_to_tcp() {
        let mut dp = test_datapath();
        let a = add_peer(&mut dp, "a", "10.0.0.2:655");
        dp.nodes[a].validkey = false;

        let (channel, mut rx) = ControlChannel::new(8);
        let conn = dp.conns.add(Connection {
            node: a,
            active: true,
            mst: false,
            tcp_only: false,
            channel,
        });
        dp.nodes[a].connection = Some(conn);

        let packet = VpnPacket::new(ip_frame(64));
        dp.send_packet(a, &packet);
        dp.send_packet(a, &packet);

        // One key request despite two sends, no UDP at all, both frames on
        // the control channel.
        assert_eq!(dp.hooks().req_key, vec![a]);
        assert!(dp.nodes[a].waitingforkey);
        assert!(dp.sockets().sent.is_empty());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_emsgsize_clamps_mtu() {
        let mut dp = test_datapath();
        let a = add_peer(&mut dp, "a", "10.0.0.2:655");
        dp.sockets_mut().mtu_limit = Some(1000);

        dp.send_packet(a, &VpnPacket::new(ip_frame(1200)));

        assert_eq!(dp.nodes[a].maxmtu, 1199);
        assert_eq!(dp.nodes[a].mtu, 1199);
        assert!(dp.sockets().sent.is_empty());

        // Anything that fits the learned bound still goes out.
        dp.send_packet(a, &VpnPacket::new(ip_frame(500)));
        assert_eq!(dp.sockets().sent.len(), 1);
        assert!(dp.sockets().sent[0].0.len() < 1200);
    }

    #[test]
    fn test_sent_seqno_counts_egresses() {
        let mut dp = test_datapath();
        let a = add_peer(&mut dp, "a", "10.0.0.2:655");

        for _ in 0..5 {
            dp.send_packet(a, &VpnPacket::new(ip_frame(80)));
        }

        assert_eq!(dp.nodes[a].sent_seqno, 5);
        assert_eq!(dp.sockets().sent.len(), 5);

        // A fresh session starts the counter over.
        dp.nodes[a].install_session(PeerSession::null()).unwrap();
        assert_eq!(dp.nodes[a].sent_seqno, 0);
    }

    #[test]
    fn test_tcp_only_peer_uses_control_channel() {
        let mut dp = test_datapath();
        let a = add_peer(&mut dp, "a", "10.0.0.2:655");
        dp.nodes[a].tcp_only = true;

        let (channel, mut rx) = ControlChannel::new(8);
        let conn = dp.conns.add(Connection {
            node: a,
            active: true,
            mst: false,
            tcp_only: true,
            channel,
        });
        dp.nodes[a].connection = Some(conn);

        dp.send_packet(a, &VpnPacket::new(ip_frame(64)));

        assert!(dp.sockets().sent.is_empty());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_tcp_pinned_priority_follows_nexthop() {
        let mut dp = test_datapath();
        let relay = add_peer(&mut dp, "relay", "10.0.0.9:655");
        let a = add_peer(&mut dp, "a", "10.0.0.2:655");
        dp.nodes[a].nexthop = Some(relay);
        dp.nodes[a].via = Some(relay);

        let (channel, mut rx) = ControlChannel::new(8);
        let conn = dp.conns.add(Connection {
            node: relay,
            active: true,
            mst: false,
            tcp_only: false,
            channel,
        });
        dp.nodes[relay].connection = Some(conn);

        dp.send_packet(a, &VpnPacket::with_priority(ip_frame(64), PRIORITY_TCP_ONLY));

        assert!(dp.sockets().sent.is_empty());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_failed_control_write_terminates_connection() {
        let mut dp = test_datapath();
        let a = add_peer(&mut dp, "a", "10.0.0.2:655");
        dp.nodes[a].tcp_only = true;

        let (channel, rx) = ControlChannel::new(8);
        drop(rx); // connection writer is gone
        let conn = dp.conns.add(Connection {
            node: a,
            active: true,
            mst: false,
            tcp_only: true,
            channel,
        });
        dp.nodes[a].connection = Some(conn);

        dp.send_packet(a, &VpnPacket::new(ip_frame(64)));

        assert_eq!(dp.hooks().terminated, vec![conn]);
        assert!(!dp.conns[conn].active);
    }

    #[test]
    fn test_unreachable_peer_drops() {
        let mut dp = test_datapath();
        let a = add_peer(&mut dp, "a", "10.0.0.2:655");
        dp.nodes[a].reachable = false;

        dp.send_packet(a, &VpnPacket::new(ip_frame(64)));

        assert!(dp.sockets().sent.is_empty());
        assert_eq!(dp.nodes[a].sent_seqno, 0);
    }

    #[test]
    fn test_send_to_self_writes_device() {
        let mut dp = test_datapath();
        let myself = dp.myself();

        let packet = VpnPacket::new(ip_frame(64));
        dp.send_packet(myself, &packet);

        assert_eq!(dp.hooks().written.len(), 1);
        assert_eq!(dp.hooks().written[0].data, packet.data);
        assert!(dp.sockets().sent.is_empty());
    }

    #[test]
    fn test_send_to_self_overwrites_mac() {
        let config = DatapathConfig {
            overwrite_mac: Some([2, 0, 0, 0, 0, 7]),
            ..DatapathConfig::default()
        };
        let mut dp = test_datapath_with(config);
        let myself = dp.myself();

        dp.send_packet(myself, &VpnPacket::new(ip_frame(64)));

        assert_eq!(&dp.hooks().written[0].data[..ETH_ALEN], &[2, 0, 0, 0, 0, 7]);
    }

    #[test]
    fn test_broadcast_follows_mst() {
        let mut dp = test_datapath();
        let b = add_peer(&mut dp, "b", "10.0.0.2:655");
        let c = add_peer(&mut dp, "c", "10.0.0.3:655");
        let d = add_peer(&mut dp, "d", "10.0.0.4:655");

        let conn_b = {
            let (channel, _rx) = ControlChannel::new(8);
            dp.conns.add(Connection {
                node: b,
                active: true,
                mst: true,
                tcp_only: false,
                channel,
            })
        };
        dp.nodes[b].connection = Some(conn_b);
        let conn_c = {
            let (channel, _rx) = ControlChannel::new(8);
            dp.conns.add(Connection {
                node: c,
                active: true,
                mst: true,
                tcp_only: false,
                channel,
            })
        };
        dp.nodes[c].connection = Some(conn_c);
        let conn_d = {
            let (channel, _rx) = ControlChannel::new(8);
            dp.conns.add(Connection {
                node: d,
                active: true,
                mst: false,
                tcp_only: false,
                channel,
            })
        };
        dp.nodes[d].connection = Some(conn_d);

        // A broadcast arriving from b reaches the local device and the other
        // spanning-tree edge (c), but is never reflected back towards b and
        // never follows the non-tree edge to d.
        dp.broadcast_packet(b, &VpnPacket::new(ip_frame(64)));

        assert_eq!(dp.hooks().written.len(), 1);
        let sent = &dp.sockets().sent;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "10.0.0.3:655".parse().unwrap());
    }

    #[test]
    fn test_tunnel_server_does_not_relay_broadcasts() {
        let config = DatapathConfig {
            tunnel_server: true,
            ..DatapathConfig::default()
        };
        let mut dp = test_datapath_with(config);
        let b = add_peer(&mut dp, "b", "10.0.0.2:655");
        let c = add_peer(&mut dp, "c", "10.0.0.3:655");
        let conn_c = {
            let (channel, _rx) = ControlChannel::new(8);
            dp.conns.add(Connection {
                node: c,
                active: true,
                mst: true,
                tcp_only: false,
                channel,
            })
        };
        dp.nodes[c].connection = Some(conn_c);

        dp.broadcast_packet(b, &VpnPacket::new(ip_frame(64)));

        // Delivered locally, relayed nowhere.
        assert_eq!(dp.hooks().written.len(), 1);
        assert!(dp.sockets().sent.is_empty());
    }

    #[test]
    fn test_try_harder_adopts_verified_peer() {
        let mut dp = test_datapath();
        let a = add_peer(&mut dp, "a", "10.0.0.2:655");
        let digest_key = DigestKey::generate();
        let session = PeerSession {
            indigest: Some(PacketDigest::new(&digest_key, 16).unwrap()),
            ..PeerSession::null()
        };
        dp.nodes[a].install_session(session).unwrap();
        dp.edges.add(Edge {
            to: a,
            address: "10.0.0.2:655".parse().unwrap(),
        });

        // Same host, different source port: the address index misses, the
        // MAC identifies the peer, and the index follows.
        let mut wire = vec![0, 0, 0, 1];
        wire.extend_from_slice(&ip_frame(64));
        let digest = PacketDigest::new(&digest_key, 16).unwrap();
        let tag = digest.tag(&wire);
        wire.extend_from_slice(&tag);

        let roamed: SocketAddr = "10.0.0.2:41000".parse().unwrap();
        dp.handle_incoming_datagram(roamed, &wire);

        assert_eq!(dp.hooks().routed.len(), 1);
        assert_eq!(dp.nodes[a].address, Some(roamed));
        assert_eq!(dp.nodes.lookup_udp(&roamed), Some(a));
    }

    #[test]
    fn test_unknown_source_dropped() {
        let mut dp = test_datapath();
        add_peer(&mut dp, "a", "10.0.0.2:655");

        let mut wire = vec![0, 0, 0, 1];
        wire.extend_from_slice(&ip_frame(64));
        dp.handle_incoming_datagram("192.0.2.99:1000".parse().unwrap(), &wire);

        assert!(dp.hooks().routed.is_empty());
    }

    #[test]
    fn test_v4_mapped_source_is_unmapped() {
        let mut dp = test_datapath();
        let a = add_peer(&mut dp, "a", "10.0.0.2:655");

        let mut wire = vec![0, 0, 0, 1];
        wire.extend_from_slice(&ip_frame(64));
        dp.handle_incoming_datagram("[::ffff:10.0.0.2]:655".parse().unwrap(), &wire);

        assert_eq!(dp.hooks().routed.len(), 1);
        assert_eq!(dp.nodes[a].replay.received_seqno(), 1);
    }

    #[test]
    fn test_receive_tcp_packet_priority() {
        let mut dp = test_datapath();
        let a = add_peer(&mut dp, "a", "10.0.0.2:655");

        let (channel, _rx) = ControlChannel::new(8);
        let fallback = dp.conns.add(Connection {
            node: a,
            active: true,
            mst: false,
            tcp_only: false,
            channel,
        });
        let (channel, _rx) = ControlChannel::new(8);
        let pinned = dp.conns.add(Connection {
            node: a,
            active: true,
            mst: false,
            tcp_only: true,
            channel,
        });

        dp.receive_tcp_packet(fallback, &ip_frame(64));
        dp.receive_tcp_packet(pinned, &ip_frame(64));

        let routed = &dp.hooks().routed;
        assert_eq!(routed[0].1.priority, PRIORITY_TCP_ONLY);
        assert_eq!(routed[1].1.priority, 0);
    }

    #[test]
    fn test_encrypted_compressed_roundtrip() {
        let mut dp = test_datapath();
        let a = add_peer(&mut dp, "a", "10.0.0.2:655");
        dp.nodes[a].install_session(aes_session((10, 10))).unwrap();

        let frame = ip_frame(600);
        dp.send_packet(a, &VpnPacket::new(frame.clone()));

        let wire = dp.sockets().sent[0].0.clone();
        assert_ne!(wire, frame);

        dp.handle_incoming_datagram("10.0.0.2:655".parse().unwrap(), &wire);

        let routed = &dp.hooks().routed;
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].1.data, frame);
        assert_eq!(dp.nodes[a].replay.received_seqno(), 1);
    }

    #[test]
    fn test_unauthenticated_datagram_dropped() {
        let mut dp = test_datapath();
        let a = add_peer(&mut dp, "a", "10.0.0.2:655");
        dp.nodes[a].install_session(aes_session((0, 0))).unwrap();

        let frame = ip_frame(100);
        dp.send_packet(a, &VpnPacket::new(frame));
        let mut wire = dp.sockets().sent[0].0.clone();
        let tampered = wire.len() - 1;
        wire[tampered] ^= 0x01;

        dp.handle_incoming_datagram("10.0.0.2:655".parse().unwrap(), &wire);
        assert!(dp.hooks().routed.is_empty());
    }

    #[test]
    fn test_ingress_requires_session() {
        let mut dp = test_datapath();
        let mut node = Node::new("cold".into(), "10.0.0.8".into());
        node.address = Some("10.0.0.8:655".parse().unwrap());
        node.reachable = true;
        dp.nodes.add(node);

        let mut wire = vec![0, 0, 0, 1];
        wire.extend_from_slice(&ip_frame(64));
        dp.handle_incoming_datagram("10.0.0.8:655".parse().unwrap(), &wire);

        assert!(dp.hooks().routed.is_empty());
    }

    #[test]
    fn test_short_datagram_dropped() {
        let mut dp = test_datapath();
        add_peer(&mut dp, "a", "10.0.0.2:655");

        dp.handle_incoming_datagram("10.0.0.2:655".parse().unwrap(), &[0, 0]);
        assert!(dp.hooks().routed.is_empty());
    }

    #[test]
    fn test_corrupt_compressed_payload_dropped() {
        let mut dp = test_datapath();
        let a = add_peer(&mut dp, "a", "10.0.0.2:655");
        let session = PeerSession {
            incompression: 9,
            ..PeerSession::null()
        };
        dp.nodes[a].install_session(session).unwrap();

        let mut wire = vec![0, 0, 0, 1];
        wire.extend_from_slice(&[0xFF; 80]); // not a zlib stream
        dp.handle_incoming_datagram("10.0.0.2:655".parse().unwrap(), &wire);

        assert!(dp.hooks().routed.is_empty());
        // The sequence number was authenticated before decompression, so the
        // window still advanced.
        assert_eq!(dp.nodes[a].replay.received_seqno(), 1);
    }

    #[test]
    fn test_key_timer() {
        let mut dp = test_datapath();
        let now = Instant::now();

        assert!(!dp.key_expired(now));
        dp.reset_key_timer(now);
        assert!(!dp.key_expired(now));
        assert!(dp.key_expired(now + dp.config().key_lifetime()));
    }

    #[test]
    fn test_rekey_requested_past_max_seqno() {
        let mut dp = test_datapath();
        let a = add_peer(&mut dp, "a", "10.0.0.2:655");

        let seqno = crate::replay::MAX_SEQNO + 2;
        let mut wire = seqno.to_be_bytes().to_vec();
        wire.extend_from_slice(&ip_frame(64));
        dp.handle_incoming_datagram("10.0.0.2:655".parse().unwrap(), &wire);

        assert_eq!(dp.hooks().regenerated, 1);
        assert_eq!(dp.nodes[a].replay.received_seqno(), seqno);
    }
}
