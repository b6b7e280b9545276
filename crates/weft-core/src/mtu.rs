//! Path-MTU Discovery
//!
//! Per-peer prober. Probes are zeroed Ethernet headers with random tails,
//! drawn at random sizes, and travel the normal UDP egress path so they are
//! encrypted and authenticated like any other packet. A peer that receives
//! a probe flips its first byte and bounces it back through the transport
//! chooser; the reply confirms the probed size as deliverable.
//!
//! Probing stops after `MTU_PROBE_MAX_NO_REPLY` silent rounds, or fixes the
//! MTU to the confirmed minimum after `MTU_PROBE_MAX_TOTAL` rounds in total
//! (or as soon as the bounds meet).

use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info};

use weft_network::{DatagramSink, VpnPacket, ETH_HEADER_LEN};

use crate::datapath::{Datapath, DatapathHooks};
use crate::node::NodeHandle;

/// Cadence of probe rounds while discovery is active
pub const MTU_PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Give up after this many rounds without a single reply
pub const MTU_PROBE_MAX_NO_REPLY: u32 = 10;

/// Fix the MTU after this many rounds in total
pub const MTU_PROBE_MAX_TOTAL: u32 = 30;

/// Probes sent per round
const MTU_PROBES_PER_ROUND: usize = 3;

/// Smallest probe worth sending
const MTU_PROBE_MIN_LEN: u16 = 64;

impl<S: DatagramSink, H: DatapathHooks> Datapath<S, H> {
    /// Begin (or restart) probing towards `n`, firing the first round
    /// immediately
    pub fn send_mtu_probe(&mut self, n: NodeHandle, now: Instant) {
        self.mtu_probe_round(n, now);
    }

    /// Earliest pending probe deadline across all peers
    pub fn next_mtu_deadline(&self) -> Option<Instant> {
        self.nodes
            .handles()
            .filter_map(|h| self.nodes[h].mtu_deadline)
            .min()
    }

    /// Fire every probe round whose deadline has passed
    pub fn run_mtu_timers(&mut self, now: Instant) {
        let due: Vec<NodeHandle> = self
            .nodes
            .handles()
            .filter(|&h| self.nodes[h].mtu_deadline.is_some_and(|at| at <= now))
            .collect();

        for n in due {
            self.nodes[n].mtu_deadline = None;
            self.mtu_probe_round(n, now);
        }
    }

    /// A frame with EtherType zero arrived: an outbound probe to bounce, or
    /// a reply confirming `len` bytes made it through
    pub(crate) fn handle_mtu_probe(&mut self, n: NodeHandle, mut packet: VpnPacket, len: usize) {
        {
            let node = &self.nodes[n];
            debug!(
                "Got MTU probe length {} from {} ({})",
                packet.len(),
                node.name,
                node.hostname
            );
        }

        if packet.data.first() == Some(&0) {
            // The reply may legitimately travel over TCP, so it goes back
            // through the transport chooser rather than straight to UDP.
            packet.data[0] = 1;
            self.send_packet(n, &packet);
        } else if (self.nodes[n].minmtu as usize) < len {
            self.nodes[n].minmtu = len as u16;
        }
    }

    fn mtu_probe_round(&mut self, n: NodeHandle, now: Instant) {
        {
            let node = &mut self.nodes[n];
            node.mtuprobes += 1;

            if node.mtuprobes >= MTU_PROBE_MAX_NO_REPLY && node.minmtu == 0 {
                debug!(
                    "No response to MTU probes from {} ({})",
                    node.name, node.hostname
                );
                node.mtu_deadline = None;
                return;
            }

            if node.mtuprobes >= MTU_PROBE_MAX_TOTAL || node.minmtu >= node.maxmtu {
                node.mtu = node.minmtu;
                info!(
                    "Fixing MTU of {} ({}) to {} after {} probes",
                    node.name, node.hostname, node.mtu, node.mtuprobes
                );
                node.mtu_deadline = None;
                return;
            }
        }

        for _ in 0..MTU_PROBES_PER_ROUND {
            let (minmtu, maxmtu) = {
                let node = &self.nodes[n];
                (node.minmtu, node.maxmtu)
            };
            let floor = MTU_PROBE_MIN_LEN.max(minmtu + 1).min(maxmtu);
            let len = rand::thread_rng().gen_range(floor..=maxmtu) as usize;

            // Zeroed Ethernet header, random tail: EtherType zero marks the
            // frame as a probe on the far side.
            let mut data = vec![0u8; len];
            if len > ETH_HEADER_LEN {
                rand::thread_rng().fill(&mut data[ETH_HEADER_LEN..]);
            }

            {
                let node = &self.nodes[n];
                debug!(
                    "Sending MTU probe length {} to {} ({})",
                    len, node.name, node.hostname
                );
            }
            self.send_udppacket(n, &VpnPacket::new(data));
        }

        self.nodes[n].mtu_deadline = Some(now + MTU_PROBE_INTERVAL);
    }
}
