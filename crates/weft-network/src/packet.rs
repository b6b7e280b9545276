//! Packet buffer
//!
//! A `VpnPacket` is one Ethernet frame moving through the daemon, together
//! with a delivery priority hint. On the UDP wire a frame travels as
//! `seqno(4, BE) || ciphertext || MAC`; that image is built in the datapath's
//! scratch buffers, not here.

/// Device MTU: largest Ethernet frame read from or written to the TAP device
pub const MTU: usize = 1518;

/// Ethernet header size (dst MAC, src MAC, EtherType)
pub const ETH_HEADER_LEN: usize = 14;

/// MAC address size
pub const ETH_ALEN: usize = 6;

/// Largest on-wire datagram: frame + seqno + cipher padding + MAC +
/// compression slack for incompressible payloads
pub const MAXSIZE: usize = MTU + 4 + 16 + 32 + MTU / 64 + 20;

/// Priority value that pins a packet to the TCP path until delivery
pub const PRIORITY_TCP_ONLY: i32 = -1;

/// An Ethernet frame with a delivery priority hint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpnPacket {
    /// Frame bytes (Ethernet header + payload)
    pub data: Vec<u8>,

    /// Priority hint: the frame's TOS value, or `PRIORITY_TCP_ONLY`
    pub priority: i32,
}

impl VpnPacket {
    /// Wrap frame bytes with default priority
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, priority: 0 }
    }

    /// Wrap frame bytes with an explicit priority
    pub fn with_priority(data: Vec<u8>, priority: i32) -> Self {
        Self { data, priority }
    }

    /// Frame length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True for an empty buffer
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True when the EtherType field is zero: an internal MTU probe rather
    /// than a routable frame
    pub fn is_probe(&self) -> bool {
        self.data.len() >= ETH_HEADER_LEN && self.data[12] == 0 && self.data[13] == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_detection() {
        let mut data = vec![0u8; 64];
        assert!(VpnPacket::new(data.clone()).is_probe());

        data[12] = 0x08; // IPv4 EtherType high byte
        assert!(!VpnPacket::new(data).is_probe());

        // Too short to carry an Ethernet header at all.
        assert!(!VpnPacket::new(vec![0u8; 10]).is_probe());
    }

    #[test]
    fn test_maxsize_covers_frame_and_overhead() {
        assert!(MAXSIZE > MTU + 4 + 32);
    }
}
