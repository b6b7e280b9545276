//! Daemon configuration
//!
//! weftd reads a JSON file describing the local node, its listen sockets,
//! the TAP interface and a static peer table. Session keys come from the
//! file as hex strings: the authentication handshake that would normally
//! negotiate them lives outside the datapath, and the static keyring stands
//! in for it here.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use weft_core::{DatapathConfig, PeerSession};
use weft_crypto::{CipherKey, DigestKey, PacketCipher, PacketDigest, SessionCipher};
use weft_network::{TapConfig, MTU};

/// Top-level daemon configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Local node name
    pub name: String,

    /// Listen addresses; UDP datagrams and TCP control connections share
    /// the first one
    pub listen: Vec<SocketAddr>,

    /// TAP interface settings
    #[serde(default)]
    pub tap: TapSettings,

    /// Mirror frame TOS values onto outgoing IPv4 sockets
    #[serde(default)]
    pub priority_inheritance: bool,

    /// Do not relay broadcasts
    #[serde(default)]
    pub tunnel_server: bool,

    /// Force TCP for all traffic
    #[serde(default)]
    pub tcp_only: bool,

    /// Overwrite the MAC field of locally delivered frames
    /// ("aa:bb:cc:dd:ee:ff")
    #[serde(default)]
    pub overwrite_mac: Option<String>,

    /// Session key lifetime in seconds
    #[serde(default = "default_key_lifetime")]
    pub key_lifetime_secs: u64,

    /// Static peer table
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

fn default_key_lifetime() -> u64 {
    3600
}

/// TAP interface settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TapSettings {
    pub name: String,
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub mtu: u16,
}

impl Default for TapSettings {
    fn default() -> Self {
        Self {
            name: "weft0".into(),
            address: Ipv4Addr::new(10, 42, 0, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            mtu: (MTU - 18) as u16,
        }
    }
}

impl From<TapSettings> for TapConfig {
    fn from(settings: TapSettings) -> Self {
        TapConfig {
            name: settings.name,
            address: settings.address,
            netmask: settings.netmask,
            mtu: settings.mtu,
        }
    }
}

/// One statically configured peer
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Peer name
    pub name: String,

    /// Peer endpoint (UDP datagrams and TCP control)
    pub address: SocketAddr,

    /// Force TCP towards this peer
    #[serde(default)]
    pub tcp_only: bool,

    /// Hold UDP traffic until the path MTU is probed
    #[serde(default)]
    pub pmtu_discovery: bool,

    /// Compression level for both directions (0..=11)
    #[serde(default)]
    pub compression: u8,

    /// 48 hex bytes: AES-256 key then CBC IV; omitted means a null cipher
    #[serde(default)]
    pub cipher_key: Option<String>,

    /// 32 hex bytes of HMAC-SHA256 key; omitted means no MAC
    #[serde(default)]
    pub digest_key: Option<String>,

    /// Negotiated MAC truncation in bytes
    #[serde(default = "default_mac_length")]
    pub mac_length: usize,
}

fn default_mac_length() -> usize {
    16
}

impl PeerConfig {
    /// Build the peer's session from the configured key material
    pub fn session(&self) -> Result<PeerSession> {
        let (incipher, outcipher) = match &self.cipher_key {
            Some(hexkey) => {
                let bytes = parse_hex(hexkey)
                    .with_context(|| format!("cipher key for peer {}", self.name))?;
                let key = CipherKey::try_from_slice(&bytes)?;
                (
                    SessionCipher::Aes256(PacketCipher::new(key.clone())),
                    SessionCipher::Aes256(PacketCipher::new(key)),
                )
            }
            None => (SessionCipher::Null, SessionCipher::Null),
        };

        let (indigest, outdigest) = match &self.digest_key {
            Some(hexkey) => {
                let bytes = parse_hex(hexkey)
                    .with_context(|| format!("digest key for peer {}", self.name))?;
                let key = DigestKey::try_from_slice(&bytes)?;
                (
                    Some(PacketDigest::new(&key, self.mac_length)?),
                    Some(PacketDigest::new(&key, self.mac_length)?),
                )
            }
            None => (None, None),
        };

        Ok(PeerSession {
            incipher,
            outcipher,
            indigest,
            outdigest,
            incompression: self.compression,
            outcompression: self.compression,
        })
    }
}

impl DaemonConfig {
    /// Read and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: DaemonConfig =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Basic sanity checks
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("node name must not be empty");
        }
        if self.listen.is_empty() {
            bail!("at least one listen address is required");
        }
        for peer in &self.peers {
            if peer.compression > weft_core::MAX_COMPRESSION_LEVEL {
                bail!(
                    "peer {}: compression level {} out of range",
                    peer.name,
                    peer.compression
                );
            }
        }
        Ok(())
    }

    /// The datapath's view of this configuration
    pub fn datapath_config(&self) -> Result<DatapathConfig> {
        let overwrite_mac = match &self.overwrite_mac {
            Some(mac) => Some(parse_mac(mac)?),
            None => None,
        };
        Ok(DatapathConfig {
            name: self.name.clone(),
            priority_inheritance: self.priority_inheritance,
            tunnel_server: self.tunnel_server,
            tcp_only: self.tcp_only,
            overwrite_mac,
            key_lifetime_secs: self.key_lifetime_secs,
        })
    }
}

/// Decode a hex string
fn parse_hex(s: &str) -> Result<Vec<u8>> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        bail!("odd-length hex string");
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).context("invalid hex digit"))
        .collect()
}

/// Parse a "aa:bb:cc:dd:ee:ff" MAC address
pub fn parse_mac(s: &str) -> Result<[u8; 6]> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        bail!("MAC address must have 6 octets");
    }
    let mut mac = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        mac[i] = u8::from_str_radix(part, 16).context("invalid MAC octet")?;
    }
    Ok(mac)
}
