//! TAP Device Access
//!
//! The datapath moves whole Ethernet frames, so the local device is a TAP
//! (layer 2) interface. The datapath consumes it through the `TapDevice`
//! trait: `read_packet` for the next frame, `write_packet` to deliver one.

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::error::{NetworkError, NetworkResult};
use crate::packet::{VpnPacket, MTU};

/// TAP device configuration
#[derive(Clone, Debug)]
pub struct TapConfig {
    /// Interface name (e.g. "weft0")
    pub name: String,

    /// Interface address
    pub address: std::net::Ipv4Addr,

    /// Interface netmask
    pub netmask: std::net::Ipv4Addr,

    /// Interface MTU
    pub mtu: u16,
}

impl Default for TapConfig {
    fn default() -> Self {
        Self {
            name: "weft0".into(),
            address: std::net::Ipv4Addr::new(10, 42, 0, 1),
            netmask: std::net::Ipv4Addr::new(255, 255, 255, 0),
            mtu: (MTU - 18) as u16,
        }
    }
}

/// The local TUN/TAP endpoint consumed by the datapath
#[async_trait]
pub trait TapDevice: Send + Sync {
    /// Read the next frame from the device
    async fn read_packet(&self) -> NetworkResult<VpnPacket>;

    /// Enqueue a frame to the device
    async fn write_packet(&self, packet: &VpnPacket) -> NetworkResult<()>;

    /// Interface name
    fn name(&self) -> &str;
}

/// TAP device backed by the platform driver
pub struct OsTap {
    device: tokio::sync::Mutex<tun::AsyncDevice>,
    name: String,
}

impl OsTap {
    /// Create and bring up a TAP interface
    pub async fn create(config: TapConfig) -> NetworkResult<Self> {
        let mut tun_config = tun::Configuration::default();

        tun_config
            .name(&config.name)
            .layer(tun::Layer::L2)
            .address(config.address)
            .netmask(config.netmask)
            .mtu(config.mtu as i32)
            .up();

        #[cfg(target_os = "linux")]
        tun_config.platform(|platform| {
            platform.packet_information(false);
        });

        let device = tun::create_as_async(&tun_config)
            .map_err(|e| NetworkError::TapError(format!("Failed to create TAP device: {}", e)))?;

        let name = config.name.clone();
        info!(
            "Created TAP device: {} with IP {}/{}",
            name, config.address, config.netmask
        );

        Ok(Self {
            device: tokio::sync::Mutex::new(device),
            name,
        })
    }
}

#[async_trait]
impl TapDevice for OsTap {
    async fn read_packet(&self) -> NetworkResult<VpnPacket> {
        let mut buf = vec![0u8; MTU];
        let mut device = self.device.lock().await;

        let n = device
            .read(&mut buf)
            .await
            .map_err(|e| NetworkError::TapError(format!("Failed to read from TAP: {}", e)))?;

        buf.truncate(n);
        debug!("TAP read: {} bytes", n);
        Ok(VpnPacket::new(buf))
    }

    async fn write_packet(&self, packet: &VpnPacket) -> NetworkResult<()> {
        let mut device = self.device.lock().await;

        device
            .write_all(&packet.data)
            .await
            .map_err(|e| NetworkError::TapError(format!("Failed to write to TAP: {}", e)))?;

        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
