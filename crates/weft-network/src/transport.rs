//! UDP Transport Layer
//!
//! The daemon listens on one UDP socket per configured address (mixed IPv4
//! and IPv6). A send picks the first socket whose family matches the
//! destination, falling back to socket 0 as a best effort. Each socket
//! remembers the TOS value it last applied, so priority inheritance only
//! issues a setsockopt when the value actually changes.

use std::net::SocketAddr;
use std::sync::Arc;

use socket2::SockRef;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::error::{NetworkError, NetworkResult};
use crate::packet::MAXSIZE;

/// A datagram received from the transport
#[derive(Debug, Clone)]
pub struct Datagram {
    /// Source address
    pub from: SocketAddr,

    /// Raw datagram bytes
    pub data: Vec<u8>,
}

/// Outcome of a datagram send attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the kernel
    Sent,

    /// The datagram exceeds the path MTU (EMSGSIZE)
    MessageTooBig,

    /// Any other send failure, already logged
    Failed,
}

/// Sink for outgoing UDP datagrams.
///
/// The datapath sends through this trait, so the packet pipelines can run
/// against a recording sink in tests.
pub trait DatagramSink {
    /// Send one datagram towards `to` with the given priority hint
    fn send_datagram(&mut self, datagram: &[u8], to: SocketAddr, priority: i32) -> SendOutcome;
}

struct ListenSocket {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    /// TOS value this socket currently carries
    last_tos: i32,
}

/// The set of UDP listen sockets shared by all peers
pub struct ListenSocketSet {
    sockets: Vec<ListenSocket>,
    priority_inheritance: bool,
}

impl ListenSocketSet {
    /// Bind one socket per address
    pub async fn bind(
        addrs: &[SocketAddr],
        priority_inheritance: bool,
    ) -> NetworkResult<Self> {
        if addrs.is_empty() {
            return Err(NetworkError::NoListenSockets);
        }

        let mut sockets = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let socket = UdpSocket::bind(*addr).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::AddrInUse {
                    NetworkError::AddressInUse(*addr)
                } else {
                    NetworkError::Io(e)
                }
            })?;
            let local_addr = socket.local_addr()?;
            debug!("UDP transport bound to {}", local_addr);

            sockets.push(ListenSocket {
                socket: Arc::new(socket),
                local_addr,
                last_tos: 0,
            });
        }

        Ok(Self {
            sockets,
            priority_inheritance,
        })
    }

    /// Local addresses of all bound sockets
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.sockets.iter().map(|s| s.local_addr).collect()
    }

    /// Number of listen sockets
    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    /// True when no sockets are bound
    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    /// Spawn one reader task per socket, all feeding `tx`
    pub fn spawn_receivers(&self, tx: mpsc::Sender<Datagram>) -> Vec<JoinHandle<()>> {
        self.sockets
            .iter()
            .map(|s| {
                let socket = s.socket.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; MAXSIZE];
                    loop {
                        match socket.recv_from(&mut buf).await {
                            Ok((len, from)) => {
                                trace!("Received {} bytes from {}", len, from);
                                let msg = Datagram {
                                    from,
                                    data: buf[..len].to_vec(),
                                };
                                if tx.send(msg).await.is_err() {
                                    debug!("Receiver channel closed, stopping");
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("Error receiving datagram: {}", e);
                            }
                        }
                    }
                })
            })
            .collect()
    }

    /// First socket whose family matches `to`, else socket 0
    fn select(&self, to: &SocketAddr) -> usize {
        self.sockets
            .iter()
            .position(|s| s.local_addr.is_ipv4() == to.is_ipv4())
            .unwrap_or(0)
    }
}

impl DatagramSink for ListenSocketSet {
    fn send_datagram(&mut self, datagram: &[u8], to: SocketAddr, priority: i32) -> SendOutcome {
        let idx = self.select(&to);
        let sock = &mut self.sockets[idx];

        if self.priority_inheritance
            && to.is_ipv4()
            && priority >= 0
            && priority != sock.last_tos
        {
            sock.last_tos = priority;
            debug!("Setting outgoing packet priority to {}", priority);
            if let Err(e) = SockRef::from(sock.socket.as_ref()).set_tos(priority as u32) {
                error!("System call `setsockopt' failed: {}", e);
            }
        }

        match sock.socket.try_send_to(datagram, to) {
            Ok(_) => SendOutcome::Sent,
            Err(e) if e.raw_os_error() == Some(libc::EMSGSIZE) => SendOutcome::MessageTooBig,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                debug!("Socket busy, dropping {} byte datagram to {}", datagram.len(), to);
                SendOutcome::Failed
            }
            Err(e) => {
                error!("Error sending datagram to {}: {}", to, e);
                SendOutcome::Failed
            }
        }
    }
}
