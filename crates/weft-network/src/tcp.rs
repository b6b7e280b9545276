//! TCP Control-Channel Framing
//!
//! When a peer cannot be reached over UDP, data packets ride its control
//! connection as length-prefixed blobs. The control protocol itself
//! (authentication, graph exchange) lives outside the datapath; this module
//! only frames packets and carries them to the connection's writer task.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{NetworkError, NetworkResult};
use crate::packet::MAXSIZE;

/// Length prefix size
pub const FRAME_HEADER_LEN: usize = 2;

/// Queue depth of a control connection's write channel
pub const CONTROL_CHANNEL_DEPTH: usize = 128;

/// Encode one packet as a length-prefixed frame
pub fn encode_frame(data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + data.len());
    buf.put_u16(data.len() as u16);
    buf.put_slice(data);
    buf.freeze()
}

/// Incremental decoder for the inbound side of a control connection
#[derive(Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes read from the stream
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, if one has fully arrived
    pub fn next_frame(&mut self) -> NetworkResult<Option<Bytes>> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if len > MAXSIZE {
            return Err(NetworkError::FrameTooLarge(len));
        }
        if self.buf.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }
        self.buf.advance(FRAME_HEADER_LEN);
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}

/// Outbound half of a peer control channel.
///
/// Packets are queued to the connection's writer task. `send_packet` never
/// blocks: a closed or backlogged channel reports failure, and the caller
/// tears the connection down.
#[derive(Clone)]
pub struct ControlChannel {
    tx: mpsc::Sender<Bytes>,
}

impl ControlChannel {
    /// Create a channel plus the receiver drained by the writer task
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue one framed data packet; `false` when the connection is dead or
    /// its write queue is full
    pub fn send_packet(&self, data: &[u8]) -> bool {
        trace!("Queueing {} byte packet on control channel", data.len());
        self.tx.try_send(encode_frame(data)).is_ok()
    }
}

/// Drain framed packets into the write half of a control connection
pub async fn drain_frames<W>(mut rx: mpsc::Receiver<Bytes>, mut writer: W) -> NetworkResult<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        writer.write_all(&frame).await?;
    }
    Ok(())
}
