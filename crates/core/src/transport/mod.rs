//! Network transport for RTSP signaling and RTP media delivery.
//!
//! - **TCP** ([`tcp`]): the RTSP control connection. One task per client,
//!   plus a writer task that owns the socket's write half. Interleaved
//!   media (RFC 2326 §10.12) is queued onto that same writer.
//!
//! - **UDP** ([`udp`]): a per-session RTP/RTCP socket pair bound during
//!   SETUP.
//!
//! A playing session sees either path as a [`MediaSink`].

pub mod tcp;
pub mod udp;

use std::io;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::protocol::codec::Outbound;

pub use tcp::Listener;
pub use udp::UdpSink;

/// Interleaved delivery over the session's RTSP connection.
pub struct InterleavedSink {
    channel: u8,
    outbound: mpsc::Sender<Outbound>,
}

impl InterleavedSink {
    pub fn new(channel: u8, outbound: mpsc::Sender<Outbound>) -> Self {
        Self { channel, outbound }
    }

    pub async fn send(&self, packet: Bytes) -> Result<()> {
        self.outbound
            .send(Outbound::Interleaved {
                channel: self.channel,
                payload: packet,
            })
            .await
            .map_err(|_| {
                Error::TransportWrite(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "RTSP connection closed",
                ))
            })
    }

    pub fn is_writable(&self) -> bool {
        !self.outbound.is_closed()
    }
}

/// Where a session's RTP packets go.
pub enum MediaSink {
    Udp(UdpSink),
    Interleaved(InterleavedSink),
}

impl MediaSink {
    /// Write one RTP packet. Any failure means the client is unreachable.
    pub async fn send_rtp(&self, packet: Bytes) -> Result<()> {
        match self {
            MediaSink::Udp(sink) => sink.send(packet).await,
            MediaSink::Interleaved(sink) => sink.send(packet).await,
        }
    }

    /// False once the client's control connection is gone.
    pub fn is_writable(&self) -> bool {
        match self {
            MediaSink::Udp(sink) => sink.is_writable(),
            MediaSink::Interleaved(sink) => sink.is_writable(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MediaSink::Udp(_) => "udp",
            MediaSink::Interleaved(_) => "interleaved",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn interleaved_sink_tags_channel() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = MediaSink::Interleaved(InterleavedSink::new(2, tx));
        sink.send_rtp(Bytes::from_static(&[0x80, 0x60])).await.unwrap();

        match rx.recv().await.unwrap() {
            Outbound::Interleaved { channel, payload } => {
                assert_eq!(channel, 2);
                assert_eq!(&payload[..], &[0x80, 0x60]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn interleaved_write_fails_after_disconnect() {
        let (tx, rx) = mpsc::channel(4);
        let sink = MediaSink::Interleaved(InterleavedSink::new(0, tx));
        drop(rx);
        assert!(!sink.is_writable());
        assert!(matches!(
            sink.send_rtp(Bytes::from_static(&[0])).await,
            Err(Error::TransportWrite(_))
        ));
    }
}
