use std::net::SocketAddr;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::protocol::codec::Outbound;

/// UDP delivery path for one session.
///
/// Owns the server-side RTP/RTCP socket pair bound during SETUP; dropping
/// the sink releases both ports. RTP goes from the even port to the
/// client's advertised RTP port. The RTCP socket is held only so the pair
/// stays reserved.
pub struct UdpSink {
    rtp: UdpSocket,
    _rtcp: UdpSocket,
    client_rtp: SocketAddr,
    /// The session's control connection; media stops when it goes away.
    control: mpsc::Sender<Outbound>,
}

impl UdpSink {
    pub fn new(
        rtp: UdpSocket,
        rtcp: UdpSocket,
        client_rtp: SocketAddr,
        control: mpsc::Sender<Outbound>,
    ) -> Self {
        Self {
            rtp,
            _rtcp: rtcp,
            client_rtp,
            control,
        }
    }

    pub fn local_rtp_port(&self) -> Option<u16> {
        self.rtp.local_addr().ok().map(|a| a.port())
    }

    pub async fn send(&self, packet: Bytes) -> Result<()> {
        self.rtp
            .send_to(&packet, self.client_rtp)
            .await
            .map(|_| ())
            .map_err(Error::TransportWrite)
    }

    pub fn is_writable(&self) -> bool {
        !self.control.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_client_port() {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let rtp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let rtcp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (tx, _rx) = mpsc::channel(1);

        let sink = UdpSink::new(rtp, rtcp, client.local_addr().unwrap(), tx);
        sink.send(Bytes::from_static(b"rtp")).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"rtp");
        assert_eq!(Some(from.port()), sink.local_rtp_port());
    }

    #[tokio::test]
    async fn not_writable_after_control_closes() {
        let rtp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let rtcp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (tx, rx) = mpsc::channel(1);
        let sink = UdpSink::new(rtp, rtcp, "127.0.0.1:9".parse().unwrap(), tx);

        assert!(sink.is_writable());
        drop(rx);
        assert!(!sink.is_writable());
    }
}
