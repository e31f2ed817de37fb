use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::error::ProtocolError;
use crate::protocol::codec::Outbound;
use crate::transport::{InterleavedSink, MediaSink, UdpSink};

/// Upper bound on bind attempts per SETUP, whatever the range size.
const MAX_BIND_ATTEMPTS: u64 = 256;

/// Client side of the `Transport` header (RFC 2326 §12.39).
///
/// ```text
/// Transport: RTP/AVP;unicast;client_port=8000-8001
/// Transport: RTP/AVP/TCP;unicast;interleaved=0-1
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportRequest {
    Udp {
        client_rtp_port: u16,
        client_rtcp_port: u16,
    },
    Interleaved {
        rtp_channel: u8,
        rtcp_channel: u8,
    },
}

impl TransportRequest {
    /// Parse a `Transport` header value.
    ///
    /// Comma-separated alternatives are tried in order and the first one
    /// the server supports wins. If none qualifies the error of the first
    /// alternative is returned.
    pub fn parse(header: &str) -> Result<Self, ProtocolError> {
        let mut first_err = None;
        for spec in header.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match Self::parse_one(spec) {
                Ok(request) => return Ok(request),
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        Err(first_err.unwrap_or_else(|| ProtocolError::BadRequest("empty Transport header".into())))
    }

    fn parse_one(spec: &str) -> Result<Self, ProtocolError> {
        let mut params = spec.split(';').map(str::trim);
        let protocol = params.next().unwrap_or_default().to_ascii_uppercase();
        let params: Vec<&str> = params.collect();

        if params.iter().any(|p| p.eq_ignore_ascii_case("multicast")) {
            return Err(ProtocolError::UnsupportedTransport(spec.to_string()));
        }

        match protocol.as_str() {
            "RTP/AVP" | "RTP/AVP/UDP" => {
                let ports = param_value(&params, "client_port").ok_or_else(|| {
                    ProtocolError::BadRequest(format!("no client_port in {}", spec))
                })?;
                let (rtp, rtcp) = parse_pair::<u16>(ports)
                    .ok_or_else(|| ProtocolError::BadRequest(format!("bad client_port in {}", spec)))?;
                Ok(Self::Udp {
                    client_rtp_port: rtp,
                    client_rtcp_port: rtcp,
                })
            }
            "RTP/AVP/TCP" => {
                let (rtp, rtcp) = match param_value(&params, "interleaved") {
                    Some(channels) => parse_pair::<u8>(channels).ok_or_else(|| {
                        ProtocolError::UnsupportedTransport(format!("bad interleaved channels in {}", spec))
                    })?,
                    None => (0, 1),
                };
                if rtp == rtcp {
                    return Err(ProtocolError::UnsupportedTransport(format!(
                        "interleaved channels must differ in {}",
                        spec
                    )));
                }
                Ok(Self::Interleaved {
                    rtp_channel: rtp,
                    rtcp_channel: rtcp,
                })
            }
            _ => Err(ProtocolError::UnsupportedTransport(spec.to_string())),
        }
    }
}

fn param_value<'a>(params: &[&'a str], name: &str) -> Option<&'a str> {
    params.iter().copied().find_map(|p| {
        let (key, value) = p.split_once('=')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

/// `a-b` or a lone `a`, which implies `a+1`.
fn parse_pair<T>(value: &str) -> Option<(T, T)>
where
    T: std::str::FromStr + Copy + TryFrom<u32>,
    u32: From<T>,
{
    match value.split_once('-') {
        Some((a, b)) => Some((a.trim().parse().ok()?, b.trim().parse().ok()?)),
        None => {
            let a: T = value.trim().parse().ok()?;
            let b = T::try_from(u32::from(a) + 1).ok()?;
            Some((a, b))
        }
    }
}

/// Delivery parameters fixed at SETUP. Immutable for the session's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportDescriptor {
    Udp {
        client_addr: IpAddr,
        client_rtp_port: u16,
        client_rtcp_port: u16,
        server_rtp_port: u16,
        server_rtcp_port: u16,
    },
    Interleaved {
        rtp_channel: u8,
        rtcp_channel: u8,
    },
}

impl TransportDescriptor {
    /// The `Transport` header echoed in the SETUP response.
    pub fn header_value(&self, ssrc: u32) -> String {
        match self {
            Self::Udp {
                client_rtp_port,
                client_rtcp_port,
                server_rtp_port,
                server_rtcp_port,
                ..
            } => format!(
                "RTP/AVP;unicast;client_port={}-{};server_port={}-{};ssrc={:08X}",
                client_rtp_port, client_rtcp_port, server_rtp_port, server_rtcp_port, ssrc
            ),
            Self::Interleaved {
                rtp_channel,
                rtcp_channel,
            } => format!(
                "RTP/AVP/TCP;unicast;interleaved={}-{};ssrc={:08X}",
                rtp_channel, rtcp_channel, ssrc
            ),
        }
    }

    pub fn is_udp(&self) -> bool {
        matches!(self, Self::Udp { .. })
    }
}

/// Turns a client's transport request into a concrete delivery path.
///
/// Shared by every connection. UDP pairs are taken from a rotating cursor
/// over the configured range: RTP on an even port, RTCP on the next one
/// (RFC 3550 §11). Ports already in use are skipped.
#[derive(Clone)]
pub struct TransportNegotiator {
    bind_ip: IpAddr,
    port_min: u16,
    port_max: u16,
    cursor: Arc<AtomicU64>,
}

impl TransportNegotiator {
    pub fn new(bind_ip: IpAddr, port_range: (u16, u16)) -> Self {
        let port_min = port_range.0.saturating_add(port_range.0 % 2);
        Self {
            bind_ip,
            port_min,
            port_max: port_range.1,
            cursor: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of RTP/RTCP pairs in the configured range.
    fn pair_count(&self) -> u64 {
        if self.port_max <= self.port_min {
            return 0;
        }
        (u64::from(self.port_max) - u64::from(self.port_min) + 1) / 2
    }

    pub async fn negotiate(
        &self,
        request: &TransportRequest,
        peer_ip: IpAddr,
        outbound: &mpsc::Sender<Outbound>,
    ) -> Result<(TransportDescriptor, MediaSink), ProtocolError> {
        match *request {
            TransportRequest::Udp {
                client_rtp_port,
                client_rtcp_port,
            } => {
                let (rtp, rtcp, server_rtp_port) = self.bind_pair().await?;
                tracing::debug!(
                    server_rtp_port,
                    client = %SocketAddr::new(peer_ip, client_rtp_port),
                    "UDP transport negotiated"
                );
                let sink = UdpSink::new(
                    rtp,
                    rtcp,
                    SocketAddr::new(peer_ip, client_rtp_port),
                    outbound.clone(),
                );
                Ok((
                    TransportDescriptor::Udp {
                        client_addr: peer_ip,
                        client_rtp_port,
                        client_rtcp_port,
                        server_rtp_port,
                        server_rtcp_port: server_rtp_port + 1,
                    },
                    MediaSink::Udp(sink),
                ))
            }
            TransportRequest::Interleaved {
                rtp_channel,
                rtcp_channel,
            } => {
                tracing::debug!(rtp_channel, rtcp_channel, "interleaved transport negotiated");
                Ok((
                    TransportDescriptor::Interleaved {
                        rtp_channel,
                        rtcp_channel,
                    },
                    MediaSink::Interleaved(InterleavedSink::new(rtp_channel, outbound.clone())),
                ))
            }
        }
    }

    async fn bind_pair(&self) -> Result<(UdpSocket, UdpSocket, u16), ProtocolError> {
        let pairs = self.pair_count();
        let attempts = pairs.min(MAX_BIND_ATTEMPTS);

        for _ in 0..attempts {
            let index = self.cursor.fetch_add(1, Ordering::Relaxed) % pairs;
            let Ok(rtp_port) = u16::try_from(u64::from(self.port_min) + index * 2) else {
                continue;
            };
            let Some(rtcp_port) = rtp_port.checked_add(1) else {
                continue;
            };

            let Ok(rtp) = UdpSocket::bind((self.bind_ip, rtp_port)).await else {
                tracing::trace!(rtp_port, "RTP port busy");
                continue;
            };
            let Ok(rtcp) = UdpSocket::bind((self.bind_ip, rtcp_port)).await else {
                tracing::trace!(rtcp_port, "RTCP port busy");
                continue;
            };
            return Ok((rtp, rtcp, rtp_port));
        }

        tracing::warn!(
            port_min = self.port_min,
            port_max = self.port_max,
            attempts,
            "no free UDP port pair"
        );
        Err(ProtocolError::TransportUnavailable(format!(
            "no free UDP port pair in {}-{}",
            self.port_min, self.port_max
        )))
    }
}

impl Default for TransportNegotiator {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), (5000, 65534))
    }
}
