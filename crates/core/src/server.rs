use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::capture::FrameFeed;
use crate::error::Result;
use crate::media::{DEFAULT_MAX_PAYLOAD, H264_PAYLOAD_TYPE};
use crate::mount::{DEFAULT_STREAM_PATH, Mount};
use crate::scheduler::StreamSettings;
use crate::session::{DEFAULT_SESSION_TIMEOUT_SECS, TransportNegotiator};
use crate::transport::tcp::{ConnectionShared, Listener};

/// Default RTSP port for the node (RFC 2326 reserves 554; 8554 needs no privileges).
pub const DEFAULT_RTSP_PORT: u16 = 8554;

/// How long shutdown waits for connection tasks before giving up on them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Server-level configuration used by the listener and protocol handlers.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// RTSP listen address.
    pub bind_addr: SocketAddr,
    /// Path of the single mount, without the leading slash.
    pub stream_path: String,
    /// Dynamic RTP payload type for H264.
    pub payload_type: u8,
    /// Largest RTP payload before FU-A fragmentation.
    pub max_payload_size: usize,
    /// Inclusive range of even/odd server ports for UDP delivery.
    pub udp_port_range: (u16, u16),
    /// Consecutive frame misses after which a playing stream gives up.
    pub max_missed_frames: u32,
    /// Advertised in the `Session` header; UDP sessions expire after it.
    pub session_timeout_secs: u64,
    /// Depth of each connection's outbound queue (responses and interleaved RTP).
    pub outbound_queue: usize,
    /// Public host advertised in SDP `o=` and `c=` lines.
    /// When `None`, host is inferred from request URI/client address.
    pub public_host: Option<String>,
    /// SDP origin username field (`o=<username> ...`).
    pub sdp_username: String,
    /// SDP origin session id field (`o=... <session-id> ...`).
    pub sdp_session_id: String,
    /// SDP origin session version field (`o=... ... <session-version> ...`).
    pub sdp_session_version: String,
    /// SDP session name (`s=`).
    pub sdp_session_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_RTSP_PORT),
            stream_path: DEFAULT_STREAM_PATH.to_string(),
            payload_type: H264_PAYLOAD_TYPE,
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            udp_port_range: (5000, 65534),
            max_missed_frames: 60,
            session_timeout_secs: DEFAULT_SESSION_TIMEOUT_SECS,
            outbound_queue: 256,
            public_host: None,
            sdp_username: "-".to_string(),
            sdp_session_id: "0".to_string(),
            sdp_session_version: "0".to_string(),
            sdp_session_name: "Stream".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn stream_path(mut self, path: impl Into<String>) -> Self {
        self.stream_path = path.into();
        self
    }

    pub fn max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size;
        self
    }

    pub fn udp_port_range(mut self, min: u16, max: u16) -> Self {
        self.udp_port_range = (min, max);
        self
    }

    pub fn max_missed_frames(mut self, misses: u32) -> Self {
        self.max_missed_frames = misses;
        self
    }

    pub fn session_timeout_secs(mut self, secs: u64) -> Self {
        self.session_timeout_secs = secs;
        self
    }

    pub fn public_host(mut self, host: impl Into<String>) -> Self {
        self.public_host = Some(host.into());
        self
    }
}

/// RTSP server for one mount backed by a shared frame feed.
///
/// Owns the listener and the cancellation tree: every connection gets a
/// child token, every playing stream a grandchild, so shutdown reaches all
/// of them from one place.
pub struct Server {
    listener: Listener,
    config: Arc<ServerConfig>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Server {
    /// Bind the listener and prepare the mount. `fps` paces every stream.
    pub async fn bind(config: ServerConfig, feed: FrameFeed, fps: u32) -> Result<Self> {
        let config = Arc::new(config);
        let mount = Arc::new(Mount::new(
            &config.stream_path,
            config.payload_type,
            fps,
            feed,
        ));
        let shared = ConnectionShared {
            mount,
            negotiator: TransportNegotiator::new(config.bind_addr.ip(), config.udp_port_range),
            settings: StreamSettings::from_fps(
                fps,
                config.max_payload_size,
                config.max_missed_frames,
            ),
            config: Arc::clone(&config),
        };

        let inner = TcpListener::bind(config.bind_addr).await?;
        let listener = Listener::new(inner, shared);
        tracing::info!(addr = %listener.local_addr()?, "RTSP server listening");

        Ok(Self {
            listener,
            config,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Stream URL as a client would dial it.
    pub fn url(&self) -> Result<String> {
        let addr = self.local_addr()?;
        let host = match &self.config.public_host {
            Some(host) => host.clone(),
            None if addr.ip().is_unspecified() => "localhost".to_string(),
            None => addr.ip().to_string(),
        };
        Ok(format!(
            "rtsp://{}:{}/{}",
            host,
            addr.port(),
            self.config.stream_path.trim_matches('/')
        ))
    }

    /// Token cancelled when the server stops; tripping it stops the server.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Serve until `shutdown` resolves, then close every connection and
    /// wait for their tasks to finish.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) {
        tokio::select! {
            _ = shutdown => tracing::info!("shutdown requested"),
            _ = self.listener.accept_loop(&self.cancel, &self.tracker) => {}
        }

        self.cancel.cancel();
        self.tracker.close();
        let open = self.tracker.len();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(open, "connections did not close within the grace period");
        }
        tracing::info!("RTSP server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 8554);
        assert_eq!(config.stream_path, "stream");
        assert_eq!(config.payload_type, 96);
        assert_eq!(config.max_payload_size, 1400);
        assert_eq!(config.session_timeout_secs, 60);
        assert!(config.public_host.is_none());
    }

    #[test]
    fn test_builder_overrides() {
        let config = ServerConfig::default()
            .bind("127.0.0.1:9554".parse().unwrap())
            .stream_path("cam")
            .udp_port_range(6000, 6099)
            .public_host("cam.local");
        assert_eq!(config.bind_addr.port(), 9554);
        assert_eq!(config.stream_path, "cam");
        assert_eq!(config.udp_port_range, (6000, 6099));
        assert_eq!(config.public_host.as_deref(), Some("cam.local"));
    }

    #[tokio::test]
    async fn url_uses_bound_port() {
        let (_publisher, feed) = FrameFeed::channel();
        let config = ServerConfig::default().bind("127.0.0.1:0".parse().unwrap());
        let server = Server::bind(config, feed, 30).await.unwrap();
        let port = server.local_addr().unwrap().port();
        assert_ne!(port, 0);
        assert_eq!(server.url().unwrap(), format!("rtsp://127.0.0.1:{}/stream", port));
    }

    #[tokio::test]
    async fn run_until_returns_on_shutdown() {
        let (_publisher, feed) = FrameFeed::channel();
        let config = ServerConfig::default().bind("127.0.0.1:0".parse().unwrap());
        let server = Server::bind(config, feed, 30).await.unwrap();
        let token = server.cancellation_token();
        let task = tokio::spawn(server.run_until(async {}));
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(token.is_cancelled());
    }
}
