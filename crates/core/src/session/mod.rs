//! RTSP session state machine (RFC 2326 §3, §A.1).
//!
//! One [`SessionManager`] per client connection. It owns at most one
//! [`Session`] (the node offers a single track) and sequences:
//!
//! ```text
//! Init    + SETUP        -> Ready
//! Ready   + PLAY         -> Playing   (stream task started)
//! Paused  + PLAY         -> Playing   (numbering continues)
//! Playing + PAUSE        -> Paused    (stream task stopped)
//! any     + TEARDOWN     -> Closed    (transport released)
//! connection closed      -> Closed
//! Closed  + SETUP        -> Ready     (fresh session)
//! ```
//!
//! Requests are checked in a fixed order: stream path (404), session id
//! (454), then state (455). A failed request never changes state.

pub mod transport;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ProtocolError;
use crate::media::MediaDescription;
use crate::media::rtp::RtpHeader;
use crate::mount::Mount;
use crate::protocol::codec::Outbound;
use crate::scheduler::{StopReason, StreamContext, StreamHandle, StreamScheduler, StreamSettings};

pub use transport::{TransportDescriptor, TransportNegotiator, TransportRequest};

/// Default session timeout in seconds (RFC 2326 §12.37).
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session yet on this connection.
    Init,
    /// Transport negotiated, not streaming.
    Ready,
    Playing,
    Paused,
    /// Torn down or disconnected. A new SETUP starts over.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Init => "INIT",
            SessionState::Ready => "READY",
            SessionState::Playing => "PLAYING",
            SessionState::Paused => "PAUSED",
            SessionState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Per-connection session data.
///
/// While playing, the [`StreamContext`] (RTP counters, sink, frame source)
/// lives inside the stream task; it comes back when the task stops.
pub struct Session {
    pub id: String,
    /// Control URI from the SETUP request, used for `RTP-Info`.
    pub uri: String,
    pub transport: TransportDescriptor,
    pub ssrc: u32,
    context: Option<StreamContext>,
    stream: Option<StreamHandle>,
}

impl Session {
    fn header_value(&self, timeout_secs: u64) -> String {
        format!("{};timeout={}", self.id, timeout_secs)
    }
}

/// Response data for a successful SETUP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupReply {
    /// `Session` header value, with timeout.
    pub session: String,
    /// `Transport` header value.
    pub transport: String,
}

/// Response data for a successful PLAY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayReply {
    pub session: String,
    /// `RTP-Info` header value (§12.33). Absent when already playing.
    pub rtp_info: Option<String>,
}

/// Protocol state machine for one client connection.
pub struct SessionManager {
    mount: Arc<Mount>,
    negotiator: TransportNegotiator,
    settings: StreamSettings,
    peer: SocketAddr,
    outbound: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    timeout_secs: u64,
    state: SessionState,
    session: Option<Session>,
}

impl SessionManager {
    /// `outbound` is the connection's writer queue and `cancel` its
    /// cancellation token; stream tasks are children of it.
    pub fn new(
        mount: Arc<Mount>,
        negotiator: TransportNegotiator,
        settings: StreamSettings,
        peer: SocketAddr,
        outbound: mpsc::Sender<Outbound>,
        cancel: CancellationToken,
        timeout_secs: u64,
    ) -> Self {
        Self {
            mount,
            negotiator,
            settings,
            peer,
            outbound,
            cancel,
            timeout_secs,
            state: SessionState::Init,
            session: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.id.as_str())
    }

    /// `Session` header value for the current session.
    pub fn session_header(&self) -> Option<String> {
        self.session
            .as_ref()
            .map(|s| s.header_value(self.timeout_secs))
    }

    /// Idle limit for the current session, if it has one.
    ///
    /// Only UDP sessions expire: an interleaved session lives exactly as
    /// long as its TCP connection.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.session
            .as_ref()
            .filter(|s| s.transport.is_udp())
            .map(|_| Duration::from_secs(self.timeout_secs))
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            tracing::debug!(
                session_id = self.session_id().unwrap_or("-"),
                from = %self.state,
                to = %state,
                "state transition"
            );
            self.state = state;
        }
    }

    /// DESCRIBE. Independent of session state.
    pub fn describe(&self, uri: &str) -> Result<Arc<MediaDescription>, ProtocolError> {
        self.mount.resolve(uri)?;
        Ok(self.mount.description())
    }

    pub async fn setup(
        &mut self,
        uri: &str,
        transport: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<SetupReply, ProtocolError> {
        self.mount.resolve(uri)?;

        if let Some(id) = session_id {
            if self.session_id() != Some(id) {
                return Err(ProtocolError::SessionNotFound(id.to_string()));
            }
        }
        if !matches!(self.state, SessionState::Init | SessionState::Closed) {
            return Err(ProtocolError::MethodNotValidInState {
                method: "SETUP".into(),
                state: self.state,
            });
        }

        let header =
            transport.ok_or_else(|| ProtocolError::BadRequest("missing Transport header".into()))?;
        let request = TransportRequest::parse(header)?;
        let (descriptor, sink) = self
            .negotiator
            .negotiate(&request, self.peer.ip(), &self.outbound)
            .await?;

        let rtp = RtpHeader::with_random_start(self.mount.payload_type());
        let session = Session {
            id: format!("{:016X}", rand::random::<u64>()),
            uri: uri.to_string(),
            transport: descriptor,
            ssrc: rtp.ssrc,
            context: Some(StreamContext {
                rtp,
                sink,
                source: self.mount.frame_source(),
                packetizer: self.mount.packetizer(),
            }),
            stream: None,
        };

        let reply = SetupReply {
            session: session.header_value(self.timeout_secs),
            transport: descriptor.header_value(session.ssrc),
        };
        tracing::info!(
            session_id = %session.id,
            peer = %self.peer,
            transport = %reply.transport,
            "session created"
        );
        self.session = Some(session);
        self.set_state(SessionState::Ready);
        Ok(reply)
    }

    pub fn play(&mut self, uri: &str, session_id: Option<&str>) -> Result<PlayReply, ProtocolError> {
        self.mount.resolve(uri)?;
        self.check_session("PLAY", session_id)?;

        match self.state {
            SessionState::Playing => {
                return Ok(PlayReply {
                    session: self.session_header().unwrap_or_default(),
                    rtp_info: None,
                });
            }
            SessionState::Ready | SessionState::Paused => {}
            state => {
                return Err(ProtocolError::MethodNotValidInState {
                    method: "PLAY".into(),
                    state,
                });
            }
        }

        let timeout_secs = self.timeout_secs;
        let settings = self.settings;
        let cancel = self.cancel.clone();
        let session = self.session.as_mut().ok_or_else(|| {
            ProtocolError::SessionNotFound(session_id.unwrap_or_default().to_string())
        })?;
        let context = session.context.take().ok_or_else(|| {
            ProtocolError::SessionNotFound(session.id.clone())
        })?;

        let rtp_info = format!(
            "url={};seq={};rtptime={}",
            session.uri,
            context.rtp.sequence(),
            context.rtp.timestamp()
        );
        session.stream = Some(StreamScheduler::spawn(
            session.id.clone(),
            context,
            settings,
            &cancel,
        ));
        let reply = PlayReply {
            session: session.header_value(timeout_secs),
            rtp_info: Some(rtp_info),
        };
        tracing::info!(session_id = %session.id, "session playing");

        self.set_state(SessionState::Playing);
        Ok(reply)
    }

    /// PAUSE. Returns the `Session` header value.
    pub async fn pause(&mut self, uri: &str, session_id: Option<&str>) -> Result<String, ProtocolError> {
        self.mount.resolve(uri)?;
        self.check_session("PAUSE", session_id)?;

        match self.state {
            SessionState::Playing => {}
            SessionState::Ready | SessionState::Paused => {
                return Ok(self.session_header().unwrap_or_default());
            }
            state => {
                return Err(ProtocolError::MethodNotValidInState {
                    method: "PAUSE".into(),
                    state,
                });
            }
        }

        if let Some(session) = self.session.as_mut() {
            if let Some(handle) = session.stream.take() {
                match handle.stop().await {
                    Some(exit) => session.context = Some(exit.context),
                    None => {
                        let id = session.id.clone();
                        self.end_session("stream task failed");
                        return Err(ProtocolError::SessionNotFound(id));
                    }
                }
            }
            tracing::info!(session_id = %session.id, "session paused");
        }
        self.set_state(SessionState::Paused);
        Ok(self.session_header().unwrap_or_default())
    }

    pub async fn teardown(&mut self, uri: &str, session_id: Option<&str>) -> Result<(), ProtocolError> {
        self.mount.resolve(uri)?;
        if self.session.is_some() || session_id.is_some() {
            self.check_session("TEARDOWN", session_id)?;
        }
        self.stop_stream().await;
        self.end_session("teardown");
        Ok(())
    }

    /// Connection closed: stop streaming and release the transport.
    pub async fn close(&mut self) {
        self.stop_stream().await;
        self.end_session("connection closed");
    }

    /// Resolve when the stream task ends on its own (client unreachable,
    /// device stalled or closed). The session is closed by then. Pending
    /// forever while nothing is streaming. Cancel-safe.
    pub async fn stream_exit(&mut self) -> StopReason {
        let Some(handle) = self.session.as_mut().and_then(|s| s.stream.as_mut()) else {
            return std::future::pending().await;
        };
        let reason = match handle.finished().await {
            Some(exit) => exit.reason,
            None => StopReason::Disconnected("stream task failed".into()),
        };
        if let Some(session) = self.session.as_mut() {
            session.stream = None;
        }
        self.end_session("stream ended");
        reason
    }

    fn check_session(&self, method: &str, session_id: Option<&str>) -> Result<(), ProtocolError> {
        match (&self.session, session_id) {
            (Some(session), Some(id)) if session.id == id => Ok(()),
            (_, Some(id)) => Err(ProtocolError::SessionNotFound(id.to_string())),
            (Some(_), None) => Err(ProtocolError::SessionNotFound(
                "missing Session header".into(),
            )),
            (None, None) => Err(ProtocolError::MethodNotValidInState {
                method: method.to_string(),
                state: self.state,
            }),
        }
    }

    async fn stop_stream(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if let Some(handle) = session.stream.take() {
            if let Some(exit) = handle.stop().await {
                session.context = Some(exit.context);
            }
        }
    }

    /// Drop the session (releasing its sink and ports) and enter Closed.
    fn end_session(&mut self, cause: &str) {
        if let Some(session) = self.session.take() {
            tracing::info!(session_id = %session.id, cause, "session closed");
        }
        self.set_state(SessionState::Closed);
    }
}
