use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::ProtocolError;
use crate::protocol::request::RtspRequest;
use crate::protocol::response::RtspResponse;
use crate::protocol::sdp::{self, SdpOrigin};
use crate::scheduler::StopReason;
use crate::server::ServerConfig;
use crate::session::SessionManager;

pub const PUBLIC_METHODS: &str = "OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN, GET_PARAMETER";

/// Routes RTSP requests for a single TCP connection onto its
/// [`SessionManager`] and turns the outcome into a response.
pub struct MethodHandler {
    sessions: SessionManager,
    client_addr: SocketAddr,
    config: Arc<ServerConfig>,
}

impl MethodHandler {
    pub fn new(sessions: SessionManager, client_addr: SocketAddr, config: Arc<ServerConfig>) -> Self {
        MethodHandler {
            sessions,
            client_addr,
            config,
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub async fn handle(&mut self, request: &RtspRequest) -> RtspResponse {
        let cseq = request.cseq().unwrap_or("0");
        tracing::debug!(method = %request.method, uri = %request.uri, %cseq, "request");

        let result = match request.method.as_str() {
            "OPTIONS" => Ok(self.handle_options()),
            "DESCRIBE" => self.handle_describe(&request.uri),
            "SETUP" => self.handle_setup(request).await,
            "PLAY" => self.handle_play(request),
            "PAUSE" => self.handle_pause(request).await,
            "TEARDOWN" => self.handle_teardown(request).await,
            "GET_PARAMETER" => self.handle_get_parameter(request),
            _ => {
                tracing::warn!(method = %request.method, %cseq, "unsupported RTSP method");
                Ok(RtspResponse::not_implemented().add_header("Public", PUBLIC_METHODS))
            }
        };

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(
                    method = %request.method,
                    uri = %request.uri,
                    peer = %self.client_addr,
                    error = %e,
                    "request failed"
                );
                RtspResponse::error(&e)
            }
        };
        tracing::debug!(status = response.status_code, %cseq, "response");
        response.add_header("CSeq", cseq)
    }

    /// Resolve when this connection's stream ends on its own.
    pub async fn stream_exit(&mut self) -> StopReason {
        self.sessions.stream_exit().await
    }

    /// Release everything held for the connection.
    pub async fn close(&mut self) {
        self.sessions.close().await;
    }

    fn handle_options(&self) -> RtspResponse {
        RtspResponse::ok().add_header("Public", PUBLIC_METHODS)
    }

    /// Host for the SDP origin and connection lines: the configured public
    /// host, else the host the client dialed, else the client's address.
    fn host_from_uri_or_client(&self, uri: &str) -> String {
        if let Some(host) = &self.config.public_host {
            return host.clone();
        }

        if let Some(after_scheme) = uri.strip_prefix("rtsp://") {
            let host = after_scheme
                .split('/')
                .next()
                .and_then(|host_port| host_port.split(':').next())
                .unwrap_or("")
                .trim();
            if !host.is_empty() {
                return host.to_string();
            }
        }
        self.client_addr.ip().to_string()
    }

    fn handle_describe(&self, uri: &str) -> Result<RtspResponse, ProtocolError> {
        let media = self.sessions.describe(uri)?;

        let host = self.host_from_uri_or_client(uri);
        let body = sdp::generate_sdp(
            &media,
            &SdpOrigin {
                ip: &host,
                username: &self.config.sdp_username,
                session_id: &self.config.sdp_session_id,
                session_version: &self.config.sdp_session_version,
                session_name: &self.config.sdp_session_name,
            },
        );

        let base = if uri.ends_with('/') {
            uri.to_string()
        } else {
            format!("{}/", uri)
        };

        Ok(RtspResponse::ok()
            .add_header("Content-Type", "application/sdp")
            .add_header("Content-Base", &base)
            .with_body(body))
    }

    async fn handle_setup(&mut self, request: &RtspRequest) -> Result<RtspResponse, ProtocolError> {
        let reply = self
            .sessions
            .setup(
                &request.uri,
                request.get_header("Transport"),
                request.session_id(),
            )
            .await?;

        Ok(RtspResponse::ok()
            .add_header("Transport", &reply.transport)
            .add_header("Session", &reply.session))
    }

    fn handle_play(&mut self, request: &RtspRequest) -> Result<RtspResponse, ProtocolError> {
        let reply = self.sessions.play(&request.uri, request.session_id())?;

        let mut response = RtspResponse::ok()
            .add_header("Session", &reply.session)
            .add_header("Range", "npt=0.000-");
        if let Some(rtp_info) = &reply.rtp_info {
            response = response.add_header("RTP-Info", rtp_info);
        }
        Ok(response)
    }

    async fn handle_pause(&mut self, request: &RtspRequest) -> Result<RtspResponse, ProtocolError> {
        let session = self
            .sessions
            .pause(&request.uri, request.session_id())
            .await?;
        Ok(RtspResponse::ok().add_header("Session", &session))
    }

    async fn handle_teardown(&mut self, request: &RtspRequest) -> Result<RtspResponse, ProtocolError> {
        self.sessions
            .teardown(&request.uri, request.session_id())
            .await?;
        Ok(RtspResponse::ok())
    }

    /// Keepalive. Echoes the session when one is named.
    fn handle_get_parameter(&self, request: &RtspRequest) -> Result<RtspResponse, ProtocolError> {
        match request.session_id() {
            Some(id) if self.sessions.session_id() != Some(id) => {
                Err(ProtocolError::SessionNotFound(id.to_string()))
            }
            Some(_) => Ok(RtspResponse::ok()
                .add_header("Session", &self.sessions.session_header().unwrap_or_default())),
            None => Ok(RtspResponse::ok()),
        }
    }
}
