use std::future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::Result;
use crate::mount::Mount;
use crate::protocol::codec::{Inbound, Outbound, RtspCodec};
use crate::protocol::{MethodHandler, RtspResponse};
use crate::scheduler::StreamSettings;
use crate::server::ServerConfig;
use crate::session::{SessionManager, TransportNegotiator};

/// Pause after a failed accept (e.g. file descriptor exhaustion).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// How long a closing connection waits for queued responses to flush.
const WRITER_FLUSH_GRACE: Duration = Duration::from_millis(500);

/// State shared by every connection of a server.
#[derive(Clone)]
pub struct ConnectionShared {
    pub mount: Arc<Mount>,
    pub negotiator: TransportNegotiator,
    pub settings: StreamSettings,
    pub config: Arc<ServerConfig>,
}

/// RTSP listener: accepts clients and runs one task per connection.
pub struct Listener {
    inner: TcpListener,
    shared: ConnectionShared,
}

impl Listener {
    pub fn new(inner: TcpListener, shared: ConnectionShared) -> Self {
        Self { inner, shared }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    /// Accept until `cancel` fires. Connections are spawned on `tracker`
    /// with a child token of `cancel`.
    pub async fn accept_loop(&self, cancel: &CancellationToken, tracker: &TaskTracker) {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.inner.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(peer = %peer_addr, error = %e, "TCP_NODELAY not set");
                    }
                    let shared = self.shared.clone();
                    let conn_cancel = cancel.child_token();
                    tracker.spawn(Connection::handle(stream, peer_addr, shared, conn_cancel));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "TCP accept error");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
        tracing::debug!("accept loop exited");
    }
}

/// A single RTSP client connection with its own lifecycle.
struct Connection {
    reader: FramedRead<tokio::net::tcp::OwnedReadHalf, RtspCodec>,
    outbound: mpsc::Sender<Outbound>,
    writer: JoinHandle<()>,
    handler: MethodHandler,
    peer_addr: SocketAddr,
}

impl Connection {
    /// Entry point: set up a connection, run its request loop, clean up.
    async fn handle(
        stream: TcpStream,
        peer_addr: SocketAddr,
        shared: ConnectionShared,
        cancel: CancellationToken,
    ) {
        tracing::info!(%peer_addr, "client connected");

        let (read_half, write_half) = stream.into_split();
        let (outbound, rx) = mpsc::channel(shared.config.outbound_queue.max(1));
        let writer = tokio::spawn(write_loop(
            FramedWrite::new(write_half, RtspCodec),
            rx,
            cancel.clone(),
            peer_addr,
        ));

        let sessions = SessionManager::new(
            shared.mount,
            shared.negotiator,
            shared.settings,
            peer_addr,
            outbound.clone(),
            cancel.clone(),
            shared.config.session_timeout_secs,
        );

        let mut conn = Connection {
            reader: FramedRead::new(read_half, RtspCodec),
            outbound,
            writer,
            handler: MethodHandler::new(sessions, peer_addr, shared.config),
            peer_addr,
        };

        let reason = conn.run(&cancel).await;
        conn.cleanup().await;

        tracing::info!(%peer_addr, reason, "client disconnected");
    }

    /// Request/response loop. Returns the reason for exiting.
    async fn run(&mut self, cancel: &CancellationToken) -> &'static str {
        let mut last_request = Instant::now();

        loop {
            let idle = self.handler.sessions().idle_timeout();
            let expiry = async move {
                match idle {
                    Some(limit) => tokio::time::sleep_until(last_request + limit).await,
                    None => future::pending().await,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => return "server shutting down",
                _ = &mut self.writer => return "write error",
                reason = self.handler.stream_exit() => {
                    tracing::info!(peer = %self.peer_addr, ?reason, "stream ended, closing connection");
                    return "stream ended";
                }
                _ = expiry => {
                    tracing::warn!(peer = %self.peer_addr, "session timed out without keepalive");
                    return "session timeout";
                }
                item = self.reader.next() => match item {
                    None => return "connection closed by client",
                    Some(Err(e)) => {
                        tracing::warn!(peer = %self.peer_addr, error = %e, "read error");
                        return "read error";
                    }
                    Some(Ok(Inbound::Request(request))) => {
                        last_request = Instant::now();
                        let response = self.handler.handle(&request).await;
                        if self.outbound.send(Outbound::Response(response)).await.is_err() {
                            return "write error";
                        }
                    }
                    Some(Ok(Inbound::Interleaved { channel, payload })) => {
                        tracing::trace!(peer = %self.peer_addr, channel, bytes = payload.len(), "interleaved data from client ignored");
                    }
                    Some(Ok(Inbound::Invalid(kind))) => {
                        tracing::warn!(peer = %self.peer_addr, error = %kind, "parse error");
                        let response = RtspResponse::bad_request().add_header("CSeq", "0");
                        if self.outbound.send(Outbound::Response(response)).await.is_err() {
                            return "write error";
                        }
                    }
                },
            }
        }
    }

    /// Close the session (stopping its stream and releasing its transport),
    /// then let the writer drain.
    async fn cleanup(self) {
        let Connection {
            mut handler,
            outbound,
            writer,
            ..
        } = self;
        handler.close().await;
        drop(handler);
        drop(outbound);

        if !writer.is_finished() {
            let abort = writer.abort_handle();
            if tokio::time::timeout(WRITER_FLUSH_GRACE, writer).await.is_err() {
                abort.abort();
            }
        }
    }
}

/// Owns the write half. Ends when every sender is gone, on cancellation
/// or on the first write error.
async fn write_loop(
    mut writer: FramedWrite<OwnedWriteHalf, RtspCodec>,
    mut rx: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
    peer_addr: SocketAddr,
) {
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        let result = match writer.feed(item).await {
            Ok(()) if rx.is_empty() => writer.flush().await,
            other => other,
        };
        if let Err(e) = result {
            tracing::debug!(peer = %peer_addr, error = %e, "write failed");
            return;
        }
    }
    if let Err(e) = writer.close().await {
        tracing::trace!(peer = %peer_addr, error = %e, "closing write half");
    }
}
