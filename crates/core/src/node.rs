//! Camera node lifecycle: device, capture thread and RTSP server, started
//! in order and torn down in reverse.

use std::future::Future;

use crate::capture::{CaptureConfig, CaptureDevice, FrameArbiter, prepare_device};
use crate::error::Result;
use crate::server::{Server, ServerConfig};

/// Everything needed to run one camera node.
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    pub capture: CaptureConfig,
    pub server: ServerConfig,
}

/// Run the node until `shutdown` resolves.
///
/// `device` must be opened but not started. A device that fails to start
/// or a listener that fails to bind aborts startup; once serving, only
/// `shutdown` ends the node. The device is closed exactly once on the way
/// out.
pub async fn run(
    config: NodeConfig,
    device: Box<dyn CaptureDevice>,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let NodeConfig { capture, server } = config;

    if let Err(e) = capture.validate() {
        if let Err(close_err) = device.close() {
            tracing::warn!(error = %close_err, "closing device after invalid configuration");
        }
        return Err(e.into());
    }

    let device = prepare_device(device, &capture)?;
    let arbiter = FrameArbiter::spawn(device, capture.frame_interval())?;

    let server = match Server::bind(server, arbiter.feed(), capture.fps).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "failed to start RTSP server");
            arbiter.shutdown().await;
            return Err(e);
        }
    };
    match server.url() {
        Ok(url) => tracing::info!(%url, "stream available"),
        Err(e) => tracing::warn!(error = %e, "could not resolve stream URL"),
    }

    server.run_until(shutdown).await;
    arbiter.shutdown().await;
    tracing::info!("node stopped");
    Ok(())
}
