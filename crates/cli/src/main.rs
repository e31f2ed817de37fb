use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use stagecam::capture::SyntheticDevice;
use stagecam::{CaptureConfig, CaptureDevice, NodeConfig, PixelFormat, ServerConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "stagecam-server",
    about = "Stream a local H.264 camera over RTSP"
)]
struct Args {
    /// Capture device path
    #[arg(long, short, default_value = "/dev/video0")]
    device: PathBuf,

    #[arg(long, default_value_t = 640)]
    width: u32,

    #[arg(long, default_value_t = 480)]
    height: u32,

    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Pixel format: H264, MJPEG or YUYV
    #[arg(long, default_value = "H264")]
    pixel_format: String,

    /// Apply low-light IR tuning controls before streaming
    #[arg(long)]
    ir_mode: bool,

    /// RTSP listen port
    #[arg(long, short = 'p', default_value_t = 8554)]
    rtsp_port: u16,

    /// Address to bind the RTSP listener and RTP sockets on
    #[arg(long, default_value = "0.0.0.0")]
    bind_host: IpAddr,

    /// Stream path clients request, e.g. rtsp://host:8554/<path>
    #[arg(long, default_value = "stream")]
    stream_path: String,

    /// Largest RTP payload before fragmentation
    #[arg(long, default_value_t = 1400)]
    max_payload: usize,

    /// Host advertised in SDP instead of the one the client dialed
    #[arg(long)]
    public_host: Option<String>,

    /// Serve generated H.264 instead of opening a capture device
    #[arg(long)]
    synthetic: bool,

    /// Debug logging (RUST_LOG overrides)
    #[arg(long, short)]
    verbose: bool,
}

impl Args {
    fn node_config(&self) -> NodeConfig {
        let capture = CaptureConfig::default()
            .device_path(&self.device)
            .resolution(self.width, self.height)
            .fps(self.fps)
            .pixel_format(PixelFormat::from_name(&self.pixel_format))
            .ir_mode(self.ir_mode);

        let mut server = ServerConfig::default()
            .bind(SocketAddr::new(self.bind_host, self.rtsp_port))
            .stream_path(&self.stream_path)
            .max_payload_size(self.max_payload);
        if let Some(host) = &self.public_host {
            server = server.public_host(host);
        }

        NodeConfig { capture, server }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn open_device(args: &Args, config: &CaptureConfig) -> anyhow::Result<Box<dyn CaptureDevice>> {
    if args.synthetic {
        tracing::info!("using synthetic capture device");
        let device = SyntheticDevice::open(config).context("opening synthetic device")?;
        return Ok(Box::new(device));
    }

    #[cfg(all(feature = "v4l2", target_os = "linux"))]
    {
        let device = stagecam::capture::V4l2Device::open(config)
            .with_context(|| format!("opening {}", config.device_path.display()))?;
        tracing::info!(device = %config.device_path.display(), "capture device opened");
        Ok(Box::new(device))
    }

    #[cfg(not(all(feature = "v4l2", target_os = "linux")))]
    {
        anyhow::bail!(
            "built without V4L2 support, cannot open {}; rebuild with `--features v4l2` or pass --synthetic",
            config.device_path.display()
        )
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!(signal = "SIGINT", "shutting down"),
        _ = terminate => tracing::info!(signal = "SIGTERM", "shutting down"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = args.node_config();
    let device = open_device(&args, &config.capture)?;

    stagecam::node::run(config, device, shutdown_signal())
        .await
        .context("camera node failed")
}
