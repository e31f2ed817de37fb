//! Single-camera RTSP node.
//!
//! Captures H264 from a video device on one thread and serves it to any
//! number of RTSP clients, each with its own session, transport and RTP
//! numbering.

pub mod capture;
pub mod error;
pub mod media;
pub mod mount;
pub mod node;
pub mod protocol;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod transport;

pub use capture::{CaptureConfig, CaptureDevice, Frame, FrameArbiter, FrameFeed, PixelFormat};
pub use error::{DeviceError, Error, ProtocolError, Result};
pub use media::Packetizer;
pub use node::NodeConfig;
pub use server::{Server, ServerConfig};
pub use session::SessionState;
