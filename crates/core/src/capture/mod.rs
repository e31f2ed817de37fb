//! Capture device abstraction.
//!
//! A [`CaptureDevice`] owns the physical video source and hands out encoded
//! frames one at a time through a blocking [`CaptureDevice::next_frame`].
//! The device is never shared directly: the [`arbiter::FrameArbiter`] owns it
//! on a dedicated thread and fans every frame out to the playing sessions.
//!
//! Lifecycle: open (implementation constructor) → optional IR tuning →
//! [`start`](CaptureDevice::start) → frames → [`close`](CaptureDevice::close).
//! `close` consumes the device, so it runs exactly once.

pub mod arbiter;
pub mod synthetic;
#[cfg(all(feature = "v4l2", target_os = "linux"))]
pub mod v4l2;

use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::error::DeviceError;
use crate::media::VIDEO_CLOCK_RATE;

pub use arbiter::{FrameArbiter, FrameFeed, FramePublisher, FrameSource};
pub use synthetic::SyntheticDevice;
#[cfg(all(feature = "v4l2", target_os = "linux"))]
pub use v4l2::V4l2Device;

/// Pixel formats the capture device can be asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    #[default]
    H264,
    Mjpeg,
    Yuyv,
}

impl PixelFormat {
    /// Map a format name; unknown names fall back to H264 with a warning.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_uppercase().as_str() {
            "H264" => Self::H264,
            "MJPEG" => Self::Mjpeg,
            "YUYV" => Self::Yuyv,
            _ => {
                tracing::warn!(format = name, "unknown pixel format, using H264");
                Self::H264
            }
        }
    }

    /// Video4Linux2 FourCC code.
    pub fn fourcc(&self) -> [u8; 4] {
        match self {
            Self::H264 => *b"H264",
            Self::Mjpeg => *b"MJPG",
            Self::Yuyv => *b"YUYV",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::H264 => write!(f, "H264"),
            Self::Mjpeg => write!(f, "MJPEG"),
            Self::Yuyv => write!(f, "YUYV"),
        }
    }
}

/// Capture parameters handed to a device when it is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    pub device_path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub pixel_format: PixelFormat,
    /// Apply the low-light tuning controls before streaming starts.
    pub ir_mode: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from("/dev/video0"),
            width: 640,
            height: 480,
            fps: 30,
            pixel_format: PixelFormat::H264,
            ir_mode: false,
        }
    }
}

impl CaptureConfig {
    pub fn device_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.device_path = path.into();
        self
    }

    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }

    pub fn pixel_format(mut self, format: PixelFormat) -> Self {
        self.pixel_format = format;
        self
    }

    pub fn ir_mode(mut self, enabled: bool) -> Self {
        self.ir_mode = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), DeviceError> {
        if self.width == 0 || self.height == 0 {
            return Err(DeviceError::InvalidConfig(format!(
                "resolution {}x{} must be non-zero",
                self.width, self.height
            )));
        }
        if self.fps == 0 || self.fps > VIDEO_CLOCK_RATE {
            return Err(DeviceError::InvalidConfig(format!(
                "fps {} must be between 1 and {}",
                self.fps, VIDEO_CLOCK_RATE
            )));
        }
        Ok(())
    }

    /// Per-buffer allocation: covers an uncompressed 16 bpp frame, which
    /// bounds any encoder output at this resolution.
    pub fn buffer_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 2
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.fps.max(1)
    }
}

/// One encoded access unit.
///
/// `data` is a reference-counted, immutable buffer: cloning a frame (or
/// handing it to several sessions) never copies the payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Bytes,
    pub captured_at: Instant,
    /// Capture index reported by the device.
    pub sequence: u64,
}

/// A video source producing encoded frames.
///
/// Implementations are driven from a single thread; `next_frame` may block.
pub trait CaptureDevice: Send {
    /// Begin streaming. Failure is fatal to startup.
    fn start(&mut self) -> Result<(), DeviceError>;

    /// Block until the next frame is available.
    ///
    /// The device's own buffer must be released before returning: the
    /// frame carries its own copy of the payload.
    fn next_frame(&mut self) -> Result<Frame, DeviceError>;

    /// Write a single device control.
    fn set_control(&mut self, id: u32, value: i32) -> Result<(), DeviceError>;

    /// Stop streaming and release the device.
    fn close(self: Box<Self>) -> Result<(), DeviceError>;
}

/// A device control write, by V4L2 control id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetting {
    pub name: &'static str,
    pub id: u32,
    pub value: i32,
}

/// Low-light capture tuning. Not every device exposes every control.
pub const IR_MODE_CONTROLS: [ControlSetting; 5] = [
    ControlSetting {
        name: "white_balance_automatic",
        id: 0x0098_090c,
        value: 0,
    },
    // V4L2_EXPOSURE_MANUAL
    ControlSetting {
        name: "auto_exposure",
        id: 0x009a_0901,
        value: 1,
    },
    ControlSetting {
        name: "exposure_time_absolute",
        id: 0x009a_0902,
        value: 500,
    },
    ControlSetting {
        name: "gain",
        id: 0x0098_0913,
        value: 50,
    },
    ControlSetting {
        name: "ir_cut_filter",
        id: 0x009a_0903,
        value: 1,
    },
];

/// Apply each control independently. Rejections are logged and dropped;
/// returns how many controls were accepted.
pub fn apply_controls(device: &mut dyn CaptureDevice, controls: &[ControlSetting]) -> usize {
    let mut applied = 0;
    for control in controls {
        match device.set_control(control.id, control.value) {
            Ok(()) => {
                tracing::debug!(control = control.name, value = control.value, "control set");
                applied += 1;
            }
            Err(e) => {
                tracing::warn!(control = control.name, error = %e, "control rejected, skipped");
            }
        }
    }
    applied
}

/// Tune (if requested) and start an opened device.
///
/// On a start failure the device is closed before the error is returned.
pub fn prepare_device(
    mut device: Box<dyn CaptureDevice>,
    config: &CaptureConfig,
) -> Result<Box<dyn CaptureDevice>, DeviceError> {
    if config.ir_mode {
        tracing::info!("enabling IR mode");
        let applied = apply_controls(device.as_mut(), &IR_MODE_CONTROLS);
        tracing::info!(applied, total = IR_MODE_CONTROLS.len(), "IR mode controls applied");
    }

    if let Err(e) = device.start() {
        if let Err(close_err) = device.close() {
            tracing::warn!(error = %close_err, "closing device after failed start");
        }
        return Err(e);
    }

    tracing::info!(
        width = config.width,
        height = config.height,
        fps = config.fps,
        format = %config.pixel_format,
        "camera initialized"
    );
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct PickyDevice {
        accepted: Vec<u32>,
        fail_start: bool,
        started: bool,
        closes: Arc<AtomicUsize>,
    }

    impl CaptureDevice for PickyDevice {
        fn start(&mut self) -> Result<(), DeviceError> {
            if self.fail_start {
                return Err(DeviceError::Start(std::io::Error::other("busy")));
            }
            self.started = true;
            Ok(())
        }

        fn next_frame(&mut self) -> Result<Frame, DeviceError> {
            Err(DeviceError::Closed)
        }

        fn set_control(&mut self, id: u32, _value: i32) -> Result<(), DeviceError> {
            if self.accepted.contains(&id) {
                Ok(())
            } else {
                Err(DeviceError::Control {
                    id,
                    source: std::io::Error::other("EINVAL"),
                })
            }
        }

        fn close(self: Box<Self>) -> Result<(), DeviceError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn picky(accepted: Vec<u32>, fail_start: bool) -> (PickyDevice, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        (
            PickyDevice {
                accepted,
                fail_start,
                started: false,
                closes: closes.clone(),
            },
            closes,
        )
    }

    #[test]
    fn pixel_format_names() {
        assert_eq!(PixelFormat::from_name("H264"), PixelFormat::H264);
        assert_eq!(PixelFormat::from_name("mjpeg"), PixelFormat::Mjpeg);
        assert_eq!(PixelFormat::from_name("YUYV"), PixelFormat::Yuyv);
        assert_eq!(PixelFormat::from_name("NV12"), PixelFormat::H264);
        assert_eq!(&PixelFormat::Mjpeg.fourcc(), b"MJPG");
    }

    #[test]
    fn derived_timing() {
        let config = CaptureConfig::default().fps(30);
        assert_eq!(config.frame_interval(), Duration::from_nanos(33_333_333));
        assert_eq!(CaptureConfig::default().fps(25).frame_interval(), Duration::from_millis(40));
    }

    #[test]
    fn buffer_covers_uncompressed_frame() {
        let config = CaptureConfig::default().resolution(1280, 720);
        assert_eq!(config.buffer_bytes(), 1280 * 720 * 2);
    }

    #[test]
    fn validate_rejects_zero_fps() {
        assert!(CaptureConfig::default().fps(0).validate().is_err());
        assert!(CaptureConfig::default().resolution(0, 480).validate().is_err());
        assert!(CaptureConfig::default().validate().is_ok());
    }

    #[test]
    fn controls_are_best_effort() {
        let (mut device, _) = picky(vec![0x0098_0913], false);
        let applied = apply_controls(&mut device, &IR_MODE_CONTROLS);
        assert_eq!(applied, 1);
    }

    #[test]
    fn ir_mode_never_fails_startup() {
        let (device, closes) = picky(vec![], false);
        let config = CaptureConfig::default().ir_mode(true);
        let device = prepare_device(Box::new(device), &config).expect("start succeeds");
        device.close().unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_start_closes_device() {
        let (device, closes) = picky(vec![], true);
        let Err(err) = prepare_device(Box::new(device), &CaptureConfig::default()) else {
            panic!("start failure must be reported");
        };
        assert!(matches!(err, DeviceError::Start(_)));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
