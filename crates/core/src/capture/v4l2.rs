use std::io;
use std::time::Instant;

use bytes::Bytes;
use v4l::buffer::Type;
use v4l::control::{Control, Value};
use v4l::io::mmap::Stream;
use v4l::io::traits::{CaptureStream, Stream as _};
use v4l::video::Capture;
use v4l::video::capture::Parameters;
use v4l::{Device, FourCC};

use super::{CaptureConfig, CaptureDevice, Frame};
use crate::error::DeviceError;

const BUFFER_COUNT: u32 = 4;

/// Video4Linux2 capture device using memory-mapped streaming I/O.
pub struct V4l2Device {
    device: Device,
    stream: Option<Stream<'static>>,
    path: String,
}

impl V4l2Device {
    /// Open and configure the device. The driver may adjust the requested
    /// format; the negotiated one is logged.
    pub fn open(config: &CaptureConfig) -> Result<Self, DeviceError> {
        config.validate()?;
        let path = config.device_path.display().to_string();
        let open_err = |source: io::Error| DeviceError::Open {
            path: path.clone(),
            source,
        };

        let device = Device::with_path(&config.device_path).map_err(open_err)?;

        let mut format = device.format().map_err(open_err)?;
        format.width = config.width;
        format.height = config.height;
        format.fourcc = FourCC::new(&config.pixel_format.fourcc());
        format.size = u32::try_from(config.buffer_bytes()).unwrap_or(u32::MAX);
        let format = device.set_format(&format).map_err(open_err)?;

        device
            .set_params(&Parameters::with_fps(config.fps))
            .map_err(open_err)?;

        if format.fourcc != FourCC::new(&config.pixel_format.fourcc()) {
            tracing::warn!(
                requested = %config.pixel_format,
                negotiated = %format.fourcc,
                "device did not accept the requested pixel format"
            );
        }
        tracing::info!(
            path = %path,
            width = format.width,
            height = format.height,
            fourcc = %format.fourcc,
            "capture device opened"
        );

        Ok(Self {
            device,
            stream: None,
            path,
        })
    }
}

impl CaptureDevice for V4l2Device {
    fn start(&mut self) -> Result<(), DeviceError> {
        let mut stream = Stream::with_buffers(&self.device, Type::VideoCapture, BUFFER_COUNT)
            .map_err(DeviceError::Start)?;
        stream.start().map_err(DeviceError::Start)?;
        self.stream = Some(stream);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame, DeviceError> {
        let stream = self.stream.as_mut().ok_or(DeviceError::Closed)?;
        let (buf, meta) = stream.next().map_err(DeviceError::Read)?;
        let used = (meta.bytesused as usize).min(buf.len());
        // Copy out so the mmap buffer is requeued on the next call.
        Ok(Frame {
            data: Bytes::copy_from_slice(&buf[..used]),
            captured_at: Instant::now(),
            sequence: u64::from(meta.sequence),
        })
    }

    fn set_control(&mut self, id: u32, value: i32) -> Result<(), DeviceError> {
        self.device
            .set_control(Control {
                id,
                value: Value::Integer(i64::from(value)),
            })
            .map_err(|source| DeviceError::Control { id, source })
    }

    fn close(mut self: Box<Self>) -> Result<(), DeviceError> {
        if let Some(mut stream) = self.stream.take() {
            stream.stop().map_err(DeviceError::Read)?;
        }
        tracing::debug!(path = %self.path, "V4L2 stream stopped");
        Ok(())
    }
}
