use std::thread;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};

use super::{CaptureConfig, CaptureDevice, Frame};
use crate::error::DeviceError;

/// Baseline profile, level 3.0.
const SPS: &[u8] = &[0x67, 0x42, 0x00, 0x1e, 0x95, 0xa8, 0x28, 0x0f, 0x64];
const PPS: &[u8] = &[0x68, 0xce, 0x38, 0x80];
const START_CODE: &[u8] = &[0, 0, 0, 1];

/// Test-pattern device producing paced H.264 Annex B access units.
///
/// Every group of pictures opens with SPS, PPS and a large IDR slice (big
/// enough to need FU-A), followed by small non-IDR slices. The slice bodies
/// are filler: structurally valid NAL framing, not decodable pictures.
pub struct SyntheticDevice {
    interval: Duration,
    gop: u64,
    idr_bytes: usize,
    slice_bytes: usize,
    sequence: u64,
    next_due: Option<Instant>,
    started: bool,
}

impl SyntheticDevice {
    pub fn open(config: &CaptureConfig) -> Result<Self, DeviceError> {
        config.validate()?;
        let idr_bytes = (config.buffer_bytes() / 64).clamp(2_000, 60_000);
        tracing::info!(
            width = config.width,
            height = config.height,
            fps = config.fps,
            "synthetic capture device opened"
        );
        Ok(Self {
            interval: config.frame_interval(),
            gop: u64::from(config.fps),
            idr_bytes,
            slice_bytes: idr_bytes / 8,
            sequence: 0,
            next_due: None,
            started: false,
        })
    }

    fn access_unit(&self) -> Bytes {
        let keyframe = self.sequence % self.gop == 0;
        let mut au = BytesMut::with_capacity(self.idr_bytes + 32);
        if keyframe {
            au.put_slice(START_CODE);
            au.put_slice(SPS);
            au.put_slice(START_CODE);
            au.put_slice(PPS);
            au.put_slice(START_CODE);
            au.put_u8(0x65);
            fill(&mut au, self.idr_bytes, self.sequence);
        } else {
            au.put_slice(START_CODE);
            au.put_u8(0x41);
            fill(&mut au, self.slice_bytes, self.sequence);
        }
        au.freeze()
    }
}

// Non-zero filler so the body never emulates a start code.
fn fill(buf: &mut BytesMut, len: usize, seed: u64) {
    let seed = seed as usize;
    buf.extend((0..len).map(|i| ((i + seed) % 251) as u8 | 1));
}

impl CaptureDevice for SyntheticDevice {
    fn start(&mut self) -> Result<(), DeviceError> {
        self.started = true;
        self.next_due = Some(Instant::now());
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame, DeviceError> {
        if !self.started {
            return Err(DeviceError::Closed);
        }

        let due = self.next_due.unwrap_or_else(Instant::now);
        let now = Instant::now();
        if due > now {
            thread::sleep(due - now);
        }
        // Do not burst to catch up after a stall.
        self.next_due = Some(due.max(now) + self.interval);

        let frame = Frame {
            data: self.access_unit(),
            captured_at: Instant::now(),
            sequence: self.sequence,
        };
        self.sequence += 1;
        Ok(frame)
    }

    fn set_control(&mut self, id: u32, value: i32) -> Result<(), DeviceError> {
        tracing::trace!(id = format_args!("{:#010x}", id), value, "synthetic control ignored");
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), DeviceError> {
        tracing::info!(frames = self.sequence, "synthetic capture device closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::Packetizer;
    use crate::media::h264::{H264Packetizer, ParameterSets};

    fn device() -> SyntheticDevice {
        let config = CaptureConfig::default().fps(100);
        let mut dev = SyntheticDevice::open(&config).unwrap();
        dev.start().unwrap();
        dev
    }

    #[test]
    fn not_started_is_closed() {
        let mut dev = SyntheticDevice::open(&CaptureConfig::default()).unwrap();
        assert!(matches!(dev.next_frame(), Err(DeviceError::Closed)));
    }

    #[test]
    fn keyframe_carries_parameter_sets() {
        let mut dev = device();
        let frame = dev.next_frame().unwrap();
        let mut params = ParameterSets::default();
        params.observe(&frame.data);
        assert!(params.is_complete());
        assert_eq!(params.profile_level_id().as_deref(), Some("42001e"));

        let nals = H264Packetizer::extract_nal_units(&frame.data);
        assert_eq!(nals.len(), 3);
        assert_eq!(nals[2][0] & 0x1f, 5);
    }

    #[test]
    fn keyframe_needs_fragmentation() {
        let mut dev = device();
        let frame = dev.next_frame().unwrap();
        let frags = H264Packetizer.packetize(&frame.data, 1400);
        assert!(frags.len() > 3);
        assert!(frags.last().unwrap().marker);
    }

    #[test]
    fn frames_are_paced() {
        let mut dev = device();
        let begin = Instant::now();
        for expected in 0..4 {
            assert_eq!(dev.next_frame().unwrap().sequence, expected);
        }
        // Three intervals of 10ms between four frames.
        assert!(begin.elapsed() >= Duration::from_millis(28));
    }

    #[test]
    fn non_keyframes_are_single_slices() {
        let mut dev = device();
        dev.next_frame().unwrap();
        let frame = dev.next_frame().unwrap();
        let nals = H264Packetizer::extract_nal_units(&frame.data);
        assert_eq!(nals.len(), 1);
        assert_eq!(nals[0][0], 0x41);
    }
}
