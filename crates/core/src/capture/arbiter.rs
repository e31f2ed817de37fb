//! Single-owner capture thread and frame fan-out.
//!
//! The capture device is not assumed to tolerate concurrent reads, so one
//! dedicated thread owns it and is the only caller of `next_frame()`. Each
//! frame is published once into a `watch` channel as an `Arc<Frame>`; every
//! playing session holds a [`FrameSource`] that observes the latest frame.
//! Sessions never block each other and a slow session simply skips frames.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::{CaptureDevice, Frame};
use crate::error::DeviceError;
use crate::media::h264::ParameterSets;

/// Consecutive read failures after which the capture thread reports the
/// device as failing (it keeps retrying afterwards).
const PERSISTENT_FAILURE_THRESHOLD: u32 = 30;

/// How long `shutdown` waits for a blocked `next_frame()` to return.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

type Slot = Option<Arc<Frame>>;

/// Write side of the fan-out, held by the capture thread.
pub struct FramePublisher {
    tx: watch::Sender<Slot>,
    params: Arc<RwLock<ParameterSets>>,
}

impl FramePublisher {
    pub fn publish(&self, frame: Frame) {
        if !self.params.read().is_complete() {
            self.params.write().observe(&frame.data);
        }
        self.tx.send_replace(Some(Arc::new(frame)));
    }
}

/// Read side of the fan-out. Cheap to clone; one per mount.
#[derive(Clone)]
pub struct FrameFeed {
    rx: watch::Receiver<Slot>,
    params: Arc<RwLock<ParameterSets>>,
}

impl FrameFeed {
    /// An unconnected publisher/feed pair.
    pub fn channel() -> (FramePublisher, FrameFeed) {
        let (tx, rx) = watch::channel(None);
        let params = Arc::new(RwLock::new(ParameterSets::default()));
        (
            FramePublisher {
                tx,
                params: params.clone(),
            },
            FrameFeed { rx, params },
        )
    }

    /// A new per-session source. Only frames published after this call are
    /// delivered to it.
    pub fn source(&self) -> FrameSource {
        let mut rx = self.rx.clone();
        rx.borrow_and_update();
        FrameSource { rx }
    }

    /// Parameter sets seen in the bitstream so far.
    pub fn parameter_sets(&self) -> ParameterSets {
        self.params.read().clone()
    }
}

/// Per-session pull handle over the shared feed.
///
/// Holds at most a reference to the latest frame; there is no queue.
pub struct FrameSource {
    rx: watch::Receiver<Slot>,
}

impl FrameSource {
    /// Wait up to `wait` for a frame this source has not returned yet.
    ///
    /// Returns [`DeviceError::Timeout`] when nothing new arrives in time and
    /// [`DeviceError::Closed`] once the capture thread has exited.
    pub async fn next_frame(&mut self, wait: Duration) -> Result<Arc<Frame>, DeviceError> {
        match tokio::time::timeout(wait, self.rx.changed()).await {
            Err(_) => Err(DeviceError::Timeout(wait)),
            Ok(Err(_)) => Err(DeviceError::Closed),
            Ok(Ok(())) => self
                .rx
                .borrow_and_update()
                .clone()
                .ok_or(DeviceError::Timeout(wait)),
        }
    }
}

/// Owns the capture device on a dedicated OS thread.
pub struct FrameArbiter {
    feed: FrameFeed,
    cancel: CancellationToken,
    done: oneshot::Receiver<()>,
}

impl FrameArbiter {
    /// Move a started device onto the capture thread.
    ///
    /// `retry_interval` is the pause after a failed read.
    pub fn spawn(
        device: Box<dyn CaptureDevice>,
        retry_interval: Duration,
    ) -> crate::error::Result<Self> {
        let (publisher, feed) = FrameFeed::channel();
        let cancel = CancellationToken::new();
        let (done_tx, done) = oneshot::channel();

        let device = OwnedDevice(Some(device));
        let thread_cancel = cancel.clone();
        thread::Builder::new()
            .name("stagecam-capture".into())
            .spawn(move || {
                capture_loop(device, &publisher, &thread_cancel, retry_interval);
                drop(publisher);
                let _ = done_tx.send(());
            })?;

        Ok(Self { feed, cancel, done })
    }

    pub fn feed(&self) -> FrameFeed {
        self.feed.clone()
    }

    /// Stop capturing and wait for the device to be closed.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        match tokio::time::timeout(SHUTDOWN_GRACE, self.done).await {
            Ok(_) => tracing::debug!("capture thread finished"),
            Err(_) => tracing::warn!(
                grace = ?SHUTDOWN_GRACE,
                "capture thread still blocked in a frame read, device closes when it returns"
            ),
        }
    }
}

/// Closes the device on drop, so a capture thread that never started
/// still releases it.
struct OwnedDevice(Option<Box<dyn CaptureDevice>>);

impl OwnedDevice {
    fn next_frame(&mut self) -> Result<Frame, DeviceError> {
        self.0.as_mut().ok_or(DeviceError::Closed)?.next_frame()
    }

    fn close(&mut self) {
        let Some(device) = self.0.take() else {
            return;
        };
        match device.close() {
            Ok(()) => tracing::info!("capture device closed"),
            Err(e) => tracing::warn!(error = %e, "capture device close failed"),
        }
    }
}

impl Drop for OwnedDevice {
    fn drop(&mut self) {
        self.close();
    }
}

fn capture_loop(
    mut device: OwnedDevice,
    publisher: &FramePublisher,
    cancel: &CancellationToken,
    retry_interval: Duration,
) {
    tracing::debug!("capture thread started");
    let mut failures: u32 = 0;

    while !cancel.is_cancelled() {
        match device.next_frame() {
            Ok(frame) => {
                if failures >= PERSISTENT_FAILURE_THRESHOLD {
                    tracing::info!(failures, "capture device recovered");
                }
                failures = 0;
                publisher.publish(frame);
            }
            Err(DeviceError::Closed) => {
                tracing::warn!("capture device closed underneath the capture thread");
                break;
            }
            Err(e) if !e.is_transient() => {
                tracing::error!(error = %e, "capture device failed, stopping capture");
                break;
            }
            Err(e) => {
                failures += 1;
                if failures == PERSISTENT_FAILURE_THRESHOLD {
                    tracing::error!(failures, error = %e, "capture device failing persistently");
                } else if failures < PERSISTENT_FAILURE_THRESHOLD {
                    tracing::warn!(failures, error = %e, "frame read failed, skipping");
                }
                thread::sleep(retry_interval);
            }
        }
    }

    device.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    struct CountingDevice {
        sequence: u64,
        fail_every: Option<u64>,
        fatal_at: Option<u64>,
        closes: Arc<AtomicUsize>,
    }

    impl CaptureDevice for CountingDevice {
        fn start(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }

        fn next_frame(&mut self) -> Result<Frame, DeviceError> {
            thread::sleep(Duration::from_millis(5));
            self.sequence += 1;
            if self.fatal_at == Some(self.sequence) {
                return Err(DeviceError::Start(std::io::Error::other("stream off")));
            }
            if let Some(n) = self.fail_every {
                if self.sequence % n == 0 {
                    return Err(DeviceError::Read(std::io::Error::other("EIO")));
                }
            }
            Ok(Frame {
                data: Bytes::from(vec![0, 0, 0, 1, 0x41, self.sequence as u8]),
                captured_at: Instant::now(),
                sequence: self.sequence,
            })
        }

        fn set_control(&mut self, _id: u32, _value: i32) -> Result<(), DeviceError> {
            Ok(())
        }

        fn close(self: Box<Self>) -> Result<(), DeviceError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn device(fail_every: Option<u64>) -> (Box<CountingDevice>, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        (
            Box::new(CountingDevice {
                sequence: 0,
                fail_every,
                fatal_at: None,
                closes: closes.clone(),
            }),
            closes,
        )
    }

    #[tokio::test]
    async fn sources_share_each_frame() {
        let (dev, _) = device(None);
        let arbiter = FrameArbiter::spawn(dev, Duration::from_millis(1)).unwrap();
        let feed = arbiter.feed();
        let mut a = feed.source();
        let mut b = feed.source();

        let wait = Duration::from_secs(1);
        let fa = a.next_frame(wait).await.unwrap();
        let fb = b.next_frame(wait).await.unwrap();
        assert!(fb.sequence >= fa.sequence);

        let next = a.next_frame(wait).await.unwrap();
        assert!(next.sequence > fa.sequence);

        arbiter.shutdown().await;
    }

    #[tokio::test]
    async fn read_failures_do_not_stop_capture() {
        let (dev, _) = device(Some(2));
        let arbiter = FrameArbiter::spawn(dev, Duration::from_millis(1)).unwrap();
        let mut source = arbiter.feed().source();

        let mut last = 0;
        for _ in 0..3 {
            let frame = source.next_frame(Duration::from_secs(1)).await.unwrap();
            assert_eq!(frame.sequence % 2, 1);
            assert!(frame.sequence > last);
            last = frame.sequence;
        }

        arbiter.shutdown().await;
    }

    #[tokio::test]
    async fn fatal_read_error_stops_capture() {
        let (mut dev, closes) = device(None);
        dev.fatal_at = Some(3);
        let arbiter = FrameArbiter::spawn(dev, Duration::from_millis(1)).unwrap();
        let mut source = arbiter.feed().source();

        let mut result = source.next_frame(Duration::from_secs(1)).await;
        while result.is_ok() {
            result = source.next_frame(Duration::from_secs(1)).await;
        }
        assert!(matches!(result, Err(DeviceError::Closed)));
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        arbiter.shutdown().await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_closes_device_once_and_ends_sources() {
        let (dev, closes) = device(None);
        let arbiter = FrameArbiter::spawn(dev, Duration::from_millis(1)).unwrap();
        let mut source = arbiter.feed().source();

        arbiter.shutdown().await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        // Drain whatever was published before the thread exited.
        let mut result = source.next_frame(Duration::from_millis(200)).await;
        while result.is_ok() {
            result = source.next_frame(Duration::from_millis(200)).await;
        }
        assert!(matches!(result, Err(DeviceError::Closed)));
    }

    #[test]
    fn device_guard_closes_exactly_once() {
        let (dev, closes) = device(None);
        drop(OwnedDevice(Some(dev)));
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        let (dev, closes) = device(None);
        let mut guard = OwnedDevice(Some(dev));
        guard.close();
        assert!(matches!(guard.next_frame(), Err(DeviceError::Closed)));
        drop(guard);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn idle_source_times_out() {
        let (_publisher, feed) = FrameFeed::channel();
        let mut source = feed.source();
        let err = source
            .next_frame(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::Timeout(_)));
    }

    #[test]
    fn publisher_captures_parameter_sets() {
        let (publisher, feed) = FrameFeed::channel();
        publisher.publish(Frame {
            data: Bytes::from_static(&[
                0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1e, 0, 0, 0, 1, 0x68, 0xce, 0x38, 0x80,
            ]),
            captured_at: Instant::now(),
            sequence: 1,
        });
        let params = feed.parameter_sets();
        assert!(params.is_complete());
        assert_eq!(params.profile_level_id().as_deref(), Some("42001e"));
    }
}
