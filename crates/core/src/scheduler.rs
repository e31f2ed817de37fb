//! Per-session streaming loop.
//!
//! Each playing session runs one [`StreamScheduler`] task. On every tick of
//! a fixed-rate ticker it pulls the latest frame from its
//! [`FrameSource`](crate::capture::FrameSource), packetizes it, stamps each
//! fragment from the session's [`RtpHeader`] and writes the packets to the
//! session's [`MediaSink`].
//!
//! The ticker fires on fixed boundaries (`MissedTickBehavior::Skip`), so
//! processing jitter never accumulates into drift and an overrun skips
//! ticks instead of queuing them.
//!
//! The task owns the session's [`StreamContext`] while it runs and hands it
//! back in [`StreamExit`] when it stops. PAUSE followed by PLAY therefore
//! continues the same sequence and timestamp numbering.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

use crate::capture::{Frame, FrameSource};
use crate::error::{DeviceError, Result};
use crate::media::rtp::RtpHeader;
use crate::media::{Packetizer, VIDEO_CLOCK_RATE};
use crate::transport::MediaSink;

/// Timing and limits shared by every stream of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    pub frame_interval: Duration,
    /// RTP timestamp advance per frame: `90000 / fps`.
    pub timestamp_increment: u32,
    pub max_payload_size: usize,
    /// Consecutive ticks without a frame before the stream gives up.
    pub max_missed_frames: u32,
}

impl StreamSettings {
    pub fn from_fps(fps: u32, max_payload_size: usize, max_missed_frames: u32) -> Self {
        let fps = fps.max(1);
        Self {
            frame_interval: Duration::from_secs(1) / fps,
            timestamp_increment: VIDEO_CLOCK_RATE / fps,
            max_payload_size,
            max_missed_frames: max_missed_frames.max(1),
        }
    }
}

/// Everything a running stream needs, owned by the stream task.
pub struct StreamContext {
    pub rtp: RtpHeader,
    pub sink: MediaSink,
    pub source: FrameSource,
    pub packetizer: Arc<dyn Packetizer>,
}

/// Why a stream task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// PAUSE, TEARDOWN, disconnect cleanup or server shutdown.
    Stopped,
    /// The client can no longer be written to.
    Disconnected(String),
    /// No frame arrived for `misses` consecutive ticks.
    DeviceStalled { misses: u32 },
    /// The capture thread has shut down.
    DeviceClosed,
}

pub struct StreamExit {
    pub context: StreamContext,
    pub reason: StopReason,
}

/// Handle to a running stream task.
pub struct StreamHandle {
    cancel: CancellationToken,
    join: JoinHandle<StreamExit>,
}

impl StreamHandle {
    /// Stop the loop and take back the context. A frame already being
    /// written is finished first.
    ///
    /// Returns `None` only if the task panicked.
    pub async fn stop(self) -> Option<StreamExit> {
        self.cancel.cancel();
        match self.join.await {
            Ok(exit) => Some(exit),
            Err(e) => {
                tracing::error!(error = %e, "stream task failed");
                None
            }
        }
    }

    /// Resolve when the task ends on its own. Cancel-safe.
    pub async fn finished(&mut self) -> Option<StreamExit> {
        (&mut self.join).await.ok()
    }
}

pub struct StreamScheduler;

impl StreamScheduler {
    /// Start streaming `context` for a session. The task stops when
    /// `parent` (or the returned handle) is cancelled.
    pub fn spawn(
        session_id: String,
        context: StreamContext,
        settings: StreamSettings,
        parent: &CancellationToken,
    ) -> StreamHandle {
        let cancel = parent.child_token();
        let join = tokio::spawn(run(session_id, context, settings, cancel.clone()));
        StreamHandle { cancel, join }
    }
}

async fn run(
    session_id: String,
    mut ctx: StreamContext,
    settings: StreamSettings,
    cancel: CancellationToken,
) -> StreamExit {
    let mut ticker = interval_at(
        Instant::now() + settings.frame_interval,
        settings.frame_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::debug!(
        session_id,
        transport = ctx.sink.kind(),
        seq = ctx.rtp.sequence(),
        rtptime = ctx.rtp.timestamp(),
        "stream started"
    );

    let mut misses = 0u32;
    let mut frames = 0u64;
    let reason = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break StopReason::Stopped,
            _ = ticker.tick() => {}
        }

        // Stopping is only observed between frames: once a frame is pulled,
        // all of its packets go out and the timestamp advances.
        let pulled = tokio::select! {
            biased;
            _ = cancel.cancelled() => break StopReason::Stopped,
            pulled = pull(&session_id, &mut ctx, &settings, &mut misses) => pulled,
        };
        let frame = match pulled {
            Pull::Frame(frame) => frame,
            Pull::Skipped => continue,
            Pull::Stop(reason) => break reason,
        };
        match emit(&mut ctx, &frame, &settings).await {
            Ok(0) => {}
            Ok(_) => frames += 1,
            Err(e) => break StopReason::Disconnected(e.to_string()),
        }
    };

    match &reason {
        StopReason::Stopped => {
            tracing::debug!(session_id, frames, "stream stopped");
        }
        StopReason::Disconnected(cause) => {
            tracing::info!(session_id, frames, cause = %cause, "client unreachable, stream ended");
        }
        StopReason::DeviceStalled { misses } => {
            tracing::error!(session_id, frames, misses, "no frames from capture device, stream ended");
        }
        StopReason::DeviceClosed => {
            tracing::warn!(session_id, frames, "capture device closed, stream ended");
        }
    }

    StreamExit {
        context: ctx,
        reason,
    }
}

enum Pull {
    Frame(Arc<Frame>),
    Skipped,
    Stop(StopReason),
}

/// Wait for this tick's frame. Safe to abandon at any await point.
async fn pull(
    session_id: &str,
    ctx: &mut StreamContext,
    settings: &StreamSettings,
    misses: &mut u32,
) -> Pull {
    if !ctx.sink.is_writable() {
        return Pull::Stop(StopReason::Disconnected("control connection closed".into()));
    }

    match ctx.source.next_frame(settings.frame_interval).await {
        Ok(frame) => {
            *misses = 0;
            Pull::Frame(frame)
        }
        Err(DeviceError::Closed) => Pull::Stop(StopReason::DeviceClosed),
        Err(e) => {
            *misses += 1;
            tracing::debug!(session_id, misses = *misses, error = %e, "no frame this tick, skipping");
            if *misses >= settings.max_missed_frames {
                return Pull::Stop(StopReason::DeviceStalled { misses: *misses });
            }
            Pull::Skipped
        }
    }
}

/// Packetize one frame and write it out. Returns the number of packets.
///
/// Every packet of the frame carries the same timestamp; the timestamp
/// advances once afterwards. An empty frame sends nothing and leaves the
/// timestamp alone.
async fn emit(ctx: &mut StreamContext, frame: &Frame, settings: &StreamSettings) -> Result<usize> {
    let fragments = ctx
        .packetizer
        .packetize(&frame.data, settings.max_payload_size);
    if fragments.is_empty() {
        return Ok(0);
    }

    for fragment in &fragments {
        let packet = ctx.rtp.packet(fragment);
        ctx.sink.send_rtp(packet).await?;
    }
    ctx.rtp.advance_timestamp(settings.timestamp_increment);

    tracing::trace!(
        frame = frame.sequence,
        packets = fragments.len(),
        next_seq = ctx.rtp.sequence(),
        "frame sent"
    );
    Ok(fragments.len())
}
