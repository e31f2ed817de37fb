use std::sync::{Arc, OnceLock};

use crate::capture::{FrameFeed, FrameSource};
use crate::error::ProtocolError;
use crate::media::h264::H264Packetizer;
use crate::media::{MediaDescription, Packetizer};

pub const DEFAULT_STREAM_PATH: &str = "stream";

/// The single stream endpoint served by the node (e.g. `/stream`).
///
/// Owns the shared packetizer and the media description, and hands out
/// per-session frame sources over the capture feed. There is no fallback:
/// a URI naming any other path is answered with 404.
pub struct Mount {
    path: String,
    payload_type: u8,
    framerate: u32,
    feed: FrameFeed,
    packetizer: Arc<dyn Packetizer>,
    description: OnceLock<Arc<MediaDescription>>,
}

impl Mount {
    /// `stream_path` may be given with or without the leading slash.
    pub fn new(stream_path: &str, payload_type: u8, framerate: u32, feed: FrameFeed) -> Self {
        Self {
            path: normalize_path(stream_path),
            payload_type,
            framerate,
            feed,
            packetizer: Arc::new(H264Packetizer::new()),
            description: OnceLock::new(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    pub fn packetizer(&self) -> Arc<dyn Packetizer> {
        self.packetizer.clone()
    }

    /// Check that `uri` names this stream (or its track).
    pub fn resolve(&self, uri: &str) -> Result<(), ProtocolError> {
        let requested = extract_mount_path(uri);
        if requested == self.path {
            Ok(())
        } else {
            Err(ProtocolError::NotFound(requested.to_string()))
        }
    }

    /// The track description, created on first use.
    ///
    /// Until the bitstream has shown both SPS and PPS the description is
    /// rebuilt on every call; the first complete one is kept for good.
    pub fn description(&self) -> Arc<MediaDescription> {
        if let Some(desc) = self.description.get() {
            return desc.clone();
        }

        let params = self.feed.parameter_sets();
        let complete = params.is_complete();
        let desc = Arc::new(MediaDescription::new(
            self.packetizer.as_ref(),
            self.payload_type,
            self.framerate,
            params,
        ));
        if !complete {
            tracing::debug!(path = %self.path, "parameter sets not seen yet, description is provisional");
            return desc;
        }

        let desc = self.description.get_or_init(|| desc).clone();
        tracing::info!(path = %self.path, "media description created");
        desc
    }

    pub fn frame_source(&self) -> FrameSource {
        self.feed.source()
    }
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    format!("/{}", trimmed)
}

/// Extract the stream path from an RTSP URI.
///
/// `rtsp://host:8554/stream/track1` → `/stream`
/// `rtsp://host:8554/stream/`       → `/stream`
/// `rtsp://host:8554/stream?x=1`    → `/stream`
/// `rtsp://host:8554`               → `/`
/// `*`                              → `/`
pub fn extract_mount_path(uri: &str) -> &str {
    let path = if let Some(after) = uri
        .strip_prefix("rtsp://")
        .or_else(|| uri.strip_prefix("rtspu://"))
    {
        match after.find('/') {
            Some(slash) => &after[slash..],
            None => "/",
        }
    } else if uri.starts_with('/') {
        uri
    } else {
        "/"
    };

    let path = path.split(['?', '#']).next().unwrap_or(path);
    let path = path.trim_end_matches('/');

    // Strip track suffix: /stream/track1 → /stream
    let path = match path.rfind('/') {
        Some(pos) if path[pos + 1..].starts_with("track") => &path[..pos],
        _ => path,
    };

    if path.is_empty() { "/" } else { path }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Frame;
    use bytes::Bytes;
    use std::time::Instant;

    fn mount() -> (crate::capture::FramePublisher, Mount) {
        let (publisher, feed) = FrameFeed::channel();
        (publisher, Mount::new("stream", 96, 30, feed))
    }

    #[test]
    fn extract_path_full_uri() {
        assert_eq!(extract_mount_path("rtsp://localhost:8554/stream"), "/stream");
    }

    #[test]
    fn extract_path_with_track() {
        assert_eq!(
            extract_mount_path("rtsp://localhost:8554/stream/track1"),
            "/stream"
        );
    }

    #[test]
    fn extract_path_content_base() {
        assert_eq!(
            extract_mount_path("rtsp://localhost:8554/stream/"),
            "/stream"
        );
    }

    #[test]
    fn extract_path_query() {
        assert_eq!(
            extract_mount_path("rtsp://10.0.0.1:8554/stream?transport=tcp"),
            "/stream"
        );
    }

    #[test]
    fn extract_path_no_path() {
        assert_eq!(extract_mount_path("rtsp://localhost:8554"), "/");
        assert_eq!(extract_mount_path("*"), "/");
    }

    #[test]
    fn normalizes_configured_path() {
        let (_, m) = mount();
        assert_eq!(m.path(), "/stream");
        assert_eq!(normalize_path("/cam/"), "/cam");
    }

    #[test]
    fn resolve_rejects_other_paths() {
        let (_, m) = mount();
        assert!(m.resolve("rtsp://h:8554/stream/track1").is_ok());
        assert_eq!(
            m.resolve("rtsp://h:8554/other"),
            Err(ProtocolError::NotFound("/other".into()))
        );
        assert!(m.resolve("rtsp://h:8554").is_err());
    }

    #[test]
    fn description_frozen_once_parameter_sets_known() {
        let (publisher, m) = mount();
        let provisional = m.description();
        assert!(provisional.parameter_sets.sps.is_none());

        publisher.publish(Frame {
            data: Bytes::from_static(&[
                0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1e, 0, 0, 0, 1, 0x68, 0xce, 0x38, 0x80,
            ]),
            captured_at: Instant::now(),
            sequence: 0,
        });

        let first = m.description();
        let second = m.description();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.parameter_sets.is_complete());
    }
}
