//! Media codecs and RTP packetization.
//!
//! An encoded access unit becomes one or more [`Fragment`]s, each small
//! enough to fit an RTP packet under the configured payload bound. The
//! per-session [`rtp::RtpHeader`] then stamps every fragment with the
//! session's sequence number and timestamp.
//!
//! ## Supported codecs
//!
//! | Codec | Module | RFC |
//! |-------|--------|-----|
//! | H.264 | [`h264`] | [RFC 6184](https://tools.ietf.org/html/rfc6184) |

pub mod h264;
pub mod rtp;

use bytes::Bytes;

use h264::ParameterSets;

/// Default RTP payload bound: leaves headroom for IP/UDP/RTP headers (and
/// interleaved framing) under a 1500-byte MTU.
pub const DEFAULT_MAX_PAYLOAD: usize = 1400;

/// Dynamic RTP payload type conventionally used for H.264.
pub const H264_PAYLOAD_TYPE: u8 = 96;

/// 90 kHz media clock used for video (RFC 3551 §5).
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// One RTP payload's worth of an access unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub payload: Bytes,
    /// Set only on the final fragment of the access unit.
    pub marker: bool,
}

/// Split `payload` into ordered chunks of at most `max_payload_size` bytes.
///
/// Yields `ceil(len / max)` fragments with only the last one marked. Chunks
/// share the input buffer. A bound of zero is treated as one byte; an empty
/// payload yields no fragments.
pub fn fragment(payload: &Bytes, max_payload_size: usize) -> Vec<Fragment> {
    let chunk = max_payload_size.max(1);
    let count = payload.len().div_ceil(chunk);

    (0..count)
        .map(|i| {
            let start = i * chunk;
            let end = (start + chunk).min(payload.len());
            Fragment {
                payload: payload.slice(start..end),
                marker: i + 1 == count,
            }
        })
        .collect()
}

/// Codec-specific conversion of access units into RTP payloads.
///
/// Packetizers are stateless: numbering lives in each session's
/// [`rtp::RtpHeader`], so one packetizer can serve every session.
pub trait Packetizer: Send + Sync {
    /// Fragment one access unit. The last fragment carries the marker.
    fn packetize(&self, access_unit: &Bytes, max_payload_size: usize) -> Vec<Fragment>;

    /// Codec name for the SDP `a=rtpmap` attribute (e.g. `"H264"`).
    fn codec_name(&self) -> &'static str;

    /// RTP clock rate in Hz.
    fn clock_rate(&self) -> u32;
}

/// Static description of the single video track offered by the node.
///
/// Built once, on the first DESCRIBE, and then shared read-only by every
/// connection (see [`crate::mount::Mount::description`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    pub payload_type: u8,
    pub codec_name: &'static str,
    pub clock_rate: u32,
    pub framerate: u32,
    pub parameter_sets: ParameterSets,
    /// Track control URL, relative to the DESCRIBE `Content-Base`.
    pub control: &'static str,
}

impl MediaDescription {
    /// Describe the track carried by `packetizer`.
    pub fn new(
        packetizer: &dyn Packetizer,
        payload_type: u8,
        framerate: u32,
        parameter_sets: ParameterSets,
    ) -> Self {
        Self {
            payload_type,
            codec_name: packetizer.codec_name(),
            clock_rate: packetizer.clock_rate(),
            framerate,
            parameter_sets,
            control: "track1",
        }
    }

    /// SDP media-level attributes (RFC 6184 §8.2.1).
    ///
    /// `a=rtpmap` defines the payload type and must precede the `a=fmtp`
    /// that references it; clients parse attributes in order.
    pub fn sdp_attributes(&self) -> Vec<String> {
        let mut fmtp = format!("a=fmtp:{} packetization-mode=1", self.payload_type);
        if let Some(pl) = self.parameter_sets.profile_level_id() {
            fmtp.push_str(&format!(";profile-level-id={}", pl));
        }
        if let Some(sprop) = self.parameter_sets.sprop_parameter_sets() {
            fmtp.push_str(&format!(";sprop-parameter-sets={}", sprop));
        }

        vec![
            format!(
                "a=rtpmap:{} {}/{}",
                self.payload_type, self.codec_name, self.clock_rate
            ),
            fmtp,
            format!("a=framerate:{}", self.framerate),
            format!("a=control:{}", self.control),
        ]
    }
}
