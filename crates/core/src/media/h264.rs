use base64::prelude::{BASE64_STANDARD, Engine as _};
use bytes::{BufMut, Bytes, BytesMut};

use super::{Fragment, Packetizer, VIDEO_CLOCK_RATE, fragment};

const NAL_TYPE_SPS: u8 = 7;
const NAL_TYPE_PPS: u8 = 8;
const NAL_TYPE_FU_A: u8 = 28;

/// FU indicator + FU header.
const FU_A_OVERHEAD: usize = 2;

/// H.264 RTP packetizer (RFC 6184, packetization-mode 1).
///
/// Converts H.264 Annex B access units into RTP payloads:
///
/// - **Single NAL Unit** (§5.6): NALs that fit within the payload bound are
///   sent as-is.
///
/// - **FU-A Fragmentation** (§5.8): larger NALs are split across several
///   payloads, each prefixed with a 2-byte FU header:
///
///   ```text
///   FU indicator:  [F|NRI|Type=28]     (1 byte)
///   FU header:     [S|E|R|NAL_Type]    (1 byte)
///   Fragment data: [...]               (up to bound - 2 bytes)
///   ```
///
/// The marker is set on the last payload of the access unit (§5.1).
/// Access units without any start code are treated as a single bare NAL.
#[derive(Debug, Default, Clone, Copy)]
pub struct H264Packetizer;

impl H264Packetizer {
    pub fn new() -> Self {
        Self
    }

    /// Extract NAL units from an H.264 Annex B bitstream.
    ///
    /// Scans for start codes (both 4-byte `00 00 00 01` and 3-byte
    /// `00 00 01`) and returns the NAL data between them, excluding
    /// the start codes themselves. Returned slices share `data`.
    ///
    /// The start code length is tracked per-NAL so boundaries stay correct
    /// when 3-byte and 4-byte start codes are mixed.
    pub fn extract_nal_units(data: &Bytes) -> Vec<Bytes> {
        let mut nal_units = Vec::new();
        let mut i = 0usize;

        // (nal_data_start_index, start_code_length)
        let mut start_entries: Vec<(usize, usize)> = Vec::new();

        while i < data.len() {
            if i + 3 < data.len() && data[i..i + 4] == [0, 0, 0, 1] {
                start_entries.push((i + 4, 4));
                i += 4;
            } else if i + 2 < data.len() && data[i..i + 3] == [0, 0, 1] {
                start_entries.push((i + 3, 3));
                i += 3;
            } else {
                i += 1;
            }
        }

        for (idx, &(start, _)) in start_entries.iter().enumerate() {
            let end = if idx + 1 < start_entries.len() {
                let (next_start, next_sc_len) = start_entries[idx + 1];
                next_start - next_sc_len
            } else {
                data.len()
            };

            if start < end {
                nal_units.push(data.slice(start..end));
            }
        }

        nal_units
    }

    fn packetize_nal(&self, nal_unit: &Bytes, is_last_nal: bool, bound: usize) -> Vec<Fragment> {
        if nal_unit.is_empty() {
            return Vec::new();
        }

        if nal_unit.len() <= bound {
            return vec![Fragment {
                payload: nal_unit.clone(),
                marker: is_last_nal,
            }];
        }

        let nal_header = nal_unit[0];
        let nal_type = nal_header & 0x1f;
        let fu_indicator = (nal_header & 0xe0) | NAL_TYPE_FU_A;
        let body = nal_unit.slice(1..);

        let chunks = fragment(&body, bound.saturating_sub(FU_A_OVERHEAD));
        let count = chunks.len();
        let packets: Vec<Fragment> = chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let start_bit = if i == 0 { 0x80 } else { 0x00 };
                let end_bit = if chunk.marker { 0x40 } else { 0x00 };

                let mut payload = BytesMut::with_capacity(FU_A_OVERHEAD + chunk.payload.len());
                payload.put_u8(fu_indicator);
                payload.put_u8(start_bit | end_bit | nal_type);
                payload.put_slice(&chunk.payload);

                Fragment {
                    payload: payload.freeze(),
                    marker: is_last_nal && chunk.marker,
                }
            })
            .collect();

        tracing::trace!(
            nal_type,
            nal_size = nal_unit.len(),
            fragments = count,
            "FU-A fragmented NAL unit"
        );

        packets
    }
}

impl Packetizer for H264Packetizer {
    fn packetize(&self, access_unit: &Bytes, max_payload_size: usize) -> Vec<Fragment> {
        let mut nal_units = Self::extract_nal_units(access_unit);
        if nal_units.is_empty() && !access_unit.is_empty() {
            nal_units.push(access_unit.clone());
        }

        // FU-A needs room for its 2-byte header plus at least one data byte.
        let bound = max_payload_size.max(FU_A_OVERHEAD + 1);
        let last = nal_units.len().saturating_sub(1);

        let fragments: Vec<Fragment> = nal_units
            .iter()
            .enumerate()
            .flat_map(|(i, nal)| self.packetize_nal(nal, i == last, bound))
            .collect();

        tracing::trace!(
            nal_count = nal_units.len(),
            fragments = fragments.len(),
            frame_bytes = access_unit.len(),
            "access unit packetized"
        );

        fragments
    }

    fn codec_name(&self) -> &'static str {
        "H264"
    }

    fn clock_rate(&self) -> u32 {
        VIDEO_CLOCK_RATE
    }
}

/// SPS/PPS observed in the bitstream, for the SDP `fmtp` line
/// (RFC 6184 §8.1).
///
/// The first SPS and PPS seen are kept; later ones are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSets {
    pub sps: Option<Bytes>,
    pub pps: Option<Bytes>,
}

impl ParameterSets {
    /// Capture SPS/PPS from an access unit. Returns `true` if anything new
    /// was captured.
    pub fn observe(&mut self, access_unit: &Bytes) -> bool {
        if self.is_complete() {
            return false;
        }

        let mut captured = false;
        for nal in H264Packetizer::extract_nal_units(access_unit) {
            if nal.is_empty() {
                continue;
            }
            match nal[0] & 0x1f {
                NAL_TYPE_SPS if self.sps.is_none() => {
                    tracing::debug!(bytes = nal.len(), "H.264 SPS captured from bitstream");
                    self.sps = Some(nal);
                    captured = true;
                }
                NAL_TYPE_PPS if self.pps.is_none() => {
                    tracing::debug!(bytes = nal.len(), "H.264 PPS captured from bitstream");
                    self.pps = Some(nal);
                    captured = true;
                }
                _ => {}
            }
        }
        captured
    }

    pub fn is_complete(&self) -> bool {
        self.sps.is_some() && self.pps.is_some()
    }

    /// profile_idc, constraint flags and level_idc: SPS bytes 1–3.
    pub fn profile_level_id(&self) -> Option<String> {
        let sps = self.sps.as_deref()?;
        if sps.len() < 4 {
            return None;
        }
        Some(format!("{:02x}{:02x}{:02x}", sps[1], sps[2], sps[3]))
    }

    pub fn sprop_parameter_sets(&self) -> Option<String> {
        let sps = self.sps.as_deref()?;
        let pps = self.pps.as_deref()?;
        Some(format!(
            "{},{}",
            BASE64_STANDARD.encode(sps),
            BASE64_STANDARD.encode(pps)
        ))
    }
}
