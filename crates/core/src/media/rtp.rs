use bytes::{BufMut, Bytes, BytesMut};

use super::Fragment;

/// RTP fixed header length in bytes (RFC 3550 §5.1).
pub const RTP_HEADER_LEN: usize = 12;

/// Per-session RTP numbering state and fixed header writer (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Every session owns exactly one of these. The sequence number advances by
/// one per written packet and the timestamp only when the caller finishes a
/// frame, so all packets of one access unit share a timestamp. Neither
/// counter is ever reset; both wrap modulo their field width as RTP
/// requires.
#[derive(Debug, Clone)]
pub struct RtpHeader {
    /// RTP payload type (7-bit, RFC 3551).
    pub pt: u8,
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
    sequence: u16,
    timestamp: u32,
}

impl RtpHeader {
    pub fn new(pt: u8, ssrc: u32, sequence: u16, timestamp: u32) -> Self {
        tracing::debug!(
            pt,
            ssrc = format_args!("{:#010X}", ssrc),
            sequence,
            timestamp,
            "RTP header state created"
        );
        Self {
            pt,
            ssrc,
            sequence,
            timestamp,
        }
    }

    /// Random SSRC, initial sequence number and initial timestamp, as
    /// recommended by RFC 3550 §5.1 and §8.1.
    pub fn with_random_start(pt: u8) -> Self {
        Self::new(pt, rand::random(), rand::random(), rand::random())
    }

    /// Sequence number the next packet will carry.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Timestamp the next frame's packets will carry.
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Serialize a 12-byte RTP fixed header and advance the sequence number.
    ///
    /// The `marker` bit signals the last packet of an access unit
    /// (RFC 6184 §5.1).
    pub fn write(&mut self, marker: bool) -> [u8; RTP_HEADER_LEN] {
        let first_byte: u8 = 2 << 6;
        let second_byte: u8 = ((marker as u8) << 7) | (self.pt & 0x7f);

        let mut header = [0u8; RTP_HEADER_LEN];
        header[0] = first_byte;
        header[1] = second_byte;
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        self.sequence = self.sequence.wrapping_add(1);
        header
    }

    /// Build one complete RTP packet (header + payload) for a fragment.
    pub fn packet(&mut self, fragment: &Fragment) -> Bytes {
        let header = self.write(fragment.marker);
        let mut packet = BytesMut::with_capacity(RTP_HEADER_LEN + fragment.payload.len());
        packet.put_slice(&header);
        packet.put_slice(&fragment.payload);
        packet.freeze()
    }

    /// Advance the RTP timestamp after a frame.
    ///
    /// For video at a 90 kHz clock the increment is `90000 / fps`.
    pub fn advance_timestamp(&mut self, increment: u32) {
        self.timestamp = self.timestamp.wrapping_add(increment);
    }
}

/// Fields of a received RTP fixed header, used by tests and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpFields {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpFields {
    /// Read the fixed header of a version-2 RTP packet.
    pub fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() < RTP_HEADER_LEN || packet[0] >> 6 != 2 {
            return None;
        }
        Some(Self {
            marker: packet[1] & 0x80 != 0,
            payload_type: packet[1] & 0x7f,
            sequence: u16::from_be_bytes([packet[2], packet[3]]),
            timestamp: u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]),
            ssrc: u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_header() -> RtpHeader {
        RtpHeader::new(96, 0xAABBCCDD, 0, 0)
    }

    #[test]
    fn version_is_2() {
        let mut h = make_header();
        let buf = h.write(false);
        assert_eq!(buf[0] >> 6, 2);
    }

    #[test]
    fn marker_bit() {
        let mut h = make_header();
        let no_marker = h.write(false);
        assert_eq!(no_marker[1] & 0x80, 0);

        let with_marker = h.write(true);
        assert_eq!(with_marker[1] & 0x80, 0x80);
    }

    #[test]
    fn payload_type() {
        let mut h = make_header();
        let buf = h.write(false);
        assert_eq!(buf[1] & 0x7f, 96);
    }

    #[test]
    fn sequence_increments() {
        let mut h = make_header();
        let b1 = h.write(false);
        let seq1 = u16::from_be_bytes([b1[2], b1[3]]);
        let b2 = h.write(false);
        let seq2 = u16::from_be_bytes([b2[2], b2[3]]);
        assert_eq!(seq2, seq1 + 1);
    }

    #[test]
    fn sequence_wraps() {
        let mut h = RtpHeader::new(96, 1, u16::MAX, 0);
        let buf = h.write(false);
        let seq = u16::from_be_bytes([buf[2], buf[3]]);
        assert_eq!(seq, u16::MAX);
        assert_eq!(h.sequence(), 0);
    }

    #[test]
    fn timestamp_advance_wraps() {
        let mut h = RtpHeader::new(96, 1, 0, u32::MAX - 1000);
        h.advance_timestamp(3000);
        assert_eq!(h.timestamp(), 1999);
    }

    #[test]
    fn packet_roundtrips_fields() {
        let mut h = RtpHeader::new(96, 0x01020304, 7, 9000);
        let fragment = Fragment {
            payload: Bytes::from_static(&[0x65, 0xAA]),
            marker: true,
        };
        let packet = h.packet(&fragment);
        assert_eq!(packet.len(), RTP_HEADER_LEN + 2);

        let fields = RtpFields::parse(&packet).unwrap();
        assert!(fields.marker);
        assert_eq!(fields.payload_type, 96);
        assert_eq!(fields.sequence, 7);
        assert_eq!(fields.timestamp, 9000);
        assert_eq!(fields.ssrc, 0x01020304);
        assert_eq!(&packet[RTP_HEADER_LEN..], &[0x65, 0xAA]);
    }

    #[test]
    fn random_start_differs() {
        let h1 = RtpHeader::with_random_start(96);
        let h2 = RtpHeader::with_random_start(96);
        assert_ne!(
            (h1.ssrc, h1.sequence(), h1.timestamp()),
            (h2.ssrc, h2.sequence(), h2.timestamp())
        );
    }
}
