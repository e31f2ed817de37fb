//! SDP (Session Description Protocol) generation (RFC 4566 / RFC 8866).
//!
//! Produces the SDP body returned by DESCRIBE responses. The format:
//!
//! ```text
//! v=0                                          ← protocol version
//! o=<user> <sess-id> <sess-ver> IN IP4 <addr>  ← origin
//! s=<session-name>                              ← session name
//! c=IN IP4 <addr>                               ← connection address
//! t=0 0                                         ← timing (live stream)
//! a=tool:stagecam                               ← server software (§6)
//! a=sendonly                                    ← direction (§6)
//! a=control:*                                   ← aggregate control
//! m=video 0 RTP/AVP 96                          ← media description
//! a=rtpmap:96 H264/90000                        ← codec/clock rate
//! a=fmtp:96 packetization-mode=1;...            ← codec parameters
//! a=framerate:30
//! a=control:track1                              ← track control URL
//! ```
//!
//! Origin and session name come from [`ServerConfig`](crate::ServerConfig).

use crate::media::MediaDescription;

/// Session-level SDP fields.
#[derive(Debug, Clone, Copy)]
pub struct SdpOrigin<'a> {
    pub ip: &'a str,
    pub username: &'a str,
    pub session_id: &'a str,
    pub session_version: &'a str,
    pub session_name: &'a str,
}

/// Generate an SDP session description for the stream's single track.
pub fn generate_sdp(media: &MediaDescription, origin: &SdpOrigin<'_>) -> String {
    let mut sdp: Vec<String> = Vec::new();

    sdp.push("v=0".to_string());
    sdp.push(format!(
        "o={} {} {} IN IP4 {}",
        origin.username, origin.session_id, origin.session_version, origin.ip
    ));
    sdp.push(format!("s={}", origin.session_name));
    sdp.push(format!("c=IN IP4 {}", origin.ip));
    sdp.push("t=0 0".to_string());
    sdp.push("a=tool:stagecam".to_string());
    sdp.push("a=sendonly".to_string());
    sdp.push("a=control:*".to_string());
    sdp.push(format!("m=video 0 RTP/AVP {}", media.payload_type));
    sdp.extend(media.sdp_attributes());

    tracing::trace!("SDP: {}", sdp.join("\r\n"));

    format!("{}\r\n", sdp.join("\r\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::h264::{H264Packetizer, ParameterSets};
    use bytes::Bytes;

    fn origin() -> SdpOrigin<'static> {
        SdpOrigin {
            ip: "192.168.1.100",
            username: "-",
            session_id: "1234567890",
            session_version: "1",
            session_name: "Stage Camera",
        }
    }

    #[test]
    fn generates_h264_sdp() {
        let media = MediaDescription::new(&H264Packetizer::new(), 96, 30, ParameterSets::default());
        let sdp = generate_sdp(&media, &origin());
        assert!(sdp.contains("v=0\r\n"));
        assert!(sdp.contains("o=- 1234567890 1 IN IP4 192.168.1.100\r\n"));
        assert!(sdp.contains("s=Stage Camera\r\n"));
        assert!(
            sdp.contains("c=IN IP4 192.168.1.100\r\n"),
            "c= must use configured IP, not 0.0.0.0"
        );
        assert!(sdp.contains("a=tool:stagecam\r\n"));
        assert!(sdp.contains("a=sendonly\r\n"));
        assert!(sdp.contains("a=rtpmap:96 H264/90000\r\n"));
        assert!(sdp.contains("a=fmtp:96 packetization-mode=1\r\n"));
        assert!(sdp.contains("a=control:track1\r\n"));
        assert_eq!(sdp.matches("m=").count(), 1, "exactly one media section");

        // rtpmap must come before fmtp (RFC 6184 §8.2.1)
        let rtpmap_idx = sdp.find("a=rtpmap").unwrap();
        let fmtp_idx = sdp.find("a=fmtp").unwrap();
        assert!(rtpmap_idx < fmtp_idx);

        // Session-level attrs precede the media section
        let sendonly_idx = sdp.find("a=sendonly").unwrap();
        let m_idx = sdp.find("m=video").unwrap();
        assert!(sendonly_idx < m_idx);
        assert!(fmtp_idx > m_idx);
        assert!(sdp.ends_with("\r\n"));
    }

    #[test]
    fn includes_parameter_sets_when_known() {
        let params = ParameterSets {
            sps: Some(Bytes::from_static(&[0x67, 0x42, 0x00, 0x1e])),
            pps: Some(Bytes::from_static(&[0x68, 0xce, 0x38, 0x80])),
        };
        let media = MediaDescription::new(&H264Packetizer::new(), 96, 30, params);
        let sdp = generate_sdp(&media, &origin());
        assert!(sdp.contains(
            "a=fmtp:96 packetization-mode=1;profile-level-id=42001e;\
             sprop-parameter-sets=Z0IAHg==,aM44gA==\r\n"
        ));
    }
}
