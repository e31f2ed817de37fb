//! Framing for the RTSP control connection.
//!
//! One TCP stream carries two kinds of messages (RFC 2326 §10.12):
//!
//! - text RTSP messages, terminated by an empty line and followed by
//!   `Content-Length` bytes of body;
//! - interleaved binary frames: `'$'`, a one-byte channel id, a two-byte
//!   big-endian length, then the RTP/RTCP packet.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{RtspRequest, RtspResponse};
use crate::error::{Error, ParseErrorKind};

/// Upper bound on a request head (request line + headers).
pub const MAX_HEAD_SIZE: usize = 64 * 1024;
/// Upper bound on a request body.
pub const MAX_BODY_SIZE: usize = 64 * 1024;

const INTERLEAVED_MAGIC: u8 = b'$';
const INTERLEAVED_HEADER_LEN: usize = 4;

/// A message read from the client.
#[derive(Debug)]
pub enum Inbound {
    Request(RtspRequest),
    /// Interleaved data from the client (usually RTCP receiver reports).
    Interleaved { channel: u8, payload: Bytes },
    /// A complete message that could not be parsed. The framing stayed
    /// intact, so the connection can answer 400 and carry on.
    Invalid(ParseErrorKind),
}

/// A message written to the client.
#[derive(Debug)]
pub enum Outbound {
    Response(RtspResponse),
    Interleaved { channel: u8, payload: Bytes },
}

#[derive(Debug, Default)]
pub struct RtspCodec;

impl Decoder for RtspCodec {
    type Item = Inbound;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Stray line breaks between messages are allowed.
        let leading = src.iter().take_while(|&&b| matches!(b, b'\r' | b'\n')).count();
        src.advance(leading);

        if src.is_empty() {
            return Ok(None);
        }

        if src[0] == INTERLEAVED_MAGIC {
            return Ok(decode_interleaved(src));
        }

        let Some(head_len) = find_head_end(src) else {
            if src.len() > MAX_HEAD_SIZE {
                return Err(Error::Parse {
                    kind: ParseErrorKind::HeaderTooLarge,
                });
            }
            return Ok(None);
        };

        let content_length = match content_length(&src[..head_len]) {
            Ok(len) => len,
            Err(kind) => {
                src.advance(head_len);
                return Ok(Some(Inbound::Invalid(kind)));
            }
        };
        if content_length > MAX_BODY_SIZE {
            return Err(Error::Parse {
                kind: ParseErrorKind::InvalidContentLength,
            });
        }

        let total = head_len + content_length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let message = src.split_to(total);
        let Ok(text) = std::str::from_utf8(&message) else {
            return Ok(Some(Inbound::Invalid(ParseErrorKind::InvalidEncoding)));
        };

        match RtspRequest::parse(text) {
            Ok(request) => Ok(Some(Inbound::Request(request))),
            Err(Error::Parse { kind }) => Ok(Some(Inbound::Invalid(kind))),
            Err(e) => Err(e),
        }
    }
}

fn decode_interleaved(src: &mut BytesMut) -> Option<Inbound> {
    if src.len() < INTERLEAVED_HEADER_LEN {
        return None;
    }
    let channel = src[1];
    let len = u16::from_be_bytes([src[2], src[3]]) as usize;
    if src.len() < INTERLEAVED_HEADER_LEN + len {
        src.reserve(INTERLEAVED_HEADER_LEN + len - src.len());
        return None;
    }
    src.advance(INTERLEAVED_HEADER_LEN);
    let payload = src.split_to(len).freeze();
    Some(Inbound::Interleaved { channel, payload })
}

/// Length of the message head including the blank line.
fn find_head_end(src: &[u8]) -> Option<usize> {
    src.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

fn content_length(head: &[u8]) -> Result<usize, ParseErrorKind> {
    let head = std::str::from_utf8(head).map_err(|_| ParseErrorKind::InvalidEncoding)?;
    for line in head.lines().skip(1) {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("Content-Length") {
                return value
                    .trim()
                    .parse()
                    .map_err(|_| ParseErrorKind::InvalidContentLength);
            }
        }
    }
    Ok(0)
}

impl Encoder<Outbound> for RtspCodec {
    type Error = Error;

    fn encode(&mut self, item: Outbound, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Outbound::Response(response) => {
                dst.extend_from_slice(response.serialize().as_bytes());
            }
            Outbound::Interleaved { channel, payload } => {
                let len = u16::try_from(payload.len()).map_err(|_| {
                    Error::TransportWrite(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "interleaved payload exceeds 65535 bytes",
                    ))
                })?;
                dst.reserve(INTERLEAVED_HEADER_LEN + payload.len());
                dst.put_u8(INTERLEAVED_MAGIC);
                dst.put_u8(channel);
                dst.put_u16(len);
                dst.put_slice(&payload);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> (Vec<Inbound>, BytesMut) {
        let mut codec = RtspCodec;
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();
        while let Some(item) = codec.decode(&mut buf).unwrap() {
            out.push(item);
        }
        (out, buf)
    }

    #[test]
    fn decodes_request() {
        let (items, rest) = decode_all(b"OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n\r\n");
        assert_eq!(items.len(), 1);
        assert!(rest.is_empty());
        match &items[0] {
            Inbound::Request(req) => assert_eq!(req.method, "OPTIONS"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn waits_for_complete_head() {
        let (items, rest) = decode_all(b"DESCRIBE rtsp://h/stream RTSP/1.0\r\nCSeq: 2\r\n");
        assert!(items.is_empty());
        assert!(!rest.is_empty());
    }

    #[test]
    fn waits_for_body() {
        let raw = b"SET_PARAMETER rtsp://h/stream RTSP/1.0\r\nCSeq: 3\r\nContent-Length: 10\r\n\r\nabc";
        let (items, _) = decode_all(raw);
        assert!(items.is_empty());
    }

    #[test]
    fn interleaved_then_request() {
        let mut raw = vec![b'$', 1, 0, 3, 0x80, 0xc9, 0x00];
        raw.extend_from_slice(b"GET_PARAMETER rtsp://h/stream RTSP/1.0\r\nCSeq: 7\r\n\r\n");
        let (items, rest) = decode_all(&raw);
        assert!(rest.is_empty());
        assert_eq!(items.len(), 2);
        assert!(matches!(
            &items[0],
            Inbound::Interleaved { channel: 1, payload } if payload.len() == 3
        ));
        assert!(matches!(&items[1], Inbound::Request(r) if r.cseq() == Some("7")));
    }

    #[test]
    fn malformed_request_keeps_framing() {
        let raw = b"garbage\r\n\r\nOPTIONS * RTSP/1.0\r\nCSeq: 2\r\n\r\n";
        let (items, _) = decode_all(raw);
        assert!(matches!(
            items[0],
            Inbound::Invalid(ParseErrorKind::InvalidRequestLine)
        ));
        assert!(matches!(&items[1], Inbound::Request(_)));
    }

    #[test]
    fn bad_content_length_is_invalid() {
        let raw = b"OPTIONS * RTSP/1.0\r\nCSeq: 2\r\nContent-Length: ten\r\n\r\n";
        let (items, _) = decode_all(raw);
        assert!(matches!(
            items[0],
            Inbound::Invalid(ParseErrorKind::InvalidContentLength)
        ));
    }

    #[test]
    fn oversized_head_is_fatal() {
        let mut codec = RtspCodec;
        let mut buf = BytesMut::from(&vec![b'A'; MAX_HEAD_SIZE + 1][..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn encodes_interleaved_frame() {
        let mut codec = RtspCodec;
        let mut dst = BytesMut::new();
        codec
            .encode(
                Outbound::Interleaved {
                    channel: 0,
                    payload: Bytes::from_static(&[1, 2, 3]),
                },
                &mut dst,
            )
            .unwrap();
        assert_eq!(&dst[..], &[b'$', 0, 0, 3, 1, 2, 3]);
    }

    #[test]
    fn rejects_oversized_interleaved_payload() {
        let mut codec = RtspCodec;
        let mut dst = BytesMut::new();
        let payload = Bytes::from(vec![0u8; 70_000]);
        assert!(
            codec
                .encode(Outbound::Interleaved { channel: 0, payload }, &mut dst)
                .is_err()
        );
    }
}
