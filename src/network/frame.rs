use std::fmt;
use std::io::{self, ErrorKind};

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::AppError::{FrameTooLarge, MalformedProtocol};
use crate::AppResult;

pub const HEADER_LENGTH: usize = 4;
pub const MAX_BODY_LENGTH: usize = 512;
const FRAME_CAPACITY: usize = HEADER_LENGTH + MAX_BODY_LENGTH;

/// Renders a body length as a right-justified, space-padded 4 character
/// decimal field (`"   4"`, `" 512"`).
///
/// Lengths above [`MAX_BODY_LENGTH`] are clamped first, so the field can never overflow.
pub fn encode_header(body_length: usize) -> [u8; HEADER_LENGTH] {
    let rendered = format!("{:>width$}", body_length.min(MAX_BODY_LENGTH), width = HEADER_LENGTH);
    let mut header = [b' '; HEADER_LENGTH];
    header.copy_from_slice(rendered.as_bytes());
    header
}

/// Parses a frame header.
///
/// Leading whitespace and an optional sign are skipped, then leading digits are read
/// until the first non-digit. A header without digits decodes to 0. Values outside
/// `0..=MAX_BODY_LENGTH` are a protocol violation.
pub fn decode_header(header: &[u8]) -> AppResult<usize> {
    let field = &header[..header.len().min(HEADER_LENGTH)];
    let mut chars = field
        .iter()
        .copied()
        .skip_while(u8::is_ascii_whitespace)
        .peekable();
    let negative = match chars.peek() {
        Some(b'-') => {
            chars.next();
            true
        }
        Some(b'+') => {
            chars.next();
            false
        }
        _ => false,
    };
    let magnitude = chars
        .take_while(u8::is_ascii_digit)
        .fold(0i64, |acc, digit| acc * 10 + i64::from(digit - b'0'));
    let value = if negative { -magnitude } else { magnitude };

    if !(0..=MAX_BODY_LENGTH as i64).contains(&value) {
        return Err(FrameTooLarge(value));
    }
    Ok(value as usize)
}

/// One unit of the wire protocol: a 4 byte ASCII length header followed by
/// at most 512 body bytes, stored contiguously.
#[derive(Clone)]
pub struct Frame {
    data: [u8; FRAME_CAPACITY],
    body_length: usize,
}

impl Frame {
    pub fn new() -> Frame {
        Frame {
            data: [0; FRAME_CAPACITY],
            body_length: 0,
        }
    }

    /// Builds an encoded frame from `body`. Bodies longer than
    /// [`MAX_BODY_LENGTH`] are truncated.
    pub fn from_body(body: &[u8]) -> Frame {
        let mut frame = Frame::new();
        frame.set_body_length(body.len());
        let body_length = frame.body_length;
        frame.body_mut().copy_from_slice(&body[..body_length]);
        frame.encode_header();
        frame
    }

    /// Header and body as they go on the wire.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.length()]
    }

    pub fn length(&self) -> usize {
        HEADER_LENGTH + self.body_length
    }

    pub fn header(&self) -> &[u8] {
        &self.data[..HEADER_LENGTH]
    }

    pub fn header_mut(&mut self) -> &mut [u8] {
        &mut self.data[..HEADER_LENGTH]
    }

    pub fn body(&self) -> &[u8] {
        &self.data[HEADER_LENGTH..self.length()]
    }

    pub fn body_mut(&mut self) -> &mut [u8] {
        let end = self.length();
        &mut self.data[HEADER_LENGTH..end]
    }

    pub fn body_length(&self) -> usize {
        self.body_length
    }

    /// Sets the body length, silently clamping it to [`MAX_BODY_LENGTH`].
    pub fn set_body_length(&mut self, body_length: usize) {
        self.body_length = body_length.min(MAX_BODY_LENGTH);
    }

    pub fn encode_header(&mut self) {
        let header = encode_header(self.body_length);
        self.header_mut().copy_from_slice(&header);
    }

    /// Decodes the stored header into the body length.
    ///
    /// Returns `false` and resets the body length to 0 when the header is out of range.
    pub fn decode_header(&mut self) -> bool {
        match decode_header(self.header()) {
            Ok(body_length) => {
                self.body_length = body_length;
                true
            }
            Err(_) => {
                self.body_length = 0;
                false
            }
        }
    }
}

impl Default for Frame {
    fn default() -> Self {
        Frame::new()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("body_length", &self.body_length)
            .field("body", &String::from_utf8_lossy(self.body()))
            .finish()
    }
}

/// Stream codec that stitches socket reads into whole frames.
///
/// A frame is only yielded once its header and full body are buffered, so partial
/// reads and several frames arriving in one read are both handled.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = crate::AppError;

    fn decode(&mut self, src: &mut BytesMut) -> AppResult<Option<Frame>> {
        if src.len() < HEADER_LENGTH {
            src.reserve(HEADER_LENGTH - src.len());
            return Ok(None);
        }
        let body_length = decode_header(&src[..HEADER_LENGTH]).map_err(|err| {
            MalformedProtocol(format!(
                "invalid frame header {:?}: {}",
                String::from_utf8_lossy(&src[..HEADER_LENGTH]),
                err
            ))
        })?;
        if src.len() < HEADER_LENGTH + body_length {
            src.reserve(HEADER_LENGTH + body_length - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LENGTH);
        let body = src.split_to(body_length);
        Ok(Some(Frame::from_body(&body)))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> AppResult<Option<Frame>> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            // peer closed the connection gracefully
            None if buf.is_empty() => Ok(None),
            // peer closed the connection while sending a frame
            None => Err(io::Error::new(ErrorKind::ConnectionReset, "connection reset by peer").into()),
        }
    }
}

impl<'a> Encoder<&'a [u8]> for FrameCodec {
    type Error = crate::AppError;

    fn encode(&mut self, body: &'a [u8], dst: &mut BytesMut) -> AppResult<()> {
        let frame = Frame::from_body(body);
        dst.reserve(frame.length());
        dst.extend_from_slice(frame.data());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AppError;

    #[test]
    fn header_round_trips_every_legal_length() {
        for body_length in 0..=MAX_BODY_LENGTH {
            let header = encode_header(body_length);
            assert_eq!(decode_header(&header).unwrap(), body_length);
        }
    }

    #[test]
    fn header_is_space_padded() {
        assert_eq!(&encode_header(4), b"   4");
        assert_eq!(&encode_header(0), b"   0");
        assert_eq!(&encode_header(512), b" 512");
    }

    #[test]
    fn set_body_length_clamps() {
        let mut frame = Frame::new();
        frame.set_body_length(513);
        assert_eq!(frame.body_length(), MAX_BODY_LENGTH);
        frame.set_body_length(100_000);
        assert_eq!(frame.body_length(), MAX_BODY_LENGTH);
        frame.encode_header();
        assert_eq!(frame.header(), b" 512");
    }

    #[test]
    fn oversized_header_is_rejected() {
        assert!(matches!(decode_header(b" 513"), Err(AppError::FrameTooLarge(513))));
        assert!(matches!(decode_header(b"9999"), Err(AppError::FrameTooLarge(9999))));
        assert!(matches!(decode_header(b"  -1"), Err(AppError::FrameTooLarge(-1))));

        let mut frame = Frame::from_body(b"hello");
        frame.header_mut().copy_from_slice(b"1000");
        assert!(!frame.decode_header());
        assert_eq!(frame.body_length(), 0);
    }

    #[test]
    fn header_parses_leading_digits_only() {
        assert_eq!(decode_header(b"12ab").unwrap(), 12);
        assert_eq!(decode_header(b"0004").unwrap(), 4);
        assert_eq!(decode_header(b"    ").unwrap(), 0);
        assert_eq!(decode_header(b"ping").unwrap(), 0);
    }

    #[test]
    fn ping_frame_round_trip() {
        let frame = Frame::from_body(b"ping");
        assert_eq!(frame.header(), b"   4");
        assert_eq!(frame.data(), b"   4ping");

        let mut received = Frame::new();
        received.header_mut().copy_from_slice(&frame.data()[..HEADER_LENGTH]);
        assert!(received.decode_header());
        assert_eq!(received.body_length(), 4);
        received.body_mut().copy_from_slice(&frame.data()[HEADER_LENGTH..]);
        assert_eq!(received.body(), b"ping");
    }

    #[test]
    fn from_body_truncates_long_bodies() {
        let body = vec![b'x'; 600];
        let frame = Frame::from_body(&body);
        assert_eq!(frame.body_length(), MAX_BODY_LENGTH);
        assert_eq!(frame.length(), HEADER_LENGTH + MAX_BODY_LENGTH);
    }

    #[test]
    fn codec_waits_for_whole_frame() {
        let mut codec = FrameCodec;
        let mut buffer = BytesMut::new();

        buffer.extend_from_slice(b"  ");
        assert!(codec.decode(&mut buffer).unwrap().is_none());
        buffer.extend_from_slice(b" 5he");
        assert!(codec.decode(&mut buffer).unwrap().is_none());
        buffer.extend_from_slice(b"llo");
        let frame = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(frame.body(), b"hello");
        assert!(buffer.is_empty());
    }

    #[test]
    fn codec_splits_concatenated_frames() {
        let mut codec = FrameCodec;
        let mut buffer = BytesMut::new();
        codec.encode(b"one".as_slice(), &mut buffer).unwrap();
        codec.encode(b"".as_slice(), &mut buffer).unwrap();
        codec.encode(b"three".as_slice(), &mut buffer).unwrap();
        assert_eq!(&buffer[..], b"   3one   0   5three");

        let bodies: Vec<Vec<u8>> = std::iter::from_fn(|| codec.decode(&mut buffer).unwrap())
            .map(|frame| frame.body().to_vec())
            .collect();
        assert_eq!(bodies, vec![b"one".to_vec(), Vec::new(), b"three".to_vec()]);
    }

    #[test]
    fn codec_rejects_malformed_header() {
        let mut codec = FrameCodec;
        let mut buffer = BytesMut::from(&b"9999abcd"[..]);
        assert!(matches!(
            codec.decode(&mut buffer),
            Err(AppError::MalformedProtocol(_))
        ));
    }

    #[test]
    fn codec_eof_inside_frame_is_reset() {
        let mut codec = FrameCodec;
        let mut buffer = BytesMut::from(&b"  10abc"[..]);
        match codec.decode_eof(&mut buffer) {
            Err(AppError::IoError(err)) => assert_eq!(err.kind(), ErrorKind::ConnectionReset),
            other => panic!("unexpected decode result: {:?}", other),
        }

        let mut empty = BytesMut::new();
        assert!(codec.decode_eof(&mut empty).unwrap().is_none());
    }
}
