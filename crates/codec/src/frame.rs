//! Stream multiplexing frames.
//!
//! A session carries many logical streams over one reliable byte stream.
//! Each frame is length-delimited and names the stream it belongs to:
//!
//! ```text
//! 0       4      5        9
//! +-------+------+--------+----------------+
//! | len   | kind | stream | payload ...    |
//! +-------+------+--------+----------------+
//! ```
//!
//! `len` is the big-endian byte length of everything after it. Stream 0 is
//! reserved for the session hello exchange.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Frames larger than this are rejected outright.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Reset code sent when the initiator's context was canceled.
pub const RESET_CANCELED: u8 = 1;
/// Reset code sent when the session is going away.
pub const RESET_GOING_AWAY: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Opens a new logical stream.
    Open,
    /// One payload record on an open stream.
    Data,
    /// Half-close: the sender will not send further payloads.
    Fin,
    /// Abort: the stream is dead in both directions. The payload is a
    /// single reset code byte.
    Reset,
}

impl FrameKind {
    fn as_u8(self) -> u8 {
        match self {
            FrameKind::Open => 1,
            FrameKind::Data => 2,
            FrameKind::Fin => 3,
            FrameKind::Reset => 4,
        }
    }

    fn parse(value: u8) -> Option<Self> {
        Some(match value {
            1 => FrameKind::Open,
            2 => FrameKind::Data,
            3 => FrameKind::Fin,
            4 => FrameKind::Reset,
            _ => return None,
        })
    }
}

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub stream: u32,
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn open(stream: u32) -> Self {
        Self {
            stream,
            kind: FrameKind::Open,
            payload: Bytes::new(),
        }
    }

    pub fn data(stream: u32, payload: Vec<u8>) -> Self {
        Self {
            stream,
            kind: FrameKind::Data,
            payload: payload.into(),
        }
    }

    pub fn fin(stream: u32) -> Self {
        Self {
            stream,
            kind: FrameKind::Fin,
            payload: Bytes::new(),
        }
    }

    pub fn reset(stream: u32, code: u8) -> Self {
        Self {
            stream,
            kind: FrameKind::Reset,
            payload: Bytes::copy_from_slice(&[code]),
        }
    }

    pub fn reset_code(&self) -> Option<u8> {
        self.payload.first().copied()
    }
}

/// Encoder/decoder for [`Frame`]s over any reliable byte stream.
///
/// ```
/// use bytes::BytesMut;
/// use tokio_util::codec::{Decoder, Encoder};
/// use tether_codec::frame::{Frame, FrameCodec};
///
/// let mut buf = BytesMut::new();
/// let mut codec = FrameCodec::default();
/// codec.encode(Frame::data(1, vec![0xAB]), &mut buf).unwrap();
///
/// assert_eq!(
///     buf.as_ref(),
///     [0x00, 0x00, 0x00, 0x06, 0x02, 0x00, 0x00, 0x00, 0x01, 0xAB]
/// );
///
/// let frame = codec.decode(&mut buf).unwrap().unwrap();
/// assert_eq!(frame, Frame::data(1, vec![0xAB]));
/// ```
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frame.payload.len() > MAX_FRAME_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "frame exceeds maximum size",
            ));
        }

        dst.reserve(4 + 5 + frame.payload.len());
        dst.put_u32((5 + frame.payload.len()) as u32);
        dst.put_u8(frame.kind.as_u8());
        dst.put_u32(frame.stream);
        dst.put_slice(&frame.payload);

        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len < 5 || len > 5 + MAX_FRAME_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "invalid frame length",
            ));
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let kind = FrameKind::parse(src[0]).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "unknown frame kind")
        })?;
        let stream = u32::from_be_bytes([src[1], src[2], src[3], src[4]]);
        src.advance(5);
        let payload = src.split_to(len - 5).freeze();

        Ok(Some(Frame {
            stream,
            kind,
            payload,
        }))
    }
}
