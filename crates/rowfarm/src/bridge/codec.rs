//! Length-prefixed framing for master/worker communication.
//!
//! Every message is `[u32 big-endian length][payload]`. Uses LengthDelimitedCodec
//! for the framing itself and tracks the announced length so that an early end of
//! stream can be reported as either a missing header or a truncated payload.
//! Works over any AsyncRead/AsyncWrite (TCP streams, in-memory buffers, etc).

use std::io;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite, LengthDelimitedCodec};

/// Size of the length field in bytes.
pub const HEADER_LEN: usize = 4;

/// Largest payload accepted unless configured otherwise (64 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Framing failures.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The stream ended before the 4-byte length field was complete.
    #[error("connection closed after {received} of 4 header bytes")]
    IncompleteHeader { received: usize },

    /// The stream ended before the announced payload was complete.
    ///
    /// `partial` holds whatever payload bytes did arrive. It is never a valid message.
    #[error("connection closed after {} of {expected} payload bytes", .partial.len())]
    TruncatedPayload { expected: usize, partial: Bytes },

    /// The length field (or an outgoing payload) exceeds the configured cap.
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    Oversize { len: usize, max: usize },

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Codec that frames opaque payloads with a 4-byte big-endian length prefix.
///
/// Wraps LengthDelimitedCodec and adds a frame size cap plus precise
/// end-of-stream errors.
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
    max_frame_len: usize,
    /// Payload length announced by a header the inner codec has already consumed.
    expected: Option<usize>,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameCodec {
    pub fn new(max_frame_len: usize) -> Self {
        let max_frame_len = max_frame_len.min(u32::MAX as usize);
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(HEADER_LEN)
                .max_frame_length(max_frame_len)
                .new_codec(),
            max_frame_len,
            expected: None,
        }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.expected.is_none() {
            if src.len() < HEADER_LEN {
                return Ok(None);
            }
            let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
            if len > self.max_frame_len {
                return Err(FrameError::Oversize {
                    len,
                    max: self.max_frame_len,
                });
            }
            self.expected = Some(len);
        }

        match self.inner.decode(src)? {
            Some(frame) => {
                self.expected = None;
                tracing::trace!(frame_len = frame.len(), "Decoded frame");
                Ok(Some(frame.freeze()))
            }
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }

        match self.expected.take() {
            Some(expected) => Err(FrameError::TruncatedPayload {
                expected,
                partial: buf.split().freeze(),
            }),
            None if buf.is_empty() => Ok(None),
            None => Err(FrameError::IncompleteHeader {
                received: buf.len(),
            }),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = item.len();
        if len > self.max_frame_len {
            return Err(FrameError::Oversize {
                len,
                max: self.max_frame_len,
            });
        }
        tracing::trace!(frame_len = len, "Encoding frame");
        dst.reserve(HEADER_LEN + len);
        self.inner.encode(item, dst)?;
        Ok(())
    }
}

/// Read exactly one frame from `reader`.
///
/// A stream that closes before any byte arrives is an `IncompleteHeader` with
/// zero bytes received: the caller was promised a frame.
pub async fn read_frame<R>(reader: R, max_frame_len: usize) -> Result<Bytes, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut framed = FramedRead::new(reader, FrameCodec::new(max_frame_len));
    match framed.next().await {
        Some(frame) => frame,
        None => Err(FrameError::IncompleteHeader { received: 0 }),
    }
}

/// Write `payload` as one frame and flush it.
pub async fn write_frame<W>(writer: W, payload: Bytes, max_frame_len: usize) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let mut framed = FramedWrite::new(writer, FrameCodec::new(max_frame_len));
    framed.send(payload).await
}
