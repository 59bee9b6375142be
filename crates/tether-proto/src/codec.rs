//! Length-prefixed frame codec

use crate::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Size of the big-endian length prefix
const LENGTH_PREFIX: usize = 4;

/// Codec turning opaque payloads into `[u32 length][payload]` frames
#[derive(Debug)]
pub struct FrameCodec {
    /// Read buffer for incoming data
    read_buf: BytesMut,
    /// Maximum frame size allowed
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Create a new frame codec with default settings
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Create a new frame codec with custom max frame size
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            read_buf: BytesMut::with_capacity(8192),
            max_frame_size,
        }
    }

    /// Maximum payload size accepted in either direction
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode a payload with its length prefix
    pub fn encode_frame(&self, payload: &[u8]) -> Result<Bytes, ProtocolError> {
        if payload.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len(),
                max: self.max_frame_size,
            });
        }

        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);

        Ok(buf.freeze())
    }

    /// Write a framed payload to an async writer
    pub async fn write_frame<W>(&self, writer: &mut W, payload: &[u8]) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let encoded = self.encode_frame(payload)?;
        writer.write_all(&encoded).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read the next payload from an async reader.
    ///
    /// Returns `Ok(None)` on a clean end of stream. Dropping the returned
    /// future between reads loses no data: bytes already read stay in the
    /// codec buffer.
    pub async fn read_frame<R>(&mut self, reader: &mut R) -> Result<Option<Bytes>, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(payload) = self.try_decode_frame()? {
                return Ok(Some(payload));
            }

            let mut temp_buf = [0u8; 8192];
            let n = reader.read(&mut temp_buf).await?;

            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                } else {
                    return Err(ProtocolError::InvalidFrame);
                }
            }

            self.read_buf.extend_from_slice(&temp_buf[..n]);
        }
    }

    /// Try to decode a frame from the internal buffer
    pub fn try_decode_frame(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        if self.read_buf.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        // Peek at the length prefix without consuming it
        let frame_len = (&self.read_buf[..LENGTH_PREFIX]).get_u32() as usize;

        if frame_len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: frame_len,
                max: self.max_frame_size,
            });
        }

        if self.read_buf.len() < LENGTH_PREFIX + frame_len {
            return Ok(None);
        }

        self.read_buf.advance(LENGTH_PREFIX);
        Ok(Some(self.read_buf.split_to(frame_len).freeze()))
    }

    /// Get the current buffer size
    pub fn buffer_size(&self) -> usize {
        self.read_buf.len()
    }

    /// Clear the internal buffer
    pub fn clear_buffer(&mut self) {
        self.read_buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_frame_encode_decode() {
        let codec = FrameCodec::new();
        let encoded = codec.encode_frame(b"test payload").unwrap();
        assert_eq!(encoded.len(), 4 + 12);

        let mut codec2 = FrameCodec::new();
        let mut cursor = Cursor::new(encoded);
        let decoded = codec2.read_frame(&mut cursor).await.unwrap().unwrap();

        assert_eq!(&decoded[..], b"test payload");
    }

    #[tokio::test]
    async fn test_write_read_frame() {
        let codec = FrameCodec::new();

        let mut buffer = Vec::new();
        codec.write_frame(&mut buffer, b"").await.unwrap();
        assert_eq!(buffer, vec![0, 0, 0, 0]);

        let mut codec2 = FrameCodec::new();
        let mut cursor = Cursor::new(buffer);
        let decoded = codec2.read_frame(&mut cursor).await.unwrap().unwrap();
        assert!(decoded.is_empty());
    }

    #[tokio::test]
    async fn test_partial_frame_reading() {
        let codec = FrameCodec::new();
        let encoded = codec.encode_frame(b"test").unwrap();

        let mut codec2 = FrameCodec::new();
        let mid = encoded.len() / 2;
        codec2.read_buf.extend_from_slice(&encoded[..mid]);

        assert!(codec2.try_decode_frame().unwrap().is_none());

        codec2.read_buf.extend_from_slice(&encoded[mid..]);
        let decoded = codec2.try_decode_frame().unwrap().unwrap();
        assert_eq!(&decoded[..], b"test");
        assert_eq!(codec2.buffer_size(), 0);
    }

    #[tokio::test]
    async fn test_multiple_frames_in_buffer() {
        let codec = FrameCodec::new();
        let mut combined = BytesMut::new();
        combined.extend_from_slice(&codec.encode_frame(b"first").unwrap());
        combined.extend_from_slice(&codec.encode_frame(b"second").unwrap());

        let mut codec2 = FrameCodec::new();
        let mut cursor = Cursor::new(combined.freeze());

        let first = codec2.read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(&first[..], b"first");

        let second = codec2.read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(&second[..], b"second");

        assert!(codec2.read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_too_large() {
        let codec = FrameCodec::with_max_frame_size(100);
        let result = codec.encode_frame(&[0u8; 200]);
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { size: 200, max: 100 })));
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_rejected() {
        let mut data = BytesMut::new();
        data.put_u32(1024);
        data.put_slice(&[0u8; 8]);

        let mut codec = FrameCodec::with_max_frame_size(16);
        let mut cursor = Cursor::new(data.freeze());
        let result = codec.read_frame(&mut cursor).await;
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_truncated_stream() {
        let mut data = BytesMut::new();
        data.put_u32(10);
        data.put_slice(b"abc");

        let mut codec = FrameCodec::new();
        let mut cursor = Cursor::new(data.freeze());
        let result = codec.read_frame(&mut cursor).await;
        assert!(matches!(result, Err(ProtocolError::InvalidFrame)));
    }

    #[tokio::test]
    async fn test_empty_stream() {
        let mut codec = FrameCodec::new();
        let mut cursor = Cursor::new(Vec::<u8>::new());

        let result = codec.read_frame(&mut cursor).await.unwrap();
        assert!(result.is_none());
    }

    proptest! {
        #[test]
        fn test_codec_preserves_payloads(
            payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..512), 1..8)
        ) {
            tokio_test::block_on(async {
                let codec = FrameCodec::new();
                let mut wire = Vec::new();
                for payload in &payloads {
                    codec.write_frame(&mut wire, payload).await?;
                }

                let mut reader = FrameCodec::new();
                let mut cursor = Cursor::new(wire);
                for payload in &payloads {
                    let decoded = reader.read_frame(&mut cursor).await?.unwrap();
                    prop_assert_eq!(&decoded[..], &payload[..]);
                }
                prop_assert!(reader.read_frame(&mut cursor).await?.is_none());

                Ok(())
            })?;
        }
    }
}
