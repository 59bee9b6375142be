//! Ordered, reliable frame channel over async byte streams
//!
//! A [`Channel`] knows nothing about the protocol: it moves opaque payloads
//! across a byte stream, one frame at a time. The two halves are owned
//! separately so that reading and writing never contend for the same lock.

use crate::{FrameCodec, ProtocolError};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

/// Boxed reader used by type-erased channels
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed writer used by type-erased channels
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Receiving half of a channel
#[derive(Debug)]
pub struct ChannelReader<R> {
    reader: R,
    codec: FrameCodec,
}

impl<R> ChannelReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Wrap a reader
    pub fn new(reader: R, max_frame_size: usize) -> Self {
        Self {
            reader,
            codec: FrameCodec::with_max_frame_size(max_frame_size),
        }
    }

    /// Receive the next payload; `None` once the peer closed the stream.
    ///
    /// Cancel-safe: a dropped `recv` future loses no buffered bytes.
    pub async fn recv(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        self.codec.read_frame(&mut self.reader).await
    }
}

/// Sending half of a channel
#[derive(Debug)]
pub struct ChannelWriter<W> {
    writer: W,
    codec: FrameCodec,
}

impl<W> ChannelWriter<W>
where
    W: AsyncWrite + Unpin,
{
    /// Wrap a writer
    pub fn new(writer: W, max_frame_size: usize) -> Self {
        Self {
            writer,
            codec: FrameCodec::with_max_frame_size(max_frame_size),
        }
    }

    /// Send one payload as a single frame
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        self.codec.write_frame(&mut self.writer, payload).await
    }

    /// Flush and close the write side
    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// A bidirectional frame channel
#[derive(Debug)]
pub struct Channel<R, W> {
    reader: ChannelReader<R>,
    writer: ChannelWriter<W>,
}

impl<R, W> Channel<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Build a channel from separate read and write streams
    pub fn new(reader: R, writer: W, max_frame_size: usize) -> Self {
        Self {
            reader: ChannelReader::new(reader, max_frame_size),
            writer: ChannelWriter::new(writer, max_frame_size),
        }
    }

    /// Send one payload
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        self.writer.send(payload).await
    }

    /// Receive one payload
    pub async fn recv(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        self.reader.recv().await
    }

    /// Split into independently owned halves
    pub fn into_split(self) -> (ChannelReader<R>, ChannelWriter<W>) {
        (self.reader, self.writer)
    }
}

impl<S> Channel<ReadHalf<S>, WriteHalf<S>>
where
    S: AsyncRead + AsyncWrite,
{
    /// Build a channel over a single duplex stream
    pub fn from_stream(stream: S, max_frame_size: usize) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer, max_frame_size)
    }
}

impl Channel<BoxedReader, BoxedWriter> {
    /// Build a type-erased channel
    pub fn boxed<R, W>(reader: R, writer: W, max_frame_size: usize) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::new(Box::new(reader), Box::new(writer), max_frame_size)
    }
}
