//! Bounded in-memory byte pipe and write-then-flush sinks.
//!
//! The pipe connects a producer task to an HTTP body: the sync client feeds
//! its request body with the wish list through one, and the file handler
//! feeds its response body with chunk data through another. A producer that
//! fails closes the pipe with its error, which the body stream yields and the
//! HTTP layer turns into an aborted transfer.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Frames buffered between producer and consumer.
pub const PIPE_CAPACITY: usize = 16;

/// A sink where every write is flushed before it returns, so the remote side
/// observes each unit as soon as it is produced.
#[async_trait]
pub trait FlushWriter: Send {
    async fn write_flush(&mut self, data: Bytes) -> io::Result<()>;
}

pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        PipeWriter { tx },
        PipeReader {
            inner: ReceiverStream::new(rx),
        },
    )
}

pub struct PipeWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl PipeWriter {
    pub async fn write(&mut self, data: Bytes) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.tx
            .send(Ok(data))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader closed"))
    }

    /// Close the pipe; the reader sees end of stream.
    pub fn close(self) {}

    /// Close the pipe so that the reader's next item is `err`.
    pub async fn close_with_error(self, err: io::Error) {
        let _ = self.tx.send(Err(err)).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[async_trait]
impl FlushWriter for PipeWriter {
    async fn write_flush(&mut self, data: Bytes) -> io::Result<()> {
        self.write(data).await
    }
}

pub struct PipeReader {
    inner: ReceiverStream<io::Result<Bytes>>,
}

impl Stream for PipeReader {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// [`FlushWriter`] over any [`AsyncWrite`].
pub struct FlushingWriter<W>(pub W);

#[async_trait]
impl<W> FlushWriter for FlushingWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_flush(&mut self, data: Bytes) -> io::Result<()> {
        self.0.write_all(&data).await?;
        self.0.flush().await
    }
}

#[async_trait]
impl FlushWriter for Vec<u8> {
    async fn write_flush(&mut self, data: Bytes) -> io::Result<()> {
        self.extend_from_slice(&data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_pipe_delivers_in_order() {
        let (mut writer, mut reader) = pipe(2);
        let producer = tokio::spawn(async move {
            for part in ["a", "bc", "", "def"] {
                writer.write_flush(Bytes::from(part)).await.unwrap();
            }
            writer.close();
        });

        let mut out = Vec::new();
        while let Some(item) = reader.next().await {
            out.extend_from_slice(&item.unwrap());
        }
        producer.await.unwrap();
        assert_eq!(out, b"abcdef");
    }

    #[tokio::test]
    async fn test_close_with_error_reaches_reader() {
        let (mut writer, mut reader) = pipe(2);
        writer.write(Bytes::from_static(b"x")).await.unwrap();
        writer
            .close_with_error(io::Error::other("wish list failed"))
            .await;

        assert_eq!(reader.next().await.unwrap().unwrap(), Bytes::from_static(b"x"));
        let err = reader.next().await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "wish list failed");
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn test_write_fails_when_reader_dropped() {
        let (mut writer, reader) = pipe(1);
        drop(reader);
        let err = writer.write(Bytes::from_static(b"x")).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(writer.is_closed());
    }

    #[tokio::test]
    async fn test_flushing_writer() {
        let mut sink = FlushingWriter(Vec::new());
        sink.write_flush(Bytes::from_static(b"chunk")).await.unwrap();
        assert_eq!(sink.0, b"chunk");
    }
}
