//! Newline-delimited JSON framing.
//!
//! Every frame is one compact JSON value followed by `\n`. Compact
//! serialization never emits a raw newline, so a line is always exactly one
//! value and a partial read never yields a partial value.

use futures::Stream;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Default upper bound for a single frame.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Framing errors. All of them end the stream.
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame exceeds the maximum size of {limit} bytes")]
    Oversized { limit: usize },

    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("stream ended in the middle of a frame")]
    Truncated,
}

/// Reading half of a framed stream.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
    max_frame_bytes: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            buf: Vec::new(),
            max_frame_bytes,
        }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Read the next value. `Ok(None)` means the peer closed the stream
    /// cleanly between frames. Blank lines are skipped.
    pub async fn next_frame(&mut self) -> Result<Option<Value>, FramingError> {
        loop {
            self.buf.clear();
            // One extra byte leaves room for the terminating newline.
            let limit = self.max_frame_bytes as u64 + 1;
            let read = (&mut self.inner)
                .take(limit)
                .read_until(b'\n', &mut self.buf)
                .await?;

            if read == 0 {
                return Ok(None);
            }

            if self.buf.last() != Some(&b'\n') {
                if read as u64 >= limit {
                    return Err(FramingError::Oversized {
                        limit: self.max_frame_bytes,
                    });
                }
                return Err(FramingError::Truncated);
            }

            let line = trim_line(&self.buf);
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            return serde_json::from_slice(line)
                .map(Some)
                .map_err(FramingError::Malformed);
        }
    }

    /// Turn the reader into a lazy, ordered stream of values.
    ///
    /// The stream ends after the first error or at a clean end of input.
    pub fn into_stream(self) -> impl Stream<Item = Result<Value, FramingError>> {
        futures::stream::unfold(Some(self), |state| async move {
            let mut reader = state?;
            match reader.next_frame().await {
                Ok(Some(value)) => Some((Ok(value), Some(reader))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

fn trim_line(buf: &[u8]) -> &[u8] {
    let mut end = buf.len();
    while end > 0 && matches!(buf[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &buf[..end]
}

/// Writing half of a framed stream.
pub struct FrameWriter<W> {
    inner: W,
    max_frame_bytes: usize,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W, max_frame_bytes: usize) -> Self {
        Self {
            inner: writer,
            max_frame_bytes,
        }
    }

    /// Encode and write one value, then flush.
    ///
    /// Nothing is written when the value cannot be encoded or is too large.
    pub async fn send<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), FramingError> {
        let mut bytes = serde_json::to_vec(value).map_err(FramingError::Encode)?;
        if bytes.len() > self.max_frame_bytes {
            return Err(FramingError::Oversized {
                limit: self.max_frame_bytes,
            });
        }
        bytes.push(b'\n');
        self.inner.write_all(&bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Close the write direction.
    pub async fn shutdown(&mut self) -> Result<(), FramingError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn test_round_trip_preserves_order() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(client, DEFAULT_MAX_FRAME_BYTES);
        let mut reader = FrameReader::new(server, DEFAULT_MAX_FRAME_BYTES);

        writer.send(&json!({"n": 1})).await.unwrap();
        writer.send(&json!("line\nbreak")).await.unwrap();
        writer.send(&json!([1, 2, 3])).await.unwrap();
        writer.shutdown().await.unwrap();

        assert_eq!(reader.next_frame().await.unwrap(), Some(json!({"n": 1})));
        assert_eq!(
            reader.next_frame().await.unwrap(),
            Some(json!("line\nbreak"))
        );
        assert_eq!(reader.next_frame().await.unwrap(), Some(json!([1, 2, 3])));
        assert_eq!(reader.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_partial_writes_yield_whole_values() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server, DEFAULT_MAX_FRAME_BYTES);

        let feeder = tokio::spawn(async move {
            for chunk in [&b"{\"a\":"[..], b"1}\r\n\n{\"b\"", b":2}\n"] {
                client.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        assert_eq!(reader.next_frame().await.unwrap(), Some(json!({"a": 1})));
        assert_eq!(reader.next_frame().await.unwrap(), Some(json!({"b": 2})));
        feeder.await.unwrap();
        assert_eq!(reader.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(server, 8);

        client.write_all(b"\"0123456789\"\n").await.unwrap();
        drop(client);

        assert!(matches!(
            reader.next_frame().await,
            Err(FramingError::Oversized { limit: 8 })
        ));
    }

    #[tokio::test]
    async fn test_frame_at_limit_is_accepted() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(server, 8);

        client.write_all(b"\"012345\"\n").await.unwrap();
        assert_eq!(reader.next_frame().await.unwrap(), Some(json!("012345")));
    }

    #[tokio::test]
    async fn test_writer_refuses_oversized_values() {
        let (client, _server) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(client, 4);
        assert!(matches!(
            writer.send(&json!("too long")).await,
            Err(FramingError::Oversized { limit: 4 })
        ));
    }

    #[tokio::test]
    async fn test_malformed_and_truncated_frames() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(server, DEFAULT_MAX_FRAME_BYTES);
        client.write_all(b"{not json}\n").await.unwrap();
        assert!(matches!(
            reader.next_frame().await,
            Err(FramingError::Malformed(_))
        ));

        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(server, DEFAULT_MAX_FRAME_BYTES);
        client.write_all(b"{\"a\":").await.unwrap();
        drop(client);
        assert!(matches!(
            reader.next_frame().await,
            Err(FramingError::Truncated)
        ));
    }

    #[tokio::test]
    async fn test_stream_stops_after_error() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"1\n2\noops\n3\n").await.unwrap();
        drop(client);

        let items: Vec<_> = FrameReader::new(server, DEFAULT_MAX_FRAME_BYTES)
            .into_stream()
            .collect()
            .await;
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_ref().unwrap(), &json!(1));
        assert_eq!(items[1].as_ref().unwrap(), &json!(2));
        assert!(items[2].is_err());
    }
}
