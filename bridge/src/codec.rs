//! Length-delimited framing for the worker channel.
//!
//! Every message is `Content-Length: N\r\n\r\n` followed by exactly `N` bytes
//! of JSON. [`FrameReader`] buffers partial reads until a whole frame is
//! available and hands back the raw body; decoding the body is the protocol
//! layer's job, so a bad body never desynchronizes the stream.
//!
//! Any [`CodecError`] from the reader means the byte stream can no longer be
//! trusted. Callers close the channel and treat it as a crash.

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Maximum frame size (16 MiB). Check results for large workspaces are big.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Longest header line accepted, newline included.
pub const MAX_HEADER_LINE_BYTES: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("unexpected end of stream inside frame headers")]
    TruncatedHeader,
    #[error("frame headers are missing Content-Length")]
    MissingLength,
    #[error("invalid Content-Length value {0:?}")]
    InvalidLength(String),
    #[error("frame header line exceeds {max} bytes")]
    HeaderTooLong { max: usize },
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    Oversized { size: usize, max: usize },
    #[error("failed to serialize frame: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl CodecError {
    fn io(context: &'static str) -> impl FnOnce(std::io::Error) -> Self {
        move |source| Self::Io { context, source }
    }
}

/// Reads length-delimited frames from an async reader.
pub struct FrameReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
        }
    }

    /// Read the next frame body.
    ///
    /// Returns `Ok(None)` on EOF between frames (clean close).
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, CodecError> {
        let Some(content_length) = self.read_headers().await? else {
            return Ok(None);
        };

        if content_length > MAX_FRAME_BYTES {
            return Err(CodecError::Oversized {
                size: content_length,
                max: MAX_FRAME_BYTES,
            });
        }

        let mut body = vec![0u8; content_length];
        self.reader
            .read_exact(&mut body)
            .await
            .map_err(CodecError::io("reading frame body"))?;
        Ok(Some(body))
    }

    async fn read_headers(&mut self) -> Result<Option<usize>, CodecError> {
        let mut content_length: Option<usize> = None;
        let mut line = String::new();
        let mut saw_any_header_bytes = false;

        loop {
            line.clear();
            let bytes_read = (&mut self.reader)
                .take(MAX_HEADER_LINE_BYTES as u64 + 1)
                .read_line(&mut line)
                .await
                .map_err(CodecError::io("reading frame header"))?;
            if bytes_read > MAX_HEADER_LINE_BYTES {
                return Err(CodecError::HeaderTooLong {
                    max: MAX_HEADER_LINE_BYTES,
                });
            }

            if bytes_read == 0 {
                if saw_any_header_bytes {
                    return Err(CodecError::TruncatedHeader);
                }
                return Ok(None);
            }
            saw_any_header_bytes = true;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                break;
            }

            if let Some((key, value)) = trimmed.split_once(':')
                && key.trim().eq_ignore_ascii_case("Content-Length")
            {
                let value = value.trim();
                let len = value
                    .parse::<usize>()
                    .map_err(|_| CodecError::InvalidLength(value.to_string()))?;
                content_length = Some(len);
            }
        }

        content_length.map(Some).ok_or(CodecError::MissingLength)
    }
}

/// Writes length-delimited frames to an async writer.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Serialize `msg` and write it as one frame, flushing afterwards.
    pub async fn write_frame<T: Serialize + ?Sized>(&mut self, msg: &T) -> Result<(), CodecError> {
        let body = serde_json::to_vec(msg)?;
        if body.len() > MAX_FRAME_BYTES {
            return Err(CodecError::Oversized {
                size: body.len(),
                max: MAX_FRAME_BYTES,
            });
        }
        let header = format!("Content-Length: {}\r\n\r\n", body.len());

        self.writer
            .write_all(header.as_bytes())
            .await
            .map_err(CodecError::io("writing frame header"))?;
        self.writer
            .write_all(&body)
            .await
            .map_err(CodecError::io("writing frame body"))?;
        self.writer
            .flush()
            .await
            .map_err(CodecError::io("flushing frame"))?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), CodecError> {
        self.writer
            .shutdown()
            .await
            .map_err(CodecError::io("closing writer"))
    }
}
