//! `Content-Length: N\r\n\r\n{json}` framing over a byte stream.
//!
//! Used in both directions between the dispatcher and a host: the
//! dispatcher writes to the host's stdin and reads its stdout.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Maximum frame size (8 MiB). Task reports can carry captured console
/// output, so this is generous.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("i/o error while {op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("unexpected EOF while reading headers")]
    TruncatedHeaders,
    #[error("missing Content-Length header")]
    MissingLength,
    #[error("invalid Content-Length value: {0:?}")]
    InvalidLength(String),
    #[error("Content-Length {len} exceeds maximum {max}", max = MAX_FRAME_BYTES)]
    TooLarge { len: usize },
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl CodecError {
    /// The frame was consumed whole but its body did not decode. The stream
    /// is still in sync and the next frame can be read.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }

    fn io(op: &'static str) -> impl FnOnce(std::io::Error) -> Self {
        move |source| Self::Io { op, source }
    }
}

pub struct FrameReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
        }
    }

    /// Read and decode the next frame.
    ///
    /// `Ok(None)` is a clean EOF between frames.
    pub async fn read_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>, CodecError> {
        let Some(len) = self.read_headers().await? else {
            return Ok(None);
        };
        if len > MAX_FRAME_BYTES {
            return Err(CodecError::TooLarge { len });
        }

        let mut body = vec![0u8; len];
        self.reader
            .read_exact(&mut body)
            .await
            .map_err(CodecError::io("reading frame body"))?;

        Ok(Some(serde_json::from_slice(&body)?))
    }

    async fn read_headers(&mut self) -> Result<Option<usize>, CodecError> {
        let mut content_length = None;
        let mut line = String::new();
        let mut saw_header_bytes = false;

        loop {
            line.clear();
            let read = self
                .reader
                .read_line(&mut line)
                .await
                .map_err(CodecError::io("reading header line"))?;
            if read == 0 {
                if saw_header_bytes {
                    return Err(CodecError::TruncatedHeaders);
                }
                return Ok(None);
            }
            saw_header_bytes = true;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                break;
            }
            if let Some((key, value)) = trimmed.split_once(':')
                && key.trim().eq_ignore_ascii_case("Content-Length")
            {
                let value = value.trim();
                content_length = Some(
                    value
                        .parse::<usize>()
                        .map_err(|_| CodecError::InvalidLength(value.to_string()))?,
                );
            }
        }

        content_length.map(Some).ok_or(CodecError::MissingLength)
    }
}

pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_frame<T: Serialize>(&mut self, msg: &T) -> Result<(), CodecError> {
        let body = serde_json::to_vec(msg)?;
        if body.len() > MAX_FRAME_BYTES {
            return Err(CodecError::TooLarge { len: body.len() });
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
            .map_err(CodecError::io("flushing frame"))
    }
}
