//! Framing of opaque request/response blobs on a byte stream.
//!
//! The hub never interprets payloads. It only needs to know where one message ends.
//! Two framings are supported:
//!
//! - [`HttpFraming`]: HTTP/1.x messages, delimited by the header block and
//!   `Content-Length` (or connection close for responses without one)
//! - [`LengthPrefixedFraming`]: a 4-byte big-endian length followed by the payload
//!
//! Readers take an [`AsyncBufRead`] so bytes pipelined after a message stay buffered
//! for the next call.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::FramingConfig;
use crate::core::TunnelError;

/// Default upper bound on a single frame (16 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Upper bound on an HTTP header block.
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Framing selected for one side of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// HTTP/1.x message framing.
    Http(HttpFraming),
    /// Length-prefixed binary framing.
    LengthPrefixed(LengthPrefixedFraming),
}

impl Framing {
    /// Build a framing from configuration.
    #[must_use]
    pub const fn from_config(kind: FramingConfig, max_frame_bytes: usize) -> Self {
        match kind {
            FramingConfig::Http => Self::Http(HttpFraming { max_frame_bytes }),
            FramingConfig::LengthPrefixed => {
                Self::LengthPrefixed(LengthPrefixedFraming { max_frame_bytes })
            }
        }
    }

    /// Read one frame. `Ok(None)` means the peer closed cleanly between frames.
    ///
    /// # Errors
    ///
    /// [`TunnelError::MalformedFrame`] for bad input, including a peer closing inside a
    /// message head or length prefix. [`TunnelError::FrameTooLarge`] once the frame
    /// passes the size limit. [`TunnelError::Io`] for transport failures, including EOF
    /// inside a body.
    pub async fn read_frame<R>(&self, reader: &mut R) -> Result<Option<Bytes>, TunnelError>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        match self {
            Self::Http(f) => f.read_frame(reader).await,
            Self::LengthPrefixed(f) => f.read_frame(reader).await,
        }
    }

    /// Write one frame and flush.
    ///
    /// # Errors
    ///
    /// [`TunnelError::Io`] on transport failure, [`TunnelError::FrameTooLarge`] if the
    /// payload cannot be length-prefixed.
    pub async fn write_frame<W>(&self, writer: &mut W, frame: &[u8]) -> Result<(), TunnelError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        match self {
            Self::Http(_) => {
                writer.write_all(frame).await?;
                writer.flush().await?;
                Ok(())
            }
            Self::LengthPrefixed(f) => f.write_frame(writer, frame).await,
        }
    }

    /// Frame reporting `err` to a client, when the framing can express one.
    #[must_use]
    pub fn failure_frame(&self, err: &TunnelError) -> Option<Bytes> {
        match self {
            Self::Http(_) => Some(HttpFraming::error_response(err)),
            Self::LengthPrefixed(_) => None,
        }
    }
}

/// HTTP/1.x message framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpFraming {
    max_frame_bytes: usize,
}

impl Default for HttpFraming {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Body delimitation derived from a message head.
#[derive(Debug, PartialEq, Eq)]
enum BodyLength {
    Fixed(usize),
    UntilClose,
}

impl HttpFraming {
    async fn read_frame<R>(&self, reader: &mut R) -> Result<Option<Bytes>, TunnelError>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let head_max = MAX_HEAD_BYTES.min(self.max_frame_bytes);
        let mut buf = Vec::new();
        loop {
            // One byte past the limit is enough to know the head is too large.
            let remaining = (head_max + 1).saturating_sub(buf.len()) as u64;
            let n = (&mut *reader)
                .take(remaining)
                .read_until(b'\n', &mut buf)
                .await?;
            if n == 0 {
                if buf.is_empty() {
                    return Ok(None);
                }
                return Err(TunnelError::MalformedFrame(
                    "connection closed inside message head".into(),
                ));
            }
            if buf.len() > head_max {
                return Err(TunnelError::FrameTooLarge {
                    size: buf.len(),
                    max: head_max,
                });
            }
            if buf.ends_with(b"\r\n\r\n") || buf.ends_with(b"\n\n") {
                break;
            }
            // Tolerate blank lines ahead of the start line.
            if buf == b"\r\n" || buf == b"\n" {
                buf.clear();
            }
        }

        let head_len = buf.len();
        match Self::body_length(&buf)? {
            BodyLength::Fixed(len) => {
                if len > self.max_frame_bytes.saturating_sub(head_len) {
                    return Err(TunnelError::FrameTooLarge {
                        size: head_len.saturating_add(len),
                        max: self.max_frame_bytes,
                    });
                }
                let total = head_len + len;
                buf.resize(total, 0);
                reader.read_exact(&mut buf[head_len..]).await?;
            }
            BodyLength::UntilClose => {
                let limit = (self.max_frame_bytes - head_len) as u64 + 1;
                (&mut *reader).take(limit).read_to_end(&mut buf).await?;
                if buf.len() > self.max_frame_bytes {
                    return Err(TunnelError::FrameTooLarge {
                        size: buf.len(),
                        max: self.max_frame_bytes,
                    });
                }
            }
        }
        Ok(Some(Bytes::from(buf)))
    }

    fn body_length(head: &[u8]) -> Result<BodyLength, TunnelError> {
        let text = std::str::from_utf8(head)
            .map_err(|_| TunnelError::MalformedFrame("message head is not utf-8".into()))?;
        let mut lines = text.lines();
        let start = lines
            .next()
            .ok_or_else(|| TunnelError::MalformedFrame("empty message head".into()))?;

        let status = start
            .strip_prefix("HTTP/")
            .and_then(|rest| rest.split_whitespace().nth(1))
            .map(|code| {
                code.parse::<u16>()
                    .map_err(|_| TunnelError::MalformedFrame(format!("bad status line: {start}")))
            })
            .transpose()?;

        let mut content_length = None;
        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let name = name.trim();
            let value = value.trim();
            if name.eq_ignore_ascii_case("content-length") {
                let len = value.parse::<usize>().map_err(|_| {
                    TunnelError::MalformedFrame(format!("bad content-length: {value}"))
                })?;
                content_length = Some(len);
            } else if name.eq_ignore_ascii_case("transfer-encoding")
                && value.to_ascii_lowercase().contains("chunked")
            {
                return Err(TunnelError::MalformedFrame(
                    "chunked transfer-encoding is not supported".into(),
                ));
            }
        }

        Ok(match (content_length, status) {
            (Some(len), _) => BodyLength::Fixed(len),
            // Requests without a length carry no body.
            (None, None) => BodyLength::Fixed(0),
            (None, Some(code)) if (100..200).contains(&code) || code == 204 || code == 304 => {
                BodyLength::Fixed(0)
            }
            (None, Some(_)) => BodyLength::UntilClose,
        })
    }

    fn error_response(err: &TunnelError) -> Bytes {
        let status = match err {
            TunnelError::Timeout(_) => "504 Gateway Timeout",
            _ => "502 Bad Gateway",
        };
        let body = err.to_string();
        let mut out = BytesMut::with_capacity(128 + body.len());
        out.extend_from_slice(
            format!(
                "HTTP/1.1 {status}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            )
            .as_bytes(),
        );
        out.extend_from_slice(body.as_bytes());
        out.freeze()
    }
}

/// Length-prefixed binary framing (u32 big-endian length, then payload).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthPrefixedFraming {
    max_frame_bytes: usize,
}

impl Default for LengthPrefixedFraming {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl LengthPrefixedFraming {
    async fn read_frame<R>(&self, reader: &mut R) -> Result<Option<Bytes>, TunnelError>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        if reader.fill_buf().await?.is_empty() {
            return Ok(None);
        }
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(TunnelError::MalformedFrame(
                    "connection closed inside length prefix".into(),
                ));
            }
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > self.max_frame_bytes {
            return Err(TunnelError::FrameTooLarge {
                size: len,
                max: self.max_frame_bytes,
            });
        }

        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await?;
        Ok(Some(Bytes::from(buf)))
    }

    async fn write_frame<W>(&self, writer: &mut W, frame: &[u8]) -> Result<(), TunnelError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let len = u32::try_from(frame.len()).map_err(|_| TunnelError::FrameTooLarge {
            size: frame.len(),
            max: u32::MAX as usize,
        })?;
        writer.write_all(&len.to_be_bytes()).await?;
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok(())
    }
}
