//! Length-prefixed frame encoding/decoding
//!
//! Wire format: [6 ASCII decimal digits, zero-padded][JSON envelope]
//! No delimiter between frames. A single read may hold several frames or
//! split one across reads, so inbound bytes go through a [`FrameBuffer`].

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Width of the length header
pub const LENGTH_DIGITS: usize = 6;

/// Largest payload a 6-digit header can describe
pub const MAX_FRAME_SIZE: usize = 999_999;

/// Prefix a payload with its 6-digit length
pub fn wrap_frame(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge(payload.len()));
    }
    let mut out = Vec::with_capacity(LENGTH_DIGITS + payload.len());
    out.extend_from_slice(format!("{:06}", payload.len()).as_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Result of splitting a buffer into frames
#[derive(Debug)]
pub struct Unwrapped<'a> {
    /// Complete payloads, in wire order
    pub frames: Vec<&'a [u8]>,
    /// Bytes of an incomplete trailing frame, kept for the next read
    pub rest: &'a [u8],
    /// Set when a length header was not decimal; `rest` is then unusable
    pub error: Option<Error>,
}

/// Split `buf` into as many complete frames as it holds
pub fn unwrap_frames(buf: &[u8]) -> Unwrapped<'_> {
    let mut frames = Vec::new();
    let mut offset = 0;

    while buf.len() - offset >= LENGTH_DIGITS {
        let header = &buf[offset..offset + LENGTH_DIGITS];
        let declared = match parse_length(header) {
            Ok(len) => len,
            Err(e) => {
                return Unwrapped {
                    frames,
                    rest: &buf[offset..],
                    error: Some(e),
                };
            }
        };

        let start = offset + LENGTH_DIGITS;
        if declared > buf.len() - start {
            break;
        }
        frames.push(&buf[start..start + declared]);
        offset = start + declared;
    }

    Unwrapped {
        frames,
        rest: &buf[offset..],
        error: None,
    }
}

fn parse_length(header: &[u8]) -> Result<usize> {
    if !header.iter().all(u8::is_ascii_digit) {
        return Err(Error::MalformedLength(
            String::from_utf8_lossy(header).into_owned(),
        ));
    }
    // Six ASCII digits always fit
    Ok(header
        .iter()
        .fold(0usize, |acc, d| acc * 10 + usize::from(d - b'0')))
}

/// Receive buffer for one messaging session
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes and take every complete frame out.
    ///
    /// A malformed length header discards everything buffered after the
    /// last good frame and is reported as the error half of the tuple.
    pub fn push(&mut self, bytes: &[u8]) -> (Vec<Vec<u8>>, Option<Error>) {
        self.buf.extend_from_slice(bytes);

        let unwrapped = unwrap_frames(&self.buf);
        let frames: Vec<Vec<u8>> = unwrapped.frames.iter().map(|f| f.to_vec()).collect();
        let error = unwrapped.error;
        let consumed = self.buf.len() - unwrapped.rest.len();

        if error.is_some() {
            self.buf.clear();
        } else {
            self.buf.drain(..consumed);
        }
        (frames, error)
    }

    /// Describe the partial frame currently held, if its header is complete
    pub fn incomplete(&self) -> Option<Error> {
        if self.buf.len() < LENGTH_DIGITS {
            return None;
        }
        let declared = parse_length(&self.buf[..LENGTH_DIGITS]).ok()?;
        Some(Error::FrameIncomplete {
            declared,
            available: self.buf.len() - LENGTH_DIGITS,
        })
    }

    /// Number of bytes waiting for the rest of their frame
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Write one framed payload to a stream
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<usize> {
    let frame = wrap_frame(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(frame.len())
}
