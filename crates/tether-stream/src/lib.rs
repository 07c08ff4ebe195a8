#![deny(unsafe_code)]

//! Newline-delimited JSON framing for byte-stream transports.
//!
//! The tether codec is JSON text, and `serde_json` never emits a raw
//! newline inside a compact encoding, so one frame per line is a valid
//! framing. This module is generic over the transport type - it works with
//! any `AsyncRead + AsyncWrite + Unpin`, including pipes to a child
//! process, Unix domain sockets, and in-memory duplex streams.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use tether_session::FrameTransport;
use tether_wire::{decode_frame, encode_frame, Frame};

const READ_CHUNK: usize = 4096;
const COMPACT_THRESHOLD: usize = 64 * 1024;

/// A line-framed connection over an async byte stream.
///
/// Each frame is one line of compact JSON terminated by `\n`. Blank lines
/// are tolerated and skipped. Decode failures surface as
/// `io::ErrorKind::InvalidData`, which the session pump escalates to a
/// protocol error.
pub struct JsonLinesFramed<S> {
    stream: S,
    buf: Vec<u8>,
    unread_start: usize,
}

impl<S> JsonLinesFramed<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: Vec::new(),
            unread_start: 0,
        }
    }

    /// Consume the framed wrapper and return the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    fn compact(&mut self) {
        if self.unread_start == self.buf.len() {
            self.buf.clear();
            self.unread_start = 0;
        } else if self.unread_start >= COMPACT_THRESHOLD {
            self.buf.drain(..self.unread_start);
            self.unread_start = 0;
        }
    }

    /// Pop the next complete line out of the buffer, if any.
    fn take_line(&mut self) -> Option<Vec<u8>> {
        let rel = self.buf[self.unread_start..]
            .iter()
            .position(|b| *b == b'\n')?;
        let end = self.unread_start + rel;
        let line = self.buf[self.unread_start..end].to_vec();
        self.unread_start = end + 1;
        self.compact();
        Some(line)
    }

    fn decode_line(line: &[u8]) -> io::Result<Frame> {
        let text = std::str::from_utf8(line)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("utf-8: {e}")))?;
        decode_frame(text)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }
}

impl<S> JsonLinesFramed<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Send one frame as a line of JSON text.
    pub async fn send(&mut self, frame: &Frame) -> io::Result<()> {
        let mut text = encode_frame(frame);
        text.push('\n');
        self.stream.write_all(text.as_bytes()).await?;
        self.stream.flush().await
    }

    /// Receive the next frame, blocking until one arrives or the stream
    /// ends. `Ok(None)` means a clean end of stream.
    pub async fn recv(&mut self) -> io::Result<Option<Frame>> {
        loop {
            while let Some(line) = self.take_line() {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Self::decode_line(&line).map(Some);
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                let trailing = self.buf.len() - self.unread_start;
                if trailing != 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("eof with {trailing} trailing bytes and no line terminator"),
                    ));
                }
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

impl<S> FrameTransport for JsonLinesFramed<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn post(&mut self, frame: &Frame) -> io::Result<()> {
        JsonLinesFramed::send(self, frame).await
    }

    async fn recv(&mut self) -> io::Result<Option<Frame>> {
        JsonLinesFramed::recv(self).await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}
