//! # Record Reader
//!
//! CRLF-aware line framing over a raw byte stream. Used for control-channel
//! replies and for ASCII-mode data reads, which share the same normalization
//! rules.

use crate::types::{FtpError, FtpResult};

/// Size of the receive chunks and of the transfer pump buffers.
pub(crate) const BUFFER_SIZE: usize = 1024;

/// Frames raw bytes into `\n`-terminated lines.
///
/// Bytes are pulled from the stream in [`BUFFER_SIZE`] chunks and kept in an
/// internal buffer; already-buffered bytes are never fetched twice. The
/// reader holds per-connection state and must not be shared between two
/// in-flight reads.
#[derive(Debug, Default)]
pub(crate) struct RecordReader {
    buf: Vec<u8>,
    pos: usize,
}

impl RecordReader {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(BUFFER_SIZE),
            pos: 0,
        }
    }

    /// Read one line into `out`, collapsing a trailing `\r\n` into a bare
    /// `\n`. Returns the number of bytes written:
    ///
    /// - `Ok(0)` signals end of stream with nothing buffered;
    /// - a partial line at end of stream is returned once, unterminated;
    /// - a line longer than `out` is returned truncated, the remainder stays
    ///   buffered for the next call.
    ///
    /// `recv` performs one receive into the supplied chunk; callers inject
    /// their waiting policy (watchdog, plain blocking read) through it.
    pub fn read_line<F>(&mut self, out: &mut [u8], recv: &mut F) -> FtpResult<usize>
    where
        F: FnMut(&mut [u8]) -> FtpResult<usize>,
    {
        if out.is_empty() {
            return Ok(0);
        }
        let mut len = 0;
        let mut eof = false;
        loop {
            while self.pos < self.buf.len() && len < out.len() {
                let byte = self.buf[self.pos];
                self.pos += 1;
                out[len] = byte;
                len += 1;
                if byte == b'\n' {
                    if len >= 2 && out[len - 2] == b'\r' {
                        out[len - 2] = b'\n';
                        len -= 1;
                    }
                    return Ok(len);
                }
            }
            if len == out.len() {
                // caller's buffer is full: hand back the truncated line
                return Ok(len);
            }
            if self.pos == self.buf.len() {
                self.buf.clear();
                self.pos = 0;
            }
            if eof {
                return Ok(len);
            }
            let mut chunk = [0u8; BUFFER_SIZE];
            let received = recv(&mut chunk)?;
            if received == 0 {
                eof = true;
            } else {
                self.buf.extend_from_slice(&chunk[..received]);
            }
        }
    }

    /// Read one line as with [`Self::read_line`], but fail on a clean end of
    /// stream. Control-channel replies are never legitimately truncated by
    /// the peer closing the connection.
    pub fn read_line_expected<F>(&mut self, out: &mut [u8], recv: &mut F) -> FtpResult<usize>
    where
        F: FnMut(&mut [u8]) -> FtpResult<usize>,
    {
        match self.read_line(out, recv)? {
            0 => Err(FtpError::ConnectionError(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by server",
            ))),
            n => Ok(n),
        }
    }
}
