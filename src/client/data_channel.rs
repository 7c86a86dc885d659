//! # Data Channel
//!
//! A transfer-scoped connection carrying the file or listing bytes for one
//! transfer. A channel is always created by, and finished through, its parent
//! [`FtpSession`]; while it is alive the session is mutably borrowed, so at
//! most one data channel can exist per control connection.

use std::borrow::Cow;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};

use super::line_reader::RecordReader;
use super::wait;
use super::FtpSession;
use crate::monitor::{IdlePolicy, TransferMonitor};
use crate::status::ReplyClass;
use crate::types::{FtpError, FtpResult, TransferType};

/// Fixed transfer direction of a data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Read,
    Write,
}

/// Data connection for a single transfer.
///
/// Reads and writes are only valid in the channel's direction. In ASCII mode
/// the channel translates line endings on both paths; in binary mode bytes
/// pass through untouched. Once the payload has been moved, call
/// [`DataChannel::finish`] to close the connection and consume the final
/// transfer reply on the control channel; that reply is the authoritative
/// outcome of the transfer.
pub struct DataChannel<'s, 'm> {
    session: &'s mut FtpSession,
    stream: Option<TcpStream>,
    direction: Direction,
    mode: TransferType,
    reader: Option<RecordReader>,
    policy: IdlePolicy,
    monitor: Option<&'m mut dyn TransferMonitor>,
    transferred: u64,
    since_callback: u64,
}

impl<'s, 'm> DataChannel<'s, 'm> {
    pub(crate) fn new(
        session: &'s mut FtpSession,
        stream: TcpStream,
        direction: Direction,
        mode: TransferType,
        monitor: Option<&'m mut dyn TransferMonitor>,
    ) -> FtpResult<Self> {
        let policy = session.idle_policy();
        if let Some(timeout) = policy.idle_timeout {
            stream
                .set_write_timeout(Some(timeout))
                .map_err(FtpError::ConnectionError)?;
        }
        // line framing is only needed when reading ASCII data
        let reader = (mode == TransferType::Ascii && direction == Direction::Read)
            .then(RecordReader::new);
        // an inert policy means the monitor could never fire; don't carry it
        let monitor = if policy.is_active() { monitor } else { None };
        Ok(Self {
            session,
            stream: Some(stream),
            direction,
            mode,
            reader,
            policy,
            monitor,
            transferred: 0,
            since_callback: 0,
        })
    }

    /// Total bytes moved through this channel so far.
    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// Read up to `buf.len()` bytes from the channel. Returns `Ok(0)` at end
    /// of stream. In ASCII mode at most one (possibly truncated) line is
    /// returned per call, with `\r\n` normalized to `\n`.
    pub fn read(&mut self, buf: &mut [u8]) -> FtpResult<usize> {
        if self.direction != Direction::Read {
            return Err(FtpError::WrongDirection);
        }
        let received = {
            let Self {
                ref mut stream,
                ref mut reader,
                ref mut monitor,
                policy,
                transferred,
                ..
            } = *self;
            let Some(stream) = stream.as_mut() else {
                return Err(FtpError::ConnectionError(
                    std::io::ErrorKind::NotConnected.into(),
                ));
            };
            let mut recv = |chunk: &mut [u8]| -> FtpResult<usize> {
                if let Some(timeout) = policy.idle_timeout {
                    loop {
                        if wait::readable(stream, timeout).map_err(FtpError::ConnectionError)? {
                            break;
                        }
                        match monitor.as_mut() {
                            Some(monitor) => {
                                if !monitor.on_progress(transferred) {
                                    return Err(FtpError::Aborted);
                                }
                            }
                            None => {
                                return Err(FtpError::ConnectionError(
                                    std::io::ErrorKind::TimedOut.into(),
                                ));
                            }
                        }
                    }
                }
                stream.read(chunk).map_err(FtpError::ConnectionError)
            };
            match reader {
                Some(reader) => reader.read_line(buf, &mut recv)?,
                None => recv(buf)?,
            }
        };
        if received > 0 {
            self.account_read(received)?;
        }
        Ok(received)
    }

    /// Write the whole of `buf` to the channel. In ASCII mode every `\n` not
    /// already preceded by `\r` is expanded to `\r\n` on the wire. Returns
    /// the number of payload bytes accepted, which is always `buf.len()` on
    /// success; anything short surfaces as an error.
    pub fn write(&mut self, buf: &[u8]) -> FtpResult<usize> {
        if self.direction != Direction::Write {
            return Err(FtpError::WrongDirection);
        }
        let payload: Cow<[u8]> = match self.mode {
            TransferType::Ascii => Cow::Owned(ascii_expand(buf)),
            TransferType::Binary => Cow::Borrowed(buf),
        };
        self.send_all(&payload)?;
        self.account_write(buf.len());
        Ok(buf.len())
    }

    fn send_all(&mut self, mut data: &[u8]) -> FtpResult<()> {
        let Self {
            ref mut stream,
            ref mut monitor,
            transferred,
            ..
        } = *self;
        let Some(stream) = stream.as_mut() else {
            return Err(FtpError::ConnectionError(
                std::io::ErrorKind::NotConnected.into(),
            ));
        };
        while !data.is_empty() {
            match stream.write(data) {
                Ok(0) => {
                    return Err(FtpError::ConnectionError(
                        std::io::ErrorKind::WriteZero.into(),
                    ));
                }
                Ok(sent) => data = &data[sent..],
                Err(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    match monitor.as_mut() {
                        Some(monitor) => {
                            if !monitor.on_progress(transferred) {
                                return Err(FtpError::Aborted);
                            }
                        }
                        None => return Err(FtpError::ConnectionError(err)),
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => return Err(FtpError::ConnectionError(err)),
            }
        }
        Ok(())
    }

    fn account_read(&mut self, received: usize) -> FtpResult<()> {
        self.transferred += received as u64;
        if self.policy.callback_bytes == 0 {
            return Ok(());
        }
        if let Some(monitor) = self.monitor.as_mut() {
            self.since_callback += received as u64;
            if self.since_callback >= self.policy.callback_bytes {
                self.since_callback = 0;
                if !monitor.on_progress(self.transferred) {
                    return Err(FtpError::Aborted);
                }
            }
        }
        Ok(())
    }

    fn account_write(&mut self, sent: usize) {
        self.transferred += sent as u64;
        if self.policy.callback_bytes == 0 {
            return;
        }
        if let Some(monitor) = self.monitor.as_mut() {
            self.since_callback += sent as u64;
            if self.since_callback >= self.policy.callback_bytes {
                self.since_callback = 0;
                // informational on the write path: cancellation only applies
                // to idle waits here, not to the byte-threshold hook
                let _ = monitor.on_progress(self.transferred);
            }
        }
    }

    /// Close the data connection and consume the final transfer reply.
    ///
    /// The reply read is skipped when the control channel already recorded a
    /// 4xx/5xx condition for this transfer. Returns the total byte count on
    /// success.
    pub fn finish(mut self) -> FtpResult<u64> {
        self.close_stream();
        debug!("Data channel closed after {} bytes", self.transferred);
        if !self.session.last_reply_was_negative() {
            // the completion wait stays cancellable through the same monitor
            let monitor = self.monitor.take();
            self.session.read_response_with(
                ReplyClass::PositiveCompletion,
                monitor,
                self.transferred,
            )?;
        }
        Ok(self.transferred)
    }

    fn close_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for DataChannel<'_, '_> {
    fn drop(&mut self) {
        self.close_stream();
    }
}

/// Expand bare `\n` bytes into `\r\n` for ASCII-mode writes.
fn ascii_expand(buf: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(buf.len() + buf.len() / 8);
    let mut last = 0u8;
    for &byte in buf {
        if byte == b'\n' && last != b'\r' {
            out.push(b'\r');
        }
        out.push(byte);
        last = byte;
    }
    out
}
