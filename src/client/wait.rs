//! # Wait
//!
//! Bounded readiness wait over a TCP stream. This is the single suspension
//! primitive the client uses: wait for readability up to a timeout, then let
//! the caller decide whether to keep waiting.

use std::io;
use std::net::TcpStream;
use std::time::Duration;

/// Wait until `stream` has data (or EOF) to read, up to `timeout`.
///
/// Returns `Ok(true)` when a subsequent read will not block, `Ok(false)` when
/// the timeout elapsed first. The stream's read timeout is left set to
/// `timeout`; callers that need an unbounded read afterwards must clear it.
pub(crate) fn readable(stream: &TcpStream, timeout: Duration) -> io::Result<bool> {
    stream.set_read_timeout(Some(timeout))?;
    let mut probe = [0u8; 1];
    // peek rather than read, so the byte stays for the real receive
    match stream.peek(&mut probe) {
        Ok(_) => Ok(true),
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ) =>
        {
            Ok(false)
        }
        Err(err) => Err(err),
    }
}
