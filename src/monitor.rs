//! # Monitor
//!
//! Progress reporting and cancellation hooks for data transfers

use std::time::Duration;

/// Caller hook invoked while a data transfer is in flight.
///
/// The hook fires in two situations:
///
/// - an idle wait exceeded the configured [`IdlePolicy::idle_timeout`]
///   slice, on the data socket or on the control channel while the
///   transfer-completion reply is pending; returning `false` abandons the
///   wait and aborts the transfer with [`crate::FtpError::Aborted`];
/// - the number of bytes moved since the previous invocation crossed
///   [`IdlePolicy::callback_bytes`]; on downloads a `false` return aborts the
///   transfer, on uploads the return value is ignored and the hook is purely
///   informational.
///
/// `transferred` is the cumulative byte count for the current transfer.
/// The monitor is borrowed for the duration of a single transfer call and is
/// never stored beyond it.
pub trait TransferMonitor {
    fn on_progress(&mut self, transferred: u64) -> bool;
}

/// Any `FnMut(u64) -> bool` closure can serve as a transfer monitor.
impl<F> TransferMonitor for F
where
    F: FnMut(u64) -> bool,
{
    fn on_progress(&mut self, transferred: u64) -> bool {
        self(transferred)
    }
}

/// Idle and progress policy applied to data connections.
///
/// The policy is configured on the [`crate::FtpSession`] and copied by value
/// into each data channel when it is opened; changing it afterwards does not
/// affect a channel that is already open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdlePolicy {
    /// How long a blocking data-socket wait may last before the monitor is
    /// given a chance to run. `None` waits without bound.
    pub idle_timeout: Option<Duration>,
    /// Invoke the monitor once this many bytes moved since the last
    /// invocation. `0` disables byte-based reporting.
    pub callback_bytes: u64,
}

impl IdlePolicy {
    /// Whether the policy asks for any monitoring at all.
    pub fn is_active(&self) -> bool {
        self.idle_timeout.is_some() || self.callback_bytes > 0
    }
}
