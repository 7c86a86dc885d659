#![crate_name = "miniftp"]
#![crate_type = "lib"]

//! # miniftp
//!
//! A small, synchronous FTP client implementing the core of RFC 959:
//! login, directory and file management, and ASCII/binary transfers over
//! passive (PASV) or active (PORT) data connections.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use miniftp::FtpSession;
//! use miniftp::TransferType;
//!
//! let mut session = FtpSession::connect("127.0.0.1:21").unwrap();
//! assert!(session.login("test", "test").is_ok());
//!
//! // download a file into any writer
//! let mut dest: Vec<u8> = Vec::new();
//! session
//!     .retrieve("a.bin", TransferType::Binary, &mut dest)
//!     .unwrap();
//!
//! // terminate the session
//! session.quit();
//! ```
//!
//! ## Watching a transfer
//!
//! Long transfers can be observed, and cancelled, through a
//! [`TransferMonitor`]; any `FnMut(u64) -> bool` closure qualifies:
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use miniftp::{FtpSession, TransferType};
//!
//! let mut session = FtpSession::connect("127.0.0.1:21").unwrap();
//! assert!(session.login("test", "test").is_ok());
//! session.set_idle_timeout(Some(Duration::from_secs(5)));
//! session.set_callback_bytes(64 * 1024);
//!
//! let mut monitor = |transferred: u64| {
//!     println!("{transferred} bytes so far");
//!     true // keep going
//! };
//! let mut dest: Vec<u8> = Vec::new();
//! session
//!     .retrieve_with("big.bin", TransferType::Binary, &mut dest, &mut monitor)
//!     .unwrap();
//! session.quit();
//! ```

#![doc(html_playground_url = "https://play.rust-lang.org")]

#[macro_use]
extern crate lazy_regex;
#[macro_use]
extern crate log;

// -- private
mod client;
pub(crate) mod command;
mod regex;
mod status;
#[cfg(test)]
mod test_server;

// -- public
pub mod monitor;
pub mod types;

// -- export
pub use client::{DataChannel, FtpSession, MAX_COMMAND_LEN};
pub use monitor::{IdlePolicy, TransferMonitor};
pub use status::ReplyClass;
pub use types::{FtpError, FtpResult, Mode, Response, TransferType};

// -- test logging
#[cfg(test)]
pub fn log_init() {
    let _ = env_logger::builder().is_test(true).try_init();
}
