//! # Types
//!
//! The set of types shared across the FTP client

use std::fmt;

use thiserror::Error;

use super::status::ReplyClass;

/// A shorthand for a Result whose error type is always an FtpError.
pub type FtpResult<T> = std::result::Result<T, FtpError>;

/// `FtpError` is a library-global error type to describe the different kinds of
/// errors that might occur while using FTP.
#[derive(Debug, Error)]
pub enum FtpError {
    /// Connection error
    #[error("Connection error: {0}")]
    ConnectionError(std::io::Error),
    /// Unexpected response from remote. The command expected a certain response, but got another one.
    /// This means the ftp server refused to perform your request or there was an error while processing it.
    /// Contains the response data.
    #[error("Invalid response: {0}")]
    UnexpectedResponse(Response),
    /// The response syntax is invalid
    #[error("Response contains an invalid syntax")]
    BadResponse,
    /// The command exceeds the maximum length accepted on the control channel
    #[error("Command exceeds the maximum length of {0} bytes")]
    CommandTooLong(usize),
    /// Read on a write channel or write on a read channel
    #[error("Data channel is not open in the requested direction")]
    WrongDirection,
    /// The transfer monitor asked to stop the transfer
    #[error("Transfer aborted by the progress monitor")]
    Aborted,
    /// The data connection could not be established
    #[error("Data connection failed: {0}")]
    DataConnection(String),
    /// Error on the local file backing a transfer
    #[error("Local file error: {0}")]
    FileError(std::io::Error),
}

/// Defines a response from the ftp server.
///
/// `body` holds the full reply text, including the code prefix and every
/// line of a multi-line reply.
#[derive(Clone, Debug, Error)]
pub struct Response {
    pub code: u32,
    pub body: String,
}

impl Response {
    /// Instantiates a new `Response`
    pub fn new(code: u32, body: impl Into<String>) -> Self {
        Self {
            code,
            body: body.into(),
        }
    }

    /// The reply class for this response's code.
    pub fn class(&self) -> Option<ReplyClass> {
        ReplyClass::of(self.code)
    }

    /// The free text of the first reply line, with the code prefix stripped.
    pub fn message(&self) -> &str {
        self.body
            .lines()
            .next()
            .and_then(|line| line.get(4..))
            .unwrap_or("")
            .trim_end()
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message())
    }
}

/// Connection mode for the data channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// The client listens and the server connects back (PORT)
    Active,
    /// The client connects out to the address announced by the server (PASV)
    Passive,
}

/// Transfer type used in the `TYPE` command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    /// ASCII text; line endings are translated on the wire (`\n` <-> `\r\n`)
    Ascii,
    /// Image/binary; bytes pass through untouched
    Binary,
}

impl fmt::Display for TransferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                TransferType::Ascii => "A",
                TransferType::Binary => "I",
            }
        )
    }
}
