//! # Command
//!
//! The set of FTP commands

use std::string::ToString;

use crate::types::TransferType;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Ftp commands with their arguments
pub enum Command {
    /// Change directory to parent directory
    Cdup,
    /// Change working directory
    Cwd(String),
    /// Remove file at specified path
    Dele(String),
    /// List entries at specified path. If path is not provided list entries at current working directory
    List(Option<String>),
    /// Get modification time for file at specified path
    Mdtm(String),
    /// Make directory
    Mkd(String),
    /// Get the machine-processable listing at specified path
    Mlsd(Option<String>),
    /// Get the list of file names at specified path. If path is not provided list entries at current working directory
    Nlst(Option<String>),
    /// Provide login password
    Pass(String),
    /// Passive mode
    Pasv,
    /// Specifies an address and port to which the server should connect (active mode)
    Port(String),
    /// Print working directory
    Pwd,
    /// Quit
    Quit,
    /// Select file to rename
    RenameFrom(String),
    /// Rename selected file to
    RenameTo(String),
    /// Retrieve file
    Retr(String),
    /// Remove directory
    Rmd(String),
    /// Site-specific command
    Site(String),
    /// Get file size of specified path
    Size(String),
    /// Put file at specified path
    Store(String),
    /// Get remote system type
    Syst,
    /// Set transfer type
    Type(TransferType),
    /// Provide user to login as
    User(String),
}

// -- stringify

impl ToString for Command {
    fn to_string(&self) -> String {
        let mut s = match self {
            Self::Cdup => "CDUP".to_string(),
            Self::Cwd(d) => format!("CWD {}", d),
            Self::Dele(f) => format!("DELE {}", f),
            Self::List(p) => p
                .as_deref()
                .map(|x| format!("LIST {}", x))
                .unwrap_or_else(|| "LIST".to_string()),
            Self::Mdtm(p) => format!("MDTM {}", p),
            Self::Mkd(p) => format!("MKD {}", p),
            Self::Mlsd(p) => p
                .as_deref()
                .map(|x| format!("MLSD {}", x))
                .unwrap_or_else(|| "MLSD".to_string()),
            Self::Nlst(p) => p
                .as_deref()
                .map(|x| format!("NLST {}", x))
                .unwrap_or_else(|| "NLST".to_string()),
            Self::Pass(p) => format!("PASS {}", p),
            Self::Pasv => "PASV".to_string(),
            Self::Port(p) => format!("PORT {}", p),
            Self::Pwd => "PWD".to_string(),
            Self::Quit => "QUIT".to_string(),
            Self::RenameFrom(p) => format!("RNFR {}", p),
            Self::RenameTo(p) => format!("RNTO {}", p),
            Self::Retr(p) => format!("RETR {}", p),
            Self::Rmd(p) => format!("RMD {}", p),
            Self::Site(c) => format!("SITE {}", c),
            Self::Size(p) => format!("SIZE {}", p),
            Self::Store(p) => format!("STOR {}", p),
            Self::Syst => "SYST".to_string(),
            Self::Type(t) => format!("TYPE {}", t),
            Self::User(u) => format!("USER {}", u),
        };
        s.push_str("\r\n");
        s
    }
}
