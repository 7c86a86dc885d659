//! # Client
//!
//! RFC 959 FTP client. [`FtpSession`] owns the control connection and issues
//! commands; bulk bytes move over per-transfer [`DataChannel`]s negotiated
//! with PASV or PORT.

mod data_channel;
mod line_reader;
mod wait;

use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

pub use self::data_channel::DataChannel;
use self::data_channel::Direction;
use self::line_reader::{RecordReader, BUFFER_SIZE};
use crate::command::Command;
use crate::monitor::{IdlePolicy, TransferMonitor};
use crate::regex::{MDTM_RE, PASV_PORT_RE, SIZE_RE};
use crate::status::ReplyClass;
use crate::types::{FtpError, FtpResult, Mode, Response, TransferType};

/// Longest command line accepted on the control channel, CRLF included.
pub const MAX_COMMAND_LEN: usize = 512;

/// Size of the scratch buffer a single reply line is framed into.
const RESPONSE_LINE_SIZE: usize = 1024;

/// How long to wait for the server to connect back in active mode.
const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll interval while waiting for an active-mode data connection.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// An FTP session over a connected control channel.
///
/// A session starts in passive mode with no idle policy; both can be changed
/// at any time between transfers. At most one data channel can be open per
/// session, which the borrow on [`DataChannel`] enforces.
#[derive(Debug)]
pub struct FtpSession {
    stream: TcpStream,
    reader: RecordReader,
    mode: Mode,
    policy: IdlePolicy,
    accept_timeout: Duration,
    last_response: String,
    welcome_msg: Option<String>,
}

impl FtpSession {
    /// Creates an FTP session to the remote server, consuming its greeting.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> FtpResult<Self> {
        debug!("Connecting to server");
        TcpStream::connect(addr)
            .map_err(FtpError::ConnectionError)
            .and_then(Self::connect_with_stream)
    }

    /// Like [`FtpSession::connect`], but bounds the TCP connect by `timeout`.
    pub fn connect_timeout(addr: SocketAddr, timeout: Duration) -> FtpResult<Self> {
        debug!("Connecting to server (timeout: {}ms)", timeout.as_millis());
        TcpStream::connect_timeout(&addr, timeout)
            .map_err(FtpError::ConnectionError)
            .and_then(Self::connect_with_stream)
    }

    /// Builds a session from an already connected control stream and reads
    /// the server greeting. On a non-2xx greeting the stream is dropped.
    pub fn connect_with_stream(stream: TcpStream) -> FtpResult<Self> {
        debug!("Established connection with server");
        let mut session = Self {
            stream,
            reader: RecordReader::new(),
            mode: Mode::Passive,
            policy: IdlePolicy::default(),
            accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
            last_response: String::new(),
            welcome_msg: None,
        };
        let response = session.read_response(ReplyClass::PositiveCompletion)?;
        debug!("Server READY; greeting: {}", response);
        session.welcome_msg = Some(response.body);
        Ok(session)
    }

    /// Log in to the FTP server. Servers that accept the user without a
    /// password reply 2xx to `USER` and the `PASS` step is skipped.
    pub fn login<S: AsRef<str>>(&mut self, user: S, password: S) -> FtpResult<()> {
        debug!("Signing in with user '{}'", user.as_ref());
        self.perform(Command::User(user.as_ref().to_string()))?;
        let response = self.read_reply()?;
        match response.class() {
            Some(ReplyClass::PositiveCompletion) => {
                debug!("Logged in without password");
                Ok(())
            }
            Some(ReplyClass::PositiveIntermediate) => {
                debug!("Password is required");
                self.perform(Command::Pass(password.as_ref().to_string()))?;
                self.read_response(ReplyClass::PositiveCompletion)?;
                debug!("Login OK");
                Ok(())
            }
            _ => Err(FtpError::UnexpectedResponse(response)),
        }
    }

    /// End the session. The QUIT exchange is best effort; the control
    /// connection is torn down regardless of what the server answers.
    pub fn quit(mut self) {
        debug!("Quitting session");
        if self.perform(Command::Quit).is_ok() {
            let _ = self.read_reply();
        }
    }

    // -- configuration

    /// Set the mode (active or passive) for the data channels opened next.
    pub fn set_mode(&mut self, mode: Mode) {
        debug!("Changed mode to {:?}", mode);
        self.mode = mode;
    }

    /// Set how long a data-socket wait may block before the transfer monitor
    /// runs. `None` (the default) waits without bound.
    pub fn set_idle_timeout(&mut self, timeout: Option<Duration>) {
        self.policy.idle_timeout = timeout;
    }

    /// Invoke the transfer monitor every `bytes` bytes moved. `0` (the
    /// default) disables byte-based reporting.
    pub fn set_callback_bytes(&mut self, bytes: u64) {
        self.policy.callback_bytes = bytes;
    }

    /// Set how long to wait for the server to connect back in active mode.
    pub fn set_accept_timeout(&mut self, timeout: Duration) {
        self.accept_timeout = timeout;
    }

    /// The idle policy currently configured for new data channels.
    pub fn idle_policy(&self) -> IdlePolicy {
        self.policy
    }

    /// Full text of the last reply read on the control channel.
    pub fn last_response(&self) -> &str {
        &self.last_response
    }

    /// Returns the welcome message sent by the server at connect time.
    pub fn get_welcome_msg(&self) -> Option<&str> {
        self.welcome_msg.as_deref()
    }

    // -- directories

    /// Change the current directory to the path specified.
    pub fn cwd<S: AsRef<str>>(&mut self, path: S) -> FtpResult<()> {
        debug!("Changing working directory to {}", path.as_ref());
        self.perform(Command::Cwd(path.as_ref().to_string()))?;
        self.read_response(ReplyClass::PositiveCompletion)
            .map(|_| ())
    }

    /// Move the current directory to the parent directory.
    pub fn cdup(&mut self) -> FtpResult<()> {
        debug!("Going to parent directory");
        self.perform(Command::Cdup)?;
        self.read_response(ReplyClass::PositiveCompletion)
            .map(|_| ())
    }

    /// Gets the current directory. The path is the quoted token of the 257
    /// reply.
    pub fn pwd(&mut self) -> FtpResult<String> {
        debug!("Getting working directory");
        self.perform(Command::Pwd)?;
        let response = self.read_response(ReplyClass::PositiveCompletion)?;
        let path = {
            let body = response.body.as_str();
            match (body.find('"'), body.rfind('"')) {
                (Some(begin), Some(end)) if begin < end => Some(body[begin + 1..end].to_string()),
                _ => None,
            }
        };
        path.ok_or(FtpError::UnexpectedResponse(response))
    }

    /// Create a new directory on the remote server.
    pub fn mkdir<S: AsRef<str>>(&mut self, pathname: S) -> FtpResult<()> {
        debug!("Creating directory at {}", pathname.as_ref());
        self.perform(Command::Mkd(pathname.as_ref().to_string()))?;
        self.read_response(ReplyClass::PositiveCompletion)
            .map(|_| ())
    }

    /// Remove the remote directory at `pathname`.
    pub fn rmdir<S: AsRef<str>>(&mut self, pathname: S) -> FtpResult<()> {
        debug!("Removing directory {}", pathname.as_ref());
        self.perform(Command::Rmd(pathname.as_ref().to_string()))?;
        self.read_response(ReplyClass::PositiveCompletion)
            .map(|_| ())
    }

    // -- files

    /// Remove the remote file at `pathname`.
    pub fn rm<S: AsRef<str>>(&mut self, pathname: S) -> FtpResult<()> {
        debug!("Removing file {}", pathname.as_ref());
        self.perform(Command::Dele(pathname.as_ref().to_string()))?;
        self.read_response(ReplyClass::PositiveCompletion)
            .map(|_| ())
    }

    /// Rename the file from_name to to_name. The two-step RNFR/RNTO exchange
    /// is performed atomically from the caller's point of view.
    pub fn rename<S: AsRef<str>>(&mut self, from_name: S, to_name: S) -> FtpResult<()> {
        debug!(
            "Renaming '{}' to '{}'",
            from_name.as_ref(),
            to_name.as_ref()
        );
        self.perform(Command::RenameFrom(from_name.as_ref().to_string()))?;
        self.read_response(ReplyClass::PositiveIntermediate)?;
        self.perform(Command::RenameTo(to_name.as_ref().to_string()))?;
        self.read_response(ReplyClass::PositiveCompletion)
            .map(|_| ())
    }

    /// Size of the remote file at `pathname`. The transfer type is switched
    /// to binary first, so the reported size matches what a binary retrieval
    /// would move.
    pub fn size<S: AsRef<str>>(&mut self, pathname: S) -> FtpResult<usize> {
        debug!("Getting file size for {}", pathname.as_ref());
        self.transfer_type(TransferType::Binary)?;
        self.perform(Command::Size(pathname.as_ref().to_string()))?;
        let response = self.read_response(ReplyClass::PositiveCompletion)?;
        match SIZE_RE
            .captures(&response.body)
            .and_then(|caps| caps[1].parse::<usize>().ok())
        {
            Some(size) => Ok(size),
            None => Err(FtpError::BadResponse),
        }
    }

    /// Retrieve the modification time of the remote file at `pathname`.
    pub fn mdtm<S: AsRef<str>>(&mut self, pathname: S) -> FtpResult<NaiveDateTime> {
        debug!("Getting modification time for {}", pathname.as_ref());
        self.perform(Command::Mdtm(pathname.as_ref().to_string()))?;
        let response = self.read_response(ReplyClass::PositiveCompletion)?;
        match MDTM_RE.captures(&response.body) {
            Some(caps) => {
                let (year, month, day) = (
                    caps[1].parse::<i32>().unwrap(),
                    caps[2].parse::<u32>().unwrap(),
                    caps[3].parse::<u32>().unwrap(),
                );
                let (hour, minute, second) = (
                    caps[4].parse::<u32>().unwrap(),
                    caps[5].parse::<u32>().unwrap(),
                    caps[6].parse::<u32>().unwrap(),
                );

                let date = match NaiveDate::from_ymd_opt(year, month, day) {
                    Some(d) => d,
                    None => return Err(FtpError::BadResponse),
                };
                let time = match NaiveTime::from_hms_opt(hour, minute, second) {
                    Some(t) => t,
                    None => return Err(FtpError::BadResponse),
                };
                Ok(NaiveDateTime::new(date, time))
            }
            None => Err(FtpError::BadResponse),
        }
    }

    // -- miscellaneous

    /// The name of the remote operating system, the first token of the SYST
    /// reply (e.g. `UNIX`).
    pub fn syst(&mut self) -> FtpResult<String> {
        debug!("Getting remote system type");
        self.perform(Command::Syst)?;
        let response = self.read_response(ReplyClass::PositiveCompletion)?;
        let name = response
            .message()
            .split(' ')
            .next()
            .unwrap_or_default()
            .to_string();
        if name.is_empty() {
            Err(FtpError::UnexpectedResponse(response))
        } else {
            Ok(name)
        }
    }

    /// Execute a SITE command and return the full (possibly multi-line)
    /// reply. The argument is passed through verbatim.
    pub fn site<S: AsRef<str>>(&mut self, command: S) -> FtpResult<Response> {
        debug!("SITE {}", command.as_ref());
        self.perform(Command::Site(command.as_ref().to_string()))?;
        self.read_response(ReplyClass::PositiveCompletion)
    }

    /// Set the transfer type for the data channels opened next.
    pub fn transfer_type(&mut self, file_type: TransferType) -> FtpResult<()> {
        debug!("Setting transfer type {}", file_type);
        self.perform(Command::Type(file_type))?;
        self.read_response(ReplyClass::PositiveCompletion)
            .map(|_| ())
    }

    // -- transfers

    /// Download the remote file at `path` into `dest`, returning the number
    /// of bytes written to it.
    pub fn retrieve<S, W>(
        &mut self,
        path: S,
        transfer_type: TransferType,
        dest: &mut W,
    ) -> FtpResult<u64>
    where
        S: AsRef<str>,
        W: Write + ?Sized,
    {
        self.retrieve_impl(path.as_ref(), transfer_type, dest, None)
    }

    /// Like [`FtpSession::retrieve`], reporting progress through `monitor`.
    pub fn retrieve_with<S, W>(
        &mut self,
        path: S,
        transfer_type: TransferType,
        dest: &mut W,
        monitor: &mut dyn TransferMonitor,
    ) -> FtpResult<u64>
    where
        S: AsRef<str>,
        W: Write + ?Sized,
    {
        self.retrieve_impl(path.as_ref(), transfer_type, dest, Some(monitor))
    }

    fn retrieve_impl<W: Write + ?Sized>(
        &mut self,
        path: &str,
        transfer_type: TransferType,
        dest: &mut W,
        monitor: Option<&mut dyn TransferMonitor>,
    ) -> FtpResult<u64> {
        debug!("Retrieving '{}'", path);
        let mut channel = self.open_data_channel(
            Command::Retr(path.to_string()),
            Direction::Read,
            transfer_type,
            monitor,
        )?;
        let copied = pump_download(&mut channel, dest);
        let finished = channel.finish();
        let copied = copied?;
        finished?;
        Ok(copied)
    }

    /// Upload `source` to the remote file at `path`, returning the number of
    /// bytes read from it.
    pub fn store<S, R>(
        &mut self,
        path: S,
        transfer_type: TransferType,
        source: &mut R,
    ) -> FtpResult<u64>
    where
        S: AsRef<str>,
        R: Read + ?Sized,
    {
        self.store_impl(path.as_ref(), transfer_type, source, None)
    }

    /// Like [`FtpSession::store`], reporting progress through `monitor`.
    pub fn store_with<S, R>(
        &mut self,
        path: S,
        transfer_type: TransferType,
        source: &mut R,
        monitor: &mut dyn TransferMonitor,
    ) -> FtpResult<u64>
    where
        S: AsRef<str>,
        R: Read + ?Sized,
    {
        self.store_impl(path.as_ref(), transfer_type, source, Some(monitor))
    }

    fn store_impl<R: Read + ?Sized>(
        &mut self,
        path: &str,
        transfer_type: TransferType,
        source: &mut R,
        monitor: Option<&mut dyn TransferMonitor>,
    ) -> FtpResult<u64> {
        debug!("Storing '{}'", path);
        let mut channel = self.open_data_channel(
            Command::Store(path.to_string()),
            Direction::Write,
            transfer_type,
            monitor,
        )?;
        let copied = pump_upload(&mut channel, source);
        let finished = channel.finish();
        let copied = copied?;
        finished?;
        Ok(copied)
    }

    /// Download the remote file at `remote` to the local path `local`. On
    /// failure the partially written local file is removed.
    pub fn get_file<S, P>(
        &mut self,
        remote: S,
        local: P,
        transfer_type: TransferType,
    ) -> FtpResult<u64>
    where
        S: AsRef<str>,
        P: AsRef<Path>,
    {
        self.get_file_impl(remote.as_ref(), local.as_ref(), transfer_type, None)
    }

    /// Like [`FtpSession::get_file`], reporting progress through `monitor`.
    pub fn get_file_with<S, P>(
        &mut self,
        remote: S,
        local: P,
        transfer_type: TransferType,
        monitor: &mut dyn TransferMonitor,
    ) -> FtpResult<u64>
    where
        S: AsRef<str>,
        P: AsRef<Path>,
    {
        self.get_file_impl(remote.as_ref(), local.as_ref(), transfer_type, Some(monitor))
    }

    fn get_file_impl(
        &mut self,
        remote: &str,
        local: &Path,
        transfer_type: TransferType,
        monitor: Option<&mut dyn TransferMonitor>,
    ) -> FtpResult<u64> {
        let mut file = std::fs::File::create(local).map_err(FtpError::FileError)?;
        match self.retrieve_impl(remote, transfer_type, &mut file, monitor) {
            Ok(copied) => Ok(copied),
            Err(err) => {
                // a failed download must not leave a half-written file behind
                drop(file);
                let _ = std::fs::remove_file(local);
                Err(err)
            }
        }
    }

    /// Upload the local file at `local` to the remote path `remote`.
    pub fn put_file<P, S>(
        &mut self,
        local: P,
        remote: S,
        transfer_type: TransferType,
    ) -> FtpResult<u64>
    where
        P: AsRef<Path>,
        S: AsRef<str>,
    {
        let mut file = std::fs::File::open(local).map_err(FtpError::FileError)?;
        self.store_impl(remote.as_ref(), transfer_type, &mut file, None)
    }

    /// Like [`FtpSession::put_file`], reporting progress through `monitor`.
    pub fn put_file_with<P, S>(
        &mut self,
        local: P,
        remote: S,
        transfer_type: TransferType,
        monitor: &mut dyn TransferMonitor,
    ) -> FtpResult<u64>
    where
        P: AsRef<Path>,
        S: AsRef<str>,
    {
        let mut file = std::fs::File::open(local).map_err(FtpError::FileError)?;
        self.store_impl(remote.as_ref(), transfer_type, &mut file, Some(monitor))
    }

    /// Open a download channel for the remote file at `path`. The caller
    /// drives the reads and must call [`DataChannel::finish`] when done.
    pub fn retrieve_stream<S: AsRef<str>>(
        &mut self,
        path: S,
        transfer_type: TransferType,
    ) -> FtpResult<DataChannel<'_, 'static>> {
        debug!("Opening retrieve stream for '{}'", path.as_ref());
        self.open_data_channel(
            Command::Retr(path.as_ref().to_string()),
            Direction::Read,
            transfer_type,
            None,
        )
    }

    /// Like [`FtpSession::retrieve_stream`], with a transfer monitor.
    pub fn retrieve_stream_with<'m, S: AsRef<str>>(
        &mut self,
        path: S,
        transfer_type: TransferType,
        monitor: &'m mut dyn TransferMonitor,
    ) -> FtpResult<DataChannel<'_, 'm>> {
        debug!("Opening retrieve stream for '{}'", path.as_ref());
        self.open_data_channel(
            Command::Retr(path.as_ref().to_string()),
            Direction::Read,
            transfer_type,
            Some(monitor),
        )
    }

    /// Open an upload channel for the remote file at `path`. The caller
    /// drives the writes and must call [`DataChannel::finish`] when done.
    pub fn store_stream<S: AsRef<str>>(
        &mut self,
        path: S,
        transfer_type: TransferType,
    ) -> FtpResult<DataChannel<'_, 'static>> {
        debug!("Opening store stream for '{}'", path.as_ref());
        self.open_data_channel(
            Command::Store(path.as_ref().to_string()),
            Direction::Write,
            transfer_type,
            None,
        )
    }

    /// Like [`FtpSession::store_stream`], with a transfer monitor.
    pub fn store_stream_with<'m, S: AsRef<str>>(
        &mut self,
        path: S,
        transfer_type: TransferType,
        monitor: &'m mut dyn TransferMonitor,
    ) -> FtpResult<DataChannel<'_, 'm>> {
        debug!("Opening store stream for '{}'", path.as_ref());
        self.open_data_channel(
            Command::Store(path.as_ref().to_string()),
            Direction::Write,
            transfer_type,
            Some(monitor),
        )
    }

    // -- listings

    /// Execute LIST and return the listing lines. `pathname` of `None` lists
    /// the current working directory.
    pub fn list(&mut self, pathname: Option<&str>) -> FtpResult<Vec<String>> {
        debug!(
            "Reading {} directory content",
            pathname.unwrap_or("working")
        );
        self.stream_lines(Command::List(pathname.map(|x| x.to_string())))
    }

    /// Execute NLST and return the bare file names.
    pub fn nlst(&mut self, pathname: Option<&str>) -> FtpResult<Vec<String>> {
        debug!(
            "Getting file names for {} directory",
            pathname.unwrap_or("working")
        );
        self.stream_lines(Command::Nlst(pathname.map(|x| x.to_string())))
    }

    /// Execute MLSD and return the machine-processable listing lines.
    pub fn mlsd(&mut self, pathname: Option<&str>) -> FtpResult<Vec<String>> {
        debug!(
            "Reading {} directory content via MLSD",
            pathname.unwrap_or("working")
        );
        self.stream_lines(Command::Mlsd(pathname.map(|x| x.to_string())))
    }

    fn stream_lines(&mut self, cmd: Command) -> FtpResult<Vec<String>> {
        let mut raw: Vec<u8> = Vec::new();
        let mut channel =
            self.open_data_channel(cmd, Direction::Read, TransferType::Ascii, None)?;
        let pumped = pump_download(&mut channel, &mut raw);
        let finished = channel.finish();
        pumped?;
        finished?;
        Ok(String::from_utf8_lossy(&raw)
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| line.to_string())
            .collect())
    }

    // -- data channel negotiation

    /// Negotiate a data connection, issue the transfer verb and wrap the
    /// connected socket into a [`DataChannel`]. The TYPE command always
    /// precedes the verb; the verb must be answered with 1xx.
    fn open_data_channel<'m>(
        &mut self,
        cmd: Command,
        direction: Direction,
        transfer_type: TransferType,
        monitor: Option<&'m mut dyn TransferMonitor>,
    ) -> FtpResult<DataChannel<'_, 'm>> {
        self.transfer_type(transfer_type)?;
        let stream = match self.mode {
            Mode::Passive => {
                let addr = self.pasv()?;
                trace!("Connecting to passive address {}", addr);
                let stream = TcpStream::connect(addr).map_err(FtpError::ConnectionError)?;
                self.perform(cmd)?;
                self.read_response(ReplyClass::PositivePreliminary)?;
                stream
            }
            Mode::Active => {
                let listener = self.active()?;
                self.perform(cmd)?;
                self.read_response(ReplyClass::PositivePreliminary)?;
                self.accept_data_connection(listener)?
            }
        };
        DataChannel::new(self, stream, direction, transfer_type, monitor)
    }

    /// Issue PASV and parse the address the server announced.
    fn pasv(&mut self) -> FtpResult<SocketAddr> {
        debug!("PASV command");
        self.perform(Command::Pasv)?;
        let response = self.read_response(ReplyClass::PositiveCompletion)?;
        Self::parse_passive_address(&response)
    }

    /// Extract the `(h1,h2,h3,h4,p1,p2)` tuple from a 227 reply.
    fn parse_passive_address(response: &Response) -> FtpResult<SocketAddr> {
        let caps = PASV_PORT_RE
            .captures(&response.body)
            .ok_or_else(|| FtpError::UnexpectedResponse(response.clone()))?;
        let mut fields = [0u8; 6];
        for (index, field) in fields.iter_mut().enumerate() {
            *field = caps[index + 1].parse().map_err(|_| FtpError::BadResponse)?;
        }
        let [oct1, oct2, oct3, oct4, msb, lsb] = fields;
        let port = (u16::from(msb) << 8) | u16::from(lsb);
        let addr = SocketAddr::from(([oct1, oct2, oct3, oct4], port));
        trace!("Passive address is {}", addr);
        Ok(addr)
    }

    /// Bind a local listener on the control connection's interface and
    /// announce it with PORT.
    fn active(&mut self) -> FtpResult<TcpListener> {
        debug!("Starting local tcp listener...");
        let local_ip = self
            .stream
            .local_addr()
            .map_err(FtpError::ConnectionError)?
            .ip();
        let IpAddr::V4(ip) = local_ip else {
            return Err(FtpError::DataConnection(
                "active mode requires an IPv4 control connection".to_string(),
            ));
        };
        let listener = TcpListener::bind((ip, 0)).map_err(FtpError::ConnectionError)?;
        let addr = listener.local_addr().map_err(FtpError::ConnectionError)?;
        debug!("Active mode, listening on {}", addr);

        let [oct1, oct2, oct3, oct4] = ip.octets();
        let (msb, lsb) = (addr.port() / 256, addr.port() % 256);
        let ip_and_port = format!("{},{},{},{},{},{}", oct1, oct2, oct3, oct4, msb, lsb);
        self.perform(Command::Port(ip_and_port))?;
        self.read_response(ReplyClass::PositiveCompletion)?;
        Ok(listener)
    }

    /// Wait for the server to connect back to `listener`, watching the
    /// control channel at the same time: a reply arriving there first means
    /// the server declined the transfer, and that reply is surfaced as the
    /// error.
    fn accept_data_connection(&mut self, listener: TcpListener) -> FtpResult<TcpStream> {
        enum Outcome {
            Accepted(TcpStream),
            Declined,
            Failed(FtpError),
        }

        listener
            .set_nonblocking(true)
            .map_err(FtpError::ConnectionError)?;
        self.stream
            .set_nonblocking(true)
            .map_err(FtpError::ConnectionError)?;
        let deadline = Instant::now() + self.accept_timeout;
        let outcome = loop {
            match listener.accept() {
                Ok((stream, remote)) => {
                    trace!("Accepted data connection from {}", remote);
                    break Outcome::Accepted(stream);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) => break Outcome::Failed(FtpError::ConnectionError(err)),
            }
            let mut probe = [0u8; 1];
            match self.stream.peek(&mut probe) {
                Ok(_) => break Outcome::Declined,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) => break Outcome::Failed(FtpError::ConnectionError(err)),
            }
            if Instant::now() >= deadline {
                break Outcome::Failed(FtpError::DataConnection(
                    "timed out waiting for the server to connect back".to_string(),
                ));
            }
            std::thread::sleep(ACCEPT_POLL_INTERVAL);
        };
        self.stream
            .set_nonblocking(false)
            .map_err(FtpError::ConnectionError)?;
        match outcome {
            Outcome::Accepted(stream) => Ok(stream),
            Outcome::Failed(err) => {
                error!("Active data connection failed: {}", err);
                Err(err)
            }
            Outcome::Declined => {
                // drain the pending reply so the control channel stays in sync
                let response = self.read_reply()?;
                Err(FtpError::UnexpectedResponse(response))
            }
        }
    }

    // -- control channel plumbing

    /// Write a command to the control channel.
    fn perform(&mut self, command: Command) -> FtpResult<()> {
        let line = command.to_string();
        if line.len() > MAX_COMMAND_LEN {
            return Err(FtpError::CommandTooLong(MAX_COMMAND_LEN));
        }
        trace!("CC OUT: {}", line.trim_end_matches("\r\n"));
        self.stream
            .write_all(line.as_bytes())
            .map_err(FtpError::ConnectionError)
    }

    /// Read one reply line, without the trailing newline.
    ///
    /// Control-channel waits honor the idle policy like data-channel waits
    /// do: with a timeout configured the read polls in slices, yielding to
    /// `monitor` between them; without a monitor an expired slice is a hard
    /// timeout. A stalled server can therefore never block a reply read
    /// indefinitely.
    fn next_line(
        &mut self,
        monitor: &mut Option<&mut dyn TransferMonitor>,
        transferred: u64,
    ) -> FtpResult<String> {
        let Self {
            ref mut stream,
            ref mut reader,
            policy,
            ..
        } = *self;
        let mut recv = |chunk: &mut [u8]| -> FtpResult<usize> {
            match policy.idle_timeout {
                Some(timeout) => loop {
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
                },
                None => {
                    // a prior monitored wait may have left a read timeout set
                    stream
                        .set_read_timeout(None)
                        .map_err(FtpError::ConnectionError)?;
                }
            }
            stream.read(chunk).map_err(FtpError::ConnectionError)
        };
        let mut out = [0u8; RESPONSE_LINE_SIZE];
        let len = reader.read_line_expected(&mut out, &mut recv)?;
        let mut line = String::from_utf8_lossy(&out[..len]).into_owned();
        if line.ends_with('\n') {
            line.pop();
        }
        trace!("CC IN: {}", line);
        Ok(line)
    }

    /// Read a full reply, following multi-line continuations until the
    /// `"DDD "` terminator line.
    fn read_reply(&mut self) -> FtpResult<Response> {
        self.read_reply_with(None, 0)
    }

    /// Like [`FtpSession::read_reply`], yielding to `monitor` on every idle
    /// slice. Used for the transfer-completion reply, which stays
    /// cancellable through the same monitor that watched the data phase.
    fn read_reply_with(
        &mut self,
        mut monitor: Option<&mut dyn TransferMonitor>,
        transferred: u64,
    ) -> FtpResult<Response> {
        let line = self.next_line(&mut monitor, transferred)?;
        if line.len() < 4 || !line.is_char_boundary(3) {
            return Err(FtpError::BadResponse);
        }
        let code: u32 = line[0..3].parse().map_err(|_| FtpError::BadResponse)?;
        if ReplyClass::of(code).is_none() {
            return Err(FtpError::BadResponse);
        }
        let mut body = line.clone();
        if line.as_bytes()[3] == b'-' {
            let terminator = format!("{} ", &line[0..3]);
            loop {
                let next = self.next_line(&mut monitor, transferred)?;
                body.push('\n');
                body.push_str(&next);
                if next.starts_with(&terminator) {
                    break;
                }
            }
        }
        self.last_response = body.clone();
        Ok(Response::new(code, body))
    }

    /// Read a reply and require it to belong to the `expected` class.
    pub(crate) fn read_response(&mut self, expected: ReplyClass) -> FtpResult<Response> {
        self.read_response_with(expected, None, 0)
    }

    /// Like [`FtpSession::read_response`], with a monitor for the idle waits.
    pub(crate) fn read_response_with(
        &mut self,
        expected: ReplyClass,
        monitor: Option<&mut dyn TransferMonitor>,
        transferred: u64,
    ) -> FtpResult<Response> {
        let response = self.read_reply_with(monitor, transferred)?;
        if response.class() == Some(expected) {
            Ok(response)
        } else {
            Err(FtpError::UnexpectedResponse(response))
        }
    }

    /// Whether the last reply on the control channel was 4xx or 5xx.
    pub(crate) fn last_reply_was_negative(&self) -> bool {
        matches!(
            self.last_response.as_bytes().first(),
            Some(b'4') | Some(b'5')
        )
    }
}

/// Drain a read channel into `dest` in fixed-size chunks.
fn pump_download<W: Write + ?Sized>(
    channel: &mut DataChannel<'_, '_>,
    dest: &mut W,
) -> FtpResult<u64> {
    let mut chunk = [0u8; BUFFER_SIZE];
    let mut copied: u64 = 0;
    loop {
        let received = channel.read(&mut chunk)?;
        if received == 0 {
            break Ok(copied);
        }
        dest.write_all(&chunk[..received])
            .map_err(FtpError::FileError)?;
        copied += received as u64;
    }
}

/// Drain `source` into a write channel in fixed-size chunks.
fn pump_upload<R: Read + ?Sized>(
    channel: &mut DataChannel<'_, '_>,
    source: &mut R,
) -> FtpResult<u64> {
    let mut chunk = [0u8; BUFFER_SIZE];
    let mut copied: u64 = 0;
    loop {
        let read = source.read(&mut chunk).map_err(FtpError::FileError)?;
        if read == 0 {
            break Ok(copied);
        }
        channel.write(&chunk[..read])?;
        copied += read as u64;
    }
}
