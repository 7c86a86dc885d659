//! # Test Server
//!
//! A scripted in-process FTP server backing the integration tests. It keeps
//! its files in memory and implements just enough of the protocol to exercise
//! the client: both PASV and PORT data connections, binary payloads passed
//! through verbatim, and a couple of deliberately multi-line replies.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

type SharedFiles = Arc<Mutex<HashMap<String, Vec<u8>>>>;

#[derive(Clone, Default)]
struct Quirks {
    withhold_completion: Arc<AtomicBool>,
    payload_delay: Arc<Mutex<Option<Duration>>>,
}

pub struct TestFtpServer {
    addr: SocketAddr,
    files: SharedFiles,
    quirks: Quirks,
}

impl TestFtpServer {
    /// Bind on an ephemeral localhost port and serve sessions until the test
    /// process exits.
    pub fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind test server");
        let addr = listener.local_addr().expect("no local address");
        let files: SharedFiles = Arc::new(Mutex::new(HashMap::new()));
        let quirks = Quirks::default();
        let shared = files.clone();
        let shared_quirks = quirks.clone();
        thread::spawn(move || {
            while let Ok((stream, _)) = listener.accept() {
                let files = shared.clone();
                let quirks = shared_quirks.clone();
                thread::spawn(move || {
                    let _ = serve(stream, files, quirks);
                });
            }
        });
        Self {
            addr,
            files,
            quirks,
        }
    }

    /// Serve RETR payloads on the data channel but never send the final 226
    /// completion reply.
    pub fn withhold_completion(&self) {
        self.quirks
            .withhold_completion
            .store(true, Ordering::SeqCst);
    }

    /// Hold RETR payloads back for `delay` after the data connection is up.
    pub fn set_payload_delay(&self, delay: Duration) {
        *self.quirks.payload_delay.lock().unwrap() = Some(delay);
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Seed a remote file.
    pub fn put_file(&self, name: &str, data: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .insert(name.to_string(), data.to_vec());
    }

    /// Current content of a remote file, if it exists.
    pub fn file(&self, name: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(name).cloned()
    }
}

/// Pending data-connection setup, armed by PASV or PORT and consumed by the
/// next transfer verb.
enum DataSetup {
    None,
    Passive(TcpListener),
    Active(SocketAddr),
}

fn open_data(setup: &mut DataSetup) -> std::io::Result<TcpStream> {
    match std::mem::replace(setup, DataSetup::None) {
        DataSetup::Passive(listener) => listener.accept().map(|(stream, _)| stream),
        DataSetup::Active(addr) => TcpStream::connect(addr),
        DataSetup::None => Err(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            "no data setup armed",
        )),
    }
}

fn serve(stream: TcpStream, files: SharedFiles, quirks: Quirks) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut out = stream;
    // multi-line greeting on purpose
    out.write_all(b"220-Welcome to the test server\r\n220 Service ready\r\n")?;

    let mut cwd = String::from("/");
    let mut rename_from: Option<String> = None;
    let mut data = DataSetup::None;

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        let line = line.trim_end().to_string();
        let (verb, arg) = match line.split_once(' ') {
            Some((verb, arg)) => (verb.to_string(), Some(arg.to_string())),
            None => (line.clone(), None),
        };
        let arg = arg.as_deref();

        match verb.as_str() {
            "USER" => {
                if arg == Some("anonymous") {
                    out.write_all(b"230 Anonymous access granted\r\n")?;
                } else {
                    out.write_all(b"331 Password required\r\n")?;
                }
            }
            "PASS" => {
                if arg == Some("bad") {
                    out.write_all(b"530 Login incorrect\r\n")?;
                } else {
                    out.write_all(b"230 Login successful\r\n")?;
                }
            }
            "SYST" => out.write_all(b"215 UNIX Type: L8\r\n")?,
            "TYPE" => out.write_all(b"200 Type set\r\n")?,
            "PWD" => {
                let reply = format!("257 \"{}\" is the current directory\r\n", cwd);
                out.write_all(reply.as_bytes())?;
            }
            "CWD" => {
                cwd = arg.unwrap_or("/").to_string();
                out.write_all(b"250 Directory changed\r\n")?;
            }
            "CDUP" => {
                cwd = String::from("/");
                out.write_all(b"250 Directory changed\r\n")?;
            }
            "MKD" => {
                let reply = format!("257 \"{}\" created\r\n", arg.unwrap_or(""));
                out.write_all(reply.as_bytes())?;
            }
            "RMD" => out.write_all(b"250 Directory removed\r\n")?,
            "DELE" => {
                let removed = files.lock().unwrap().remove(arg.unwrap_or("")).is_some();
                if removed {
                    out.write_all(b"250 File deleted\r\n")?;
                } else {
                    out.write_all(b"550 No such file\r\n")?;
                }
            }
            "RNFR" => {
                let name = arg.unwrap_or("").to_string();
                if files.lock().unwrap().contains_key(&name) {
                    rename_from = Some(name);
                    out.write_all(b"350 Ready for destination name\r\n")?;
                } else {
                    out.write_all(b"550 No such file\r\n")?;
                }
            }
            "RNTO" => match rename_from.take() {
                Some(from) => {
                    let mut files = files.lock().unwrap();
                    if let Some(content) = files.remove(&from) {
                        files.insert(arg.unwrap_or("").to_string(), content);
                    }
                    out.write_all(b"250 Rename successful\r\n")?;
                }
                None => out.write_all(b"503 RNFR required first\r\n")?,
            },
            "SIZE" => {
                let size = files.lock().unwrap().get(arg.unwrap_or("")).map(Vec::len);
                match size {
                    Some(size) => {
                        let reply = format!("213 {}\r\n", size);
                        out.write_all(reply.as_bytes())?;
                    }
                    None => out.write_all(b"550 No such file\r\n")?,
                }
            }
            "MDTM" => {
                if files.lock().unwrap().contains_key(arg.unwrap_or("")) {
                    out.write_all(b"213 20240811143000\r\n")?;
                } else {
                    out.write_all(b"550 No such file\r\n")?;
                }
            }
            "SITE" => {
                out.write_all(b"200-SITE command accepted\r\n some output line\r\n200 Done\r\n")?;
            }
            "PASV" => {
                let listener = TcpListener::bind("127.0.0.1:0")?;
                let port = listener.local_addr()?.port();
                data = DataSetup::Passive(listener);
                let reply = format!(
                    "227 Entering Passive Mode (127,0,0,1,{},{})\r\n",
                    port / 256,
                    port % 256
                );
                out.write_all(reply.as_bytes())?;
            }
            "PORT" => {
                let fields: Vec<u16> = arg
                    .unwrap_or("")
                    .split(',')
                    .filter_map(|field| field.parse().ok())
                    .collect();
                if fields.len() == 6 {
                    let ip = Ipv4Addr::new(
                        fields[0] as u8,
                        fields[1] as u8,
                        fields[2] as u8,
                        fields[3] as u8,
                    );
                    let port = fields[4] * 256 + fields[5];
                    data = DataSetup::Active(SocketAddr::from((ip, port)));
                    out.write_all(b"200 PORT command successful\r\n")?;
                } else {
                    out.write_all(b"501 Bad PORT argument\r\n")?;
                }
            }
            "RETR" => {
                let content = files.lock().unwrap().get(arg.unwrap_or("")).cloned();
                match content {
                    Some(bytes) => {
                        out.write_all(b"150 Opening data connection\r\n")?;
                        let mut conn = open_data(&mut data)?;
                        let delay = *quirks.payload_delay.lock().unwrap();
                        if let Some(delay) = delay {
                            thread::sleep(delay);
                        }
                        conn.write_all(&bytes)?;
                        drop(conn);
                        if !quirks.withhold_completion.load(Ordering::SeqCst) {
                            out.write_all(b"226 Transfer complete\r\n")?;
                        }
                    }
                    None => {
                        data = DataSetup::None;
                        out.write_all(b"550 No such file\r\n")?;
                    }
                }
            }
            "STOR" => {
                out.write_all(b"150 Ok to send data\r\n")?;
                let mut conn = open_data(&mut data)?;
                let mut bytes = Vec::new();
                conn.read_to_end(&mut bytes)?;
                drop(conn);
                files
                    .lock()
                    .unwrap()
                    .insert(arg.unwrap_or("").to_string(), bytes);
                out.write_all(b"226 Transfer complete\r\n")?;
            }
            "LIST" | "NLST" | "MLSD" => {
                out.write_all(b"150 Here comes the listing\r\n")?;
                let mut conn = open_data(&mut data)?;
                let entries = files.lock().unwrap();
                for (name, content) in entries.iter() {
                    let line = match verb.as_str() {
                        "LIST" => format!(
                            "-rw-r--r-- 1 ftp ftp {} Jan  1 00:00 {}\r\n",
                            content.len(),
                            name
                        ),
                        "MLSD" => format!("type=file;size={}; {}\r\n", content.len(), name),
                        _ => format!("{}\r\n", name),
                    };
                    conn.write_all(line.as_bytes())?;
                }
                drop(entries);
                drop(conn);
                out.write_all(b"226 Transfer complete\r\n")?;
            }
            "QUIT" => {
                out.write_all(b"221 Goodbye\r\n")?;
                return Ok(());
            }
            _ => out.write_all(b"502 Command not implemented\r\n")?,
        }
    }
}
