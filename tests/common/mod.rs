// Serveur FTP en mémoire pour les tests d'intégration
#![allow(dead_code)]

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};

#[derive(Clone, Default)]
pub struct Behavior {
    /// The first connections get `421` instead of a greeting.
    pub refuse_connections: usize,
    pub allow_compression: bool,
    /// How long NOOP waits before answering.
    pub noop_delay: Duration,
    /// Exact command text mapped to the raw reply lines sent back.
    pub overrides: HashMap<String, Vec<String>>,
    /// Listing bytes served verbatim for a directory.
    pub raw_listings: HashMap<String, Vec<u8>>,
}

#[derive(Default)]
struct ServerState {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    behavior: Behavior,
    commands: Vec<String>,
    connections: usize,
    overlap: bool,
}

pub struct FakeServer {
    pub addr: SocketAddr,
    state: Arc<Mutex<ServerState>>,
}

fn lock(state: &Mutex<ServerState>) -> MutexGuard<'_, ServerState> {
    state.lock().unwrap()
}

fn parent_of(path: &str) -> String {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) | None => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
    }
}

fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn resolve(cwd: &str, arg: &str) -> String {
    let joined = if arg.starts_with('/') {
        arg.to_string()
    } else if cwd == "/" {
        format!("/{}", arg)
    } else {
        format!("{}/{}", cwd, arg)
    };
    if joined.len() > 1 {
        joined.trim_end_matches('/').to_string()
    } else {
        joined
    }
}

enum DataTarget {
    Passive(TcpListener),
    Active(SocketAddr),
}

impl FakeServer {
    pub async fn start(behavior: Behavior) -> FakeServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(ServerState {
            behavior,
            ..ServerState::default()
        }));
        lock(&state).dirs.insert("/".to_string());
        let shared = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(session(socket, Arc::clone(&shared)));
            }
        });
        FakeServer { addr, state }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn add_dir(&self, path: &str) {
        let mut state = lock(&self.state);
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current = format!("{}/{}", current, part);
            state.dirs.insert(current.clone());
        }
    }

    pub fn add_file(&self, path: &str, content: &[u8]) {
        self.add_dir(&parent_of(path));
        lock(&self.state).files.insert(path.to_string(), content.to_vec());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        lock(&self.state).files.get(path).cloned()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        lock(&self.state).dirs.contains(path)
    }

    pub fn commands(&self) -> Vec<String> {
        lock(&self.state).commands.clone()
    }

    /// Commands received starting with `verb`.
    pub fn count(&self, verb: &str) -> usize {
        lock(&self.state)
            .commands
            .iter()
            .filter(|c| c.split(' ').next() == Some(verb))
            .count()
    }

    pub fn connections(&self) -> usize {
        lock(&self.state).connections
    }

    /// Whether a command ever arrived while a delayed NOOP was unanswered.
    pub fn overlap_detected(&self) -> bool {
        lock(&self.state).overlap
    }

    pub fn listing_of(&self, dir: &str) -> Vec<u8> {
        listing(&lock(&self.state), dir)
    }
}

fn listing(state: &ServerState, dir: &str) -> Vec<u8> {
    if let Some(raw) = state.behavior.raw_listings.get(dir) {
        return raw.clone();
    }
    let mut out = String::from("total 0\r\n");
    for sub in state.dirs.iter().filter(|d| d.as_str() != "/" && parent_of(d) == dir) {
        out.push_str(&format!(
            "drwxr-xr-x   2 ftp ftp     4096 Jan  1 12:00 {}\r\n",
            name_of(sub)
        ));
    }
    for (path, content) in state.files.iter().filter(|(p, _)| parent_of(p) == dir) {
        out.push_str(&format!(
            "-rw-r--r--   1 ftp ftp {:>8} Jan  1 12:00 {}\r\n",
            content.len(),
            name_of(path)
        ));
    }
    out.into_bytes()
}

async fn reply(write: &mut OwnedWriteHalf, text: &str) -> bool {
    write.write_all(format!("{}\r\n", text).as_bytes()).await.is_ok()
}

async fn open_data(target: Option<DataTarget>) -> Option<TcpStream> {
    match target? {
        DataTarget::Passive(listener) => {
            let accepted = tokio::time::timeout(Duration::from_secs(5), listener.accept()).await;
            accepted.ok()?.ok().map(|(socket, _)| socket)
        }
        DataTarget::Active(addr) => TcpStream::connect(addr).await.ok(),
    }
}

fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn inflate(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    ZlibDecoder::new(data).read_to_end(&mut out).unwrap();
    out
}

async fn session(socket: TcpStream, state: Arc<Mutex<ServerState>>) {
    let refuse = {
        let mut s = lock(&state);
        s.connections += 1;
        s.connections <= s.behavior.refuse_connections
    };
    let (read, mut write) = socket.into_split();
    if refuse {
        let _ = reply(&mut write, "421 Too many connections, try later").await;
        return;
    }
    if !reply(&mut write, "220 Fake FTP server ready").await {
        return;
    }

    let mut reader = BufReader::new(read);
    let mut cwd = "/".to_string();
    let mut data_target: Option<DataTarget> = None;
    let mut compress = false;
    let mut rest = 0usize;
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        // Drops CRLF and the Telnet IP/Synch bytes in front of ABOR.
        let text: String = String::from_utf8_lossy(&buf)
            .chars()
            .filter(|c| c.is_ascii() && !c.is_ascii_control())
            .collect();
        let (verb, arg) = match text.split_once(' ') {
            Some((verb, arg)) => (verb.to_ascii_uppercase(), arg.to_string()),
            None => (text.to_ascii_uppercase(), String::new()),
        };
        let (canned, noop_delay) = {
            let mut s = lock(&state);
            s.commands.push(text.clone());
            (s.behavior.overrides.get(&text).cloned(), s.behavior.noop_delay)
        };
        if let Some(lines) = canned {
            for line in lines {
                if !reply(&mut write, &line).await {
                    return;
                }
            }
            continue;
        }

        let answer = match verb.as_str() {
            "USER" => "331 Password required".to_string(),
            "PASS" => "230 Logged in".to_string(),
            "SYST" => "215 UNIX Type: L8".to_string(),
            "PWD" => format!("257 \"{}\" is the current directory", cwd),
            "CWD" => {
                let target = resolve(&cwd, &arg);
                if lock(&state).dirs.contains(&target) {
                    cwd = target;
                    "250 Directory changed".to_string()
                } else {
                    "550 No such directory".to_string()
                }
            }
            "CDUP" => {
                cwd = parent_of(&cwd);
                "250 Directory changed".to_string()
            }
            "TYPE" => "200 Type set".to_string(),
            "MODE" => match arg.to_ascii_uppercase().as_str() {
                "Z" if lock(&state).behavior.allow_compression => {
                    compress = true;
                    "200 MODE Z ok".to_string()
                }
                "S" => {
                    compress = false;
                    "200 MODE S ok".to_string()
                }
                _ => "504 Mode not supported".to_string(),
            },
            "NOOP" => {
                if !noop_delay.is_zero() {
                    // Anything arriving now means two commands are outstanding.
                    if let Ok(Ok(pending)) = tokio::time::timeout(noop_delay, reader.fill_buf()).await {
                        if !pending.is_empty() {
                            lock(&state).overlap = true;
                        }
                    }
                }
                "200 NOOP ok".to_string()
            }
            "PASV" => {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let port = listener.local_addr().unwrap().port();
                data_target = Some(DataTarget::Passive(listener));
                format!(
                    "227 Entering Passive Mode (127,0,0,1,{},{})",
                    port >> 8,
                    port & 0xff
                )
            }
            "PORT" => {
                let parts: Vec<u16> = arg.split(',').filter_map(|p| p.trim().parse().ok()).collect();
                if parts.len() == 6 {
                    let ip = format!("{}.{}.{}.{}", parts[0], parts[1], parts[2], parts[3]);
                    let port = (parts[4] << 8) | parts[5];
                    data_target = Some(DataTarget::Active(format!("{}:{}", ip, port).parse().unwrap()));
                    "200 PORT ok".to_string()
                } else {
                    "501 Bad PORT".to_string()
                }
            }
            "REST" => {
                rest = arg.parse().unwrap_or(0);
                format!("350 Restarting at {}", rest)
            }
            "LIST" | "NLST" => {
                let path = arg
                    .split(' ')
                    .filter(|a| !a.is_empty() && !a.starts_with('-'))
                    .last()
                    .map(|p| resolve(&cwd, p))
                    .unwrap_or_else(|| cwd.clone());
                let payload = {
                    let s = lock(&state);
                    if s.dirs.contains(&path) || s.behavior.raw_listings.contains_key(&path) {
                        Some(listing(&s, &path))
                    } else {
                        None
                    }
                };
                match payload {
                    None => {
                        data_target = None;
                        "550 No such directory".to_string()
                    }
                    Some(payload) => {
                        if !reply(&mut write, "150 Here comes the listing").await {
                            return;
                        }
                        match open_data(data_target.take()).await {
                            Some(mut data) => {
                                let wire = if compress { deflate(&payload) } else { payload };
                                let _ = data.write_all(&wire).await;
                                let _ = data.shutdown().await;
                                "226 Transfer complete".to_string()
                            }
                            None => "425 Cannot open data connection".to_string(),
                        }
                    }
                }
            }
            "RETR" => {
                let path = resolve(&cwd, &arg);
                let content = lock(&state).files.get(&path).cloned();
                match content {
                    None => {
                        data_target = None;
                        "550 No such file".to_string()
                    }
                    Some(content) => {
                        let start = rest.min(content.len());
                        rest = 0;
                        let line = format!("150 Opening data connection ({} bytes)", content.len() - start);
                        if !reply(&mut write, &line).await {
                            return;
                        }
                        match open_data(data_target.take()).await {
                            Some(mut data) => {
                                let body = &content[start..];
                                let wire = if compress { deflate(body) } else { body.to_vec() };
                                let _ = data.write_all(&wire).await;
                                let _ = data.shutdown().await;
                                "226 Transfer complete".to_string()
                            }
                            None => "425 Cannot open data connection".to_string(),
                        }
                    }
                }
            }
            "STOR" | "APPE" => {
                let path = resolve(&cwd, &arg);
                if !reply(&mut write, "150 Ready to receive").await {
                    return;
                }
                match open_data(data_target.take()).await {
                    Some(mut data) => {
                        let mut received = Vec::new();
                        let _ = data.read_to_end(&mut received).await;
                        let received = if compress { inflate(&received) } else { received };
                        let mut s = lock(&state);
                        let file = s.files.entry(path).or_default();
                        if verb == "STOR" {
                            file.clear();
                        }
                        file.extend_from_slice(&received);
                        "226 Transfer complete".to_string()
                    }
                    None => "425 Cannot open data connection".to_string(),
                }
            }
            "SIZE" => {
                let path = resolve(&cwd, &arg);
                match lock(&state).files.get(&path) {
                    Some(content) => format!("213 {}", content.len()),
                    None => "550 Not a plain file".to_string(),
                }
            }
            "DELE" => {
                let path = resolve(&cwd, &arg);
                if lock(&state).files.remove(&path).is_some() {
                    "250 File deleted".to_string()
                } else {
                    "550 No such file".to_string()
                }
            }
            "RMD" => {
                let path = resolve(&cwd, &arg);
                let mut s = lock(&state);
                let busy = s.files.keys().any(|f| parent_of(f) == path)
                    || s.dirs.iter().any(|d| d != "/" && parent_of(d) == path);
                if !busy && s.dirs.remove(&path) {
                    "250 Directory removed".to_string()
                } else {
                    "550 Cannot remove directory".to_string()
                }
            }
            "MKD" => {
                let path = resolve(&cwd, &arg);
                let mut s = lock(&state);
                if s.dirs.insert(path.clone()) {
                    format!("257 \"{}\" created", path)
                } else {
                    "550 Directory exists".to_string()
                }
            }
            "SITE" => "200 SITE command ok".to_string(),
            "ABOR" => "226 Abort successful".to_string(),
            "QUIT" => {
                let _ = reply(&mut write, "221 Goodbye").await;
                return;
            }
            _ => "502 Command not implemented".to_string(),
        };
        if !reply(&mut write, &answer).await {
            return;
        }
    }
}
