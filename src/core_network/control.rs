// Connexion de contrôle avec un serveur FTP
// Une seule commande (normale ou keep-alive) attend sa réponse à la fois

use crate::config::ClientConfig;
use crate::constants::{ABORT_DRAIN_GRACE_MS, KEEP_ALIVE_READ_BUF_SIZE, TELNET_IP_SYNCH};
use crate::core_cache::{ListingCache, ListingCacheKey};
use crate::core_error::FtpError;
use crate::core_ftpcommand::{split_init_commands, FtpCommand, TransferType};
use crate::core_log::{LogUid, SessionLogs};
use crate::core_network::data::{
    self, DataChannelParams, DataConnection, DataConnectionError, DataSink, PendingData,
};
use crate::core_network::keepalive::{
    CommandAdmission, KeepAliveCommand, KeepAliveConfig, KeepAliveMode, KeepAliveState,
};
use crate::core_network::proxy::{self, ProxyConfig};
use crate::core_network::transport::Transport;
use crate::core_path::{is_empty_listing_error, ServerPathType};
use crate::core_reply::{format_port_argument, parse_data_size, parse_pasv_reply, parse_pwd_reply, take_reply, FtpReply};
use crate::core_tls::{TlsConfig, TlsConnection, TlsError, TlsMode};
use chrono::Local;
use log::{debug, info, trace, warn};
use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Who to connect to and how.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub account: Option<String>,
    /// Directory to enter right after login.
    pub initial_path: Option<String>,
    /// `;` separated commands sent after login.
    pub init_commands: String,
    pub list_command: String,
    pub passive_mode: bool,
    pub compress: bool,
    pub tls: TlsConfig,
    pub proxy: ProxyConfig,
    pub keep_alive: KeepAliveConfig,
    pub server_reply_timeout: Duration,
    pub no_data_timeout: Duration,
}

impl ConnectParams {
    pub fn new(host: &str, port: u16, user: &str, password: &str) -> Self {
        Self::from_config(&ClientConfig::default(), host, port, user, password)
    }

    pub fn from_config(config: &ClientConfig, host: &str, port: u16, user: &str, password: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            user: user.to_string(),
            password: password.to_string(),
            account: None,
            initial_path: None,
            init_commands: config.connection.init_commands.clone(),
            list_command: config.connection.list_command.clone(),
            passive_mode: config.connection.passive_mode,
            compress: config.transfer.compress,
            tls: config.tls.clone(),
            proxy: config.proxy.clone(),
            keep_alive: config.keep_alive.clone(),
            server_reply_timeout: Duration::from_secs(config.connection.server_reply_timeout_secs),
            no_data_timeout: Duration::from_secs(config.connection.no_data_transfer_timeout_secs),
        }
    }

    pub fn is_ftps(&self) -> bool {
        self.tls.is_enabled()
    }
}

/// Per-call options of a command exchange.
#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    /// Checked while waiting for the reply; triggers `ABOR`.
    pub cancel: Option<CancellationToken>,
    /// Overrides the configured reply timeout.
    pub reply_timeout: Option<Duration>,
}

impl CommandOptions {
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel: Some(cancel),
            reply_timeout: None,
        }
    }
}

struct ControlWire {
    stream: Transport,
    read_buf: Vec<u8>,
}

impl ControlWire {
    /// Reads until one complete reply is buffered. Cancel safe.
    async fn read_reply(&mut self, limit: Option<Duration>) -> Result<FtpReply, FtpError> {
        let mut chunk = [0u8; KEEP_ALIVE_READ_BUF_SIZE];
        loop {
            if let Some(reply) = take_reply(&mut self.read_buf)? {
                return Ok(reply);
            }
            let read = self.stream.read(&mut chunk);
            let n = match limit {
                Some(limit) => timeout(limit, read)
                    .await
                    .map_err(|_| FtpError::ReplyTimeout(limit.as_secs()))??,
                None => read.await?,
            };
            if n == 0 {
                return Err(FtpError::ConnectionLost("closed by server".into()));
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }
}

#[derive(Debug, Default)]
struct SessionState {
    working_path: Option<String>,
    transfer_mode: Option<TransferType>,
    greeting: String,
    system: String,
    path_type: ServerPathType,
    compress: bool,
    encrypt_data: bool,
}

struct Inner {
    params: ConnectParams,
    logs: Arc<SessionLogs>,
    log_uid: LogUid,
    tls: Option<TlsConnection>,
    wire: tokio::sync::Mutex<Option<ControlWire>>,
    connected: AtomicBool,
    session: Mutex<SessionState>,
    keep_alive: Mutex<KeepAliveState>,
    probe_finished: Notify,
    keep_alive_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.keep_alive_task.get_mut().ok().and_then(Option::take) {
            task.abort();
        }
        self.logs.close(self.log_uid);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn wire(slot: &mut Option<ControlWire>) -> Result<&mut ControlWire, FtpError> {
    slot.as_mut().ok_or(FtpError::NotConnected)
}

fn success_or_err(reply: FtpReply) -> Result<FtpReply, FtpError> {
    if reply.is_success() {
        Ok(reply)
    } else {
        Err(FtpError::Server(reply))
    }
}

/// Marks a regular command as outstanding until dropped.
struct RegularCommand<'a> {
    conn: &'a ControlConnection,
}

impl Drop for RegularCommand<'_> {
    fn drop(&mut self) {
        let expired = lock(&self.conn.inner.keep_alive).end_command();
        // The user is active again, an expired keep-alive starts over.
        if expired && self.conn.is_connected() && tokio::runtime::Handle::try_current().is_ok() {
            self.conn.start_keep_alive();
        }
    }
}

/// One session with an FTP server. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct ControlConnection {
    inner: Arc<Inner>,
}

impl ControlConnection {
    pub fn new(params: ConnectParams, logs: Arc<SessionLogs>) -> Result<Self, FtpError> {
        let tls = if params.tls.is_enabled() {
            Some(TlsConnection::new(&params.tls)?)
        } else {
            None
        };
        let log_uid = logs.open(&format!("{}@{}:{}", params.user, params.host, params.port));
        let keep_alive = KeepAliveState::new(params.keep_alive.enabled);
        Ok(Self {
            inner: Arc::new(Inner {
                params,
                logs,
                log_uid,
                tls,
                wire: tokio::sync::Mutex::new(None),
                connected: AtomicBool::new(false),
                session: Mutex::new(SessionState::default()),
                keep_alive: Mutex::new(keep_alive),
                probe_finished: Notify::new(),
                keep_alive_task: Mutex::new(None),
            }),
        })
    }

    pub fn params(&self) -> &ConnectParams {
        &self.inner.params
    }

    pub fn host(&self) -> &str {
        &self.inner.params.host
    }

    pub fn port(&self) -> u16 {
        self.inner.params.port
    }

    pub fn user(&self) -> &str {
        &self.inner.params.user
    }

    pub fn log_uid(&self) -> LogUid {
        self.inner.log_uid
    }

    pub fn logs(&self) -> &Arc<SessionLogs> {
        &self.inner.logs
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn path_type(&self) -> ServerPathType {
        lock(&self.inner.session).path_type
    }

    pub fn greeting(&self) -> String {
        lock(&self.inner.session).greeting.clone()
    }

    /// Raw SYST reply text, empty when SYST failed.
    pub fn system(&self) -> String {
        lock(&self.inner.session).system.clone()
    }

    pub fn compress_enabled(&self) -> bool {
        lock(&self.inner.session).compress
    }

    pub fn keep_alive_mode(&self) -> KeepAliveMode {
        lock(&self.inner.keep_alive).mode()
    }

    /// Cached working path, `None` when unknown or invalidated.
    pub fn cached_working_path(&self) -> Option<String> {
        lock(&self.inner.session).working_path.clone()
    }

    pub fn invalidate_working_path(&self) {
        lock(&self.inner.session).working_path = None;
    }

    pub fn cache_key(&self, path: &str) -> ListingCacheKey {
        let p = &self.inner.params;
        ListingCacheKey::new(
            &p.host,
            p.port,
            &p.user,
            path,
            self.path_type(),
            &p.list_command,
            p.is_ftps(),
        )
    }

    fn log(&self, text: &str) {
        self.inner.logs.append(self.inner.log_uid, text);
    }

    fn reply_timeout(&self, opts: &CommandOptions) -> Duration {
        opts.reply_timeout.unwrap_or(self.inner.params.server_reply_timeout)
    }

    // ---- wire primitives --------------------------------------------------

    fn set_wire(&self, slot: &mut Option<ControlWire>, value: Option<ControlWire>) {
        self.inner.connected.store(value.is_some(), Ordering::SeqCst);
        *slot = value;
    }

    /// Tears the connection down after a fatal error. No QUIT is sent.
    fn check_fatal<T>(&self, slot: &mut Option<ControlWire>, result: &Result<T, FtpError>) {
        if let Err(e) = result {
            if e.is_connection_fatal() && slot.is_some() {
                warn!("Connection to {} lost: {}", self.host(), e);
                self.log(&format!("Connection lost: {}", e));
                self.set_wire(slot, None);
                lock(&self.inner.keep_alive).stop();
                lock(&self.inner.session).working_path = None;
            }
        }
    }

    async fn write_command(&self, wire: &mut ControlWire, cmd: &FtpCommand) -> Result<(), FtpError> {
        // Replies left over from an abort belong to no command.
        while !wire.read_buf.is_empty() {
            match take_reply(&mut wire.read_buf) {
                Ok(Some(stale)) => self.log(&format!("Ignoring stale reply: {}", stale.text())),
                Ok(None) => break,
                Err(_) => wire.read_buf.clear(),
            }
        }
        self.log(&cmd.log_text());
        debug!("--> {}", cmd.log_text());
        wire.stream
            .write_all(&cmd.to_wire())
            .await
            .map_err(|e| FtpError::ConnectionLost(e.to_string()))?;
        wire.stream.flush().await?;
        Ok(())
    }

    async fn send_abort(&self, wire: &mut ControlWire) -> Result<(), FtpError> {
        info!("Aborting command on {}", self.host());
        self.log("ABOR");
        let mut line = TELNET_IP_SYNCH.to_vec();
        line.extend_from_slice(&FtpCommand::ABOR.to_wire());
        wire.stream
            .write_all(&line)
            .await
            .map_err(|e| FtpError::ConnectionLost(e.to_string()))?;
        wire.stream.flush().await?;
        Ok(())
    }

    /// Reads replies until a terminal one (or, with `stop_at_preliminary`, any).
    ///
    /// On cancellation `ABOR` is sent and the next terminal reply wins, whether it
    /// answers the command or the abort; replies trailing behind it are drained.
    async fn read_until(
        &self,
        wire: &mut ControlWire,
        opts: &CommandOptions,
        limit: Option<Duration>,
        stop_at_preliminary: bool,
    ) -> Result<FtpReply, FtpError> {
        let mut aborted = false;
        loop {
            let limit = if aborted { Some(self.reply_timeout(opts)) } else { limit };
            let reply = match (&opts.cancel, aborted) {
                (Some(cancel), false) => {
                    let outcome = tokio::select! {
                        reply = wire.read_reply(limit) => Some(reply),
                        _ = cancel.cancelled() => None,
                    };
                    match outcome {
                        Some(reply) => reply?,
                        None => {
                            self.send_abort(wire).await?;
                            aborted = true;
                            continue;
                        }
                    }
                }
                _ => wire.read_reply(limit).await?,
            };
            self.log(&reply.text());
            trace!("<-- {}", reply.text());
            if reply.is_preliminary() && !(stop_at_preliminary && !aborted) {
                continue;
            }
            if aborted {
                self.drain_after_abort(wire).await?;
                return Err(FtpError::Cancelled);
            }
            return Ok(reply);
        }
    }

    async fn drain_after_abort(&self, wire: &mut ControlWire) -> Result<(), FtpError> {
        let grace = Duration::from_millis(ABORT_DRAIN_GRACE_MS);
        loop {
            match wire.read_reply(Some(grace)).await {
                Ok(stray) => self.log(&format!("Ignoring reply after abort: {}", stray.text())),
                Err(FtpError::ReplyTimeout(_)) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    fn after_command(&self, cmd: &FtpCommand, reply: &FtpReply) {
        let mut session = lock(&self.inner.session);
        if cmd.invalidates_working_path() {
            session.working_path = None;
        }
        if cmd.invalidates_transfer_mode() {
            session.transfer_mode = None;
        }
        if let FtpCommand::TYPE(kind) = cmd {
            session.transfer_mode = if reply.is_success() { Some(*kind) } else { None };
        }
    }

    async fn exchange(
        &self,
        wire: &mut ControlWire,
        cmd: &FtpCommand,
        opts: &CommandOptions,
    ) -> Result<FtpReply, FtpError> {
        self.write_command(wire, cmd).await?;
        let reply = self
            .read_until(wire, opts, Some(self.reply_timeout(opts)), false)
            .await?;
        self.after_command(cmd, &reply);
        Ok(reply)
    }

    /// Registers a regular command with the keep-alive automaton, waiting (at
    /// most one reply timeout) for a probe already on the wire.
    async fn begin_regular(&self) -> RegularCommand<'_> {
        let finished = self.inner.probe_finished.notified();
        tokio::pin!(finished);
        finished.as_mut().enable();
        let admission = lock(&self.inner.keep_alive).begin_command();
        if admission == CommandAdmission::WaitForProbe {
            trace!("Waiting for keep-alive probe to finish");
            let _ = timeout(self.inner.params.server_reply_timeout, finished).await;
            lock(&self.inner.keep_alive).force_forbidden();
        }
        RegularCommand { conn: self }
    }

    // ---- session ----------------------------------------------------------

    /// Opens the session and logs in. Returns the working directory.
    pub async fn connect(&self) -> Result<String, FtpError> {
        let _regular = self.begin_regular().await;
        let mut slot = self.inner.wire.lock().await;
        self.set_wire(&mut slot, None);
        let result = self.login(&mut slot).await;
        match &result {
            Ok(path) => {
                info!("Logged in to {}:{}, working path {}", self.host(), self.port(), path);
                self.log(&format!("Logged in, working path {}", path));
            }
            Err(e) => {
                warn!("Login to {}:{} failed: {}", self.host(), self.port(), e);
                self.log(&format!("Connection failed: {}", e));
                self.set_wire(&mut slot, None);
            }
        }
        drop(slot);
        if result.is_ok() {
            self.start_keep_alive();
        }
        result
    }

    async fn open_socket(&self) -> Result<Transport, FtpError> {
        let p = &self.inner.params;
        self.log(&format!("Connecting to {}:{}", p.host, p.port));
        let stream = proxy::connect(&p.proxy, &p.host, p.port, p.server_reply_timeout)
            .await
            .map_err(|e| {
                if p.proxy.is_enabled() {
                    FtpError::Proxy(e)
                } else {
                    FtpError::ConnectFailed {
                        host: p.host.clone(),
                        port: p.port,
                        reason: e.to_string(),
                    }
                }
            })?;
        let transport = Transport::Plain(stream);
        match (&self.inner.tls, p.tls.mode) {
            (Some(tls), TlsMode::Implicit) => Ok(transport.upgrade(tls, &p.host).await?),
            _ => Ok(transport),
        }
    }

    async fn login(&self, slot: &mut Option<ControlWire>) -> Result<String, FtpError> {
        let p = &self.inner.params;
        let opts = CommandOptions::default();
        let stream = self.open_socket().await?;
        self.set_wire(
            slot,
            Some(ControlWire {
                stream,
                read_buf: Vec::new(),
            }),
        );

        // 120 announces the real greeting later.
        let greeting = self
            .read_until(wire(slot)?, &opts, Some(p.server_reply_timeout), false)
            .await?;
        let greeting = success_or_err(greeting)?;
        lock(&self.inner.session).greeting = greeting.text();

        if let (Some(tls), TlsMode::Explicit) = (&self.inner.tls, p.tls.mode) {
            let reply = self.exchange(wire(slot)?, &FtpCommand::AUTH, &opts).await?;
            if !reply.is_success() {
                return Err(TlsError::TlsRefused(reply.text()).into());
            }
            let plain = slot.take().ok_or(FtpError::NotConnected)?;
            let stream = plain.stream.upgrade(tls, &p.host).await?;
            self.set_wire(
                slot,
                Some(ControlWire {
                    stream,
                    read_buf: plain.read_buf,
                }),
            );
            self.log("TLS established");
        }

        let mut reply = self
            .exchange(wire(slot)?, &FtpCommand::USER(p.user.clone()), &opts)
            .await?;
        if reply.is_intermediate() {
            reply = self
                .exchange(wire(slot)?, &FtpCommand::PASS(p.password.clone()), &opts)
                .await?;
        }
        if reply.is_intermediate() {
            let account = p.account.clone().unwrap_or_default();
            reply = self
                .exchange(wire(slot)?, &FtpCommand::ACCT(account), &opts)
                .await?;
        }
        success_or_err(reply)?;

        let mut encrypt_data = false;
        if self.inner.tls.is_some() && p.tls.encrypt_data {
            self.exchange(wire(slot)?, &FtpCommand::PBSZ, &opts).await?;
            let prot = self.exchange(wire(slot)?, &FtpCommand::PROT(true), &opts).await?;
            if prot.is_success() {
                encrypt_data = true;
            } else {
                warn!("Server refused PROT P, data connections stay in clear");
                self.log("Data connections are not encrypted");
            }
        }

        let syst = self.exchange(wire(slot)?, &FtpCommand::SYST, &opts).await?;
        let system = if syst.is_success() { syst.text() } else { String::new() };

        for cmd in split_init_commands(&p.init_commands) {
            let reply = self.exchange(wire(slot)?, &cmd, &opts).await?;
            if !reply.is_success() {
                warn!("Init command '{}' failed: {}", cmd, reply.message());
            }
        }

        if let Some(path) = &p.initial_path {
            let reply = self
                .exchange(wire(slot)?, &FtpCommand::CWD(path.clone()), &opts)
                .await?;
            if !reply.is_success() {
                warn!("Unable to enter {}: {}", path, reply.message());
            }
        }

        let pwd = self.exchange(wire(slot)?, &FtpCommand::PWD, &opts).await?;
        let path = if pwd.is_success() {
            parse_pwd_reply(&pwd).unwrap_or_default()
        } else {
            String::new()
        };
        let greeting_text = lock(&self.inner.session).greeting.clone();
        let path_type = ServerPathType::detect(Some(&greeting_text), Some(&system), &path);
        debug!("Server path type detected as {:?}", path_type);

        let mut compress = false;
        if p.compress {
            let mode = self.exchange(wire(slot)?, &FtpCommand::MODE(true), &opts).await?;
            if mode.is_success() {
                compress = true;
            } else {
                info!("Server refused MODE Z, compression disabled");
                self.log("Compression disabled");
            }
        }

        let mut session = lock(&self.inner.session);
        session.system = system;
        session.path_type = path_type;
        session.working_path = if path.is_empty() { None } else { Some(path.clone()) };
        session.transfer_mode = None;
        session.compress = compress;
        session.encrypt_data = encrypt_data;
        Ok(path)
    }

    /// Sends QUIT and closes the connection.
    pub async fn quit(&self) -> Result<(), FtpError> {
        self.stop_keep_alive();
        let mut slot = self.inner.wire.lock().await;
        if let Some(wire) = slot.as_mut() {
            let opts = CommandOptions::default();
            if let Err(e) = self.exchange(wire, &FtpCommand::QUIT, &opts).await {
                debug!("QUIT failed: {}", e);
            }
            let _ = wire.stream.shutdown().await;
        }
        self.set_wire(&mut slot, None);
        self.log("Disconnected");
        Ok(())
    }

    /// Drops the socket without QUIT.
    pub async fn close(&self) {
        self.stop_keep_alive();
        let mut slot = self.inner.wire.lock().await;
        self.set_wire(&mut slot, None);
        self.log("Connection closed");
    }

    // ---- commands ---------------------------------------------------------

    /// Sends one command and returns its terminal reply, whatever its class.
    ///
    /// `Err` means the exchange itself failed; a refusal by the server is an
    /// `Ok` carrying a 4xx/5xx reply.
    pub async fn send_command(&self, cmd: &FtpCommand, opts: &CommandOptions) -> Result<FtpReply, FtpError> {
        let _regular = self.begin_regular().await;
        let mut slot = self.inner.wire.lock().await;
        let result = match wire(&mut slot) {
            Ok(wire) => self.exchange(wire, cmd, opts).await,
            Err(e) => Err(e),
        };
        self.check_fatal(&mut slot, &result);
        result
    }

    /// Like [`send_command`](Self::send_command), with anything but 2xx turned into `FtpError::Server`.
    pub async fn expect_success(&self, cmd: &FtpCommand, opts: &CommandOptions) -> Result<FtpReply, FtpError> {
        success_or_err(self.send_command(cmd, opts).await?)
    }

    /// `CWD`, skipped when the cached working path already matches.
    pub async fn change_working_path(&self, path: &str, opts: &CommandOptions) -> Result<(), FtpError> {
        let path_type = self.path_type();
        if let Some(current) = self.cached_working_path() {
            if path_type.is_same_path(&current, path) {
                trace!("Already in {}", path);
                return Ok(());
            }
        }
        self.expect_success(&FtpCommand::CWD(path.to_string()), opts).await?;
        lock(&self.inner.session).working_path = Some(path.to_string());
        Ok(())
    }

    /// `PWD`, answered from the cache unless `force` is set or the cache is invalid.
    pub async fn current_working_path(&self, force: bool, opts: &CommandOptions) -> Result<String, FtpError> {
        if !force {
            if let Some(path) = self.cached_working_path() {
                return Ok(path);
            }
        }
        let reply = self.expect_success(&FtpCommand::PWD, opts).await?;
        let path = parse_pwd_reply(&reply).ok_or_else(|| FtpError::UnexpectedReply(reply.clone()))?;
        lock(&self.inner.session).working_path = Some(path.clone());
        Ok(path)
    }

    /// `TYPE A` / `TYPE I`, skipped when the server is known to be in that mode.
    pub async fn set_transfer_mode(&self, kind: TransferType, opts: &CommandOptions) -> Result<(), FtpError> {
        if lock(&self.inner.session).transfer_mode == Some(kind) {
            return Ok(());
        }
        self.expect_success(&FtpCommand::TYPE(kind), opts).await?;
        Ok(())
    }

    fn data_params(&self) -> DataChannelParams {
        let encrypt = lock(&self.inner.session).encrypt_data;
        DataChannelParams {
            proxy: self.inner.params.proxy.clone(),
            tls: match (&self.inner.tls, encrypt) {
                (Some(tls), true) => Some((tls.clone(), self.inner.params.host.clone())),
                _ => None,
            },
            connect_timeout: self.inner.params.server_reply_timeout,
        }
    }

    /// Runs a data transfer command (`LIST`, `RETR`, `STOR`, `APPE`) with `data`.
    ///
    /// Returns the completion reply. When the server refuses the command the
    /// refusal is returned and `data` never connects. Callers still check
    /// `data.has_errors()` before trusting a 2xx.
    pub async fn transfer(
        &self,
        cmd: &FtpCommand,
        rest: Option<u64>,
        data: &mut DataConnection,
        opts: &CommandOptions,
    ) -> Result<FtpReply, FtpError> {
        let _regular = self.begin_regular().await;
        let mut slot = self.inner.wire.lock().await;
        let result = match wire(&mut slot) {
            Ok(wire) => self.transfer_on(wire, cmd, rest, data, opts).await,
            Err(e) => Err(e),
        };
        self.check_fatal(&mut slot, &result);
        result
    }

    async fn open_data(&self, wire: &mut ControlWire, opts: &CommandOptions) -> Result<Result<PendingData, FtpReply>, FtpError> {
        let params = self.data_params();
        if self.inner.params.passive_mode {
            let reply = self.exchange(wire, &FtpCommand::PASV, opts).await?;
            if !reply.is_success() {
                return Ok(Err(reply));
            }
            let announced = parse_pasv_reply(&reply).ok_or_else(|| FtpError::UnexpectedReply(reply.clone()))?;
            let addr = if announced.ip().is_unspecified() {
                SocketAddr::new(wire.stream.peer_addr()?.ip(), announced.port())
            } else {
                SocketAddr::V4(announced)
            };
            trace!("Passive data connection to {}", addr);
            Ok(Ok(data::connect_passive(addr, &params).await?))
        } else {
            let local_ip = wire.stream.local_addr()?.ip();
            let server = wire.stream.peer_addr()?;
            let (pending, addr) = data::listen_active(local_ip, server, &params).await?;
            let addr = match addr {
                SocketAddr::V4(v4) => v4,
                SocketAddr::V6(_) => match local_ip {
                    IpAddr::V4(ip) => SocketAddrV4::new(ip, addr.port()),
                    IpAddr::V6(_) => {
                        return Err(DataConnectionError::Network("PORT needs an IPv4 address".into()).into())
                    }
                },
            };
            let reply = self
                .exchange(wire, &FtpCommand::PORT(format_port_argument(addr)), opts)
                .await?;
            if !reply.is_success() {
                return Ok(Err(reply));
            }
            Ok(Ok(pending))
        }
    }

    async fn transfer_on(
        &self,
        wire: &mut ControlWire,
        cmd: &FtpCommand,
        rest: Option<u64>,
        data: &mut DataConnection,
        opts: &CommandOptions,
    ) -> Result<FtpReply, FtpError> {
        let pending = match self.open_data(wire, opts).await? {
            Ok(pending) => pending,
            Err(refusal) => return Ok(refusal),
        };

        if let Some(offset) = rest {
            let reply = self.exchange(wire, &FtpCommand::REST(offset), opts).await?;
            if !reply.is_intermediate() {
                return Ok(reply);
            }
        }

        let reply_timeout = self.reply_timeout(opts);
        self.write_command(wire, cmd).await?;
        let first = self.read_until(wire, opts, Some(reply_timeout), true).await?;
        if !first.is_preliminary() {
            self.after_command(cmd, &first);
            return Ok(first);
        }
        data.stats().set_expected(parse_data_size(&first));

        let params = self.data_params();
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let moving = async {
            let result = data.run(pending, &params).await;
            let _ = done_tx.send(());
            result
        };
        let completion = async {
            // No reply deadline while data flows; once the data side is done the
            // server gets the usual reply timeout.
            let read = self.read_until(wire, opts, None, false);
            tokio::pin!(read);
            tokio::select! {
                reply = &mut read => reply,
                _ = done_rx => match timeout(reply_timeout, &mut read).await {
                    Ok(reply) => reply,
                    Err(_) => Err(FtpError::ReplyTimeout(reply_timeout.as_secs())),
                },
            }
        };
        let (moved, reply) = tokio::join!(moving, completion);
        if let Err(e) = moved {
            debug!("Data transfer for '{}' failed: {}", cmd, e);
        }
        let reply = reply?;
        self.after_command(cmd, &reply);
        Ok(reply)
    }

    /// Lists `path` (or the working directory) into memory. Empty-directory
    /// errors of some servers yield an empty listing.
    pub async fn list(&self, path: Option<&str>, opts: &CommandOptions) -> Result<Vec<u8>, FtpError> {
        self.set_transfer_mode(TransferType::Ascii, opts).await?;
        let mut data = DataConnection::download(DataSink::Memory, self.inner.params.no_data_timeout)
            .with_compression(self.compress_enabled());
        let cmd = FtpCommand::LIST(self.inner.params.list_command.clone(), path.map(str::to_string));
        let reply = self.transfer(&cmd, None, &mut data, opts).await?;
        if reply.is_success() {
            if let Some(e) = data.first_error() {
                return Err(e.clone().into());
            }
            Ok(data.give_data())
        } else if is_empty_listing_error(&reply) {
            Ok(Vec::new())
        } else {
            Err(FtpError::Server(reply))
        }
    }

    /// Lists `path` through the listing cache. The cache lock is never held
    /// while talking to the server.
    pub async fn list_cached(
        &self,
        cache: &ListingCache,
        path: &str,
        refresh: bool,
        opts: &CommandOptions,
    ) -> Result<Arc<[u8]>, FtpError> {
        let key = self.cache_key(path);
        if !refresh {
            if let Some(hit) = cache.lookup(&key) {
                return Ok(hit.listing);
            }
        }
        let started = Instant::now();
        let captured_at = Local::now();
        let listing = self.list(Some(path), opts).await?;
        cache.insert(key, &listing, captured_at, started);
        Ok(Arc::from(listing))
    }

    // ---- keep-alive -------------------------------------------------------

    fn start_keep_alive(&self) {
        if !self.inner.params.keep_alive.enabled {
            return;
        }
        lock(&self.inner.keep_alive).start();
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(keep_alive_loop(weak));
        if let Some(previous) = lock(&self.inner.keep_alive_task).replace(task) {
            previous.abort();
        }
        debug!("Keep-alive started for {}", self.host());
    }

    fn stop_keep_alive(&self) {
        lock(&self.inner.keep_alive).stop();
        if let Some(task) = lock(&self.inner.keep_alive_task).take() {
            task.abort();
        }
    }

    async fn send_probe(&self) -> Result<(), FtpError> {
        let opts = CommandOptions::default();
        let mut slot = self.inner.wire.lock().await;
        let result = match wire(&mut slot) {
            Ok(wire) => match self.inner.params.keep_alive.command {
                KeepAliveCommand::Noop => self.exchange(wire, &FtpCommand::NOOP, &opts).await.map(|_| ()),
                KeepAliveCommand::Pwd => self.exchange(wire, &FtpCommand::PWD, &opts).await.map(|_| ()),
                kind @ (KeepAliveCommand::Nlst | KeepAliveCommand::List) => {
                    let list = if kind == KeepAliveCommand::Nlst { "NLST" } else { "LIST" };
                    let mut data = DataConnection::download(DataSink::Discard, self.inner.params.no_data_timeout)
                        .with_compression(self.compress_enabled());
                    self.transfer_on(wire, &FtpCommand::LIST(list.to_string(), None), None, &mut data, &opts)
                        .await
                        .map(|_| ())
                }
            },
            Err(e) => Err(e),
        };
        self.check_fatal(&mut slot, &result);
        // Refusals and data errors do not matter, only a dead connection does.
        match result {
            Err(e) if e.is_connection_fatal() => Err(e),
            _ => Ok(()),
        }
    }
}

async fn keep_alive_loop(weak: Weak<Inner>) {
    loop {
        let next = {
            let Some(inner) = weak.upgrade() else { return };
            let state = lock(&inner.keep_alive);
            state.next_probe_at(&inner.params.keep_alive)
        };
        let Some(next) = next else {
            if let Some(inner) = weak.upgrade() {
                lock(&inner.keep_alive).stop();
                debug!("Keep-alive expired for {}", inner.params.host);
            }
            return;
        };
        tokio::time::sleep_until(next.into()).await;

        let Some(inner) = weak.upgrade() else { return };
        let conn = ControlConnection { inner };
        let due = {
            let mut state = lock(&conn.inner.keep_alive);
            match state.next_probe_at(&conn.inner.params.keep_alive) {
                Some(at) if at <= Instant::now() => state.begin_probe(),
                _ => false,
            }
        };
        if !due {
            continue;
        }
        let result = conn.send_probe().await;
        lock(&conn.inner.keep_alive).end_probe();
        conn.inner.probe_finished.notify_waiters();
        if let Err(e) = result {
            warn!("Keep-alive on {} failed: {}", conn.host(), e);
            conn.log(&format!("Keep-alive failed: {}", e));
            lock(&conn.inner.keep_alive).stop();
            return;
        }
    }
}
