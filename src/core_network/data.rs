// Connexion de données : une socket par listing, téléchargement, envoi ou sonde

use crate::constants::{
    DATACON_BYTES_TO_READ, DATACON_FLUSH_BUFFER_SIZE, DATACON_FLUSH_TIMEOUT_MS,
    DATACON_NO_DATA_CHECK_MS, DATACON_UPLOAD_BUFFER_SIZE, SPEED_SAMPLE_WINDOW_SECS,
};
use crate::core_disk::{DiskError, DiskFlusher};
use crate::core_error::ErrorCategory;
use crate::core_network::proxy::{self, ProxyConfig, ProxyKind, ProxyListener};
use crate::core_network::transport::Transport;
use crate::core_tls::TlsConnection;
use flate2::write::ZlibEncoder;
use flate2::{Compression, Decompress, FlushDecompress, Status};
use log::{debug, trace, warn};
use std::collections::VecDeque;
use std::future::Future;
use std::io::{ErrorKind, SeekFrom, Write};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{interval, timeout, MissedTickBehavior};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataConnectionError {
    #[error("Data connection failed: {0}")]
    Network(String),

    #[error("Not enough memory for the data connection")]
    LowMemory,

    #[error("Target file error: {0}")]
    TargetFile(String),

    #[error("Unable to decompress data: {0}")]
    Decompression(String),

    #[error("SSL error on data connection: {0}")]
    Ssl(String),

    #[error("No data transferred for {0} seconds")]
    NoDataTimeout(u64),
}

impl DataConnectionError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            DataConnectionError::Network(_)
            | DataConnectionError::Ssl(_)
            | DataConnectionError::NoDataTimeout(_) => ErrorCategory::Network,
            DataConnectionError::LowMemory
            | DataConnectionError::TargetFile(_)
            | DataConnectionError::Decompression(_) => ErrorCategory::Resource,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DataConnectionError::Network(_) | DataConnectionError::NoDataTimeout(_)
        )
    }
}

impl From<DiskError> for DataConnectionError {
    fn from(e: DiskError) -> Self {
        match e {
            DiskError::LowMemory => DataConnectionError::LowMemory,
            other => DataConnectionError::TargetFile(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    NeverConnected,
    Transferring,
    /// Connected once, now closed.
    Closed,
}

/// Socket-level settings shared by every data connection of a session.
#[derive(Clone)]
pub struct DataChannelParams {
    pub proxy: ProxyConfig,
    /// Connector and server name when data connections are encrypted.
    pub tls: Option<(TlsConnection, String)>,
    pub connect_timeout: Duration,
}

pub enum DataListener {
    Local(TcpListener),
    Proxy(ProxyListener),
}

/// A data socket opened before the transfer command was sent.
pub enum PendingData {
    Connected(TcpStream),
    Listening(DataListener),
}

fn network_error(e: impl std::fmt::Display) -> DataConnectionError {
    DataConnectionError::Network(e.to_string())
}

/// Dials the address announced by `PASV`, retrying once if it is refused.
pub async fn connect_passive(
    addr: SocketAddr,
    params: &DataChannelParams,
) -> Result<PendingData, DataConnectionError> {
    let host = addr.ip().to_string();
    let stream = retry_refused(addr, || {
        proxy::connect(&params.proxy, &host, addr.port(), params.connect_timeout)
    })
    .await
    .map_err(network_error)?;
    Ok(PendingData::Connected(stream))
}

async fn retry_refused<T, F, Fut>(addr: SocketAddr, mut dial: F) -> Result<T, proxy::ProxyError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, proxy::ProxyError>>,
{
    match dial().await {
        Err(proxy::ProxyError::Io(e)) if e.kind() == ErrorKind::ConnectionRefused => {
            debug!("Data connection to {} refused, retrying once", addr);
            dial().await
        }
        other => other,
    }
}

/// Opens the listening side of an active data connection.
///
/// Returns the address to announce with `PORT`.
pub async fn listen_active(
    local_ip: IpAddr,
    server: SocketAddr,
    params: &DataChannelParams,
) -> Result<(PendingData, SocketAddr), DataConnectionError> {
    match params.proxy.kind {
        ProxyKind::Socks4 | ProxyKind::Socks4a | ProxyKind::Socks5 => {
            let listener = proxy::bind(&params.proxy, server, params.connect_timeout)
                .await
                .map_err(network_error)?;
            let addr = listener.addr;
            Ok((PendingData::Listening(DataListener::Proxy(listener)), addr))
        }
        _ => {
            let listener = TcpListener::bind((local_ip, 0)).await.map_err(network_error)?;
            let addr = listener.local_addr().map_err(network_error)?;
            Ok((PendingData::Listening(DataListener::Local(listener)), addr))
        }
    }
}

impl PendingData {
    async fn establish(
        self,
        params: &DataChannelParams,
        accept_timeout: Duration,
    ) -> Result<Transport, DataConnectionError> {
        let stream = match self {
            PendingData::Connected(stream) => stream,
            PendingData::Listening(DataListener::Local(listener)) => {
                let (stream, peer) = timeout(accept_timeout, listener.accept())
                    .await
                    .map_err(|_| DataConnectionError::NoDataTimeout(accept_timeout.as_secs()))?
                    .map_err(network_error)?;
                debug!("Server opened the data connection from {}", peer);
                stream
            }
            PendingData::Listening(DataListener::Proxy(listener)) => {
                timeout(accept_timeout, listener.accept())
                    .await
                    .map_err(|_| DataConnectionError::NoDataTimeout(accept_timeout.as_secs()))?
                    .map_err(network_error)?
            }
        };
        let transport = Transport::Plain(stream);
        match &params.tls {
            Some((connector, host)) => transport
                .upgrade(connector, host)
                .await
                .map_err(|e| DataConnectionError::Ssl(e.to_string())),
            None => Ok(transport),
        }
    }
}

/// Byte counters and speed sample, readable while the transfer runs.
#[derive(Debug, Default)]
pub struct TransferStats {
    bytes: AtomicU64,
    meter: Mutex<SpeedMeter>,
}

#[derive(Debug, Default)]
struct SpeedMeter {
    samples: VecDeque<(Instant, u64)>,
    expected: Option<u64>,
}

impl TransferStats {
    pub fn record(&self, n: usize) {
        self.bytes.fetch_add(n as u64, Ordering::Relaxed);
        let now = Instant::now();
        let window = Duration::from_secs(SPEED_SAMPLE_WINDOW_SECS);
        let mut meter = self.meter.lock().unwrap_or_else(|e| e.into_inner());
        meter.samples.push_back((now, n as u64));
        while let Some((at, _)) = meter.samples.front() {
            if now.duration_since(*at) > window {
                meter.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Wire bytes moved so far.
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Bytes per second over the last few seconds.
    pub fn speed(&self) -> u64 {
        let meter = self.meter.lock().unwrap_or_else(|e| e.into_inner());
        let total: u64 = meter.samples.iter().map(|(_, n)| n).sum();
        match meter.samples.front() {
            Some((first, _)) => {
                let elapsed = first.elapsed().as_secs_f64().max(1.0);
                (total as f64 / elapsed) as u64
            }
            None => 0,
        }
    }

    pub fn set_expected(&self, size: Option<u64>) {
        self.meter.lock().unwrap_or_else(|e| e.into_inner()).expected = size;
    }

    /// Size announced by the server in its `150` reply, if any.
    pub fn expected(&self) -> Option<u64> {
        self.meter.lock().unwrap_or_else(|e| e.into_inner()).expected
    }
}

pub enum DataSink {
    /// Keep the bytes for [`DataConnection::give_data`].
    Memory,
    /// Read and drop, used by keep-alive listings.
    Discard,
    File(DiskFlusher),
}

pub enum DataSource {
    Memory(Vec<u8>),
    File { path: PathBuf, offset: u64 },
}

enum Direction {
    Download(DataSink),
    Upload(Option<DataSource>),
}

/// Whether `data` looks like binary content, for ASCII mode downloads.
pub fn contains_binary(data: &[u8]) -> bool {
    data.iter()
        .any(|&b| b < 0x20 && !matches!(b, b'\t' | b'\n' | b'\r' | 0x0C | 0x1A))
}

pub struct DataConnection {
    direction: Direction,
    pending: Vec<u8>,
    received: Vec<u8>,
    inflater: Option<Decompress>,
    compress: bool,
    check_ascii: bool,
    binary_detected: bool,
    state: TransferState,
    errors: Vec<DataConnectionError>,
    stats: Arc<TransferStats>,
    no_data_timeout: Duration,
}

impl DataConnection {
    pub fn download(sink: DataSink, no_data_timeout: Duration) -> Self {
        Self::new(Direction::Download(sink), no_data_timeout)
    }

    pub fn upload(source: DataSource, no_data_timeout: Duration) -> Self {
        Self::new(Direction::Upload(Some(source)), no_data_timeout)
    }

    fn new(direction: Direction, no_data_timeout: Duration) -> Self {
        Self {
            direction,
            pending: Vec::new(),
            received: Vec::new(),
            inflater: None,
            compress: false,
            check_ascii: false,
            binary_detected: false,
            state: TransferState::NeverConnected,
            errors: Vec::new(),
            stats: Arc::new(TransferStats::default()),
            no_data_timeout,
        }
    }

    /// `MODE Z`: inflate downloads, deflate uploads.
    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compress = enabled;
        self.inflater = if enabled { Some(Decompress::new(true)) } else { None };
        self
    }

    pub fn with_ascii_check(mut self, enabled: bool) -> Self {
        self.check_ascii = enabled;
        self
    }

    pub fn stats(&self) -> Arc<TransferStats> {
        Arc::clone(&self.stats)
    }

    pub fn transfer_state(&self) -> TransferState {
        self.state
    }

    pub fn is_transferring(&self) -> bool {
        self.state == TransferState::Transferring
    }

    pub fn errors(&self) -> &[DataConnectionError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn first_error(&self) -> Option<&DataConnectionError> {
        self.errors.first()
    }

    pub fn binary_detected(&self) -> bool {
        self.binary_detected
    }

    /// Hands over the bytes collected by a [`DataSink::Memory`] download.
    pub fn give_data(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.received)
    }

    /// Drops a socket that will not be used, e.g. after the server refused the command.
    pub fn abandon(&mut self, pending: PendingData) {
        drop(pending);
        self.direction = Direction::Download(DataSink::Discard);
    }

    /// Moves the data until the server closes the connection (download) or
    /// the source is exhausted (upload). Errors are also kept in [`errors`](Self::errors).
    pub async fn run(
        &mut self,
        pending: PendingData,
        params: &DataChannelParams,
    ) -> Result<(), DataConnectionError> {
        let result = self.run_inner(pending, params).await;
        let closed = self.finish_sink().await;
        if self.state != TransferState::NeverConnected {
            self.state = TransferState::Closed;
        }
        let result = result.and(closed);
        if let Err(e) = &result {
            warn!("Data connection error: {}", e);
            self.errors.push(e.clone());
        }
        result
    }

    async fn run_inner(
        &mut self,
        pending: PendingData,
        params: &DataChannelParams,
    ) -> Result<(), DataConnectionError> {
        let mut stream = pending.establish(params, self.no_data_timeout).await?;
        self.state = TransferState::Transferring;
        let is_tls = stream.is_tls();
        let result = if matches!(self.direction, Direction::Upload(_)) {
            self.pump_upload(&mut stream).await
        } else {
            self.pump_download(&mut stream).await
        };
        result.map_err(|e| match e {
            DataConnectionError::Network(msg) if is_tls => DataConnectionError::Ssl(msg),
            other => other,
        })
    }

    async fn pump_download(&mut self, stream: &mut Transport) -> Result<(), DataConnectionError> {
        let mut chunk = vec![0u8; DATACON_BYTES_TO_READ];
        if matches!(self.direction, Direction::Download(DataSink::File(_))) {
            self.pending
                .try_reserve_exact(DATACON_FLUSH_BUFFER_SIZE)
                .map_err(|_| DataConnectionError::LowMemory)?;
        }
        let mut last_byte = Instant::now();
        let check_every = Duration::from_millis(DATACON_NO_DATA_CHECK_MS)
            .min(self.no_data_timeout)
            .max(Duration::from_millis(DATACON_FLUSH_TIMEOUT_MS / 10));
        let mut no_data_check = interval(check_every);
        no_data_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        no_data_check.tick().await;
        let mut flush_timer = interval(Duration::from_millis(DATACON_FLUSH_TIMEOUT_MS));
        flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        flush_timer.tick().await;

        loop {
            tokio::select! {
                read = stream.read(&mut chunk) => {
                    let n = match read {
                        Ok(n) => n,
                        // Servers often drop TLS data sockets without close_notify.
                        Err(e) if e.kind() == ErrorKind::UnexpectedEof => 0,
                        Err(e) => return Err(network_error(e)),
                    };
                    if n == 0 {
                        break;
                    }
                    last_byte = Instant::now();
                    self.stats.record(n);
                    self.accept_bytes(&chunk[..n]).await?;
                }
                _ = no_data_check.tick() => {
                    if last_byte.elapsed() >= self.no_data_timeout {
                        return Err(DataConnectionError::NoDataTimeout(self.no_data_timeout.as_secs()));
                    }
                }
                _ = flush_timer.tick() => {
                    self.flush_idle_buffer().await?;
                }
            }
        }
        self.finish_inflate().await?;
        trace!("Download finished after {} wire bytes", self.stats.bytes());
        Ok(())
    }

    async fn accept_bytes(&mut self, wire: &[u8]) -> Result<(), DataConnectionError> {
        match self.inflater.as_mut() {
            Some(inflater) => {
                let plain = inflate(inflater, wire, FlushDecompress::None)?;
                self.deliver(&plain).await
            }
            None => self.deliver(wire).await,
        }
    }

    async fn finish_inflate(&mut self) -> Result<(), DataConnectionError> {
        if let Some(inflater) = self.inflater.as_mut() {
            let tail = inflate(inflater, &[], FlushDecompress::Finish)?;
            if !tail.is_empty() {
                self.deliver(&tail).await?;
            }
        }
        Ok(())
    }

    async fn deliver(&mut self, data: &[u8]) -> Result<(), DataConnectionError> {
        if self.check_ascii && !self.binary_detected && contains_binary(data) {
            debug!("Binary content in an ASCII mode transfer");
            self.binary_detected = true;
        }
        match &mut self.direction {
            Direction::Download(DataSink::Memory) => {
                self.received
                    .try_reserve(data.len())
                    .map_err(|_| DataConnectionError::LowMemory)?;
                self.received.extend_from_slice(data);
            }
            Direction::Download(DataSink::File(flusher)) => {
                self.pending.extend_from_slice(data);
                if self.pending.len() >= DATACON_FLUSH_BUFFER_SIZE {
                    let full = std::mem::take(&mut self.pending);
                    self.pending = flusher.submit(full).await?;
                }
            }
            Direction::Download(DataSink::Discard) | Direction::Upload(_) => {}
        }
        Ok(())
    }

    /// Hands a partly filled buffer to the disk when nothing else is being written.
    async fn flush_idle_buffer(&mut self) -> Result<(), DataConnectionError> {
        if let Direction::Download(DataSink::File(flusher)) = &mut self.direction {
            if !self.pending.is_empty() && !flusher.is_flushing()? {
                let partial = std::mem::take(&mut self.pending);
                self.pending = flusher.submit(partial).await?;
            }
        }
        Ok(())
    }

    async fn finish_sink(&mut self) -> Result<(), DataConnectionError> {
        let direction = std::mem::replace(&mut self.direction, Direction::Upload(None));
        match direction {
            Direction::Download(DataSink::File(flusher)) => {
                let rest = std::mem::take(&mut self.pending);
                flusher.close(rest).await?;
                self.direction = Direction::Download(DataSink::Discard);
            }
            other => self.direction = other,
        }
        Ok(())
    }

    async fn pump_upload(&mut self, stream: &mut Transport) -> Result<(), DataConnectionError> {
        let source = match &mut self.direction {
            Direction::Upload(source) => source.take(),
            Direction::Download(_) => None,
        };
        let mut encoder = if self.compress {
            Some(ZlibEncoder::new(Vec::new(), Compression::default()))
        } else {
            None
        };
        match source {
            Some(DataSource::Memory(bytes)) => {
                for chunk in bytes.chunks(DATACON_UPLOAD_BUFFER_SIZE) {
                    self.send_chunk(stream, encoder.as_mut(), chunk).await?;
                }
            }
            Some(DataSource::File { path, offset }) => {
                let mut file = tokio::fs::File::open(&path)
                    .await
                    .map_err(|e| DataConnectionError::TargetFile(format!("{}: {}", path.display(), e)))?;
                if offset > 0 {
                    file.seek(SeekFrom::Start(offset))
                        .await
                        .map_err(|e| DataConnectionError::TargetFile(e.to_string()))?;
                }
                let mut buffer = Vec::new();
                buffer
                    .try_reserve_exact(DATACON_UPLOAD_BUFFER_SIZE)
                    .map_err(|_| DataConnectionError::LowMemory)?;
                buffer.resize(DATACON_UPLOAD_BUFFER_SIZE, 0);
                loop {
                    let n = file
                        .read(&mut buffer)
                        .await
                        .map_err(|e| DataConnectionError::TargetFile(e.to_string()))?;
                    if n == 0 {
                        break;
                    }
                    self.send_chunk(stream, encoder.as_mut(), &buffer[..n]).await?;
                }
            }
            None => {}
        }
        if let Some(encoder) = encoder {
            let tail = encoder
                .finish()
                .map_err(|e| DataConnectionError::Decompression(e.to_string()))?;
            self.write_wire(stream, &tail).await?;
        }
        timeout(self.no_data_timeout, stream.shutdown())
            .await
            .map_err(|_| DataConnectionError::NoDataTimeout(self.no_data_timeout.as_secs()))?
            .map_err(network_error)?;
        Ok(())
    }

    async fn send_chunk(
        &mut self,
        stream: &mut Transport,
        encoder: Option<&mut ZlibEncoder<Vec<u8>>>,
        chunk: &[u8],
    ) -> Result<(), DataConnectionError> {
        match encoder {
            Some(encoder) => {
                encoder
                    .write_all(chunk)
                    .map_err(|e| DataConnectionError::Decompression(e.to_string()))?;
                let compressed = std::mem::take(encoder.get_mut());
                self.write_wire(stream, &compressed).await
            }
            None => self.write_wire(stream, chunk).await,
        }
    }

    async fn write_wire(&mut self, stream: &mut Transport, bytes: &[u8]) -> Result<(), DataConnectionError> {
        if bytes.is_empty() {
            return Ok(());
        }
        timeout(self.no_data_timeout, stream.write_all(bytes))
            .await
            .map_err(|_| DataConnectionError::NoDataTimeout(self.no_data_timeout.as_secs()))?
            .map_err(network_error)?;
        self.stats.record(bytes.len());
        Ok(())
    }
}

fn inflate(
    inflater: &mut Decompress,
    input: &[u8],
    flush: FlushDecompress,
) -> Result<Vec<u8>, DataConnectionError> {
    let mut out = Vec::new();
    let mut consumed = 0usize;
    loop {
        out.try_reserve(input.len().saturating_mul(2) + DATACON_BYTES_TO_READ)
            .map_err(|_| DataConnectionError::LowMemory)?;
        let before_in = inflater.total_in();
        let before_out = inflater.total_out();
        let status = inflater
            .decompress_vec(&input[consumed..], &mut out, flush)
            .map_err(|e| DataConnectionError::Decompression(e.to_string()))?;
        consumed += (inflater.total_in() - before_in) as usize;
        let produced = inflater.total_out() - before_out;
        if status == Status::StreamEnd {
            break;
        }
        if consumed >= input.len() && out.len() < out.capacity() {
            break;
        }
        if produced == 0 && inflater.total_in() == before_in {
            break;
        }
    }
    Ok(out)
}
