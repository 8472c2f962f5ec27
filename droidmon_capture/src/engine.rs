use crate::resolver::Resolver;
use crate::snooper::{extract_host_from_url, extract_path_from_url};
use crate::trace::TraceParser;
use crate::types::{CaptureMode, CaptureStats, Connection, NetworkPacket, Protocol};
use crate::ProcNetParser;
use droidmon_adb::{AdbError, Client};
use droidmon_utils::unix_time::unix_now_ms;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

// Streams packet summaries in text mode, no name resolution,
// line-buffered, truncated snapshots.
const TCPDUMP_CMD: &str = "tcpdump -i any -n -l -s 256 -q 2>/dev/null";

const MODE_PROBE_CMD: &str = "which tcpdump 2>/dev/null || command -v tcpdump 2>/dev/null";
const MODE_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const PROCNET_SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval for socket-table mode.
pub const PROCNET_POLL_INTERVAL: Duration = Duration::from_secs(2);

const CHANNEL_CAPACITY: usize = 512;

const PROCNET_TABLES: [(&str, Protocol); 4] = [
    ("cat /proc/net/tcp 2>/dev/null", Protocol::Tcp),
    ("cat /proc/net/tcp6 2>/dev/null", Protocol::Tcp),
    ("cat /proc/net/udp 2>/dev/null", Protocol::Udp),
    ("cat /proc/net/udp6 2>/dev/null", Protocol::Udp),
];

/// Lock-free capture counters, shared with the application so status
/// queries never touch the engine.
#[derive(Default)]
pub struct EngineStats {
    serial: Mutex<String>,
    mode: Mutex<String>,
    packet_count: AtomicU64,
    conn_count: AtomicU64,
    bytes_read: AtomicU64,
    started_at: AtomicU64,
    last_activity: AtomicU64,
    errors: AtomicU64,
}

impl EngineStats {
    fn touch(&self) {
        self.last_activity.store(unix_now_ms(), Ordering::Relaxed);
    }

    /// A point-in-time copy of the counters.
    pub fn snapshot(&self) -> CaptureStats {
        CaptureStats {
            serial: self.serial.lock().clone(),
            mode: self.mode.lock().clone(),
            packet_count: self.packet_count.load(Ordering::Relaxed),
            conn_count: self.conn_count.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            started_at: self.started_at.load(Ordering::Relaxed),
            last_activity: self.last_activity.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Network capture for a single device.
///
/// Picks the best capture mode (tcpdump stream or socket-table polling),
/// runs the corresponding loop, enriches what it sees through the
/// [`Resolver`], and emits packets and connections into bounded output
/// channels. On a full channel the item is dropped and counted; the
/// capture loop never blocks on a slow consumer.
pub struct Engine {
    client: Client,
    serial: String,
    mode: CaptureMode,
    resolver: Arc<Resolver>,

    packet_tx: mpsc::Sender<NetworkPacket>,
    packet_rx: Mutex<Option<mpsc::Receiver<NetworkPacket>>>,
    conn_tx: mpsc::Sender<Connection>,
    conn_rx: Mutex<Option<mpsc::Receiver<Connection>>>,

    stats: Arc<EngineStats>,
}

impl Engine {
    /// Creates an engine for `serial`. [`CaptureMode::Auto`] probes the
    /// device at start; any other mode disables detection.
    pub fn new(client: Client, serial: &str, mode: CaptureMode) -> Arc<Self> {
        let (packet_tx, packet_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (conn_tx, conn_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let resolver = Resolver::new(client.clone(), serial);

        let stats = Arc::new(EngineStats::default());
        *stats.serial.lock() = serial.to_string();
        *stats.mode.lock() = mode.to_string();

        Arc::new(Self {
            client,
            serial: serial.to_string(),
            mode,
            resolver,
            packet_tx,
            packet_rx: Mutex::new(Some(packet_rx)),
            conn_tx,
            conn_rx: Mutex::new(Some(conn_rx)),
            stats,
        })
    }

    /// The packet output channel. Only the first caller gets it.
    pub fn take_packets(&self) -> Option<mpsc::Receiver<NetworkPacket>> {
        self.packet_rx.lock().take()
    }

    /// The connection output channel. Only the first caller gets it.
    pub fn take_connections(&self) -> Option<mpsc::Receiver<Connection>> {
        self.conn_rx.lock().take()
    }

    /// Shared counter handle for status queries.
    pub fn stats(&self) -> Arc<EngineStats> {
        Arc::clone(&self.stats)
    }

    /// Runs the capture session until the scope is cancelled or the
    /// stream ends. Starts the resolver (and with it the snooper), then
    /// enters the selected mode loop.
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> Result<(), AdbError> {
        let mode = match self.mode {
            CaptureMode::Auto => self.detect_mode().await,
            explicit => explicit,
        };

        *self.stats.mode.lock() = mode.to_string();
        self.stats.started_at.store(unix_now_ms(), Ordering::Relaxed);
        info!(serial = %self.serial, %mode, "capture engine starting");

        Arc::clone(&self.resolver).start(&token);

        // Log-derived HTTP observations flow regardless of mode.
        if let Some(urls) = self.resolver.snooper().take_urls() {
            let this = Arc::clone(&self);
            let url_token = token.clone();
            tokio::spawn(async move {
                this.drain_url_captures(urls, url_token).await;
            });
        }

        match mode {
            CaptureMode::Tcpdump => self.run_tcpdump(&token).await,
            _ => self.run_procnet(&token).await,
        }
    }

    /// Probes the device for a usable tcpdump binary.
    async fn detect_mode(&self) -> CaptureMode {
        let probe = tokio::time::timeout(
            MODE_PROBE_TIMEOUT,
            self.client.shell(&self.serial, MODE_PROBE_CMD),
        )
        .await;

        match probe {
            Ok(Ok(path)) if !path.trim().is_empty() => {
                info!(serial = %self.serial, path = %path.trim(), "tcpdump available on device");
                CaptureMode::Tcpdump
            }
            _ => {
                info!(serial = %self.serial, "tcpdump not available, polling /proc/net");
                CaptureMode::ProcNet
            }
        }
    }

    /// Streams tcpdump output. A packet is emitted when the next packet
    /// header arrives; the lines in between enrich it with HTTP fields.
    async fn run_tcpdump(&self, token: &CancellationToken) -> Result<(), AdbError> {
        let mut stream = self
            .client
            .open_shell_stream(&self.serial, TCPDUMP_CMD, token)
            .await?;

        let mut parser = TraceParser::new(&self.serial);
        let mut current: Option<NetworkPacket> = None;

        loop {
            let line = match stream.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    // Emit what we were building before propagating.
                    if let Some(pkt) = current.take() {
                        self.emit_packet(pkt);
                    }
                    return Err(e);
                }
            };

            self.stats
                .bytes_read
                .fetch_add(line.len() as u64 + 1, Ordering::Relaxed);

            if let Some(pkt) = parser.parse_line(&line) {
                if let Some(prev) = current.take() {
                    self.emit_packet(prev);
                }
                current = Some(pkt);
            } else if let Some(pkt) = current.as_mut() {
                parser.enrich_http(pkt, &line);
            }
        }

        if let Some(pkt) = current.take() {
            self.emit_packet(pkt);
        }
        Ok(())
    }

    /// Polls the four /proc/net tables and diffs against the known set.
    async fn run_procnet(&self, token: &CancellationToken) -> Result<(), AdbError> {
        let mut parser = ProcNetParser::new(&self.serial);
        let mut known: HashMap<String, Connection> = HashMap::new();

        self.scan_procnet(&mut parser, &mut known).await;

        let mut ticker = tokio::time::interval(PROCNET_POLL_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => return Err(AdbError::Cancelled),
                _ = ticker.tick() => self.scan_procnet(&mut parser, &mut known).await,
            }
        }
    }

    async fn scan_procnet(
        &self,
        parser: &mut ProcNetParser,
        known: &mut HashMap<String, Connection>,
    ) {
        let now = unix_now_ms();
        let mut conns: Vec<Connection> = Vec::new();

        for (i, (cmd, proto)) in PROCNET_TABLES.iter().enumerate() {
            let out = tokio::time::timeout(
                PROCNET_SNAPSHOT_TIMEOUT,
                self.client.shell(&self.serial, cmd),
            )
            .await;
            match out {
                Ok(Ok(out)) => conns.extend(parser.parse_table(&out, *proto, now)),
                _ if i == 0 => {
                    // If even the base table fails, the device is likely
                    // gone; skip this scan entirely.
                    debug!(serial = %self.serial, "failed to read /proc/net/tcp");
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                _ => {}
            }
        }

        let mut seen: HashSet<String> = HashSet::with_capacity(conns.len());

        for mut c in conns {
            let key = c.identity_key();
            seen.insert(key.clone());

            if let Some(prev) = known.get(&key) {
                c.first_seen = prev.first_seen;
                c.last_seen = now;
                c.id = prev.id.clone();
                if prev.hostname.is_empty() {
                    self.resolver.enrich_connection(&mut c);
                    if !c.hostname.is_empty() {
                        // The snooper learned a name since last scan;
                        // push the refreshed record.
                        self.emit_connection(c.clone());
                    }
                } else {
                    c.hostname = prev.hostname.clone();
                    c.app_name = prev.app_name.clone();
                }
                known.insert(key, c);
                continue;
            }

            // New connection.
            c.first_seen = now;
            c.last_seen = now;
            self.resolver.enrich_connection(&mut c);
            known.insert(key, c.clone());

            self.stats.conn_count.fetch_add(1, Ordering::Relaxed);

            self.emit_packet(conn_to_packet(&c));
            self.emit_connection(c);
        }

        known.retain(|key, _| seen.contains(key));
    }

    /// Turns logcat URL observations into synthetic packets.
    async fn drain_url_captures(
        &self,
        mut urls: mpsc::Receiver<crate::snooper::UrlCapture>,
        token: CancellationToken,
    ) {
        let mut next_id: u64 = 0;
        loop {
            let capture = tokio::select! {
                _ = token.cancelled() => return,
                capture = urls.recv() => match capture {
                    Some(capture) => capture,
                    None => return,
                },
            };

            let host = extract_host_from_url(&capture.url);
            let path = extract_path_from_url(&capture.url);
            let method = if capture.method.is_empty() {
                "GET".to_string()
            } else {
                capture.method.clone()
            };

            next_id += 1;
            let mut pkt = NetworkPacket {
                id: format!("logcat-{}-{}", capture.timestamp, next_id),
                serial: self.serial.clone(),
                timestamp: capture.timestamp,
                dst_port: 443,
                protocol: Protocol::Tcp,
                http_method: method.clone(),
                http_path: path,
                http_host: host.clone(),
                flags: format!("logcat:{}", capture.tag),
                raw: format!("{} {} [{}]", method, capture.url, capture.tag),
                ..NetworkPacket::default()
            };

            let ip = self.resolver.snooper().lookup_domain(&host);
            if !ip.is_empty() {
                pkt.dst_ip = ip;
            }

            self.emit_packet(pkt);
        }
    }

    fn emit_packet(&self, pkt: NetworkPacket) {
        self.stats.packet_count.fetch_add(1, Ordering::Relaxed);
        self.stats.touch();
        if self.packet_tx.try_send(pkt).is_err() {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn emit_connection(&self, conn: Connection) {
        if self.conn_tx.try_send(conn).is_err() {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Derives a synthetic packet from a socket-table connection so the
/// packet stream has data in socket-table mode. There is no HTTP layer
/// here; only network-level fields and the resolved hostname.
fn conn_to_packet(c: &Connection) -> NetworkPacket {
    NetworkPacket {
        id: format!("{}-pkt", c.id),
        serial: c.serial.clone(),
        timestamp: c.first_seen,
        src_ip: c.local_ip.clone(),
        src_port: c.local_port,
        dst_ip: c.remote_ip.clone(),
        dst_port: c.remote_port,
        protocol: c.protocol,
        flags: c.state.to_string(),
        http_host: c.hostname.clone(),
        raw: format!(
            "{} {}:{} -> {}:{} [{}]",
            c.protocol, c.local_ip, c.local_port, c.remote_ip, c.remote_port, c.state
        ),
        ..NetworkPacket::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConnState;

    #[test]
    fn conn_to_packet_carries_addresses_and_state() {
        let c = Connection {
            id: "dev1-conn-7".into(),
            serial: "dev1".into(),
            local_ip: "192.168.1.1".into(),
            local_port: 54514,
            remote_ip: "174.216.14.34".into(),
            remote_port: 443,
            state: ConnState::Established,
            protocol: Protocol::Tcp,
            hostname: "api.example.com".into(),
            first_seen: 1000,
            last_seen: 2000,
            ..Connection::default()
        };
        let pkt = conn_to_packet(&c);
        assert_eq!(pkt.id, "dev1-conn-7-pkt");
        assert_eq!(pkt.src_ip, "192.168.1.1");
        assert_eq!(pkt.dst_port, 443);
        assert_eq!(pkt.flags, "ESTABLISHED");
        assert_eq!(pkt.http_host, "api.example.com");
        assert_eq!(pkt.timestamp, 1000);
    }

    #[tokio::test]
    async fn emit_packet_drops_when_channel_is_full() {
        let engine = Engine::new(Client::new(""), "dev1", CaptureMode::ProcNet);
        // Leave the receiver unclaimed so the channel fills up.
        for i in 0..(CHANNEL_CAPACITY + 10) {
            engine.emit_packet(NetworkPacket {
                id: format!("p{i}"),
                ..NetworkPacket::default()
            });
        }
        let stats = engine.stats().snapshot();
        assert_eq!(stats.errors, 10);
        assert_eq!(stats.packet_count, (CHANNEL_CAPACITY + 10) as u64);
    }

    #[test]
    fn stats_snapshot_reflects_mode() {
        let engine = Engine::new(Client::new(""), "dev1", CaptureMode::Tcpdump);
        let snap = engine.stats().snapshot();
        assert_eq!(snap.serial, "dev1");
        assert_eq!(snap.mode, "tcpdump");
        assert_eq!(snap.packet_count, 0);
    }
}
