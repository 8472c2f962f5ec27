use crate::net::is_private_ip;
use crate::snooper::LogcatSnooper;
use crate::types::Connection;
use droidmon_adb::Client;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DNS_QUEUE_CAPACITY: usize = 256;
const DNS_WORKERS: usize = 3;
const REVERSE_DNS_TIMEOUT: Duration = Duration::from_secs(3);
const UID_MAP_TIMEOUT: Duration = Duration::from_secs(10);
const UID_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

struct DnsState {
    // IP → hostname. An empty hostname is a completed negative result,
    // which stops further retries for that IP.
    cache: HashMap<String, String>,
    // IPs currently queued for async resolution.
    pending: HashSet<String>,
}

/// Multi-strategy hostname and application-identity resolution for one
/// device.
///
/// The forward path is synchronous and cheap: local cache, then the
/// snooper's reverse index. Anything else goes through a bounded async
/// queue so enrichment is eventually consistent and never stalls the
/// capture loop.
pub struct Resolver {
    client: Client,
    serial: String,
    dns: Mutex<DnsState>,
    uid_map: RwLock<HashMap<u32, String>>,
    queue_tx: mpsc::Sender<String>,
    queue_rx: Mutex<Option<mpsc::Receiver<String>>>,
    snooper: Arc<LogcatSnooper>,
}

impl Resolver {
    /// Creates a resolver (and its snooper) for `serial`.
    pub fn new(client: Client, serial: &str) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(DNS_QUEUE_CAPACITY);
        let snooper = LogcatSnooper::new(client.clone(), serial);
        Arc::new(Self {
            client,
            serial: serial.to_string(),
            dns: Mutex::new(DnsState {
                cache: HashMap::new(),
                pending: HashSet::new(),
            }),
            uid_map: RwLock::new(HashMap::new()),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            snooper,
        })
    }

    /// The logcat snooper owned by this resolver. The engine drains its
    /// URL channel.
    pub fn snooper(&self) -> &Arc<LogcatSnooper> {
        &self.snooper
    }

    /// Starts the background machinery: the UID map loader and its 60 s
    /// refresh, the DNS worker pool, and the logcat snooper. Call once.
    pub fn start(self: Arc<Self>, token: &CancellationToken) {
        let this = Arc::clone(&self);
        let uid_token = token.clone();
        tokio::spawn(async move {
            this.load_uid_map().await;
            let mut ticker = tokio::time::interval(UID_REFRESH_INTERVAL);
            ticker.tick().await; // the first tick fires immediately
            loop {
                tokio::select! {
                    _ = uid_token.cancelled() => return,
                    _ = ticker.tick() => this.load_uid_map().await,
                }
            }
        });

        // The queue has a single receiver; workers share it and process
        // concurrently.
        if let Some(queue_rx) = self.queue_rx.lock().take() {
            let shared = Arc::new(tokio::sync::Mutex::new(queue_rx));
            for _ in 0..DNS_WORKERS {
                let this = Arc::clone(&self);
                let rx = Arc::clone(&shared);
                let worker_token = token.clone();
                tokio::spawn(async move {
                    this.dns_worker(rx, worker_token).await;
                });
            }
        }

        let snooper = Arc::clone(&self.snooper);
        let snoop_token = token.clone();
        tokio::spawn(async move {
            if let Err(e) = snooper.run(snoop_token.clone()).await {
                if !snoop_token.is_cancelled() {
                    warn!(error = %e, "logcat snooper stopped");
                }
            }
        });
    }

    /// Returns the cached hostname for `ip`, or empty.
    ///
    /// Strategy: skip unusable addresses, consult the local cache, then
    /// the snooper's reverse index (copying a hit locally), and finally
    /// queue the IP for async resolution and report empty for now.
    pub fn resolve_hostname(&self, ip: &str) -> String {
        let Ok(parsed) = ip.parse::<IpAddr>() else {
            return String::new();
        };
        if parsed.is_unspecified() || is_private_ip(&parsed) {
            return String::new();
        }

        {
            let dns = self.dns.lock();
            if let Some(host) = dns.cache.get(ip) {
                return host.clone();
            }
        }

        let snooped = self.snooper.lookup_ip(ip);
        if !snooped.is_empty() {
            self.dns.lock().cache.insert(ip.to_string(), snooped.clone());
            return snooped;
        }

        let mut dns = self.dns.lock();
        if dns.pending.insert(ip.to_string()) {
            drop(dns);
            // Queue full: forget the pending mark so a later sighting
            // retries.
            if self.queue_tx.try_send(ip.to_string()).is_err() {
                self.dns.lock().pending.remove(ip);
            }
        }

        String::new()
    }

    /// Returns the package name owning `uid`, or empty.
    pub fn resolve_package(&self, uid: u32) -> String {
        if uid == 0 {
            return String::new();
        }
        self.uid_map.read().get(&uid).cloned().unwrap_or_default()
    }

    /// Fills in the hostname and owning application of a connection,
    /// leaving already-known fields alone.
    pub fn enrich_connection(&self, conn: &mut Connection) {
        if conn.hostname.is_empty() {
            conn.hostname = self.resolve_hostname(&conn.remote_ip);
        }
        if conn.app_name.is_empty() {
            conn.app_name = self.resolve_package(conn.uid);
        }
    }

    /// Number of IPs with a completed resolution.
    pub fn dns_cache_size(&self) -> usize {
        self.dns.lock().cache.len()
    }

    async fn dns_worker(
        &self,
        rx: Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>,
        token: CancellationToken,
    ) {
        loop {
            let ip = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    _ = token.cancelled() => return,
                    ip = rx.recv() => match ip {
                        Some(ip) => ip,
                        None => return,
                    },
                }
            };

            let host = self.do_reverse_dns(&ip).await;
            let mut dns = self.dns.lock();
            dns.cache.insert(ip.clone(), host);
            dns.pending.remove(&ip);
        }
    }

    /// The fallback chain: snooper again (it may have learned the name
    /// while the IP sat in the queue), host-side reverse DNS, then a
    /// device-side lookup. An empty result is stored to end retries.
    async fn do_reverse_dns(&self, ip: &str) -> String {
        let snooped = self.snooper.lookup_ip(ip);
        if !snooped.is_empty() {
            return snooped;
        }

        if let Ok(parsed) = ip.parse::<IpAddr>() {
            let lookup = tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&parsed));
            if let Ok(Ok(Ok(name))) = tokio::time::timeout(REVERSE_DNS_TIMEOUT, lookup).await {
                let name = name.trim_end_matches('.').to_string();
                if !name.is_empty() && name != ip {
                    return name;
                }
            }
        }

        self.snooper.device_nslookup(ip).await
    }

    /// Loads the UID → package map via the device package manager and
    /// swaps it in atomically. An empty listing keeps the old map.
    async fn load_uid_map(&self) {
        let out = tokio::time::timeout(
            UID_MAP_TIMEOUT,
            self.client
                .shell(&self.serial, "pm list packages -U 2>/dev/null"),
        )
        .await;
        let Ok(Ok(out)) = out else {
            debug!(serial = %self.serial, "failed to list packages");
            return;
        };

        let new_map = parse_package_list(&out);
        if !new_map.is_empty() {
            debug!(serial = %self.serial, packages = new_map.len(), "loaded uid map");
            *self.uid_map.write() = new_map;
        }
    }
}

/// Parses `pm list packages -U` lines: `package:com.example.app uid:10123`.
fn parse_package_list(out: &str) -> HashMap<u32, String> {
    let mut map = HashMap::new();
    for line in out.lines() {
        let line = line.trim();
        let Some(rest) = line.strip_prefix("package:") else {
            continue;
        };
        let Some(uid_idx) = rest.rfind(" uid:") else {
            continue;
        };
        let pkg = &rest[..uid_idx];
        let Ok(uid) = rest[uid_idx + 5..].trim().parse::<u32>() else {
            continue;
        };
        map.insert(uid, pkg.to_string());
    }
    map
}
