use crate::net::is_public_ip_str;
use droidmon_adb::{AdbError, Client};
use droidmon_utils::unix_time::unix_now_ms;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// logcat subscription: the tags that commonly log DNS, HTTP, or TLS
/// activity. `-v brief` gives `P/Tag( PID): message` lines.
const LOGCAT_CMD: &str = "logcat -v brief -s \
DnsResolver:* netd:* NetworkMonitor:* OkHttp:* Retrofit:* Volley:* \
HttpEngine:* chromium:* System.out:* ConnectivityService:* \
NetworkSecurityConfig:* NativeCrypto:* conscrypt:* HttpURLConnection:* \
2>/dev/null";

const URL_CHANNEL_CAPACITY: usize = 256;
const FORWARD_QUEUE_CAPACITY: usize = 64;
const FLUSH_TIMEOUT: Duration = Duration::from_secs(3);
const DNS_DUMP_TIMEOUT: Duration = Duration::from_secs(10);
const FORWARD_LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);
const NSLOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

// DNS resolution log shapes vary wildly by Android version:
// "DnsResolver: DNS query for example.com returned 1.2.3.4"
// "netd: resolv_cache_lookup: name = example.com"
static RE_DNS_QUERY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:dns|resolv|lookup|query|resolved?).*?(?:for|name\s*=)\s*([a-zA-Z0-9][-a-zA-Z0-9.]*\.[a-zA-Z]{2,})",
    )
    .expect("dns query pattern")
});

static RE_DNS_RESULT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:returned?|result|answer|->|=)\s*((?:\d{1,3}\.){3}\d{1,3})")
        .expect("dns result pattern")
});

static RE_IP_ADDR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"((?:\d{1,3}\.){3}\d{1,3})").expect("ip pattern"));

// OkHttp interceptor logs: "--> POST https://api.example.com/path"
static RE_OKHTTP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"-->\s+(GET|POST|PUT|DELETE|PATCH|HEAD)\s+(https?://\S+)").expect("okhttp pattern")
});

static RE_HTTP_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"((?:GET|POST|PUT|DELETE|PATCH|HEAD|OPTIONS)\s+)?(https?://[^\s"'<>{}\x00-\x1f]+)"#,
    )
    .expect("url pattern")
});

// "Connecting to host:port" shapes, domain only.
static RE_CONNECTING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)connect(?:ing|ed)?\s+(?:to\s+)?([a-zA-Z0-9][-a-zA-Z0-9.]*\.[a-zA-Z]{2,})(?::(\d+))?")
        .expect("connecting pattern")
});

// dumpsys dnsresolver cache entries: "example.com ... IN A 1.2.3.4"
static RE_DUMPSYS_ENTRY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"([a-zA-Z0-9][-a-zA-Z0-9.]*\.[a-zA-Z]{2,})\s+.*?(?:IN\s+A|AAAA?)\s+((?:\d{1,3}\.){3}\d{1,3})",
    )
    .expect("dumpsys pattern")
});

/// A URL observed in the device log.
#[derive(Debug, Clone)]
pub struct UrlCapture {
    /// Unix milliseconds when the line was read.
    pub timestamp: u64,
    /// logcat tag that emitted it (OkHttp, chromium, ...).
    pub tag: String,
    /// HTTP method if the log line carried one.
    pub method: String,
    /// The full URL.
    pub url: String,
}

struct DnsMaps {
    domain_to_ip: HashMap<String, String>,
    ip_to_domain: HashMap<String, String>,
}

/// Streams a device's logcat and passively extracts DNS mappings and
/// HTTP request URLs.
///
/// The domain→IP direction is overwritable; the IP→domain reverse index
/// is first-writer-wins, so the name a connection resolves to stays
/// stable for the process lifetime.
pub struct LogcatSnooper {
    client: Client,
    serial: String,
    maps: Mutex<DnsMaps>,
    url_tx: mpsc::Sender<UrlCapture>,
    url_rx: Mutex<Option<mpsc::Receiver<UrlCapture>>>,
    // Domains seen without an IP, awaiting a forward lookup.
    fwd_tx: mpsc::Sender<String>,
    fwd_rx: Mutex<Option<mpsc::Receiver<String>>>,
    dns_hits: AtomicU64,
    url_hits: AtomicU64,
    lines_read: AtomicU64,
}

impl LogcatSnooper {
    /// Creates a snooper for `serial`.
    pub fn new(client: Client, serial: &str) -> Arc<Self> {
        let (url_tx, url_rx) = mpsc::channel(URL_CHANNEL_CAPACITY);
        let (fwd_tx, fwd_rx) = mpsc::channel(FORWARD_QUEUE_CAPACITY);
        Arc::new(Self {
            client,
            serial: serial.to_string(),
            maps: Mutex::new(DnsMaps {
                domain_to_ip: HashMap::new(),
                ip_to_domain: HashMap::new(),
            }),
            url_tx,
            url_rx: Mutex::new(Some(url_rx)),
            fwd_tx,
            fwd_rx: Mutex::new(Some(fwd_rx)),
            dns_hits: AtomicU64::new(0),
            url_hits: AtomicU64::new(0),
            lines_read: AtomicU64::new(0),
        })
    }

    /// Hands out the URL observation channel. Only the first caller gets
    /// it; there is exactly one consumer (the capture engine).
    pub fn take_urls(&self) -> Option<mpsc::Receiver<UrlCapture>> {
        self.url_rx.lock().take()
    }

    /// Returns the domain the snooper learned for `ip`, or empty.
    pub fn lookup_ip(&self, ip: &str) -> String {
        self.maps.lock().ip_to_domain.get(ip).cloned().unwrap_or_default()
    }

    /// Returns the IP the snooper learned for `domain`, or empty.
    pub fn lookup_domain(&self, domain: &str) -> String {
        self.maps
            .lock()
            .domain_to_ip
            .get(domain)
            .cloned()
            .unwrap_or_default()
    }

    /// (dns hits, url hits, lines read).
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.dns_hits.load(Ordering::Relaxed),
            self.url_hits.load(Ordering::Relaxed),
            self.lines_read.load(Ordering::Relaxed),
        )
    }

    /// Streams logcat until the stream ends or the scope is cancelled.
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> Result<(), AdbError> {
        // Flush old log content so stale requests aren't replayed.
        let _ = tokio::time::timeout(
            FLUSH_TIMEOUT,
            self.client.shell(&self.serial, "logcat -c 2>/dev/null"),
        )
        .await;

        // Seed the cache from the device's own resolver state.
        tokio::spawn(Arc::clone(&self).load_device_dns_cache());

        // Drain the forward-resolution queue in the background.
        if let Some(fwd_rx) = self.fwd_rx.lock().take() {
            tokio::spawn(Arc::clone(&self).forward_resolve_worker(fwd_rx, token.clone()));
        }

        let mut stream = self
            .client
            .open_shell_stream(&self.serial, LOGCAT_CMD, &token)
            .await?;

        info!(serial = %self.serial, "logcat snooper started");

        loop {
            match stream.next_line().await? {
                Some(line) => {
                    self.lines_read.fetch_add(1, Ordering::Relaxed);
                    self.parse_line(&line);
                }
                None => return Ok(()),
            }
        }
    }

    /// Extracts DNS and URL information from one logcat line.
    fn parse_line(&self, raw: &str) {
        if raw.len() < 5 {
            return;
        }

        // Brief format: "I/TagName( 1234): message".
        let mut tag = String::new();
        let mut line = raw;
        if let Some(msg_start) = raw.find("): ") {
            if let Some(tag_start) = raw.find('/') {
                if tag_start < msg_start {
                    if let Some(paren) = raw[tag_start..].find('(') {
                        if paren > 0 {
                            tag = raw[tag_start + 1..tag_start + paren].trim().to_string();
                        }
                    }
                }
            }
            line = &raw[msg_start + 3..];
        }

        self.parse_dns(line, &tag);
        self.parse_urls(line, &tag);
    }

    fn parse_dns(&self, line: &str, tag: &str) {
        let lower = line.to_lowercase();
        let is_dns = matches!(tag, "DnsResolver" | "netd" | "NetworkMonitor")
            || lower.contains("dns")
            || lower.contains("resolv")
            || lower.contains("lookup");
        if !is_dns {
            return;
        }

        let Some(domain_match) = RE_DNS_QUERY.captures(line) else {
            return;
        };
        let domain = domain_match[1].to_lowercase();

        let ip_match = RE_DNS_RESULT
            .captures(line)
            .or_else(|| RE_IP_ADDR.captures(line));
        if let Some(m) = ip_match {
            let ip = m[1].to_string();
            if is_public_ip_str(&ip) {
                self.register_mapping(&domain, &ip);
            }
        }
    }

    fn parse_urls(&self, line: &str, tag: &str) {
        if let Some(m) = RE_OKHTTP.captures(line) {
            self.emit_url(tag, &m[1], &m[2]);
            return;
        }

        if let Some(m) = RE_HTTP_URL.captures(line) {
            let method = m.get(1).map(|g| g.as_str().trim()).unwrap_or("");
            let url = &m[2];
            // Documentation/schema URLs show up constantly in app logs.
            if url.contains("schemas.android.com")
                || url.contains("www.w3.org")
                || url.contains("schemas.xmlsoap.org")
                || url.contains("xmlns")
            {
                return;
            }
            self.emit_url(tag, method, url);
            return;
        }

        if let Some(m) = RE_CONNECTING.captures(line) {
            self.queue_forward_resolve(&m[1].to_lowercase());
        }
    }

    /// Stores a learned domain→IP pair. The reverse index is immutable
    /// after its first write.
    pub(crate) fn register_mapping(&self, domain: &str, ip: &str) {
        if !valid_domain(domain) {
            return;
        }
        let mut maps = self.maps.lock();
        maps.domain_to_ip.insert(domain.to_string(), ip.to_string());
        if !maps.ip_to_domain.contains_key(ip) {
            maps.ip_to_domain.insert(ip.to_string(), domain.to_string());
            self.dns_hits.fetch_add(1, Ordering::Relaxed);
            debug!(domain, ip, "dns mapping learned");
        }
    }

    /// A domain observed without an IP: queue it so later socket-table
    /// hits can be named. Drops silently when the queue is full.
    fn queue_forward_resolve(&self, domain: &str) {
        if !valid_domain(domain) {
            return;
        }
        if self.maps.lock().domain_to_ip.contains_key(domain) {
            return;
        }
        let _ = self.fwd_tx.try_send(domain.to_string());
    }

    async fn forward_resolve_worker(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<String>,
        token: CancellationToken,
    ) {
        loop {
            let domain = tokio::select! {
                _ = token.cancelled() => return,
                domain = rx.recv() => match domain {
                    Some(domain) => domain,
                    None => return,
                },
            };
            self.forward_resolve(&domain).await;
        }
    }

    async fn forward_resolve(&self, domain: &str) {
        if self.maps.lock().domain_to_ip.contains_key(domain) {
            return;
        }
        let host = domain.to_string();
        let lookup = tokio::task::spawn_blocking(move || dns_lookup::lookup_host(&host));
        let Ok(Ok(Ok(addrs))) = tokio::time::timeout(FORWARD_LOOKUP_TIMEOUT, lookup).await else {
            return;
        };
        for addr in addrs {
            let ip = addr.to_string();
            if is_public_ip_str(&ip) {
                self.register_mapping(domain, &ip);
                break;
            }
        }
    }

    /// Seeds the cache from `dumpsys dnsresolver` output.
    async fn load_device_dns_cache(self: Arc<Self>) {
        let dump = tokio::time::timeout(
            DNS_DUMP_TIMEOUT,
            self.client
                .shell(&self.serial, "dumpsys dnsresolver 2>/dev/null"),
        )
        .await;
        let Ok(Ok(out)) = dump else {
            return;
        };
        if out.len() <= 100 {
            return;
        }
        self.parse_dumpsys_dns(&out);
        debug!(
            serial = %self.serial,
            dns_entries = self.dns_hits.load(Ordering::Relaxed),
            "parsed dumpsys dnsresolver"
        );
    }

    fn parse_dumpsys_dns(&self, output: &str) {
        for line in output.lines() {
            if let Some(m) = RE_DUMPSYS_ENTRY.captures(line) {
                let domain = m[1].to_lowercase();
                let ip = m[2].to_string();
                if is_public_ip_str(&ip) {
                    self.register_mapping(&domain, &ip);
                }
            }
        }
    }

    /// Asks the device itself to name an IP. The device often has the
    /// forward lookup cached even when host-side reverse DNS fails.
    pub async fn device_nslookup(&self, ip: &str) -> String {
        let cmd = format!("nslookup {ip} 2>/dev/null || host {ip} 2>/dev/null");
        let out = tokio::time::timeout(NSLOOKUP_TIMEOUT, self.client.shell(&self.serial, &cmd)).await;
        let Ok(Ok(out)) = out else {
            return String::new();
        };
        match parse_nslookup_output(&out) {
            Some(name) => {
                self.register_mapping(&name, ip);
                name
            }
            None => String::new(),
        }
    }

    fn emit_url(&self, tag: &str, method: &str, url: &str) {
        self.url_hits.fetch_add(1, Ordering::Relaxed);

        // The URL's host is itself a DNS fact worth resolving.
        let host = extract_host_from_url(url);
        if !host.is_empty() {
            self.queue_forward_resolve(&host);
        }

        let capture = UrlCapture {
            timestamp: unix_now_ms(),
            tag: tag.to_string(),
            method: method.to_string(),
            url: url.to_string(),
        };
        // Drop on full; the capture loop must never stall on us.
        let _ = self.url_tx.try_send(capture);
    }
}

fn valid_domain(domain: &str) -> bool {
    domain.len() > 3
        && domain.contains('.')
        && !domain.ends_with(".local")
        && !domain.ends_with(".internal")
}

/// Parses `nslookup`/`host` output for the answering name.
/// nslookup: "Name:   example.com"
/// host:     "4.78.111.193.in-addr.arpa domain name pointer example.com."
fn parse_nslookup_output(out: &str) -> Option<String> {
    for line in out.lines() {
        let line = line.trim();

        if let Some(rest) = line.strip_prefix("Name:") {
            let name = rest.trim().trim_end_matches('.');
            if name.len() > 3 && name.contains('.') && !name.starts_with("in-addr") {
                return Some(name.to_string());
            }
        }

        if line.contains("domain name pointer") {
            if let Some(last) = line.split_whitespace().last() {
                let name = last.trim_end_matches('.');
                if name.len() > 3 && name.contains('.') {
                    return Some(name.to_string());
                }
            }
        }
    }
    None
}

/// Extracts the lowercased hostname from a URL without a full parser.
pub(crate) fn extract_host_from_url(raw_url: &str) -> String {
    let mut after = raw_url;
    if let Some(idx) = after.find("://") {
        after = &after[idx + 3..];
    }
    if let Some(idx) = after.find('/') {
        after = &after[..idx];
    }
    if let Some(idx) = after.rfind(':') {
        after = &after[..idx];
    }
    if let Some(idx) = after.find('@') {
        after = &after[idx + 1..];
    }
    after.to_lowercase()
}

/// Extracts the path component (query string stripped) from a URL.
pub(crate) fn extract_path_from_url(raw_url: &str) -> String {
    let mut after = raw_url;
    if let Some(idx) = after.find("://") {
        after = &after[idx + 3..];
    }
    match after.find('/') {
        Some(idx) => {
            let path = &after[idx..];
            match path.find('?') {
                Some(q) => path[..q].to_string(),
                None => path.to_string(),
            }
        }
        None => "/".to_string(),
    }
}
