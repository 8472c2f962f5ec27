//! Thread-safe, bounded, in-memory storage for captured packets and
//! connections.
//!
//! Two independent ring buffers with overwrite-oldest eviction. The
//! connection buffer carries a secondary index keyed on the address
//! tuple, so re-observing a known connection updates it in place instead
//! of consuming a ring slot.

#![warn(missing_docs)]

use droidmon_capture::{Connection, NetworkPacket};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Default packet ring capacity.
pub const DEFAULT_MAX_PACKETS: usize = 50_000;
/// Default connection ring capacity.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

/// Callback invoked (outside the data lock) whenever new data arrives.
pub type ChangeCallback = Arc<dyn Fn() + Send + Sync>;

/// Store capacities.
#[derive(Debug, Clone, Copy)]
pub struct StoreConfig {
    /// Packet ring capacity; 0 selects the default.
    pub max_packets: usize,
    /// Connection ring capacity; 0 selects the default.
    pub max_connections: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_packets: DEFAULT_MAX_PACKETS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// Counts and capacities for the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    /// Packets currently held (saturates at capacity).
    pub packet_count: usize,
    /// Connections currently held (saturates at capacity).
    pub connection_count: usize,
    /// Packet ring capacity.
    pub packet_capacity: usize,
    /// Connection ring capacity.
    pub conn_capacity: usize,
}

struct Inner {
    packets: Vec<NetworkPacket>,
    pkt_head: usize,
    pkt_count: usize,

    connections: Vec<Connection>,
    conn_head: usize,
    conn_count: usize,

    // addr_key → ring slot, for in-place updates.
    conn_index: HashMap<String, usize>,
    // slot → addr_key, so eviction can drop the stale index entry.
    slot_keys: Vec<Option<String>>,
}

/// The bounded in-memory store.
pub struct Store {
    pkt_capacity: usize,
    conn_capacity: usize,
    inner: RwLock<Inner>,
    on_change: Mutex<Option<ChangeCallback>>,
}

impl Store {
    /// Creates a store with the given capacities.
    pub fn new(cfg: StoreConfig) -> Self {
        let pkt_capacity = if cfg.max_packets == 0 {
            DEFAULT_MAX_PACKETS
        } else {
            cfg.max_packets
        };
        let conn_capacity = if cfg.max_connections == 0 {
            DEFAULT_MAX_CONNECTIONS
        } else {
            cfg.max_connections
        };

        Self {
            pkt_capacity,
            conn_capacity,
            inner: RwLock::new(Inner {
                packets: vec![NetworkPacket::default(); pkt_capacity],
                pkt_head: 0,
                pkt_count: 0,
                connections: vec![Connection::default(); conn_capacity],
                conn_head: 0,
                conn_count: 0,
                conn_index: HashMap::new(),
                slot_keys: vec![None; conn_capacity],
            }),
            on_change: Mutex::new(None),
        }
    }

    /// Registers the change callback. It fires after inserts, never with
    /// the data lock held.
    pub fn set_on_change(&self, cb: ChangeCallback) {
        *self.on_change.lock() = Some(cb);
    }

    /// Adds a packet, overwriting the oldest entry when full.
    pub fn add_packet(&self, pkt: NetworkPacket) {
        {
            let mut inner = self.inner.write();
            let idx = inner.pkt_head % self.pkt_capacity;
            inner.packets[idx] = pkt;
            inner.pkt_head += 1;
            if inner.pkt_count < self.pkt_capacity {
                inner.pkt_count += 1;
            }
        }
        self.notify();
    }

    /// Adds or updates a connection.
    ///
    /// A connection with a known address tuple updates `last_seen` and
    /// `state` in place and does not advance the ring. A new tuple takes
    /// the next slot, evicting both the oldest entry and its index key.
    pub fn add_connection(&self, conn: Connection) {
        let key = conn.addr_key();
        {
            let mut inner = self.inner.write();
            if let Some(&idx) = inner.conn_index.get(&key) {
                let existing = &mut inner.connections[idx];
                existing.last_seen = conn.last_seen;
                existing.state = conn.state;
                return;
            }

            let idx = inner.conn_head % self.conn_capacity;
            if let Some(old_key) = inner.slot_keys[idx].take() {
                inner.conn_index.remove(&old_key);
            }
            inner.connections[idx] = conn;
            inner.conn_index.insert(key.clone(), idx);
            inner.slot_keys[idx] = Some(key);
            inner.conn_head += 1;
            if inner.conn_count < self.conn_capacity {
                inner.conn_count += 1;
            }
        }
        self.notify();
    }

    /// Up to `n` most recent packets, newest first.
    pub fn recent_packets(&self, n: usize) -> Vec<NetworkPacket> {
        let inner = self.inner.read();
        let n = n.min(inner.pkt_count);
        (0..n)
            .map(|i| {
                let idx = (inner.pkt_head - 1 - i) % self.pkt_capacity;
                inner.packets[idx].clone()
            })
            .collect()
    }

    /// Up to `n` most recent connections, newest first.
    pub fn recent_connections(&self, n: usize) -> Vec<Connection> {
        let inner = self.inner.read();
        let n = n.min(inner.conn_count);
        (0..n)
            .map(|i| {
                let idx = (inner.conn_head - 1 - i) % self.conn_capacity;
                inner.connections[idx].clone()
            })
            .collect()
    }

    /// Up to `n` most recent packets for one device, newest first.
    pub fn packets_by_serial(&self, serial: &str, n: usize) -> Vec<NetworkPacket> {
        let inner = self.inner.read();
        let mut result = Vec::new();
        for i in 0..inner.pkt_count {
            if result.len() >= n {
                break;
            }
            let idx = (inner.pkt_head - 1 - i) % self.pkt_capacity;
            if inner.packets[idx].serial == serial {
                result.push(inner.packets[idx].clone());
            }
        }
        result
    }

    /// Up to `n` most recent connections for one device, newest first.
    pub fn connections_by_serial(&self, serial: &str, n: usize) -> Vec<Connection> {
        let inner = self.inner.read();
        let mut result = Vec::new();
        for i in 0..inner.conn_count {
            if result.len() >= n {
                break;
            }
            let idx = (inner.conn_head - 1 - i) % self.conn_capacity;
            if inner.connections[idx].serial == serial {
                result.push(inner.connections[idx].clone());
            }
        }
        result
    }

    /// Packets currently held.
    pub fn packet_count(&self) -> usize {
        self.inner.read().pkt_count
    }

    /// Connections currently held.
    pub fn connection_count(&self) -> usize {
        self.inner.read().conn_count
    }

    /// Counts and capacities.
    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.read();
        StoreStats {
            packet_count: inner.pkt_count,
            connection_count: inner.conn_count,
            packet_capacity: self.pkt_capacity,
            conn_capacity: self.conn_capacity,
        }
    }

    /// Removes everything; the store behaves as freshly constructed.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.pkt_head = 0;
        inner.pkt_count = 0;
        inner.conn_head = 0;
        inner.conn_count = 0;
        inner.conn_index.clear();
        inner.slot_keys.iter_mut().for_each(|k| *k = None);
    }

    /// Blanks all data for one device in place and drops its index
    /// entries. Ring positions are kept; the blanked slots simply no
    /// longer match any serial.
    pub fn clear_device(&self, serial: &str) {
        let mut inner = self.inner.write();

        let pkt_count = inner.pkt_count;
        for pkt in inner.packets[..pkt_count].iter_mut() {
            if pkt.serial == serial {
                *pkt = NetworkPacket::default();
            }
        }

        let conn_count = inner.conn_count;
        let mut dropped_keys = Vec::new();
        for (idx, conn) in inner.connections[..conn_count].iter_mut().enumerate() {
            if conn.serial == serial {
                *conn = Connection::default();
                dropped_keys.push(idx);
            }
        }
        for idx in dropped_keys {
            if let Some(key) = inner.slot_keys[idx].take() {
                inner.conn_index.remove(&key);
            }
        }
    }

    fn notify(&self) {
        let cb = self.on_change.lock().clone();
        if let Some(cb) = cb {
            cb();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use droidmon_capture::ConnState;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pkt(id: &str, serial: &str) -> NetworkPacket {
        NetworkPacket {
            id: id.to_string(),
            serial: serial.to_string(),
            ..NetworkPacket::default()
        }
    }

    fn conn(serial: &str, local_port: u16, state: ConnState, last_seen: u64) -> Connection {
        Connection {
            serial: serial.to_string(),
            local_ip: "192.168.1.2".into(),
            local_port,
            remote_ip: "93.184.216.34".into(),
            remote_port: 443,
            state,
            last_seen,
            first_seen: last_seen,
            ..Connection::default()
        }
    }

    fn small_store() -> Store {
        Store::new(StoreConfig {
            max_packets: 5,
            max_connections: 5,
        })
    }

    #[test]
    fn ring_overflow_keeps_newest() {
        let store = small_store();
        for i in 0..10 {
            store.add_packet(pkt(&format!("p{i}"), "dev1"));
        }
        assert_eq!(store.packet_count(), 5);

        let recent = store.recent_packets(5);
        let ids: Vec<&str> = recent.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["p9", "p8", "p7", "p6", "p5"]);
        // Asking for more than the capacity returns what's held.
        assert_eq!(store.recent_packets(100).len(), 5);
    }

    #[test]
    fn duplicate_connection_updates_in_place() {
        let store = small_store();
        store.add_connection(conn("dev1", 1111, ConnState::SynSent, 100));
        store.add_connection(conn("dev1", 1111, ConnState::Established, 200));

        assert_eq!(store.connection_count(), 1);
        let got = store.recent_connections(5);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].state, ConnState::Established);
        assert_eq!(got[0].last_seen, 200);
        assert_eq!(got[0].first_seen, 100);
    }

    #[test]
    fn evicted_connection_key_is_reusable() {
        let store = small_store();
        for port in 1..=6u16 {
            store.add_connection(conn("dev1", port, ConnState::Established, u64::from(port)));
        }
        // Port 1 was evicted by port 6; re-adding it must take a fresh
        // slot rather than update a stale index entry.
        store.add_connection(conn("dev1", 1, ConnState::TimeWait, 99));
        let got = store.recent_connections(1);
        assert_eq!(got[0].local_port, 1);
        assert_eq!(got[0].state, ConnState::TimeWait);
        assert_eq!(store.connection_count(), 5);
    }

    #[test]
    fn per_serial_reads_filter() {
        let store = small_store();
        store.add_packet(pkt("a1", "devA"));
        store.add_packet(pkt("b1", "devB"));
        store.add_packet(pkt("a2", "devA"));

        let a = store.packets_by_serial("devA", 10);
        assert_eq!(a.len(), 2);
        assert_eq!(a[0].id, "a2");
        assert_eq!(a[1].id, "a1");
        assert!(store.packets_by_serial("devC", 10).is_empty());
    }

    #[test]
    fn clear_resets_everything() {
        let store = small_store();
        store.add_packet(pkt("p1", "dev1"));
        store.add_connection(conn("dev1", 1, ConnState::Established, 1));
        store.clear();

        assert_eq!(store.packet_count(), 0);
        assert_eq!(store.connection_count(), 0);
        assert!(store.recent_packets(10).is_empty());
        assert!(store.recent_connections(10).is_empty());

        // Inserts after clear behave like a fresh store.
        store.add_packet(pkt("p2", "dev1"));
        assert_eq!(store.recent_packets(10)[0].id, "p2");

        // A connection seen before the clear is new again.
        store.add_connection(conn("dev1", 1, ConnState::Established, 2));
        assert_eq!(store.connection_count(), 1);
    }

    #[test]
    fn clear_device_blanks_only_that_serial() {
        let store = small_store();
        store.add_packet(pkt("a1", "devA"));
        store.add_packet(pkt("b1", "devB"));
        store.add_connection(conn("devA", 1, ConnState::Established, 1));

        store.clear_device("devA");

        assert!(store.packets_by_serial("devA", 10).is_empty());
        assert_eq!(store.packets_by_serial("devB", 10).len(), 1);
        assert!(store.connections_by_serial("devA", 10).is_empty());

        // The index entry is gone: re-adding the connection is new.
        store.add_connection(conn("devA", 1, ConnState::SynSent, 5));
        let got = store.connections_by_serial("devA", 10);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].state, ConnState::SynSent);
    }

    #[test]
    fn change_callback_fires_outside_lock() {
        let store = Arc::new(small_store());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let probe = Arc::clone(&store);
        store.set_on_change(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            // Would deadlock if the data lock were held.
            let _ = probe.packet_count();
        }));

        store.add_packet(pkt("p1", "dev1"));
        store.add_connection(conn("dev1", 1, ConnState::Established, 1));
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        // In-place connection updates do not fire the callback.
        store.add_connection(conn("dev1", 1, ConnState::TimeWait, 2));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
