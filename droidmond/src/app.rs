use crate::hub::{Hub, Subscription};
use crate::monitor::Monitor;
use crate::tracker::Tracker;
use droidmon_adb::{AdbError, Client, Device};
use droidmon_capture::{CaptureMode, CaptureStats, Connection, Engine, EngineStats, NetworkPacket};
use droidmon_events::{Bus, Event, EventKind};
use droidmon_store::{Store, StoreConfig, StoreStats};
use droidmon_utils::pool::{Pool, PoolError, PoolStats};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const REFRESH_TIMEOUT: Duration = Duration::from_secs(10);
const VERSION_TIMEOUT: Duration = Duration::from_secs(5);

/// Application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// ADB server address (`host:port`); empty selects the default.
    pub adb_addr: String,
    /// Worker pool cap; 0 selects 100.
    pub max_workers: usize,
    /// Store capacities.
    pub store: StoreConfig,
    /// Capture mode for new captures.
    pub capture_mode: CaptureMode,
    /// Start capture automatically for devices that come online.
    pub auto_capture: bool,
    /// Device property collection interval.
    pub prop_interval: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            adb_addr: String::new(),
            max_workers: 100,
            store: StoreConfig::default(),
            capture_mode: CaptureMode::Auto,
            auto_capture: false,
            prop_interval: crate::monitor::DEFAULT_PROP_INTERVAL,
        }
    }
}

struct DeviceCapture {
    stats: Arc<EngineStats>,
    token: CancellationToken,
}

#[derive(Default)]
struct AppState {
    devices: HashMap<String, Device>,
    captures: HashMap<String, DeviceCapture>,
}

/// The application controller: owns the tracker, monitor, store, pool,
/// and hub for the process lifetime and exposes the control surface the
/// outer transports call into.
pub struct App {
    client: Client,
    bus: Arc<Bus>,
    store: Arc<Store>,
    pool: Arc<Pool>,
    hub: Arc<Hub>,
    capture_mode: CaptureMode,
    auto_capture: bool,
    prop_interval: Duration,
    token: CancellationToken,
    state: Arc<Mutex<AppState>>,
}

impl App {
    /// Creates the application and its owned subsystems.
    pub fn new(cfg: AppConfig) -> Arc<Self> {
        let max_workers = if cfg.max_workers == 0 {
            100
        } else {
            cfg.max_workers
        };

        Arc::new(Self {
            client: Client::new(&cfg.adb_addr),
            bus: Arc::new(Bus::new(0)),
            store: Arc::new(Store::new(cfg.store)),
            pool: Arc::new(Pool::new(max_workers)),
            hub: Arc::new(Hub::new()),
            capture_mode: cfg.capture_mode,
            auto_capture: cfg.auto_capture,
            prop_interval: cfg.prop_interval,
            token: CancellationToken::new(),
            state: Arc::new(Mutex::new(AppState::default())),
        })
    }

    /// The event bus (exposed for additional subscribers such as the
    /// stderr event printer).
    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    /// Starts the tracker, the device monitor, and the internal event
    /// wiring.
    pub fn startup(self: Arc<Self>) {
        info!("application starting");

        let hub = Arc::clone(&self.hub);
        self.store.set_on_change(Arc::new(move || {
            hub.broadcast("store:updated", &json!({}));
        }));

        let this = Arc::clone(&self);
        self.bus.subscribe(
            "app_devices",
            Arc::new(move |e: &Event| {
                this.handle_device_event(e);

                if this.auto_capture
                    && matches!(
                        e.kind,
                        EventKind::DeviceConnected | EventKind::DeviceStateChanged
                    )
                    && e.new_state.is_some_and(|s| s.is_online())
                {
                    let app = Arc::clone(&this);
                    let serial = e.serial.clone();
                    tokio::spawn(async move {
                        let _ = app.start_capture(&serial).await;
                    });
                }
            }),
        );

        let monitor = Monitor::new(self.client.clone(), Arc::clone(&self.bus), self.prop_interval);
        tokio::spawn(monitor.run(self.token.clone()));

        let mut tracker = Tracker::new(self.client.clone(), Arc::clone(&self.bus));
        let token = self.token.clone();
        tokio::spawn(async move {
            if let Err(e) = tracker.run(token.clone()).await {
                if !token.is_cancelled() {
                    error!(error = %e, "tracker failed");
                }
            }
        });
    }

    /// Cascading shutdown: stop captures, close the bus, cancel the
    /// application scope, drain the pool.
    pub async fn shutdown(&self) {
        info!("application shutting down");
        self.stop_all_captures();
        self.bus.close();
        self.token.cancel();
        self.pool.wait().await;
    }

    fn handle_device_event(&self, e: &Event) {
        match e.kind {
            EventKind::DeviceConnected => {
                if let Some(dev) = &e.device {
                    self.state
                        .lock()
                        .devices
                        .insert(e.serial.clone(), dev.clone());
                }
                self.hub.broadcast("device:connected", e);
            }
            EventKind::DeviceStateChanged => {
                if let Some(dev) = &e.device {
                    self.state
                        .lock()
                        .devices
                        .insert(e.serial.clone(), dev.clone());
                }
                self.hub.broadcast("device:state_changed", e);
            }
            EventKind::DeviceDisconnected => {
                self.state.lock().devices.remove(&e.serial);
                self.stop_capture(&e.serial);
                self.hub.broadcast("device:disconnected", e);
            }
            EventKind::DeviceProperties => {
                self.hub.broadcast("device:properties", e);
            }
        }
    }

    /// Currently known devices.
    pub fn list_devices(&self) -> Vec<Device> {
        self.state.lock().devices.values().cloned().collect()
    }

    /// Forces a roster re-read from the ADB server and replaces the
    /// device map.
    pub async fn refresh_devices(&self) -> Result<Vec<Device>, AdbError> {
        let devices = tokio::time::timeout(REFRESH_TIMEOUT, self.client.list_devices())
            .await
            .map_err(|_| {
                AdbError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "device list timed out",
                ))
            })??;

        {
            let mut state = self.state.lock();
            state.devices = devices
                .iter()
                .map(|d| (d.serial.clone(), d.clone()))
                .collect();
        }

        self.hub.broadcast("devices:refreshed", &devices);
        Ok(devices)
    }

    /// The ADB server version string.
    pub async fn adb_version(&self) -> Result<String, AdbError> {
        tokio::time::timeout(VERSION_TIMEOUT, self.client.server_version())
            .await
            .map_err(|_| {
                AdbError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "version request timed out",
                ))
            })?
    }

    /// Begins capture on one device. A no-op if a capture is already
    /// running for that serial.
    pub async fn start_capture(&self, serial: &str) -> Result<(), PoolError> {
        if self.state.lock().captures.contains_key(serial) {
            return Ok(());
        }

        let engine = Engine::new(self.client.clone(), serial, self.capture_mode);
        let capture_token = self.token.child_token();

        let (Some(packet_rx), Some(conn_rx)) = (engine.take_packets(), engine.take_connections())
        else {
            return Ok(());
        };

        self.state.lock().captures.insert(
            serial.to_string(),
            DeviceCapture {
                stats: engine.stats(),
                token: capture_token.clone(),
            },
        );

        let state = Arc::clone(&self.state);
        let store = Arc::clone(&self.store);
        let hub = Arc::clone(&self.hub);
        let serial = serial.to_string();
        let task_serial = serial.clone();
        let submitted = self
            .pool
            .submit(&self.token, &format!("capture:{serial}"), async move {
                spawn_drainers(store, Arc::clone(&hub), packet_rx, conn_rx, capture_token.clone());

                let result = engine.run(capture_token.clone()).await;

                state.lock().captures.remove(&task_serial);
                hub.broadcast("capture:stopped", &json!({ "serial": task_serial }));

                match result {
                    Err(e) if !capture_token.is_cancelled() => Err(e.into()),
                    _ => Ok(()),
                }
            })
            .await;

        if submitted.is_err() {
            self.state.lock().captures.remove(&serial);
        }
        submitted
    }

    /// Stops a running capture. Returns whether one was running; extra
    /// calls are no-ops.
    pub fn stop_capture(&self, serial: &str) -> bool {
        let capture = self.state.lock().captures.remove(serial);
        match capture {
            Some(capture) => {
                capture.token.cancel();
                info!(serial, "capture stopped");
                true
            }
            None => false,
        }
    }

    /// Starts capture on every online device; returns how many start
    /// requests succeeded.
    pub async fn start_all_captures(&self) -> usize {
        let serials: Vec<String> = {
            let state = self.state.lock();
            state
                .devices
                .values()
                .filter(|d| d.state.is_online())
                .map(|d| d.serial.clone())
                .collect()
        };

        let mut started = 0;
        for serial in serials {
            if self.start_capture(&serial).await.is_ok() {
                started += 1;
            }
        }
        started
    }

    /// Cancels every running capture.
    pub fn stop_all_captures(&self) {
        let mut state = self.state.lock();
        for (serial, capture) in state.captures.drain() {
            capture.token.cancel();
            info!(serial = %serial, "capture stopped");
        }
    }

    /// Per-serial engine statistics for all active captures.
    pub fn capture_status(&self) -> HashMap<String, CaptureStats> {
        self.state
            .lock()
            .captures
            .iter()
            .map(|(serial, c)| (serial.clone(), c.stats.snapshot()))
            .collect()
    }

    /// Recent packets, optionally filtered to one device.
    pub fn recent_packets(&self, serial: Option<&str>, n: usize) -> Vec<NetworkPacket> {
        match serial {
            Some(serial) => self.store.packets_by_serial(serial, n),
            None => self.store.recent_packets(n),
        }
    }

    /// Recent connections, optionally filtered to one device.
    pub fn recent_connections(&self, serial: Option<&str>, n: usize) -> Vec<Connection> {
        match serial {
            Some(serial) => self.store.connections_by_serial(serial, n),
            None => self.store.recent_connections(n),
        }
    }

    /// Store counters and capacities.
    pub fn store_stats(&self) -> StoreStats {
        self.store.stats()
    }

    /// Worker pool occupancy.
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Empties the store and tells subscribers.
    pub fn clear(&self) {
        self.store.clear();
        self.hub.broadcast("store:cleared", &json!({}));
    }

    /// A typed event stream for an external consumer.
    pub fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    /// Drops an external consumer.
    pub fn unsubscribe(&self, id: u64) {
        self.hub.unsubscribe(id);
    }
}

/// Moves engine output into the store and onto the hub until the capture
/// scope ends.
fn spawn_drainers(
    store: Arc<Store>,
    hub: Arc<Hub>,
    mut packet_rx: mpsc::Receiver<NetworkPacket>,
    mut conn_rx: mpsc::Receiver<Connection>,
    token: CancellationToken,
) {
    let packet_store = Arc::clone(&store);
    let packet_hub = Arc::clone(&hub);
    let packet_token = token.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = packet_token.cancelled() => return,
                pkt = packet_rx.recv() => {
                    let Some(pkt) = pkt else { return };
                    packet_hub.broadcast("packet:new", &pkt);
                    packet_store.add_packet(pkt);
                }
            }
        }
    });

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                conn = conn_rx.recv() => {
                    let Some(conn) = conn else { return };
                    hub.broadcast("connection:new", &conn);
                    store.add_connection(conn);
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use droidmon_adb::DeviceState;
    use droidmon_utils::unix_time::unix_now_ms;

    fn test_app() -> Arc<App> {
        App::new(AppConfig {
            max_workers: 4,
            ..AppConfig::default()
        })
    }

    fn connected_event(serial: &str, state: DeviceState) -> Event {
        let now = unix_now_ms();
        let mut e = Event::new(EventKind::DeviceConnected, serial, now);
        e.new_state = Some(state);
        e.device = Some(Device {
            serial: serial.to_string(),
            state,
            product: String::new(),
            model: "Pixel_4".into(),
            device_tag: String::new(),
            transport: String::new(),
            first_seen: now,
            last_seen: now,
        });
        e
    }

    #[tokio::test]
    async fn device_events_maintain_the_roster_and_rebroadcast() {
        let app = test_app();
        let mut sub = app.subscribe();

        app.handle_device_event(&connected_event("abc", DeviceState::Device));
        assert_eq!(app.list_devices().len(), 1);
        assert_eq!(
            sub.try_recv().map(|m| m.event),
            Some("device:connected".to_string())
        );

        let mut gone = Event::new(EventKind::DeviceDisconnected, "abc", unix_now_ms());
        gone.old_state = Some(DeviceState::Device);
        app.handle_device_event(&gone);
        assert!(app.list_devices().is_empty());
        assert_eq!(
            sub.try_recv().map(|m| m.event),
            Some("device:disconnected".to_string())
        );
    }

    #[tokio::test]
    async fn duplicate_stop_capture_is_a_noop() {
        let app = test_app();
        assert!(!app.stop_capture("missing"));
        assert!(!app.stop_capture("missing"));
    }

    #[tokio::test]
    async fn clear_broadcasts_and_empties() {
        let app = test_app();
        let mut sub = app.subscribe();

        app.store.add_packet(NetworkPacket::default());
        app.clear();
        assert_eq!(app.store_stats().packet_count, 0);

        let events: Vec<String> = std::iter::from_fn(|| sub.try_recv().map(|m| m.event)).collect();
        assert!(events.contains(&"store:cleared".to_string()));
    }

    #[tokio::test]
    async fn capture_status_is_empty_without_captures() {
        let app = test_app();
        assert!(app.capture_status().is_empty());
        assert_eq!(app.pool_stats().max_workers, 4);
    }
}
