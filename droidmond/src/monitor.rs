use droidmon_adb::Client;
use droidmon_events::{Bus, Event, EventKind};
use droidmon_utils::unix_time::unix_now_ms;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Default interval for collecting device properties.
pub const DEFAULT_PROP_INTERVAL: Duration = Duration::from_secs(30);

const GETPROP_TIMEOUT: Duration = Duration::from_secs(5);
const BATTERY_TIMEOUT: Duration = Duration::from_secs(10);
const BATTERY_CMD: &str = "dumpsys battery";

// System properties collected from every online device.
const DEFAULT_PROPS: [&str; 8] = [
    "ro.product.model",
    "ro.product.manufacturer",
    "ro.build.version.release",
    "ro.build.version.sdk",
    "ro.build.display.id",
    "ro.serialno",
    "ro.hardware",
    "persist.sys.timezone",
];

/// Orchestrates per-device property collectors. Reacts to lifecycle
/// events on the bus: online devices get a collector task, departing
/// devices lose theirs.
pub struct Monitor {
    client: Client,
    bus: Arc<Bus>,
    interval: Duration,
    devices: Mutex<HashMap<String, CancellationToken>>,
}

impl Monitor {
    /// Creates a monitor. A zero `interval` selects
    /// [`DEFAULT_PROP_INTERVAL`].
    pub fn new(client: Client, bus: Arc<Bus>, interval: Duration) -> Arc<Self> {
        let interval = if interval.is_zero() {
            DEFAULT_PROP_INTERVAL
        } else {
            interval
        };
        Arc::new(Self {
            client,
            bus,
            interval,
            devices: Mutex::new(HashMap::new()),
        })
    }

    /// Subscribes to the bus and manages collectors until cancelled.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let this = Arc::clone(&self);
        let parent = token.clone();
        let key = self.bus.subscribe(
            "monitor",
            Arc::new(move |e: &Event| match e.kind {
                EventKind::DeviceConnected => {
                    if let Some(dev) = &e.device {
                        if dev.state.is_online() {
                            this.start_device(&parent, &e.serial);
                        }
                    }
                }
                EventKind::DeviceStateChanged => {
                    if e.new_state.is_some_and(|s| s.is_online()) {
                        this.start_device(&parent, &e.serial);
                    } else {
                        this.stop_device(&e.serial);
                    }
                }
                EventKind::DeviceDisconnected => this.stop_device(&e.serial),
                EventKind::DeviceProperties => {}
            }),
        );

        info!("monitor orchestrator started");
        token.cancelled().await;

        self.shutdown();
        self.bus.unsubscribe(&key);
        info!("monitor orchestrator stopped");
    }

    fn start_device(&self, parent: &CancellationToken, serial: &str) {
        let mut devices = self.devices.lock();
        if devices.contains_key(serial) {
            return;
        }

        let token = parent.child_token();
        devices.insert(serial.to_string(), token.clone());

        let collector = DeviceMonitor {
            client: self.client.clone(),
            bus: Arc::clone(&self.bus),
            serial: serial.to_string(),
            interval: self.interval,
        };
        tokio::spawn(collector.run(token));

        info!(serial, "started per-device monitor");
    }

    fn stop_device(&self, serial: &str) {
        if let Some(token) = self.devices.lock().remove(serial) {
            token.cancel();
            info!(serial, "stopped per-device monitor");
        }
    }

    fn shutdown(&self) {
        let mut devices = self.devices.lock();
        for (serial, token) in devices.drain() {
            token.cancel();
            debug!(serial = %serial, "shutdown: stopped device monitor");
        }
    }
}

/// Collects properties from one online device on an interval.
struct DeviceMonitor {
    client: Client,
    bus: Arc<Bus>,
    serial: String,
    interval: Duration,
}

impl DeviceMonitor {
    async fn run(self, token: CancellationToken) {
        debug!(serial = %self.serial, interval = ?self.interval, "device monitor starting");

        self.collect().await;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(serial = %self.serial, "device monitor stopped");
                    return;
                }
                _ = ticker.tick() => self.collect().await,
            }
        }
    }

    async fn collect(&self) {
        let mut props: HashMap<String, String> = HashMap::new();

        for prop in DEFAULT_PROPS {
            let value = tokio::time::timeout(
                GETPROP_TIMEOUT,
                self.client.getprop(&self.serial, prop),
            )
            .await;
            match value {
                Ok(Ok(value)) if !value.is_empty() => {
                    props.insert(prop.to_string(), value);
                }
                Ok(Err(e)) => debug!(serial = %self.serial, prop, error = %e, "getprop failed"),
                _ => {}
            }
        }

        let battery = tokio::time::timeout(
            BATTERY_TIMEOUT,
            self.client.shell(&self.serial, BATTERY_CMD),
        )
        .await;
        match battery {
            Ok(Ok(out)) => parse_battery(&out, &mut props),
            Ok(Err(e)) => debug!(serial = %self.serial, error = %e, "battery dump failed"),
            _ => {}
        }

        if props.is_empty() {
            return;
        }

        debug!(serial = %self.serial, count = props.len(), "properties collected");
        let mut event = Event::new(EventKind::DeviceProperties, &self.serial, unix_now_ms());
        event.props = Some(props);
        self.bus.publish(event);
    }
}

/// Extracts the interesting battery metrics from `dumpsys battery`
/// output, which is indented `key: value` lines.
fn parse_battery(output: &str, props: &mut HashMap<String, String>) {
    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() || value.is_empty() {
            continue;
        }
        let prop = match key {
            "level" => "level",
            "status" => "status",
            "temperature" => "temperature",
            "USB powered" => "usb_powered",
            "AC powered" => "ac_powered",
            "health" => "health",
            _ => continue,
        };
        props.insert(prop.to_string(), value.to_string());
    }
}
