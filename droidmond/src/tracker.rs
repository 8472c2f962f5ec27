use droidmon_adb::{AdbError, Client, Device, parse_device_list, read_length_prefixed};
use droidmon_events::{Bus, Event, EventKind};
use droidmon_utils::unix_time::unix_now_ms;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Streams device connect/disconnect events from the ADB server using
/// the push-based `track-devices` protocol.
///
/// Each received frame is the complete roster; the tracker diffs it
/// against the last-known state and publishes the resulting lifecycle
/// events on the bus. On connection loss it reconnects with exponential
/// backoff until cancelled.
pub struct Tracker {
    client: Client,
    bus: Arc<Bus>,
    known: HashMap<String, Device>,
}

impl Tracker {
    /// Creates a tracker publishing to `bus`.
    pub fn new(client: Client, bus: Arc<Bus>) -> Self {
        Self {
            client,
            bus,
            known: HashMap::new(),
        }
    }

    /// Runs the tracking loop until the scope is cancelled.
    pub async fn run(&mut self, token: CancellationToken) -> Result<(), AdbError> {
        let mut delay = RECONNECT_BASE_DELAY;

        loop {
            if token.is_cancelled() {
                return Ok(());
            }

            let err = match self.stream(&token).await {
                Ok(()) => AdbError::ConnectionClosed,
                Err(AdbError::Cancelled) => return Ok(()),
                Err(e) => e,
            };
            if token.is_cancelled() {
                return Ok(());
            }

            warn!(error = %err, delay = ?delay, "tracking connection lost, reconnecting");
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
            delay = next_delay(delay);
        }
    }

    /// Reads roster frames until the connection closes or the scope is
    /// cancelled.
    async fn stream(&mut self, token: &CancellationToken) -> Result<(), AdbError> {
        let mut conn = self.client.track_devices().await?;
        info!(addr = %self.client.addr(), "track-devices stream established");

        loop {
            let frame = tokio::select! {
                _ = token.cancelled() => return Err(AdbError::Cancelled),
                frame = read_length_prefixed(&mut conn) => frame?,
            };

            let now = unix_now_ms();
            let devices = parse_device_list(&frame, now);
            for event in self.diff(devices, now) {
                self.bus.publish(event);
            }
        }
    }

    /// Compares a roster snapshot against known state and produces the
    /// lifecycle events for what changed.
    fn diff(&mut self, current: Vec<Device>, now: u64) -> Vec<Event> {
        let mut events = Vec::new();
        let mut seen: HashSet<String> = HashSet::with_capacity(current.len());

        for mut dev in current {
            seen.insert(dev.serial.clone());

            match self.known.get(&dev.serial) {
                None => {
                    dev.first_seen = now;
                    dev.last_seen = now;
                    info!(serial = %dev.serial, state = %dev.state, model = %dev.model, "device connected");

                    let mut event = Event::new(EventKind::DeviceConnected, &dev.serial, now);
                    event.new_state = Some(dev.state);
                    event.device = Some(dev.clone());
                    events.push(event);

                    self.known.insert(dev.serial.clone(), dev);
                }
                Some(prev) => {
                    let old_state = prev.state;
                    dev.first_seen = prev.first_seen;
                    dev.last_seen = now;

                    if old_state != dev.state {
                        info!(
                            serial = %dev.serial,
                            old_state = %old_state,
                            new_state = %dev.state,
                            "device state changed"
                        );
                        let mut event =
                            Event::new(EventKind::DeviceStateChanged, &dev.serial, now);
                        event.old_state = Some(old_state);
                        event.new_state = Some(dev.state);
                        event.device = Some(dev.clone());
                        events.push(event);
                    }

                    self.known.insert(dev.serial.clone(), dev);
                }
            }
        }

        // Anything known that is absent from the snapshot is gone.
        let missing: Vec<String> = self
            .known
            .keys()
            .filter(|serial| !seen.contains(*serial))
            .cloned()
            .collect();
        for serial in missing {
            if let Some(dev) = self.known.remove(&serial) {
                info!(serial = %serial, last_state = %dev.state, "device disconnected");
                let mut event = Event::new(EventKind::DeviceDisconnected, &serial, now);
                event.old_state = Some(dev.state);
                event.device = Some(dev);
                events.push(event);
            }
        }

        events
    }
}

fn next_delay(delay: Duration) -> Duration {
    (delay * 2).min(RECONNECT_MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use droidmon_adb::DeviceState;

    fn tracker() -> Tracker {
        Tracker::new(Client::new(""), Arc::new(Bus::new(16)))
    }

    #[tokio::test]
    async fn first_snapshot_connects_everything() {
        let mut t = tracker();
        let frame = "emulator-5554\tdevice product:sdk model:sdk device:emu transport_id:1\n\
                     HVA1234551\tdevice product:flame model:Pixel_4 device:flame transport_id:2\n\
                     192.168.1.100:5555\toffline\n";
        let events = t.diff(parse_device_list(frame, 100), 100);

        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.kind == EventKind::DeviceConnected));
        assert_eq!(events[1].device.as_ref().unwrap().model, "Pixel_4");
        assert_eq!(events[2].new_state, Some(DeviceState::Offline));
    }

    #[tokio::test]
    async fn state_change_and_disconnect_are_detected() {
        let mut t = tracker();
        t.diff(
            parse_device_list("abc\tunauthorized\nxyz\tdevice\n", 100),
            100,
        );

        // abc authorizes, xyz disappears.
        let events = t.diff(parse_device_list("abc\tdevice\n", 200), 200);
        assert_eq!(events.len(), 2);

        let changed = events
            .iter()
            .find(|e| e.kind == EventKind::DeviceStateChanged)
            .expect("state change event");
        assert_eq!(changed.serial, "abc");
        assert_eq!(changed.old_state, Some(DeviceState::Unauthorized));
        assert_eq!(changed.new_state, Some(DeviceState::Device));

        let gone = events
            .iter()
            .find(|e| e.kind == EventKind::DeviceDisconnected)
            .expect("disconnect event");
        assert_eq!(gone.serial, "xyz");
        assert_eq!(gone.old_state, Some(DeviceState::Device));

        // A forgotten device reconnecting is "connected" again.
        let events = t.diff(parse_device_list("abc\tdevice\nxyz\tdevice\n", 300), 300);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::DeviceConnected);
        assert_eq!(events[0].serial, "xyz");
    }

    #[tokio::test]
    async fn unchanged_snapshot_is_quiet_and_preserves_first_seen() {
        let mut t = tracker();
        t.diff(parse_device_list("abc\tdevice\n", 100), 100);
        let events = t.diff(parse_device_list("abc\tdevice\n", 200), 200);
        assert!(events.is_empty());

        let dev = &t.known["abc"];
        assert_eq!(dev.first_seen, 100);
        assert_eq!(dev.last_seen, 200);
    }

    #[test]
    fn backoff_doubles_to_the_cap() {
        let mut delay = RECONNECT_BASE_DELAY;
        let mut observed = vec![delay.as_secs()];
        for _ in 0..6 {
            delay = next_delay(delay);
            observed.push(delay.as_secs());
        }
        assert_eq!(observed, [1, 2, 4, 8, 16, 30, 30]);
    }
}
