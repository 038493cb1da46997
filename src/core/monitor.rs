//! Hotplug detection.
//!
//! Raw notifications from the device-node directory are noisy: a freshly
//! inserted stick produces bursts of create/modify/attrib events, then settles
//! into repeated reads while the kernel and udev probe it. The monitor keeps a
//! short window of recent event kinds and only asks the USB enumerator which
//! devices exist once that window is saturated with `Access` notifications.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::config::Timing;
use crate::core::hardware::{DeviceIdentity, EventKind, EventSource, HardwareEvent, UsbEnumerator};
use crate::error::{FlashError, Result};
use crate::logging::LogThrottle;

/// Number of recent event kinds kept for debouncing.
pub const EVENT_WINDOW_CAPACITY: usize = 6;

/// Device nodes we care about (`sda`, `sdb`, ...). Partitions are ignored.
const STORAGE_DEVICE_PATTERN: &str = r"^sd\w$";

/// Tracked devices: identity mapped to its device node.
pub type DeviceTable = HashMap<DeviceIdentity, PathBuf>;

/// Fixed-capacity window of the most recent event kinds.
#[derive(Debug, Clone)]
pub struct EventWindow {
    kinds: VecDeque<EventKind>,
    capacity: usize,
}

impl EventWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            kinds: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, kind: EventKind) {
        if self.kinds.len() == self.capacity {
            self.kinds.pop_front();
        }
        self.kinds.push_back(kind);
    }

    /// True only when the window is full and holds nothing but `kind`.
    pub fn is_saturated_with(&self, kind: EventKind) -> bool {
        self.kinds.len() == self.capacity && self.kinds.iter().all(|k| *k == kind)
    }
}

/// Turns device-node notifications into "new device" signals.
pub struct DeviceMonitor<S, E> {
    source: S,
    enumerator: E,
    window: EventWindow,
    original: HashSet<DeviceIdentity>,
    pattern: Regex,
    read_timeout: Duration,
    settle_delay: Duration,
    throttle: LogThrottle,
}

impl<S: EventSource, E: UsbEnumerator> DeviceMonitor<S, E> {
    /// Snapshot the devices attached right now; they are never offered as new
    /// while they stay attached.
    pub fn new(source: S, enumerator: E, timing: &Timing) -> Result<Self> {
        let original = enumerator.list_storage_devices()?;
        for device in &original {
            debug!(device = %device, "Original device, will not be touched");
        }

        let pattern =
            Regex::new(STORAGE_DEVICE_PATTERN).map_err(|e| FlashError::Monitor(e.to_string()))?;

        Ok(Self {
            source,
            enumerator,
            window: EventWindow::new(EVENT_WINDOW_CAPACITY),
            original,
            pattern,
            read_timeout: timing.event_timeout(),
            settle_delay: timing.settle_delay(),
            throttle: LogThrottle::new(Duration::from_secs(5)),
        })
    }

    pub fn original_devices(&self) -> &HashSet<DeviceIdentity> {
        &self.original
    }

    pub fn enumerator(&self) -> &E {
        &self.enumerator
    }

    /// Block until new devices settle or the event stream goes quiet.
    ///
    /// Returns the devices that are live but neither original nor already
    /// tracked, each mapped to the node of the event that triggered the
    /// lookup. An empty map means the read timed out.
    pub fn next_state(&mut self, tracked: &DeviceTable) -> Result<DeviceTable> {
        let mut found = DeviceTable::new();

        loop {
            let events = self.source.read_events(self.read_timeout)?;
            if events.is_empty() {
                return Ok(found);
            }

            for event in events {
                if !self.pattern.is_match(&event.name) {
                    continue;
                }

                if let Some(suppressed) = self.throttle.admit() {
                    trace!(node = %event.name, kinds = ?event.kinds, suppressed, "Device node event");
                }

                for kind in &event.kinds {
                    self.window.push(*kind);
                }

                if !self.window.is_saturated_with(EventKind::Access) {
                    continue;
                }

                let node = event.node_path();
                for device in self.enumerator.list_storage_devices()? {
                    if self.original.contains(&device) || tracked.contains_key(&device) {
                        continue;
                    }
                    found.insert(device, node.clone());
                }

                if !found.is_empty() {
                    debug!(count = found.len(), "Waiting for device nodes to settle");
                    std::thread::sleep(self.settle_delay);
                    return Ok(found);
                }
            }
        }
    }
}

/// The control loop's table of devices currently being handled.
///
/// Only the control loop writes to it, so it needs no lock.
#[derive(Debug, Default)]
pub struct DeviceTracker {
    devices: DeviceTable,
}

impl DeviceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn devices(&self) -> &DeviceTable {
        &self.devices
    }

    /// Start tracking arrivals; identities already tracked are skipped so a
    /// device is never handed to two pipelines at once.
    pub fn admit(&mut self, arrivals: DeviceTable) -> Vec<HardwareEvent> {
        let mut events = Vec::new();
        for (identity, path) in arrivals {
            if self.devices.contains_key(&identity) {
                debug!(device = %identity, "Already tracked, ignoring");
                continue;
            }
            self.devices.insert(identity, path.clone());
            events.push(HardwareEvent::DeviceAdded { identity, path });
        }
        events
    }

    /// Stop tracking every device missing from `live`.
    pub fn reap(&mut self, live: &HashSet<DeviceIdentity>) -> Vec<HardwareEvent> {
        let gone: Vec<DeviceIdentity> = self
            .devices
            .keys()
            .filter(|id| !live.contains(id))
            .copied()
            .collect();

        gone.into_iter()
            .filter_map(|identity| {
                self.devices
                    .remove(&identity)
                    .map(|path| HardwareEvent::DeviceRemoved { identity, path })
            })
            .collect()
    }
}

/// Drive the monitor until cancelled, forwarding add/remove signals.
///
/// Runs on a dedicated thread. Returns `Ok` on cancellation or when the
/// receiving side hangs up; monitor or enumeration failures are returned as
/// errors since the station cannot make progress without them.
pub fn run_control_loop<S: EventSource, E: UsbEnumerator>(
    mut monitor: DeviceMonitor<S, E>,
    events: mpsc::Sender<HardwareEvent>,
    token: CancellationToken,
) -> Result<()> {
    let mut tracker = DeviceTracker::new();
    info!(
        original = monitor.original_devices().len(),
        "Watching for new storage devices"
    );

    while !token.is_cancelled() {
        let arrivals = monitor.next_state(tracker.devices())?;

        let signals = if arrivals.is_empty() {
            let live = monitor.enumerator().list_storage_devices()?;
            tracker.reap(&live)
        } else {
            tracker.admit(arrivals)
        };

        for signal in signals {
            if events.blocking_send(signal).is_err() {
                debug!("Event receiver closed, stopping control loop");
                return Ok(());
            }
        }
    }

    debug!("Control loop cancelled");
    Ok(())
}
