use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::config::Timing;
use crate::core::hardware::{
    DeviceIdentity, DeviceNodeEvent, EventKind, EventSource, UsbEnumerator,
};
use crate::core::monitor::{DeviceMonitor, EVENT_WINDOW_CAPACITY};
use crate::error::{FlashError, Result};

type LiveSet = Arc<Mutex<HashSet<DeviceIdentity>>>;

/// Handle used to plug and unplug fake devices.
#[derive(Clone)]
pub struct Simulator {
    tx: Sender<Vec<DeviceNodeEvent>>,
    live: LiveSet,
    directory: PathBuf,
}

impl Simulator {
    /// Attach a device and emit the read burst a settling stick produces.
    pub fn plug(&self, identity: DeviceIdentity, node: &str) {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(identity);

        let mut burst = vec![DeviceNodeEvent::new(
            vec![EventKind::Create],
            self.directory.clone(),
            node,
        )];
        burst.extend((0..EVENT_WINDOW_CAPACITY).map(|_| {
            DeviceNodeEvent::new(vec![EventKind::Access], self.directory.clone(), node)
        }));
        let _ = self.tx.send(burst);
    }

    pub fn unplug(&self, identity: DeviceIdentity, node: &str) {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&identity);

        let _ = self.tx.send(vec![DeviceNodeEvent::new(
            vec![EventKind::Delete],
            self.directory.clone(),
            node,
        )]);
    }

    /// Make a device visible to the enumerator without any node events, as
    /// if it were attached before the station started.
    pub fn attach_quietly(&self, identity: DeviceIdentity) {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(identity);
    }
}

/// Event source fed by a [`Simulator`].
pub struct SimulatedEventSource {
    rx: Receiver<Vec<DeviceNodeEvent>>,
}

impl EventSource for SimulatedEventSource {
    fn read_events(&mut self, timeout: Duration) -> Result<Vec<DeviceNodeEvent>> {
        match self.rx.recv_timeout(timeout) {
            Ok(batch) => Ok(batch),
            Err(RecvTimeoutError::Timeout) => Ok(Vec::new()),
            Err(RecvTimeoutError::Disconnected) => {
                Err(FlashError::Monitor("simulator disconnected".to_string()))
            }
        }
    }
}

/// Enumerator over the simulator's live set.
#[derive(Clone)]
pub struct SimulatedEnumerator {
    live: LiveSet,
}

impl UsbEnumerator for SimulatedEnumerator {
    fn list_storage_devices(&self) -> Result<HashSet<DeviceIdentity>> {
        Ok(self
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

pub struct SimulatedAdapter {
    pub source: SimulatedEventSource,
    pub enumerator: SimulatedEnumerator,
}

impl SimulatedAdapter {
    pub fn new() -> (Self, Simulator) {
        let (tx, rx) = mpsc::channel();
        let live = LiveSet::default();

        (
            Self {
                source: SimulatedEventSource { rx },
                enumerator: SimulatedEnumerator { live: live.clone() },
            },
            Simulator {
                tx,
                live,
                directory: PathBuf::from("/dev"),
            },
        )
    }

    pub fn into_monitor(
        self,
        timing: &Timing,
    ) -> Result<DeviceMonitor<SimulatedEventSource, SimulatedEnumerator>> {
        DeviceMonitor::new(self.source, self.enumerator, timing)
    }
}
