use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::error::Result;

/// USB class code for mass-storage devices and interfaces.
pub const MASS_STORAGE_CLASS: u8 = 0x08;

/// Identity of a physical USB slot occupant.
///
/// The same stick replugged into the same port keeps its identity; moving it
/// to another port yields a different one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub port_number: u8,
    pub address: u8,
}

impl DeviceIdentity {
    pub fn new(vendor_id: u16, product_id: u16, port_number: u8, address: u8) -> Self {
        Self {
            vendor_id,
            product_id,
            port_number,
            address,
        }
    }

    /// Stable, filesystem-safe name used for per-device mount points.
    pub fn slug(&self) -> String {
        format!(
            "{:04x}_{:04x}_{:02x}_{:02x}",
            self.vendor_id, self.product_id, self.port_number, self.address
        )
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x}@port{}/addr{}",
            self.vendor_id, self.product_id, self.port_number, self.address
        )
    }
}

/// Signals produced by the control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HardwareEvent {
    DeviceAdded {
        identity: DeviceIdentity,
        path: PathBuf,
    },
    DeviceRemoved {
        identity: DeviceIdentity,
        path: PathBuf,
    },
}

/// inotify event classes reported for device nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Access,
    Modify,
    Attrib,
    CloseWrite,
    CloseNoWrite,
    Open,
    MovedFrom,
    MovedTo,
    Create,
    Delete,
    DeleteSelf,
    MoveSelf,
    Other,
}

/// One notification from the device-node directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceNodeEvent {
    pub kinds: Vec<EventKind>,
    pub directory: PathBuf,
    pub name: String,
}

impl DeviceNodeEvent {
    pub fn new(kinds: Vec<EventKind>, directory: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            kinds,
            directory: directory.into(),
            name: name.into(),
        }
    }

    pub fn node_path(&self) -> PathBuf {
        self.directory.join(&self.name)
    }
}

/// Blocking stream of device-node notifications.
pub trait EventSource: Send {
    /// Wait up to `timeout` for events. An empty batch means the wait timed out.
    fn read_events(&mut self, timeout: Duration) -> Result<Vec<DeviceNodeEvent>>;
}

/// Query for the mass-storage devices currently attached.
pub trait UsbEnumerator: Send + Sync {
    fn list_storage_devices(&self) -> Result<HashSet<DeviceIdentity>>;
}

/// Device-level USB descriptor with its configuration tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    pub port_number: u8,
    pub address: u8,
    pub device_class: u8,
    pub configurations: Vec<UsbConfiguration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbConfiguration {
    pub value: u8,
    pub interfaces: Vec<UsbInterface>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbInterface {
    pub number: u8,
    pub class: u8,
}

impl UsbDeviceDescriptor {
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(
            self.vendor_id,
            self.product_id,
            self.port_number,
            self.address,
        )
    }
}

/// Matches when the device class, or any interface class of any
/// configuration, is mass storage.
pub fn is_mass_storage(descriptor: &UsbDeviceDescriptor) -> bool {
    descriptor.device_class == MASS_STORAGE_CLASS
        || descriptor
            .configurations
            .iter()
            .flat_map(|cfg| cfg.interfaces.iter())
            .any(|iface| iface.class == MASS_STORAGE_CLASS)
}

/// Reduce a descriptor list to the identities of its mass-storage devices.
pub fn storage_identities<'a>(
    descriptors: impl IntoIterator<Item = &'a UsbDeviceDescriptor>,
) -> HashSet<DeviceIdentity> {
    descriptors
        .into_iter()
        .filter(|d| is_mass_storage(d))
        .map(UsbDeviceDescriptor::identity)
        .collect()
}
