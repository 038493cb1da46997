//! Linux hardware adapter: inotify on the device directory and udev for
//! USB descriptors.

use std::collections::{HashMap, HashSet};
use std::ffi::OsStr;
use std::os::fd::AsFd;
use std::path::PathBuf;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
use tracing::{debug, warn};

use crate::config::Timing;
use crate::core::hardware::{
    DeviceIdentity, DeviceNodeEvent, EventKind, EventSource, UsbConfiguration,
    UsbDeviceDescriptor, UsbEnumerator, UsbInterface, storage_identities,
};
use crate::core::monitor::DeviceMonitor;
use crate::error::{FlashError, Result};

pub const DEVICE_DIRECTORY: &str = "/dev";

/// Build a monitor over `/dev` backed by udev enumeration.
pub fn device_monitor(timing: &Timing) -> Result<DeviceMonitor<InotifySource, UdevEnumerator>> {
    // Watch before snapshotting so nothing plugged in between is missed
    let source = InotifySource::watch(DEVICE_DIRECTORY)?;
    DeviceMonitor::new(source, UdevEnumerator, timing)
}

/// inotify watch on a single directory.
pub struct InotifySource {
    inotify: Inotify,
    directory: PathBuf,
}

impl InotifySource {
    pub fn watch(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)
            .map_err(|e| FlashError::Monitor(format!("inotify init failed: {e}")))?;

        inotify
            .add_watch(&directory, AddWatchFlags::IN_ALL_EVENTS)
            .map_err(|e| {
                FlashError::Monitor(format!(
                    "inotify add watch {} failed: {e}",
                    directory.display()
                ))
            })?;

        debug!(directory = %directory.display(), "Watching device directory");
        Ok(Self { inotify, directory })
    }
}

impl EventSource for InotifySource {
    fn read_events(&mut self, timeout: Duration) -> Result<Vec<DeviceNodeEvent>> {
        let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(self.inotify.as_fd(), PollFlags::POLLIN)];

        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) | Err(Errno::EINTR) => return Ok(Vec::new()),
            Ok(_) => {}
            Err(e) => return Err(FlashError::Monitor(format!("inotify poll failed: {e}"))),
        }

        let raw = match self.inotify.read_events() {
            Ok(raw) => raw,
            Err(Errno::EAGAIN) => return Ok(Vec::new()),
            Err(e) => return Err(FlashError::Monitor(format!("inotify read failed: {e}"))),
        };

        let mut events = Vec::with_capacity(raw.len());
        for event in raw {
            if event.mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
                warn!("inotify queue overflow, some device events were lost");
                continue;
            }
            let Some(name) = event.name else {
                continue;
            };
            events.push(DeviceNodeEvent::new(
                event_kinds(event.mask),
                self.directory.clone(),
                name.to_string_lossy().into_owned(),
            ));
        }
        Ok(events)
    }
}

fn event_kinds(mask: AddWatchFlags) -> Vec<EventKind> {
    const KINDS: [(AddWatchFlags, EventKind); 12] = [
        (AddWatchFlags::IN_ACCESS, EventKind::Access),
        (AddWatchFlags::IN_MODIFY, EventKind::Modify),
        (AddWatchFlags::IN_ATTRIB, EventKind::Attrib),
        (AddWatchFlags::IN_CLOSE_WRITE, EventKind::CloseWrite),
        (AddWatchFlags::IN_CLOSE_NOWRITE, EventKind::CloseNoWrite),
        (AddWatchFlags::IN_OPEN, EventKind::Open),
        (AddWatchFlags::IN_MOVED_FROM, EventKind::MovedFrom),
        (AddWatchFlags::IN_MOVED_TO, EventKind::MovedTo),
        (AddWatchFlags::IN_CREATE, EventKind::Create),
        (AddWatchFlags::IN_DELETE, EventKind::Delete),
        (AddWatchFlags::IN_DELETE_SELF, EventKind::DeleteSelf),
        (AddWatchFlags::IN_MOVE_SELF, EventKind::MoveSelf),
    ];

    let kinds: Vec<EventKind> = KINDS
        .iter()
        .filter(|(flag, _)| mask.contains(*flag))
        .map(|(_, kind)| *kind)
        .collect();

    if kinds.is_empty() {
        vec![EventKind::Other]
    } else {
        kinds
    }
}

/// Enumerates USB descriptors from the udev database.
#[derive(Debug, Clone, Copy, Default)]
pub struct UdevEnumerator;

impl UdevEnumerator {
    /// Read every USB device together with its interfaces.
    pub fn descriptors(&self) -> Result<Vec<UsbDeviceDescriptor>> {
        let udev_err = |e: std::io::Error| FlashError::Enumeration(e.to_string());

        let mut enumerator = udev::Enumerator::new().map_err(udev_err)?;
        enumerator.match_subsystem("usb").map_err(udev_err)?;

        let mut devices = Vec::new();
        let mut interfaces = Vec::new();

        for device in enumerator.scan_devices().map_err(udev_err)? {
            let sysname = device.sysname().to_string_lossy().into_owned();
            match device.devtype().and_then(OsStr::to_str) {
                Some("usb_device") => {
                    let attr = |name: &str| {
                        device
                            .attribute_value(name)
                            .map(|v| v.to_string_lossy().trim().to_string())
                    };
                    let Some(raw) = RawUsbDevice::from_attributes(
                        &sysname,
                        attr("idVendor"),
                        attr("idProduct"),
                        attr("bDeviceClass"),
                        attr("devnum"),
                    ) else {
                        debug!(sysname = %sysname, "Skipping USB device with unreadable descriptor");
                        continue;
                    };
                    devices.push(raw);
                }
                Some("usb_interface") => {
                    let class = device
                        .attribute_value("bInterfaceClass")
                        .and_then(|v| parse_hex_u8(&v.to_string_lossy()));
                    if let (Some(slot), Some(class)) = (InterfaceSlot::parse(&sysname), class) {
                        interfaces.push((slot, class));
                    }
                }
                _ => {}
            }
        }

        Ok(assemble_descriptors(devices, interfaces))
    }
}

impl UsbEnumerator for UdevEnumerator {
    fn list_storage_devices(&self) -> Result<HashSet<DeviceIdentity>> {
        let descriptors = self.descriptors()?;
        Ok(storage_identities(&descriptors))
    }
}

/// Device-level attributes as read from udev.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RawUsbDevice {
    sysname: String,
    vendor_id: u16,
    product_id: u16,
    device_class: u8,
    address: u8,
}

impl RawUsbDevice {
    fn from_attributes(
        sysname: &str,
        vendor: Option<String>,
        product: Option<String>,
        class: Option<String>,
        devnum: Option<String>,
    ) -> Option<Self> {
        Some(Self {
            sysname: sysname.to_string(),
            vendor_id: u16::from_str_radix(&vendor?, 16).ok()?,
            product_id: u16::from_str_radix(&product?, 16).ok()?,
            device_class: parse_hex_u8(&class?)?,
            address: devnum?.parse().ok()?,
        })
    }
}

/// Position of an interface, parsed from a sysname like `1-1.4:1.0`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct InterfaceSlot {
    device: String,
    configuration: u8,
    interface: u8,
}

impl InterfaceSlot {
    fn parse(sysname: &str) -> Option<Self> {
        let (device, rest) = sysname.split_once(':')?;
        let (configuration, interface) = rest.split_once('.')?;
        Some(Self {
            device: device.to_string(),
            configuration: configuration.parse().ok()?,
            interface: interface.parse().ok()?,
        })
    }
}

fn parse_hex_u8(raw: &str) -> Option<u8> {
    u8::from_str_radix(raw.trim(), 16).ok()
}

/// Port the device hangs off its parent hub: the last element of the port
/// chain in `1-1.4`. Root hubs (`usb1`) have no port.
fn port_number(sysname: &str) -> u8 {
    sysname
        .split_once('-')
        .and_then(|(_, chain)| chain.rsplit('.').next())
        .and_then(|port| port.parse().ok())
        .unwrap_or(0)
}

fn assemble_descriptors(
    devices: Vec<RawUsbDevice>,
    interfaces: Vec<(InterfaceSlot, u8)>,
) -> Vec<UsbDeviceDescriptor> {
    let mut by_device: HashMap<String, Vec<(InterfaceSlot, u8)>> = HashMap::new();
    for (slot, class) in interfaces {
        by_device
            .entry(slot.device.clone())
            .or_default()
            .push((slot, class));
    }

    devices
        .into_iter()
        .map(|raw| {
            let mut configurations: Vec<UsbConfiguration> = Vec::new();
            for (slot, class) in by_device.remove(&raw.sysname).unwrap_or_default() {
                let iface = UsbInterface {
                    number: slot.interface,
                    class,
                };
                match configurations
                    .iter_mut()
                    .find(|c| c.value == slot.configuration)
                {
                    Some(cfg) => cfg.interfaces.push(iface),
                    None => configurations.push(UsbConfiguration {
                        value: slot.configuration,
                        interfaces: vec![iface],
                    }),
                }
            }

            UsbDeviceDescriptor {
                vendor_id: raw.vendor_id,
                product_id: raw.product_id,
                port_number: port_number(&raw.sysname),
                address: raw.address,
                device_class: raw.device_class,
                configurations,
            }
        })
        .collect()
}
