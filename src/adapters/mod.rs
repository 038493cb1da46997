#[cfg(target_os = "linux")]
pub mod linux;
pub mod simulated;

#[cfg(target_os = "linux")]
pub use linux::{InotifySource, UdevEnumerator, device_monitor};
pub use simulated::{SimulatedAdapter, Simulator};
