//! Station lifecycle notifications.
//!
//! Every pipeline job reports exactly one of [`StationEvent::Flashed`] or
//! [`StationEvent::FlashFailed`]; removals are reported by the control loop
//! independently and may race with a job still working on that device.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::core::hardware::DeviceIdentity;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StationEvent {
    DeviceAdded {
        identity: DeviceIdentity,
        device: PathBuf,
    },
    Flashed {
        job_id: String,
        identity: DeviceIdentity,
        device: PathBuf,
        files: usize,
        duration_secs: u64,
    },
    FlashFailed {
        job_id: String,
        identity: DeviceIdentity,
        device: PathBuf,
        reason: String,
    },
    DeviceRemoved {
        identity: DeviceIdentity,
        device: PathBuf,
    },
}

/// Receiver of station events (log, webhook, status light, ...).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: StationEvent) -> Result<()>;
}

/// Writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: StationEvent) -> Result<()> {
        match event {
            StationEvent::DeviceAdded { identity, device } => {
                info!(device = %identity, node = %device.display(), "Found new device");
            }
            StationEvent::Flashed {
                job_id,
                identity,
                device,
                files,
                duration_secs,
            } => {
                info!(
                    job_id = %job_id,
                    device = %identity,
                    node = %device.display(),
                    files,
                    duration_secs,
                    "Device flashed and verified, safe to remove"
                );
            }
            StationEvent::FlashFailed {
                job_id,
                identity,
                device,
                reason,
            } => {
                warn!(
                    job_id = %job_id,
                    device = %identity,
                    node = %device.display(),
                    reason = %reason,
                    "Device flashing failed"
                );
            }
            StationEvent::DeviceRemoved { identity, device } => {
                info!(device = %identity, node = %device.display(), "Device removed");
            }
        }
        Ok(())
    }
}

pub fn default_notifier() -> Arc<dyn Notifier> {
    Arc::new(LogNotifier)
}
