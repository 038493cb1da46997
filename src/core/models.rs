use std::fmt;
use std::path::PathBuf;

use uuid::Uuid;

use super::hardware::DeviceIdentity;

/// One accepted device, queued for provisioning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineJob {
    pub id: String,
    pub identity: DeviceIdentity,
    pub device: PathBuf,
}

impl PipelineJob {
    pub fn new(identity: DeviceIdentity, device: PathBuf) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            identity,
            device,
        }
    }

    /// First partition on the device (`/dev/sdb` -> `/dev/sdb1`).
    pub fn partition(&self) -> PathBuf {
        let mut node = self.device.clone().into_os_string();
        node.push("1");
        PathBuf::from(node)
    }

    pub fn short_id(&self) -> &str {
        &self.id[..8.min(self.id.len())]
    }
}

/// Pipeline states, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Idle,
    UnmountExisting,
    Wipe,
    Partition,
    Format,
    ValidateCacheReady,
    Mount,
    Copy,
    Verify,
    Cleanup,
    Success,
    Failed,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::UnmountExisting => "unmount_existing",
            Self::Wipe => "wipe",
            Self::Partition => "partition",
            Self::Format => "format",
            Self::ValidateCacheReady => "validate_cache_ready",
            Self::Mount => "mount",
            Self::Copy => "copy",
            Self::Verify => "verify",
            Self::Cleanup => "cleanup",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Every step ran and the device verified.
    Success,
    /// Every step ran but the device content did not verify.
    VerifyFailed { reason: String },
    /// A step failed; the rest of the pipeline was abandoned.
    Failed { stage: PipelineStage, error: String },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}
