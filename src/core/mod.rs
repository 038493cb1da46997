pub mod executor;
pub mod hardware;
pub mod models;
pub mod monitor;
pub mod notifications;
pub mod orchestrator;
pub mod pipeline;
pub mod pool;
pub mod transfer;
pub mod validator;

pub use executor::{CommandOutput, CommandRunner, PrivilegedCommand, SystemRunner};
pub use hardware::{DeviceIdentity, EventSource, HardwareEvent, UsbEnumerator};
pub use models::{JobOutcome, PipelineJob, PipelineStage};
pub use monitor::{DeviceMonitor, DeviceTracker, EventWindow};
pub use notifications::{LogNotifier, Notifier, StationEvent};
pub use orchestrator::Orchestrator;
pub use pipeline::{MountRegistry, Pipeline};
pub use pool::{JobHandler, PoolSettings, WorkerPool};
pub use validator::{ChecksumValidator, HashIndex, ReindexOutcome, VerifyReport};
