use std::sync::Arc;

use crate::config::StationConfig;
use crate::core::executor::CommandRunner;
use crate::core::notifications::Notifier;
use crate::core::pipeline::MountRegistry;
use crate::core::validator::ChecksumValidator;

/// Handles shared by the control loop and every worker.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<StationConfig>,
    pub runner: Arc<dyn CommandRunner>,
    pub validator: ChecksumValidator,
    pub notifier: Arc<dyn Notifier>,
    pub mounts: MountRegistry,
}

impl AppContext {
    pub fn new(
        config: StationConfig,
        runner: Arc<dyn CommandRunner>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let validator = ChecksumValidator::new(config.clone.clone(), config.exclude.clone());
        Self {
            config: Arc::new(config),
            runner,
            validator,
            notifier,
            mounts: MountRegistry::default(),
        }
    }
}
