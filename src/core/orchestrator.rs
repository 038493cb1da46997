use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::context::AppContext;
use crate::core::hardware::{EventSource, HardwareEvent, UsbEnumerator};
use crate::core::models::PipelineJob;
use crate::core::monitor::{DeviceMonitor, run_control_loop};
use crate::core::notifications::StationEvent;
use crate::core::pipeline::Pipeline;
use crate::core::pool::{PoolSettings, WorkerPool};

/// Wires the control loop to the worker pool and drives shutdown.
pub struct Orchestrator {
    ctx: AppContext,
}

impl Orchestrator {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    /// Run the station until `shutdown` resolves or the control loop fails.
    ///
    /// The control loop runs on its own thread and is the only owner of the
    /// tracked-devices table; this task only dispatches its signals.
    pub async fn start<S, E, F>(&self, monitor: DeviceMonitor<S, E>, shutdown: F) -> Result<()>
    where
        S: EventSource + 'static,
        E: UsbEnumerator + 'static,
        F: Future<Output = ()>,
    {
        let pipeline = Arc::new(Pipeline::new(self.ctx.clone()));
        let pool = WorkerPool::start(
            pipeline,
            PoolSettings::from_config(&self.ctx.config),
            self.ctx.mounts.clone(),
            self.ctx.runner.clone(),
        );

        let (tx, mut rx) = mpsc::channel(32);
        let token = CancellationToken::new();
        let control = std::thread::Builder::new()
            .name("control-loop".to_string())
            .spawn({
                let token = token.clone();
                move || run_control_loop(monitor, tx, token)
            })
            .context("Failed to spawn control loop")?;

        info!(workers = pool.worker_count(), "Station ready");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => self.handle_device_event(&pool, event).await,
                    None => break,
                },
                _ = &mut shutdown => {
                    info!("Shutting down");
                    break;
                }
            }
        }

        token.cancel();
        drop(rx);

        let control_result = tokio::task::spawn_blocking(move || control.join())
            .await
            .context("Failed to join control loop")?;

        pool.stop().await;

        match control_result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!(error = %e, "Device monitoring failed");
                Err(e.into())
            }
            Err(_) => Err(anyhow!("control loop panicked")),
        }
    }

    async fn handle_device_event(&self, pool: &WorkerPool, event: HardwareEvent) {
        match event {
            HardwareEvent::DeviceAdded { identity, path } => {
                self.notify(StationEvent::DeviceAdded {
                    identity,
                    device: path.clone(),
                })
                .await;

                if let Err(e) = pool.submit(PipelineJob::new(identity, path)) {
                    // The device stays tracked; it is retried after a replug
                    error!(device = %identity, error = %e, "Could not queue device");
                }
            }
            HardwareEvent::DeviceRemoved { identity, path } => {
                self.notify(StationEvent::DeviceRemoved {
                    identity,
                    device: path,
                })
                .await;
            }
        }
    }

    async fn notify(&self, event: StationEvent) {
        if let Err(e) = self.ctx.notifier.notify(event).await {
            error!(error = %e, "Failed to deliver notification");
        }
    }
}
