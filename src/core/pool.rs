//! Fixed-size worker pool running one pipeline job per worker.
//!
//! Workers share one bounded queue. Cancellation is cooperative: a worker
//! only looks at the cancellation token between jobs, so a running job always
//! finishes its current step (and the rest of its pipeline) before the worker
//! exits.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StationConfig;
use crate::core::executor::{CommandRunner, PrivilegedCommand};
use crate::core::models::PipelineJob;
use crate::core::pipeline::MountRegistry;
use crate::error::{FlashError, Result};

pub const QUEUE_CAPACITY: usize = 64;

/// Work executed for each dequeued job. Failures stay inside the handler.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: PipelineJob);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub workers: usize,
    pub poll_interval: Duration,
    pub join_timeout: Duration,
    pub queue_capacity: usize,
}

impl PoolSettings {
    pub fn from_config(config: &StationConfig) -> Self {
        Self {
            workers: config.concurrent,
            poll_interval: config.timing.worker_poll(),
            join_timeout: config.timing.join_timeout(),
            queue_capacity: QUEUE_CAPACITY,
        }
    }
}

type SharedReceiver = Arc<Mutex<mpsc::Receiver<PipelineJob>>>;

pub struct WorkerPool {
    tx: mpsc::Sender<PipelineJob>,
    token: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    settings: PoolSettings,
    mounts: MountRegistry,
    runner: Arc<dyn CommandRunner>,
}

impl WorkerPool {
    /// Spawn `settings.workers` workers on the current runtime.
    pub fn start<H: JobHandler>(
        handler: Arc<H>,
        settings: PoolSettings,
        mounts: MountRegistry,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        let rx: SharedReceiver = Arc::new(Mutex::new(rx));
        let token = CancellationToken::new();

        let workers = (0..settings.workers.max(1))
            .map(|id| {
                info!(worker = id, "Starting worker");
                tokio::spawn(worker_loop(
                    id,
                    rx.clone(),
                    handler.clone(),
                    token.clone(),
                    settings.poll_interval,
                ))
            })
            .collect();

        Self {
            tx,
            token,
            workers,
            settings,
            mounts,
            runner,
        }
    }

    /// Queue a job without waiting.
    pub fn submit(&self, job: PipelineJob) -> Result<()> {
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(job) => FlashError::QueueFull(job.identity.to_string()),
            mpsc::error::TrySendError::Closed(_) => FlashError::QueueClosed,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stop accepting work, wait for running jobs, then clean up leftovers.
    ///
    /// Jobs still queued are dropped without being started. Workers that do
    /// not exit before the join timeout are left running detached.
    pub async fn stop(self) {
        info!("Stopping workers");
        self.token.cancel();
        drop(self.tx);

        let deadline = Instant::now() + self.settings.join_timeout;
        for (id, handle) in self.workers.into_iter().enumerate() {
            match timeout_at(deadline, handle).await {
                Ok(Ok(())) => debug!(worker = id, "Worker joined"),
                Ok(Err(e)) => warn!(worker = id, error = %e, "Worker task failed"),
                Err(_) => warn!(worker = id, "Worker did not stop before the join timeout"),
            }
        }

        cleanup_mounts(&self.mounts, self.runner.as_ref()).await;
    }
}

async fn worker_loop<H: JobHandler>(
    id: usize,
    rx: SharedReceiver,
    handler: Arc<H>,
    token: CancellationToken,
    poll_interval: Duration,
) {
    while !token.is_cancelled() {
        let next = timeout(poll_interval, async { rx.lock().await.recv().await }).await;

        let job = match next {
            Err(_) => continue,
            Ok(None) => break,
            Ok(Some(job)) => job,
        };

        info!(
            worker = id,
            job_id = %job.short_id(),
            device = %job.identity,
            node = %job.device.display(),
            "Starting job"
        );
        handler.handle(job).await;
    }

    info!(worker = id, "Worker stopped");
}

/// Unmount and remove every mount point a job left behind.
///
/// A worker that overran the join timeout may still be copying into its
/// mount. When unmounting fails only `rmdir` is attempted, which refuses
/// mounted or non-empty directories.
async fn cleanup_mounts(mounts: &MountRegistry, runner: &dyn CommandRunner) {
    for dir in mounts.drain() {
        let target = dir.to_string_lossy().into_owned();
        warn!(mount_point = %target, "Removing leftover mount point");

        let removal = match runner
            .run(&PrivilegedCommand::new("umount").arg(target.as_str()))
            .await
        {
            Ok(_) => PrivilegedCommand::new("rm").args(["-rf", target.as_str()]),
            Err(e) => {
                warn!(mount_point = %target, error = %e, "Unmount during shutdown failed");
                PrivilegedCommand::new("rmdir").arg(target.as_str())
            }
        };

        if let Err(e) = runner.run(&removal).await {
            warn!(mount_point = %target, error = %e, "Could not remove mount point");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::executor::CommandOutput;
    use crate::core::hardware::DeviceIdentity;
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct SlowHandler {
        started: AtomicUsize,
        finished: AtomicUsize,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for SlowHandler {
        async fn handle(&self, _job: PipelineJob) {
            self.started.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(300)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RecordingRunner {
        commands: StdMutex<Vec<String>>,
        busy: bool,
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, command: &PrivilegedCommand) -> Result<CommandOutput> {
            self.commands.lock().unwrap().push(command.to_string());
            if self.busy && command.program == "umount" {
                return Err(FlashError::CommandFailed {
                    command: command.to_string(),
                    status: "exit status: 32".to_string(),
                    stderr: "target is busy".to_string(),
                });
            }
            Ok(CommandOutput::default())
        }
    }

    fn settings(workers: usize) -> PoolSettings {
        PoolSettings {
            workers,
            poll_interval: Duration::from_millis(20),
            join_timeout: Duration::from_secs(5),
            queue_capacity: 16,
        }
    }

    fn job(address: u8) -> PipelineJob {
        PipelineJob::new(
            DeviceIdentity::new(0x0781, 0x5567, 1, address),
            PathBuf::from(format!("/dev/sd{}", (b'a' + address) as char)),
        )
    }

    #[tokio::test]
    async fn test_stop_finishes_running_jobs_and_abandons_queued() {
        let handler = Arc::new(SlowHandler::default());
        let runner = Arc::new(RecordingRunner::default());
        let pool = WorkerPool::start(
            handler.clone(),
            settings(3),
            MountRegistry::default(),
            runner,
        );

        for address in 1..=5 {
            pool.submit(job(address)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        pool.stop().await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(handler.started.load(Ordering::SeqCst), 3);
        assert_eq!(handler.finished.load(Ordering::SeqCst), 3);
        assert!(handler.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_all_jobs_run_when_not_stopped() {
        let handler = Arc::new(SlowHandler::default());
        let pool = WorkerPool::start(
            handler.clone(),
            settings(2),
            MountRegistry::default(),
            Arc::new(RecordingRunner::default()),
        );

        for address in 1..=4 {
            pool.submit(job(address)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(900)).await;

        assert_eq!(handler.finished.load(Ordering::SeqCst), 4);
        assert!(handler.peak.load(Ordering::SeqCst) <= 2);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_submit_reports_full_queue() {
        let handler = Arc::new(SlowHandler::default());
        let pool = WorkerPool::start(
            handler,
            PoolSettings {
                queue_capacity: 1,
                ..settings(1)
            },
            MountRegistry::default(),
            Arc::new(RecordingRunner::default()),
        );

        // Worker takes the first job; the second fills the queue
        pool.submit(job(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.submit(job(2)).unwrap();

        let err = pool.submit(job(3)).unwrap_err();
        assert!(matches!(err, FlashError::QueueFull(_)));
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_stop_cleans_up_leftover_mounts() {
        let runner = Arc::new(RecordingRunner::default());
        let mounts = MountRegistry::default();
        mounts.register(std::path::Path::new("/tmp/flasher-0781_5567_01_02"));

        let pool = WorkerPool::start(
            Arc::new(SlowHandler::default()),
            settings(1),
            mounts.clone(),
            runner.clone(),
        );
        pool.stop().await;

        assert!(mounts.is_empty());
        let commands = runner.commands.lock().unwrap().clone();
        assert_eq!(
            commands,
            vec![
                "umount /tmp/flasher-0781_5567_01_02".to_string(),
                "rm -rf /tmp/flasher-0781_5567_01_02".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_busy_mount_is_never_removed_recursively() {
        let runner = Arc::new(RecordingRunner {
            busy: true,
            ..Default::default()
        });
        let mounts = MountRegistry::default();
        mounts.register(std::path::Path::new("/tmp/flasher-0781_5567_01_03"));

        let pool = WorkerPool::start(
            Arc::new(SlowHandler::default()),
            settings(1),
            mounts.clone(),
            runner.clone(),
        );
        pool.stop().await;

        let commands = runner.commands.lock().unwrap().clone();
        assert_eq!(
            commands,
            vec![
                "umount /tmp/flasher-0781_5567_01_03".to_string(),
                "rmdir /tmp/flasher-0781_5567_01_03".to_string(),
            ]
        );
    }
}
