//! Per-device provisioning.
//!
//! `unmount -> wipe -> partition -> format -> reindex -> mount -> copy ->
//! verify -> cleanup`, strictly in order. The first failing command abandons
//! the rest of the run for that device only.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::context::AppContext;
use crate::core::executor::PrivilegedCommand;
use crate::core::models::{JobOutcome, PipelineJob, PipelineStage};
use crate::core::notifications::StationEvent;
use crate::core::pool::JobHandler;
use crate::core::transfer::clone_command;
use crate::core::validator::VerifyReport;
use crate::error::{FlashError, Result};

/// Answers fed to fdisk: new GPT label, one partition spanning the disk.
const FDISK_SCRIPT: [&str; 7] = [
    "g", // GPT partition table
    "n", // new partition
    "1", // partition number
    "",  // first sector: default
    "",  // last sector: default
    "",  // confirm signature removal, if asked
    "w", // write and exit
];

const WIPE_BLOCK_SIZE: &str = "4k";
const WIPE_BLOCK_COUNT: u32 = 1000;
const FS_BLOCK_SIZE: u32 = 4096;

/// Temporary mount points currently in use by jobs.
///
/// Anything still registered at shutdown is cleaned up by the worker pool.
#[derive(Debug, Clone, Default)]
pub struct MountRegistry {
    inner: Arc<Mutex<HashSet<PathBuf>>>,
}

impl MountRegistry {
    pub fn register(&self, path: &Path) {
        self.lock().insert(path.to_path_buf());
    }

    pub fn unregister(&self, path: &Path) {
        self.lock().remove(path);
    }

    pub fn drain(&self) -> Vec<PathBuf> {
        self.lock().drain().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<PathBuf>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Whether `partition` is a mount source in the given mount table.
pub fn is_mounted(mount_table: &Path, partition: &Path) -> Result<bool> {
    let table =
        std::fs::read_to_string(mount_table).map_err(|e| FlashError::io(mount_table, e))?;
    let partition = partition.to_string_lossy();

    Ok(table
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .any(|source| source == partition))
}

/// Runs the provisioning steps for one device.
#[derive(Clone)]
pub struct Pipeline {
    ctx: AppContext,
}

/// Outcome of the verify step, carried through cleanup.
struct Verdict {
    passed: bool,
    matched: usize,
    summary: String,
}

impl Pipeline {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    /// Mount point used for a job. Derived from the device identity so
    /// concurrent jobs never share one.
    pub fn mount_point(&self, job: &PipelineJob) -> PathBuf {
        self.ctx
            .config
            .tmp_mount
            .join(format!("flasher-{}", job.identity.slug()))
    }

    /// Provision the device and report the result exactly once.
    pub async fn run(&self, job: &PipelineJob) -> JobOutcome {
        let span = info_span!(
            "pipeline",
            job_id = %job.short_id(),
            device = %job.identity,
            node = %job.device.display()
        );

        async {
            let started = Instant::now();
            let mut stage = PipelineStage::Idle;

            match self.execute(job, &mut stage).await {
                Ok(verdict) if verdict.passed => {
                    info!(stage = %PipelineStage::Success, files = verdict.matched, "Done");
                    self.notify(StationEvent::Flashed {
                        job_id: job.id.clone(),
                        identity: job.identity,
                        device: job.device.clone(),
                        files: verdict.matched,
                        duration_secs: started.elapsed().as_secs(),
                    })
                    .await;
                    JobOutcome::Success
                }
                Ok(verdict) => {
                    warn!(stage = %PipelineStage::Failed, reason = %verdict.summary, "Verification failed");
                    self.notify(StationEvent::FlashFailed {
                        job_id: job.id.clone(),
                        identity: job.identity,
                        device: job.device.clone(),
                        reason: verdict.summary.clone(),
                    })
                    .await;
                    JobOutcome::VerifyFailed {
                        reason: verdict.summary,
                    }
                }
                Err(e) => {
                    error!(stage = %stage, error = %e, "Pipeline aborted");
                    self.notify(StationEvent::FlashFailed {
                        job_id: job.id.clone(),
                        identity: job.identity,
                        device: job.device.clone(),
                        reason: format!("{stage}: {e}"),
                    })
                    .await;
                    JobOutcome::Failed {
                        stage,
                        error: e.to_string(),
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, job: &PipelineJob, stage: &mut PipelineStage) -> Result<Verdict> {
        let config = &self.ctx.config;
        let device = job.device.to_string_lossy().into_owned();
        let partition = job.partition();
        let partition_str = partition.to_string_lossy().into_owned();

        *stage = PipelineStage::UnmountExisting;
        info!(stage = %stage, partition = %partition_str, "Looking for existing mount");
        self.unmount_with_retry(&partition).await;

        *stage = PipelineStage::Wipe;
        info!(stage = %stage, "Scrubbing partition table");
        self.exec(PrivilegedCommand::new("dd").args([
            "if=/dev/zero".to_string(),
            format!("of={device}"),
            format!("bs={WIPE_BLOCK_SIZE}"),
            format!("count={WIPE_BLOCK_COUNT}"),
        ]))
        .await?;
        self.sync().await?;

        *stage = PipelineStage::Partition;
        info!(stage = %stage, "Creating partition table");
        self.exec(
            PrivilegedCommand::new("fdisk")
                .arg(device.as_str())
                .stdin_lines(FDISK_SCRIPT),
        )
        .await?;
        self.sync().await?;
        self.exec(PrivilegedCommand::new("partprobe").arg(device.as_str()))
            .await?;

        *stage = PipelineStage::Format;
        info!(stage = %stage, label = %config.label, "Creating filesystem");
        // The fresh partition may get auto-mounted before mkfs runs
        self.unmount_with_retry(&partition).await;
        self.exec(PrivilegedCommand::new("mkfs").args([
            "-t".to_string(),
            "ext4".to_string(),
            "-F".to_string(),
            "-b".to_string(),
            FS_BLOCK_SIZE.to_string(),
            "-L".to_string(),
            config.label.clone(),
            partition_str.clone(),
        ]))
        .await?;

        *stage = PipelineStage::ValidateCacheReady;
        info!(stage = %stage, "Refreshing source hash index");
        self.ctx.validator.reindex().await?;

        *stage = PipelineStage::Mount;
        let mount_point = self.mount_point(job);
        let mount_str = mount_point.to_string_lossy().into_owned();
        info!(stage = %stage, mount_point = %mount_str, "Mounting");
        tokio::fs::create_dir_all(&mount_point)
            .await
            .map_err(|e| FlashError::io(&mount_point, e))?;
        self.ctx.mounts.register(&mount_point);
        self.exec(PrivilegedCommand::new("mount").args([partition_str.as_str(), mount_str.as_str()]))
            .await?;

        *stage = PipelineStage::Copy;
        info!(stage = %stage, sources = config.clone.len(), "Copying clone sources");
        for source in &config.clone {
            debug!(source = %source.display(), "Cloning");
            self.exec(clone_command(source, &mount_point, &config.exclude))
                .await?;
        }
        self.sync().await?;

        *stage = PipelineStage::Verify;
        info!(stage = %stage, "Verifying copied files");
        let verdict = match self.ctx.validator.verify(&mount_point).await {
            Ok(report) => Verdict {
                passed: report.passed(),
                matched: report.matched,
                summary: describe_report(&report),
            },
            Err(e) => Verdict {
                passed: false,
                matched: 0,
                summary: format!("verification could not complete: {e}"),
            },
        };

        *stage = PipelineStage::Cleanup;
        info!(stage = %stage, "Cleaning up");
        self.exec(PrivilegedCommand::new("umount").arg(partition_str.as_str()))
            .await?;
        self.exec(PrivilegedCommand::new("rm").args(["-rf", mount_str.as_str()]))
            .await?;
        self.ctx.mounts.unregister(&mount_point);
        self.exec(PrivilegedCommand::new("eject").arg(device.as_str()))
            .await?;

        Ok(verdict)
    }

    /// Unmount `partition` if it is mounted, retrying while the system
    /// settles. Never fails the pipeline.
    async fn unmount_with_retry(&self, partition: &Path) {
        let timing = &self.ctx.config.timing;

        for attempt in 1..=timing.unmount_attempts {
            match is_mounted(&self.ctx.config.mount_table, partition) {
                Ok(false) => return,
                Ok(true) => {}
                Err(e) => {
                    warn!(error = %e, "Cannot read mount table, skipping unmount");
                    return;
                }
            }

            let umount = PrivilegedCommand::new("umount").arg(partition.to_string_lossy());
            match self.ctx.runner.run(&umount).await {
                Ok(_) => {
                    debug!(attempt, "Unmounted existing partition");
                    return;
                }
                Err(e) => {
                    debug!(attempt, error = %e, "Unmount attempt failed");
                    tokio::time::sleep(timing.unmount_delay()).await;
                }
            }
        }

        warn!(
            partition = %partition.display(),
            attempts = timing.unmount_attempts,
            "Could not unmount partition, continuing anyway"
        );
    }

    async fn exec(&self, command: PrivilegedCommand) -> Result<()> {
        debug!(command = %command, "Running");
        self.ctx.runner.run(&command).await.map(|_| ())
    }

    async fn sync(&self) -> Result<()> {
        self.exec(PrivilegedCommand::new("sync")).await
    }

    async fn notify(&self, event: StationEvent) {
        if let Err(e) = self.ctx.notifier.notify(event).await {
            warn!(error = %e, "Failed to deliver notification");
        }
    }
}

#[async_trait]
impl JobHandler for Pipeline {
    async fn handle(&self, job: PipelineJob) {
        self.run(&job).await;
    }
}

/// Human-readable summary of a verify report, listing at most ten missing files.
fn describe_report(report: &VerifyReport) -> String {
    if report.passed() {
        return format!("{} file(s) verified", report.matched);
    }

    if let Some(path) = &report.unexpected {
        return format!(
            "destination file {} does not match any source",
            path.display()
        );
    }

    let mut msg = format!(
        "{} source file(s) missing from destination",
        report.missing.len()
    );
    for missing in report.missing.iter().take(10) {
        msg.push_str(&format!(
            "\n  - {} ({})",
            missing.source.display(),
            missing.hash
        ));
    }
    if report.missing.len() > 10 {
        msg.push_str(&format!("\n  ... and {} more", report.missing.len() - 10));
    }
    msg
}
