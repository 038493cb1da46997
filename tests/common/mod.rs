//! Fakes shared by the integration tests.
//!
//! `FakeRunner` records every privileged command instead of touching block
//! devices. It emulates just enough of `rsync` and `rm` for the pipeline to
//! produce a real tree that the validator can check.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use flasher::FlashError;
use flasher::config::{StationConfig, Timing};
use flasher::core::{CommandOutput, CommandRunner, Notifier, PrivilegedCommand, StationEvent};

#[derive(Default)]
pub struct FakeRunner {
    commands: Mutex<Vec<PrivilegedCommand>>,
    fail_program: Option<String>,
    /// Bytes appended to the first copied file, to simulate a bad write.
    corrupt_with: Option<Vec<u8>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every invocation of `program` exits non-zero.
    pub fn failing(program: &str) -> Self {
        Self {
            fail_program: Some(program.to_string()),
            ..Self::default()
        }
    }

    pub fn corrupting(bytes: &[u8]) -> Self {
        Self {
            corrupt_with: Some(bytes.to_vec()),
            ..Self::default()
        }
    }

    pub fn commands(&self) -> Vec<PrivilegedCommand> {
        self.commands.lock().unwrap().clone()
    }

    pub fn programs(&self) -> Vec<String> {
        self.commands().into_iter().map(|c| c.program).collect()
    }

    pub fn lines(&self) -> Vec<String> {
        self.commands().iter().map(ToString::to_string).collect()
    }

    fn rsync(&self, command: &PrivilegedCommand) -> std::io::Result<()> {
        let mut args = command.args.iter().rev();
        let destination = PathBuf::from(args.next().unwrap());
        let source = PathBuf::from(args.next().unwrap());
        let exclude: Vec<String> = command
            .args
            .iter()
            .filter_map(|a| a.strip_prefix("--exclude=*"))
            .map(str::to_string)
            .collect();

        let target = destination.join(source.file_name().unwrap());
        copy_tree(&source, &target, &exclude)?;

        if let Some(bytes) = &self.corrupt_with {
            let first = first_file(&target).unwrap();
            let mut content = std::fs::read(&first)?;
            content.extend_from_slice(bytes);
            std::fs::write(&first, content)?;
        }
        Ok(())
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, command: &PrivilegedCommand) -> flasher::Result<CommandOutput> {
        self.commands.lock().unwrap().push(command.clone());

        if self.fail_program.as_deref() == Some(command.program.as_str()) {
            return Err(FlashError::CommandFailed {
                command: command.to_string(),
                status: "exit status: 1".to_string(),
                stderr: "simulated failure".to_string(),
            });
        }

        match command.program.as_str() {
            "rsync" => self
                .rsync(command)
                .map_err(|e| FlashError::io(command.args.last().unwrap(), e))?,
            "rm" => {
                let path = command.args.last().unwrap();
                if Path::new(path).exists() {
                    std::fs::remove_dir_all(path).map_err(|e| FlashError::io(path, e))?;
                }
            }
            _ => {}
        }
        Ok(CommandOutput::default())
    }
}

/// Copy like `rsync --recursive --exclude=*<ext>`: each pattern is matched
/// against the last path component, directories included.
fn copy_tree(source: &Path, target: &Path, exclude: &[String]) -> std::io::Result<()> {
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if exclude.iter().any(|ext| name.ends_with(ext.as_str())) {
        return Ok(());
    }

    if source.is_dir() {
        std::fs::create_dir_all(target)?;
        for entry in std::fs::read_dir(source)? {
            let entry = entry?;
            copy_tree(&entry.path(), &target.join(entry.file_name()), exclude)?;
        }
        return Ok(());
    }

    std::fs::copy(source, target).map(|_| ())
}

fn first_file(root: &Path) -> Option<PathBuf> {
    if root.is_file() {
        return Some(root.to_path_buf());
    }
    let mut entries: Vec<_> = std::fs::read_dir(root).ok()?.flatten().collect();
    entries.sort_by_key(|e| e.file_name());
    entries.into_iter().find_map(|e| first_file(&e.path()))
}

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<StationEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<StationEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: StationEvent) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

/// Test station layout rooted in a temporary directory.
pub struct Station {
    pub root: tempfile::TempDir,
    pub config: StationConfig,
}

impl Station {
    /// A payload directory with two files plus excluded entries, an empty
    /// mount table and fast timings.
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let payload = root.path().join("payload");
        write_file(&payload.join("a.txt"), b"alpha");
        write_file(&payload.join("docs/b.txt"), b"bravo");
        write_file(&payload.join("notes.tmp"), b"scratch");
        write_file(&payload.join("cache.tmp/inner.bin"), b"cached");
        write_file(&payload.join(".tmp"), b"dot");
        write_file(&payload.join("bundle.tar.gz"), b"archive");

        let mounts = root.path().join("mnt");
        std::fs::create_dir_all(&mounts).unwrap();
        let mount_table = root.path().join("mounts");
        std::fs::write(&mount_table, "").unwrap();

        let config = StationConfig {
            clone: vec![payload],
            exclude: vec![".tmp".to_string(), ".tar.gz".to_string()],
            label: "TESTLABEL".to_string(),
            tmp_mount: mounts,
            concurrent: 2,
            mount_table,
            verbose: false,
            json_logs: false,
            timing: fast_timing(),
        };

        Self { root, config }
    }

    pub fn set_mount_table(&self, content: &str) {
        std::fs::write(&self.config.mount_table, content).unwrap();
    }
}

pub fn fast_timing() -> Timing {
    Timing {
        event_timeout_ms: 50,
        settle_delay_ms: 10,
        unmount_attempts: 3,
        unmount_delay_ms: 5,
        worker_poll_ms: 20,
        join_timeout_ms: 5_000,
    }
}

pub fn write_file(path: &Path, content: &[u8]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

/// Poll `check` until it holds or `limit` elapses.
pub async fn wait_for(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
