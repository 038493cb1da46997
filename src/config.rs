use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::error::{FlashError, Result};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/flasher/config.toml";
const ENV_PREFIX: &str = "FLASHER_";

/// Process-wide station configuration. Immutable once validated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    /// Files or directories cloned onto every device.
    pub clone: Vec<PathBuf>,
    /// File extensions skipped while cloning and validating, in `.ext` form.
    pub exclude: Vec<String>,
    /// Volume label applied to the new filesystem.
    pub label: String,
    /// Directory under which per-device mount points are created.
    pub tmp_mount: PathBuf,
    /// Number of devices provisioned concurrently.
    pub concurrent: usize,
    /// Mount table consulted before unmounting.
    pub mount_table: PathBuf,
    pub verbose: bool,
    pub json_logs: bool,
    pub timing: Timing,
}

/// Delays and timeouts used by the monitor, pipeline and worker pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Timing {
    pub event_timeout_ms: u64,
    pub settle_delay_ms: u64,
    pub unmount_attempts: u32,
    pub unmount_delay_ms: u64,
    pub worker_poll_ms: u64,
    pub join_timeout_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            event_timeout_ms: 1500,
            settle_delay_ms: 5000,
            unmount_attempts: 5,
            unmount_delay_ms: 750,
            worker_poll_ms: 1000,
            join_timeout_ms: 10_000,
        }
    }
}

impl Timing {
    pub fn event_timeout(&self) -> Duration {
        Duration::from_millis(self.event_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn unmount_delay(&self) -> Duration {
        Duration::from_millis(self.unmount_delay_ms)
    }

    pub fn worker_poll(&self) -> Duration {
        Duration::from_millis(self.worker_poll_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            clone: Vec::new(),
            exclude: Vec::new(),
            label: "FlashStation".to_string(),
            tmp_mount: PathBuf::from("/tmp"),
            concurrent: 1,
            mount_table: PathBuf::from("/proc/self/mounts"),
            verbose: false,
            json_logs: false,
            timing: Timing::default(),
        }
    }
}

impl StationConfig {
    /// Layer defaults, the TOML file, `FLASHER_*` variables and CLI flags (in
    /// that order), then validate the result.
    pub fn new<T: Serialize>(config_file: Option<&Path>, cli_args: Option<&T>) -> Result<Self> {
        let file = config_file.unwrap_or(Path::new(DEFAULT_CONFIG_PATH));

        let mut figment = Figment::new()
            .merge(Serialized::defaults(StationConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(args) = cli_args {
            figment = figment.merge(Serialized::globals(args));
        }

        let config: StationConfig = figment
            .extract()
            .map_err(|e| FlashError::Config(e.to_string()))?;

        config.validated()
    }

    /// Check paths and limits, and normalize excluded extensions.
    pub fn validated(mut self) -> Result<Self> {
        if self.clone.is_empty() {
            return Err(FlashError::Config(
                "at least one clone path is required".to_string(),
            ));
        }

        for path in &self.clone {
            if !path.exists() {
                return Err(FlashError::Config(format!(
                    "clone path {} does not exist",
                    path.display()
                )));
            }
        }

        if !self.tmp_mount.is_dir() {
            return Err(FlashError::Config(format!(
                "temporary mount root {} is not a directory",
                self.tmp_mount.display()
            )));
        }

        if self.concurrent == 0 {
            return Err(FlashError::Config(
                "concurrent must be at least 1".to_string(),
            ));
        }

        if self.label.trim().is_empty() {
            return Err(FlashError::Config("label must not be empty".to_string()));
        }

        self.exclude = normalize_extensions(&self.exclude);
        Ok(self)
    }
}

/// Normalize extensions to a single leading dot, dropping empties and duplicates.
pub fn normalize_extensions(raw: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for ext in raw {
        let trimmed = ext.trim().trim_start_matches('.');
        if trimmed.is_empty() {
            continue;
        }
        let normalized = format!(".{trimmed}");
        if !out.contains(&normalized) {
            out.push(normalized);
        }
    }
    out
}

/// Whether the final component of `path` ends with one of the (normalized)
/// excluded extensions.
///
/// Mirrors rsync's `--exclude=*<ext>`: it applies to directories as well as
/// files, matches compound extensions like `.tar.gz`, and matches a bare
/// dotfile named after the extension.
pub fn is_excluded(path: &Path, exclude: &[String]) -> bool {
    let Some(name) = path.file_name() else {
        return false;
    };
    let name = name.to_string_lossy();
    exclude.iter().any(|ext| name.ends_with(ext.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use tempfile::tempdir;

    #[test]
    fn test_normalize_extensions() {
        let raw = vec![
            "tmp".to_string(),
            ".log".to_string(),
            "..bak".to_string(),
            " ".to_string(),
            ".tmp".to_string(),
        ];
        assert_eq!(normalize_extensions(&raw), vec![".tmp", ".log", ".bak"]);
    }

    #[test]
    fn test_is_excluded() {
        let exclude = vec![".tmp".to_string()];
        assert!(is_excluded(Path::new("/src/notes.tmp"), &exclude));
        assert!(!is_excluded(Path::new("/src/a.txt"), &exclude));
        assert!(!is_excluded(Path::new("/src/tmp"), &exclude));
    }

    #[test]
    fn test_is_excluded_matches_like_rsync_patterns() {
        let exclude = vec![".tmp".to_string(), ".tar.gz".to_string()];
        assert!(is_excluded(Path::new("/src/cache.tmp"), &exclude));
        assert!(is_excluded(Path::new("/src/.tmp"), &exclude));
        assert!(is_excluded(Path::new("/src/a.tar.gz"), &exclude));
        assert!(!is_excluded(Path::new("/src/a.gz"), &exclude));
        assert!(!is_excluded(Path::new("/src/cache.tmp/inner.bin"), &exclude));
        assert!(!is_excluded(Path::new("/"), &exclude));
    }

    #[test]
    fn test_validated_rejects_missing_clone_path() {
        let config = StationConfig {
            clone: vec![PathBuf::from("/nonexistent/clone/source")],
            ..Default::default()
        };
        let err = config.validated().unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_validated_rejects_empty_clone_list() {
        let err = StationConfig::default().validated().unwrap_err();
        assert!(matches!(err, FlashError::Config(_)));
    }

    #[test]
    fn test_validated_rejects_zero_concurrency() {
        let temp = tempdir().unwrap();
        let config = StationConfig {
            clone: vec![temp.path().to_path_buf()],
            tmp_mount: temp.path().to_path_buf(),
            concurrent: 0,
            ..Default::default()
        };
        assert!(config.validated().is_err());
    }

    #[test]
    fn test_layers_file_env_and_cli() {
        Jail::expect_with(|jail| {
            let source = jail.directory().join("payload");
            std::fs::create_dir_all(&source).unwrap();

            jail.create_file(
                "station.toml",
                &format!(
                    r#"
                    clone = ["{}"]
                    exclude = ["tmp"]
                    label = "FromFile"
                    tmp_mount = "{}"

                    [timing]
                    unmount_attempts = 2
                    "#,
                    source.display(),
                    jail.directory().display()
                ),
            )?;
            jail.set_env("FLASHER_CONCURRENT", "3");

            #[derive(Serialize)]
            struct Flags {
                label: String,
            }

            let config = StationConfig::new(
                Some(&jail.directory().join("station.toml")),
                Some(&Flags {
                    label: "FromCli".to_string(),
                }),
            )
            .expect("config should load");

            assert_eq!(config.label, "FromCli");
            assert_eq!(config.concurrent, 3);
            assert_eq!(config.exclude, vec![".tmp"]);
            assert_eq!(config.timing.unmount_attempts, 2);
            assert_eq!(config.timing.unmount_delay_ms, 750);
            Ok(())
        });
    }
}
